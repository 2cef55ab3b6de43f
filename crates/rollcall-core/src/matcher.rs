//! Match engine: every buffered face against every student's reference photo.
//!
//! A buffer may hold several people, so no face is assumed to belong to one
//! student. Each student is scored by the smallest verified distance over all
//! captured images.

use crate::buffer::{BufferError, CaptureBuffer};
use crate::comparator::Comparator;
use crate::store::{ReferenceStore, StoreError, Student};
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("reference store: {0}")]
    Store(#[from] StoreError),
    #[error("capture buffer: {0}")]
    Buffer(#[from] BufferError),
}

/// A student found in the capture buffer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub student_name: String,
    /// `(1 - best_distance) * 100`, one decimal, within [0, 100].
    pub confidence: f32,
}

/// Results of one match run plus pair accounting.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MatchOutcome {
    pub results: Vec<MatchResult>,
    /// Pairs the comparator answered (verified or not).
    pub compared_pairs: usize,
    /// Pairs dropped because the comparator failed.
    pub skipped_pairs: usize,
}

impl MatchOutcome {
    /// Every attempted comparison failed, so an empty result means nothing.
    pub fn all_pairs_failed(&self) -> bool {
        self.compared_pairs == 0 && self.skipped_pairs > 0
    }
}

/// Confidence percentage for a distance, rounded to one decimal and clamped to [0, 100].
pub fn confidence_from_distance(distance: f32) -> f32 {
    let pct = ((1.0 - distance) * 100.0).clamp(0.0, 100.0);
    (pct * 10.0).round() / 10.0
}

pub struct MatchEngine<C: Comparator> {
    comparator: C,
    threshold: f32,
}

impl<C: Comparator> MatchEngine<C> {
    /// `threshold`: a student matches when their best verified distance is below it.
    pub fn new(comparator: C, threshold: f32) -> Self {
        Self {
            comparator,
            threshold,
        }
    }

    /// Match the current buffer against the roster of `group`.
    pub fn match_group(
        &mut self,
        group: &str,
        store: &ReferenceStore,
        buffer: &CaptureBuffer,
    ) -> Result<MatchOutcome, MatchError> {
        let roster = store.list_students(group)?;
        if roster.is_empty() {
            tracing::info!(group, "no students in group");
            return Ok(MatchOutcome::default());
        }

        let captured = buffer.images()?;
        if captured.is_empty() {
            tracing::info!(group, "no captured faces");
            return Ok(MatchOutcome::default());
        }

        tracing::info!(group, students = roster.len(), faces = captured.len(), "matching");
        Ok(self.match_roster(&roster, &captured))
    }

    /// Match an explicit roster against explicit captured images.
    ///
    /// Only the first student of any given name is evaluated.
    pub fn match_roster(&mut self, roster: &[Student], captured: &[PathBuf]) -> MatchOutcome {
        let mut outcome = MatchOutcome::default();
        if roster.is_empty() || captured.is_empty() {
            return outcome;
        }

        self.comparator.reset();
        let mut seen: HashSet<&str> = HashSet::new();

        for student in roster {
            if !seen.insert(student.name.as_str()) {
                tracing::debug!(name = %student.name, "duplicate name skipped");
                continue;
            }

            let mut best: Option<f32> = None;
            for face in captured {
                match self.comparator.verify(&student.photo_path, face) {
                    Ok(v) => {
                        outcome.compared_pairs += 1;
                        if v.verified && best.map_or(true, |b| v.distance < b) {
                            best = Some(v.distance);
                        }
                    }
                    Err(e) => {
                        outcome.skipped_pairs += 1;
                        tracing::warn!(
                            student = %student.name,
                            face = %face.display(),
                            error = %e,
                            "comparison failed, pair skipped"
                        );
                    }
                }
            }

            if let Some(distance) = best.filter(|d| *d < self.threshold) {
                let confidence = confidence_from_distance(distance);
                tracing::info!(name = %student.name, distance, confidence, "student matched");
                outcome.results.push(MatchResult {
                    student_name: student.name.clone(),
                    confidence,
                });
            }
        }

        if outcome.all_pairs_failed() {
            tracing::warn!(skipped = outcome.skipped_pairs, "every comparison failed");
        }
        outcome
    }
}
