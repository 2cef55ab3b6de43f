//! Attendance resolution: roster vs. match results → present / absent.

use crate::matcher::MatchResult;
use crate::store::{ReferenceStore, StoreError, Student};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresentEntry {
    pub name: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceReport {
    pub group: String,
    pub timestamp: DateTime<Utc>,
    /// Roster order.
    pub present: Vec<PresentEntry>,
    /// Roster order.
    pub absent: Vec<String>,
}

impl AttendanceReport {
    pub fn total(&self) -> usize {
        self.present.len() + self.absent.len()
    }
}

/// Name key used to compare roster names with matched names:
/// lower-case, trimmed, spaces and hyphens → `_`.
pub fn normalize_name(name: &str) -> String {
    name.to_lowercase().trim().replace([' ', '-'], "_")
}

/// Partition `roster` by whether each entry's normalized name appears in `matches`.
pub fn resolve(group: &str, roster: &[Student], matches: &[MatchResult]) -> AttendanceReport {
    resolve_at(group, roster, matches, Utc::now())
}

/// [`resolve`] with an explicit report timestamp.
pub fn resolve_at(
    group: &str,
    roster: &[Student],
    matches: &[MatchResult],
    timestamp: DateTime<Utc>,
) -> AttendanceReport {
    // First match per normalized name wins.
    let mut confidence_by_name: HashMap<String, f32> = HashMap::new();
    for m in matches {
        confidence_by_name
            .entry(normalize_name(&m.student_name))
            .or_insert(m.confidence);
    }

    let mut present = Vec::new();
    let mut absent = Vec::new();
    for student in roster {
        match confidence_by_name.get(&normalize_name(&student.name)) {
            Some(&confidence) => present.push(PresentEntry {
                name: student.name.clone(),
                confidence,
            }),
            None => absent.push(student.name.clone()),
        }
    }

    AttendanceReport {
        group: group.to_string(),
        timestamp,
        present,
        absent,
    }
}

/// Resolve against the roster currently in `store`.
pub fn resolve_group(
    store: &ReferenceStore,
    group: &str,
    matches: &[MatchResult],
) -> Result<AttendanceReport, StoreError> {
    let roster = store.list_students(group)?;
    let report = resolve(group, &roster, matches);
    tracing::info!(
        group,
        present = report.present.len(),
        absent = report.absent.len(),
        "attendance resolved"
    );
    Ok(report)
}
