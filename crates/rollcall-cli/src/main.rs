use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::{
    CaptureBuffer, EmbeddingComparator, FaceDetector, FaceEmbedder, FaceRecognizer, MatchEngine,
    ReferenceStore,
};
use rollcall_hw::{Camera, V4lBackend};
use serde::Serialize;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

mod capture;
mod config;
mod session;

use config::Config;
use session::{Attendance, PreviewFrame, Session, SessionOptions, SessionState};

type FaceSession = Session<EmbeddingComparator<FaceEmbedder>>;

#[derive(Parser)]
#[command(name = "rollcall", about = "Classroom attendance by face matching")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a student with a reference photo
    Register {
        #[arg(short, long)]
        group: String,
        #[arg(short, long)]
        name: String,
        /// Reference photo (jpg, png, bmp or tiff)
        #[arg(short, long)]
        photo: PathBuf,
    },
    /// Remove a student and their reference photo
    Remove {
        #[arg(short, long)]
        group: String,
        #[arg(short, long)]
        name: String,
    },
    /// List students, per group
    List {
        #[arg(short, long)]
        group: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// List V4L2 capture devices
    Devices,
    /// Capture faces into the buffer for a fixed time
    Capture {
        /// Seconds; defaults to the configured capture duration
        #[arg(short, long)]
        duration: Option<f32>,
    },
    /// Match the buffered faces against a group
    Match {
        #[arg(short, long)]
        group: String,
        #[arg(long)]
        json: bool,
    },
    /// Mark attendance for a group from the buffered faces
    Attend {
        #[arg(short, long)]
        group: String,
        /// Run a bounded capture first
        #[arg(long)]
        capture: bool,
        #[arg(long)]
        json: bool,
    },
    /// Interactive capture: `r` toggles recording, `m` marks attendance, `q` quits
    Live {
        #[arg(short, long)]
        group: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load().context("failed to load configuration")?;
    tracing::debug!(?config, "configuration loaded");

    match cli.command {
        Commands::Register { group, name, photo } => {
            let store = open_store(&config)?;
            let bytes = std::fs::read(&photo)
                .with_context(|| format!("failed to read {}", photo.display()))?;
            let student = store.register(&name, &group, &bytes)?;
            println!("Registered {} in {} ({})", student.name, student.group, student.photo_path.display());
        }
        Commands::Remove { group, name } => {
            let store = open_store(&config)?;
            let Some(student) = store.find(&group, &name)? else {
                bail!("no student named {name:?} in {group}");
            };
            store.remove(&student)?;
            println!("Removed {} from {}", student.name, group);
        }
        Commands::List { group, json } => {
            let store = open_store(&config)?;
            let groups = match group {
                Some(g) => vec![g],
                None => store.groups().to_vec(),
            };
            let mut rosters = Vec::new();
            for g in groups {
                let students = store.list_students(&g)?;
                let divergence = store.divergence(&g)?;
                for record in &divergence.records_without_photo {
                    eprintln!("warning: {} is registered in {} but has no photo", record.name, g);
                }
                rosters.push(Roster { group: g, students });
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&rosters)?);
            } else {
                for roster in &rosters {
                    println!("{} ({} students)", roster.group, roster.students.len());
                    for s in &roster.students {
                        match s.registered_at {
                            Some(at) => println!("  {:<30} registered {}", s.name, at.format("%Y-%m-%d %H:%M")),
                            None => println!("  {:<30} (no registry record)", s.name),
                        }
                    }
                }
            }
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No capture devices found");
            }
            for d in devices {
                println!("{:>2}  {}  {} ({}, {})", d.index, d.path, d.name, d.driver, d.bus);
            }
        }
        Commands::Capture { duration } => {
            let duration = match duration {
                Some(secs) => capture_duration_arg(secs)?,
                None => config.capture_duration(),
            };
            let mut session = open_session(&config)?;
            println!("Capturing for {:.1}s...", duration.as_secs_f32());
            let summary = session.capture_for(duration)?;
            if let Some(error) = &summary.error {
                eprintln!("warning: capture ended early: {error}");
            }
            println!(
                "Saved {} faces from {} frames ({} too dark)",
                summary.saved.len(),
                summary.frames,
                summary.dark_skipped
            );
            session.close()?;
            if !summary.success() {
                bail!("no faces captured");
            }
        }
        Commands::Match { group, json } => {
            let mut session = open_session(&config)?;
            let outcome = session.match_group(&group)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                for m in &outcome.results {
                    println!("{:<30} {:>5.1}%", m.student_name, m.confidence);
                }
                println!(
                    "{} matched ({} comparisons, {} failed)",
                    outcome.results.len(),
                    outcome.compared_pairs,
                    outcome.skipped_pairs
                );
            }
            session.close()?;
        }
        Commands::Attend { group, capture, json } => {
            let mut session = open_session(&config)?;
            if capture {
                let summary = session.capture_for(config.capture_duration())?;
                if let Some(error) = &summary.error {
                    eprintln!("warning: capture ended early: {error}");
                }
                if !summary.success() {
                    eprintln!("warning: no faces captured");
                }
            }
            let attendance = session.attend(&group)?;
            print_attendance(&attendance, json)?;
            session.close()?;
        }
        Commands::Live { group } => live(&config, &group).await?,
    }

    Ok(())
}

fn capture_duration_arg(secs: f32) -> Result<Duration> {
    if secs <= 0.0 {
        bail!("invalid duration: {secs}");
    }
    Ok(config::seconds("--duration", secs)?)
}

fn open_store(config: &Config) -> Result<ReferenceStore> {
    let store = ReferenceStore::open(&config.photos_dir(), &config.registry_path(), config.groups.clone())
        .context("failed to open reference store")?;
    Ok(store)
}

/// Load both models, open the store and buffer, and assemble a session.
fn open_session(config: &Config) -> Result<FaceSession> {
    let store = open_store(config)?;
    let scrfd = config.scrfd_model_path();
    let arcface = config.arcface_model_path();

    let detector = FaceDetector::load(&scrfd, config.detector_params())?;
    let reference_detector = FaceDetector::load(&scrfd, config.detector_params())?;
    tracing::info!(path = %scrfd, params = ?detector.params(), "SCRFD detector loaded");

    let recognizer = FaceRecognizer::load(&arcface)?;
    tracing::info!(path = %arcface, version = recognizer.model_version(), "ArcFace recognizer loaded");

    let comparator = EmbeddingComparator::with_threshold(
        FaceEmbedder::new(reference_detector, recognizer),
        config.distance_metric,
        config.verify_threshold(),
    );
    tracing::info!(
        metric = %comparator.metric(),
        verify_threshold = config.verify_threshold(),
        match_threshold = config.match_threshold,
        "comparator ready"
    );
    let engine = MatchEngine::new(comparator, config.match_threshold);
    let buffer = CaptureBuffer::open(&config.temp_faces_dir())?;

    Ok(Session::open(
        Arc::new(V4lBackend),
        Box::new(detector),
        buffer,
        store,
        engine,
        SessionOptions {
            camera_index: config.camera_index,
            capture: config.capture_settings(),
        },
    ))
}

#[derive(Serialize)]
struct Roster {
    group: String,
    students: Vec<rollcall_core::Student>,
}

#[derive(Serialize)]
struct AttendanceJson<'a> {
    #[serde(flatten)]
    report: &'a rollcall_core::AttendanceReport,
    compared_pairs: usize,
    skipped_pairs: usize,
}

fn print_attendance(attendance: &Attendance, json: bool) -> Result<()> {
    if json {
        let out = AttendanceJson {
            report: &attendance.report,
            compared_pairs: attendance.outcome.compared_pairs,
            skipped_pairs: attendance.outcome.skipped_pairs,
        };
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        print!("{}", render_attendance(attendance));
    }
    Ok(())
}

fn render_attendance(attendance: &Attendance) -> String {
    let report = &attendance.report;
    let total = report.total();
    let mut out = String::new();
    let _ = writeln!(out, "Attendance for {} at {}", report.group, report.timestamp.format("%Y-%m-%d %H:%M:%S UTC"));
    let _ = writeln!(out, "Present ({}/{total}):", report.present.len());
    for p in &report.present {
        let _ = writeln!(out, "  {:<30} {:>5.1}%", p.name, p.confidence);
    }
    let _ = writeln!(out, "Absent ({}/{total}):", report.absent.len());
    for name in &report.absent {
        let _ = writeln!(out, "  {name}");
    }
    if attendance.outcome.all_pairs_failed() {
        let _ = writeln!(out, "warning: every comparison failed; the absent list is not reliable");
    } else if attendance.outcome.skipped_pairs > 0 {
        let _ = writeln!(out, "warning: {} comparisons failed", attendance.outcome.skipped_pairs);
    }
    out
}

enum LiveEvent {
    Line(Option<String>),
    Preview(Option<PreviewFrame>),
    Interrupt,
}

async fn next_preview(preview: &mut Option<mpsc::Receiver<PreviewFrame>>) -> Option<PreviewFrame> {
    match preview {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn live(config: &Config, group: &str) -> Result<()> {
    if !config.groups.iter().any(|g| g == group) {
        bail!("unknown group: {group}");
    }
    let mut session = open_session(config)?;
    let mut preview = Some(session.start_capture(false)?);
    let mut recording = false;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let mut frames = 0u64;
    let mut faces = 0usize;
    let mut last_status = Instant::now();

    println!("Camera {} open. r = toggle recording, m = mark attendance, q = quit", config.camera_index);

    loop {
        let event = tokio::select! {
            line = lines.next_line() => LiveEvent::Line(line?),
            frame = next_preview(&mut preview) => LiveEvent::Preview(frame),
            _ = tokio::signal::ctrl_c() => LiveEvent::Interrupt,
        };

        match event {
            LiveEvent::Line(None) | LiveEvent::Interrupt => break,
            LiveEvent::Line(Some(line)) => match line.trim() {
                "r" => {
                    if session.state() != SessionState::Capturing {
                        preview = Some(session.start_capture(true)?);
                        recording = true;
                    } else {
                        recording = !recording;
                        session.set_recording(recording)?;
                    }
                    println!("Recording {}", if recording { "on" } else { "off" });
                }
                "m" => {
                    if preview.take().is_some() {
                        let summary = session.stop_capture()?;
                        println!("Capture stopped: {} faces saved", summary.saved.len());
                    }
                    recording = false;
                    let attendance = tokio::task::block_in_place(|| session.attend(group))?;
                    print!("{}", render_attendance(&attendance));
                    println!("Press r to start a new capture (clears the saved faces)");
                }
                "q" => break,
                "" => {}
                other => println!("unknown command {other:?}; use r, m or q"),
            },
            LiveEvent::Preview(Some(frame)) => {
                frames += 1;
                faces += frame.faces.len();
                if last_status.elapsed() >= Duration::from_secs(2) {
                    println!(
                        "frame {} ({}x{}, brightness {:.0}): {} faces in view, {} frames, {} detections{}",
                        frame.frame.sequence,
                        frame.frame.width,
                        frame.frame.height,
                        frame.frame.avg_brightness(),
                        frame.faces.len(),
                        frames,
                        faces,
                        if frame.recording { ", recording" } else { "" }
                    );
                    last_status = Instant::now();
                }
            }
            LiveEvent::Preview(None) => {
                preview = None;
                recording = false;
                let summary = session.stop_capture()?;
                eprintln!(
                    "capture ended: {} ({} faces saved)",
                    summary.error.as_deref().unwrap_or("worker exited"),
                    summary.saved.len()
                );
            }
        }
    }

    session.close()?;
    println!("Bye");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::{resolve, MatchOutcome, MatchResult, Student};

    fn attendance(skipped_pairs: usize, compared_pairs: usize) -> Attendance {
        let roster: Vec<Student> = ["Alice", "Bob"]
            .iter()
            .map(|n| Student {
                name: n.to_string(),
                group: "G1".into(),
                photo_path: PathBuf::from(format!("/p/{n}.jpg")),
                registered_at: None,
            })
            .collect();
        let results = if compared_pairs > 0 {
            vec![MatchResult { student_name: "Alice".into(), confidence: 70.0 }]
        } else {
            Vec::new()
        };
        let report = resolve("G1", &roster, &results);
        Attendance {
            outcome: MatchOutcome { results, compared_pairs, skipped_pairs },
            report,
        }
    }

    #[test]
    fn test_render_attendance() {
        let text = render_attendance(&attendance(0, 4));
        assert!(text.contains("Present (1/2):"));
        assert!(text.contains("Alice"));
        assert!(text.contains("70.0%"));
        assert!(text.contains("Absent (1/2):\n  Bob\n"));
        assert!(!text.contains("warning"));
    }

    #[test]
    fn test_render_warns_when_all_pairs_failed() {
        let text = render_attendance(&attendance(4, 0));
        assert!(text.contains("every comparison failed"));
        assert!(text.contains("Absent (2/2):"));
    }

    #[test]
    fn test_attendance_json_is_flat() {
        let attendance = attendance(1, 3);
        let value = serde_json::to_value(AttendanceJson {
            report: &attendance.report,
            compared_pairs: attendance.outcome.compared_pairs,
            skipped_pairs: attendance.outcome.skipped_pairs,
        })
        .unwrap();
        assert_eq!(value["group"], "G1");
        assert_eq!(value["present"][0]["name"], "Alice");
        assert_eq!(value["absent"][0], "Bob");
        assert_eq!(value["skipped_pairs"], 1);
    }

    #[test]
    fn test_capture_duration_arg() {
        assert_eq!(capture_duration_arg(1.5).unwrap(), Duration::from_millis(1500));
        assert!(capture_duration_arg(0.0).is_err());
        assert!(capture_duration_arg(f32::NAN).is_err());
        assert!(capture_duration_arg(1e30).is_err());
    }

    #[test]
    fn test_cli_parses_attend() {
        let cli = Cli::try_parse_from(["rollcall", "attend", "--group", "G1", "--capture", "--json"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Attend { ref group, capture: true, json: true } if group == "G1"
        ));
    }
}
