//! Capture controller: camera frames → face detection → throttled crops in the buffer.

use rollcall_core::{BoundingBox, BufferError, CaptureBuffer, Detector};
use rollcall_hw::{CameraBackend, CameraError, Frame, FrameSource};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("failed to open camera: {0}")]
    DeviceOpen(#[source] CameraError),
    #[error("capture buffer: {0}")]
    Buffer(#[from] BufferError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureSettings {
    /// Minimum time between two saved crops.
    pub save_interval: Duration,
    /// Pause after each processed frame.
    pub frame_delay: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            save_interval: Duration::from_millis(500),
            frame_delay: Duration::from_millis(50),
        }
    }
}

/// Allows one save per `interval`. The first acquire always succeeds.
#[derive(Debug, Clone)]
pub struct SaveThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl SaveThrottle {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    pub fn try_acquire(&mut self, now: Instant) -> bool {
        let ready = match self.last {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        };
        if ready {
            self.last = Some(now);
        }
        ready
    }
}

/// What a capture run produced.
#[derive(Debug, Default, Clone)]
pub struct CaptureSummary {
    pub frames: u32,
    pub dark_skipped: u32,
    pub faces_detected: usize,
    /// Crops written to the buffer, in write order.
    pub saved: Vec<PathBuf>,
    /// Why the loop ended early, if it did.
    pub error: Option<String>,
}

impl CaptureSummary {
    /// At least one face was saved.
    pub fn success(&self) -> bool {
        !self.saved.is_empty()
    }
}

/// Per-frame work shared by bounded and interactive capture.
pub struct CaptureController<'a, D: Detector + ?Sized> {
    detector: &'a mut D,
    buffer: &'a mut CaptureBuffer,
    throttle: SaveThrottle,
}

impl<'a, D: Detector + ?Sized> CaptureController<'a, D> {
    pub fn new(detector: &'a mut D, buffer: &'a mut CaptureBuffer, save_interval: Duration) -> Self {
        Self {
            detector,
            buffer,
            throttle: SaveThrottle::new(save_interval),
        }
    }

    /// Detect faces in `frame` and, when `record` is set, save throttled crops.
    ///
    /// Detector failures are logged and treated as an empty frame. Only a
    /// buffer write failure is returned.
    pub fn process_frame(
        &mut self,
        frame: &Frame,
        record: bool,
        summary: &mut CaptureSummary,
    ) -> Result<Vec<BoundingBox>, BufferError> {
        if frame.is_dark {
            summary.dark_skipped += 1;
            tracing::trace!(sequence = frame.sequence, "dark frame skipped");
            return Ok(Vec::new());
        }

        let faces = match self.detector.detect(&frame.data, frame.width, frame.height) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(error = %e, sequence = frame.sequence, "face detection failed; skipping frame");
                return Ok(Vec::new());
            }
        };
        summary.faces_detected += faces.len();

        if record {
            for face in &faces {
                let Some((x, y, w, h)) = face.pixel_rect(frame.width, frame.height) else {
                    tracing::debug!(?face, "degenerate face box skipped");
                    continue;
                };
                let Some(crop) = frame.crop(x, y, w, h) else {
                    continue;
                };
                if !self.throttle.try_acquire(frame.timestamp) {
                    continue;
                }
                let path = self.buffer.save(&crop)?;
                tracing::info!(path = %path.display(), confidence = face.confidence, "face saved");
                summary.saved.push(path);
            }
        }

        Ok(faces)
    }
}

/// Clear the buffer, then capture for `duration` from camera `camera_index`.
///
/// The camera is released before this returns. A frame read failure ends the
/// run early; crops saved so far stay in the buffer and the summary records
/// the error.
pub fn run_bounded<D: Detector + ?Sized>(
    backend: &dyn CameraBackend,
    camera_index: u32,
    detector: &mut D,
    buffer: &mut CaptureBuffer,
    settings: &CaptureSettings,
    duration: Duration,
) -> Result<CaptureSummary, CaptureError> {
    buffer.clear()?;

    let mut summary = CaptureSummary::default();
    let mut controller = CaptureController::new(detector, buffer, settings.save_interval);
    tracing::info!(camera_index, ?duration, "capture started");

    backend
        .with_source(camera_index, &mut |source: &mut dyn FrameSource| {
            let start = Instant::now();
            while start.elapsed() < duration {
                let frame = match source.next_frame() {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!(error = %e, "frame read failed; ending capture");
                        summary.error = Some(e.to_string());
                        break;
                    }
                };
                summary.frames += 1;
                if let Err(e) = controller.process_frame(&frame, true, &mut summary) {
                    tracing::warn!(error = %e, "failed to save face; ending capture");
                    summary.error = Some(e.to_string());
                    break;
                }
                if !settings.frame_delay.is_zero() {
                    std::thread::sleep(settings.frame_delay);
                }
            }
        })
        .map_err(CaptureError::DeviceOpen)?;

    tracing::info!(
        frames = summary.frames,
        faces = summary.faces_detected,
        saved = summary.saved.len(),
        "capture finished"
    );
    Ok(summary)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rollcall_core::DetectorError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    pub(crate) const FRAME_W: u32 = 64;
    pub(crate) const FRAME_H: u32 = 48;

    pub(crate) fn face_box(x: f32, y: f32, size: f32) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width: size,
            height: size,
            confidence: 0.9,
            landmarks: None,
        }
    }

    /// Finds the same faces in every frame.
    pub(crate) struct FixedDetector {
        pub faces: Vec<BoundingBox>,
        pub calls: usize,
    }

    impl FixedDetector {
        pub(crate) fn one_face() -> Self {
            Self {
                faces: vec![face_box(10.0, 8.0, 20.0)],
                calls: 0,
            }
        }
    }

    impl Detector for FixedDetector {
        fn detect(&mut self, _: &[u8], _: u32, _: u32) -> Result<Vec<BoundingBox>, DetectorError> {
            self.calls += 1;
            Ok(self.faces.clone())
        }
    }

    struct FailingDetector;

    impl Detector for FailingDetector {
        fn detect(&mut self, _: &[u8], _: u32, _: u32) -> Result<Vec<BoundingBox>, DetectorError> {
            Err(DetectorError::InferenceFailed("bad tensor".into()))
        }
    }

    pub(crate) fn bright_frame(sequence: u32) -> Frame {
        Frame::from_gray(vec![128u8; (FRAME_W * FRAME_H) as usize], FRAME_W, FRAME_H, sequence).unwrap()
    }

    /// Yields bright frames, then fails once `limit` is reached.
    pub(crate) struct SyntheticSource {
        pub limit: Option<u32>,
        pub produced: u32,
    }

    impl FrameSource for SyntheticSource {
        fn next_frame(&mut self) -> Result<Frame, CameraError> {
            if self.limit.is_some_and(|limit| self.produced >= limit) {
                return Err(CameraError::CaptureFailed("stream ended".into()));
            }
            self.produced += 1;
            Ok(bright_frame(self.produced))
        }
    }

    /// Camera backend that hands out [`SyntheticSource`]s and tracks open devices.
    #[derive(Default)]
    pub(crate) struct SyntheticBackend {
        pub fail_open: bool,
        pub frame_limit: Option<u32>,
        pub active: AtomicUsize,
        pub max_active: AtomicUsize,
        pub opened: AtomicUsize,
    }

    impl CameraBackend for SyntheticBackend {
        fn with_source(
            &self,
            camera_index: u32,
            run: &mut dyn FnMut(&mut dyn FrameSource),
        ) -> Result<(), CameraError> {
            if self.fail_open {
                return Err(CameraError::DeviceNotFound(format!("/dev/video{camera_index}")));
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            let mut source = SyntheticSource {
                limit: self.frame_limit,
                produced: 0,
            };
            run(&mut source);
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fast() -> CaptureSettings {
        CaptureSettings {
            save_interval: Duration::ZERO,
            frame_delay: Duration::ZERO,
        }
    }

    #[test]
    fn test_throttle_first_acquire_and_interval() {
        let mut throttle = SaveThrottle::new(Duration::from_millis(500));
        let t0 = Instant::now();
        assert!(throttle.try_acquire(t0));
        assert!(!throttle.try_acquire(t0 + Duration::from_millis(100)));
        assert!(!throttle.try_acquire(t0 + Duration::from_millis(499)));
        assert!(throttle.try_acquire(t0 + Duration::from_millis(500)));
        assert!(!throttle.try_acquire(t0 + Duration::from_millis(900)));
    }

    #[test]
    fn test_throttle_limits_faces_within_one_frame() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = CaptureBuffer::open(dir.path()).unwrap();
        let mut detector = FixedDetector {
            faces: vec![face_box(0.0, 0.0, 10.0), face_box(30.0, 20.0, 10.0)],
            calls: 0,
        };
        let mut summary = CaptureSummary::default();
        let mut controller = CaptureController::new(&mut detector, &mut buffer, Duration::from_secs(60));

        let faces = controller.process_frame(&bright_frame(0), true, &mut summary).unwrap();
        assert_eq!(faces.len(), 2);
        assert_eq!(summary.faces_detected, 2);
        assert_eq!(summary.saved.len(), 1);
    }

    #[test]
    fn test_not_recording_detects_but_never_saves() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = CaptureBuffer::open(dir.path()).unwrap();
        let mut detector = FixedDetector::one_face();
        let mut summary = CaptureSummary::default();
        let mut controller = CaptureController::new(&mut detector, &mut buffer, Duration::ZERO);

        for seq in 0..3 {
            controller.process_frame(&bright_frame(seq), false, &mut summary).unwrap();
        }
        assert_eq!(summary.faces_detected, 3);
        assert!(!summary.success());
        assert!(buffer.is_empty().unwrap());
    }

    #[test]
    fn test_crop_is_clamped_and_degenerate_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = CaptureBuffer::open(dir.path()).unwrap();
        let mut detector = FixedDetector {
            faces: vec![
                face_box(-5.0, -5.0, 15.0),
                face_box(FRAME_W as f32 + 4.0, 0.0, 10.0),
                face_box(50.0, 40.0, 30.0),
            ],
            calls: 0,
        };
        let mut summary = CaptureSummary::default();
        let mut controller = CaptureController::new(&mut detector, &mut buffer, Duration::ZERO);
        controller.process_frame(&bright_frame(0), true, &mut summary).unwrap();

        assert_eq!(summary.saved.len(), 2);
        let first = image::open(&summary.saved[0]).unwrap();
        assert_eq!((first.width(), first.height()), (10, 10));
        let last = image::open(&summary.saved[1]).unwrap();
        assert_eq!((last.width(), last.height()), (FRAME_W - 50, FRAME_H - 40));
    }

    #[test]
    fn test_failed_crop_keeps_save_slot() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = CaptureBuffer::open(dir.path()).unwrap();
        let mut detector = FixedDetector {
            faces: vec![face_box(10.0, 30.0, 10.0), face_box(10.0, 2.0, 10.0)],
            calls: 0,
        };
        // Pixel data stops after row 20, so the lower face cannot be cut out.
        let mut frame = bright_frame(0);
        frame.data.truncate((FRAME_W * 20) as usize);

        let mut summary = CaptureSummary::default();
        let mut controller = CaptureController::new(&mut detector, &mut buffer, Duration::from_secs(60));
        controller.process_frame(&frame, true, &mut summary).unwrap();

        assert_eq!(summary.saved.len(), 1);
        let saved = image::open(&summary.saved[0]).unwrap();
        assert_eq!((saved.width(), saved.height()), (10, 10));
    }

    #[test]
    fn test_dark_frames_and_detector_errors_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = CaptureBuffer::open(dir.path()).unwrap();
        let mut summary = CaptureSummary::default();

        let mut detector = FixedDetector::one_face();
        let dark = Frame::from_gray(vec![0u8; (FRAME_W * FRAME_H) as usize], FRAME_W, FRAME_H, 0).unwrap();
        let mut controller = CaptureController::new(&mut detector, &mut buffer, Duration::ZERO);
        assert!(controller.process_frame(&dark, true, &mut summary).unwrap().is_empty());
        assert_eq!(summary.dark_skipped, 1);
        assert_eq!(detector.calls, 0);

        let mut failing = FailingDetector;
        let mut controller = CaptureController::new(&mut failing, &mut buffer, Duration::ZERO);
        assert!(controller.process_frame(&bright_frame(1), true, &mut summary).unwrap().is_empty());
        assert!(buffer.is_empty().unwrap());
    }

    #[test]
    fn test_bounded_run_clears_buffer_then_saves() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = CaptureBuffer::open(dir.path()).unwrap();
        std::fs::write(dir.path().join("face_7.jpg"), b"stale").unwrap();

        let backend = SyntheticBackend {
            frame_limit: Some(3),
            ..Default::default()
        };
        let mut detector = FixedDetector::one_face();
        let summary = run_bounded(&backend, 0, &mut detector, &mut buffer, &fast(), Duration::from_secs(5)).unwrap();

        assert_eq!(summary.frames, 3);
        assert!(summary.success());
        assert!(summary.error.is_some(), "source ran dry before the deadline");
        let names: Vec<_> = buffer
            .images()
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["face_0.jpg", "face_1.jpg", "face_2.jpg"]);
        assert_eq!(backend.active.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_bounded_run_stops_at_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = CaptureBuffer::open(dir.path()).unwrap();
        let backend = SyntheticBackend::default();
        let settings = CaptureSettings {
            save_interval: Duration::from_secs(60),
            frame_delay: Duration::from_millis(5),
        };
        let mut detector = FixedDetector::one_face();
        let summary = run_bounded(&backend, 0, &mut detector, &mut buffer, &settings, Duration::from_millis(60)).unwrap();

        assert!(summary.error.is_none());
        assert!(summary.frames >= 1);
        assert_eq!(summary.saved.len(), 1);
    }

    #[test]
    fn test_device_open_failure_saves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = CaptureBuffer::open(dir.path()).unwrap();
        let backend = Arc::new(SyntheticBackend {
            fail_open: true,
            ..Default::default()
        });
        let mut detector = FixedDetector::one_face();
        let err = run_bounded(backend.as_ref(), 2, &mut detector, &mut buffer, &fast(), Duration::from_secs(1)).unwrap_err();

        assert!(matches!(err, CaptureError::DeviceOpen(CameraError::DeviceNotFound(_))));
        assert!(buffer.is_empty().unwrap());
        assert_eq!(detector.calls, 0);
    }
}
