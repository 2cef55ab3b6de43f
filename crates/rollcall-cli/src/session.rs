use crate::capture::{run_bounded, CaptureController, CaptureError, CaptureSettings, CaptureSummary};
use rollcall_core::{
    resolve_group, AttendanceReport, BoundingBox, BufferError, CaptureBuffer, Comparator, Detector,
    MatchEngine, MatchError, MatchOutcome, ReferenceStore, StoreError,
};
use rollcall_hw::{CameraBackend, CameraError, Frame, FrameSource};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Preview frames buffered between the capture worker and its consumer.
/// The worker drops frames rather than wait on a slow consumer.
const PREVIEW_CAPACITY: usize = 2;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("a capture is running; stop it before matching")]
    CaptureActive,
    #[error("no capture is running")]
    NotCapturing,
    #[error("capture resources were lost when the worker died")]
    Unavailable,
    #[error("failed to open camera: {0}")]
    DeviceOpen(#[source] CameraError),
    #[error("capture: {0}")]
    Capture(#[from] CaptureError),
    #[error("capture buffer: {0}")]
    Buffer(#[from] BufferError),
    #[error("match: {0}")]
    Match(#[from] MatchError),
    #[error("reference store: {0}")]
    Store(#[from] StoreError),
    #[error("failed to spawn capture worker: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("capture worker panicked")]
    WorkerPanicked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Capturing,
    Matching,
}

/// Messages sent from the session to the capture worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureCommand {
    /// Gate whether detected faces are written to the buffer.
    SetRecording(bool),
    Stop,
}

/// A processed frame published to the preview consumer.
pub struct PreviewFrame {
    pub frame: Frame,
    pub faces: Vec<BoundingBox>,
    pub recording: bool,
}

pub struct SessionOptions {
    pub camera_index: u32,
    pub capture: CaptureSettings,
}

pub type BoxedDetector = Box<dyn Detector + Send>;

/// What moves into the capture worker and comes back on join.
struct CaptureParts {
    detector: BoxedDetector,
    buffer: CaptureBuffer,
}

struct WorkerExit {
    parts: CaptureParts,
    summary: CaptureSummary,
}

struct Worker {
    commands: std_mpsc::Sender<CaptureCommand>,
    handle: JoinHandle<WorkerExit>,
}

/// Match results together with the attendance they resolved to.
pub struct Attendance {
    pub outcome: MatchOutcome,
    pub report: AttendanceReport,
}

/// One attendance session: camera, detector, capture buffer, store and match engine.
///
/// State machine: IDLE → CAPTURING → IDLE and IDLE → MATCHING → IDLE. While
/// capturing, the detector and buffer live on the worker thread, so matching
/// cannot observe a buffer that is still being written.
pub struct Session<C: Comparator> {
    backend: Arc<dyn CameraBackend>,
    options: SessionOptions,
    store: ReferenceStore,
    engine: MatchEngine<C>,
    parts: Option<CaptureParts>,
    worker: Option<Worker>,
    state: SessionState,
}

impl<C: Comparator> Session<C> {
    pub fn open(
        backend: Arc<dyn CameraBackend>,
        detector: BoxedDetector,
        buffer: CaptureBuffer,
        store: ReferenceStore,
        engine: MatchEngine<C>,
        options: SessionOptions,
    ) -> Self {
        tracing::info!(
            camera_index = options.camera_index,
            buffer = %buffer.dir().display(),
            "session opened"
        );
        Self {
            backend,
            options,
            store,
            engine,
            parts: Some(CaptureParts { detector, buffer }),
            worker: None,
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Bounded capture on the calling thread. Clears the buffer first.
    pub fn capture_for(&mut self, duration: Duration) -> Result<CaptureSummary, SessionError> {
        self.stop_if_capturing()?;
        let parts = self.parts.as_mut().ok_or(SessionError::Unavailable)?;
        let summary = run_bounded(
            self.backend.as_ref(),
            self.options.camera_index,
            parts.detector.as_mut(),
            &mut parts.buffer,
            &self.options.capture,
            duration,
        )?;
        Ok(summary)
    }

    /// Start an open-ended capture on a worker thread.
    ///
    /// A running capture is stopped first, so at most one device is open.
    /// The buffer is cleared before the device opens. Returns once the
    /// device opened, or with [`SessionError::DeviceOpen`] if it did not.
    pub fn start_capture(&mut self, recording: bool) -> Result<mpsc::Receiver<PreviewFrame>, SessionError> {
        self.stop_if_capturing()?;
        let mut parts = self.parts.take().ok_or(SessionError::Unavailable)?;
        if let Err(e) = parts.buffer.clear() {
            self.parts = Some(parts);
            return Err(e.into());
        }

        let (cmd_tx, cmd_rx) = std_mpsc::channel::<CaptureCommand>();
        let (ack_tx, ack_rx) = std_mpsc::sync_channel::<Result<(), CameraError>>(1);
        let (preview_tx, preview_rx) = mpsc::channel::<PreviewFrame>(PREVIEW_CAPACITY);

        let backend = Arc::clone(&self.backend);
        let camera_index = self.options.camera_index;
        let settings = self.options.capture;

        let handle = std::thread::Builder::new()
            .name("rollcall-capture".into())
            .spawn(move || {
                tracing::info!(camera_index, recording, "capture worker started");
                let mut summary = CaptureSummary::default();
                let mut ack = Some(ack_tx);
                let mut controller =
                    CaptureController::new(parts.detector.as_mut(), &mut parts.buffer, settings.save_interval);

                let opened = backend.with_source(camera_index, &mut |source: &mut dyn FrameSource| {
                    if let Some(ack) = ack.take() {
                        let _ = ack.send(Ok(()));
                    }
                    run_interactive(
                        source,
                        &mut controller,
                        &cmd_rx,
                        &preview_tx,
                        recording,
                        settings.frame_delay,
                        &mut summary,
                    );
                });
                drop(controller);

                if let Err(e) = opened {
                    match ack.take() {
                        Some(ack) => {
                            let _ = ack.send(Err(e));
                        }
                        None => summary.error = Some(e.to_string()),
                    }
                }
                tracing::info!(
                    frames = summary.frames,
                    saved = summary.saved.len(),
                    "capture worker exiting"
                );
                WorkerExit { parts, summary }
            })
            .map_err(SessionError::Spawn)?;

        match ack_rx.recv() {
            Ok(Ok(())) => {
                self.worker = Some(Worker {
                    commands: cmd_tx,
                    handle,
                });
                self.state = SessionState::Capturing;
                Ok(preview_rx)
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, camera_index, "camera open failed");
                let exit = handle.join().map_err(|_| SessionError::WorkerPanicked)?;
                self.parts = Some(exit.parts);
                Err(SessionError::DeviceOpen(e))
            }
            Err(_) => {
                let exit = handle.join().map_err(|_| SessionError::WorkerPanicked)?;
                self.parts = Some(exit.parts);
                Err(SessionError::WorkerPanicked)
            }
        }
    }

    /// Toggle whether the running capture writes faces to the buffer.
    pub fn set_recording(&self, recording: bool) -> Result<(), SessionError> {
        let worker = self.worker.as_ref().ok_or(SessionError::NotCapturing)?;
        worker
            .commands
            .send(CaptureCommand::SetRecording(recording))
            .map_err(|_| SessionError::NotCapturing)
    }

    /// Stop the running capture, join the worker and take back the detector and buffer.
    pub fn stop_capture(&mut self) -> Result<CaptureSummary, SessionError> {
        let worker = self.worker.take().ok_or(SessionError::NotCapturing)?;
        self.state = SessionState::Idle;
        // The worker may already have exited after a read failure.
        let _ = worker.commands.send(CaptureCommand::Stop);
        let exit = worker.handle.join().map_err(|_| SessionError::WorkerPanicked)?;
        self.parts = Some(exit.parts);
        tracing::info!(saved = exit.summary.saved.len(), "capture stopped");
        Ok(exit.summary)
    }

    fn stop_if_capturing(&mut self) -> Result<(), SessionError> {
        if self.worker.is_some() {
            tracing::info!("stopping previous capture");
            self.stop_capture()?;
        }
        Ok(())
    }

    /// Match the buffer against `group`. Fails while a capture is running.
    pub fn match_group(&mut self, group: &str) -> Result<MatchOutcome, SessionError> {
        if self.worker.is_some() {
            return Err(SessionError::CaptureActive);
        }
        let parts = self.parts.as_ref().ok_or(SessionError::Unavailable)?;

        self.state = SessionState::Matching;
        let outcome = self.engine.match_group(group, &self.store, &parts.buffer);
        self.state = SessionState::Idle;

        let outcome = outcome?;
        if outcome.all_pairs_failed() {
            tracing::warn!(group, skipped = outcome.skipped_pairs, "every comparison failed");
        }
        Ok(outcome)
    }

    /// Match, then resolve attendance against the group's roster.
    pub fn attend(&mut self, group: &str) -> Result<Attendance, SessionError> {
        let outcome = self.match_group(group)?;
        let report = resolve_group(&self.store, group, &outcome.results)?;
        Ok(Attendance { outcome, report })
    }

    /// Stop any running capture and release the device.
    pub fn close(mut self) -> Result<Option<CaptureSummary>, SessionError> {
        let summary = match self.worker {
            Some(_) => Some(self.stop_capture()?),
            None => None,
        };
        tracing::info!("session closed");
        Ok(summary)
    }
}

impl<C: Comparator> Drop for Session<C> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.commands.send(CaptureCommand::Stop);
            if worker.handle.join().is_err() {
                tracing::error!("capture worker panicked during shutdown");
            }
        }
    }
}

/// Worker loop: read, detect, maybe save, publish preview, until stopped.
fn run_interactive<D: Detector + ?Sized>(
    source: &mut dyn FrameSource,
    controller: &mut CaptureController<'_, D>,
    commands: &std_mpsc::Receiver<CaptureCommand>,
    preview: &mpsc::Sender<PreviewFrame>,
    mut recording: bool,
    frame_delay: Duration,
    summary: &mut CaptureSummary,
) {
    'capture: loop {
        loop {
            match commands.try_recv() {
                Ok(CaptureCommand::SetRecording(on)) => {
                    if on != recording {
                        tracing::info!(recording = on, "recording toggled");
                    }
                    recording = on;
                }
                Ok(CaptureCommand::Stop) | Err(std_mpsc::TryRecvError::Disconnected) => break 'capture,
                Err(std_mpsc::TryRecvError::Empty) => break,
            }
        }

        let frame = match source.next_frame() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "frame read failed; ending capture");
                summary.error = Some(e.to_string());
                break;
            }
        };
        summary.frames += 1;

        let faces = match controller.process_frame(&frame, recording, summary) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(error = %e, "failed to save face; ending capture");
                summary.error = Some(e.to_string());
                break;
            }
        };

        match preview.try_send(PreviewFrame { frame, faces, recording }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => tracing::trace!("preview consumer lagging; frame dropped"),
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }

        if !frame_delay.is_zero() {
            std::thread::sleep(frame_delay);
        }
    }
}
