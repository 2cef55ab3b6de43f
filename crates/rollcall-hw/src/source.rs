//! Frame source seams between the capture loop and the camera device.

use crate::camera::{Camera, CameraError};
use crate::frame::Frame;

/// Anything that yields grayscale frames one at a time.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Frame, CameraError>;
}

/// Opens a capture device and lends a [`FrameSource`] for the duration of `run`.
///
/// The device is released when `with_source` returns, on every path.
/// `run` is only invoked once the device opened successfully.
pub trait CameraBackend: Send + Sync + 'static {
    fn with_source(
        &self,
        camera_index: u32,
        run: &mut dyn FnMut(&mut dyn FrameSource),
    ) -> Result<(), CameraError>;
}

/// V4L2 backend: `/dev/video{index}`.
#[derive(Debug, Default, Clone, Copy)]
pub struct V4lBackend;

impl CameraBackend for V4lBackend {
    fn with_source(
        &self,
        camera_index: u32,
        run: &mut dyn FnMut(&mut dyn FrameSource),
    ) -> Result<(), CameraError> {
        let camera = Camera::open_index(camera_index)?;
        let mut stream = camera.stream()?;
        run(&mut stream);
        tracing::debug!(device = %camera.device_path, "releasing camera");
        Ok(())
    }
}
