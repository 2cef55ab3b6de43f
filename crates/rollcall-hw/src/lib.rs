//! rollcall-hw: hardware abstraction for camera capture.
//!
//! Provides V4L2-based camera access, the [`FrameSource`] seam the capture
//! loop reads from, and grayscale frame helpers (crop, dark-frame check).

pub mod camera;
pub mod frame;
pub mod source;

pub use camera::{Camera, CameraError, CameraStream, DeviceInfo, PixelFormat};
pub use frame::{Frame, FrameError};
pub use source::{CameraBackend, FrameSource, V4lBackend};
