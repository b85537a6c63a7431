//! rollcall-hw — Hardware abstraction for live frame acquisition.
//!
//! Provides V4L2-based camera access and conversion of raw capture buffers
//! into grayscale frames.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, CameraStream, PixelFormat};
pub use frame::{Frame, FrameError};
