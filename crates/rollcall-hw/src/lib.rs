//! rollcall-hw — V4L2 camera capture producing RGB frames.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, FrameStream, PixelFormat};
