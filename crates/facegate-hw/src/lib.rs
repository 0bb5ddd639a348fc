//! facegate-hw — Camera capture for the face gate.
//!
//! Provides V4L2-based camera access and conversion of YUYV, RGB24, GREY and
//! MJPG buffers into RGB frames, plus bitmap text and box drawing for overlays.

pub mod camera;
pub mod frame;

pub use camera::{
    Camera, CameraError, CameraStream, DeviceInfo, FrameSource, PixelFormat, RawCapture,
};
pub use frame::Frame;
