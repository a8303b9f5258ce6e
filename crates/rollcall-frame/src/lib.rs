//! rollcall-frame — Frame plumbing between the camera pipeline and the engine.
//!
//! Capture itself belongs to the camera pipeline. This crate converts what it
//! delivers into RGB images, scales previews, mirrors front-camera frames and
//! draws recognition overlays.

pub mod frame;
pub mod overlay;
pub mod source;

pub use frame::{Frame, FrameError, PixelFormat, UnknownPixelFormat};
pub use overlay::draw_overlay;
pub use source::{FrameSource, SpoolFrameSource, SpoolLayout};
