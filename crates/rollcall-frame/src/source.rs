//! Frame sources. The camera pipeline is external; these adapt what it
//! produces into [`Frame`]s on demand.

use crate::frame::{self, Frame, FrameError, PixelFormat};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Something the recognition loop can pull frames from.
pub trait FrameSource: Send {
    /// Return the newest frame, or `None` if nothing new arrived since the
    /// previous call.
    fn capture(&mut self) -> Result<Option<Frame>, FrameError>;
}

/// How the capture pipeline lays out the spool file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpoolLayout {
    /// JPEG or PNG; dimensions come from the file.
    #[default]
    Encoded,
    /// Headerless pixel buffer of a fixed size.
    Raw {
        format: PixelFormat,
        width: u32,
        height: u32,
    },
}

/// Reads the latest frame from a spool file that the capture pipeline
/// overwrites. A frame is returned only when the file's modification time
/// changes.
pub struct SpoolFrameSource {
    path: PathBuf,
    layout: SpoolLayout,
    last_modified: Option<SystemTime>,
    sequence: u64,
}

impl SpoolFrameSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_layout(path, SpoolLayout::Encoded)
    }

    /// A spool of raw `format` buffers, each `width` x `height`.
    pub fn raw(path: impl Into<PathBuf>, format: PixelFormat, width: u32, height: u32) -> Self {
        Self::with_layout(
            path,
            SpoolLayout::Raw {
                format,
                width,
                height,
            },
        )
    }

    pub fn with_layout(path: impl Into<PathBuf>, layout: SpoolLayout) -> Self {
        Self {
            path: path.into(),
            layout,
            last_modified: None,
            sequence: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layout(&self) -> SpoolLayout {
        self.layout
    }
}

impl FrameSource for SpoolFrameSource {
    fn capture(&mut self) -> Result<Option<Frame>, FrameError> {
        let meta = match std::fs::metadata(&self.path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let modified = meta.modified()?;
        if self.last_modified == Some(modified) {
            return Ok(None);
        }

        let bytes = std::fs::read(&self.path)?;
        let image = match self.layout {
            SpoolLayout::Encoded => frame::decode(&bytes)?,
            SpoolLayout::Raw {
                format,
                width,
                height,
            } => frame::to_rgb(&bytes, width, height, format)?,
        };
        self.last_modified = Some(modified);
        self.sequence += 1;
        tracing::trace!(
            path = %self.path.display(),
            seq = self.sequence,
            "spool frame read"
        );
        Ok(Some(Frame::new(image, self.sequence)))
    }
}
