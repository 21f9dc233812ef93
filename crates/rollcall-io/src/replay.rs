//! Replays a directory of still images as a frame stream.
//!
//! The collector stores uploads as `frame_<millis>.jpg`, so name order is
//! capture order.

use rollcall_core::frame::Frame;
use rollcall_core::pipeline::{FrameSource, StreamError};
use std::path::{Path, PathBuf};

const EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

pub struct ReplaySource {
    pending: std::vec::IntoIter<PathBuf>,
    sequence: u64,
}

impl ReplaySource {
    pub fn open(dir: &Path) -> Result<Self, StreamError> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| StreamError::Open(format!("{}: {e}", dir.display())))?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && is_frame_file(path))
            .collect();
        paths.sort();

        if paths.is_empty() {
            tracing::warn!(dir = %dir.display(), "replay directory has no frames");
        } else {
            tracing::info!(dir = %dir.display(), frames = paths.len(), "replay source opened");
        }

        Ok(Self {
            pending: paths.into_iter(),
            sequence: 0,
        })
    }

    /// Frames not yet read.
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}

fn is_frame_file(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'));
    let known_ext = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| EXTENSIONS.iter().any(|x| x.eq_ignore_ascii_case(e)));
    !hidden && known_ext
}

impl FrameSource for ReplaySource {
    fn next_frame(&mut self) -> Result<Option<Frame>, StreamError> {
        let Some(path) = self.pending.next() else {
            return Ok(None);
        };
        let bytes = std::fs::read(&path)
            .map_err(|e| StreamError::Read(format!("{}: {e}", path.display())))?;
        let frame = Frame::decode(&bytes, self.sequence + 1).map_err(|e| {
            tracing::debug!(path = %path.display(), "replay frame undecodable");
            StreamError::from(e)
        })?;
        self.sequence = frame.sequence;
        Ok(Some(frame))
    }
}
