//! rollcall-core: Real-time face recognition scheduler for attendance.
//!
//! Decides per frame whether to run detection and identity matching,
//! keeps the last annotations alive across skipped frames, and rate-limits
//! attendance events per identity. Detection uses SCRFD and encoding uses
//! ArcFace, both via ONNX Runtime on the CPU.

pub mod alignment;
pub mod detector;
pub mod enroll;
pub mod frame;
pub mod matcher;
pub mod pipeline;
pub mod recognizer;
pub mod scheduler;
pub mod store;
pub mod types;

pub use detector::{FaceDetector, FaceLocator};
pub use frame::Frame;
pub use matcher::{match_identity, CosineMatcher, DistanceMatcher, MatchPolicy, Matcher};
pub use pipeline::{
    AttendanceEvent, AttendanceSink, DispatchError, FrameSource, PipelineError, RenderSink, StopReason,
    StreamError,
};
pub use recognizer::{FaceEncoder, FaceRecognizer};
pub use scheduler::{Cadence, Scheduler, SchedulerConfig};
pub use store::IdentityStore;
pub use types::{Annotation, AnnotationSet, Embedding, Face, KnownIdentity, Label, Region};

use std::path::PathBuf;

/// SCRFD detection model file name inside the model directory.
pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
/// ArcFace recognition model file name inside the model directory.
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

/// Per-user data directory: `$XDG_DATA_HOME/rollcall`, falling back to
/// `~/.local/share/rollcall`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

/// Default location of the ONNX model files.
pub fn default_model_dir() -> PathBuf {
    default_data_dir().join("models")
}
