//! rollcall-io: Concrete collaborators for the recognition loop.
//!
//! Frame sources (live MJPEG over HTTP, or a directory replay), the HTTP
//! attendance sender, and the on-disk preview writer.

pub mod attendance;
pub mod mjpeg;
pub mod preview;
pub mod replay;

pub use attendance::{QueuedAttendanceSink, SinkError};
pub use mjpeg::MjpegSource;
pub use preview::{PreviewError, PreviewSink};
pub use replay::ReplaySource;
