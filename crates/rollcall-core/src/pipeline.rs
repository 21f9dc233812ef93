//! The recognition loop and the collaborators it drives.
//!
//! One frame per iteration: pull, schedule, dispatch attendance, render.
//! Everything runs on the calling thread.

use crate::detector::FaceLocator;
use crate::frame::{Frame, FrameError};
use crate::matcher::Matcher;
use crate::recognizer::FaceEncoder;
use crate::scheduler::{Cadence, Scheduler};
use crate::types::AnnotationSet;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("cannot open frame source: {0}")]
    Open(String),
    #[error("frame source read failed: {0}")]
    Read(String),
    #[error(transparent)]
    Decode(#[from] FrameError),
}

impl StreamError {
    /// A single bad frame; the stream itself is still usable.
    pub fn is_soft(&self) -> bool {
        matches!(self, StreamError::Decode(_))
    }
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("attendance queue full")]
    QueueFull,
    #[error("attendance sender stopped")]
    Closed,
    #[error("attendance transport: {0}")]
    Transport(String),
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Stream(StreamError),
}

/// Pull-based frame supplier.
pub trait FrameSource {
    /// Next frame, or `Ok(None)` once the stream has ended.
    fn next_frame(&mut self) -> Result<Option<Frame>, StreamError>;
}

impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
    fn next_frame(&mut self) -> Result<Option<Frame>, StreamError> {
        (**self).next_frame()
    }
}

/// An attendance record as sent to the collector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    pub name: String,
    /// ISO-8601 local time.
    pub timestamp: String,
}

impl AttendanceEvent {
    pub fn new(name: impl Into<String>, at: DateTime<Local>) -> Self {
        Self {
            name: name.into(),
            timestamp: at.to_rfc3339(),
        }
    }

    pub fn now(name: impl Into<String>) -> Self {
        Self::new(name, Local::now())
    }
}

/// Receives attendance events. Must not block the loop.
pub trait AttendanceSink {
    fn send(&mut self, event: AttendanceEvent) -> Result<(), DispatchError>;
}

/// Displays frames and reports the operator's quit request.
pub trait RenderSink {
    fn render(&mut self, frame: &Frame, overlay: Option<&AnnotationSet>);

    fn quit_requested(&self) -> bool {
        false
    }

    /// Release display resources. Called exactly once when the loop exits.
    fn close(&mut self) {}
}

/// Undecodable frames in a row after which the source is considered dead.
pub const MAX_CONSECUTIVE_DROPS: u32 = 30;

/// Why the loop stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndOfStream,
    Quit,
}

/// Frame counters for the exit summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub frames: u64,
    pub processed: u64,
    pub matched: u64,
    pub dropped: u64,
    pub dispatched: u64,
}

/// Run the recognition loop until the stream ends, the operator quits, or
/// the source fails.
///
/// Undecodable frames are skipped, up to [`MAX_CONSECUTIVE_DROPS`] in a row,
/// which ends the stream. Failed dispatches are logged. The render sink is
/// closed on every exit path.
pub fn run<S, A, R, L, E, M>(
    source: &mut S,
    scheduler: &mut Scheduler<L, E, M>,
    attendance: &mut A,
    render: &mut R,
) -> Result<(StopReason, LoopStats), PipelineError>
where
    S: FrameSource + ?Sized,
    A: AttendanceSink + ?Sized,
    R: RenderSink + ?Sized,
    L: FaceLocator,
    E: FaceEncoder,
    M: Matcher,
{
    let mut stats = LoopStats::default();
    let result = run_frames(source, scheduler, attendance, render, &mut stats);
    render.close();

    match &result {
        Ok(reason) => tracing::info!(
            ?reason,
            frames = stats.frames,
            processed = stats.processed,
            matched = stats.matched,
            dropped = stats.dropped,
            dispatched = stats.dispatched,
            "recognition loop finished"
        ),
        Err(e) => tracing::error!(error = %e, frames = stats.frames, "recognition loop aborted"),
    }
    result.map(|reason| (reason, stats))
}

fn run_frames<S, A, R, L, E, M>(
    source: &mut S,
    scheduler: &mut Scheduler<L, E, M>,
    attendance: &mut A,
    render: &mut R,
    stats: &mut LoopStats,
) -> Result<StopReason, PipelineError>
where
    S: FrameSource + ?Sized,
    A: AttendanceSink + ?Sized,
    R: RenderSink + ?Sized,
    L: FaceLocator,
    E: FaceEncoder,
    M: Matcher,
{
    let mut consecutive_drops = 0u32;
    loop {
        if render.quit_requested() {
            return Ok(StopReason::Quit);
        }

        let frame = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(StopReason::EndOfStream),
            Err(e) if e.is_soft() => {
                stats.dropped += 1;
                consecutive_drops += 1;
                tracing::warn!(error = %e, consecutive = consecutive_drops, "dropping undecodable frame");
                if consecutive_drops >= MAX_CONSECUTIVE_DROPS {
                    tracing::warn!("too many undecodable frames in a row; treating as end of stream");
                    return Ok(StopReason::EndOfStream);
                }
                continue;
            }
            Err(e) => return Err(PipelineError::Stream(e)),
        };
        consecutive_drops = 0;
        stats.frames += 1;

        let outcome = scheduler.process_frame(&frame, frame.timestamp);
        match outcome.cadence {
            Cadence::Skip => {}
            Cadence::DetectOnly => stats.processed += 1,
            Cadence::DetectAndMatch => {
                stats.processed += 1;
                stats.matched += 1;
            }
        }

        for name in &outcome.dispatches {
            match attendance.send(AttendanceEvent::now(name.as_str())) {
                Ok(()) => stats.dispatched += 1,
                Err(e) => tracing::warn!(name = %name, error = %e, "attendance dispatch failed"),
            }
        }

        render.render(&frame, outcome.overlay);
    }
}
