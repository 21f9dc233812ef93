//! Attendance delivery off the recognition thread.
//!
//! Events go into a bounded queue and a dedicated sender thread posts them.
//! A full queue drops the event instead of stalling the frame loop.

use rollcall_core::pipeline::{AttendanceEvent, AttendanceSink, DispatchError};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};

pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("http client: {0}")]
    Client(#[from] reqwest::Error),
    #[error("failed to spawn attendance sender thread: {0}")]
    Spawn(#[source] std::io::Error),
}

pub struct QueuedAttendanceSink {
    tx: Option<mpsc::Sender<AttendanceEvent>>,
    worker: Option<JoinHandle<()>>,
}

impl QueuedAttendanceSink {
    /// POST each event as JSON to `url`. `timeout` bounds every request.
    pub fn http(url: &str, timeout: Duration, capacity: usize) -> Result<Self, SinkError> {
        let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
        let url = url.to_string();
        tracing::info!(url = %url, timeout_ms = timeout.as_millis() as u64, capacity, "attendance sender ready");
        Self::with_transport(capacity, move |event| post(&client, &url, event))
    }

    /// Deliver events through an arbitrary transport on the sender thread.
    pub fn with_transport<F>(capacity: usize, mut transport: F) -> Result<Self, SinkError>
    where
        F: FnMut(&AttendanceEvent) -> Result<(), DispatchError> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<AttendanceEvent>(capacity.max(1));

        let worker = std::thread::Builder::new()
            .name("rollcall-attendance".into())
            .spawn(move || {
                while let Some(event) = rx.blocking_recv() {
                    match transport(&event) {
                        Ok(()) => tracing::info!(name = %event.name, timestamp = %event.timestamp, "attendance sent"),
                        Err(e) => tracing::warn!(name = %event.name, error = %e, "attendance delivery failed"),
                    }
                }
                tracing::debug!("attendance sender exiting");
            })
            .map_err(SinkError::Spawn)?;

        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
        })
    }
}

impl AttendanceSink for QueuedAttendanceSink {
    fn send(&mut self, event: AttendanceEvent) -> Result<(), DispatchError> {
        let tx = self.tx.as_ref().ok_or(DispatchError::Closed)?;
        tx.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) => DispatchError::QueueFull,
            TrySendError::Closed(_) => DispatchError::Closed,
        })
    }
}

impl Drop for QueuedAttendanceSink {
    /// Flush what is queued, then stop the sender thread.
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("attendance sender thread panicked");
            }
        }
    }
}

fn post(
    client: &reqwest::blocking::Client,
    url: &str,
    event: &AttendanceEvent,
) -> Result<(), DispatchError> {
    client
        .post(url)
        .json(event)
        .send()
        .and_then(|r| r.error_for_status())
        .map(|_| ())
        .map_err(|e| DispatchError::Transport(e.to_string()))
}
