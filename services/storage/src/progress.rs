//! Upload progress reporting.
//!
//! An upload moves through `Queued -> Uploading -> Processing -> Success`, or
//! ends in `Error`. Observers receive `(status, state)` pairs; the
//! [`event_stream`] adapter turns them into a stream terminated by a
//! completion or failure event.

use serde::Serialize;
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{trace, warn};

use crate::records::FileRecord;

/// Status of an in-flight upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Queued,
    Uploading,
    /// Bytes are transferred, the record is still being registered
    Processing,
    Success,
    Error,
}

impl UploadStatus {
    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition(self, next: UploadStatus) -> bool {
        use UploadStatus::*;
        match (self, next) {
            (Uploading, Uploading) => true,
            (Queued, Uploading | Processing | Error) => true,
            (Uploading, Processing | Error) => true,
            (Processing, Success | Error) => true,
            _ => false,
        }
    }
}

/// Progress numbers reported alongside a status
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadState {
    /// Percentage 0-100
    pub progress: f64,
    /// Estimated seconds remaining
    pub rest_time: f64,
    /// Bytes per second
    pub speed: f64,
}

impl UploadState {
    pub fn complete(speed: f64) -> Self {
        Self {
            progress: 100.0,
            rest_time: 0.0,
            speed,
        }
    }
}

/// Receives status updates for one upload
pub trait ProgressObserver: Send + Sync {
    fn on_update(&self, status: UploadStatus, state: &UploadState);
}

/// Observer wrapping a closure
pub struct FnObserver<F> {
    callback: F,
}

impl<F> FnObserver<F>
where
    F: Fn(UploadStatus, &UploadState) + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> ProgressObserver for FnObserver<F>
where
    F: Fn(UploadStatus, &UploadState) + Send + Sync,
{
    fn on_update(&self, status: UploadStatus, state: &UploadState) {
        (self.callback)(status, state)
    }
}

/// Events delivered through [`event_stream`]
#[derive(Debug, Clone)]
pub enum UploadEvent {
    Progress {
        status: UploadStatus,
        state: UploadState,
    },
    Completed(FileRecord),
    Failed(String),
}

impl UploadEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, UploadEvent::Progress { .. })
    }
}

/// Observer that forwards updates into an unbounded channel
#[derive(Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<UploadEvent>,
}

impl ChannelObserver {
    /// Send the terminal event; the stream ends once every sender is dropped
    pub fn finish(&self, outcome: Result<FileRecord, String>) {
        let event = match outcome {
            Ok(record) => UploadEvent::Completed(record),
            Err(message) => UploadEvent::Failed(message),
        };
        let _ = self.tx.send(event);
    }
}

impl ProgressObserver for ChannelObserver {
    fn on_update(&self, status: UploadStatus, state: &UploadState) {
        // A dropped receiver means nobody is listening any more
        let _ = self.tx.send(UploadEvent::Progress {
            status,
            state: *state,
        });
    }
}

/// Create an observer and the lazy event stream it feeds
pub fn event_stream() -> (ChannelObserver, UnboundedReceiverStream<UploadEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelObserver { tx }, UnboundedReceiverStream::new(rx))
}

/// Enforces the upload state machine in front of an observer
pub struct UploadTracker<'a> {
    observer: &'a dyn ProgressObserver,
    status: Mutex<UploadStatus>,
}

impl<'a> UploadTracker<'a> {
    /// Start tracking; emits `Queued`
    pub fn new(observer: &'a dyn ProgressObserver) -> Self {
        observer.on_update(UploadStatus::Queued, &UploadState::default());
        Self {
            observer,
            status: Mutex::new(UploadStatus::Queued),
        }
    }

    pub fn status(&self) -> UploadStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move to `next` and notify. Illegal transitions are dropped.
    pub fn transition(&self, next: UploadStatus, state: UploadState) -> bool {
        let mut current = self.status.lock().unwrap_or_else(|e| e.into_inner());
        if !current.can_transition(next) {
            warn!(from = ?*current, to = ?next, "Ignoring illegal upload status transition");
            return false;
        }
        *current = next;
        drop(current);

        trace!(status = ?next, progress = state.progress, "Upload status update");
        self.observer.on_update(next, &state);
        true
    }

    pub fn fail(&self) {
        self.transition(UploadStatus::Error, UploadState::default());
    }
}

/// Computes speed and remaining time for a transfer
#[derive(Debug, Clone)]
pub struct RateTracker {
    started: Instant,
    total: u64,
}

impl RateTracker {
    pub fn new(total: u64) -> Self {
        Self {
            started: Instant::now(),
            total,
        }
    }

    /// Progress for `transferred` bytes. `cap_at_complete` holds a finished
    /// byte count at 99.9% until the remote confirms.
    pub fn state(&self, transferred: u64, cap_at_complete: bool) -> UploadState {
        let elapsed = self.started.elapsed().as_secs_f64();
        compute_state(transferred, self.total, elapsed, cap_at_complete)
    }

    /// Average speed over the whole transfer
    pub fn average_speed(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.total as f64 / elapsed
        } else {
            0.0
        }
    }
}

fn compute_state(transferred: u64, total: u64, elapsed_secs: f64, cap_at_complete: bool) -> UploadState {
    let mut progress = if total == 0 {
        100.0
    } else {
        ((transferred as f64 / total as f64) * 1000.0).round() / 10.0
    };
    if cap_at_complete && progress >= 100.0 {
        progress = 99.9;
    }

    let speed = if elapsed_secs > 0.0 {
        transferred as f64 / elapsed_secs
    } else {
        0.0
    };
    let rest_time = if speed > 0.0 {
        total.saturating_sub(transferred) as f64 / speed
    } else {
        0.0
    };

    UploadState {
        progress,
        rest_time,
        speed,
    }
}
