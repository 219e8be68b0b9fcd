//! Stage/percentage progress reporting.
//!
//! Every generation emits an ordered sequence of [`ProgressEvent`]s through a
//! [`ProgressReporter`]. Callers that want the events create the reporter with
//! [`ProgressReporter::channel`] and read them from the returned
//! [`ProgressStream`].
//!
//! The reporter enforces the contract for a single job:
//! - percentages never decrease,
//! - stages never move backwards,
//! - at most one terminal event ([`Stage::Succeeded`] or [`Stage::Failed`]) is delivered.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

/// A named point in a generation's lifecycle, in lifecycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Generation accepted, nothing sent yet.
    Starting,
    /// Building and sending the request.
    Requesting,
    /// Remote job submitted, waiting for it to start.
    Pending,
    /// Remote work in progress.
    Running,
    /// Response received, extracting the result.
    Processing,
    /// Terminal: an image is available.
    Succeeded,
    /// Terminal: generation failed.
    Failed,
}

impl Stage {
    /// Returns true for `Succeeded` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Returns the lowercase name of the stage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Requesting => "requesting",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One progress notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Current stage.
    pub stage: Stage,
    /// Completion percentage (0-100), if the stage carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<u8>,
}

impl ProgressEvent {
    /// Creates an event.
    pub fn new(stage: Stage, percent: impl Into<Option<u8>>) -> Self {
        Self {
            stage,
            percent: percent.into(),
        }
    }
}

#[derive(Debug, Default)]
struct ReporterState {
    last_stage: Option<Stage>,
    high_water: u8,
    finished: bool,
}

/// Sending half of a job's progress stream.
///
/// Cheap to clone; clones share the same job state. Create one reporter per
/// job so each job starts its own percentage sequence at zero.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
    state: Arc<Mutex<ReporterState>>,
}

impl ProgressReporter {
    /// Creates a reporter and the stream its events are delivered to.
    pub fn channel() -> (Self, ProgressStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let reporter = Self {
            tx: Some(tx),
            state: Arc::default(),
        };
        (reporter, ProgressStream { rx })
    }

    /// Creates a reporter that tracks state but delivers events nowhere.
    pub fn noop() -> Self {
        Self {
            tx: None,
            state: Arc::default(),
        }
    }

    /// Emits an event, normalizing it against what this job already reported.
    ///
    /// Percentages lower than the highest one seen are raised to it, stage
    /// regressions are dropped, and nothing is delivered after a terminal event.
    /// Returns whether the event was delivered.
    pub fn emit(&self, stage: Stage, percent: impl Into<Option<u8>>) -> bool {
        let event = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.finished {
                tracing::trace!(%stage, "dropping progress after terminal event");
                return false;
            }
            if stage != Stage::Failed && state.last_stage.is_some_and(|last| stage < last) {
                tracing::debug!(%stage, "dropping out-of-order progress stage");
                return false;
            }

            let percent = percent.into().map(|p| p.min(100).max(state.high_water));
            if let Some(p) = percent {
                state.high_water = p;
            }
            state.last_stage = Some(stage);
            state.finished = stage.is_terminal();
            ProgressEvent { stage, percent }
        };

        tracing::debug!(stage = %event.stage, percent = ?event.percent, "progress");
        if let Some(tx) = &self.tx {
            // A caller that stopped listening must not break generation.
            let _ = tx.send(event);
        }
        true
    }

    /// Emits the terminal `Failed` event unless a terminal event was already emitted.
    pub fn fail(&self) -> bool {
        self.emit(Stage::Failed, None)
    }

    /// Returns true once a terminal event has been emitted.
    pub fn is_finished(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .finished
    }

    /// Returns the highest percentage reported so far.
    pub fn percent(&self) -> u8 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .high_water
    }
}

/// Receiving half of a job's progress stream.
#[derive(Debug)]
pub struct ProgressStream {
    rx: mpsc::UnboundedReceiver<ProgressEvent>,
}

impl ProgressStream {
    /// Waits for the next event. Returns `None` once every reporter is dropped
    /// and all events were read.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    /// Returns the next already-delivered event without waiting.
    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        self.rx.try_recv().ok()
    }

    /// Drains every event delivered so far.
    pub fn drain(&mut self) -> Vec<ProgressEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
