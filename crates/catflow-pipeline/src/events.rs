//! Pipeline event system for observability.
//!
//! Emits [`PipelineEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! external observers (loggers, dashboards, a sweep driver) can follow job
//! submissions, handler firings and stage transitions without coupling to the
//! engine internals. Every event travels in a [`RunEvent`] naming the run it
//! came from, so runs sharing one emitter stay distinguishable.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use catflow_types::{AbortReason, CalcType, JobHandle, StageRole, StageTag};

/// Run id used when a caller does not name the run.
pub const DEFAULT_RUN: &str = "pipeline";

/// Events emitted while a pipeline runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    PipelineStarted {
        stage_count: usize,
    },
    PipelineCompleted {
        completed_stages: Vec<StageTag>,
        duration_ms: u64,
    },
    PipelineAborted {
        reason: AbortReason,
    },
    StageStarted {
        stage: StageTag,
        calc_type: CalcType,
        role: StageRole,
        attempt: usize,
    },
    StageConverged {
        stage: StageTag,
        attempts: usize,
    },
    StageNotConverged {
        stage: StageTag,
        attempt: usize,
    },
    StructureSorted {
        stage: StageTag,
    },
    JobSubmitted {
        stage: StageTag,
        job: JobHandle,
        submission: usize,
    },
    JobFailed {
        stage: StageTag,
        job: JobHandle,
        errors: Vec<String>,
    },
    HandlerFired {
        stage: StageTag,
        handler: String,
    },
    ModificationsApplied {
        stage: StageTag,
        keys: Vec<String>,
    },
    CheckpointSaved {
        stage: StageTag,
    },
}

/// A [`PipelineEvent`] tagged with the run that emitted it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub run: String,
    #[serde(flatten)]
    pub event: PipelineEvent,
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<RunEvent>,
    run: Arc<str>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self {
            sender,
            run: Arc::from(DEFAULT_RUN),
        }
    }

    /// An emitter on the same channel whose events are tagged with `run`.
    pub fn for_run(&self, run: &str) -> Self {
        Self {
            sender: self.sender.clone(),
            run: Arc::from(run),
        }
    }

    pub fn run(&self) -> &str {
        &self.run
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.sender.send(RunEvent {
            run: self.run.to_string(),
            event,
        });
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
