//! Error handler trait, handler registry, and priority-ordered dispatch.

use serde::{Deserialize, Serialize};

use catflow_catalog::ClassifiedErrors;
use catflow_types::{CatflowError, Modifications, Result};

use crate::restart::JobState;

/// Name reported when dispatch short-circuits to apply carried-over
/// modifications instead of consulting handlers.
pub const APPLY_PENDING: &str = "apply_pending_modifications";

// ---------------------------------------------------------------------------
// ErrorHandler trait
// ---------------------------------------------------------------------------

/// A corrective action for one family of job failures.
///
/// Handlers see the job state as it was before the current inspection cycle;
/// nothing they return is visible to later handlers of the same cycle.
pub trait ErrorHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this handler applies to the classified errors of the last attempt.
    fn matches(&self, errors: &ClassifiedErrors, state: &JobState) -> bool;

    /// Parameter overrides (and possibly a restart directive) to apply before
    /// the next submission. Only called when [`matches`](Self::matches) is true.
    fn act(&self, errors: &ClassifiedErrors, state: &JobState) -> HandlerAction;
}

/// What to do with the restart reference of the next submission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartDirective {
    /// Leave the restart reference untouched.
    #[default]
    Keep,
    /// Restart from the outputs of the attempt that just failed.
    FromLastAttempt,
    /// Start from scratch.
    Clear,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerAction {
    pub modifications: Modifications,
    pub restart: RestartDirective,
}

impl HandlerAction {
    pub fn modify(modifications: Modifications) -> Self {
        Self {
            modifications,
            restart: RestartDirective::Keep,
        }
    }

    pub fn restart_from_last_attempt() -> Self {
        Self {
            modifications: Modifications::new(),
            restart: RestartDirective::FromLastAttempt,
        }
    }

    pub fn with_restart(mut self, restart: RestartDirective) -> Self {
        self.restart = restart;
        self
    }
}

// ---------------------------------------------------------------------------
// DispatchOutcome
// ---------------------------------------------------------------------------

/// Result of running the registry over one inspection cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchOutcome {
    /// `true` if at least one handler fired and the job should be resubmitted.
    pub retry: bool,
    /// Merged modifications of every fired handler, last writer wins.
    pub modifications: Modifications,
    pub restart: RestartDirective,
    /// Names of fired handlers in execution order.
    pub fired: Vec<String>,
}

impl DispatchOutcome {
    pub fn no_action() -> Self {
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

struct HandlerEntry {
    priority: i32,
    enabled: bool,
    seq: usize,
    handler: Box<dyn ErrorHandler>,
}

/// Summary of one registered handler, for listing and configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerDescriptor {
    pub name: String,
    pub priority: i32,
    pub enabled: bool,
}

/// Handlers kept in ascending priority; equal priorities keep registration order.
#[derive(Default)]
pub struct HandlerRegistry {
    entries: Vec<HandlerEntry>,
    next_seq: usize,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, priority: i32, enabled: bool, handler: impl ErrorHandler + 'static) {
        self.entries.push(HandlerEntry {
            priority,
            enabled,
            seq: self.next_seq,
            handler: Box::new(handler),
        });
        self.next_seq += 1;
        self.entries.sort_by_key(|e| (e.priority, e.seq));
    }

    /// Enable or disable a registered handler by name.
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> Result<()> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.handler.name() == name)
            .ok_or_else(|| CatflowError::Other(format!("Unknown handler '{name}'")))?;
        entry.enabled = enabled;
        Ok(())
    }

    pub fn has(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.handler.name() == name)
    }

    pub fn is_enabled(&self, name: &str) -> Option<bool> {
        self.entries
            .iter()
            .find(|e| e.handler.name() == name)
            .map(|e| e.enabled)
    }

    /// All handlers in dispatch order.
    pub fn descriptors(&self) -> Vec<HandlerDescriptor> {
        self.entries
            .iter()
            .map(|e| HandlerDescriptor {
                name: e.handler.name().to_string(),
                priority: e.priority,
                enabled: e.enabled,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run enabled handlers in ascending priority over one inspection cycle.
    ///
    /// Modifications still pending from an earlier cycle take precedence: they
    /// are returned as a plain retry and no handler is consulted.
    pub fn dispatch(&self, errors: &ClassifiedErrors, state: &JobState) -> DispatchOutcome {
        if !state.pending.is_empty() {
            tracing::debug!(keys = state.pending.len(), "Applying pending modifications");
            return DispatchOutcome {
                retry: true,
                modifications: state.pending.clone(),
                restart: RestartDirective::Keep,
                fired: vec![APPLY_PENDING.to_string()],
            };
        }

        let mut outcome = DispatchOutcome::no_action();
        for entry in self.entries.iter().filter(|e| e.enabled) {
            if !entry.handler.matches(errors, state) {
                continue;
            }
            let action = entry.handler.act(errors, state);
            let keys: Vec<&String> = action.modifications.keys().collect();
            tracing::info!(
                handler = entry.handler.name(),
                priority = entry.priority,
                keys = ?keys,
                "Error handler fired"
            );
            outcome.modifications.merge(action.modifications);
            if action.restart != RestartDirective::Keep {
                outcome.restart = action.restart;
            }
            outcome.fired.push(entry.handler.name().to_string());
            outcome.retry = true;
        }
        outcome
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
