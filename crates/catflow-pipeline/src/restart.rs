//! Bounded restart loop for a single job.
//!
//! A [`RestartController`] drives one stage attempt through
//! submit, await, classify, dispatch and apply until the job succeeds, no
//! handler can help, or the submission cap is reached.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use catflow_catalog::{classify, ClassifiedErrors, SignatureCatalog};
use catflow_types::{
    AbortReason, CatflowError, JobHandle, LogStream, Modifications, OutputHandle, Parameters,
    Result, StageTag, Structure,
};

use crate::collaborators::{JobSpec, JobSubmitter, LogRetriever};
use crate::events::{EventEmitter, PipelineEvent};
use crate::handler::{HandlerRegistry, RestartDirective};

// ---------------------------------------------------------------------------
// JobState
// ---------------------------------------------------------------------------

/// Mutable state of one stage attempt, owned by its controller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    /// Parameters of the next submission.
    pub parameters: Parameters,
    /// Outputs to restart the next submission from.
    pub restart: Option<OutputHandle>,
    /// Modifications accumulated but not yet applied.
    #[serde(default)]
    pub pending: Modifications,
    /// Consecutive inspection cycles in which each signature was seen.
    #[serde(default)]
    pub error_counts: BTreeMap<String, u32>,
    /// Submissions made so far.
    #[serde(default)]
    pub iteration: usize,
    /// Outputs of the most recent finished submission.
    #[serde(default)]
    pub last_outputs: Option<OutputHandle>,
}

impl JobState {
    pub fn new(parameters: Parameters, restart: Option<OutputHandle>) -> Self {
        Self {
            parameters,
            restart,
            ..Default::default()
        }
    }

    /// How many consecutive cycles `signature` has been seen, including the
    /// current one once it has been recorded.
    pub fn occurrences(&self, signature: &str) -> u32 {
        self.error_counts.get(signature).copied().unwrap_or(0)
    }

    /// Bump counters of the signatures present in this cycle and reset those
    /// that are absent.
    pub fn record_errors(&mut self, errors: &ClassifiedErrors) {
        self.error_counts.retain(|name, _| errors.contains(name));
        for name in errors.iter() {
            *self.error_counts.entry(name.to_string()).or_insert(0) += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Lifecycle record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Pending,
    Running,
    Inspecting,
    ModificationPending,
    Converged,
    FatalFailure,
}

/// What one inspection cycle found and did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectionRecord {
    pub submission: usize,
    pub job: JobHandle,
    pub errors: Vec<String>,
    pub fired: Vec<String>,
    pub modifications: Modifications,
}

/// Outcome of a full controller run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLifecycle {
    /// Either [`JobPhase::Converged`] or [`JobPhase::FatalFailure`].
    pub phase: JobPhase,
    pub abort: Option<AbortReason>,
    /// Parameters of the last submission actually made.
    pub parameters: Parameters,
    pub submissions: usize,
    /// Outputs of the last finished submission.
    pub outputs: Option<OutputHandle>,
    pub history: Vec<InspectionRecord>,
}

impl JobLifecycle {
    pub fn succeeded(&self) -> bool {
        self.phase == JobPhase::Converged
    }
}

// ---------------------------------------------------------------------------
// RestartController
// ---------------------------------------------------------------------------

pub struct RestartController<'a> {
    submitter: &'a dyn JobSubmitter,
    logs: &'a dyn LogRetriever,
    catalog: &'a SignatureCatalog,
    registry: &'a HandlerRegistry,
    events: &'a EventEmitter,
    cancel: CancellationToken,
    job_cap: usize,
}

impl<'a> RestartController<'a> {
    pub fn new(
        submitter: &'a dyn JobSubmitter,
        logs: &'a dyn LogRetriever,
        catalog: &'a SignatureCatalog,
        registry: &'a HandlerRegistry,
        events: &'a EventEmitter,
        job_cap: usize,
    ) -> Self {
        Self {
            submitter,
            logs,
            catalog,
            registry,
            events,
            cancel: CancellationToken::new(),
            job_cap,
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run the job until it succeeds or fails fatally.
    ///
    /// Domain failures come back as a lifecycle in [`JobPhase::FatalFailure`];
    /// `Err` is reserved for collaborator errors and missing log streams.
    pub async fn run(
        &self,
        stage: StageTag,
        label: &str,
        structure: &Structure,
        mut state: JobState,
    ) -> Result<JobLifecycle> {
        if self.job_cap == 0 {
            return Err(CatflowError::InvalidParameter {
                key: "job_cap".into(),
                message: "must allow at least one submission".into(),
            });
        }

        let mut history = Vec::new();
        let mut submitted = state.parameters.clone();
        let mut in_flight: Option<JobHandle> = None;
        let mut phase = JobPhase::Pending;

        loop {
            match phase {
                JobPhase::Pending => {
                    if self.cancel.is_cancelled() {
                        return Ok(fatal(
                            AbortReason::Cancelled { stage: Some(stage) },
                            submitted,
                            &state,
                            history,
                        ));
                    }
                    let spec = JobSpec {
                        label: label.to_string(),
                        parameters: state.parameters.clone(),
                        structure: structure.clone(),
                        restart: state.restart.clone(),
                    };
                    let job = self.submitter.submit(&spec).await?;
                    state.iteration += 1;
                    submitted = spec.parameters;
                    tracing::info!(
                        stage = %stage,
                        job = %job,
                        submission = state.iteration,
                        "Job submitted"
                    );
                    self.events.emit(PipelineEvent::JobSubmitted {
                        stage,
                        job: job.clone(),
                        submission: state.iteration,
                    });
                    in_flight = Some(job);
                    phase = JobPhase::Running;
                }

                JobPhase::Running => {
                    let job = in_flight.clone().ok_or_else(|| {
                        CatflowError::Other("running phase without a submitted job".into())
                    })?;
                    let completion = tokio::select! {
                        _ = self.cancel.cancelled() => {
                            tracing::warn!(stage = %stage, job = %job, "Cancelling in-flight job");
                            if let Err(e) = self.submitter.cancel(&job).await {
                                tracing::warn!(
                                    stage = %stage,
                                    job = %job,
                                    error = %e,
                                    "Cancel request failed; job may still be running"
                                );
                            }
                            return Ok(fatal(
                                AbortReason::Cancelled { stage: Some(stage) },
                                submitted,
                                &state,
                                history,
                            ));
                        }
                        done = self.submitter.await_completion(&job) => done?,
                    };
                    state.last_outputs = Some(completion.outputs);
                    phase = if completion.succeeded {
                        JobPhase::Converged
                    } else {
                        JobPhase::Inspecting
                    };
                }

                JobPhase::Inspecting => {
                    let job = in_flight.take().ok_or_else(|| {
                        CatflowError::Other("inspecting phase without a finished job".into())
                    })?;
                    let errors = self.inspect(&job).await?;
                    state.record_errors(&errors);
                    let outcome = self.registry.dispatch(&errors, &state);
                    let error_names = errors.names();
                    tracing::warn!(
                        stage = %stage,
                        job = %job,
                        errors = ?error_names,
                        fired = ?outcome.fired,
                        "Job failed"
                    );
                    self.events.emit(PipelineEvent::JobFailed {
                        stage,
                        job: job.clone(),
                        errors: error_names.clone(),
                    });
                    for handler in &outcome.fired {
                        self.events.emit(PipelineEvent::HandlerFired {
                            stage,
                            handler: handler.clone(),
                        });
                    }
                    history.push(InspectionRecord {
                        submission: state.iteration,
                        job,
                        errors: error_names.clone(),
                        fired: outcome.fired.clone(),
                        modifications: outcome.modifications.clone(),
                    });

                    if !outcome.retry {
                        let reason = if errors.is_empty() {
                            AbortReason::UnclassifiedFailure { stage }
                        } else {
                            AbortReason::UnhandledErrors {
                                stage,
                                errors: error_names,
                            }
                        };
                        tracing::error!(stage = %stage, reason = %reason, "Job cannot be recovered");
                        return Ok(fatal(reason, submitted, &state, history));
                    }

                    state.pending = outcome.modifications;
                    match outcome.restart {
                        RestartDirective::Keep => {}
                        RestartDirective::FromLastAttempt => {
                            state.restart = state.last_outputs.clone();
                        }
                        RestartDirective::Clear => state.restart = None,
                    }
                    phase = JobPhase::ModificationPending;
                }

                JobPhase::ModificationPending => {
                    let pending = std::mem::take(&mut state.pending);
                    state.parameters = state.parameters.apply(&pending);
                    let keys: Vec<String> = pending.keys().cloned().collect();
                    tracing::debug!(stage = %stage, keys = ?keys, "Modifications applied");
                    self.events
                        .emit(PipelineEvent::ModificationsApplied { stage, keys });

                    if state.iteration >= self.job_cap {
                        tracing::error!(
                            stage = %stage,
                            submissions = state.iteration,
                            "Job iteration cap reached"
                        );
                        return Ok(fatal(
                            AbortReason::IterationCapExceeded {
                                stage,
                                submissions: state.iteration,
                            },
                            submitted,
                            &state,
                            history,
                        ));
                    }
                    phase = JobPhase::Pending;
                }

                JobPhase::Converged => {
                    tracing::info!(stage = %stage, submissions = state.iteration, "Job finished");
                    return Ok(JobLifecycle {
                        phase,
                        abort: None,
                        parameters: submitted,
                        submissions: state.iteration,
                        outputs: state.last_outputs,
                        history,
                    });
                }

                JobPhase::FatalFailure => {
                    return Err(CatflowError::Other(
                        "restart controller resumed after a fatal failure".into(),
                    ));
                }
            }
        }
    }

    async fn inspect(&self, job: &JobHandle) -> Result<ClassifiedErrors> {
        let stdout = self
            .logs
            .open_stdout(job)
            .await?
            .ok_or_else(|| CatflowError::MissingStream {
                job: job.to_string(),
                stream: LogStream::Stdout,
            })?;
        let stderr = self
            .logs
            .open_stderr(job)
            .await?
            .ok_or_else(|| CatflowError::MissingStream {
                job: job.to_string(),
                stream: LogStream::Stderr,
            })?;
        Ok(classify(&stdout, &stderr, self.catalog))
    }
}

fn fatal(
    reason: AbortReason,
    parameters: Parameters,
    state: &JobState,
    history: Vec<InspectionRecord>,
) -> JobLifecycle {
    JobLifecycle {
        phase: JobPhase::FatalFailure,
        abort: Some(reason),
        parameters,
        submissions: state.iteration,
        outputs: state.last_outputs.clone(),
        history,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
