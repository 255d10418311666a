//! Pipeline execution engine: the stage loop.
//!
//! Each stage attempt goes through derive parameters, one restart-controller
//! lifecycle, result parsing and the convergence gate. A converged stage
//! advances the pipeline, an unconverged one is escalated and retried up to
//! the stage cap, and any fatal job outcome aborts the run.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use catflow_catalog::SignatureCatalog;
use catflow_types::{
    AbortReason, CalcType, CatflowError, Modifications, OutputHandle, Parameters, Result,
    StageRole, StageTag, Structure, StructuredResult,
};

use crate::checkpoint::{clear_checkpoint, save_checkpoint, PipelineCheckpoint};
use crate::collaborators::Collaborators;
use crate::config::PipelineConfig;
use crate::convergence::check_convergence;
use crate::derive::{remap_per_kind, VaspDeriver};
use crate::events::{EventEmitter, PipelineEvent, DEFAULT_RUN};
use crate::handler::HandlerRegistry;
use crate::handlers::default_registry;
use crate::protocol::{ProtocolTemplate, StagePlan};
use crate::restart::{JobState, RestartController};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// The converged outcome of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub tag: StageTag,
    pub calc_type: CalcType,
    pub role: StageRole,
    /// Stage attempts including the converged one.
    pub attempts: usize,
    /// Parameters of the converged job.
    pub parameters: Parameters,
    pub result: StructuredResult,
    pub outputs: OutputHandle,
}

impl StageResult {
    /// `"{tag}_{calc_type}"`, e.g. `stage_2_static`.
    pub fn label(&self) -> String {
        format!("{}_{}", self.tag, self.calc_type)
    }
}

/// Everything a run carries from stage to stage. Owned by one run and
/// checkpointed between stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    /// Run id; names the checkpoint file and tags emitted events.
    #[serde(default = "default_run")]
    pub run: String,
    /// Kind order of the structure the run started from. Per-kind lists in
    /// the template are written for this order.
    #[serde(default)]
    pub template_kinds: Vec<String>,
    pub results: BTreeMap<StageTag, StageResult>,
    /// The stage being worked on.
    pub current: StageTag,
    pub structure: Structure,
    /// Parameters of the most recent attempt, whichever stage it belonged to.
    pub previous_parameters: Option<Parameters>,
    /// Outputs the next submission restarts from.
    pub restart: Option<OutputHandle>,
    /// Unconverged attempts of the current stage so far.
    pub stage_attempts: usize,
    /// Escalation waiting to be applied to the next attempt of the current stage.
    pub escalation: Modifications,
    pub failed: bool,
}

fn default_run() -> String {
    DEFAULT_RUN.to_string()
}

impl PipelineState {
    pub fn new(run: impl Into<String>, structure: Structure) -> Self {
        Self {
            run: run.into(),
            template_kinds: structure.kinds().into_iter().map(String::from).collect(),
            results: BTreeMap::new(),
            current: StageTag::FIRST,
            structure,
            previous_parameters: None,
            restart: None,
            stage_attempts: 0,
            escalation: Modifications::new(),
            failed: false,
        }
    }
}

/// The result of a finished pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub run: String,
    pub succeeded: bool,
    pub stage_results: BTreeMap<StageTag, StageResult>,
    pub final_structure: Structure,
    pub abort_reason: Option<AbortReason>,
}

impl PipelineResult {
    pub fn stage(&self, tag: StageTag) -> Option<&StageResult> {
        self.stage_results.get(&tag)
    }

    /// Stage results keyed by their `"{tag}_{calc_type}"` label.
    pub fn labelled(&self) -> BTreeMap<String, &StageResult> {
        self.stage_results
            .values()
            .map(|r| (r.label(), r))
            .collect()
    }

    fn from_state(state: PipelineState, abort_reason: Option<AbortReason>) -> Self {
        Self {
            run: state.run,
            succeeded: !state.failed,
            stage_results: state.results,
            final_structure: state.structure,
            abort_reason,
        }
    }
}

// ---------------------------------------------------------------------------
// PipelineExecutor
// ---------------------------------------------------------------------------

/// Drives protocol templates through the stage loop. Holds only shared,
/// read-only pieces, so one executor can serve many concurrent runs.
pub struct PipelineExecutor {
    collaborators: Collaborators,
    registry: Arc<HandlerRegistry>,
    catalog: Arc<SignatureCatalog>,
    events: EventEmitter,
    cancel: CancellationToken,
    checkpoint_dir: Option<PathBuf>,
}

impl PipelineExecutor {
    /// An executor with the built-in handlers and signature catalog.
    pub fn new(collaborators: Collaborators) -> Self {
        Self {
            collaborators,
            registry: Arc::new(default_registry()),
            catalog: Arc::new(SignatureCatalog::builtin().clone()),
            events: EventEmitter::default(),
            cancel: CancellationToken::new(),
            checkpoint_dir: None,
        }
    }

    /// An executor with handler overrides, catalog and checkpoint directory
    /// taken from `config`. A configured Hubbard set replaces the deriver
    /// with a DFT+U [`VaspDeriver`].
    pub fn from_config(mut collaborators: Collaborators, config: &PipelineConfig) -> Result<Self> {
        if let Some(hubbard) = config.load_hubbard()? {
            collaborators.deriver = Arc::new(VaspDeriver::new().with_hubbard(hubbard));
        }
        let mut registry = default_registry();
        config.apply_handler_overrides(&mut registry)?;
        let catalog = config.load_catalog()?;
        let mut executor = Self::new(collaborators)
            .with_registry(registry)
            .with_catalog(catalog);
        executor.checkpoint_dir = config.checkpoint_dir.clone();
        Ok(executor)
    }

    pub fn with_registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_catalog(mut self, catalog: SignatureCatalog) -> Self {
        self.catalog = Arc::new(catalog);
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run `template` from its first stage under the default run id.
    ///
    /// Domain failures end with `Ok` and `succeeded == false`; `Err` is
    /// returned for invalid templates or caps and for collaborator failures.
    pub async fn run(
        &self,
        template: &ProtocolTemplate,
        structure: Structure,
        parameters: &Parameters,
        stage_cap: usize,
        job_cap: usize,
    ) -> Result<PipelineResult> {
        self.run_named(DEFAULT_RUN, template, structure, parameters, stage_cap, job_cap)
            .await
    }

    /// [`run`](Self::run) under run id `run`. Concurrent runs on one
    /// executor need distinct ids to keep their checkpoints apart.
    pub async fn run_named(
        &self,
        run: &str,
        template: &ProtocolTemplate,
        structure: Structure,
        parameters: &Parameters,
        stage_cap: usize,
        job_cap: usize,
    ) -> Result<PipelineResult> {
        let specialized = template.specialize(&structure, parameters);
        self.drive(&specialized, PipelineState::new(run, structure), stage_cap, job_cap)
            .await
    }

    /// Continue a run from a checkpoint. `template` and `parameters` must be
    /// the ones the run was started with.
    pub async fn resume(
        &self,
        template: &ProtocolTemplate,
        parameters: &Parameters,
        checkpoint: PipelineCheckpoint,
        stage_cap: usize,
        job_cap: usize,
    ) -> Result<PipelineResult> {
        let state = checkpoint.state;
        if state.failed {
            return Err(CatflowError::Other(
                "cannot resume a pipeline that already failed".into(),
            ));
        }
        tracing::info!(
            run = %state.run,
            stage = %state.current,
            checkpoint = %checkpoint.timestamp,
            "Resuming pipeline from checkpoint"
        );
        let specialized = template.specialize(&state.structure, parameters);
        self.drive(&specialized, state, stage_cap, job_cap).await
    }

    async fn drive(
        &self,
        template: &ProtocolTemplate,
        mut state: PipelineState,
        stage_cap: usize,
        job_cap: usize,
    ) -> Result<PipelineResult> {
        if job_cap == 0 {
            return Err(CatflowError::InvalidParameter {
                key: "job_cap".into(),
                message: "must allow at least one submission".into(),
            });
        }
        let plan = template.plan()?;
        let started = Instant::now();
        let events = self.events.for_run(&state.run);

        tracing::info!(
            run = %state.run,
            protocol = template.name.as_deref().unwrap_or("unnamed"),
            stages = plan.len(),
            "Pipeline started"
        );
        events.emit(PipelineEvent::PipelineStarted {
            stage_count: plan.len(),
        });

        while let Some(stage) = plan.get(state.current.index() as usize) {
            if self.cancel.is_cancelled() {
                return Ok(abort(&events, state, AbortReason::Cancelled {
                    stage: Some(stage.tag),
                }));
            }

            let parameters = self.derive_parameters(template, stage, &mut state, &events)?;
            let attempt = state.stage_attempts + 1;
            tracing::info!(
                stage = %stage.tag,
                calc_type = %stage.calc_type,
                role = ?stage.role,
                attempt,
                "Stage started"
            );
            events.emit(PipelineEvent::StageStarted {
                stage: stage.tag,
                calc_type: stage.calc_type,
                role: stage.role,
                attempt,
            });

            let controller = RestartController::new(
                self.collaborators.submitter.as_ref(),
                self.collaborators.logs.as_ref(),
                &self.catalog,
                &self.registry,
                &events,
                job_cap,
            )
            .with_cancellation(self.cancel.clone());
            let lifecycle = controller
                .run(
                    stage.tag,
                    &stage.label(),
                    &state.structure,
                    JobState::new(parameters, state.restart.clone()),
                )
                .await?;

            if let Some(reason) = lifecycle.abort {
                return Ok(abort(&events, state, reason));
            }
            let outputs = lifecycle.outputs.ok_or_else(|| {
                CatflowError::collaborator("submitter", "finished job reported no outputs")
            })?;
            let result = self.collaborators.parser.parse(&outputs).await?;

            state.previous_parameters = Some(lifecycle.parameters.clone());
            state.restart = Some(outputs.clone());

            let check = check_convergence(stage, &result);
            if !check.converged {
                state.stage_attempts += 1;
                tracing::warn!(
                    stage = %stage.tag,
                    attempt = state.stage_attempts,
                    criterion = ?check.criterion,
                    "Stage not converged"
                );
                events.emit(PipelineEvent::StageNotConverged {
                    stage: stage.tag,
                    attempt: state.stage_attempts,
                });
                let cap = stage.stage_cap.unwrap_or(stage_cap);
                if state.stage_attempts > cap {
                    let attempts = state.stage_attempts;
                    return Ok(abort(&events, state, AbortReason::NonConvergence {
                        stage: stage.tag,
                        attempts,
                    }));
                }
                state.escalation = template
                    .escalation
                    .escalate(stage.calc_type, &lifecycle.parameters);
                continue;
            }

            if stage.calc_type == CalcType::Relaxation {
                if let Some(relaxed) = &result.structure {
                    state.structure = relaxed.clone();
                }
            }
            let attempts = state.stage_attempts + 1;
            tracing::info!(stage = %stage.tag, attempts, "Stage converged");
            events.emit(PipelineEvent::StageConverged {
                stage: stage.tag,
                attempts,
            });
            state.results.insert(
                stage.tag,
                StageResult {
                    tag: stage.tag,
                    calc_type: stage.calc_type,
                    role: stage.role,
                    attempts,
                    parameters: lifecycle.parameters,
                    result,
                    outputs,
                },
            );
            state.current = stage.tag.next();
            state.stage_attempts = 0;
            state.escalation = Modifications::new();

            if let Some(dir) = &self.checkpoint_dir {
                let checkpoint = PipelineCheckpoint::new(template.name.clone(), state.clone());
                save_checkpoint(&checkpoint, dir).await?;
                events.emit(PipelineEvent::CheckpointSaved { stage: stage.tag });
            }
        }

        if let Some(dir) = &self.checkpoint_dir {
            clear_checkpoint(dir, &state.run).await?;
        }
        let completed_stages: Vec<StageTag> = state.results.keys().copied().collect();
        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            run = %state.run,
            stages = completed_stages.len(),
            duration_ms,
            "Pipeline completed"
        );
        events.emit(PipelineEvent::PipelineCompleted {
            completed_stages,
            duration_ms,
        });
        Ok(PipelineResult::from_state(state, None))
    }

    /// Template block, re-sorted structure and re-derived ordering-dependent
    /// inputs, carry-over from the previous attempt, then pending escalation.
    fn derive_parameters(
        &self,
        template: &ProtocolTemplate,
        stage: &StagePlan,
        state: &mut PipelineState,
        events: &EventEmitter,
    ) -> Result<Parameters> {
        let block = template.stage(stage.tag).ok_or_else(|| {
            CatflowError::ProtocolError(format!("protocol has no {}", stage.tag))
        })?;

        if state.structure.needs_sort() {
            state.structure = state.structure.sorted();
            state.restart = None;
            tracing::info!(stage = %stage.tag, "Structure re-sorted; restart reference dropped");
            events.emit(PipelineEvent::StructureSorted { stage: stage.tag });
        }

        // Per-kind lists follow the kind order the template was written for.
        let kinds = state.structure.kinds();
        let reordered;
        let block = if state.template_kinds.is_empty()
            || state.template_kinds.iter().map(String::as_str).eq(kinds.iter().copied())
        {
            block
        } else {
            reordered = remap_per_kind(block, &state.template_kinds, &kinds)?;
            &reordered
        };

        let mut parameters = self
            .collaborators
            .deriver
            .derive(&state.structure, block)?;
        if let Some(previous) = &state.previous_parameters {
            template.carry_over(&mut parameters, previous);
        }
        Ok(parameters.apply(&state.escalation))
    }
}

fn abort(events: &EventEmitter, mut state: PipelineState, reason: AbortReason) -> PipelineResult {
    state.failed = true;
    tracing::error!(
        run = %state.run,
        reason = %reason,
        remedy = reason.remedy(),
        "Pipeline aborted"
    );
    events.emit(PipelineEvent::PipelineAborted {
        reason: reason.clone(),
    });
    PipelineResult::from_state(state, Some(reason))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
