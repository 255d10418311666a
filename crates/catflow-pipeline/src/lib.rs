//! Error handlers, restart controller and stage pipeline for VASP jobs.
//!
//! This crate implements the catflow runner: priority-ordered handler
//! dispatch over classified log errors, the bounded per-job restart loop,
//! protocol templates, the convergence-gated stage loop with checkpoint and
//! resume, ENCUT / KSPACING convergence sweeps and the charged/discharged
//! cathode workflow.

pub mod cathode;
pub mod checkpoint;
pub mod collaborators;
pub mod config;
pub mod convergence;
pub mod derive;
pub mod engine;
pub mod events;
pub mod handler;
pub mod handlers;
pub mod protocol;
pub mod restart;
pub mod sweep;

pub use cathode::{
    cathode_properties, Anode, CalculatedState, CathodeOutcome, CathodeProperties,
    CathodeWorkflow,
};
pub use checkpoint::{
    checkpoint_path, clear_checkpoint, list_checkpoints, load_checkpoint, save_checkpoint,
    PipelineCheckpoint,
};
pub use collaborators::{
    Collaborators, JobSpec, JobSubmitter, LogRetriever, ParameterDeriver, ResultParser,
};
pub use config::PipelineConfig;
pub use convergence::{check_convergence, ConvergenceCheck, Criterion};
pub use derive::{remap_per_kind, HubbardSet, VaspDeriver, PER_KIND};
pub use engine::{PipelineExecutor, PipelineResult, PipelineState, StageResult};
pub use events::{EventEmitter, PipelineEvent, RunEvent, DEFAULT_RUN};
pub use handler::{
    DispatchOutcome, ErrorHandler, HandlerAction, HandlerDescriptor, HandlerRegistry,
    RestartDirective, APPLY_PENDING,
};
pub use handlers::{default_registry, SignatureHandler, BUILTIN_HANDLERS};
pub use protocol::{EscalationPolicy, ProtocolTemplate, StagePlan, DEFAULT_CARRY_OVER};
pub use restart::{InspectionRecord, JobLifecycle, JobPhase, JobState, RestartController};
pub use sweep::{
    identify_convergence, ConvergedSettings, ConvergenceSweep, SweepParameter, SweepResult,
};
