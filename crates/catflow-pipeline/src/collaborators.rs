//! Narrow interfaces to the systems a pipeline drives but does not implement:
//! job transport, log retrieval, output parsing and input derivation.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use catflow_types::{
    JobCompletion, JobHandle, OutputHandle, Parameters, Result, Structure, StructuredResult,
};

use crate::derive::VaspDeriver;

/// Everything needed to submit one job attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Human-readable label, e.g. `stage_1_relaxation`.
    pub label: String,
    pub parameters: Parameters,
    pub structure: Structure,
    /// Outputs of an earlier attempt to restart from (wavefunction, charge).
    pub restart: Option<OutputHandle>,
}

#[async_trait]
pub trait JobSubmitter: Send + Sync {
    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle>;

    /// Wait until the job leaves the queue. This is the only place a pipeline
    /// suspends for any length of time.
    async fn await_completion(&self, job: &JobHandle) -> Result<JobCompletion>;

    /// Best-effort cancellation of an in-flight job.
    async fn cancel(&self, _job: &JobHandle) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait LogRetriever: Send + Sync {
    /// Scheduler stdout of a finished job, or `None` if it was not retrieved.
    async fn open_stdout(&self, job: &JobHandle) -> Result<Option<String>>;

    /// Scheduler stderr of a finished job, or `None` if it was not retrieved.
    async fn open_stderr(&self, job: &JobHandle) -> Result<Option<String>>;
}

#[async_trait]
pub trait ResultParser: Send + Sync {
    async fn parse(&self, outputs: &OutputHandle) -> Result<StructuredResult>;
}

/// Recomputes ordering-dependent inputs after the structure changed order.
pub trait ParameterDeriver: Send + Sync {
    fn derive(&self, structure: &Structure, parameters: &Parameters) -> Result<Parameters>;
}

/// The set of collaborators one pipeline run talks to. Cloning is cheap and
/// shares the underlying implementations.
#[derive(Clone)]
pub struct Collaborators {
    pub submitter: Arc<dyn JobSubmitter>,
    pub logs: Arc<dyn LogRetriever>,
    pub parser: Arc<dyn ResultParser>,
    pub deriver: Arc<dyn ParameterDeriver>,
}

impl Collaborators {
    /// Bundle the three required collaborators with a [`VaspDeriver`] without a
    /// Hubbard set as the parameter deriver.
    pub fn new(
        submitter: Arc<dyn JobSubmitter>,
        logs: Arc<dyn LogRetriever>,
        parser: Arc<dyn ResultParser>,
    ) -> Self {
        Self {
            submitter,
            logs,
            parser,
            deriver: Arc::new(VaspDeriver::new()),
        }
    }

    pub fn with_deriver(mut self, deriver: Arc<dyn ParameterDeriver>) -> Self {
        self.deriver = deriver;
        self
    }
}
