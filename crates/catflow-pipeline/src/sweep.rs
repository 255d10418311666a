//! ENCUT / KSPACING convergence sweeps.
//!
//! One independent pipeline runs per sweep value, concurrently on a
//! [`JoinSet`]. The converged value is the first of a consecutive pair whose
//! energies per atom differ by less than the threshold.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use catflow_types::{CatflowError, Parameters, Result, StageTag, Structure};

use crate::engine::{PipelineExecutor, PipelineResult};
use crate::protocol::ProtocolTemplate;

/// Energy-per-atom threshold in eV/atom.
pub const DEFAULT_THRESHOLD: f64 = 1e-3;

const ENERGY_DIAGNOSTIC: &str = "final_energy_per_atom";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SweepParameter {
    Encut,
    Kspacing,
}

impl SweepParameter {
    pub fn key(self) -> &'static str {
        match self {
            SweepParameter::Encut => "ENCUT",
            SweepParameter::Kspacing => "KSPACING",
        }
    }

    /// ENCUT is swept upwards, KSPACING downwards; both directions make the
    /// calculation more accurate.
    fn ordered(self, values: &[f64]) -> Vec<f64> {
        let mut ordered = values.to_vec();
        ordered.sort_by(f64::total_cmp);
        if self == SweepParameter::Kspacing {
            ordered.reverse();
        }
        ordered.dedup();
        ordered
    }

    /// Run id of one sweep point, e.g. `encut_520` or `kspacing_0.3`.
    pub fn run_id(self, value: f64) -> String {
        match self {
            SweepParameter::Encut => format!("encut_{}", value.round() as i64),
            SweepParameter::Kspacing => format!("kspacing_{value}"),
        }
    }

    fn insert(self, parameters: &mut Parameters, value: f64) {
        match self {
            SweepParameter::Encut => parameters.insert(self.key(), value.round() as i64),
            SweepParameter::Kspacing => parameters.insert(self.key(), value),
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepResult {
    pub parameter: SweepParameter,
    /// Energy per atom for each value, in sweep order.
    pub energies: Vec<(f64, f64)>,
    /// First value of the first pair within the threshold.
    pub converged: Option<f64>,
    /// Second value of that pair.
    pub conservative: Option<f64>,
    /// Energy difference of that pair, or of the last pair when nothing
    /// converged.
    pub energy_difference: Option<f64>,
}

impl SweepResult {
    pub fn is_converged(&self) -> bool {
        self.converged.is_some()
    }
}

/// Scan consecutive pairs of `(value, energy_per_atom)` in sweep order.
pub fn identify_convergence(
    parameter: SweepParameter,
    energies: Vec<(f64, f64)>,
    threshold: f64,
) -> SweepResult {
    let mut result = SweepResult {
        parameter,
        energies,
        converged: None,
        conservative: None,
        energy_difference: None,
    };
    for pair in result.energies.windows(2) {
        let (v1, e1) = pair[0];
        let (v2, e2) = pair[1];
        let de = (e2 - e1).abs();
        result.energy_difference = Some(de);
        if de < threshold {
            result.converged = Some(v1);
            result.conservative = Some(v2);
            break;
        }
    }
    result
}

/// Converged settings from a full ENCUT then KSPACING sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergedSettings {
    pub encut: SweepResult,
    pub kspacing: SweepResult,
}

impl ConvergedSettings {
    /// `ENCUT` and `KSPACING` ready to merge into a production run.
    pub fn parameters(&self) -> Option<Parameters> {
        let encut = self.encut.converged?;
        let kspacing = self.kspacing.converged?;
        let mut params = Parameters::new();
        SweepParameter::Encut.insert(&mut params, encut);
        SweepParameter::Kspacing.insert(&mut params, kspacing);
        Some(params)
    }
}

pub struct ConvergenceSweep {
    executor: Arc<PipelineExecutor>,
    template: Arc<ProtocolTemplate>,
    structure: Structure,
    parameters: Parameters,
    stage_cap: usize,
    job_cap: usize,
    threshold: f64,
}

impl ConvergenceSweep {
    pub fn new(
        executor: Arc<PipelineExecutor>,
        template: ProtocolTemplate,
        structure: Structure,
        parameters: Parameters,
    ) -> Self {
        Self {
            executor,
            template: Arc::new(template),
            structure,
            parameters,
            stage_cap: 5,
            job_cap: 5,
            threshold: DEFAULT_THRESHOLD,
        }
    }

    pub fn with_caps(mut self, stage_cap: usize, job_cap: usize) -> Self {
        self.stage_cap = stage_cap;
        self.job_cap = job_cap;
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Run one pipeline per value of `parameter`, all at once.
    ///
    /// Any run that does not succeed fails the whole sweep.
    pub async fn run(&self, parameter: SweepParameter, values: &[f64]) -> Result<SweepResult> {
        self.run_with(parameter, values, &self.parameters).await
    }

    /// Sweep ENCUT, then sweep KSPACING at the converged ENCUT.
    pub async fn run_full(&self, encuts: &[f64], kspacings: &[f64]) -> Result<ConvergedSettings> {
        let encut = self.run(SweepParameter::Encut, encuts).await?;
        let converged_encut = encut.converged.ok_or_else(|| {
            CatflowError::Other(format!(
                "ENCUT sweep did not converge (last difference {:?} eV/atom, threshold {})",
                encut.energy_difference, self.threshold
            ))
        })?;
        let mut base = self.parameters.clone();
        SweepParameter::Encut.insert(&mut base, converged_encut);
        let kspacing = self
            .run_with(SweepParameter::Kspacing, kspacings, &base)
            .await?;
        Ok(ConvergedSettings { encut, kspacing })
    }

    async fn run_with(
        &self,
        parameter: SweepParameter,
        values: &[f64],
        base: &Parameters,
    ) -> Result<SweepResult> {
        let ordered = parameter.ordered(values);
        if ordered.len() < 2 {
            return Err(CatflowError::InvalidParameter {
                key: parameter.key().into(),
                message: "a sweep needs at least two distinct values".into(),
            });
        }

        let mut set = JoinSet::new();
        for (idx, value) in ordered.iter().copied().enumerate() {
            let executor = self.executor.clone();
            let template = self.template.clone();
            let structure = self.structure.clone();
            let mut params = base.clone();
            parameter.insert(&mut params, value);
            let (stage_cap, job_cap) = (self.stage_cap, self.job_cap);
            let run = parameter.run_id(value);
            tracing::info!(parameter = parameter.key(), value, run = %run, "Sweep run submitted");
            set.spawn(async move {
                let result = executor
                    .run_named(&run, &template, structure, &params, stage_cap, job_cap)
                    .await;
                (idx, result)
            });
        }

        let mut by_index: BTreeMap<usize, PipelineResult> = BTreeMap::new();
        while let Some(joined) = set.join_next().await {
            let (idx, result) =
                joined.map_err(|e| CatflowError::Other(format!("sweep task failed: {e}")))?;
            by_index.insert(idx, result?);
        }

        let mut energies = Vec::with_capacity(ordered.len());
        for (idx, run) in by_index {
            let value = ordered[idx];
            if let Some(reason) = &run.abort_reason {
                return Err(CatflowError::Other(format!(
                    "{} = {value} run failed: {reason}",
                    parameter.key()
                )));
            }
            let energy = run
                .stage(StageTag::FIRST)
                .and_then(|stage| stage.result.diagnostic(ENERGY_DIAGNOSTIC))
                .ok_or_else(|| {
                    CatflowError::collaborator(
                        "result parser",
                        format!("no {ENERGY_DIAGNOSTIC} for {} = {value}", parameter.key()),
                    )
                })?;
            energies.push((value, energy));
        }

        let result = identify_convergence(parameter, energies, self.threshold);
        tracing::info!(
            parameter = parameter.key(),
            converged = ?result.converged,
            difference = ?result.energy_difference,
            "Sweep finished"
        );
        Ok(result)
    }
}
