//! Cathode workflow: one multistage run on the fully intercalated
//! (discharged) structure and one on the same structure with the anode ion
//! removed (charged), then the voltage, cell change and capacity of the pair.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use catflow_types::{CatflowError, Parameters, Result, Structure};

use crate::engine::{PipelineExecutor, PipelineResult};
use crate::protocol::ProtocolTemplate;

/// Faraday constant in C/mol.
pub const FARADAY: f64 = 96485.3;

/// Diagnostic holding the total energy of a stage, in eV.
pub const FINAL_ENERGY: &str = "final_energy";

pub const DISCHARGED_RUN: &str = "discharged";
pub const CHARGED_RUN: &str = "charged";

/// The intercalating ion and its chemical potential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anode {
    /// Element symbol, e.g. `Li`.
    pub element: String,
    /// Chemical potential in eV per atom.
    pub chemical_potential: f64,
}

impl Anode {
    pub fn new(element: impl Into<String>, chemical_potential: f64) -> Self {
        Self {
            element: element.into(),
            chemical_potential,
        }
    }
}

/// A discharged state computed earlier; lets the workflow skip that run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculatedState {
    /// Total energy in eV.
    pub energy: f64,
    /// Relaxed structure.
    pub structure: Structure,
}

impl CalculatedState {
    /// Energy of the last stage and the final structure of a finished run.
    pub fn from_result(result: &PipelineResult) -> Result<Self> {
        let energy = result
            .stage_results
            .values()
            .next_back()
            .and_then(|stage| stage.result.diagnostic(FINAL_ENERGY))
            .ok_or_else(|| {
                CatflowError::collaborator(
                    "result parser",
                    format!("no {FINAL_ENERGY} in the last stage of run '{}'", result.run),
                )
            })?;
        Ok(Self {
            energy,
            structure: result.final_structure.clone(),
        })
    }
}

/// Properties of a cathode on charging. Changes are percentages relative to
/// the discharged state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CathodeProperties {
    /// e.g. `Li-ion`.
    pub battery_type: String,
    pub anode_chemical_potential: f64,
    /// Anode ions extracted per cell.
    pub extracted_ions: usize,
    /// eV
    pub energy_of_discharged_state: f64,
    /// eV
    pub energy_of_charged_state: f64,
    /// V
    pub open_circuit_voltage: f64,
    /// % change of a, b and c.
    pub lattice_change: [f64; 3],
    /// %
    pub volume_change: f64,
    /// mAh/g
    pub gravimetric_specific_capacity: f64,
    /// mAh/cm^3
    pub volumetric_specific_capacity: f64,
    /// Wh/kg
    pub gravimetric_energy_density: f64,
    /// Wh/L
    pub volumetric_energy_density: f64,
}

fn round_to(value: f64, digits: i32) -> f64 {
    let scale = 10f64.powi(digits);
    (value * scale).round() / scale
}

fn percent_change(from: f64, to: f64) -> f64 {
    (to - from) / from * 100.0
}

/// Compute cathode properties from the two relaxed end members.
pub fn cathode_properties(
    discharged: &CalculatedState,
    charged: &CalculatedState,
    anode: &Anode,
) -> Result<CathodeProperties> {
    let ions = discharged.structure.count_element(&anode.element);
    if ions == 0 {
        return Err(CatflowError::InvalidParameter {
            key: "anode".into(),
            message: format!("discharged structure contains no {}", anode.element),
        });
    }
    let n = ions as f64;

    let from = discharged.structure.lattice_lengths();
    let to = charged.structure.lattice_lengths();
    let lattice_change = [0, 1, 2].map(|i| round_to(percent_change(from[i], to[i]), 3));
    let volume_change = percent_change(discharged.structure.volume(), charged.structure.volume());

    let ocv = -(discharged.energy - charged.energy - anode.chemical_potential * n) / n;
    let weight = discharged.structure.weight()?;
    let density = discharged.structure.density()?;
    let gravimetric = n * FARADAY * 1000.0 / (weight * 3600.0);
    let volumetric = gravimetric * density;

    Ok(CathodeProperties {
        battery_type: format!("{}-ion", anode.element),
        anode_chemical_potential: anode.chemical_potential,
        extracted_ions: ions,
        energy_of_discharged_state: discharged.energy,
        energy_of_charged_state: charged.energy,
        open_circuit_voltage: round_to(ocv, 2),
        lattice_change,
        volume_change: round_to(volume_change, 1),
        gravimetric_specific_capacity: round_to(gravimetric, 1),
        volumetric_specific_capacity: round_to(volumetric, 1),
        gravimetric_energy_density: round_to(gravimetric * ocv, 1),
        volumetric_energy_density: round_to(volumetric * ocv, 1),
    })
}

/// Results of a cathode workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CathodeOutcome {
    /// `None` when the discharged state was supplied by the caller.
    pub discharged: Option<PipelineResult>,
    pub charged: PipelineResult,
    pub properties: CathodeProperties,
}

/// Runs the discharged and charged pipelines back to back on one executor.
pub struct CathodeWorkflow {
    executor: Arc<PipelineExecutor>,
    template: ProtocolTemplate,
    parameters: Parameters,
    anode: Anode,
    stage_cap: usize,
    job_cap: usize,
}

impl CathodeWorkflow {
    pub fn new(
        executor: Arc<PipelineExecutor>,
        template: ProtocolTemplate,
        parameters: Parameters,
        anode: Anode,
    ) -> Self {
        Self {
            executor,
            template,
            parameters,
            anode,
            stage_cap: 5,
            job_cap: 5,
        }
    }

    pub fn with_caps(mut self, stage_cap: usize, job_cap: usize) -> Self {
        self.stage_cap = stage_cap;
        self.job_cap = job_cap;
        self
    }

    /// Run both end members starting from the discharged structure.
    ///
    /// A run that does not succeed fails the workflow.
    pub async fn run(&self, discharged: Structure) -> Result<CathodeOutcome> {
        self.check_anode(&discharged)?;
        let result = self.run_member(DISCHARGED_RUN, discharged).await?;
        let state = CalculatedState::from_result(&result)?;
        self.finish(Some(result), state).await
    }

    /// Run only the charged member against a discharged state computed
    /// earlier.
    pub async fn run_from(&self, discharged: CalculatedState) -> Result<CathodeOutcome> {
        self.check_anode(&discharged.structure)?;
        self.finish(None, discharged).await
    }

    fn check_anode(&self, discharged: &Structure) -> Result<()> {
        let remaining = discharged.without_element(&self.anode.element);
        if remaining.num_sites() == discharged.num_sites() {
            return Err(CatflowError::InvalidParameter {
                key: "anode".into(),
                message: format!("discharged structure contains no {}", self.anode.element),
            });
        }
        if remaining.num_sites() == 0 {
            return Err(CatflowError::InvalidParameter {
                key: "anode".into(),
                message: format!("removing {} leaves an empty cell", self.anode.element),
            });
        }
        Ok(())
    }

    async fn finish(
        &self,
        discharged: Option<PipelineResult>,
        state: CalculatedState,
    ) -> Result<CathodeOutcome> {
        let deintercalated = state.structure.without_element(&self.anode.element);
        tracing::info!(
            anode = %self.anode.element,
            removed = state.structure.num_sites() - deintercalated.num_sites(),
            "Deintercalated structure built"
        );
        let charged = self.run_member(CHARGED_RUN, deintercalated).await?;
        let charged_state = CalculatedState::from_result(&charged)?;
        let properties = cathode_properties(&state, &charged_state, &self.anode)?;
        tracing::info!(
            ocv = properties.open_circuit_voltage,
            volume_change = properties.volume_change,
            capacity = properties.gravimetric_specific_capacity,
            "Cathode properties computed"
        );
        Ok(CathodeOutcome {
            discharged,
            charged,
            properties,
        })
    }

    async fn run_member(&self, run: &str, structure: Structure) -> Result<PipelineResult> {
        let result = self
            .executor
            .run_named(
                run,
                &self.template,
                structure,
                &self.parameters,
                self.stage_cap,
                self.job_cap,
            )
            .await?;
        if let Some(reason) = &result.abort_reason {
            return Err(CatflowError::Other(format!("{run} run failed: {reason}")));
        }
        Ok(result)
    }
}
