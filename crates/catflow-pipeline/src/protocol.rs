//! Protocol templates: per-stage INCAR blocks plus the policy that ties the
//! stages together.
//!
//! A template is written in YAML, either as a bare map of stage blocks
//!
//! ```yaml
//! stage_0: { IBRION: -1, NSW: 0, ALGO: Fast }
//! stage_1: { IBRION: 2, NSW: 200, ISIF: 3 }
//! ```
//!
//! or with the stage blocks under `stages:` next to policy keys
//! (`carry_over`, `escalation`, `probe_nsw_threshold`, `single_shot`,
//! `stage_caps`).

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use catflow_types::{
    CalcType, CatflowError, Modifications, Parameters, Result, StageRole, StageTag, Structure,
};

/// Keys copied from the previous stage's final parameters into the next stage.
pub const DEFAULT_CARRY_OVER: &[&str] = &[
    "ALGO", "ISMEAR", "SIGMA", "SYMPREC", "AMIN", "ISYM", "KPAR", "LREAL",
];

/// Keys whose values depend on site order; never carried between stages.
pub const ORDERING_DEPENDENT: &[&str] = &["MAGMOM", "LDAUU", "LDAUJ", "LDAUL"];

/// Structures with at most this many sites run with `LREAL = .FALSE.`.
const SMALL_CELL_SITES: usize = 8;

fn default_carry_over() -> Vec<String> {
    DEFAULT_CARRY_OVER.iter().map(|k| k.to_string()).collect()
}

fn default_probe_nsw_threshold() -> i64 {
    5
}

// ---------------------------------------------------------------------------
// EscalationPolicy
// ---------------------------------------------------------------------------

/// Parameter changes applied when a production stage finishes without
/// converging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationPolicy {
    /// Next electronic algorithm to try, keyed by the current one.
    pub algo_ladder: BTreeMap<String, String>,
    pub nelm_factor: i64,
    /// `NELM` assumed when the stage did not set it.
    pub nelm_default: i64,
    pub nsw_increment: i64,
    /// `NSW` assumed when the stage did not set it.
    pub nsw_default: i64,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        let algo_ladder = [("Fast", "Normal"), ("VeryFast", "Normal"), ("Normal", "All")]
            .into_iter()
            .map(|(from, to)| (from.to_string(), to.to_string()))
            .collect();
        Self {
            algo_ladder,
            nelm_factor: 2,
            nelm_default: 200,
            nsw_increment: 100,
            nsw_default: 400,
        }
    }
}

impl EscalationPolicy {
    /// Modifications for the next attempt of a stage that ran with `used`.
    pub fn escalate(&self, calc_type: CalcType, used: &Parameters) -> Modifications {
        let mut mods = Modifications::new();
        match calc_type {
            CalcType::Static => {
                if let Some(next) = used
                    .get_str("ALGO")
                    .and_then(|algo| self.algo_ladder.get(algo))
                {
                    mods.set("ALGO", next.as_str());
                }
                let nelm = used.get_i64("NELM").unwrap_or(self.nelm_default);
                mods.set("NELM", nelm * self.nelm_factor);
                mods.set("ISTART", 0);
                mods.set("ICHARG", 2);
            }
            CalcType::Relaxation => {
                let nsw = used.get_i64("NSW").unwrap_or(self.nsw_default);
                mods.set("NSW", nsw + self.nsw_increment);
            }
        }
        mods
    }
}

// ---------------------------------------------------------------------------
// StagePlan
// ---------------------------------------------------------------------------

/// Typing of one stage, derived from the template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePlan {
    pub tag: StageTag,
    pub calc_type: CalcType,
    pub role: StageRole,
    /// Accepted as converged after one successful job.
    pub single_shot: bool,
    /// Overrides the run-wide stage cap.
    pub stage_cap: Option<usize>,
}

impl StagePlan {
    /// `"{tag}_{calc_type}"`, e.g. `stage_1_relaxation`.
    pub fn label(&self) -> String {
        format!("{}_{}", self.tag, self.calc_type)
    }

    pub fn requires_convergence(&self) -> bool {
        self.role == StageRole::Production && !self.single_shot
    }
}

// ---------------------------------------------------------------------------
// ProtocolTemplate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub stages: BTreeMap<StageTag, Parameters>,
    #[serde(default = "default_carry_over")]
    pub carry_over: Vec<String>,
    #[serde(default)]
    pub escalation: EscalationPolicy,
    /// A relaxation `stage_0` with more ionic steps than this is production.
    #[serde(default = "default_probe_nsw_threshold")]
    pub probe_nsw_threshold: i64,
    #[serde(default)]
    pub single_shot: BTreeSet<StageTag>,
    #[serde(default)]
    pub stage_caps: BTreeMap<StageTag, usize>,
}

impl ProtocolTemplate {
    /// A template with default policy around the given stage blocks.
    pub fn new(stages: BTreeMap<StageTag, Parameters>) -> Self {
        Self {
            name: None,
            stages,
            carry_over: default_carry_over(),
            escalation: EscalationPolicy::default(),
            probe_nsw_threshold: default_probe_nsw_threshold(),
            single_shot: BTreeSet::new(),
            stage_caps: BTreeMap::new(),
        }
    }

    /// Parse and validate a template in either YAML layout.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let value: serde_yaml::Value = serde_yaml::from_str(yaml)?;
        let template = if value.get("stages").is_some() {
            serde_yaml::from_value::<ProtocolTemplate>(value)?
        } else {
            ProtocolTemplate::new(serde_yaml::from_value(value)?)
        };
        template.validate()?;
        Ok(template)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        let mut template = Self::from_yaml(&yaml)?;
        if template.name.is_none() {
            template.name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .map(str::to_string);
        }
        Ok(template)
    }

    pub fn stage(&self, tag: StageTag) -> Option<&Parameters> {
        self.stages.get(&tag)
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Check stage tags, calculation types and policy references.
    pub fn validate(&self) -> Result<()> {
        if !self.stages.contains_key(&StageTag::FIRST) {
            return Err(CatflowError::ProtocolError(format!(
                "protocol has no {}",
                StageTag::FIRST
            )));
        }
        for (expected, tag) in self.stages.keys().enumerate() {
            if tag.index() as usize != expected {
                return Err(CatflowError::ProtocolError(format!(
                    "stage tags must be contiguous from {}; found {tag} at position {expected}",
                    StageTag::FIRST
                )));
            }
        }
        for (tag, params) in &self.stages {
            calc_type_of(*tag, params)?;
        }
        for tag in self.single_shot.iter().chain(self.stage_caps.keys()) {
            if !self.stages.contains_key(tag) {
                return Err(CatflowError::ProtocolError(format!(
                    "policy refers to unknown stage {tag}"
                )));
            }
        }
        if let Some(key) = self
            .carry_over
            .iter()
            .find(|k| ORDERING_DEPENDENT.contains(&k.as_str()))
        {
            return Err(CatflowError::ProtocolError(format!(
                "{key} depends on site order and cannot be carried over"
            )));
        }
        Ok(())
    }

    /// Type every stage. The first stage is a probe unless it is the only
    /// stage or a relaxation long enough to count as production.
    pub fn plan(&self) -> Result<Vec<StagePlan>> {
        self.validate()?;
        let single_stage = self.stages.len() == 1;
        self.stages
            .iter()
            .map(|(tag, params)| {
                let calc_type = calc_type_of(*tag, params)?;
                let role = if !tag.is_first() || single_stage {
                    StageRole::Production
                } else {
                    match calc_type {
                        CalcType::Relaxation
                            if params.get_i64("NSW").unwrap_or(0) > self.probe_nsw_threshold =>
                        {
                            StageRole::Production
                        }
                        _ => StageRole::Probe,
                    }
                };
                Ok(StagePlan {
                    tag: *tag,
                    calc_type,
                    role,
                    single_shot: self.single_shot.contains(tag),
                    stage_cap: self.stage_caps.get(tag).copied(),
                })
            })
            .collect()
    }

    /// Bind the template to a structure and user settings.
    ///
    /// Every stage gets an `LREAL` suited to the cell size, then the user
    /// parameters on top (so a user `LDAU = true` reaches every stage).
    pub fn specialize(&self, structure: &Structure, user: &Parameters) -> ProtocolTemplate {
        let lreal = if structure.num_sites() <= SMALL_CELL_SITES {
            serde_json::Value::Bool(false)
        } else {
            serde_json::Value::from("Auto")
        };
        let mut specialized = self.clone();
        for params in specialized.stages.values_mut() {
            params.insert("LREAL", lreal.clone());
            params.extend_from(user);
        }
        specialized
    }

    /// Copy whitelisted keys from the previous stage's final parameters.
    /// After a static stage, real-space projection is switched off.
    pub fn carry_over(&self, next: &mut Parameters, previous: &Parameters) {
        for key in &self.carry_over {
            if let Some(value) = previous.get(key) {
                next.insert(key.as_str(), value.clone());
            }
        }
        if previous.get_i64("IBRION") == Some(-1) {
            next.insert("LREAL", false);
        }
    }
}

fn calc_type_of(tag: StageTag, params: &Parameters) -> Result<CalcType> {
    let ibrion = params.get_i64("IBRION");
    ibrion
        .and_then(CalcType::from_ibrion)
        .ok_or_else(|| CatflowError::UnsupportedCalculation {
            stage: tag.to_string(),
            ibrion: params
                .get("IBRION")
                .map(|v| v.to_string())
                .unwrap_or_else(|| "missing".into()),
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
