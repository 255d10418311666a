use serde::{Deserialize, Serialize};

use catflow_types::{CalcType, StructuredResult};

use crate::protocol::StagePlan;

/// Which predicate gated a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    /// Probe and single-shot stages pass once the job itself succeeded.
    JobSucceeded,
    Electronic,
    Ionic,
}

/// Result of checking one stage attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvergenceCheck {
    pub converged: bool,
    pub criterion: Criterion,
}

/// Check whether a finished stage attempt may advance the pipeline.
///
/// Production statics need electronic convergence; production relaxations
/// need overall (electronic and ionic) convergence.
pub fn check_convergence(stage: &StagePlan, result: &StructuredResult) -> ConvergenceCheck {
    if !stage.requires_convergence() {
        return ConvergenceCheck {
            converged: true,
            criterion: Criterion::JobSucceeded,
        };
    }
    match stage.calc_type {
        CalcType::Static => ConvergenceCheck {
            converged: result.converged_electronically,
            criterion: Criterion::Electronic,
        },
        CalcType::Relaxation => ConvergenceCheck {
            converged: result.converged,
            criterion: Criterion::Ionic,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catflow_types::{StageRole, StageTag};

    fn plan(calc_type: CalcType, role: StageRole, single_shot: bool) -> StagePlan {
        StagePlan {
            tag: StageTag(1),
            calc_type,
            role,
            single_shot,
            stage_cap: None,
        }
    }

    fn result(converged: bool, electronic: bool) -> StructuredResult {
        StructuredResult {
            converged,
            converged_electronically: electronic,
            converged_ionically: converged,
            ..Default::default()
        }
    }

    #[test]
    fn unchecked_role_always_passes() {
        let stage = plan(CalcType::Static, StageRole::Probe, false);
        let check = check_convergence(&stage, &result(false, false));
        assert!(check.converged);
        assert_eq!(check.criterion, Criterion::JobSucceeded);
    }

    #[test]
    fn single_shot_production_always_passes() {
        let stage = plan(CalcType::Relaxation, StageRole::Production, true);
        assert!(check_convergence(&stage, &result(false, false)).converged);
    }

    #[test]
    fn production_static_gates_on_electronic_convergence() {
        let stage = plan(CalcType::Static, StageRole::Production, false);
        assert!(check_convergence(&stage, &result(false, true)).converged);
        let check = check_convergence(&stage, &result(true, false));
        assert!(!check.converged);
        assert_eq!(check.criterion, Criterion::Electronic);
    }

    #[test]
    fn production_relaxation_gates_on_overall_convergence() {
        let stage = plan(CalcType::Relaxation, StageRole::Production, false);
        assert!(!check_convergence(&stage, &result(false, true)).converged);
        let check = check_convergence(&stage, &result(true, true));
        assert!(check.converged);
        assert_eq!(check.criterion, Criterion::Ionic);
    }
}
