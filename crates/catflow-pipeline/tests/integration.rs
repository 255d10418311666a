//! End-to-end tests for the catflow stage pipeline.
//!
//! Each test drives a protocol template through [`PipelineExecutor`] against
//! an in-memory lab that scripts job failures, log text and parsed results
//! per stage label.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use catflow_pipeline::{
    load_checkpoint, Anode, CalculatedState, CathodeWorkflow, Collaborators, ConvergenceSweep,
    HubbardSet, JobSpec, JobSubmitter, LogRetriever, PipelineConfig, PipelineEvent,
    PipelineExecutor, ProtocolTemplate, ResultParser, RunEvent, SweepParameter, VaspDeriver,
    DEFAULT_RUN,
};
use catflow_types::{
    AbortReason, JobCompletion, JobHandle, OutputHandle, Parameters, Result, Site, StageTag,
    Structure, StructuredResult,
};

// ---------------------------------------------------------------------------
// Scripted lab
// ---------------------------------------------------------------------------

/// Energy per atom of a job.
type EnergyFn = fn(&JobSpec) -> f64;

struct Job {
    spec: JobSpec,
    succeeded: bool,
    stdout: String,
    stderr: String,
}

/// In-memory stand-in for the scheduler, log store and output parser.
///
/// Failures and parse results are queued per stage label and consumed in
/// submission order. Jobs succeed and parse as converged once their queues
/// are empty.
#[derive(Default)]
struct Lab {
    failures: Mutex<HashMap<String, VecDeque<(String, String)>>>,
    results: Mutex<HashMap<String, VecDeque<StructuredResult>>>,
    hang: Option<String>,
    energy: Option<EnergyFn>,
    jobs: Mutex<HashMap<String, Job>>,
    specs: Mutex<Vec<JobSpec>>,
    cancelled: Mutex<Vec<JobHandle>>,
}

impl Lab {
    fn new() -> Self {
        Self::default()
    }

    fn fail(self, label: &str, stdout: &str, stderr: &str) -> Self {
        self.failures
            .lock()
            .unwrap()
            .entry(label.to_string())
            .or_default()
            .push_back((stdout.to_string(), stderr.to_string()));
        self
    }

    fn result(self, label: &str, result: StructuredResult) -> Self {
        self.results
            .lock()
            .unwrap()
            .entry(label.to_string())
            .or_default()
            .push_back(result);
        self
    }

    /// Jobs of this stage never finish on their own.
    fn hang(mut self, label: &str) -> Self {
        self.hang = Some(label.to_string());
        self
    }

    fn energy(mut self, energy: EnergyFn) -> Self {
        self.energy = Some(energy);
        self
    }

    fn specs(&self) -> Vec<JobSpec> {
        self.specs.lock().unwrap().clone()
    }

    fn specs_for(&self, label: &str) -> Vec<JobSpec> {
        self.specs()
            .into_iter()
            .filter(|s| s.label == label)
            .collect()
    }
}

#[async_trait]
impl JobSubmitter for Lab {
    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle> {
        let failure = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&spec.label)
            .and_then(|q| q.pop_front());
        let mut jobs = self.jobs.lock().unwrap();
        let id = format!("job-{}", jobs.len() + 1);
        let (succeeded, stdout, stderr) = match failure {
            Some((out, err)) => (false, out, err),
            None => (true, String::new(), String::new()),
        };
        jobs.insert(
            id.clone(),
            Job {
                spec: spec.clone(),
                succeeded,
                stdout,
                stderr,
            },
        );
        self.specs.lock().unwrap().push(spec.clone());
        Ok(JobHandle(id))
    }

    async fn await_completion(&self, job: &JobHandle) -> Result<JobCompletion> {
        let (label, succeeded) = {
            let jobs = self.jobs.lock().unwrap();
            let j = &jobs[&job.0];
            (j.spec.label.clone(), j.succeeded)
        };
        if self.hang.as_deref() == Some(label.as_str()) {
            std::future::pending::<()>().await;
        }
        Ok(JobCompletion {
            succeeded,
            outputs: OutputHandle(job.0.clone()),
        })
    }

    async fn cancel(&self, job: &JobHandle) -> Result<()> {
        self.cancelled.lock().unwrap().push(job.clone());
        Ok(())
    }
}

#[async_trait]
impl LogRetriever for Lab {
    async fn open_stdout(&self, job: &JobHandle) -> Result<Option<String>> {
        Ok(self.jobs.lock().unwrap().get(&job.0).map(|j| j.stdout.clone()))
    }

    async fn open_stderr(&self, job: &JobHandle) -> Result<Option<String>> {
        Ok(self.jobs.lock().unwrap().get(&job.0).map(|j| j.stderr.clone()))
    }
}

#[async_trait]
impl ResultParser for Lab {
    async fn parse(&self, outputs: &OutputHandle) -> Result<StructuredResult> {
        let spec = self.jobs.lock().unwrap()[&outputs.0].spec.clone();
        let mut result = self
            .results
            .lock()
            .unwrap()
            .get_mut(&spec.label)
            .and_then(|q| q.pop_front())
            .unwrap_or_else(StructuredResult::converged);
        if let Some(energy) = self.energy {
            let per_atom = energy(&spec);
            result = result
                .with_diagnostic("final_energy_per_atom", per_atom)
                .with_diagnostic("final_energy", per_atom * spec.structure.num_sites() as f64);
        }
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const THREE_STAGE: &str = r#"
name: catmat
stages:
  stage_0: { IBRION: -1, NSW: 0, ALGO: Fast, EDIFF: 1.0e-4 }
  stage_1: { IBRION: 2, NSW: 200, ISIF: 3, EDIFF: 1.0e-5 }
  stage_2: { IBRION: -1, NSW: 0, ALGO: Normal, EDIFF: 1.0e-6 }
"#;

const SUBSPACE: &str = " WARNING: Sub-Space-Matrix is not hermitian in DAV   4 -0.5E-01";

fn template() -> ProtocolTemplate {
    ProtocolTemplate::from_yaml(THREE_STAGE).unwrap()
}

fn cell(a: f64) -> Structure {
    Structure::new(
        [[a, 0.0, 0.0], [0.0, a, 0.0], [0.0, 0.0, a]],
        vec![
            Site::new("Li", [0.0, 0.0, 0.0]),
            Site::new("Li", [0.5, 0.5, 0.5]),
            Site::new("O", [0.25, 0.25, 0.25]),
        ],
    )
}

fn executor(lab: &Arc<Lab>) -> PipelineExecutor {
    PipelineExecutor::new(Collaborators::new(lab.clone(), lab.clone(), lab.clone()))
}

fn relax_unconverged(a: f64) -> StructuredResult {
    StructuredResult {
        converged: false,
        converged_electronically: true,
        converged_ionically: false,
        ..Default::default()
    }
    .with_structure(cell(a))
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<RunEvent>) -> Vec<RunEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn kinds(spec: &JobSpec) -> Vec<&str> {
    spec.structure.kinds()
}

// ---------------------------------------------------------------------------
// Restart behaviour inside a stage
// ---------------------------------------------------------------------------

#[tokio::test]
async fn subspace_error_is_corrected_with_one_resubmission() {
    let lab = Arc::new(Lab::new().fail("stage_0_static", SUBSPACE, ""));
    let single = ProtocolTemplate::from_yaml("stage_0: { IBRION: -1 }").unwrap();
    let exec = executor(&lab);
    let mut rx = exec.events().subscribe();

    // a large cell keeps LREAL = Auto from specialization
    let big = Structure::new(
        [[9.0, 0.0, 0.0], [0.0, 9.0, 0.0], [0.0, 0.0, 9.0]],
        (0..9)
            .map(|i| Site::new("Li", [i as f64 / 9.0, 0.0, 0.0]))
            .collect(),
    );
    let result = exec
        .run(&single, big, &Parameters::new(), 3, 5)
        .await
        .unwrap();

    assert!(result.succeeded);
    let specs = lab.specs();
    assert_eq!(specs.len(), 2);
    assert_eq!(specs[0].parameters.get_str("LREAL"), Some("Auto"));
    assert_eq!(specs[1].parameters.get_bool("LREAL"), Some(false));
    assert_eq!(
        result.stage(StageTag(0)).unwrap().parameters.get_bool("LREAL"),
        Some(false)
    );

    let events: Vec<PipelineEvent> = drain(&mut rx).into_iter().map(|e| e.event).collect();
    let fired: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::HandlerFired { handler, .. } => Some(handler.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(fired, vec!["subspace_matrix"]);
    assert!(events.iter().any(|e| matches!(
        e,
        PipelineEvent::ModificationsApplied { keys, .. } if keys == &vec!["LREAL".to_string()]
    )));
    assert!(matches!(
        events.last(),
        Some(PipelineEvent::PipelineCompleted { .. })
    ));
}

#[tokio::test]
async fn unclassified_failure_aborts_on_first_inspection() {
    let lab = Arc::new(Lab::new().fail("stage_0_static", "", ""));
    let result = executor(&lab)
        .run(&template(), cell(4.0), &Parameters::new(), 3, 5)
        .await
        .unwrap();

    assert!(!result.succeeded);
    assert_eq!(
        result.abort_reason,
        Some(AbortReason::UnclassifiedFailure { stage: StageTag(0) })
    );
    assert_eq!(lab.specs().len(), 1);
    assert!(result.stage_results.is_empty());
}

#[tokio::test]
async fn unhandled_error_keeps_earlier_stage_results() {
    let lab = Arc::new(Lab::new().fail("stage_1_relaxation", "", "=>> PBS: job killed: memory"));
    let result = executor(&lab)
        .run(&template(), cell(4.0), &Parameters::new(), 3, 5)
        .await
        .unwrap();

    assert!(!result.succeeded);
    assert_eq!(
        result.abort_reason,
        Some(AbortReason::UnhandledErrors {
            stage: StageTag(1),
            errors: vec!["memory".into()],
        })
    );
    let tags: Vec<StageTag> = result.stage_results.keys().copied().collect();
    assert_eq!(tags, vec![StageTag(0)]);
}

#[tokio::test]
async fn disabled_handler_from_config_leaves_error_unhandled() {
    let config = PipelineConfig::from_yaml("disable_handlers: [subspace_matrix]").unwrap();
    let lab = Arc::new(Lab::new().fail("stage_0_static", SUBSPACE, ""));
    let exec = PipelineExecutor::from_config(
        Collaborators::new(lab.clone(), lab.clone(), lab.clone()),
        &config,
    )
    .unwrap();
    assert_eq!(exec.registry().is_enabled("subspace_matrix"), Some(false));

    let result = exec
        .run(&template(), cell(4.0), &Parameters::new(), config.stage_cap, config.job_cap)
        .await
        .unwrap();
    assert_eq!(
        result.abort_reason,
        Some(AbortReason::UnhandledErrors {
            stage: StageTag(0),
            errors: vec!["subspacematrix".into()],
        })
    );
}

#[tokio::test]
async fn repeated_failures_stop_at_job_cap() {
    let mut lab = Lab::new();
    for _ in 0..10 {
        lab = lab.fail("stage_1_relaxation", SUBSPACE, "");
    }
    let lab = Arc::new(lab);
    let result = executor(&lab)
        .run(&template(), cell(4.0), &Parameters::new(), 3, 4)
        .await
        .unwrap();

    assert_eq!(
        result.abort_reason,
        Some(AbortReason::IterationCapExceeded {
            stage: StageTag(1),
            submissions: 4,
        })
    );
    assert_eq!(lab.specs_for("stage_1_relaxation").len(), 4);
}

// ---------------------------------------------------------------------------
// Stage loop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn relaxation_retried_until_converged_within_stage_cap() {
    let lab = Arc::new(
        Lab::new()
            .result("stage_1_relaxation", relax_unconverged(4.1))
            .result("stage_1_relaxation", relax_unconverged(4.2))
            .result(
                "stage_1_relaxation",
                StructuredResult::converged().with_structure(cell(4.3)),
            ),
    );
    let result = executor(&lab)
        .run(&template(), cell(4.0), &Parameters::new(), 3, 5)
        .await
        .unwrap();

    assert!(result.succeeded, "{:?}", result.abort_reason);
    let relax = lab.specs_for("stage_1_relaxation");
    assert_eq!(relax.len(), 3);
    assert_eq!(result.stage(StageTag(1)).unwrap().attempts, 3);

    // unconverged geometries are never adopted
    assert!(relax.iter().all(|s| s.structure == cell(4.0)));
    // each retry adds ionic steps to what the previous attempt used
    let nsw: Vec<i64> = relax
        .iter()
        .map(|s| s.parameters.get_i64("NSW").unwrap())
        .collect();
    assert_eq!(nsw, vec![200, 300, 400]);
    // and restarts from the previous attempt
    assert_eq!(relax[1].restart, Some(OutputHandle("job-2".into())));
    assert_eq!(relax[2].restart, Some(OutputHandle("job-3".into())));

    let final_static = lab.specs_for("stage_2_static");
    assert_eq!(final_static.len(), 1);
    assert_eq!(final_static[0].structure, cell(4.3));
    assert_eq!(final_static[0].restart, Some(OutputHandle("job-4".into())));
    assert_eq!(result.final_structure, cell(4.3));

    let labels: Vec<String> = result.labelled().into_keys().collect();
    assert_eq!(
        labels,
        vec!["stage_0_static", "stage_1_relaxation", "stage_2_static"]
    );
}

#[tokio::test]
async fn relaxation_that_never_converges_aborts_after_stage_cap() {
    let mut lab = Lab::new();
    for i in 0..6 {
        lab = lab.result("stage_1_relaxation", relax_unconverged(4.0 + i as f64 * 0.01));
    }
    let lab = Arc::new(lab);
    let result = executor(&lab)
        .run(&template(), cell(4.0), &Parameters::new(), 2, 5)
        .await
        .unwrap();

    assert!(!result.succeeded);
    assert_eq!(
        result.abort_reason,
        Some(AbortReason::NonConvergence {
            stage: StageTag(1),
            attempts: 3,
        })
    );
    let tags: Vec<StageTag> = result.stage_results.keys().copied().collect();
    assert_eq!(tags, vec![StageTag(0)]);
    assert_eq!(result.final_structure, cell(4.0));
    assert!(lab.specs_for("stage_2_static").is_empty());
}

#[tokio::test]
async fn leading_static_advances_even_when_unconverged() {
    let lab = Arc::new(Lab::new().result("stage_0_static", StructuredResult::default()));
    let result = executor(&lab)
        .run(&template(), cell(4.0), &Parameters::new(), 3, 5)
        .await
        .unwrap();
    assert!(result.succeeded);
    assert_eq!(lab.specs_for("stage_0_static").len(), 1);
}

#[tokio::test]
async fn user_parameters_reach_every_stage() {
    let lab = Arc::new(Lab::new());
    let user = Parameters::new()
        .with("ENCUT", 520)
        .with("LDAU", true)
        .with("KSPACING", 0.25);
    executor(&lab)
        .run(&template(), cell(4.0), &user, 3, 5)
        .await
        .unwrap();

    for spec in lab.specs() {
        assert_eq!(spec.parameters.get("ENCUT"), Some(&json!(520)));
        assert_eq!(spec.parameters.get_bool("LDAU"), Some(true));
        assert_eq!(spec.parameters.get("MAGMOM"), Some(&json!([0.6, 0.6, 0.6])));
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancellation_stops_in_flight_job() {
    let lab = Arc::new(Lab::new().hang("stage_1_relaxation"));
    let exec = Arc::new(executor(&lab));
    let token = exec.cancellation_token();

    let handle = tokio::spawn({
        let exec = exec.clone();
        let template = template();
        async move {
            exec.run(&template, cell(4.0), &Parameters::new(), 3, 5)
                .await
        }
    });

    for _ in 0..200 {
        if lab.specs().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(lab.specs().len(), 2);
    token.cancel();

    let result = handle.await.unwrap().unwrap();
    assert!(!result.succeeded);
    assert_eq!(
        result.abort_reason,
        Some(AbortReason::Cancelled {
            stage: Some(StageTag(1))
        })
    );
    assert_eq!(
        lab.cancelled.lock().unwrap().clone(),
        vec![JobHandle("job-2".into())]
    );
    assert!(result.stage(StageTag(0)).is_some());
}

// ---------------------------------------------------------------------------
// Checkpoint and resume
// ---------------------------------------------------------------------------

#[tokio::test]
async fn resume_continues_from_last_converged_stage() {
    let dir = tempfile::tempdir().unwrap();
    let user = Parameters::new().with("ENCUT", 600);

    let first = Arc::new(Lab::new().fail("stage_2_static", "unrecognised crash", ""));
    let result = executor(&first)
        .with_checkpoint_dir(dir.path())
        .run(&template(), cell(4.0), &user, 3, 5)
        .await
        .unwrap();
    assert!(!result.succeeded);

    let checkpoint = load_checkpoint(dir.path(), DEFAULT_RUN)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.protocol.as_deref(), Some("catmat"));
    assert_eq!(checkpoint.state.current, StageTag(2));
    assert_eq!(checkpoint.state.results.len(), 2);
    assert!(!checkpoint.state.failed);

    let second = Arc::new(Lab::new());
    let resumed = executor(&second)
        .with_checkpoint_dir(dir.path())
        .resume(&template(), &user, checkpoint, 3, 5)
        .await
        .unwrap();

    assert!(resumed.succeeded);
    assert_eq!(resumed.stage_results.len(), 3);
    let specs = second.specs();
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].label, "stage_2_static");
    assert_eq!(specs[0].restart, Some(OutputHandle("job-2".into())));
    assert_eq!(specs[0].parameters.get("ENCUT"), Some(&json!(600)));
    // the relaxation's ALGO (carried from the probe) still carries over
    assert_eq!(specs[0].parameters.get_str("ALGO"), Some("Fast"));

    assert!(load_checkpoint(dir.path(), DEFAULT_RUN)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn runs_sharing_a_checkpoint_dir_keep_their_checkpoints() {
    let dir = tempfile::tempdir().unwrap();

    let failing = Arc::new(Lab::new().fail("stage_1_relaxation", "", "=>> PBS: job killed: memory"));
    let a = executor(&failing)
        .with_checkpoint_dir(dir.path())
        .run_named("licoo2", &template(), cell(4.0), &Parameters::new(), 3, 5)
        .await
        .unwrap();
    assert!(!a.succeeded);
    assert_eq!(a.run, "licoo2");
    assert!(load_checkpoint(dir.path(), "licoo2").await.unwrap().is_some());

    let passing = Arc::new(Lab::new());
    let b = executor(&passing)
        .with_checkpoint_dir(dir.path())
        .run_named("lifepo4", &template(), cell(4.0), &Parameters::new(), 3, 5)
        .await
        .unwrap();
    assert!(b.succeeded);

    // b's success clears only its own checkpoint
    assert!(load_checkpoint(dir.path(), "lifepo4").await.unwrap().is_none());
    let kept = load_checkpoint(dir.path(), "licoo2").await.unwrap().unwrap();
    assert_eq!(kept.state.current, StageTag(1));
    assert_eq!(kept.run(), "licoo2");
}

// ---------------------------------------------------------------------------
// Ordering-dependent inputs
// ---------------------------------------------------------------------------

const DFT_U: &str = r#"
stage_0: { IBRION: 2, NSW: 50, LDAU: true, LDAUU: [0.0, 5.3], LDAUJ: [0.0, 0.0], LDAUL: [-1, 2] }
stage_1: { IBRION: -1, NSW: 0 }
"#;

fn oxide_with_moment() -> Structure {
    Structure::new(
        [[4.0, 0.0, 0.0], [0.0, 4.0, 0.0], [0.0, 0.0, 4.0]],
        vec![
            Site::new("O", [0.0, 0.0, 0.0]),
            Site::new("Fe", [0.5, 0.5, 0.5]).with_spin(1.0),
        ],
    )
}

#[tokio::test]
async fn per_kind_hubbard_lists_follow_a_resort() {
    let lab = Arc::new(Lab::new());
    let result = executor(&lab)
        .run(
            &ProtocolTemplate::from_yaml(DFT_U).unwrap(),
            oxide_with_moment(),
            &Parameters::new(),
            3,
            5,
        )
        .await
        .unwrap();
    assert!(result.succeeded, "{:?}", result.abort_reason);

    let specs = lab.specs();
    assert_eq!(specs.len(), 2);
    assert_eq!(kinds(&specs[0]), vec!["Fe", "O"]);
    let first = &specs[0].parameters;
    assert_eq!(first.get("MAGMOM"), Some(&json!([5.0, 0.6])));
    assert_eq!(first.get("LDAUU"), Some(&json!([5.3, 0.0])));
    assert_eq!(first.get("LDAUJ"), Some(&json!([0.0, 0.0])));
    assert_eq!(first.get("LDAUL"), Some(&json!([2, -1])));
    // never carried into a stage that did not ask for DFT+U
    assert!(!specs[1].parameters.contains("LDAUU"));
}

#[tokio::test]
async fn configured_hubbard_set_is_derived_per_kind() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("u.yaml");
    std::fs::write(&path, "LDAUU: { Fe: 5.3 }\nLDAUJ: { Fe: 0.0 }\nLDAUL: { Fe: 2 }\n").unwrap();
    let config = PipelineConfig {
        hubbard: Some(path),
        ..Default::default()
    };
    let lab = Arc::new(Lab::new());
    let exec = PipelineExecutor::from_config(
        Collaborators::new(lab.clone(), lab.clone(), lab.clone()),
        &config,
    )
    .unwrap();
    let template = ProtocolTemplate::from_yaml("stage_0: { IBRION: -1, NSW: 0 }").unwrap();
    exec.run(&template, oxide_with_moment(), &Parameters::new(), 3, 5)
        .await
        .unwrap();

    let spec = &lab.specs()[0];
    assert_eq!(kinds(spec), vec!["Fe", "O"]);
    assert_eq!(spec.parameters.get("LDAUU"), Some(&json!([5.3, 0.0])));
    assert_eq!(spec.parameters.get("LDAUL"), Some(&json!([2, -1])));
    assert_eq!(spec.parameters.get_i64("LMAXMIX"), Some(4));
}

#[tokio::test]
async fn hubbard_deriver_follows_the_relaxed_structure() {
    // relaxation hands back a structure whose moments force a re-sort
    let relaxed = Structure::new(
        [[4.1, 0.0, 0.0], [0.0, 4.1, 0.0], [0.0, 0.0, 4.1]],
        vec![
            Site::new("O", [0.0, 0.0, 0.0]),
            Site::new("Mn", [0.5, 0.0, 0.0]).with_spin(-1.0),
            Site::new("Fe", [0.5, 0.5, 0.5]).with_spin(1.0),
        ],
    );
    let lab = Arc::new(Lab::new().result(
        "stage_0_relaxation",
        StructuredResult::converged().with_structure(relaxed),
    ));
    let deriver = VaspDeriver::new().with_hubbard(
        HubbardSet::new().with("Fe", 5.3, 2).with("Mn", 3.9, 2),
    );
    let exec = PipelineExecutor::new(
        Collaborators::new(lab.clone(), lab.clone(), lab.clone()).with_deriver(Arc::new(deriver)),
    );
    let template = ProtocolTemplate::from_yaml(
        "stage_0: { IBRION: 2, NSW: 50 }\nstage_1: { IBRION: -1, NSW: 0 }\n",
    )
    .unwrap();
    let result = exec
        .run(&template, cell(4.0), &Parameters::new(), 3, 5)
        .await
        .unwrap();
    assert!(result.succeeded);

    let last = &lab.specs_for("stage_1_static")[0];
    assert_eq!(kinds(last), vec!["Mn", "Fe", "O"]);
    assert_eq!(last.parameters.get("LDAUU"), Some(&json!([3.9, 5.3, 0.0])));
    assert_eq!(last.parameters.get("LDAUL"), Some(&json!([2, 2, -1])));
    assert_eq!(last.parameters.get("MAGMOM"), Some(&json!([-5.0, 5.0, 0.6])));
}

#[tokio::test]
async fn mismatched_per_kind_list_is_an_error() {
    let lab = Arc::new(Lab::new());
    let template =
        ProtocolTemplate::from_yaml("stage_0: { IBRION: -1, LDAUU: [5.3] }").unwrap();
    let err = executor(&lab)
        .run(&template, oxide_with_moment(), &Parameters::new(), 3, 5)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("LDAUU"), "{err}");
    assert!(lab.specs().is_empty());
}

// ---------------------------------------------------------------------------
// Convergence sweep
// ---------------------------------------------------------------------------

fn sweep_energy(spec: &JobSpec) -> f64 {
    let params = &spec.parameters;
    let encut = match params.get_i64("ENCUT") {
        Some(300) => -5.0,
        Some(400) => -5.05,
        Some(500) => -5.055,
        _ => -5.0555,
    };
    let kspacing = match params.get_f64("KSPACING") {
        Some(k) if k > 0.45 => 0.02,
        Some(k) if k > 0.35 => 0.0004,
        _ => 0.0,
    };
    encut + kspacing
}

#[tokio::test]
async fn full_sweep_finds_encut_then_kspacing() {
    let lab = Arc::new(Lab::new().energy(sweep_energy));
    let exec = Arc::new(executor(&lab));
    let mut rx = exec.events().subscribe();
    let template = ProtocolTemplate::from_yaml("stage_0: { IBRION: -1, NSW: 0 }").unwrap();
    let sweep = ConvergenceSweep::new(exec, template, cell(4.0), Parameters::new())
        .with_caps(3, 5)
        .with_threshold(1e-3);

    let settings = sweep
        .run_full(&[600.0, 300.0, 500.0, 400.0], &[0.2, 0.5, 0.3, 0.4])
        .await
        .unwrap();

    assert_eq!(settings.encut.parameter, SweepParameter::Encut);
    assert_eq!(settings.encut.converged, Some(500.0));
    assert_eq!(settings.encut.conservative, Some(600.0));
    let encuts: Vec<f64> = settings.encut.energies.iter().map(|(v, _)| *v).collect();
    assert_eq!(encuts, vec![300.0, 400.0, 500.0, 600.0]);

    assert_eq!(settings.kspacing.converged, Some(0.4));
    assert_eq!(settings.kspacing.conservative, Some(0.3));

    let params = settings.parameters().unwrap();
    assert_eq!(params.get("ENCUT"), Some(&json!(500)));
    assert_eq!(params.get_f64("KSPACING"), Some(0.4));

    let specs = lab.specs();
    assert_eq!(specs.len(), 8);
    let kspacing_runs: Vec<&JobSpec> = specs
        .iter()
        .filter(|s| s.parameters.contains("KSPACING"))
        .collect();
    assert_eq!(kspacing_runs.len(), 4);
    assert!(kspacing_runs
        .iter()
        .all(|s| s.parameters.get("ENCUT") == Some(&json!(500))));

    // every sweep point reports under its own run id
    let mut completed: Vec<String> = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e.event, PipelineEvent::PipelineCompleted { .. }))
        .map(|e| e.run)
        .collect();
    completed.sort();
    assert_eq!(
        completed,
        vec![
            "encut_300",
            "encut_400",
            "encut_500",
            "encut_600",
            "kspacing_0.2",
            "kspacing_0.3",
            "kspacing_0.4",
            "kspacing_0.5",
        ]
    );
}

#[tokio::test]
async fn sweep_fails_when_a_run_fails() {
    let lab = Arc::new(
        Lab::new()
            .energy(sweep_energy)
            .fail("stage_0_static", "", ""),
    );
    let template = ProtocolTemplate::from_yaml("stage_0: { IBRION: -1 }").unwrap();
    let sweep = ConvergenceSweep::new(Arc::new(executor(&lab)), template, cell(4.0), Parameters::new());
    let err = sweep
        .run(SweepParameter::Encut, &[300.0, 400.0])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("ENCUT"), "{err}");
}

// ---------------------------------------------------------------------------
// Cathode workflow
// ---------------------------------------------------------------------------

const RELAX_THEN_STATIC: &str = r#"
stage_0: { IBRION: 2, NSW: 100, ISIF: 3 }
stage_1: { IBRION: -1, NSW: 0 }
"#;

fn cathode_cell(a: f64, species: &[&str]) -> Structure {
    Structure::new(
        [[a, 0.0, 0.0], [0.0, a, 0.0], [0.0, 0.0, a]],
        species
            .iter()
            .enumerate()
            .map(|(i, sp)| Site::new(*sp, [i as f64 * 0.25, 0.0, 0.0]))
            .collect(),
    )
}

fn cathode_energy(spec: &JobSpec) -> f64 {
    if spec.structure.count_element("Li") > 0 {
        -7.5
    } else {
        -8.0
    }
}

#[tokio::test]
async fn cathode_workflow_runs_both_end_members() {
    let lab = Arc::new(
        Lab::new()
            .energy(cathode_energy)
            .result(
                "stage_0_relaxation",
                StructuredResult::converged().with_structure(cathode_cell(4.1, &["Li", "Fe", "O", "O"])),
            )
            .result(
                "stage_0_relaxation",
                StructuredResult::converged().with_structure(cathode_cell(4.0, &["Fe", "O", "O"])),
            ),
    );
    let exec = Arc::new(executor(&lab));
    let workflow = CathodeWorkflow::new(
        exec,
        ProtocolTemplate::from_yaml(RELAX_THEN_STATIC).unwrap(),
        Parameters::new().with("ENCUT", 520),
        Anode::new("Li", -1.9),
    )
    .with_caps(3, 5);

    let outcome = workflow
        .run(cathode_cell(4.0, &["Li", "Fe", "O", "O"]))
        .await
        .unwrap();

    let discharged = outcome.discharged.as_ref().unwrap();
    assert_eq!(discharged.run, "discharged");
    assert_eq!(outcome.charged.run, "charged");

    // the charged run starts from the relaxed discharged cell minus the anode ion
    let relax = lab.specs_for("stage_0_relaxation");
    assert_eq!(relax.len(), 2);
    assert_eq!(
        relax[1].structure,
        cathode_cell(4.1, &["Li", "Fe", "O", "O"]).without_element("Li")
    );
    assert!(relax.iter().all(|s| s.parameters.get_i64("ENCUT") == Some(520)));

    let props = &outcome.properties;
    assert_eq!(props.battery_type, "Li-ion");
    assert_eq!(props.extracted_ions, 1);
    assert!((props.energy_of_discharged_state - -30.0).abs() < 1e-9);
    assert!((props.energy_of_charged_state - -24.0).abs() < 1e-9);
    assert!((props.open_circuit_voltage - 4.1).abs() < 1e-9);
    assert_eq!(props.lattice_change, [-2.439, -2.439, -2.439]);
    assert!((props.volume_change - -7.1).abs() < 1e-9);
    assert!((props.gravimetric_specific_capacity - 282.8).abs() < 1e-9);
}

#[tokio::test]
async fn cathode_workflow_reuses_a_calculated_discharged_state() {
    let lab = Arc::new(Lab::new().energy(cathode_energy));
    let workflow = CathodeWorkflow::new(
        Arc::new(executor(&lab)),
        ProtocolTemplate::from_yaml(RELAX_THEN_STATIC).unwrap(),
        Parameters::new(),
        Anode::new("Li", -1.9),
    );
    let discharged = CalculatedState {
        energy: -30.0,
        structure: cathode_cell(4.0, &["Li", "Fe", "O", "O"]),
    };

    let outcome = workflow.run_from(discharged).await.unwrap();
    assert!(outcome.discharged.is_none());
    let specs = lab.specs();
    assert_eq!(specs.len(), 2);
    assert!(specs.iter().all(|s| s.structure.count_element("Li") == 0));
    assert!((outcome.properties.open_circuit_voltage - 4.1).abs() < 1e-9);
    assert_eq!(outcome.properties.lattice_change, [0.0, 0.0, 0.0]);
}

#[tokio::test]
async fn cathode_workflow_rejects_a_missing_anode_ion() {
    let lab = Arc::new(Lab::new().energy(cathode_energy));
    let workflow = CathodeWorkflow::new(
        Arc::new(executor(&lab)),
        ProtocolTemplate::from_yaml(RELAX_THEN_STATIC).unwrap(),
        Parameters::new(),
        Anode::new("Na", -1.3),
    );
    let err = workflow
        .run(cathode_cell(4.0, &["Li", "Fe", "O", "O"]))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Na"), "{err}");
    assert!(lab.specs().is_empty());
}

#[tokio::test]
async fn failed_discharged_run_fails_the_cathode_workflow() {
    let lab = Arc::new(
        Lab::new()
            .energy(cathode_energy)
            .fail("stage_0_relaxation", "", ""),
    );
    let workflow = CathodeWorkflow::new(
        Arc::new(executor(&lab)),
        ProtocolTemplate::from_yaml(RELAX_THEN_STATIC).unwrap(),
        Parameters::new(),
        Anode::new("Li", -1.9),
    );
    let err = workflow
        .run(cathode_cell(4.0, &["Li", "Fe", "O", "O"]))
        .await
        .unwrap_err();
    assert!(err.to_string().starts_with("discharged run failed"), "{err}");
    assert_eq!(lab.specs().len(), 1);
}
