// tests/iteration.rs
//
// Drives the loop through iteration 000 (training, test) and iteration 001
// (exploration, labeling, training prepare) inside a temp workspace. Jobs
// are recorded instead of submitted; the test writes the files the external
// programs would have produced.

use anyhow::Result;
use async_trait::async_trait;
use nnpal::formats::npy::{self, NpyArray};
use nnpal::gates::{Gate, PhaseKind};
use nnpal::phases::exploration::ExplorationMetrics;
use nnpal::phases::labeling::LabelingMetrics;
use nnpal::phases::test::TestMetrics;
use nnpal::phases::training::TrainingMetrics;
use nnpal::settings::UserInput;
use nnpal::state::Presence;
use nnpal::{CandidateSet, PhaseState, PipelineError, Step, Submitter, Workspace};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<(PathBuf, String)>>,
}

impl Recorder {
    fn take(&self) -> Vec<(PathBuf, String)> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }
}

#[async_trait]
impl Submitter for Recorder {
    async fn submit(&self, job_dir: &Path, script: &str) -> Result<Option<String>> {
        self.calls
            .lock()
            .unwrap()
            .push((job_dir.to_path_buf(), script.to_string()));
        Ok(None)
    }
}

const KINDS: &[&str] = &[
    "lammps_explore",
    "cp2k_label",
    "deepmd_train",
    "deepmd_freeze",
    "deepmd_compress",
    "deepmd_test",
];

fn seed_workspace(root: &Path) {
    let uf = root.join("user_files");
    fs::create_dir_all(&uf).unwrap();
    fs::write(
        uf.join("machine.json"),
        r#"{"ws": {"hostname": "", "job_scheduler": "local", "launch_command": "sh", "default": true}}"#,
    )
    .unwrap();
    for kind in KINDS {
        fs::write(
            uf.join(format!("job_{}_ws.sh", kind)),
            "#!/bin/sh\n# cluster _R_CLUSTER_ walltime _R_WALLTIME_\n",
        )
        .unwrap();
    }
    fs::write(
        uf.join("training_template.json"),
        r#"{"model": {"descriptor": {"type": "se_e2_a"}, "fitting_net": {}},
            "learning_rate": {"type": "exp"},
            "training": {"training_data": {"batch_size": "auto"}}}"#,
    )
    .unwrap();
    fs::write(uf.join("bulk.lmp"), "3 atoms\n2 atom types\n").unwrap();
    fs::write(
        uf.join("lammps_bulk.in"),
        "read_data _R_DATA_FILE_\npair_style deepmd _R_MODELS_LIST_ out_file _R_DEVI_FILE_\n\
         velocity all create _R_TEMPERATURE_ _R_SEED_\nrun _R_NUMBER_OF_STEPS_\n",
    )
    .unwrap();
    fs::write(
        uf.join("cp2k_bulk.inp"),
        "&GLOBAL\n PROJECT _R_CP2K_PROJECT_\n&END\n&SUBSYS\n &CELL\n  ABC _R_CELL_\n &END\n &TOPOLOGY\n  COORD_FILE_NAME _R_XYZ_FILE_\n &END\n&END\n",
    )
    .unwrap();

    let set = root.join("data/init_bulk/set.000");
    fs::create_dir_all(&set).unwrap();
    npy::write(&set.join("box.npy"), &NpyArray::new(vec![20, 9], vec![10.0; 180]).unwrap()).unwrap();
}

fn input_for(traj_count: u32, nb_candidates_max: usize) -> UserInput {
    serde_json::from_value(json!({
        "system": "water",
        "nnp_count": 2,
        "type_map": ["O", "H"],
        "subsystems": [{
            "name": "bulk",
            "traj_count": traj_count,
            "nb_candidates_max": nb_candidates_max,
            "cell": [10.0, 10.0, 10.0]
        }]
    }))
    .unwrap()
}

fn workspace(root: &Path, recorder: &Arc<Recorder>) -> Workspace {
    Workspace::new(root, input_for(1, 500), None).with_submitter(recorder.clone())
}

fn water_frame(shift: f64) -> String {
    format!(
        "3\nframe\nO {0} 0.0 0.0\nH {1} 0.0 0.0\nH {0} 0.96 0.0\n",
        shift,
        shift + 0.96
    )
}

/// What a finished LAMMPS trajectory leaves behind: log, deviation table
/// and one frame per row.
fn write_trajectory(dir: &Path, id: &str, deviations: &[f64]) {
    let mut devi = String::from("#  step max_devi_v min_devi_v avg_devi_v max_devi_f min_devi_f avg_devi_f\n");
    let mut traj = String::new();
    for (i, d) in deviations.iter().enumerate() {
        devi.push_str(&format!("{} 0.0 0.0 0.0 {} 0.0 0.0\n", i * 50, d));
        traj.push_str(&water_frame(i as f64 * 0.01));
    }
    fs::write(dir.join(format!("{}.log", id)), "Total wall time: 0:00:12\n").unwrap();
    fs::write(dir.join(format!("model_devi_{}.out", id)), devi).unwrap();
    fs::write(dir.join(format!("{}.xyz", id)), traj).unwrap();
}

/// What a finished CP2K single point leaves behind.
fn write_cp2k(dir: &Path, energy: f64) {
    fs::write(
        dir.join("labeling_bulk.out"),
        format!(
            " *** SCF run converged in    11 steps ***\n ENERGY| Total FORCE_EVAL ( QS ) energy [a.u.]:   {}\n  PROGRAM ENDED AT   2026-01-01\n",
            energy
        ),
    )
    .unwrap();
    fs::write(
        dir.join("labeling_bulk-forces-1_0.xyz"),
        " ATOMIC FORCES in [a.u.]\n\n # Atom   Kind   Element          X              Y              Z\n      1      1      O          0.01   0.00   0.00\n      2      2      H         -0.005  0.00   0.00\n      3      2      H         -0.005  0.00   0.00\n SUM OF ATOMIC FORCES           0.00   0.00   0.00   0.00\n",
    )
    .unwrap();
}

async fn run(ws: &Workspace, step: Step, phase: &str) -> Result<()> {
    nnpal::phases::run(step, phase, ws).await
}

fn precondition(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<PipelineError>(), Some(PipelineError::Precondition(_)))
}

/// Training of `iteration` from prepare to increment.
async fn train(ws: &Workspace, recorder: &Recorder, root: &Path, iteration: &str) {
    run(ws, Step::Training, "prepare").await.unwrap();
    run(ws, Step::Training, "launch").await.unwrap();
    assert_eq!(recorder.take().len(), 2);

    // Nothing finished yet.
    let err = run(ws, Step::Training, "check").await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::Incomplete { failed: 2, total: 2 })
    ));

    for k in 1..=2 {
        let dir = root.join(format!("{}-training/{}", iteration, k));
        fs::write(dir.join("training.out"), "DEEPMD INFO    finished training\n").unwrap();
    }
    run(ws, Step::Training, "check").await.unwrap();

    run(ws, Step::Training, "freeze").await.unwrap();
    for k in 1..=2 {
        let dir = root.join(format!("{}-training/{}", iteration, k));
        assert!(dir.join("job_deepmd_freeze.sh").exists());
        fs::write(dir.join(format!("graph_{}_{}.pb", k, iteration)), format!("frozen {}", k)).unwrap();
    }
    run(ws, Step::Training, "check_freeze").await.unwrap();

    run(ws, Step::Training, "compress").await.unwrap();
    for k in 1..=2 {
        let dir = root.join(format!("{}-training/{}", iteration, k));
        fs::write(
            dir.join(format!("graph_{}_{}_compressed.pb", k, iteration)),
            format!("compressed {}", k),
        )
        .unwrap();
        fs::write(dir.join("model.ckpt-400000.index"), "ckpt").unwrap();
    }
    run(ws, Step::Training, "check_compress").await.unwrap();
    run(ws, Step::Training, "increment").await.unwrap();
    recorder.take();
}

#[tokio::test]
async fn test_full_iteration() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    seed_workspace(root);
    let recorder = Arc::new(Recorder::default());
    let ws = workspace(root, &recorder);

    // ---- initialization ----
    run(&ws, Step::Initialization, "start").await.unwrap();
    assert_eq!(ws.config().unwrap().datasets.total_structures(), 20);

    // Exploration cannot start before any model exists.
    assert!(run(&ws, Step::Exploration, "prepare").await.is_err());

    // ---- training 000 ----
    train(&ws, &recorder, root, "000").await;

    let training_input: Value =
        serde_json::from_str(&fs::read_to_string(root.join("000-training/1/training.json")).unwrap()).unwrap();
    assert_eq!(training_input["learning_rate"]["decay_steps"], 5000);
    assert_eq!(training_input["training"]["training_data"]["systems"], json!(["../../data/init_bulk"]));
    assert_eq!(training_input["training"]["training_data"]["batch_size"], "auto");
    assert_eq!(training_input["model"]["type_map"], json!(["O", "H"]));

    assert!(root.join("NNP/graph_1_000_compressed.pb").exists());
    let training: PhaseState<TrainingMetrics> = ws.load_phase(PhaseKind::Training, 0).unwrap();
    assert_eq!(training.metrics.models.len(), 4);
    assert!(training.is_open(Gate::Incremented));

    run(&ws, Step::Training, "clean").await.unwrap();
    assert!(!root.join("000-training/1/model.ckpt-400000.index").exists());
    assert!(root.join("000-training/1/training.out").exists());

    // ---- test 000 ----
    run(&ws, Step::Test, "prepare").await.unwrap();
    run(&ws, Step::Test, "launch").await.unwrap();
    assert_eq!(recorder.take().len(), 2);
    for k in 1..=2 {
        fs::write(
            root.join(format!("000-test/{}/test_{}.out", k, k)),
            "# number of test data : 20\nEnergy RMSE/Natoms : 1.0e-03 eV\nForce  RMSE        : 5.0e-02 eV/A\n",
        )
        .unwrap();
    }
    run(&ws, Step::Test, "check").await.unwrap();
    let test: PhaseState<TestMetrics> = ws.load_phase(PhaseKind::Test, 0).unwrap();
    assert_eq!(test.metrics.models["2"].force_rmse, Some(5.0e-2));

    // ---- update_iter ----
    run(&ws, Step::Training, "update_iter").await.unwrap();
    assert_eq!(ws.config().unwrap().current_iteration, 1);
    let err = run(&ws, Step::Training, "update_iter").await.unwrap_err();
    assert!(err.downcast_ref::<PipelineError>().is_some() || err.to_string().contains("not been prepared"));

    // Labeling before exploration is refused.
    let err = run(&ws, Step::Labeling, "prepare").await.unwrap_err();
    assert!(precondition(&err));
    assert!(err.to_string().contains("lock found"));

    // ---- exploration 001 ----
    // Launching before prepare fails.
    assert!(run(&ws, Step::Exploration, "launch").await.is_err());

    run(&ws, Step::Exploration, "prepare").await.unwrap();
    let traj1 = root.join("001-exploration/bulk/1/1");
    let traj2 = root.join("001-exploration/bulk/2/1");
    let lammps_in = fs::read_to_string(traj1.join("bulk_1_1.in")).unwrap();
    assert!(lammps_in.contains("pair_style deepmd ../../../../NNP/graph_1_000_compressed.pb ../../../../NNP/graph_2_000_compressed.pb"));
    assert!(lammps_in.contains("run 20000"));
    let lammps_in2 = fs::read_to_string(traj2.join("bulk_2_1.in")).unwrap();
    assert!(lammps_in2.contains("deepmd ../../../../NNP/graph_2_000_compressed.pb"));
    assert!(traj1.join("bulk.lmp").exists());

    // Preparing twice is refused.
    assert!(precondition(&run(&ws, Step::Exploration, "prepare").await.unwrap_err()));

    run(&ws, Step::Exploration, "launch").await.unwrap();
    assert!(precondition(&run(&ws, Step::Exploration, "launch").await.unwrap_err()));
    assert_eq!(recorder.take().len(), 2);

    // Trajectory 1 ran; trajectory 2 is abandoned.
    let mut devs = vec![0.05; 20];
    devs[7] = 0.3;
    devs[12] = 0.9;
    devs[15] = 1.5;
    write_trajectory(&traj1, "bulk_1_1", &devs);
    fs::write(traj2.join("skip"), "").unwrap();

    run(&ws, Step::Exploration, "check").await.unwrap();
    run(&ws, Step::Exploration, "deviate").await.unwrap();

    let selection: CandidateSet = nnpal::state::load_json(&traj1.join("selection_candidates.json"), Presence::Required).unwrap();
    assert_eq!(selection.selected, vec![7, 12]);
    assert_eq!(selection.nb_rejected, 1);

    let exploration: PhaseState<ExplorationMetrics> = ws.load_phase(PhaseKind::Exploration, 1).unwrap();
    let bulk = &exploration.metrics.subsystems["bulk"];
    // (2 + 1) / 20 = 0.15 -> x2
    assert_eq!(bulk.step_factor, 2);
    assert_eq!(bulk.next_nb_steps, 40_000);

    fs::write(traj1.join("bulk_1_1.restart"), "restart").unwrap();
    assert!(precondition(&run(&ws, Step::Exploration, "clean").await.unwrap_err()));
    run(&ws, Step::Exploration, "extract").await.unwrap();
    run(&ws, Step::Exploration, "clean").await.unwrap();
    assert!(!traj1.join("bulk_1_1.restart").exists());

    let candidates = nnpal::formats::xyz::read(&root.join("001-exploration/bulk/candidates_bulk_001.xyz")).unwrap();
    assert_eq!(candidates.len(), 2);
    assert_eq!(candidates[0].comment, "bulk_1_1 frame 7");

    // ---- labeling 001 ----
    run(&ws, Step::Labeling, "prepare").await.unwrap();
    let job1 = root.join("001-labeling/bulk/00001");
    let job2 = root.join("001-labeling/bulk/00002");
    let cp2k_in = fs::read_to_string(job1.join("labeling_bulk.inp")).unwrap();
    assert!(cp2k_in.contains("ABC 10 10 10"));
    assert!(cp2k_in.contains("COORD_FILE_NAME labeling_bulk.xyz"));
    assert!(job2.join("labeling_bulk.xyz").exists());

    run(&ws, Step::Labeling, "launch").await.unwrap();
    assert_eq!(recorder.take().len(), 2);

    for (i, dir) in [&job1, &job2].into_iter().enumerate() {
        write_cp2k(dir, -17.0 - i as f64);
    }
    run(&ws, Step::Labeling, "check").await.unwrap();
    run(&ws, Step::Labeling, "extract").await.unwrap();

    let dataset = root.join("data/bulk_001");
    assert_eq!(fs::read_to_string(dataset.join("type.raw")).unwrap(), "0\n1\n1\n");
    let energy = npy::read(&dataset.join("set.000/energy.npy")).unwrap();
    assert_eq!(energy.shape, vec![2]);
    assert!((energy.data[0] + 17.0 * 27.211_386_245_988).abs() < 1e-9);
    let force = npy::read(&dataset.join("set.000/force.npy")).unwrap();
    assert_eq!(force.shape, vec![2, 9]);

    let cfg = ws.config().unwrap();
    assert_eq!(cfg.datasets.get("bulk_001").unwrap().nb_structures, 2);
    assert_eq!(cfg.datasets.total_structures(), 22);
    let labeling: PhaseState<LabelingMetrics> = ws.load_phase(PhaseKind::Labeling, 1).unwrap();
    assert_eq!(labeling.metrics.subsystems["bulk"].nb_labeled, 2);

    // ---- training 001 ----
    run(&ws, Step::Training, "prepare").await.unwrap();
    let training_input: Value =
        serde_json::from_str(&fs::read_to_string(root.join("001-training/2/training.json")).unwrap()).unwrap();
    assert_eq!(
        training_input["training"]["training_data"]["systems"],
        json!(["../../data/init_bulk", "../../data/bulk_001"])
    );
}

#[tokio::test]
async fn test_training_rejects_stale_registry() {
    let tmp = tempfile::tempdir().unwrap();
    seed_workspace(tmp.path());
    let recorder = Arc::new(Recorder::default());
    let ws = workspace(tmp.path(), &recorder);
    run(&ws, Step::Initialization, "start").await.unwrap();

    // The dataset shrinks behind our back.
    let set = tmp.path().join("data/init_bulk/set.000");
    npy::write(&set.join("box.npy"), &NpyArray::new(vec![5, 9], vec![10.0; 45]).unwrap()).unwrap();

    let err = run(&ws, Step::Training, "prepare").await.unwrap_err();
    assert!(err.to_string().contains("should hold 20"));
    let state: PhaseState<Value> = ws
        .store()
        .load_phase(PhaseKind::Training, 0, Presence::Optional)
        .unwrap();
    assert!(!state.is_open(Gate::Locked));
}

#[tokio::test]
async fn test_forced_training_job_passes_check() {
    let tmp = tempfile::tempdir().unwrap();
    seed_workspace(tmp.path());
    let recorder = Arc::new(Recorder::default());
    let ws = workspace(tmp.path(), &recorder);
    run(&ws, Step::Initialization, "start").await.unwrap();
    run(&ws, Step::Training, "prepare").await.unwrap();
    run(&ws, Step::Training, "launch").await.unwrap();

    fs::write(tmp.path().join("000-training/1/training.out"), "finished training\n").unwrap();
    fs::write(tmp.path().join("000-training/2/force"), "").unwrap();
    run(&ws, Step::Training, "check").await.unwrap();
    assert!(ws
        .store()
        .gate_is_open(PhaseKind::Training, 0, Gate::Checked)
        .unwrap());
}

/// Initialization, training 000 and `update_iter`, then exploration 001 up
/// to launch.
async fn launch_first_exploration(ws: &Workspace, recorder: &Recorder, root: &Path) {
    run(ws, Step::Initialization, "start").await.unwrap();
    train(ws, recorder, root, "000").await;
    run(ws, Step::Training, "update_iter").await.unwrap();
    run(ws, Step::Exploration, "prepare").await.unwrap();
    run(ws, Step::Exploration, "launch").await.unwrap();
}

#[tokio::test]
async fn test_candidate_cap_spans_trajectories() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    seed_workspace(root);
    let recorder = Arc::new(Recorder::default());
    let ws = Workspace::new(root, input_for(3, 5), None).with_submitter(recorder.clone());

    launch_first_exploration(&ws, &recorder, root).await;
    assert_eq!(recorder.take().len(), 6);

    // bulk_1_1 is full of uncertain frames; the five others are only mildly
    // off, but together hold many more eligible frames.
    for k in 1..=2 {
        for t in 1..=3 {
            let d = if (k, t) == (1, 1) { 0.95 } else { 0.2 };
            let mut devs = vec![d; 5];
            devs.extend([0.05; 15]);
            write_trajectory(
                &root.join(format!("001-exploration/bulk/{}/{}", k, t)),
                &format!("bulk_{}_{}", k, t),
                &devs,
            );
        }
    }
    run(&ws, Step::Exploration, "check").await.unwrap();
    run(&ws, Step::Exploration, "deviate").await.unwrap();

    let mut total = 0;
    for k in 1..=2 {
        for t in 1..=3 {
            let dir = root.join(format!("001-exploration/bulk/{}/{}", k, t));
            let selection: CandidateSet =
                nnpal::state::load_json(&dir.join("selection_candidates.json"), Presence::Required).unwrap();
            if (k, t) == (1, 1) {
                assert_eq!(selection.selected, vec![0, 1, 2, 3, 4]);
            } else {
                assert!(selection.selected.is_empty());
            }
            assert_eq!(selection.nb_eligible(), 5);
            total += selection.selected.len();
        }
    }
    assert_eq!(total, 5);

    let exploration: PhaseState<ExplorationMetrics> = ws.load_phase(PhaseKind::Exploration, 1).unwrap();
    let bulk = &exploration.metrics.subsystems["bulk"];
    assert_eq!(bulk.candidates.nb_eligible(), 30);
    assert_eq!(bulk.candidates.nb_total, 120);
    // 30 / 120 = 0.25 -> x1
    assert_eq!(bulk.step_factor, 1);

    run(&ws, Step::Exploration, "extract").await.unwrap();
    let candidates = nnpal::formats::xyz::read(&root.join("001-exploration/bulk/candidates_bulk_001.xyz")).unwrap();
    assert_eq!(candidates.len(), 5);
    assert!(candidates.iter().all(|f| f.comment.starts_with("bulk_1_1 ")));
}

#[tokio::test]
async fn test_labeling_extract_with_skipped_and_forced_jobs() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    seed_workspace(root);
    let recorder = Arc::new(Recorder::default());
    let ws = workspace(root, &recorder);

    launch_first_exploration(&ws, &recorder, root).await;
    recorder.take();

    let mut devs = vec![0.05; 20];
    devs[7] = 0.3;
    devs[12] = 0.4;
    write_trajectory(&root.join("001-exploration/bulk/1/1"), "bulk_1_1", &devs);
    let mut devs = vec![0.05; 20];
    devs[3] = 0.5;
    write_trajectory(&root.join("001-exploration/bulk/2/1"), "bulk_2_1", &devs);

    run(&ws, Step::Exploration, "check").await.unwrap();
    run(&ws, Step::Exploration, "deviate").await.unwrap();
    run(&ws, Step::Exploration, "extract").await.unwrap();

    run(&ws, Step::Labeling, "prepare").await.unwrap();
    run(&ws, Step::Labeling, "launch").await.unwrap();
    assert_eq!(recorder.take().len(), 3);

    let jobs: Vec<PathBuf> = (1..=3)
        .map(|i| root.join(format!("001-labeling/bulk/{:05}", i)))
        .collect();
    write_cp2k(&jobs[0], -17.0);
    // The second job is abandoned; the third crashed and is accepted as is.
    fs::write(jobs[1].join("skip"), "").unwrap();
    fs::write(jobs[2].join("force"), "").unwrap();

    run(&ws, Step::Labeling, "check").await.unwrap();
    run(&ws, Step::Labeling, "extract").await.unwrap();

    let labeling: PhaseState<LabelingMetrics> = ws.load_phase(PhaseKind::Labeling, 1).unwrap();
    let bulk = &labeling.metrics.subsystems["bulk"];
    assert!(labeling.is_open(Gate::Extracted));
    assert_eq!(bulk.nb_structures, 3);
    assert_eq!(bulk.nb_labeled, 1);
    assert_eq!(bulk.nb_unusable, 1);
    assert_eq!(bulk.dataset.as_deref(), Some("bulk_001"));

    let cfg = ws.config().unwrap();
    assert_eq!(cfg.datasets.get("bulk_001").unwrap().nb_structures, 1);
    assert_eq!(cfg.datasets.total_structures(), 21);
    let energy = npy::read(&root.join("data/bulk_001/set.000/energy.npy")).unwrap();
    assert_eq!(energy.shape, vec![1]);
}
