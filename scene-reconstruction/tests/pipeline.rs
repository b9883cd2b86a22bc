use image::{Rgb, RgbImage};
use scene_reconstruction::config_store::SPARSE_TO_DENSE_FILE;
use scene_reconstruction::fake::{CallCounts, FakeBackend};
use scene_reconstruction::{
    CheckpointStore, Pipeline, PipelineError, PipelineOptions, ResumeFrom, SceneFailurePolicy,
    SimilarityDatabase, Stage, WorkingSceneGraph, LOCK_FILE,
};
use std::fs;
use std::path::{Path, PathBuf};

const SCENE_FILES: &[&str] = &["working.yaml", "structure.yaml", "cloud.ply", "cloud_clipped.ply"];

fn init() {
    let _ = pretty_env_logger::try_init();
}

fn write_inputs(dir: &Path, count: usize) -> Vec<PathBuf> {
    let input = dir.join("input");
    fs::create_dir_all(&input).unwrap();
    (0..count)
        .map(|ix| {
            let path = input.join(format!("image{:02}.png", ix));
            RgbImage::from_fn(16, 12, |x, y| Rgb([(ix * 40) as u8, (x * 10) as u8, (y * 20) as u8]))
                .save(&path)
                .unwrap();
            path
        })
        .collect()
}

fn options(output: &Path) -> PipelineOptions {
    PipelineOptions {
        output: output.to_path_buf(),
        ..PipelineOptions::default()
    }
}

fn scene_dirs(output: &Path) -> Vec<String> {
    if !output.exists() {
        return vec![];
    }
    let mut names: Vec<_> = fs::read_dir(output)
        .unwrap()
        .map(|e| e.unwrap())
        .filter(|e| e.file_type().unwrap().is_dir())
        .map(|e| e.file_name().into_string().unwrap())
        .filter(|name| name.starts_with("scene"))
        .collect();
    names.sort();
    names
}

fn snapshot(output: &Path) -> Vec<(PathBuf, Vec<u8>)> {
    let mut files = vec![];
    for name in ["similar.yaml", "pairwise.yaml"] {
        let path = output.join(name);
        files.push((path.clone(), fs::read(path).unwrap()));
    }
    for scene in scene_dirs(output) {
        for name in SCENE_FILES {
            let path = output.join(&scene).join(name);
            files.push((path.clone(), fs::read(path).unwrap()));
        }
    }
    files
}

#[test]
fn full_run_writes_layout() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let inputs = write_inputs(dir.path(), 5);
    let output = dir.path().join("output");

    let pipeline = Pipeline::new(FakeBackend::with_scenes(vec![3, 2]), options(&output));
    let summary = pipeline.run(inputs.clone()).unwrap();

    let index = fs::read_to_string(output.join("index_to_image.txt")).unwrap();
    let lines: Vec<_> = index.lines().map(PathBuf::from).collect();
    assert_eq!(lines, inputs);

    for name in [
        "tracker.yaml",
        "similar_tracker.yaml",
        "similar_unordered.yaml",
        "pairwise.yaml",
        "sparse_to_dense.yaml",
    ] {
        assert!(output.join("configurations").join(name).is_file(), "{}", name);
    }
    assert!(output.join("similar.yaml").is_file());
    assert!(output.join("pairwise.yaml").is_file());
    assert!(output.join("verbose.txt").is_file());
    assert!(!output.join(LOCK_FILE).exists());

    assert_eq!(scene_dirs(&output), vec!["scene"]);
    for name in SCENE_FILES {
        assert!(output.join("scene").join(name).is_file(), "{}", name);
    }

    assert_eq!(summary.scenes.len(), 1);
    let scene = &summary.scenes[0];
    assert_eq!(scene.views, 3);
    // The first column of every image is far beyond the clip distance.
    assert_eq!(scene.points, 3 * 16 * 12);
    assert_eq!(scene.clipped_points, 3 * 15 * 12);

    let store = CheckpointStore::new(&output);
    let clipped = store.load_cloud(Stage::CloudClipped, "scene").unwrap();
    assert_eq!(clipped.len(), scene.clipped_points);
    assert!(clipped.iter().all(|(p, _)| p.coords.norm() <= 50.0));
}

#[test]
fn resume_from_sparse_reproduces_checkpoints() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let inputs = write_inputs(dir.path(), 5);
    let output = dir.path().join("output");
    let all = PipelineOptions {
        all_scenes: true,
        ..options(&output)
    };

    Pipeline::new(FakeBackend::with_scenes(vec![3, 2]), all.clone())
        .run(inputs.clone())
        .unwrap();
    let before = snapshot(&output);

    let backend = FakeBackend::with_scenes(vec![3, 2]);
    let calls = backend.calls.clone();
    let resumed = PipelineOptions {
        resume: ResumeFrom::Sparse,
        ..all
    };
    Pipeline::new(backend, resumed).run(inputs).unwrap();

    assert_eq!(snapshot(&output), before);
    assert_eq!(CallCounts::get(&calls.added_images), 0);
    assert_eq!(CallCounts::get(&calls.pairwise), 0);
    assert_eq!(CallCounts::get(&calls.metric), 1);
    assert_eq!(CallCounts::get(&calls.refine), 2);
}

#[test]
fn resume_from_dense_only_densifies() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let inputs = write_inputs(dir.path(), 5);
    let output = dir.path().join("output");
    let all = PipelineOptions {
        all_scenes: true,
        ..options(&output)
    };

    Pipeline::new(FakeBackend::with_scenes(vec![3, 2]), all.clone())
        .run(inputs.clone())
        .unwrap();
    let before = snapshot(&output);

    let backend = FakeBackend::with_scenes(vec![3, 2]);
    let calls = backend.calls.clone();
    let resumed = PipelineOptions {
        resume: ResumeFrom::Dense,
        ..all
    };
    let summary = Pipeline::new(backend, resumed).run(inputs).unwrap();

    assert_eq!(snapshot(&output), before);
    assert_eq!(CallCounts::get(&calls.metric), 0);
    assert_eq!(CallCounts::get(&calls.refine), 0);
    assert_eq!(CallCounts::get(&calls.dense), 2);
    let dirs: Vec<_> = summary.scenes.iter().map(|s| s.directory.as_str()).collect();
    assert_eq!(dirs, vec!["scene0", "scene1"]);
}

#[test]
fn resume_without_checkpoints_is_an_error() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let inputs = write_inputs(dir.path(), 3);
    let output = dir.path().join("output");

    let resumed = PipelineOptions {
        resume: ResumeFrom::Sparse,
        ..options(&output)
    };
    let backend = FakeBackend::default();
    let calls = backend.calls.clone();
    match Pipeline::new(backend, resumed).run(inputs) {
        Err(PipelineError::MissingCheckpoint { stage, path }) => {
            assert_eq!(stage, Stage::Similarity);
            assert_eq!(path, output.join("similar.yaml"));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(CallCounts::get(&calls.added_images), 0);
    assert!(scene_dirs(&output).is_empty());
}

#[test]
fn resume_from_dense_needs_scene_directories() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let inputs = write_inputs(dir.path(), 3);
    let output = dir.path().join("output");

    Pipeline::new(FakeBackend::default(), options(&output))
        .run(inputs.clone())
        .unwrap();
    fs::remove_dir_all(output.join("scene")).unwrap();

    let resumed = PipelineOptions {
        resume: ResumeFrom::Dense,
        ..options(&output)
    };
    assert!(matches!(
        Pipeline::new(FakeBackend::default(), resumed).run(inputs),
        Err(PipelineError::NoScenesFound { .. })
    ));
}

#[test]
fn all_scenes_are_largest_first() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let inputs = write_inputs(dir.path(), 5);
    let output = dir.path().join("output");
    let all = PipelineOptions {
        all_scenes: true,
        ..options(&output)
    };

    let summary = Pipeline::new(FakeBackend::with_scenes(vec![3, 7, 1, 7]), all)
        .run(inputs)
        .unwrap();

    assert_eq!(scene_dirs(&output), vec!["scene0", "scene1", "scene2", "scene3"]);
    let views: Vec<_> = summary.scenes.iter().map(|s| s.views).collect();
    assert_eq!(views, vec![7, 7, 3, 1]);
}

#[test]
fn single_scene_is_the_first_largest() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let inputs = write_inputs(dir.path(), 5);
    let output = dir.path().join("output");

    Pipeline::new(FakeBackend::with_scenes(vec![3, 7, 1, 7]), options(&output))
        .run(inputs)
        .unwrap();

    assert_eq!(scene_dirs(&output), vec!["scene"]);
    let working: WorkingSceneGraph = CheckpointStore::new(&output)
        .load(Stage::WorkingGraph, Some("scene"))
        .unwrap();
    assert_eq!(working.views.len(), 7);
    assert_eq!(working.views[0].id, "3");
}

#[test]
fn empty_input_fails_without_output() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("empty");
    fs::create_dir(&input).unwrap();
    let output = dir.path().join("output");

    let result = Pipeline::new(FakeBackend::default(), options(&output))
        .run_pattern(input.to_str().unwrap());
    assert!(matches!(result, Err(PipelineError::NoInputsFound { .. })));
    assert!(!output.exists());
}

#[test]
fn disparity_range_is_checked_before_output() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let inputs = write_inputs(dir.path(), 2);
    let output = dir.path().join("output");
    let too_large = PipelineOptions {
        max_disparity: 300,
        ..options(&output)
    };

    assert!(matches!(
        Pipeline::new(FakeBackend::default(), too_large).run(inputs),
        Err(PipelineError::DisparityRangeTooLarge { max_disparity: 300 })
    ));
    assert!(!output.exists());
}

#[test]
fn no_scene_directories_after_metric_failure() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let inputs = write_inputs(dir.path(), 4);
    let output = dir.path().join("output");
    let all = PipelineOptions {
        all_scenes: true,
        ..options(&output)
    };

    let result = Pipeline::new(FakeBackend::with_scenes(Vec::new()), all).run(inputs);
    assert!(matches!(result, Err(PipelineError::ReconstructionFailed { .. })));
    assert!(scene_dirs(&output).is_empty());
    assert!(output.join("pairwise.yaml").is_file());
    assert!(!output.join(LOCK_FILE).exists());
}

#[test]
fn scene_failure_policy() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let inputs = write_inputs(dir.path(), 5);
    let failing = FakeBackend {
        fail_dense_with_views: Some(3),
        ..FakeBackend::with_scenes(vec![3, 2])
    };

    let abort = PipelineOptions {
        all_scenes: true,
        ..options(&dir.path().join("abort"))
    };
    match Pipeline::new(failing.clone(), abort).run(inputs.clone()) {
        Err(PipelineError::DenseReconstructionFailed { scene, .. }) => assert_eq!(scene, "scene0"),
        other => panic!("unexpected {:?}", other),
    }

    let skip = PipelineOptions {
        all_scenes: true,
        scene_failure: SceneFailurePolicy::Skip,
        ..options(&dir.path().join("skip"))
    };
    let summary = Pipeline::new(failing.clone(), skip).run(inputs.clone()).unwrap();
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].directory, "scene0");
    assert_eq!(summary.scenes.len(), 1);
    assert_eq!(summary.scenes[0].directory, "scene1");
    assert!(dir.path().join("skip/scene1/cloud.ply").is_file());
    assert!(!dir.path().join("skip/scene0/cloud.ply").exists());

    // Skipping never applies to the single scene.
    let single = PipelineOptions {
        scene_failure: SceneFailurePolicy::Skip,
        ..options(&dir.path().join("single"))
    };
    assert!(matches!(
        Pipeline::new(failing, single).run(inputs.clone()),
        Err(PipelineError::DenseReconstructionFailed { .. })
    ));

    let everything_fails = FakeBackend {
        fail_dense_with_views: Some(2),
        ..FakeBackend::with_scenes(vec![2, 2])
    };
    let skip_all = PipelineOptions {
        all_scenes: true,
        scene_failure: SceneFailurePolicy::Skip,
        ..options(&dir.path().join("skip_all"))
    };
    assert!(matches!(
        Pipeline::new(everything_fails, skip_all).run(inputs),
        Err(PipelineError::AllScenesFailed { count: 2 })
    ));
}

#[test]
fn fused_disparity_is_masked_and_saved() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let inputs = write_inputs(dir.path(), 3);
    let output = dir.path().join("output");
    let opts = PipelineOptions {
        save_fused_disparity: true,
        minimum_disparity: Some(2.0),
        ..options(&output)
    };

    let summary = Pipeline::new(FakeBackend::with_scenes(vec![3]), opts)
        .run(inputs)
        .unwrap();

    for id in ["0", "1", "2"] {
        let path = output
            .join("scene/fused")
            .join(format!("visualized_{}.png", id));
        assert!(path.is_file(), "{}", path.display());
    }
    // Far pixels are masked before they become points.
    assert_eq!(summary.scenes[0].points, 3 * 15 * 12);
    assert_eq!(summary.scenes[0].points, summary.scenes[0].clipped_points);
}

#[test]
fn undecodable_images_are_skipped() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let mut inputs = write_inputs(dir.path(), 4);
    let broken = dir.path().join("input/image99.png");
    fs::write(&broken, "not a png").unwrap();
    inputs.insert(1, broken);
    let output = dir.path().join("output");

    Pipeline::new(FakeBackend::with_scenes(vec![2]), options(&output))
        .run(inputs.clone())
        .unwrap();

    let index = fs::read_to_string(output.join("index_to_image.txt")).unwrap();
    assert_eq!(index.lines().count(), 5);
    let similar: SimilarityDatabase = CheckpointStore::new(&output)
        .load(Stage::Similarity, None)
        .unwrap();
    assert_eq!(similar.views(), ["0", "2", "3", "4"]);

    let garbage: Vec<_> = (0..2)
        .map(|ix| {
            let path = dir.path().join(format!("garbage{}.png", ix));
            fs::write(&path, "garbage").unwrap();
            path
        })
        .collect();
    assert!(matches!(
        Pipeline::new(FakeBackend::default(), options(&dir.path().join("garbage"))).run(garbage),
        Err(PipelineError::NoUsableImages { total: 2 })
    ));
}

#[test]
fn delete_output_clears_previous_results() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let inputs = write_inputs(dir.path(), 3);
    let output = dir.path().join("output");
    fs::create_dir_all(output.join("scene07")).unwrap();
    fs::write(output.join("stale.txt"), "old").unwrap();

    let opts = PipelineOptions {
        delete_output: true,
        ..options(&output)
    };
    Pipeline::new(FakeBackend::default(), opts).run(inputs).unwrap();

    assert!(!output.join("stale.txt").exists());
    assert_eq!(scene_dirs(&output), vec!["scene"]);
}

#[test]
fn configuration_directory_overrides_defaults() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let inputs = write_inputs(dir.path(), 3);
    let config = dir.path().join("config");
    fs::create_dir(&config).unwrap();
    fs::write(config.join(SPARSE_TO_DENSE_FILE), "clip_distance: 1000.0\n").unwrap();
    let output = dir.path().join("output");

    let opts = PipelineOptions {
        config_path: Some(config),
        ..options(&output)
    };
    let summary = Pipeline::new(FakeBackend::default(), opts).run(inputs).unwrap();

    assert_eq!(summary.config_warnings.len(), 4);
    assert_eq!(summary.scenes[0].points, summary.scenes[0].clipped_points);
    let saved = fs::read_to_string(output.join("configurations").join(SPARSE_TO_DENSE_FILE)).unwrap();
    assert!(saved.contains("clip_distance: 1000.0"));

    let verbose = fs::read_to_string(output.join("verbose.txt")).unwrap();
    let missing = verbose
        .lines()
        .filter(|line| {
            line.starts_with("configuration: ") && line.ends_with("is missing, using the default")
        })
        .count();
    assert_eq!(missing, 4);
}

#[test]
fn resumed_stages_are_noted_in_the_verbose_log() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let inputs = write_inputs(dir.path(), 3);
    let output = dir.path().join("output");
    Pipeline::new(FakeBackend::default(), options(&output))
        .run(inputs.clone())
        .unwrap();

    let opts = PipelineOptions {
        resume: ResumeFrom::Sparse,
        ..options(&output)
    };
    Pipeline::new(FakeBackend::default(), opts).run(inputs).unwrap();

    let verbose = fs::read_to_string(output.join("verbose.txt")).unwrap();
    assert!(verbose.contains("loading similar from disk"));
    assert!(verbose.contains("loading pairwise from disk"));
}

#[test]
fn locked_output_is_refused() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let inputs = write_inputs(dir.path(), 2);
    let output = dir.path().join("output");
    fs::create_dir_all(&output).unwrap();
    fs::write(output.join(LOCK_FILE), format!("{}\n", std::process::id())).unwrap();

    assert!(matches!(
        Pipeline::new(FakeBackend::default(), options(&output)).run(inputs),
        Err(PipelineError::OutputLocked { .. })
    ));
    assert!(output.join(LOCK_FILE).exists());
}

#[test]
fn delete_output_leaves_a_locked_directory_alone() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let inputs = write_inputs(dir.path(), 2);
    let output = dir.path().join("output");
    fs::create_dir_all(output.join("scene")).unwrap();
    fs::write(output.join("scene").join("structure.yaml"), "views: []\n").unwrap();
    fs::write(output.join(LOCK_FILE), format!("{}\n", std::process::id())).unwrap();

    let opts = PipelineOptions {
        delete_output: true,
        ..options(&output)
    };
    let error = Pipeline::new(FakeBackend::default(), opts)
        .run(inputs)
        .unwrap_err();
    assert!(matches!(error, PipelineError::OutputLocked { .. }));
    assert!(error.to_string().contains(LOCK_FILE));
    assert!(output.join("scene").join("structure.yaml").is_file());
}

#[cfg(target_os = "linux")]
#[test]
fn lock_left_by_a_dead_run_is_replaced() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let inputs = write_inputs(dir.path(), 3);
    let output = dir.path().join("output");
    fs::create_dir_all(&output).unwrap();
    // No live process can have this id.
    fs::write(output.join(LOCK_FILE), "4294967295\n").unwrap();

    Pipeline::new(FakeBackend::default(), options(&output))
        .run(inputs)
        .unwrap();
    assert!(output.join("scene").join("cloud.ply").is_file());
    assert!(!output.join(LOCK_FILE).exists());
}

#[test]
fn unfixated_similarity_database_is_fixated_before_saving() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let inputs = write_inputs(dir.path(), 3);
    let output = dir.path().join("output");
    let backend = FakeBackend {
        fixates_database: false,
        ..FakeBackend::default()
    };

    Pipeline::new(backend, options(&output)).run(inputs).unwrap();

    let similar: SimilarityDatabase = CheckpointStore::new(&output)
        .load(Stage::Similarity, None)
        .unwrap();
    assert!(similar.is_fixated());
    assert_eq!(similar.views().len(), 3);
}

#[test]
fn unconverged_refinement_continues() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let inputs = write_inputs(dir.path(), 3);
    let output = dir.path().join("output");
    let backend = FakeBackend {
        refine_converges: false,
        ..FakeBackend::default()
    };

    Pipeline::new(backend, options(&output)).run(inputs).unwrap();

    let verbose = fs::read_to_string(output.join("verbose.txt")).unwrap();
    assert!(verbose.contains("SBA REFINE FAILED"));
    assert!(verbose.contains("Views used: 2 / 3"));
    assert!(output.join("scene/cloud.ply").is_file());
}

#[test]
fn ordered_input_uses_the_tracker() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let inputs = write_inputs(dir.path(), 3);
    let backend = FakeBackend::default();
    let calls = backend.calls.clone();
    let opts = PipelineOptions {
        ordered: true,
        max_threads: 2,
        ..options(&dir.path().join("output"))
    };

    Pipeline::new(backend, opts).run(inputs).unwrap();
    assert_eq!(CallCounts::get(&calls.tracker_indices), 1);
    assert_eq!(CallCounts::get(&calls.added_images), 3);
    assert_eq!(CallCounts::get(&calls.fixated), 1);
}
