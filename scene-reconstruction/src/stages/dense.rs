use super::{ScenePlan, SimilarityOutput};
use crate::checkpoint::Stage;
use crate::cloud::DenseCloud;
use crate::collaborators::{Backend, StereoListener};
use crate::disparity::{colorize, DisparityImage, DisparityParameters};
use crate::error::{image_at, io_at, PipelineError, Result};
use crate::images::FileImageLookup;
use crate::pipeline::PipelineContext;
use crate::scene::{PairwiseGraph, RefinedScene};
use crate::summary::write_sparse_summary;
use log::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

/// Fraction of observations bundle adjustment keeps when pruning outliers.
pub const REFINE_KEEP_FRACTION: f64 = 0.95;

/// What was produced for one scene.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneOutcome {
    pub directory: String,
    pub views: usize,
    pub points: usize,
    pub clipped_points: usize,
}

/// Post-processes every fused disparity image before it is turned into points.
///
/// Disparities below the minimum are replaced by the invalid sentinel, the disparity
/// range. Optionally a colorized copy is written for inspection.
#[derive(Debug, Clone)]
pub struct FusedDisparityListener {
    pub minimum_disparity: f64,
    /// Where visualizations are written, if at all
    pub output: Option<PathBuf>,
}

impl StereoListener for FusedDisparityListener {
    fn handle_fused_disparity(
        &mut self,
        name: &str,
        disparity: &mut DisparityImage,
        parameters: &DisparityParameters,
    ) -> Result<()> {
        if self.minimum_disparity > 0.0 {
            disparity.mask_below(
                self.minimum_disparity as f32,
                parameters.disparity_range as f32,
            );
        }
        if let Some(dir) = &self.output {
            fs::create_dir_all(dir).map_err(io_at(dir))?;
            let path = dir.join(format!("visualized_{}.png", name));
            colorize(disparity, parameters.disparity_range)
                .save(&path)
                .map_err(image_at(&path))?;
        }
        Ok(())
    }
}

/// Refines (or loads) one scene, densifies it, and saves both clouds.
///
/// `load_structure` loads the refined structure a previous run saved instead of
/// running bundle adjustment.
pub fn reconstruct_scene(
    ctx: &PipelineContext,
    backend: &dyn Backend,
    similar: &SimilarityOutput,
    graph: &PairwiseGraph,
    plan: &ScenePlan,
    load_structure: bool,
) -> Result<SceneOutcome> {
    let directory = plan.directory.as_str();
    info!("building {}", directory);
    ctx.verbose.line(format!("----- Building {}", directory));

    let structure = if load_structure {
        ctx.store
            .load::<RefinedScene>(Stage::RefinedStructure, Some(directory))?
    } else {
        let structure = refine(ctx, backend, similar, plan)?;
        ctx.store
            .save(Stage::WorkingGraph, Some(directory), &plan.working)?;
        ctx.store
            .save(Stage::RefinedStructure, Some(directory), &structure)?;
        structure
    };

    let view_to_id = plan.working.view_to_id();
    write_sparse_summary(
        &ctx.verbose,
        &plan.working,
        structure.views.len(),
        graph.nodes.len(),
    );

    let cloud = compute_dense(ctx, backend, similar, &structure, &view_to_id, directory)?;
    let clipped = cloud.clipped(ctx.configs.sparse_to_dense.clip_distance);
    ctx.store.save_cloud(Stage::Cloud, directory, &cloud)?;
    ctx.store
        .save_cloud(Stage::CloudClipped, directory, &clipped)?;
    info!(
        "{}: {} points, {} after clipping",
        directory,
        cloud.len(),
        clipped.len()
    );

    Ok(SceneOutcome {
        directory: directory.to_owned(),
        views: structure.views.len(),
        points: cloud.len(),
        clipped_points: clipped.len(),
    })
}

fn refine(
    ctx: &PipelineContext,
    backend: &dyn Backend,
    similar: &SimilarityOutput,
    plan: &ScenePlan,
) -> Result<RefinedScene> {
    let mut refiner = backend.refiner(REFINE_KEEP_FRACTION);
    refiner.set_verbose(ctx.verbose.clone());
    let outcome = refiner
        .process(&similar.database, &plan.working)
        .map_err(|e| PipelineError::RefineFailed {
            scene: plan.directory.clone(),
            reason: e.to_string(),
        })?;
    if !outcome.converged {
        // The unrefined estimate is still worth densifying.
        warn!("{}: bundle adjustment did not converge", plan.directory);
        ctx.verbose.line("SBA REFINE FAILED");
    }
    Ok(outcome.scene)
}

/// Runs multi-view stereo over a refined scene.
///
/// Fails with [`PipelineError::DenseReconstructionFailed`] if the fuser errors or
/// produces nothing.
pub fn compute_dense(
    ctx: &PipelineContext,
    backend: &dyn Backend,
    similar: &SimilarityOutput,
    structure: &RefinedScene,
    view_to_id: &BTreeMap<usize, String>,
    directory: &str,
) -> Result<DenseCloud> {
    let settings = &ctx.configs.sparse_to_dense;
    let mut fuser = backend.dense(settings);
    fuser.set_verbose(ctx.verbose.clone());

    let lookup = FileImageLookup::new(&ctx.images, &similar.dimensions);
    let mut listener = FusedDisparityListener {
        minimum_disparity: settings.minimum_disparity,
        output: ctx
            .save_fused_disparity
            .then(|| ctx.store.scene_dir(directory).join("fused")),
    };

    let failed = |reason: String| PipelineError::DenseReconstructionFailed {
        scene: directory.to_owned(),
        reason,
    };
    match fuser.process(structure, view_to_id, &lookup, &mut listener) {
        Ok(Some(cloud)) => Ok(cloud),
        Ok(None) => Err(failed("no dense points were produced".to_owned())),
        Err(e) => Err(failed(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parameters() -> DisparityParameters {
        DisparityParameters {
            disparity_min: 0,
            disparity_range: 100,
            baseline: 1.0,
            focal: 10.0,
        }
    }

    #[test]
    fn listener_masks_below_minimum() {
        let mut listener = FusedDisparityListener {
            minimum_disparity: 10.0,
            output: None,
        };
        let mut image = DisparityImage {
            width: 4,
            height: 1,
            data: vec![2.0, 10.0, 55.5, 100.0],
        };
        listener
            .handle_fused_disparity("3", &mut image, &parameters())
            .unwrap();
        assert_eq!(image.data, vec![100.0, 10.0, 55.5, 100.0]);
    }

    #[test]
    fn listener_without_minimum_changes_nothing() {
        let mut listener = FusedDisparityListener {
            minimum_disparity: 0.0,
            output: None,
        };
        let mut image = DisparityImage {
            width: 2,
            height: 1,
            data: vec![0.0, 3.0],
        };
        listener
            .handle_fused_disparity("0", &mut image, &parameters())
            .unwrap();
        assert_eq!(image.data, vec![0.0, 3.0]);
    }

    #[test]
    fn listener_writes_visualization() {
        let dir = tempfile::tempdir().unwrap();
        let mut listener = FusedDisparityListener {
            minimum_disparity: 0.0,
            output: Some(dir.path().join("fused")),
        };
        let mut image = DisparityImage::filled(3, 2, 20.0);
        listener
            .handle_fused_disparity("7", &mut image, &parameters())
            .unwrap();
        let written = image::open(dir.path().join("fused").join("visualized_7.png")).unwrap();
        assert_eq!((written.width(), written.height()), (3, 2));
    }
}
