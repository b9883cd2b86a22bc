use super::SimilarityOutput;
use crate::checkpoint::Stage;
use crate::collaborators::Backend;
use crate::error::{PipelineError, Result};
use crate::pipeline::PipelineContext;
use crate::scene::{PairwiseGraph, WorkingSceneGraph};
use itertools::Itertools;
use log::*;
use std::cmp::Reverse;

/// A working scene and the output directory it is reconstructed into.
#[derive(Debug, Clone, PartialEq)]
pub struct ScenePlan {
    pub directory: String,
    pub working: WorkingSceneGraph,
}

/// Reconstructs every metric scene, largest first.
///
/// Producing no scene at all is an error.
pub fn compute_scenes(
    ctx: &PipelineContext,
    backend: &dyn Backend,
    similar: &SimilarityOutput,
    graph: &PairwiseGraph,
) -> Result<Vec<WorkingSceneGraph>> {
    let mut metric = backend.metric();
    metric.set_verbose(ctx.verbose.clone());
    let mut scenes = metric.process(&similar.database, &similar.cameras, graph)?;
    if scenes.is_empty() {
        return Err(PipelineError::ReconstructionFailed {
            reason: format!(
                "no scene could be reconstructed from {} views",
                graph.nodes.len()
            ),
        });
    }
    sort_largest_first(&mut scenes);

    info!(
        "reconstructed {} scenes with view counts [{}]",
        scenes.len(),
        scenes.iter().map(|s| s.views.len()).join(", ")
    );
    for (ix, scene) in scenes.iter().enumerate() {
        ctx.verbose
            .line(format!("scene[{}] views={}", ix, scene.views.len()));
    }
    Ok(scenes)
}

/// Sorts by descending view count. Scenes with the same count keep their order.
pub fn sort_largest_first(scenes: &mut [WorkingSceneGraph]) {
    scenes.sort_by_key(|scene| Reverse(scene.views.len()));
}

/// Number of decimal digits in `n`.
pub fn num_digits(n: usize) -> usize {
    n.to_string().len()
}

/// The directory each scene is written to.
///
/// All scenes are numbered with just enough zero padding for the total count, a
/// single scene goes to `scene`.
pub fn scene_directory_names(count: usize, all_scenes: bool) -> Vec<String> {
    if all_scenes {
        let width = num_digits(count);
        (0..count)
            .map(|ix| format!("scene{:0width$}", ix, width = width))
            .collect()
    } else {
        vec!["scene".to_owned()]
    }
}

/// Pairs sorted scenes with their output directories. Without `all_scenes` only the
/// largest scene is kept.
pub fn plan_scenes(scenes: Vec<WorkingSceneGraph>, all_scenes: bool) -> Vec<ScenePlan> {
    let names = scene_directory_names(scenes.len(), all_scenes);
    names
        .into_iter()
        .zip(scenes)
        .map(|(directory, working)| ScenePlan { directory, working })
        .collect()
}

/// Loads the working scene of every scene directory, in directory name order.
///
/// Each scene keeps the directory it was loaded from. Without `all_scenes` only the
/// first is kept.
pub fn load_scenes(ctx: &PipelineContext, all_scenes: bool) -> Result<Vec<ScenePlan>> {
    let directories = ctx.store.scene_directories()?;
    if directories.is_empty() {
        return Err(PipelineError::NoScenesFound {
            path: ctx.store.root().to_path_buf(),
        });
    }
    let keep = if all_scenes { directories.len() } else { 1 };
    directories
        .into_iter()
        .take(keep)
        .map(|directory| {
            info!("loading scene {}", directory);
            let working = ctx.store.load(Stage::WorkingGraph, Some(&directory))?;
            Ok(ScenePlan { directory, working })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{PinholeSimplified, WorkingView};
    use nalgebra::Isometry3;

    fn scene(tag: usize, views: usize) -> WorkingSceneGraph {
        WorkingSceneGraph {
            views: (0..views)
                .map(|index| WorkingView {
                    index,
                    id: format!("{}", tag * 100 + index),
                    world_to_view: Isometry3::identity(),
                    intrinsics: PinholeSimplified {
                        f: 1.0,
                        k1: 0.0,
                        k2: 0.0,
                    },
                })
                .collect(),
            points: vec![],
        }
    }

    #[test]
    fn largest_first_is_stable() {
        let mut scenes = vec![scene(0, 3), scene(1, 7), scene(2, 1), scene(3, 7)];
        sort_largest_first(&mut scenes);
        let order: Vec<_> = scenes.iter().map(|s| s.views[0].id.as_str()).collect();
        assert_eq!(order, vec!["100", "300", "0", "200"]);
        let sizes: Vec<_> = scenes.iter().map(|s| s.views.len()).collect();
        assert_eq!(sizes, vec![7, 7, 3, 1]);
    }

    #[test]
    fn single_scene_is_first_largest() {
        let mut scenes = vec![scene(0, 3), scene(1, 7), scene(2, 1), scene(3, 7)];
        sort_largest_first(&mut scenes);
        let plans = plan_scenes(scenes, false);
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].directory, "scene");
        assert_eq!(plans[0].working.views[0].id, "100");
    }

    #[test]
    fn directory_padding() {
        let names = scene_directory_names(12, true);
        assert_eq!(names.first().unwrap(), "scene00");
        assert_eq!(names.last().unwrap(), "scene11");

        let names = scene_directory_names(100, true);
        assert_eq!(names[0], "scene000");
        assert_eq!(names[99], "scene099");

        assert_eq!(scene_directory_names(9, true)[8], "scene8");
        assert_eq!(scene_directory_names(9, false), vec!["scene"]);
    }
}
