//! Deterministic stand-ins for every collaborator.
//!
//! The fake backend produces the same output for the same input every time, which
//! lets a pipeline run be compared byte for byte against a resumed one.

use crate::camera::CameraBank;
use crate::cloud::DenseCloud;
use crate::collaborators::{
    Backend, DenseFuser, ImageLookup, MetricReconstructor, PairwiseBuilder, RefineOutcome,
    Refiner, SimilarityIndex, StereoListener,
};
use crate::disparity::{DisparityImage, DisparityParameters};
use crate::error::{PipelineError, Result};
use crate::scene::{
    PairwiseEdge, PairwiseGraph, PinholeSimplified, RefinedScene, RefinedView,
    SimilarityDatabase, WorkingSceneGraph, WorkingView,
};
use crate::settings::{
    PairwiseSettings, SimilarTrackerSettings, SimilarUnorderedSettings, SparseToDenseSettings,
    TrackerSettings,
};
use image::GrayImage;
use nalgebra::{Isometry3, Point3};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Disparity the fake fuser assigns to nearby pixels.
pub const NEAR_DISPARITY: f32 = 20.0;
/// Disparity the fake fuser assigns to the first column of every image.
pub const FAR_DISPARITY: f32 = 1.0;
/// Focal length the fake fuser triangulates with.
pub const FAKE_FOCAL: f64 = 100.0;

/// How many times each collaborator was used.
#[derive(Debug, Default)]
pub struct CallCounts {
    pub added_images: AtomicUsize,
    pub fixated: AtomicUsize,
    pub tracker_indices: AtomicUsize,
    pub pairwise: AtomicUsize,
    pub metric: AtomicUsize,
    pub refine: AtomicUsize,
    pub dense: AtomicUsize,
}

impl CallCounts {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct FakeBackend {
    /// View count of every scene the metric stage discovers, in discovery order
    pub scene_sizes: Vec<usize>,
    /// Whether bundle adjustment reports convergence
    pub refine_converges: bool,
    /// Scenes with this many views produce no dense cloud
    pub fail_dense_with_views: Option<usize>,
    /// Whether the similarity index fixates the database it hands back
    pub fixates_database: bool,
    pub calls: Arc<CallCounts>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self {
            scene_sizes: vec![2],
            refine_converges: true,
            fail_dense_with_views: None,
            fixates_database: true,
            calls: Arc::default(),
        }
    }
}

impl FakeBackend {
    pub fn with_scenes(scene_sizes: impl Into<Vec<usize>>) -> Self {
        Self {
            scene_sizes: scene_sizes.into(),
            ..Self::default()
        }
    }
}

impl Backend for FakeBackend {
    fn similar_unordered(&self, _settings: &SimilarUnorderedSettings) -> Box<dyn SimilarityIndex> {
        Box::new(FakeSimilarity {
            database: SimilarityDatabase::new(),
            fixates: self.fixates_database,
            calls: self.calls.clone(),
        })
    }

    fn similar_tracker(
        &self,
        _tracker: &TrackerSettings,
        _settings: &SimilarTrackerSettings,
    ) -> Box<dyn SimilarityIndex> {
        CallCounts::bump(&self.calls.tracker_indices);
        self.similar_unordered(&SimilarUnorderedSettings::default())
    }

    fn pairwise(&self, _settings: &PairwiseSettings) -> Box<dyn PairwiseBuilder> {
        Box::new(FakePairwise {
            calls: self.calls.clone(),
        })
    }

    fn metric(&self) -> Box<dyn MetricReconstructor> {
        Box::new(FakeMetric {
            scene_sizes: self.scene_sizes.clone(),
            calls: self.calls.clone(),
        })
    }

    fn refiner(&self, _keep_fraction: f64) -> Box<dyn Refiner> {
        Box::new(FakeRefiner {
            converges: self.refine_converges,
            calls: self.calls.clone(),
        })
    }

    fn dense(&self, settings: &SparseToDenseSettings) -> Box<dyn DenseFuser> {
        Box::new(FakeFuser {
            disparity_range: settings.disparity.disparity_range,
            fail_with_views: self.fail_dense_with_views,
            calls: self.calls.clone(),
        })
    }
}

/// Connects every image to the image before it.
pub struct FakeSimilarity {
    database: SimilarityDatabase,
    fixates: bool,
    calls: Arc<CallCounts>,
}

impl SimilarityIndex for FakeSimilarity {
    fn add_image(&mut self, view_id: &str, image: &GrayImage) -> Result<()> {
        CallCounts::bump(&self.calls.added_images);
        let previous = self.database.views().last().cloned();
        self.database.add_view(view_id)?;
        if let Some(previous) = previous {
            let score = image.get_pixel(0, 0).0[0] as f64 / 255.0;
            self.database.connect(&previous, view_id, score)?;
        }
        Ok(())
    }

    fn fixate(mut self: Box<Self>) -> Result<SimilarityDatabase> {
        CallCounts::bump(&self.calls.fixated);
        if self.fixates {
            self.database.fixate();
        }
        Ok(self.database)
    }
}

/// Turns every similar pair into a 3D edge.
pub struct FakePairwise {
    calls: Arc<CallCounts>,
}

impl PairwiseBuilder for FakePairwise {
    fn process(
        &mut self,
        similar: &SimilarityDatabase,
        _cameras: &CameraBank,
    ) -> Result<PairwiseGraph> {
        CallCounts::bump(&self.calls.pairwise);
        let edges = similar
            .pairs()
            .into_iter()
            .map(|(src, dst)| PairwiseEdge {
                src: src.to_owned(),
                dst: dst.id.clone(),
                is_3d: true,
                score_3d: 1.0 + dst.score,
                count_inliers: 100,
            })
            .collect();
        Ok(PairwiseGraph {
            nodes: similar.views().to_vec(),
            edges,
        })
    }
}

/// Carves consecutive runs of views into scenes of the configured sizes.
///
/// Scene `k` starts at the view after the last view of scene `k - 1`, wrapping
/// around the list of views.
pub struct FakeMetric {
    scene_sizes: Vec<usize>,
    calls: Arc<CallCounts>,
}

impl MetricReconstructor for FakeMetric {
    fn process(
        &mut self,
        _similar: &SimilarityDatabase,
        cameras: &CameraBank,
        graph: &PairwiseGraph,
    ) -> Result<Vec<WorkingSceneGraph>> {
        CallCounts::bump(&self.calls.metric);
        if graph.nodes.is_empty() {
            return Ok(vec![]);
        }
        let mut offset = 0;
        let mut scenes = vec![];
        for &size in &self.scene_sizes {
            let views = (0..size)
                .map(|index| {
                    let id = graph.nodes[(offset + index) % graph.nodes.len()].clone();
                    let f = cameras.camera_of(&id).map_or(1.0, |c| c.focal_length());
                    WorkingView {
                        index,
                        id,
                        world_to_view: Isometry3::translation(index as f64, 0.0, 0.0),
                        intrinsics: PinholeSimplified { f, k1: 0.0, k2: 0.0 },
                    }
                })
                .collect();
            let points = (0..size)
                .map(|i| Point3::new(i as f64, 0.5, 5.0))
                .collect();
            scenes.push(WorkingSceneGraph { views, points });
            offset += size;
        }
        Ok(scenes)
    }
}

/// Copies the working scene unchanged.
pub struct FakeRefiner {
    converges: bool,
    calls: Arc<CallCounts>,
}

impl Refiner for FakeRefiner {
    fn process(
        &mut self,
        _similar: &SimilarityDatabase,
        working: &WorkingSceneGraph,
    ) -> Result<RefineOutcome> {
        CallCounts::bump(&self.calls.refine);
        let scene = RefinedScene {
            views: working
                .views
                .iter()
                .map(|v| RefinedView {
                    index: v.index,
                    world_to_view: v.world_to_view,
                    intrinsics: v.intrinsics,
                })
                .collect(),
            points: working.points.clone(),
        };
        Ok(RefineOutcome {
            scene,
            converged: self.converges,
        })
    }
}

/// Fuses a constant disparity image per view.
///
/// The first column of every image is far away ([`FAR_DISPARITY`]) and everything
/// else is near ([`NEAR_DISPARITY`]). Every valid pixel becomes a point colored by
/// the image.
pub struct FakeFuser {
    disparity_range: u32,
    fail_with_views: Option<usize>,
    calls: Arc<CallCounts>,
}

impl DenseFuser for FakeFuser {
    fn process(
        &mut self,
        scene: &RefinedScene,
        view_to_id: &BTreeMap<usize, String>,
        lookup: &dyn ImageLookup,
        listener: &mut dyn StereoListener,
    ) -> Result<Option<DenseCloud>> {
        CallCounts::bump(&self.calls.dense);
        if self.fail_with_views == Some(scene.views.len()) {
            return Ok(None);
        }

        let parameters = DisparityParameters {
            disparity_min: 0,
            disparity_range: self.disparity_range,
            baseline: 1.0,
            focal: FAKE_FOCAL,
        };
        let mut cloud = DenseCloud::new();
        for view in &scene.views {
            let id = view_to_id
                .get(&view.index)
                .ok_or_else(|| PipelineError::Collaborator {
                    stage: "fake dense",
                    message: format!("view {} has no id", view.index),
                })?;
            let shape = lookup
                .load_shape(id)
                .ok_or_else(|| PipelineError::Collaborator {
                    stage: "fake dense",
                    message: format!("no shape for view {}", id),
                })?;
            let image = lookup.load_image(id)?;

            let mut disparity = DisparityImage::filled(shape.width, shape.height, NEAR_DISPARITY);
            for y in 0..shape.height {
                disparity.set(0, y, FAR_DISPARITY);
            }
            listener.handle_fused_disparity(id, &mut disparity, &parameters)?;

            for y in 0..shape.height.min(image.height()) {
                for x in 0..shape.width.min(image.width()) {
                    let Some(z) = parameters.depth(disparity.get(x, y)) else {
                        continue;
                    };
                    let point = Point3::new(
                        (x as f64 - shape.width as f64 / 2.0) * z / FAKE_FOCAL,
                        (y as f64 - shape.height as f64 / 2.0) * z / FAKE_FOCAL,
                        z,
                    );
                    let point = view.world_to_view.inverse_transform_point(&point);
                    cloud.push(point, image.get_pixel(x, y).0);
                }
            }
        }
        Ok(Some(cloud))
    }
}
