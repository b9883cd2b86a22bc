//! The algorithms the pipeline drives but does not define.
//!
//! Every stage talks to its algorithm through one of these traits. A [`Backend`]
//! builds a fresh instance for each use from the resolved settings.

use crate::camera::CameraBank;
use crate::cloud::DenseCloud;
use crate::disparity::{DisparityImage, DisparityParameters};
use crate::error::Result;
use crate::images::ImageDimension;
use crate::scene::{PairwiseGraph, RefinedScene, SimilarityDatabase, WorkingSceneGraph};
use crate::settings::{
    PairwiseSettings, SimilarTrackerSettings, SimilarUnorderedSettings, SparseToDenseSettings,
    TrackerSettings,
};
use crate::summary::VerboseLog;
use image::{GrayImage, RgbImage};
use std::collections::BTreeMap;

/// Finds which previously seen images plausibly overlap a new image.
pub trait SimilarityIndex {
    /// Gives the index a sink for diagnostic output.
    fn set_verbose(&mut self, _log: VerboseLog) {}

    fn add_image(&mut self, view_id: &str, image: &GrayImage) -> Result<()>;

    /// Finalizes the index. Consuming `self` means this can only happen once.
    fn fixate(self: Box<Self>) -> Result<SimilarityDatabase>;
}

/// Scores candidate image pairs for shared 3D structure.
pub trait PairwiseBuilder {
    fn set_verbose(&mut self, _log: VerboseLog) {}

    fn process(
        &mut self,
        similar: &SimilarityDatabase,
        cameras: &CameraBank,
    ) -> Result<PairwiseGraph>;
}

/// Turns the pairwise graph into zero or more independent metric scenes.
pub trait MetricReconstructor {
    fn set_verbose(&mut self, _log: VerboseLog) {}

    /// Returns the scenes in the order they were discovered.
    fn process(
        &mut self,
        similar: &SimilarityDatabase,
        cameras: &CameraBank,
        graph: &PairwiseGraph,
    ) -> Result<Vec<WorkingSceneGraph>>;
}

/// The result of bundle adjustment.
#[derive(Debug, Clone, PartialEq)]
pub struct RefineOutcome {
    pub scene: RefinedScene,
    /// `false` if the optimizer gave up. The scene is still usable.
    pub converged: bool,
}

/// Bundle adjustment of one working scene.
pub trait Refiner {
    fn set_verbose(&mut self, _log: VerboseLog) {}

    fn process(
        &mut self,
        similar: &SimilarityDatabase,
        working: &WorkingSceneGraph,
    ) -> Result<RefineOutcome>;
}

/// Receives the disparity images produced while fusing a scene.
pub trait StereoListener {
    /// Called for every rectified stereo pair.
    fn handle_pair_disparity(
        &mut self,
        _left: &str,
        _right: &str,
        _disparity: &DisparityImage,
        _parameters: &DisparityParameters,
    ) -> Result<()> {
        Ok(())
    }

    /// Called once per center view with its fused disparity, which the listener may modify
    /// before it is turned into points.
    fn handle_fused_disparity(
        &mut self,
        name: &str,
        disparity: &mut DisparityImage,
        parameters: &DisparityParameters,
    ) -> Result<()>;
}

/// Fetches images by view id.
pub trait ImageLookup {
    /// The downsized dimension of an image without decoding it.
    fn load_shape(&self, view_id: &str) -> Option<ImageDimension>;

    /// Decodes and downsizes an image.
    fn load_image(&self, view_id: &str) -> Result<RgbImage>;
}

/// Multi-view stereo over a refined scene.
pub trait DenseFuser {
    fn set_verbose(&mut self, _log: VerboseLog) {}

    /// Returns `None` if no dense points could be produced.
    fn process(
        &mut self,
        scene: &RefinedScene,
        view_to_id: &BTreeMap<usize, String>,
        lookup: &dyn ImageLookup,
        listener: &mut dyn StereoListener,
    ) -> Result<Option<DenseCloud>>;
}

/// Builds every collaborator the pipeline needs.
pub trait Backend {
    /// Recognition based similarity for images in any order.
    fn similar_unordered(&self, settings: &SimilarUnorderedSettings) -> Box<dyn SimilarityIndex>;

    /// Tracking based similarity for images in temporal order.
    fn similar_tracker(
        &self,
        tracker: &TrackerSettings,
        settings: &SimilarTrackerSettings,
    ) -> Box<dyn SimilarityIndex>;

    fn pairwise(&self, settings: &PairwiseSettings) -> Box<dyn PairwiseBuilder>;

    fn metric(&self) -> Box<dyn MetricReconstructor>;

    /// `keep_fraction` is the fraction of observations kept when pruning outliers.
    fn refiner(&self, keep_fraction: f64) -> Box<dyn Refiner>;

    fn dense(&self, settings: &SparseToDenseSettings) -> Box<dyn DenseFuser>;
}
