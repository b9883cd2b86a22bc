//! A minimal backend so the command line tool can run end to end.
//!
//! Similarity comes from perceptual image hashes, scenes are the connected components
//! of the pairwise graph with cameras placed along a straight rail, and dense points
//! come from block matching neighboring views along that rail.

use image::{imageops::FilterType, GrayImage};
use log::*;
use nalgebra::{Isometry3, Point3, Vector3};
use rayon::prelude::*;
use scene_reconstruction::{
    average_gray, Backend, CameraBank, DenseCloud, DenseFuser, DisparityImage,
    DisparityParameters, DisparitySettings, ImageLookup, MetricReconstructor, PairwiseBuilder,
    PairwiseEdge, PairwiseGraph, PairwiseSettings, PinholeSimplified, RefineOutcome,
    RefinedScene, RefinedView, Refiner, Result, SimilarTrackerSettings,
    SimilarUnorderedSettings, SimilarityDatabase, SimilarityIndex, SparseToDenseSettings,
    StereoListener, TrackerSettings, VerboseLog, WorkingSceneGraph, WorkingView,
};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Side length of the downsampled image a hash is computed from.
const HASH_SIZE: u32 = 8;
/// Hashes further apart than this are never considered similar.
const MAX_HAMMING: u32 = 20;
/// Only every `SAMPLE_STEP`th pixel in each direction is matched.
const SAMPLE_STEP: u32 = 4;
/// Distance of the sparse point placed in front of every camera.
const PRIOR_DEPTH: f64 = 10.0;

#[derive(Debug, Default, Copy, Clone)]
pub struct BaselineBackend;

impl Backend for BaselineBackend {
    fn similar_unordered(&self, settings: &SimilarUnorderedSettings) -> Box<dyn SimilarityIndex> {
        Box::new(HashIndex::new(Strategy::Recognition {
            limit_query: settings.limit_query,
        }))
    }

    fn similar_tracker(
        &self,
        _tracker: &TrackerSettings,
        settings: &SimilarTrackerSettings,
    ) -> Box<dyn SimilarityIndex> {
        Box::new(HashIndex::new(Strategy::Sequential {
            search_radius: settings.sequential_search_radius,
        }))
    }

    fn pairwise(&self, settings: &PairwiseSettings) -> Box<dyn PairwiseBuilder> {
        Box::new(HashPairwise {
            settings: *settings,
        })
    }

    fn metric(&self) -> Box<dyn MetricReconstructor> {
        Box::new(RailMetric)
    }

    fn refiner(&self, keep_fraction: f64) -> Box<dyn Refiner> {
        Box::new(IdentityRefiner { keep_fraction })
    }

    fn dense(&self, settings: &SparseToDenseSettings) -> Box<dyn DenseFuser> {
        Box::new(RailStereo {
            settings: *settings,
            verbose: None,
        })
    }
}

/// The average hash of an image. Each bit is set if that cell is brighter than the mean.
pub fn average_hash(image: &GrayImage) -> u64 {
    let small = image::imageops::resize(image, HASH_SIZE, HASH_SIZE, FilterType::Triangle);
    let mean = small.pixels().map(|p| p.0[0] as u32).sum::<u32>() / (HASH_SIZE * HASH_SIZE);
    small
        .pixels()
        .enumerate()
        .filter(|(_, p)| p.0[0] as u32 > mean)
        .fold(0u64, |hash, (bit, _)| hash | (1u64 << bit))
}

fn hash_score(distance: u32) -> f64 {
    1.0 - distance as f64 / (HASH_SIZE * HASH_SIZE) as f64
}

#[derive(Debug, Copy, Clone)]
enum Strategy {
    /// Any image may match any other, keeping the closest few.
    Recognition { limit_query: usize },
    /// Each image matches the images just before it.
    Sequential { search_radius: usize },
}

pub struct HashIndex {
    strategy: Strategy,
    hashes: Vec<(String, u64)>,
    verbose: Option<VerboseLog>,
}

impl HashIndex {
    fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            hashes: vec![],
            verbose: None,
        }
    }
}

impl SimilarityIndex for HashIndex {
    fn set_verbose(&mut self, log: VerboseLog) {
        self.verbose = Some(log);
    }

    fn add_image(&mut self, view_id: &str, image: &GrayImage) -> Result<()> {
        let hash = average_hash(image);
        if let Some(log) = &self.verbose {
            log.line(format!("hash[{}] = {:016x}", view_id, hash));
        }
        self.hashes.push((view_id.to_owned(), hash));
        Ok(())
    }

    fn fixate(self: Box<Self>) -> Result<SimilarityDatabase> {
        let mut database = SimilarityDatabase::new();
        for (id, _) in &self.hashes {
            database.add_view(id.clone())?;
        }
        match self.strategy {
            Strategy::Recognition { limit_query } => {
                for (ix, (id, hash)) in self.hashes.iter().enumerate() {
                    let mut candidates: Vec<(u32, usize)> = self
                        .hashes
                        .iter()
                        .enumerate()
                        .filter(|&(other, _)| other != ix)
                        .map(|(other, (_, other_hash))| ((hash ^ other_hash).count_ones(), other))
                        .filter(|&(distance, _)| distance <= MAX_HAMMING)
                        .collect();
                    candidates.sort_unstable();
                    for (distance, other) in candidates.into_iter().take(limit_query) {
                        database.connect(id, &self.hashes[other].0, hash_score(distance))?;
                    }
                }
            }
            Strategy::Sequential { search_radius } => {
                for (ix, (id, hash)) in self.hashes.iter().enumerate() {
                    for (other_id, other_hash) in &self.hashes[ix.saturating_sub(search_radius)..ix]
                    {
                        let distance = (hash ^ other_hash).count_ones();
                        database.connect(other_id, id, hash_score(distance))?;
                    }
                }
            }
        }
        database.fixate();
        Ok(database)
    }
}

/// Scores every similar pair by how well the hashes agree.
pub struct HashPairwise {
    settings: PairwiseSettings,
}

impl PairwiseBuilder for HashPairwise {
    fn process(
        &mut self,
        similar: &SimilarityDatabase,
        _cameras: &CameraBank,
    ) -> Result<PairwiseGraph> {
        let bits = (HASH_SIZE * HASH_SIZE) as f64;
        let edges = similar
            .pairs()
            .into_iter()
            .map(|(src, dst)| {
                let score_3d = 1.0 + 2.0 * dst.score;
                PairwiseEdge {
                    src: src.to_owned(),
                    dst: dst.id.clone(),
                    is_3d: score_3d >= self.settings.ratio_3d,
                    score_3d,
                    count_inliers: (dst.score * bits).round() as usize,
                }
            })
            .collect();
        Ok(PairwiseGraph {
            nodes: similar.views().to_vec(),
            edges,
        })
    }
}

/// Every connected component of 3D edges with at least two views is a scene.
///
/// The cameras of a scene are placed one unit apart along the x axis in input order.
pub struct RailMetric;

impl MetricReconstructor for RailMetric {
    fn process(
        &mut self,
        _similar: &SimilarityDatabase,
        cameras: &CameraBank,
        graph: &PairwiseGraph,
    ) -> Result<Vec<WorkingSceneGraph>> {
        let mut neighbors: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for edge in graph.edges.iter().filter(|e| e.is_3d) {
            neighbors.entry(edge.src.as_str()).or_default().push(edge.dst.as_str());
            neighbors.entry(edge.dst.as_str()).or_default().push(edge.src.as_str());
        }
        let position: BTreeMap<&str, usize> = graph
            .nodes
            .iter()
            .enumerate()
            .map(|(ix, id)| (id.as_str(), ix))
            .collect();

        let mut visited = BTreeSet::new();
        let mut scenes = vec![];
        for start in &graph.nodes {
            if !visited.insert(start.as_str()) {
                continue;
            }
            let mut component = vec![start.as_str()];
            let mut queue = VecDeque::from([start.as_str()]);
            while let Some(id) = queue.pop_front() {
                for &next in neighbors.get(id).into_iter().flatten() {
                    if visited.insert(next) {
                        component.push(next);
                        queue.push_back(next);
                    }
                }
            }
            if component.len() < 2 {
                continue;
            }
            component.sort_by_key(|id| position.get(id).copied());
            scenes.push(rail_scene(&component, cameras));
        }
        Ok(scenes)
    }
}

fn rail_scene(ids: &[&str], cameras: &CameraBank) -> WorkingSceneGraph {
    let views = ids
        .iter()
        .enumerate()
        .map(|(index, &id)| WorkingView {
            index,
            id: id.to_owned(),
            world_to_view: Isometry3::translation(-(index as f64), 0.0, 0.0),
            intrinsics: PinholeSimplified {
                f: cameras.camera_of(id).map_or(1.0, |c| c.focal_length()),
                k1: 0.0,
                k2: 0.0,
            },
        })
        .collect();
    let points = (0..ids.len())
        .map(|index| Point3::new(index as f64, 0.0, PRIOR_DEPTH))
        .collect();
    WorkingSceneGraph { views, points }
}

/// Accepts the working estimate as is.
pub struct IdentityRefiner {
    keep_fraction: f64,
}

impl Refiner for IdentityRefiner {
    fn process(
        &mut self,
        _similar: &SimilarityDatabase,
        working: &WorkingSceneGraph,
    ) -> Result<RefineOutcome> {
        debug!(
            "refining {} views keeping {:.0}% of observations",
            working.views.len(),
            self.keep_fraction * 100.0
        );
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
            converged: true,
        })
    }
}

/// Matches each view against the views after it on the rail and fuses the results.
pub struct RailStereo {
    settings: SparseToDenseSettings,
    verbose: Option<VerboseLog>,
}

impl DenseFuser for RailStereo {
    fn set_verbose(&mut self, log: VerboseLog) {
        self.verbose = Some(log);
    }

    fn process(
        &mut self,
        scene: &RefinedScene,
        view_to_id: &BTreeMap<usize, String>,
        lookup: &dyn ImageLookup,
        listener: &mut dyn StereoListener,
    ) -> Result<Option<DenseCloud>> {
        let disparity = &self.settings.disparity;
        let mut views: Vec<&RefinedView> = scene.views.iter().collect();
        views.sort_by_key(|v| v.index);

        let mut cloud = DenseCloud::new();
        for (ix, center) in views.iter().enumerate() {
            let Some(center_id) = view_to_id.get(&center.index) else {
                warn!("view {} has no image", center.index);
                continue;
            };
            let left_rgb = lookup.load_image(center_id)?;
            let left = average_gray(&left_rgb);

            let mut pairs = vec![];
            for neighbor in views.iter().skip(ix + 1).take(self.settings.max_fused_views) {
                let Some(neighbor_id) = view_to_id.get(&neighbor.index) else {
                    continue;
                };
                if lookup.load_shape(neighbor_id) != lookup.load_shape(center_id) {
                    debug!("skipping {} and {}, sizes differ", center_id, neighbor_id);
                    continue;
                }
                let right = average_gray(&lookup.load_image(neighbor_id)?);
                let baseline = (camera_center(center) - camera_center(neighbor)).norm();
                let pair = block_match(&left, &right, disparity);
                let parameters = stereo_parameters(disparity, baseline, center.intrinsics.f);
                listener.handle_pair_disparity(center_id, neighbor_id, &pair, &parameters)?;
                pairs.push((pair, baseline));
            }
            let Some(&(_, reference_baseline)) = pairs.first() else {
                continue;
            };

            let parameters = stereo_parameters(disparity, reference_baseline, center.intrinsics.f);
            let mut fused = fuse(&pairs, reference_baseline, disparity.disparity_range);
            listener.handle_fused_disparity(center_id, &mut fused, &parameters)?;

            let before = cloud.len();
            let (cx, cy) = (fused.width as f64 / 2.0, fused.height as f64 / 2.0);
            for y in 0..fused.height {
                for x in 0..fused.width {
                    let Some(z) = parameters.depth(fused.get(x, y)) else {
                        continue;
                    };
                    let f = parameters.focal;
                    let point = Point3::new((x as f64 - cx) * z / f, (y as f64 - cy) * z / f, z);
                    let world = center.world_to_view.inverse_transform_point(&point);
                    cloud.push(world, left_rgb.get_pixel(x, y).0);
                }
            }
            if let Some(log) = &self.verbose {
                log.line(format!(
                    "view {} fused {} pairs into {} points",
                    center_id,
                    pairs.len(),
                    cloud.len() - before
                ));
            }
        }

        Ok(if cloud.is_empty() { None } else { Some(cloud) })
    }
}

fn camera_center(view: &RefinedView) -> Vector3<f64> {
    view.world_to_view.inverse_transform_point(&Point3::origin()).coords
}

fn stereo_parameters(settings: &DisparitySettings, baseline: f64, focal: f64) -> DisparityParameters {
    DisparityParameters {
        disparity_min: settings.disparity_min,
        disparity_range: settings.disparity_range,
        baseline,
        focal,
    }
}

/// Sum of absolute differences block matching along image rows.
///
/// The right image must show the scene shifted to the left. Only sampled pixels
/// receive a disparity, the rest stay invalid.
pub fn block_match(left: &GrayImage, right: &GrayImage, settings: &DisparitySettings) -> DisparityImage {
    let (width, height) = left.dimensions();
    let invalid = settings.disparity_range as f32;
    let rx = settings.block_radius_x;
    let ry = settings.block_radius_y;

    let rows: Vec<(u32, Vec<(u32, f32)>)> = (ry..height.saturating_sub(ry))
        .into_par_iter()
        .filter(|y| y % SAMPLE_STEP == 0)
        .map(|y| {
            let row = (rx..width.saturating_sub(rx))
                .filter(|x| x % SAMPLE_STEP == 0)
                .filter_map(|x| {
                    best_disparity(left, right, x, y, settings).map(|d| (x, d as f32))
                })
                .collect();
            (y, row)
        })
        .collect();

    let mut disparity = DisparityImage::filled(width, height, invalid);
    for (y, row) in rows {
        for (x, d) in row {
            disparity.set(x, y, d);
        }
    }
    disparity
}

/// The disparity (relative to the minimum) with the lowest matching cost.
fn best_disparity(
    left: &GrayImage,
    right: &GrayImage,
    x: u32,
    y: u32,
    settings: &DisparitySettings,
) -> Option<u32> {
    let rx = settings.block_radius_x;
    let ry = settings.block_radius_y;
    let mut best: Option<(u32, u32)> = None;
    for d in 0..settings.disparity_range {
        let shift = settings.disparity_min + d;
        if shift > x.saturating_sub(rx) {
            break;
        }
        let mut cost = 0;
        for dy in 0..=2 * ry {
            for dx in 0..=2 * rx {
                let (lx, ly) = (x + dx - rx, y + dy - ry);
                let l = left.get_pixel(lx, ly).0[0] as i32;
                let r = right.get_pixel(lx - shift, ly).0[0] as i32;
                cost += (l - r).unsigned_abs();
            }
        }
        if best.map_or(true, |(best_cost, _)| cost < best_cost) {
            best = Some((cost, d));
        }
    }
    best.map(|(_, d)| d)
}

/// Averages depth-normalized disparities and expresses the result relative to
/// `reference_baseline`.
fn fuse(pairs: &[(DisparityImage, f64)], reference_baseline: f64, range: u32) -> DisparityImage {
    let (first, _) = &pairs[0];
    let invalid = range as f32;
    let mut fused = DisparityImage::filled(first.width, first.height, invalid);
    for (ix, value) in fused.data.iter_mut().enumerate() {
        let (sum, count) = pairs
            .iter()
            .filter(|(pair, _)| pair.data[ix] < invalid)
            .fold((0.0, 0), |(sum, count), (pair, baseline)| {
                (sum + pair.data[ix] as f64 / baseline, count + 1)
            });
        if count > 0 {
            let d = (sum / count as f64 * reference_baseline) as f32;
            if d < invalid {
                *value = d;
            }
        }
    }
    fused
}
