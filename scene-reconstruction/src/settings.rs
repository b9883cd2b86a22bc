use serde::{Deserialize, Serialize};

/// A count threshold which scales with the size of what it is applied to.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelativeThreshold {
    /// Fraction of the total
    pub fraction: f64,
    /// The threshold never drops below this
    pub minimum: usize,
}

impl RelativeThreshold {
    pub fn relative(fraction: f64, minimum: usize) -> Self {
        Self { fraction, minimum }
    }

    pub fn compute(&self, total: usize) -> usize {
        ((self.fraction * total as f64) as usize).max(self.minimum)
    }
}

/// The settings for the frame-to-frame feature tracker.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerSettings {
    /// The maximum number of tracks kept alive at once
    #[serde(default = "default_tracker_maximum_tracks")]
    pub maximum_tracks: usize,
    /// Non-maximum suppression radius of the point detector
    #[serde(default = "default_tracker_detect_radius")]
    pub detect_radius: usize,
    /// Radius of the template tracked between frames
    #[serde(default = "default_tracker_template_radius")]
    pub template_radius: usize,
    /// Number of pyramid levels
    #[serde(default = "default_tracker_pyramid_levels")]
    pub pyramid_levels: usize,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            maximum_tracks: default_tracker_maximum_tracks(),
            detect_radius: default_tracker_detect_radius(),
            template_radius: default_tracker_template_radius(),
            pyramid_levels: default_tracker_pyramid_levels(),
        }
    }
}

/// The settings for finding similar images in an ordered sequence.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarTrackerSettings {
    /// Minimum number of matched features for two images to be similar
    #[serde(default = "default_similar_tracker_minimum_similar")]
    pub minimum_similar: RelativeThreshold,
    /// Radius of the region described around each track
    #[serde(default = "default_similar_tracker_description_radius")]
    pub description_radius: usize,
    /// How many frames back to look for sequential matches
    #[serde(default = "default_similar_tracker_sequential_search_radius")]
    pub sequential_search_radius: usize,
    /// The maximum number of recognition results to consider per frame
    #[serde(default = "default_similar_tracker_limit_query")]
    pub limit_query: usize,
    /// Frames closer than this in the sequence are not matched by recognition
    #[serde(default = "default_similar_tracker_minimum_recognize_distance")]
    pub minimum_recognize_distance: usize,
    /// Minimum number of tracks in common for sequential frames to be similar
    #[serde(default = "default_similar_tracker_sequential_minimum_common_tracks")]
    pub sequential_minimum_common_tracks: RelativeThreshold,
}

impl Default for SimilarTrackerSettings {
    fn default() -> Self {
        Self {
            minimum_similar: default_similar_tracker_minimum_similar(),
            description_radius: default_similar_tracker_description_radius(),
            sequential_search_radius: default_similar_tracker_sequential_search_radius(),
            limit_query: default_similar_tracker_limit_query(),
            minimum_recognize_distance: default_similar_tracker_minimum_recognize_distance(),
            sequential_minimum_common_tracks:
                default_similar_tracker_sequential_minimum_common_tracks(),
        }
    }
}

/// The settings for finding similar images in an unordered collection.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarUnorderedSettings {
    /// Non-maximum suppression radius of the feature detector
    #[serde(default = "default_similar_unordered_extract_radius")]
    pub extract_radius: usize,
    /// The maximum number of features detected in an image
    #[serde(default = "default_similar_unordered_max_features")]
    pub max_features: usize,
    /// Minimum number of matched features for two images to be similar
    #[serde(default = "default_similar_unordered_minimum_similar")]
    pub minimum_similar: RelativeThreshold,
    /// The maximum number of recognition results to consider per image
    #[serde(default = "default_similar_unordered_limit_query")]
    pub limit_query: usize,
}

impl Default for SimilarUnorderedSettings {
    fn default() -> Self {
        Self {
            extract_radius: default_similar_unordered_extract_radius(),
            max_features: default_similar_unordered_max_features(),
            minimum_similar: default_similar_unordered_minimum_similar(),
            limit_query: default_similar_unordered_limit_query(),
        }
    }
}

/// The settings for scoring pairwise relationships.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairwiseSettings {
    /// Minimum inliers for a pure rotation model to be considered
    #[serde(default = "default_pairwise_rotation_minimum_inliers")]
    pub rotation_minimum_inliers: RelativeThreshold,
    /// Iterations of RANSAC when fitting the fundamental matrix
    #[serde(default = "default_pairwise_ransac_f_iterations")]
    pub ransac_f_iterations: usize,
    /// Inlier threshold in pixels when fitting the fundamental matrix
    #[serde(default = "default_pairwise_ransac_f_inlier_threshold")]
    pub ransac_f_inlier_threshold: f64,
    /// How much better the 3D model must score than rotation for an edge to be 3D
    #[serde(default = "default_pairwise_ratio_3d")]
    pub ratio_3d: f64,
}

impl Default for PairwiseSettings {
    fn default() -> Self {
        Self {
            rotation_minimum_inliers: default_pairwise_rotation_minimum_inliers(),
            ransac_f_iterations: default_pairwise_ransac_f_iterations(),
            ransac_f_inlier_threshold: default_pairwise_ransac_f_inlier_threshold(),
            ratio_3d: default_pairwise_ratio_3d(),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisparityApproach {
    BlockMatch,
    Sgm,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SgmPaths {
    P2,
    P4,
    P8,
    P16,
}

/// The settings of the stereo disparity algorithm.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisparitySettings {
    #[serde(default = "default_disparity_approach")]
    pub approach: DisparityApproach,
    /// Tolerance of the right-to-left validation, negative disables it
    #[serde(default = "default_disparity_validate_r_to_l")]
    pub validate_r_to_l: i32,
    /// Texture threshold, lower accepts more ambiguous matches
    #[serde(default = "default_disparity_texture")]
    pub texture: f64,
    #[serde(default = "default_disparity_min")]
    pub disparity_min: u32,
    /// Number of disparity values considered. This value is also the invalid sentinel.
    #[serde(default = "default_disparity_range")]
    pub disparity_range: u32,
    #[serde(default = "default_disparity_paths")]
    pub paths: SgmPaths,
    #[serde(default = "default_disparity_block_radius")]
    pub block_radius_x: u32,
    #[serde(default = "default_disparity_block_radius")]
    pub block_radius_y: u32,
}

impl Default for DisparitySettings {
    fn default() -> Self {
        Self {
            approach: default_disparity_approach(),
            validate_r_to_l: default_disparity_validate_r_to_l(),
            texture: default_disparity_texture(),
            disparity_min: default_disparity_min(),
            disparity_range: default_disparity_range(),
            paths: default_disparity_paths(),
            block_radius_x: default_disparity_block_radius(),
            block_radius_y: default_disparity_block_radius(),
        }
    }
}

/// The settings for turning a sparse scene into a dense cloud.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseToDenseSettings {
    #[serde(default)]
    pub disparity: DisparitySettings,
    /// Fused disparities below this are replaced with the invalid sentinel. Zero disables it.
    #[serde(default = "default_minimum_disparity")]
    pub minimum_disparity: f64,
    /// Points further than this from the origin are left out of the clipped cloud
    #[serde(default = "default_clip_distance")]
    pub clip_distance: f64,
    /// Maximum number of neighboring views fused into one center view
    #[serde(default = "default_max_fused_views")]
    pub max_fused_views: usize,
}

impl Default for SparseToDenseSettings {
    fn default() -> Self {
        Self {
            disparity: DisparitySettings::default(),
            minimum_disparity: default_minimum_disparity(),
            clip_distance: default_clip_distance(),
            max_fused_views: default_max_fused_views(),
        }
    }
}

/// Every named configuration object used by a run.
#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub struct ConfigSet {
    pub tracker: TrackerSettings,
    pub similar_tracker: SimilarTrackerSettings,
    pub similar_unordered: SimilarUnorderedSettings,
    pub pairwise: PairwiseSettings,
    pub sparse_to_dense: SparseToDenseSettings,
}

impl ConfigSet {
    /// Slower but with a greater chance of a good reconstruction.
    ///
    /// Lower thresholds and more iterations to remove outliers.
    pub fn try_harder() -> Self {
        let mut set = Self::default();

        set.tracker.maximum_tracks = 1200;
        set.tracker.detect_radius = 3;

        set.similar_tracker.minimum_similar = RelativeThreshold::relative(0.15, 50);
        set.similar_tracker.description_radius = 20;
        set.similar_tracker.sequential_search_radius = 15;
        set.similar_tracker.limit_query = 30;
        set.similar_tracker.minimum_recognize_distance = 0;
        set.similar_tracker.sequential_minimum_common_tracks =
            RelativeThreshold::relative(0.4, 200);

        set.similar_unordered.extract_radius = 1;
        set.similar_unordered.max_features = 1200;
        set.similar_unordered.minimum_similar = RelativeThreshold::relative(0.1, 50);

        set.pairwise.rotation_minimum_inliers = RelativeThreshold::relative(0.1, 50);
        set.pairwise.ransac_f_iterations = 2000;

        set
    }
}

fn default_tracker_maximum_tracks() -> usize {
    800
}

fn default_tracker_detect_radius() -> usize {
    6
}

fn default_tracker_template_radius() -> usize {
    3
}

fn default_tracker_pyramid_levels() -> usize {
    4
}

fn default_similar_tracker_minimum_similar() -> RelativeThreshold {
    RelativeThreshold::relative(0.3, 150)
}

fn default_similar_tracker_description_radius() -> usize {
    16
}

fn default_similar_tracker_sequential_search_radius() -> usize {
    8
}

fn default_similar_tracker_limit_query() -> usize {
    10
}

fn default_similar_tracker_minimum_recognize_distance() -> usize {
    30
}

fn default_similar_tracker_sequential_minimum_common_tracks() -> RelativeThreshold {
    RelativeThreshold::relative(0.5, 250)
}

fn default_similar_unordered_extract_radius() -> usize {
    2
}

fn default_similar_unordered_max_features() -> usize {
    800
}

fn default_similar_unordered_minimum_similar() -> RelativeThreshold {
    RelativeThreshold::relative(0.3, 150)
}

fn default_similar_unordered_limit_query() -> usize {
    10
}

fn default_pairwise_rotation_minimum_inliers() -> RelativeThreshold {
    RelativeThreshold::relative(0.2, 80)
}

fn default_pairwise_ransac_f_iterations() -> usize {
    500
}

fn default_pairwise_ransac_f_inlier_threshold() -> f64 {
    1.0
}

fn default_pairwise_ratio_3d() -> f64 {
    1.5
}

fn default_disparity_approach() -> DisparityApproach {
    DisparityApproach::Sgm
}

fn default_disparity_validate_r_to_l() -> i32 {
    0
}

fn default_disparity_texture() -> f64 {
    0.75
}

fn default_disparity_min() -> u32 {
    0
}

fn default_disparity_range() -> u32 {
    250
}

fn default_disparity_paths() -> SgmPaths {
    SgmPaths::P4
}

fn default_disparity_block_radius() -> u32 {
    3
}

fn default_minimum_disparity() -> f64 {
    0.0
}

fn default_clip_distance() -> f64 {
    50.0
}

fn default_max_fused_views() -> usize {
    6
}
