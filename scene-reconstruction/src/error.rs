use crate::checkpoint::Stage;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Every way a reconstruction run can fail.
///
/// Recoverable problems (a single undecodable image, a bad configuration file)
/// are logged where they happen and never surface here.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no inputs found, bad path or pattern? {pattern}")]
    NoInputsFound { pattern: String },
    #[error("none of the {total} input images could be decoded")]
    NoUsableImages { total: usize },
    #[error("invalid input pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("max disparity can't be larger than 255, max_disparity={max_disparity}")]
    DisparityRangeTooLarge { max_disparity: u32 },
    #[error("conflicting options: {0}")]
    ConflictingOptions(&'static str),
    #[error("asked to resume from {stage} but it was never computed, missing {}", .path.display())]
    MissingCheckpoint { stage: Stage, path: PathBuf },
    #[error("{stage} checkpoint {} is unreadable: {source}", .path.display())]
    CorruptCheckpoint {
        stage: Stage,
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("can't load sparse scene, no scene directories found in {}", .path.display())]
    NoScenesFound { path: PathBuf },
    #[error("metric reconstruction failed: {reason}")]
    ReconstructionFailed { reason: String },
    #[error("bundle adjustment failed for {scene}: {reason}")]
    RefineFailed { scene: String, reason: String },
    #[error("dense reconstruction failed for {scene}: {reason}")]
    DenseReconstructionFailed { scene: String, reason: String },
    #[error("all {count} scenes failed")]
    AllScenesFailed { count: usize },
    #[error("no free directory for {} after {attempts} attempts", .base.display())]
    TooManyCollisions { base: PathBuf, attempts: usize },
    #[error(
        "output directory {} is in use by another run, delete {} if no other run is active",
        .path.display(),
        .lock.display()
    )]
    OutputLocked { path: PathBuf, lock: PathBuf },
    #[error("similarity database is fixated, no views or relations can be added")]
    DatabaseFixated,
    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("{stage} collaborator failed: {message}")]
    Collaborator { stage: &'static str, message: String },
    #[error("i/o error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("image error at {}: {source}", .path.display())]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("malformed point cloud {}: {reason}", .path.display())]
    Ply { path: PathBuf, reason: String },
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

/// Attaches a path to an [`std::io::Error`].
pub(crate) fn io_at(path: impl AsRef<Path>) -> impl FnOnce(std::io::Error) -> PipelineError {
    let path = path.as_ref().to_path_buf();
    move |source| PipelineError::Io { path, source }
}

/// Attaches a path to an [`image::ImageError`].
pub(crate) fn image_at(path: impl AsRef<Path>) -> impl FnOnce(image::ImageError) -> PipelineError {
    let path = path.as_ref().to_path_buf();
    move |source| PipelineError::Image { path, source }
}
