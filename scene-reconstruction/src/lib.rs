//! Staged, resumable multi-view scene reconstruction.
//!
//! A [`Pipeline`] drives a set of images through similar image discovery, pairwise
//! graph construction, metric reconstruction, bundle adjustment, and dense stereo.
//! The result of every stage is saved under the output directory so that a later
//! run can resume from it. The algorithms themselves are supplied by a [`Backend`].

mod camera;
mod checkpoint;
mod cloud;
mod collaborators;
mod disparity;
mod error;
mod images;
mod output;
mod pipeline;
mod scene;
mod settings;
mod summary;

pub mod config_store;
pub mod fake;
pub mod stages;

pub use camera::*;
pub use checkpoint::*;
pub use cloud::*;
pub use collaborators::*;
pub use disparity::*;
pub use error::*;
pub use images::*;
pub use output::*;
pub use pipeline::*;
pub use scene::*;
pub use settings::*;
pub use summary::*;
