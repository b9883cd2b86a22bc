use crate::checkpoint::write_atomic;
use crate::error::Result;
use crate::settings::ConfigSet;
use log::*;
use serde::{de::DeserializeOwned, Serialize};
use std::fs;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

pub const TRACKER_FILE: &str = "tracker.yaml";
pub const SIMILAR_TRACKER_FILE: &str = "similar_tracker.yaml";
pub const SIMILAR_UNORDERED_FILE: &str = "similar_unordered.yaml";
pub const PAIRWISE_FILE: &str = "pairwise.yaml";
pub const SPARSE_TO_DENSE_FILE: &str = "sparse_to_dense.yaml";

/// A configuration file that could not be used. The default was used in its place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    Missing { path: PathBuf },
    Unreadable { path: PathBuf, message: String },
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigWarning::Missing { path } => {
                write!(f, "{} is missing, using the default", path.display())
            }
            ConfigWarning::Unreadable { path, message } => {
                write!(f, "{} is unreadable, using the default: {}", path.display(), message)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub configs: ConfigSet,
    pub warnings: Vec<ConfigWarning>,
}

/// Resolves every configuration object.
///
/// Without a directory this is `base`. With one, each object is loaded from its own
/// file and falls back to its value in `base` if that file is missing or can't be
/// parsed. This never fails.
pub fn resolve(override_dir: Option<&Path>, base: ConfigSet) -> ResolvedConfig {
    let Some(dir) = override_dir else {
        return ResolvedConfig {
            configs: base,
            warnings: vec![],
        };
    };
    info!("loading configurations from {}", dir.display());

    let mut warnings = vec![];
    let configs = ConfigSet {
        tracker: resolve_one(dir, TRACKER_FILE, base.tracker, &mut warnings),
        similar_tracker: resolve_one(
            dir,
            SIMILAR_TRACKER_FILE,
            base.similar_tracker,
            &mut warnings,
        ),
        similar_unordered: resolve_one(
            dir,
            SIMILAR_UNORDERED_FILE,
            base.similar_unordered,
            &mut warnings,
        ),
        pairwise: resolve_one(dir, PAIRWISE_FILE, base.pairwise, &mut warnings),
        sparse_to_dense: resolve_one(
            dir,
            SPARSE_TO_DENSE_FILE,
            base.sparse_to_dense,
            &mut warnings,
        ),
    };
    ResolvedConfig { configs, warnings }
}

fn resolve_one<T: DeserializeOwned>(
    dir: &Path,
    name: &str,
    fallback: T,
    warnings: &mut Vec<ConfigWarning>,
) -> T {
    let path = dir.join(name);
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            warn!("configuration {} is missing, using the default", path.display());
            warnings.push(ConfigWarning::Missing { path });
            return fallback;
        }
        Err(e) => {
            error!("failed to read {}: {}", path.display(), e);
            warnings.push(ConfigWarning::Unreadable {
                path,
                message: e.to_string(),
            });
            return fallback;
        }
    };
    match serde_yaml::from_str(&text) {
        Ok(value) => value,
        Err(e) => {
            error!("failed to parse {}: {}", path.display(), e);
            warnings.push(ConfigWarning::Unreadable {
                path,
                message: e.to_string(),
            });
            fallback
        }
    }
}

/// Writes every configuration object into `dir`, creating it if needed.
pub fn save(configs: &ConfigSet, dir: &Path) -> Result<()> {
    save_one(&configs.tracker, &dir.join(TRACKER_FILE))?;
    save_one(&configs.similar_tracker, &dir.join(SIMILAR_TRACKER_FILE))?;
    save_one(&configs.similar_unordered, &dir.join(SIMILAR_UNORDERED_FILE))?;
    save_one(&configs.pairwise, &dir.join(PAIRWISE_FILE))?;
    save_one(&configs.sparse_to_dense, &dir.join(SPARSE_TO_DENSE_FILE))
}

fn save_one<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    write_atomic(path, |w| {
        serde_yaml::to_writer(w, value).map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    })
}
