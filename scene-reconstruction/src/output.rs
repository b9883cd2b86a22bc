use crate::error::{io_at, PipelineError, Result};
use log::*;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Name of the file which marks an output directory as in use.
pub const LOCK_FILE: &str = ".lock";

/// Creates the output directory and takes its lock.
///
/// With `delete_existing` everything already in the directory is removed, but only
/// once the lock is held so a directory in use by another run is never touched.
pub fn prepare_output(path: &Path, delete_existing: bool) -> Result<OutputLock> {
    fs::create_dir_all(path).map_err(io_at(path))?;
    let lock = OutputLock::acquire(path)?;
    if delete_existing {
        info!("deleting the contents of output directory {}", path.display());
        for entry in fs::read_dir(path).map_err(io_at(path))? {
            let entry = entry.map_err(io_at(path))?;
            if entry.file_name() == LOCK_FILE {
                continue;
            }
            let target = entry.path();
            if entry.file_type().map_err(io_at(&target))?.is_dir() {
                fs::remove_dir_all(&target).map_err(io_at(&target))?;
            } else {
                fs::remove_file(&target).map_err(io_at(&target))?;
            }
        }
    }
    Ok(lock)
}

/// Creates and returns the first free directory among `base`, `base0`, `base1`, ...
/// inside `parent`.
///
/// Gives up with [`PipelineError::TooManyCollisions`] after `max_attempts` names.
pub fn allocate(parent: &Path, base: &str, max_attempts: usize) -> Result<PathBuf> {
    fs::create_dir_all(parent).map_err(io_at(parent))?;
    let candidates = std::iter::once(base.to_owned()).chain((0..).map(|i| format!("{}{}", base, i)));
    for name in candidates.take(max_attempts) {
        let path = parent.join(name);
        match fs::create_dir(&path) {
            Ok(()) => return Ok(path),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(io_at(&path)(e)),
        }
    }
    Err(PipelineError::TooManyCollisions {
        base: parent.join(base),
        attempts: max_attempts,
    })
}

/// Exclusive use of an output directory for the lifetime of a run.
#[derive(Debug)]
pub struct OutputLock {
    path: PathBuf,
}

impl OutputLock {
    /// Fails with [`PipelineError::OutputLocked`] if another run holds the directory.
    ///
    /// A lock left behind by a process which no longer exists is taken over.
    pub fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILE);
        match Self::create(dir, &path) {
            Err(PipelineError::OutputLocked { .. }) if is_stale(&path) => {
                warn!("removing stale lock {}", path.display());
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(io_at(&path)(e)),
                }
                Self::create(dir, &path)
            }
            other => other,
        }
    }

    fn create(dir: &Path, path: &Path) -> Result<Self> {
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(PipelineError::OutputLocked {
                    path: dir.to_path_buf(),
                    lock: path.to_path_buf(),
                })
            }
            Err(e) => return Err(io_at(path)(e)),
        };
        writeln!(file, "{}", std::process::id()).map_err(io_at(path))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

/// A lock is stale if the process id it records is known to be gone.
fn is_stale(lock: &Path) -> bool {
    match fs::read_to_string(lock).map(|text| text.trim().parse::<u32>()) {
        Ok(Ok(pid)) => process_alive(pid) == Some(false),
        _ => false,
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> Option<bool> {
    Some(Path::new("/proc").join(pid.to_string()).exists())
}

// No portable way to ask, so the lock is assumed to be held.
#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> Option<bool> {
    None
}

impl Drop for OutputLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("failed to remove {}: {}", self.path.display(), e);
        }
    }
}
