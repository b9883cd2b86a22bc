use crate::checkpoint::write_atomic;
use crate::error::{io_at, Result};
use crate::scene::WorkingSceneGraph;
use log::*;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Writes one input path per line. Line `i` is the image with view id `i`.
pub fn write_index_to_image(path: &Path, images: &[PathBuf]) -> Result<()> {
    write_atomic(path, |w| {
        for image in images {
            writeln!(w, "{}", image.display())?;
        }
        Ok(())
    })
}

#[derive(Debug)]
struct VerboseInner {
    file: Option<BufWriter<File>>,
    mirror: bool,
}

/// The run's diagnostic log.
///
/// Everything is written to the log file. If `mirror` is set it is also echoed to stdout.
/// Clones share the same file.
#[derive(Debug, Clone)]
pub struct VerboseLog {
    inner: Arc<Mutex<VerboseInner>>,
}

impl VerboseLog {
    pub fn create(path: &Path, mirror: bool) -> Result<Self> {
        let file = File::create(path).map_err(io_at(path))?;
        Ok(Self::from_inner(Some(BufWriter::new(file)), mirror))
    }

    /// A log that discards everything.
    pub fn sink() -> Self {
        Self::from_inner(None, false)
    }

    fn from_inner(file: Option<BufWriter<File>>, mirror: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VerboseInner { file, mirror })),
        }
    }

    /// Writes a line. Failures are reported through `log` rather than interrupting the run.
    pub fn line(&self, text: impl AsRef<str>) {
        let mut log = self.clone();
        if let Err(e) = writeln!(log, "{}", text.as_ref()) {
            warn!("failed to write verbose log: {}", e);
        }
    }
}

impl Write for VerboseLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(file) = &mut inner.file {
            file.write_all(buf)?;
        }
        if inner.mirror {
            io::stdout().write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(file) = &mut inner.file {
            file.flush()?;
        }
        if inner.mirror {
            io::stdout().flush()?;
        }
        Ok(())
    }
}

/// Describes every view of the working graph and how many of them the refined scene used.
pub fn write_sparse_summary(
    log: &VerboseLog,
    working: &WorkingSceneGraph,
    used_views: usize,
    total_views: usize,
) {
    log.line("-".repeat(76));
    for (order, view) in working.views.iter().enumerate() {
        let t = view.world_to_view.translation.vector;
        log.line(format!(
            "view[{:2}]='{:>2}' f={:6.1} k1={:6.3} k2={:6.3} T={{{:5.1},{:5.1},{:5.1}}} R={:5.3}",
            order,
            view.id,
            view.intrinsics.f,
            view.intrinsics.k1,
            view.intrinsics.k2,
            t.x,
            t.y,
            t.z,
            view.world_to_view.rotation.angle(),
        ));
    }
    log.line(format!("   Views used: {} / {}", used_views, total_views));
}

/// Formats as `days:hrs:min:sec`.
pub fn human_duration(duration: Duration) -> String {
    let seconds = duration.as_secs();
    format!(
        "{:03}:{:02}:{:02}:{:02} (days:hrs:min:sec)",
        seconds / 86400,
        (seconds / 3600) % 24,
        (seconds / 60) % 60,
        seconds % 60
    )
}
