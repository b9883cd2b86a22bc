//! One driver per pipeline stage.
//!
//! Each driver either computes its result through a collaborator and persists it,
//! or loads the result a previous run persisted.

mod dense;
mod metric;
mod pairwise;
mod similar;

pub use dense::*;
pub use metric::*;
pub use pairwise::*;
pub use similar::*;

use crate::error::Result;
use crate::pipeline::PipelineContext;
use log::*;
use std::time::Instant;

/// Runs a stage, logging how long it took or why it failed.
pub fn profile<T>(ctx: &PipelineContext, stage: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let start = Instant::now();
    debug!("{}: started", stage);
    let result = f();
    let elapsed = start.elapsed();
    match &result {
        Ok(_) => {
            info!("{} took {:.2?}", stage, elapsed);
            ctx.verbose.line(format!("{} took {:.2?}", stage, elapsed));
        }
        Err(e) => {
            error!("{} failed after {:.2?}: {}", stage, elapsed, e);
            ctx.verbose.line(format!("{} failed: {}", stage, e));
        }
    }
    result
}
