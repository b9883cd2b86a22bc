use super::SimilarityOutput;
use crate::checkpoint::Stage;
use crate::collaborators::Backend;
use crate::error::Result;
use crate::pipeline::PipelineContext;
use crate::scene::PairwiseGraph;
use log::*;

/// Builds the pairwise graph and saves it.
pub fn compute_pairwise(
    ctx: &PipelineContext,
    backend: &dyn Backend,
    similar: &SimilarityOutput,
) -> Result<PairwiseGraph> {
    let mut builder = backend.pairwise(&ctx.configs.pairwise);
    builder.set_verbose(ctx.verbose.clone());
    let graph = builder.process(&similar.database, &similar.cameras)?;
    ctx.store.save(Stage::Pairwise, None, &graph)?;

    let edges_3d = graph.edges.iter().filter(|e| e.is_3d).count();
    info!(
        "pairwise graph has {} nodes, {} edges ({} 3D)",
        graph.nodes.len(),
        graph.edges.len(),
        edges_3d
    );
    Ok(graph)
}

pub fn load_pairwise(ctx: &PipelineContext) -> Result<PairwiseGraph> {
    info!("loading pairwise from disk");
    ctx.verbose.line("loading pairwise from disk");
    ctx.store.load(Stage::Pairwise, None)
}
