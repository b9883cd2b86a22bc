use crate::camera::{CameraBank, CANONICAL_HFOV_DEGREES};
use crate::checkpoint::Stage;
use crate::collaborators::Backend;
use crate::error::{PipelineError, Result};
use crate::images::{average_gray, view_id, DimensionTable, ImageDimension};
use crate::pipeline::PipelineContext;
use crate::scene::SimilarityDatabase;
use log::*;

/// Everything the similarity stage produces.
#[derive(Debug, Clone)]
pub struct SimilarityOutput {
    pub database: SimilarityDatabase,
    pub cameras: CameraBank,
    /// Downsized dimension of every input image, `None` where it couldn't be read
    pub dimensions: DimensionTable,
}

/// Finds similar images and saves the similarity database.
///
/// Images are streamed in input order. Ordered input goes through the tracker backed
/// index, anything else through the recognition index. Images which fail to decode
/// are skipped.
pub fn find_similar(
    ctx: &PipelineContext,
    backend: &dyn Backend,
    ordered: bool,
) -> Result<SimilarityOutput> {
    let mut index = if ordered {
        info!("finding similar images using the feature tracker");
        backend.similar_tracker(&ctx.configs.tracker, &ctx.configs.similar_tracker)
    } else {
        info!("finding similar images using recognition");
        backend.similar_unordered(&ctx.configs.similar_unordered)
    };
    index.set_verbose(ctx.verbose.clone());

    let mut cameras = CameraBank::new();
    let mut canonical = None;
    let mut dimensions = DimensionTable::new();
    for (ix, loaded) in ctx.images.iter() {
        let image = match loaded {
            Ok(image) => image,
            Err(e) => {
                warn!("skipping image {}: {}", ix, e);
                ctx.verbose.line(format!("skipping image {}: {}", ix, e));
                dimensions.push(None);
                continue;
            }
        };
        let id = view_id(ix);
        debug!("adding image {} {}x{}", id, image.width(), image.height());

        // Every view shares one camera whose prior comes from the first usable image.
        let camera = *canonical.get_or_insert_with(|| {
            cameras.add_camera_canonical(image.width(), image.height(), CANONICAL_HFOV_DEGREES)
        });
        cameras.add_view(id.clone(), camera);
        dimensions.push(Some(ImageDimension::new(image.width(), image.height())));

        index.add_image(&id, &average_gray(&image))?;
    }

    if dimensions.recorded() == 0 {
        return Err(PipelineError::NoUsableImages {
            total: ctx.images.len(),
        });
    }

    let mut database = index.fixate()?;
    if !database.is_fixated() {
        warn!("similarity index returned an unfixated database, fixating it");
        database.fixate();
    }
    ctx.store.save(Stage::Similarity, None, &database)?;
    info!(
        "similarity found for {} of {} images",
        database.views().len(),
        ctx.images.len()
    );
    Ok(SimilarityOutput {
        database,
        cameras,
        dimensions,
    })
}

/// Loads the similarity database and rebuilds the camera bank from image headers.
pub fn load_similar(ctx: &PipelineContext) -> Result<SimilarityOutput> {
    info!("loading similar from disk");
    ctx.verbose.line("loading similar from disk");
    let dimensions = ctx.images.load_dimensions();
    let first = dimensions.first().ok_or(PipelineError::NoUsableImages {
        total: ctx.images.len(),
    })?;
    let database: SimilarityDatabase = ctx.store.load(Stage::Similarity, None)?;

    let mut cameras = CameraBank::new();
    let camera = cameras.add_camera_canonical(first.width, first.height, CANONICAL_HFOV_DEGREES);
    for id in database.views() {
        cameras.add_view(id.clone(), camera);
    }
    Ok(SimilarityOutput {
        database,
        cameras,
        dimensions,
    })
}
