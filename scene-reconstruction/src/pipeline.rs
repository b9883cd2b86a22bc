use crate::checkpoint::CheckpointStore;
use crate::collaborators::Backend;
use crate::config_store::{self, ConfigWarning};
use crate::error::{io_at, PipelineError, Result};
use crate::images::{list_images, ImageSequence};
use crate::output::prepare_output;
use crate::settings::ConfigSet;
use crate::stages::{
    compute_pairwise, compute_scenes, find_similar, load_pairwise, load_scenes, load_similar,
    plan_scenes, profile, reconstruct_scene, SceneOutcome,
};
use crate::summary::{human_duration, write_index_to_image, VerboseLog};
use log::*;
use rayon::ThreadPoolBuilder;
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

pub const INDEX_FILE: &str = "index_to_image.txt";
pub const VERBOSE_FILE: &str = "verbose.txt";
pub const CONFIGURATIONS_DIR: &str = "configurations";

/// Largest disparity range the dense stage supports.
pub const MAX_DISPARITY_RANGE: u32 = 255;

/// Which stages are loaded from a previous run instead of computed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ResumeFrom {
    /// Compute everything.
    #[default]
    Nothing,
    /// Load similarity and pairwise, compute the rest.
    Sparse,
    /// Load everything up to the refined structure, compute only dense.
    Dense,
}

impl ResumeFrom {
    /// Resuming from sparse takes precedence if both are requested.
    pub fn from_flags(rerun_sparse: bool, rerun_dense: bool) -> Self {
        if rerun_sparse {
            ResumeFrom::Sparse
        } else if rerun_dense {
            ResumeFrom::Dense
        } else {
            ResumeFrom::Nothing
        }
    }
}

/// What happens when one of several scenes fails.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum SceneFailurePolicy {
    /// The whole run fails.
    #[default]
    Abort,
    /// The scene is recorded as failed and the remaining scenes are processed.
    Skip,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOptions {
    pub output: PathBuf,
    /// Directory with configuration files overriding the defaults
    pub config_path: Option<PathBuf>,
    /// Images with more pixels than this are downsized. Zero disables downsizing.
    pub max_pixels: u64,
    /// Overrides the configured minimum disparity
    pub minimum_disparity: Option<f64>,
    /// Overrides the configured disparity range if not zero
    pub max_disparity: u32,
    /// Input images are a temporal sequence
    pub ordered: bool,
    pub try_harder: bool,
    pub all_scenes: bool,
    pub resume: ResumeFrom,
    pub delete_output: bool,
    /// Mirror the verbose log to stdout
    pub verbose: bool,
    pub save_fused_disparity: bool,
    /// Worker threads, zero for the system default
    pub max_threads: usize,
    /// Only consulted when processing all scenes
    pub scene_failure: SceneFailurePolicy,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            output: PathBuf::from("output"),
            config_path: None,
            max_pixels: 800 * 600,
            minimum_disparity: None,
            max_disparity: 0,
            ordered: false,
            try_harder: false,
            all_scenes: false,
            resume: ResumeFrom::Nothing,
            delete_output: false,
            verbose: false,
            save_fused_disparity: false,
            max_threads: 0,
            scene_failure: SceneFailurePolicy::Abort,
        }
    }
}

impl PipelineOptions {
    /// Applies the options which take precedence over configuration files.
    pub fn apply_overrides(&self, configs: &mut ConfigSet) {
        if self.max_disparity > 0 {
            configs.sparse_to_dense.disparity.disparity_range = self.max_disparity;
        }
        if let Some(minimum) = self.minimum_disparity {
            configs.sparse_to_dense.minimum_disparity = minimum;
        }
    }

    fn check(&self) -> Result<()> {
        if self.max_disparity > MAX_DISPARITY_RANGE {
            return Err(PipelineError::DisparityRangeTooLarge {
                max_disparity: self.max_disparity,
            });
        }
        if self.delete_output && self.resume != ResumeFrom::Nothing {
            return Err(PipelineError::ConflictingOptions(
                "deleting the output would remove the results being resumed from",
            ));
        }
        Ok(())
    }
}

/// Everything a stage needs, shared read-only across the run.
#[derive(Debug)]
pub struct PipelineContext {
    pub configs: ConfigSet,
    pub images: ImageSequence,
    pub store: CheckpointStore,
    pub verbose: VerboseLog,
    pub save_fused_disparity: bool,
}

/// A scene that failed and was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneFailure {
    pub directory: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub scenes: Vec<SceneOutcome>,
    pub failed: Vec<SceneFailure>,
    pub config_warnings: Vec<ConfigWarning>,
    pub elapsed: Duration,
}

/// Sequences the stages of a reconstruction over a set of input images.
pub struct Pipeline<B> {
    backend: B,
    options: PipelineOptions,
}

impl<B> Pipeline<B>
where
    B: Backend + Sync,
{
    pub fn new(backend: B, options: PipelineOptions) -> Self {
        Self { backend, options }
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Lists the images selected by `pattern` and runs on them.
    pub fn run_pattern(&self, pattern: &str) -> Result<RunSummary> {
        let inputs = list_images(pattern)?;
        if inputs.is_empty() {
            error!("no inputs found, bad path or pattern? {}", pattern);
            return Err(PipelineError::NoInputsFound {
                pattern: pattern.to_owned(),
            });
        }
        self.run(inputs)
    }

    /// Runs every stage.
    ///
    /// Input problems are detected before anything is written to the output directory.
    pub fn run(&self, inputs: Vec<PathBuf>) -> Result<RunSummary> {
        if inputs.is_empty() {
            return Err(PipelineError::NoInputsFound {
                pattern: String::new(),
            });
        }
        self.options.check()?;

        let pool = ThreadPoolBuilder::new()
            .num_threads(self.options.max_threads)
            .build()?;
        pool.install(|| self.run_in_pool(inputs))
    }

    fn run_in_pool(&self, inputs: Vec<PathBuf>) -> Result<RunSummary> {
        let start = Instant::now();
        let options = &self.options;
        let output = options.output.as_path();

        let _lock = prepare_output(output, options.delete_output)?;

        let verbose = VerboseLog::create(&output.join(VERBOSE_FILE), options.verbose)?;
        verbose.line(format!("ordered        = {}", options.ordered));
        verbose.line(format!("max pixels     = {}", options.max_pixels));
        verbose.line(format!("resume         = {:?}", options.resume));
        verbose.line(format!("output dir     = {}", output.display()));
        verbose.line(format!("Total images: {}", inputs.len()));

        info!("total images: {}", inputs.len());
        write_index_to_image(&output.join(INDEX_FILE), &inputs)?;

        let base = if options.try_harder {
            ConfigSet::try_harder()
        } else {
            ConfigSet::default()
        };
        let resolved = config_store::resolve(options.config_path.as_deref(), base);
        for warning in &resolved.warnings {
            verbose.line(format!("configuration: {}", warning));
        }
        let mut configs = resolved.configs;
        options.apply_overrides(&mut configs);
        config_store::save(&configs, &output.join(CONFIGURATIONS_DIR))?;

        let ctx = PipelineContext {
            configs,
            images: ImageSequence::new(inputs, options.max_pixels),
            store: CheckpointStore::new(output),
            verbose,
            save_fused_disparity: options.save_fused_disparity,
        };
        let backend: &dyn Backend = &self.backend;
        let resume = options.resume;

        let similar = profile(&ctx, "similarity", || match resume {
            ResumeFrom::Nothing => find_similar(&ctx, backend, options.ordered),
            _ => load_similar(&ctx),
        })?;

        let graph = profile(&ctx, "pairwise", || match resume {
            ResumeFrom::Nothing => compute_pairwise(&ctx, backend, &similar),
            _ => load_pairwise(&ctx),
        })?;

        let plans = match resume {
            ResumeFrom::Dense => profile(&ctx, "loading scenes", || {
                load_scenes(&ctx, options.all_scenes)
            })?,
            _ => {
                let scenes = profile(&ctx, "metric", || {
                    compute_scenes(&ctx, backend, &similar, &graph)
                })?;
                plan_scenes(scenes, options.all_scenes)
            }
        };

        let mut scenes = vec![];
        let mut failed = vec![];
        for plan in &plans {
            let stage = format!("scene {}", plan.directory);
            let result = profile(&ctx, &stage, || {
                reconstruct_scene(
                    &ctx,
                    backend,
                    &similar,
                    &graph,
                    plan,
                    resume == ResumeFrom::Dense,
                )
            });
            match result {
                Ok(outcome) => scenes.push(outcome),
                Err(e) if options.all_scenes && options.scene_failure == SceneFailurePolicy::Skip => {
                    warn!("skipping {}: {}", plan.directory, e);
                    failed.push(SceneFailure {
                        directory: plan.directory.clone(),
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
        if scenes.is_empty() {
            return Err(PipelineError::AllScenesFailed {
                count: plans.len(),
            });
        }

        let elapsed = start.elapsed();
        info!("total time: {}", human_duration(elapsed));
        ctx.verbose
            .line(format!("Total Time: {}", human_duration(elapsed)));
        let verbose_path = output.join(VERBOSE_FILE);
        ctx.verbose.clone().flush().map_err(io_at(verbose_path))?;

        Ok(RunSummary {
            scenes,
            failed,
            config_warnings: resolved.warnings,
            elapsed,
        })
    }
}
