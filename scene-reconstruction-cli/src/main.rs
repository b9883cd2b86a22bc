mod baseline;

use anyhow::{anyhow, Context};
use baseline::BaselineBackend;
use log::*;
use scene_reconstruction::{
    allocate, human_duration, Pipeline, PipelineOptions, ResumeFrom, SceneFailurePolicy,
};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use structopt::StructOpt;

/// How many sibling names `--NewOutput` tries before giving up.
const MAX_OUTPUT_ATTEMPTS: usize = 1000;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct SceneFailureArg(SceneFailurePolicy);

impl FromStr for SceneFailureArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "abort" => Ok(Self(SceneFailurePolicy::Abort)),
            "skip" => Ok(Self(SceneFailurePolicy::Skip)),
            other => Err(format!("unknown scene failure policy '{}'", other)),
        }
    }
}

#[derive(Debug, StructOpt)]
#[structopt(
    name = "scene-reconstruction",
    about = "Reconstructs dense point clouds of the scenes seen in a set of images"
)]
struct Opt {
    /// Images to process.
    ///
    /// A directory adds every file with a known image extension. Patterns can be
    /// used too, e.g. 'glob:data/**/left*.jpg' or 'regex:data/\w+/left\d+.jpg'.
    #[structopt(long = "Input")]
    input: String,
    /// Path to the output directory.
    #[structopt(short, long = "Output", default_value = "output", parse(from_os_str))]
    output: PathBuf,
    /// Directory with configuration files which override the defaults.
    #[structopt(long = "ConfigPath", parse(from_os_str))]
    config_path: Option<PathBuf>,
    /// Images with more pixels than this are downsized.
    #[structopt(long = "MaxPixels", default_value = "480000")]
    max_pixels: u64,
    /// Fused disparities below this are discarded, which removes noisy distant points.
    #[structopt(long = "MinDisparity")]
    min_disparity: Option<f64>,
    /// Overrides the disparity range. Can't exceed 255.
    #[structopt(long = "MaxDisparity", default_value = "0")]
    max_disparity: u32,
    /// Images are a sequence and a feature tracker can be used.
    #[structopt(long = "Ordered")]
    ordered: bool,
    /// Slower but more likely to produce a good reconstruction.
    #[structopt(long = "TryHarder")]
    try_harder: bool,
    /// Densify every scene, not just the largest.
    #[structopt(long = "AllScenes")]
    all_scenes: bool,
    /// Reruns the sparse reconstruction using the saved similar images and pairwise graph.
    #[structopt(long = "RerunSparse")]
    rerun_sparse: bool,
    /// Reruns the dense reconstruction using the saved sparse scenes.
    #[structopt(long = "RerunDense")]
    rerun_dense: bool,
    /// Recursively deletes the output directory first.
    #[structopt(long = "DeleteOutput")]
    delete_output: bool,
    /// Prints the verbose log to stdout. It is always saved to disk.
    #[structopt(long = "Verbose")]
    verbose: bool,
    /// Saves a visualization of every fused disparity image.
    #[structopt(long = "SaveFusedDisparity")]
    save_fused_disparity: bool,
    /// Number of worker threads. 0 means the system default.
    #[structopt(long = "Threads", default_value = "0")]
    threads: usize,
    /// What to do when one of several scenes fails: abort or skip.
    #[structopt(long = "SceneFailure", default_value = "abort")]
    scene_failure: SceneFailureArg,
    /// Writes into a new sibling of the output directory instead of reusing it.
    #[structopt(long = "NewOutput")]
    new_output: bool,
}

impl Opt {
    fn pipeline_options(&self, output: PathBuf) -> PipelineOptions {
        PipelineOptions {
            output,
            config_path: self.config_path.clone(),
            max_pixels: self.max_pixels,
            minimum_disparity: self.min_disparity,
            max_disparity: self.max_disparity,
            ordered: self.ordered,
            try_harder: self.try_harder,
            all_scenes: self.all_scenes,
            resume: ResumeFrom::from_flags(self.rerun_sparse, self.rerun_dense),
            delete_output: self.delete_output,
            verbose: self.verbose,
            save_fused_disparity: self.save_fused_disparity,
            max_threads: self.threads,
            scene_failure: self.scene_failure.0,
        }
    }
}

fn fresh_output(output: &Path) -> anyhow::Result<PathBuf> {
    let parent = match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let base = output
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("output path {} has no usable name", output.display()))?;
    Ok(allocate(parent, base, MAX_OUTPUT_ATTEMPTS)?)
}

fn run(opt: Opt) -> anyhow::Result<()> {
    let output = if opt.new_output {
        fresh_output(&opt.output)?
    } else {
        opt.output.clone()
    };
    info!("input pattern  = {}", opt.input);
    info!("output dir     = {}", output.display());

    let pipeline = Pipeline::new(BaselineBackend, opt.pipeline_options(output.clone()));
    let summary = pipeline
        .run_pattern(&opt.input)
        .with_context(|| format!("reconstruction into {} failed", output.display()))?;

    for scene in &summary.scenes {
        info!(
            "{}: {} views, {} points ({} clipped)",
            scene.directory, scene.views, scene.points, scene.clipped_points
        );
    }
    for failure in &summary.failed {
        warn!("{} was skipped: {}", failure.directory, failure.reason);
    }
    info!("total time: {}", human_duration(summary.elapsed));
    println!("Finished!");
    Ok(())
}

fn main() {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "info");
    }
    pretty_env_logger::init_timed();

    let opt = Opt::from_args();
    if let Err(e) = run(opt) {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}
