//! Input discovery and uniform access to the input images.
//!
//! Every image is identified by its view id, the decimal index of its path in the
//! input list. Images are downsized so that they contain at most a fixed number
//! of pixels and are always loaded on demand rather than cached.

use crate::collaborators::ImageLookup;
use crate::error::{image_at, io_at, PipelineError, Result};
use image::{imageops::FilterType, GrayImage, Luma, RgbImage};
use log::*;
use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// File extensions which are treated as images when listing a directory.
pub const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "bmp", "gif", "tif", "tiff", "pgm", "ppm", "pnm",
];

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDimension {
    pub width: u32,
    pub height: u32,
}

impl ImageDimension {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// The dimension after shrinking the image to contain at most `max_pixels`.
    ///
    /// Aspect ratio is preserved and images already small enough are untouched.
    /// A `max_pixels` of zero disables downsizing.
    pub fn limited_to(self, max_pixels: u64) -> Self {
        if max_pixels == 0 || self.pixels() <= max_pixels {
            return self;
        }
        let scale = (max_pixels as f64 / self.pixels() as f64).sqrt();
        Self {
            width: ((self.width as f64 * scale) as u32).max(1),
            height: ((self.height as f64 * scale) as u32).max(1),
        }
    }
}

/// The id every later stage uses to refer to the input image at `index`.
pub fn view_id(index: usize) -> String {
    index.to_string()
}

/// The input index of a view id, if it is one.
pub fn view_index(id: &str) -> Option<usize> {
    id.parse().ok()
}

/// Lists the images selected by an input pattern.
///
/// * `glob:<pattern>`: every file matching the glob
/// * `regex:<pattern>`: every file whose path fully matches the regex, searched
///   below the literal directory prefix of the pattern
/// * a directory: every file inside it with a known image extension
/// * anything else: a single file, if it exists
///
/// Results are sorted by path.
pub fn list_images(pattern: &str) -> Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = if let Some(glob_pattern) = pattern.strip_prefix("glob:") {
        let entries = glob::glob(glob_pattern).map_err(|e| PipelineError::InvalidPattern {
            pattern: pattern.to_owned(),
            reason: e.to_string(),
        })?;
        entries
            .filter_map(|entry| match entry {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!("skipping unreadable path: {}", e);
                    None
                }
            })
            .filter(|path| path.is_file())
            .collect()
    } else if let Some(regex_pattern) = pattern.strip_prefix("regex:") {
        let regex = Regex::new(&format!("^(?:{})$", regex_pattern)).map_err(|e| {
            PipelineError::InvalidPattern {
                pattern: pattern.to_owned(),
                reason: e.to_string(),
            }
        })?;
        let mut found = vec![];
        collect_files(&regex_search_root(regex_pattern), &mut found)?;
        found
            .into_iter()
            .filter(|path| regex.is_match(&path.to_string_lossy().replace('\\', "/")))
            .collect()
    } else {
        let path = Path::new(pattern);
        if path.is_dir() {
            let mut found = vec![];
            for entry in fs::read_dir(path).map_err(io_at(path))? {
                let entry = entry.map_err(io_at(path))?;
                let file = entry.path();
                if file.is_file() && has_image_extension(&file) {
                    found.push(file);
                }
            }
            found
        } else if path.is_file() {
            vec![path.to_path_buf()]
        } else {
            vec![]
        }
    };
    paths.sort();
    Ok(paths)
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map_or(false, |e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

/// The deepest directory named literally at the start of a regex.
fn regex_search_root(pattern: &str) -> PathBuf {
    let literal_end = pattern
        .find(|c: char| "\\.^$|?*+()[]{}".contains(c))
        .unwrap_or(pattern.len());
    match pattern[..literal_end].rfind('/') {
        Some(0) => PathBuf::from("/"),
        Some(slash) => PathBuf::from(&pattern[..slash]),
        None => PathBuf::from("."),
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("skipping unreadable directory {}: {}", dir.display(), e);
            return Ok(());
        }
    };
    for entry in entries {
        let path = entry.map_err(io_at(dir))?.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path.strip_prefix("./").map(Path::to_path_buf).unwrap_or(path));
        }
    }
    Ok(())
}

/// The dimension of every input image, indexed by input position.
///
/// Images which could not be read have no entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DimensionTable {
    entries: Vec<Option<ImageDimension>>,
}

impl DimensionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, dimension: Option<ImageDimension>) {
        self.entries.push(dimension);
    }

    pub fn get(&self, index: usize) -> Option<ImageDimension> {
        self.entries.get(index).copied().flatten()
    }

    pub fn get_view(&self, view_id: &str) -> Option<ImageDimension> {
        view_index(view_id).and_then(|ix| self.get(ix))
    }

    /// The first dimension which was recorded.
    pub fn first(&self) -> Option<ImageDimension> {
        self.entries.iter().flatten().next().copied()
    }

    /// Number of images with a recorded dimension.
    pub fn recorded(&self) -> usize {
        self.entries.iter().flatten().count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The list of input images together with the downsizing policy applied to all of them.
#[derive(Debug, Clone)]
pub struct ImageSequence {
    paths: Vec<PathBuf>,
    max_pixels: u64,
}

impl ImageSequence {
    pub fn new(paths: Vec<PathBuf>, max_pixels: u64) -> Self {
        Self { paths, max_pixels }
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Decodes and downsizes the image at `index`.
    pub fn load(&self, index: usize) -> Result<RgbImage> {
        let path = self.path(index)?;
        let image = image::open(path).map_err(image_at(path))?.to_rgb8();
        let original = ImageDimension::new(image.width(), image.height());
        let target = original.limited_to(self.max_pixels);
        if target == original {
            Ok(image)
        } else {
            Ok(image::imageops::resize(
                &image,
                target.width,
                target.height,
                FilterType::Triangle,
            ))
        }
    }

    /// Streams every image in list order, one at a time.
    pub fn iter(&self) -> impl Iterator<Item = (usize, Result<RgbImage>)> + '_ {
        (0..self.paths.len()).map(move |ix| (ix, self.load(ix)))
    }

    /// Reads the downsized dimension of every image from its header only.
    pub fn load_dimensions(&self) -> DimensionTable {
        let entries = self
            .paths
            .par_iter()
            .map(|path| match image::image_dimensions(path) {
                Ok((width, height)) => {
                    Some(ImageDimension::new(width, height).limited_to(self.max_pixels))
                }
                Err(e) => {
                    warn!("unable to read dimensions of {}: {}", path.display(), e);
                    None
                }
            })
            .collect();
        DimensionTable { entries }
    }

    fn path(&self, index: usize) -> Result<&Path> {
        self.paths
            .get(index)
            .map(PathBuf::as_path)
            .ok_or_else(|| PipelineError::Collaborator {
                stage: "image lookup",
                message: format!("no input image with index {}", index),
            })
    }
}

/// Converts to gray by averaging the color channels.
pub fn average_gray(image: &RgbImage) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let [r, g, b] = image.get_pixel(x, y).0;
        Luma([((r as u16 + g as u16 + b as u16) / 3) as u8])
    })
}

/// Looks images up by view id, loading them from disk every time.
pub struct FileImageLookup<'a> {
    images: &'a ImageSequence,
    dimensions: &'a DimensionTable,
}

impl<'a> FileImageLookup<'a> {
    pub fn new(images: &'a ImageSequence, dimensions: &'a DimensionTable) -> Self {
        Self { images, dimensions }
    }
}

impl<'a> ImageLookup for FileImageLookup<'a> {
    fn load_shape(&self, view_id: &str) -> Option<ImageDimension> {
        self.dimensions.get_view(view_id)
    }

    fn load_image(&self, view_id: &str) -> Result<RgbImage> {
        let index = view_index(view_id).ok_or_else(|| PipelineError::Collaborator {
            stage: "image lookup",
            message: format!("'{}' is not a view id", view_id),
        })?;
        self.images.load(index)
    }
}
