use crate::cloud::DenseCloud;
use crate::error::{io_at, PipelineError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// The result of a pipeline stage which is persisted so a later run can resume from it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Stage {
    Similarity,
    Pairwise,
    WorkingGraph,
    RefinedStructure,
    Cloud,
    CloudClipped,
}

impl Stage {
    pub fn file_name(self) -> &'static str {
        match self {
            Stage::Similarity => "similar.yaml",
            Stage::Pairwise => "pairwise.yaml",
            Stage::WorkingGraph => "working.yaml",
            Stage::RefinedStructure => "structure.yaml",
            Stage::Cloud => "cloud.ply",
            Stage::CloudClipped => "cloud_clipped.ply",
        }
    }

    /// Whether the checkpoint lives inside a scene directory.
    pub fn per_scene(self) -> bool {
        !matches!(self, Stage::Similarity | Stage::Pairwise)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Similarity => "similarity",
            Stage::Pairwise => "pairwise",
            Stage::WorkingGraph => "working graph",
            Stage::RefinedStructure => "refined structure",
            Stage::Cloud => "cloud",
            Stage::CloudClipped => "clipped cloud",
        })
    }
}

/// Writes a file so that readers only ever observe the old or the complete new contents.
///
/// The data goes to a temporary file in the destination directory which then replaces
/// the destination.
pub(crate) fn write_atomic(
    path: &Path,
    write: impl FnOnce(&mut dyn Write) -> io::Result<()>,
) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(io_at(dir))?;
    let mut file = NamedTempFile::new_in(dir).map_err(io_at(dir))?;
    {
        let mut writer = BufWriter::new(file.as_file_mut());
        write(&mut writer).map_err(io_at(path))?;
        writer.flush().map_err(io_at(path))?;
    }
    file.as_file().sync_all().map_err(io_at(path))?;
    file.persist(path).map_err(|e| PipelineError::Io {
        path: path.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}

/// Saves and loads stage results under an output root.
///
/// Global stages live directly in the root. Per-scene stages live in the scene's
/// directory, e.g. `scene03/structure.yaml`.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scene_dir(&self, scene: &str) -> PathBuf {
        self.root.join(scene)
    }

    pub fn path(&self, stage: Stage, scene: Option<&str>) -> PathBuf {
        debug_assert_eq!(stage.per_scene(), scene.is_some());
        match scene {
            Some(scene) => self.scene_dir(scene).join(stage.file_name()),
            None => self.root.join(stage.file_name()),
        }
    }

    pub fn exists(&self, stage: Stage, scene: Option<&str>) -> bool {
        self.path(stage, scene).is_file()
    }

    pub fn save<T: Serialize>(&self, stage: Stage, scene: Option<&str>, data: &T) -> Result<PathBuf> {
        let path = self.path(stage, scene);
        write_atomic(&path, |w| {
            serde_yaml::to_writer(w, data).map_err(|e| io::Error::new(io::ErrorKind::Other, e))
        })?;
        Ok(path)
    }

    /// Loads a stage result.
    ///
    /// A missing file is [`PipelineError::MissingCheckpoint`].
    pub fn load<T: DeserializeOwned>(&self, stage: Stage, scene: Option<&str>) -> Result<T> {
        let path = self.path(stage, scene);
        let file = self.open(stage, &path)?;
        serde_yaml::from_reader(BufReader::new(file)).map_err(|source| {
            PipelineError::CorruptCheckpoint {
                stage,
                path,
                source,
            }
        })
    }

    pub fn save_cloud(&self, stage: Stage, scene: &str, cloud: &DenseCloud) -> Result<PathBuf> {
        let path = self.path(stage, Some(scene));
        write_atomic(&path, |w| cloud.write_ply(w))?;
        Ok(path)
    }

    pub fn load_cloud(&self, stage: Stage, scene: &str) -> Result<DenseCloud> {
        let path = self.path(stage, Some(scene));
        let file = self.open(stage, &path)?;
        DenseCloud::read_ply(&mut BufReader::new(file)).map_err(|e| PipelineError::Ply {
            path,
            reason: e.to_string(),
        })
    }

    /// Names of every scene directory under the root, sorted by name.
    pub fn scene_directories(&self) -> Result<Vec<String>> {
        let mut names = vec![];
        for entry in fs::read_dir(&self.root).map_err(io_at(&self.root))? {
            let entry = entry.map_err(io_at(&self.root))?;
            if !entry.file_type().map_err(io_at(entry.path()))?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with("scene") {
                names.push(name.to_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    fn open(&self, stage: Stage, path: &Path) -> Result<File> {
        File::open(path).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                PipelineError::MissingCheckpoint {
                    stage,
                    path: path.to_path_buf(),
                }
            } else {
                PipelineError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{PairwiseEdge, PairwiseGraph};

    fn graph() -> PairwiseGraph {
        PairwiseGraph {
            nodes: vec!["0".into(), "1".into()],
            edges: vec![PairwiseEdge {
                src: "0".into(),
                dst: "1".into(),
                is_3d: true,
                score_3d: 2.5,
                count_inliers: 120,
            }],
        }
    }

    #[test]
    fn save_then_load_is_identical() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let path = store.save(Stage::Pairwise, None, &graph()).unwrap();
        assert_eq!(path, dir.path().join("pairwise.yaml"));

        let loaded: PairwiseGraph = store.load(Stage::Pairwise, None).unwrap();
        assert_eq!(loaded, graph());

        // Saving the reloaded value again must not change a single byte.
        let before = fs::read(&path).unwrap();
        store.save(Stage::Pairwise, None, &loaded).unwrap();
        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[test]
    fn missing_checkpoint_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let err = store
            .load::<PairwiseGraph>(Stage::WorkingGraph, Some("scene"))
            .unwrap_err();
        match err {
            PipelineError::MissingCheckpoint { stage, path } => {
                assert_eq!(stage, Stage::WorkingGraph);
                assert_eq!(path, dir.path().join("scene").join("working.yaml"));
            }
            other => panic!("unexpected error {}", other),
        }
    }

    #[test]
    fn truncated_checkpoint_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let path = store.save(Stage::Pairwise, None, &graph()).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        fs::write(&path, &text[..text.len() / 2]).unwrap();

        assert!(matches!(
            store.load::<PairwiseGraph>(Stage::Pairwise, None),
            Err(PipelineError::CorruptCheckpoint { .. })
        ));
    }

    #[test]
    fn atomic_save_leaves_no_temporary_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.save(Stage::WorkingGraph, Some("scene1"), &graph()).unwrap();
        store.save(Stage::WorkingGraph, Some("scene1"), &graph()).unwrap();

        let names: Vec<_> = fs::read_dir(dir.path().join("scene1"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["working.yaml".to_string()]);
    }

    #[test]
    fn scene_directories_are_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["scene10", "scene02", "configurations", "scene"] {
            fs::create_dir(dir.path().join(name)).unwrap();
        }
        fs::write(dir.path().join("scene_notes.txt"), "").unwrap();

        let store = CheckpointStore::new(dir.path());
        assert_eq!(
            store.scene_directories().unwrap(),
            vec!["scene", "scene02", "scene10"]
        );
    }
}
