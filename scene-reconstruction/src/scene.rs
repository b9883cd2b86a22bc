use crate::error::{PipelineError, Result};
use nalgebra::{Isometry3, Point3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A view that was found to plausibly overlap another view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarView {
    /// The view id of the other image
    pub id: String,
    /// How strongly the two views are believed to overlap, higher is better
    pub score: f64,
}

/// The output of similar-image discovery.
///
/// Views are kept in the order they were added, which is the order of the
/// input list. Once [`SimilarityDatabase::fixate`] has been called the
/// database is read-only and its ids are reused by every later stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimilarityDatabase {
    views: Vec<String>,
    similar: BTreeMap<String, Vec<SimilarView>>,
    fixated: bool,
}

impl SimilarityDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a view with no similar images yet.
    pub fn add_view(&mut self, id: impl Into<String>) -> Result<()> {
        self.check_open()?;
        let id = id.into();
        self.similar.entry(id.clone()).or_default();
        self.views.push(id);
        Ok(())
    }

    /// Marks two views as similar. The relation is symmetric.
    pub fn connect(&mut self, a: &str, b: &str, score: f64) -> Result<()> {
        self.check_open()?;
        for (from, to) in [(a, b), (b, a)] {
            let list = self.similar.entry(from.to_owned()).or_default();
            if !list.iter().any(|s| s.id == to) {
                list.push(SimilarView {
                    id: to.to_owned(),
                    score,
                });
            }
        }
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.fixated {
            return Err(PipelineError::DatabaseFixated);
        }
        Ok(())
    }

    /// Finalizes the database. No views or relations can be added afterwards.
    pub fn fixate(&mut self) {
        self.fixated = true;
    }

    pub fn is_fixated(&self) -> bool {
        self.fixated
    }

    pub fn views(&self) -> &[String] {
        &self.views
    }

    pub fn similar(&self, id: &str) -> &[SimilarView] {
        self.similar.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every unordered similar pair exactly once, ordered by the first view.
    pub fn pairs(&self) -> Vec<(&str, &SimilarView)> {
        let position: BTreeMap<&str, usize> = self
            .views
            .iter()
            .enumerate()
            .map(|(ix, id)| (id.as_str(), ix))
            .collect();
        let mut pairs = vec![];
        for (own, id) in self.views.iter().enumerate() {
            for other in self.similar(id) {
                if position.get(other.id.as_str()).map_or(false, |&p| p > own) {
                    pairs.push((id.as_str(), other));
                }
            }
        }
        pairs
    }
}

/// A scored candidate relationship between two views.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairwiseEdge {
    pub src: String,
    pub dst: String,
    /// Whether the relationship has enough parallax to carry 3D information
    pub is_3d: bool,
    pub score_3d: f64,
    pub count_inliers: usize,
}

/// The graph of views and their candidate relationships.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PairwiseGraph {
    pub nodes: Vec<String>,
    pub edges: Vec<PairwiseEdge>,
}

impl PairwiseGraph {
    pub fn edges_of<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a PairwiseEdge> + 'a {
        self.edges
            .iter()
            .filter(move |e| e.src == id || e.dst == id)
    }
}

/// Intrinsics of the simplified pinhole model used during reconstruction.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct PinholeSimplified {
    pub f: f64,
    pub k1: f64,
    pub k2: f64,
}

/// A view which has been incorporated into a working scene graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkingView {
    /// Index of this view inside the scene, used by refinement and dense stereo
    pub index: usize,
    /// The pairwise graph node this view came from
    pub id: String,
    pub world_to_view: Isometry3<f64>,
    pub intrinsics: PinholeSimplified,
}

/// A connected subset of the pairwise graph with estimated cameras and sparse structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkingSceneGraph {
    pub views: Vec<WorkingView>,
    pub points: Vec<Point3<f64>>,
}

impl WorkingSceneGraph {
    /// Maps scene view indices to the view ids needed to load their images.
    pub fn view_to_id(&self) -> BTreeMap<usize, String> {
        self.views.iter().map(|v| (v.index, v.id.clone())).collect()
    }
}

/// A bundle-adjusted view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinedView {
    pub index: usize,
    pub world_to_view: Isometry3<f64>,
    pub intrinsics: PinholeSimplified,
}

/// Bundle-adjusted cameras and structure derived from one working scene graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefinedScene {
    pub views: Vec<RefinedView>,
    pub points: Vec<Point3<f64>>,
}

impl RefinedScene {
    pub fn view(&self, index: usize) -> Option<&RefinedView> {
        self.views.iter().find(|v| v.index == index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_are_reported_once_in_view_order() {
        let mut db = SimilarityDatabase::new();
        for id in ["0", "1", "2"] {
            db.add_view(id).unwrap();
        }
        db.connect("2", "0", 0.5).unwrap();
        db.connect("0", "1", 0.9).unwrap();
        db.connect("1", "0", 0.9).unwrap();
        db.fixate();

        let pairs: Vec<_> = db
            .pairs()
            .into_iter()
            .map(|(a, b)| (a, b.id.as_str()))
            .collect();
        assert_eq!(pairs, vec![("0", "2"), ("0", "1")]);
        assert_eq!(db.similar("1").len(), 1);
    }

    #[test]
    fn fixated_database_rejects_changes() {
        let mut db = SimilarityDatabase::new();
        db.add_view("0").unwrap();
        db.add_view("1").unwrap();
        db.fixate();
        assert!(matches!(db.add_view("2"), Err(PipelineError::DatabaseFixated)));
        assert!(matches!(
            db.connect("0", "1", 1.0),
            Err(PipelineError::DatabaseFixated)
        ));
        assert_eq!(db.views().len(), 2);
        assert!(db.similar("0").is_empty());
    }
}
