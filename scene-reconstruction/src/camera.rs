use std::collections::BTreeMap;

/// The default horizontal field of view assumed for an uncalibrated camera.
pub const CANONICAL_HFOV_DEGREES: f64 = 60.0;

/// A placeholder prior for an uncalibrated camera.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct CameraPrior {
    pub width: u32,
    pub height: u32,
    pub hfov_degrees: f64,
}

impl CameraPrior {
    /// The focal length in pixels implied by the image width and field of view.
    pub fn focal_length(&self) -> f64 {
        (self.width as f64 / 2.0) / (self.hfov_degrees.to_radians() / 2.0).tan()
    }
}

/// The cameras which captured the views and which camera captured each view.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CameraBank {
    cameras: Vec<CameraPrior>,
    view_to_camera: BTreeMap<String, usize>,
}

impl CameraBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a camera with only a canonical prior and returns its index.
    pub fn add_camera_canonical(&mut self, width: u32, height: u32, hfov_degrees: f64) -> usize {
        self.cameras.push(CameraPrior {
            width,
            height,
            hfov_degrees,
        });
        self.cameras.len() - 1
    }

    pub fn add_view(&mut self, view_id: impl Into<String>, camera: usize) {
        debug_assert!(camera < self.cameras.len());
        self.view_to_camera.insert(view_id.into(), camera);
    }

    pub fn cameras(&self) -> &[CameraPrior] {
        &self.cameras
    }

    pub fn camera_of(&self, view_id: &str) -> Option<&CameraPrior> {
        self.view_to_camera
            .get(view_id)
            .and_then(|&ix| self.cameras.get(ix))
    }

    pub fn num_views(&self) -> usize {
        self.view_to_camera.len()
    }
}
