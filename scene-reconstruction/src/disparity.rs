use image::{Rgb, RgbImage};

/// A dense disparity image.
///
/// Valid disparities lie in `[0, range)`. Any value `>= range` marks a pixel with
/// no valid disparity.
#[derive(Debug, Clone, PartialEq)]
pub struct DisparityImage {
    pub width: u32,
    pub height: u32,
    pub data: Vec<f32>,
}

impl DisparityImage {
    /// An image where every pixel holds `value`.
    pub fn filled(width: u32, height: u32, value: f32) -> Self {
        Self {
            width,
            height,
            data: vec![value; width as usize * height as usize],
        }
    }

    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.data[self.offset(x, y)]
    }

    pub fn set(&mut self, x: u32, y: u32, value: f32) {
        let offset = self.offset(x, y);
        self.data[offset] = value;
    }

    fn offset(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }

    /// Replaces every disparity below `minimum` with `sentinel`.
    pub fn mask_below(&mut self, minimum: f32, sentinel: f32) {
        for v in &mut self.data {
            if *v < minimum {
                *v = sentinel;
            }
        }
    }
}

/// Describes how a disparity image relates to scene geometry.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct DisparityParameters {
    pub disparity_min: u32,
    pub disparity_range: u32,
    /// Distance between the rectified cameras
    pub baseline: f64,
    /// Rectified focal length in pixels
    pub focal: f64,
}

impl DisparityParameters {
    /// Depth along the optical axis of a pixel with the given disparity.
    pub fn depth(&self, disparity: f32) -> Option<f64> {
        let d = disparity as f64 + self.disparity_min as f64;
        if disparity < 0.0 || disparity >= self.disparity_range as f32 || d <= 0.0 {
            None
        } else {
            Some(self.focal * self.baseline / d)
        }
    }
}

/// Renders a disparity image with a blue to red color map. Invalid pixels are black.
pub fn colorize(disparity: &DisparityImage, range: u32) -> RgbImage {
    let range = range.max(1) as f32;
    RgbImage::from_fn(disparity.width, disparity.height, |x, y| {
        let v = disparity.get(x, y);
        if !(0.0..range).contains(&v) {
            return Rgb([0, 0, 0]);
        }
        jet(v / range)
    })
}

fn jet(t: f32) -> Rgb<u8> {
    let channel = |offset: f32| {
        let v = 1.5 - (4.0 * t - offset).abs();
        (v.clamp(0.0, 1.0) * 255.0) as u8
    };
    Rgb([channel(3.0), channel(2.0), channel(1.0)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masking_leaves_nothing_below_minimum() {
        let mut image = DisparityImage {
            width: 3,
            height: 2,
            data: vec![0.0, 4.9, 5.0, 100.0, 250.0, 12.5],
        };
        image.mask_below(5.0, 250.0);
        assert_eq!(image.data, vec![250.0, 250.0, 5.0, 100.0, 250.0, 12.5]);
        assert!(image.data.iter().all(|&v| v >= 5.0));
    }

    #[test]
    fn invalid_disparity_has_no_depth() {
        let params = DisparityParameters {
            disparity_min: 0,
            disparity_range: 100,
            baseline: 2.0,
            focal: 50.0,
        };
        assert_eq!(params.depth(10.0), Some(10.0));
        assert_eq!(params.depth(100.0), None);
        assert_eq!(params.depth(0.0), None);
    }

    #[test]
    fn colorized_invalid_pixels_are_black() {
        let mut image = DisparityImage::filled(2, 1, 10.0);
        image.set(1, 0, 64.0);
        let color = colorize(&image, 64);
        assert_ne!(color.get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(color.get_pixel(1, 0).0, [0, 0, 0]);
    }
}
