//! Calibrated exposures and pixel cutouts

use crate::stats;
use serde::{Deserialize, Serialize};
use std::{fmt, fs::File, path::Path};

#[derive(thiserror::Error, Debug)]
pub enum ExposureError {
    #[error("Failed to open the exposure file")]
    Io(#[from] std::io::Error),
    #[error("Failed to deserialize the exposure")]
    Pickle(#[from] serde_pickle::Error),
    #[error("{bbox} is not contained in the exposure {exposure}")]
    OutOfBounds { bbox: BBox, exposure: BBox },
    #[error("{name} has {found} pixels, expected {expected}")]
    Shape {
        name: &'static str,
        expected: usize,
        found: usize,
    },
}
type Result<T> = std::result::Result<T, ExposureError>;

/// Conversion factor from a Gaussian PSF determinant radius to its FWHM
pub const SIGMA_TO_FWHM: f64 = 2.35;

/// Integer pixel bounding box
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BBox {
    pub min_x: i32,
    pub min_y: i32,
    pub width: usize,
    pub height: usize,
}
impl BBox {
    pub fn new(min_x: i32, min_y: i32, width: usize, height: usize) -> Self {
        Self {
            min_x,
            min_y,
            width,
            height,
        }
    }
    /// One past the last column
    pub fn max_x(&self) -> i32 {
        self.min_x + self.width as i32
    }
    /// One past the last row
    pub fn max_y(&self) -> i32 {
        self.min_y + self.height as i32
    }
    pub fn area(&self) -> usize {
        self.width * self.height
    }
    /// Strictly inside the box
    pub fn contains_strict(&self, x: f64, y: f64) -> bool {
        x > self.min_x as f64
            && x < self.max_x() as f64
            && y > self.min_y as f64
            && y < self.max_y() as f64
    }
    /// Inside the box or on its edges
    pub fn contains_inclusive(&self, x: f64, y: f64) -> bool {
        x >= self.min_x as f64
            && x <= self.max_x() as f64
            && y >= self.min_y as f64
            && y <= self.max_y() as f64
    }
    pub fn contains_bbox(&self, other: &BBox) -> bool {
        other.min_x >= self.min_x
            && other.min_y >= self.min_y
            && other.max_x() <= self.max_x()
            && other.max_y() <= self.max_y()
    }
}
impl fmt::Display for BBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[({},{})..({},{})]",
            self.min_x,
            self.min_y,
            self.max_x(),
            self.max_y()
        )
    }
}

/// Row major 2D array of pixel values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f64>,
}
impl Image {
    pub fn new(width: usize, height: usize, data: Vec<f64>) -> Self {
        Self {
            width,
            height,
            data,
        }
    }
    /// An image of zeros with the shape of `self`
    pub fn zeros_like(&self) -> Self {
        Self {
            width: self.width,
            height: self.height,
            data: vec![0f64; self.data.len()],
        }
    }
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
    pub fn get(&self, x: usize, y: usize) -> Option<f64> {
        if x < self.width {
            self.data.get(y * self.width + x).copied()
        } else {
            None
        }
    }
    /// Largest pixel value, `None` for an empty image
    pub fn max(&self) -> Option<f64> {
        self.data.iter().cloned().reduce(f64::max)
    }
    pub fn sum(&self) -> f64 {
        self.data.iter().sum()
    }
    /// Sum of the pixels where `mask` is `true`
    pub fn masked_sum(&self, mask: &[bool]) -> f64 {
        self.data
            .iter()
            .zip(mask)
            .filter_map(|(v, &m)| m.then_some(v))
            .sum()
    }
}

/// Calibrated exposure in a single band
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Exposure {
    /// Pixel bounding box of the exposure
    pub bbox: BBox,
    pub image: Vec<f32>,
    pub variance: Vec<f32>,
    pub mask: Vec<u32>,
    /// PSF determinant radius [pixel]
    pub psf_radius: f64,
}
impl Exposure {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)?;
        let exposure: Self = serde_pickle::from_reader(&mut file, Default::default())?;
        exposure.validate()?;
        Ok(exposure)
    }
    /// Checks that all planes match the bounding box
    pub fn validate(&self) -> Result<()> {
        let expected = self.bbox.area();
        for (name, found) in [
            ("image", self.image.len()),
            ("variance", self.variance.len()),
            ("mask", self.mask.len()),
        ] {
            if found != expected {
                return Err(ExposureError::Shape {
                    name,
                    expected,
                    found,
                });
            }
        }
        Ok(())
    }
    pub fn psf_fwhm(&self) -> f64 {
        self.psf_radius * SIGMA_TO_FWHM
    }
    /// Copy of the image pixels within `bbox`
    pub fn extract_image(&self, bbox: &BBox) -> Result<Image> {
        self.validate()?;
        if !self.bbox.contains_bbox(bbox) {
            return Err(ExposureError::OutOfBounds {
                bbox: *bbox,
                exposure: self.bbox,
            });
        }
        let x0 = (bbox.min_x - self.bbox.min_x) as usize;
        let y0 = (bbox.min_y - self.bbox.min_y) as usize;
        let data = (0..bbox.height)
            .flat_map(|j| {
                let start = (y0 + j) * self.bbox.width + x0;
                self.image[start..start + bbox.width]
                    .iter()
                    .map(|&v| v as f64)
            })
            .collect();
        Ok(Image::new(bbox.width, bbox.height, data))
    }
    /// Square root of the median variance of the pixels whose mask doesn't intersect `and_mask`
    pub fn median_noise(&self, and_mask: u32) -> Option<f64> {
        let variance: Vec<f64> = self
            .variance
            .iter()
            .zip(&self.mask)
            .filter(|(v, &m)| m & and_mask == 0 && v.is_finite())
            .map(|(&v, _)| v as f64)
            .collect();
        stats::median(&variance).map(f64::sqrt)
    }
}

/// Median noise of each exposure, NaN if an exposure has no valid pixel
pub fn get_noise(exposures: &[Exposure], and_mask: u32) -> Vec<f64> {
    exposures
        .iter()
        .map(|exposure| exposure.median_noise(and_mask).unwrap_or(f64::NAN))
        .collect()
}
