//! Merged detection catalog
//!
//! Each detected source owns a [Footprint]: the pixels attributed to the source and the
//! ordered list of peaks found inside it.

use crate::exposure::BBox;
use serde::{Deserialize, Serialize};
use std::{fs::File, ops::Deref, path::Path};

#[derive(thiserror::Error, Debug)]
pub enum DetectionError {
    #[error("Failed to open the detection catalog")]
    Io(#[from] std::io::Error),
    #[error("Failed to deserialize the detection catalog")]
    Pickle(#[from] serde_pickle::Error),
    #[error("Footprint of source #{id} has a mask of {found} pixels for a {bbox} bounding box")]
    Mask { id: u64, bbox: BBox, found: usize },
}
type Result<T> = std::result::Result<T, DetectionError>;

/// Local maximum inside a footprint
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeakRecord {
    pub ix: i32,
    pub iy: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Footprint {
    pub bbox: BBox,
    /// Row major pixel membership within `bbox`, empty means the whole box
    #[serde(default)]
    pub mask: Vec<bool>,
    pub peaks: Vec<PeakRecord>,
}
impl Footprint {
    pub fn new(bbox: BBox, peaks: Vec<PeakRecord>) -> Self {
        Self {
            bbox,
            mask: Vec::new(),
            peaks,
        }
    }
    pub fn with_mask(self, mask: Vec<bool>) -> Self {
        Self { mask, ..self }
    }
    /// A footprint with 2 peaks or more is blended
    pub fn is_blended(&self) -> bool {
        self.peaks.len() >= 2
    }
    /// Pixel membership over the whole bounding box
    pub fn pixel_mask(&self) -> Vec<bool> {
        if self.mask.is_empty() {
            vec![true; self.bbox.area()]
        } else {
            self.mask.clone()
        }
    }
}

/// A detected (parent) source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: u64,
    pub footprint: Footprint,
}

/// Merged detection catalog of an exposure set
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectionCatalog(Vec<SourceRecord>);
impl Deref for DetectionCatalog {
    type Target = Vec<SourceRecord>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
impl From<Vec<SourceRecord>> for DetectionCatalog {
    fn from(sources: Vec<SourceRecord>) -> Self {
        Self(sources)
    }
}
impl DetectionCatalog {
    /// Loads the catalog from a pickle file
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)?;
        let this: Self = serde_pickle::from_reader(&mut file, Default::default())?;
        for source in this.iter() {
            let fp = &source.footprint;
            if !fp.mask.is_empty() && fp.mask.len() != fp.bbox.area() {
                return Err(DetectionError::Mask {
                    id: source.id,
                    bbox: fp.bbox,
                    found: fp.mask.len(),
                });
            }
        }
        Ok(this)
    }
    /// Sources with more than one peak
    pub fn blended(&self) -> impl Iterator<Item = &SourceRecord> {
        self.iter().filter(|source| source.footprint.is_blended())
    }
    pub fn find(&self, id: u64) -> Option<&SourceRecord> {
        self.iter().find(|source| source.id == id)
    }
    /// Total number of peaks
    pub fn n_peak(&self) -> usize {
        self.iter().map(|source| source.footprint.peaks.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blended_threshold() {
        let one = Footprint::new(BBox::new(0, 0, 5, 5), vec![PeakRecord { ix: 2, iy: 2 }]);
        assert!(!one.is_blended());
        let two = Footprint::new(
            BBox::new(0, 0, 5, 5),
            vec![PeakRecord { ix: 1, iy: 1 }, PeakRecord { ix: 3, iy: 3 }],
        );
        assert!(two.is_blended());
        let catalog = DetectionCatalog::from(vec![
            SourceRecord {
                id: 1,
                footprint: one,
            },
            SourceRecord {
                id: 2,
                footprint: two,
            },
        ]);
        assert_eq!(catalog.n_peak(), 3);
        assert_eq!(catalog.blended().map(|s| s.id).collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn full_box_mask() {
        let fp = Footprint::new(BBox::new(0, 0, 2, 3), vec![]);
        assert_eq!(fp.pixel_mask(), vec![true; 6]);
        let fp = fp.with_mask(vec![true, false, true, false, true, false]);
        assert_eq!(fp.pixel_mask().iter().filter(|&&m| m).count(), 3);
    }
}
