//! Peak table
//!
//! Flattens the parent sources of a detection catalog into one row per peak.
//! Flux columns start as NaN and are filled by one of the strategies in [crate::flux].

use crate::{
    band::{Band, PerBand},
    context::Context,
    detection::{DetectionCatalog, Footprint},
};
use std::{ops::Deref, sync::Arc};

/// A peak of a detected parent source
#[derive(Debug, Clone)]
pub struct PeakRow {
    /// Parent source id
    pub parent: u64,
    /// Index of the peak in the parent footprint
    pub peak_idx: usize,
    pub x: f64,
    pub y: f64,
    /// The parent has 2 peaks or more
    pub blended: bool,
    /// The parent footprint
    pub footprint: Arc<Footprint>,
    pub flux: PerBand<f64>,
    pub sed: Option<PerBand<f64>>,
    /// 1-based exposure number once tables are stacked, 0 otherwise
    pub image: usize,
}
impl PeakRow {
    pub fn xy(&self) -> [f64; 2] {
        [self.x, self.y]
    }
}

#[derive(Debug, Clone, Default)]
pub struct PeakTable {
    bands: Vec<Band>,
    rows: Vec<PeakRow>,
}
impl Deref for PeakTable {
    type Target = Vec<PeakRow>;

    fn deref(&self) -> &Self::Target {
        &self.rows
    }
}
impl PeakTable {
    pub fn new(bands: &[Band], rows: Vec<PeakRow>) -> Self {
        Self {
            bands: bands.to_vec(),
            rows,
        }
    }
    pub fn bands(&self) -> &[Band] {
        &self.bands
    }
    pub fn into_rows(self) -> Vec<PeakRow> {
        self.rows
    }
    /// Row index of the peak `peak_idx` of `parent`
    pub fn position(&self, parent: u64, peak_idx: usize) -> Option<usize> {
        self.rows
            .iter()
            .position(|row| row.parent == parent && row.peak_idx == peak_idx)
    }
    /// A new table where each row is transformed by `f`
    pub fn map_rows<F>(&self, mut f: F) -> Self
    where
        F: FnMut(usize, &PeakRow) -> PeakRow,
    {
        Self {
            bands: self.bands.clone(),
            rows: self
                .rows
                .iter()
                .enumerate()
                .map(|(k, row)| f(k, row))
                .collect(),
        }
    }
    /// Sets the exposure number of every row
    pub fn with_image(self, image: usize) -> Self {
        Self {
            rows: self
                .rows
                .into_iter()
                .map(|row| PeakRow { image, ..row })
                .collect(),
            ..self
        }
    }
}
impl FromIterator<PeakTable> for PeakTable {
    /// Stacks the tables, the bands of the first table are kept
    fn from_iter<T: IntoIterator<Item = PeakTable>>(iter: T) -> Self {
        iter.into_iter()
            .fold(None, |stack: Option<PeakTable>, table| match stack {
                None => Some(table),
                Some(mut stack) => {
                    stack.rows.extend(table.rows);
                    Some(stack)
                }
            })
            .unwrap_or_default()
    }
}

fn footprint_rows(footprint: &Footprint, bands: &[Band], parent: u64) -> Vec<PeakRow> {
    let blended = footprint.is_blended();
    let shared = Arc::new(footprint.clone());
    let flux = PerBand::from_fn(|band| {
        if bands.contains(&band) {
            f64::NAN
        } else {
            0f64
        }
    });
    footprint
        .peaks
        .iter()
        .enumerate()
        .map(|(peak_idx, peak)| PeakRow {
            parent,
            peak_idx,
            x: peak.ix as f64,
            y: peak.iy as f64,
            blended,
            footprint: Arc::clone(&shared),
            flux: flux.clone(),
            sed: None,
            image: 0,
        })
        .collect()
}

/// Peak table of a single footprint, `parent` defaults to 0
pub fn build_footprint_peak_table(
    footprint: &Footprint,
    bands: &[Band],
    parent: Option<u64>,
) -> PeakTable {
    PeakTable::new(
        bands,
        footprint_rows(footprint, bands, parent.unwrap_or_default()),
    )
}

/// Peak table of all the sources in a merged detection catalog
pub fn build_peak_table(
    ctx: &Context,
    detections: &DetectionCatalog,
    bands: &[Band],
) -> PeakTable {
    let rows = detections
        .iter()
        .flat_map(|source| footprint_rows(&source.footprint, bands, source.id))
        .collect();
    let table = PeakTable::new(bands, rows);
    log::debug!(
        target: ctx.log_target(),
        "{} peaks in {} parents ({} blended)",
        table.len(),
        detections.len(),
        table.iter().filter(|row| row.blended).count()
    );
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        detection::{PeakRecord, SourceRecord},
        exposure::BBox,
    };

    fn footprint(peaks: &[(i32, i32)]) -> Footprint {
        Footprint::new(
            BBox::new(0, 0, 20, 20),
            peaks
                .iter()
                .map(|&(ix, iy)| PeakRecord { ix, iy })
                .collect(),
        )
    }

    #[test]
    fn single_footprint() {
        let table = build_footprint_peak_table(&footprint(&[(3, 4)]), &[Band::G, Band::I], None);
        assert_eq!(table.len(), 1);
        let row = &table[0];
        assert_eq!((row.parent, row.peak_idx, row.x, row.y), (0, 0, 3., 4.));
        assert!(!row.blended);
        assert!(row.flux[Band::G].is_nan());
        assert!(row.flux[Band::I].is_nan());
        assert!(row.sed.is_none());
    }

    #[test]
    fn blended_parents() {
        let detections = DetectionCatalog::from(vec![
            SourceRecord {
                id: 11,
                footprint: footprint(&[(1, 1)]),
            },
            SourceRecord {
                id: 12,
                footprint: footprint(&[(5, 5), (8, 8), (9, 2)]),
            },
        ]);
        let table = build_peak_table(&Context::new(), &detections, &[Band::R]);
        assert_eq!(table.len(), 4);
        assert!(!table[0].blended);
        assert!(table[1..].iter().all(|row| row.blended && row.parent == 12));
        assert_eq!(
            table.iter().map(|row| row.peak_idx).collect::<Vec<_>>(),
            vec![0, 0, 1, 2]
        );
        assert_eq!(table.position(12, 2), Some(3));
        assert!(Arc::ptr_eq(&table[1].footprint, &table[3].footprint));
        // the detection catalog is left untouched
        assert_eq!(detections.n_peak(), 4);
    }

    #[test]
    fn stacking() {
        let a = build_footprint_peak_table(&footprint(&[(1, 1)]), &[Band::R], Some(1)).with_image(1);
        let b = build_footprint_peak_table(&footprint(&[(2, 2), (3, 3)]), &[Band::R], Some(2))
            .with_image(2);
        let stack: PeakTable = vec![a, b].into_iter().collect();
        assert_eq!(stack.len(), 3);
        assert_eq!(stack[2].image, 2);
    }
}
