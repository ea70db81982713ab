//! [polars] data frames of the peak, match and unmatched tables

use crate::{
    band::Band,
    matcher::{MatchTable, UnmatchedTable},
    peaks::PeakTable,
};
use polars::prelude::*;

fn per_band<R, F>(rows: &[R], bands: &[Band], name: fn(Band) -> String, value: F) -> Vec<Column>
where
    F: Fn(&R, Band) -> f64,
{
    bands
        .iter()
        .map(|&band| {
            Column::new(
                name(band).into(),
                rows.iter().map(|row| value(row, band)).collect::<Vec<f64>>(),
            )
        })
        .collect()
}

fn sed_column(band: Band) -> String {
    format!("sed_{}", band)
}

impl PeakTable {
    pub fn to_dataframe(&self) -> PolarsResult<DataFrame> {
        let rows = self.as_slice();
        let mut columns = vec![
            Column::new(
                "parent".into(),
                rows.iter().map(|r| r.parent).collect::<Vec<u64>>(),
            ),
            Column::new(
                "peak_idx".into(),
                rows.iter().map(|r| r.peak_idx as u64).collect::<Vec<u64>>(),
            ),
            Column::new("x".into(), rows.iter().map(|r| r.x).collect::<Vec<f64>>()),
            Column::new("y".into(), rows.iter().map(|r| r.y).collect::<Vec<f64>>()),
            Column::new(
                "blended".into(),
                rows.iter().map(|r| r.blended).collect::<Vec<bool>>(),
            ),
            Column::new(
                "image".into(),
                rows.iter().map(|r| r.image as u64).collect::<Vec<u64>>(),
            ),
        ];
        columns.extend(per_band(rows, self.bands(), Band::flux_column, |r, b| {
            r.flux[b]
        }));
        columns.extend(self.bands().iter().map(|&band| {
            Column::new(
                sed_column(band).into(),
                rows.iter()
                    .map(|r| r.sed.as_ref().map(|sed| sed[band]))
                    .collect::<Vec<Option<f64>>>(),
            )
        }));
        DataFrame::new(columns)
    }
}

impl MatchTable {
    pub fn to_dataframe(&self) -> PolarsResult<DataFrame> {
        let rows = self.as_slice();
        let mut columns = vec![
            Column::new(
                "id".into(),
                rows.iter().map(|r| r.source.id).collect::<Vec<u64>>(),
            ),
            Column::new(
                "x".into(),
                rows.iter().map(|r| r.source.x).collect::<Vec<f64>>(),
            ),
            Column::new(
                "y".into(),
                rows.iter().map(|r| r.source.y).collect::<Vec<f64>>(),
            ),
            Column::new(
                "size".into(),
                rows.iter().map(|r| r.source.size).collect::<Vec<f64>>(),
            ),
            Column::new(
                "redshift".into(),
                rows.iter().map(|r| r.source.redshift).collect::<Vec<f64>>(),
            ),
            Column::new(
                "truth_index".into(),
                rows.iter()
                    .map(|r| r.truth_index.map(|i| i as u64))
                    .collect::<Vec<Option<u64>>>(),
            ),
            Column::new(
                "distance".into(),
                rows.iter().map(|r| r.distance).collect::<Vec<f64>>(),
            ),
            Column::new(
                "matched".into(),
                rows.iter().map(|r| r.matched).collect::<Vec<bool>>(),
            ),
            Column::new(
                "duplicate".into(),
                rows.iter().map(|r| r.duplicate).collect::<Vec<bool>>(),
            ),
            Column::new(
                "image".into(),
                rows.iter().map(|r| r.image as u64).collect::<Vec<u64>>(),
            ),
        ];
        columns.extend(per_band(rows, self.bands(), Band::flux_column, |r, b| {
            r.source.flux[b]
        }));
        columns.extend(per_band(rows, self.bands(), sed_column, |r, b| {
            r.source.sed[b]
        }));
        DataFrame::new(columns)
    }
}

impl UnmatchedTable {
    pub fn to_dataframe(&self) -> PolarsResult<DataFrame> {
        let rows = self.as_slice();
        let mut columns = vec![
            Column::new(
                "index".into(),
                rows.iter().map(|r| r.index as u64).collect::<Vec<u64>>(),
            ),
            Column::new(
                "id".into(),
                rows.iter().map(|r| r.source.id).collect::<Vec<u64>>(),
            ),
            Column::new(
                "x".into(),
                rows.iter().map(|r| r.source.x).collect::<Vec<f64>>(),
            ),
            Column::new(
                "y".into(),
                rows.iter().map(|r| r.source.y).collect::<Vec<f64>>(),
            ),
        ];
        columns.extend(per_band(rows, self.bands(), Band::flux_column, |r, b| {
            r.source.flux[b]
        }));
        columns.extend(per_band(rows, self.bands(), Band::ratio_column, |r, b| {
            r.peak_to_noise[b]
        }));
        DataFrame::new(columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        catalog::{SimCatalog, TruthSource},
        context::Context,
        detection::{Footprint, PeakRecord},
        exposure::BBox,
        matcher::{self, MatchConfig},
        peaks,
    };

    #[test]
    fn match_frames() {
        let bands = [Band::R, Band::I];
        let peaks = peaks::build_footprint_peak_table(
            &Footprint::new(
                BBox::new(0, 0, 20, 20),
                vec![PeakRecord { ix: 10, iy: 11 }, PeakRecord { ix: 2, iy: 2 }],
            ),
            &bands,
            Some(3),
        );
        let catalog = SimCatalog::new(
            &bands,
            vec![
                TruthSource::new(1, 10., 10.).flux(Band::I, 100.),
                TruthSource::new(2, 18., 18.).flux(Band::I, 10.),
            ],
        );
        let result = matcher::match_to_ref(
            &mut Context::new(),
            &peaks,
            &catalog,
            &bands,
            &MatchConfig::default(),
            Some(&[1., 1.][..]),
        )
        .unwrap();

        let df = peaks.to_dataframe().unwrap();
        assert_eq!(df.shape(), (2, 10));
        assert!(df.column("sed_i").is_ok());

        let df = result.table.to_dataframe().unwrap();
        assert_eq!(df.shape(), (2, 14));
        assert_eq!(df.column("truth_index").unwrap().null_count(), 0);

        let df = result.unmatched.to_dataframe().unwrap();
        assert_eq!(df.shape(), (1, 8));
        assert!(df.column("i peak/noise").is_ok());
    }
}
