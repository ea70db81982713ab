//! CSV export of the peak, match and unmatched tables
//!
//! One column per scalar field and one column per band for the per-band fields
//! (`flux_<band>`, `sed_<band>`, `<band> peak/noise`).
//! Footprints and intensity cutouts are not exported: a peak table read back only knows
//! the bounding box of the footprints and a match table has no cutouts.

use crate::{
    band::{Band, PerBand},
    catalog::TruthSource,
    detection::Footprint,
    exposure::BBox,
    matcher::{MatchRow, MatchTable, UnmatchedTable},
    peaks::{PeakRow, PeakTable},
};
use std::{collections::HashMap, path::Path, str::FromStr, sync::Arc};

#[derive(thiserror::Error, Debug)]
pub enum TableError {
    #[error("Failed to read/write the CSV table")]
    Csv(#[from] csv::Error),
    #[error("Missing column {0:?}")]
    MissingColumn(String),
    #[error("Failed to parse {value:?} in column {column:?} of row #{row}")]
    Parse {
        column: String,
        value: String,
        row: usize,
    },
}
type Result<T> = std::result::Result<T, TableError>;

fn sed_column(band: Band) -> String {
    format!("sed_{}", band)
}

fn flux_and_sed_keys(bands: &[Band]) -> impl Iterator<Item = String> + '_ {
    bands
        .iter()
        .map(|&b| b.flux_column())
        .chain(bands.iter().map(|&b| sed_column(b)))
}

fn flux_and_sed_values<'a>(
    bands: &'a [Band],
    flux: &'a PerBand<f64>,
    sed: Option<&'a PerBand<f64>>,
) -> impl Iterator<Item = String> + 'a {
    bands
        .iter()
        .map(move |&b| format!("{}", flux[b]))
        .chain(bands.iter().map(move |&b| match sed {
            Some(sed) => format!("{}", sed[b]),
            None => String::new(),
        }))
}

/// Column positions from the CSV header
struct Columns {
    index: HashMap<String, usize>,
    bands: Vec<Band>,
}
impl Columns {
    fn new(headers: &csv::StringRecord) -> Self {
        let index: HashMap<String, usize> = headers
            .iter()
            .enumerate()
            .map(|(i, h)| (h.to_string(), i))
            .collect();
        let bands = headers
            .iter()
            .filter_map(|h| h.strip_prefix("flux_"))
            .filter_map(|b| Band::from_str(b).ok())
            .collect();
        Self { index, bands }
    }
    fn has(&self, column: &str) -> bool {
        self.index.contains_key(column)
    }
    fn get<'r>(&self, record: &'r csv::StringRecord, column: &str) -> Result<&'r str> {
        self.index
            .get(column)
            .and_then(|&i| record.get(i))
            .ok_or_else(|| TableError::MissingColumn(column.to_string()))
    }
    fn parse<T: FromStr>(&self, record: &csv::StringRecord, column: &str, row: usize) -> Result<T> {
        let value = self.get(record, column)?;
        value.parse().map_err(|_| TableError::Parse {
            column: column.to_string(),
            value: value.to_string(),
            row,
        })
    }
    /// Empty field is `None`
    fn parse_opt<T: FromStr>(
        &self,
        record: &csv::StringRecord,
        column: &str,
        row: usize,
    ) -> Result<Option<T>> {
        match self.get(record, column)? {
            "" => Ok(None),
            _ => self.parse(record, column, row).map(Some),
        }
    }
    fn flux(&self, record: &csv::StringRecord, row: usize) -> Result<PerBand<f64>> {
        let mut flux = PerBand::splat(0f64);
        for &band in &self.bands {
            flux[band] = self.parse(record, &band.flux_column(), row)?;
        }
        Ok(flux)
    }
    /// `None` if the SED columns are missing or empty
    fn sed(&self, record: &csv::StringRecord, row: usize) -> Result<Option<PerBand<f64>>> {
        let mut sed = PerBand::splat(0f64);
        for &band in &self.bands {
            let column = sed_column(band);
            if !self.has(&column) {
                return Ok(None);
            }
            match self.parse_opt(record, &column, row)? {
                Some(value) => sed[band] = value,
                None => return Ok(None),
            }
        }
        Ok(Some(sed))
    }
}

impl PeakTable {
    /// Writes the table to a CSV file
    pub fn to_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        log::info!("Writing {:?}...", path.as_ref());
        let mut wtr = csv::Writer::from_path(path)?;
        let mut keys: Vec<String> = [
            "parent",
            "peak_idx",
            "x",
            "y",
            "blended",
            "image",
            "bbox_min_x",
            "bbox_min_y",
            "bbox_width",
            "bbox_height",
        ]
        .iter()
        .map(|k| k.to_string())
        .collect();
        keys.extend(flux_and_sed_keys(self.bands()));
        wtr.write_record(&keys)?;
        for row in self.iter() {
            let bbox = row.footprint.bbox;
            let mut record = vec![
                format!("{}", row.parent),
                format!("{}", row.peak_idx),
                format!("{}", row.x),
                format!("{}", row.y),
                format!("{}", row.blended),
                format!("{}", row.image),
                format!("{}", bbox.min_x),
                format!("{}", bbox.min_y),
                format!("{}", bbox.width),
                format!("{}", bbox.height),
            ];
            record.extend(flux_and_sed_values(
                self.bands(),
                &row.flux,
                row.sed.as_ref(),
            ));
            wtr.write_record(&record)?;
        }
        wtr.flush().map_err(csv::Error::from)?;
        Ok(())
    }
    /// Reads a table written with [PeakTable::to_csv]
    ///
    /// The bands are given by the `flux_<band>` columns.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Self> {
        log::info!("Loading {:?}...", path.as_ref());
        let mut rdr = csv::Reader::from_path(path)?;
        let columns = Columns::new(rdr.headers()?);
        let mut rows = vec![];
        let mut footprints: HashMap<(usize, u64), Arc<Footprint>> = HashMap::new();
        for (n, result) in rdr.records().enumerate() {
            let record = result?;
            let parent: u64 = columns.parse(&record, "parent", n)?;
            let image: usize = columns.parse(&record, "image", n)?;
            let bbox = BBox::new(
                columns.parse(&record, "bbox_min_x", n)?,
                columns.parse(&record, "bbox_min_y", n)?,
                columns.parse(&record, "bbox_width", n)?,
                columns.parse(&record, "bbox_height", n)?,
            );
            let footprint = footprints
                .entry((image, parent))
                .or_insert_with(|| Arc::new(Footprint::new(bbox, vec![])));
            rows.push(PeakRow {
                parent,
                peak_idx: columns.parse(&record, "peak_idx", n)?,
                x: columns.parse(&record, "x", n)?,
                y: columns.parse(&record, "y", n)?,
                blended: columns.parse(&record, "blended", n)?,
                footprint: Arc::clone(footprint),
                flux: columns.flux(&record, n)?,
                sed: columns.sed(&record, n)?,
                image,
            });
        }
        Ok(PeakTable::new(&columns.bands, rows))
    }
}

impl MatchTable {
    /// Writes the table to a CSV file
    pub fn to_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        log::info!("Writing {:?}...", path.as_ref());
        let mut wtr = csv::Writer::from_path(path)?;
        let mut keys: Vec<String> = [
            "id",
            "x",
            "y",
            "size",
            "redshift",
            "truth_index",
            "distance",
            "matched",
            "duplicate",
            "image",
        ]
        .iter()
        .map(|k| k.to_string())
        .collect();
        keys.extend(flux_and_sed_keys(self.bands()));
        wtr.write_record(&keys)?;
        for row in self.iter() {
            let source = &row.source;
            let mut record = vec![
                format!("{}", source.id),
                format!("{}", source.x),
                format!("{}", source.y),
                format!("{}", source.size),
                format!("{}", source.redshift),
                row.truth_index
                    .map_or_else(String::new, |index| format!("{}", index)),
                format!("{}", row.distance),
                format!("{}", row.matched),
                format!("{}", row.duplicate),
                format!("{}", row.image),
            ];
            record.extend(flux_and_sed_values(
                self.bands(),
                &source.flux,
                Some(&source.sed),
            ));
            wtr.write_record(&record)?;
        }
        wtr.flush().map_err(csv::Error::from)?;
        Ok(())
    }
    /// Reads a table written with [MatchTable::to_csv]
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Self> {
        log::info!("Loading {:?}...", path.as_ref());
        let mut rdr = csv::Reader::from_path(path)?;
        let columns = Columns::new(rdr.headers()?);
        let mut rows = vec![];
        for (n, result) in rdr.records().enumerate() {
            let record = result?;
            let source = TruthSource {
                id: columns.parse(&record, "id", n)?,
                x: columns.parse(&record, "x", n)?,
                y: columns.parse(&record, "y", n)?,
                size: columns.parse(&record, "size", n)?,
                redshift: columns.parse(&record, "redshift", n)?,
                flux: columns.flux(&record, n)?,
                sed: columns.sed(&record, n)?.unwrap_or_default(),
                ..Default::default()
            };
            rows.push(MatchRow {
                source,
                truth_index: columns.parse_opt(&record, "truth_index", n)?,
                distance: columns.parse(&record, "distance", n)?,
                matched: columns.parse(&record, "matched", n)?,
                duplicate: columns.parse(&record, "duplicate", n)?,
                image: columns.parse(&record, "image", n)?,
            });
        }
        Ok(MatchTable::new(&columns.bands, rows))
    }
}

impl UnmatchedTable {
    /// Writes the table to a CSV file
    pub fn to_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        log::info!("Writing {:?}...", path.as_ref());
        let mut wtr = csv::Writer::from_path(path)?;
        let mut keys: Vec<String> = ["index", "id", "x", "y"]
            .iter()
            .map(|k| k.to_string())
            .collect();
        keys.extend(self.bands().iter().map(|&b| b.flux_column()));
        keys.extend(self.bands().iter().map(|&b| b.ratio_column()));
        wtr.write_record(&keys)?;
        for row in self.iter() {
            let mut record = vec![
                format!("{}", row.index),
                format!("{}", row.source.id),
                format!("{}", row.source.x),
                format!("{}", row.source.y),
            ];
            record.extend(
                self.bands()
                    .iter()
                    .map(|&b| format!("{}", row.source.flux[b])),
            );
            record.extend(
                self.bands()
                    .iter()
                    .map(|&b| format!("{}", row.peak_to_noise[b])),
            );
            wtr.write_record(&record)?;
        }
        wtr.flush().map_err(csv::Error::from)?;
        Ok(())
    }
}
