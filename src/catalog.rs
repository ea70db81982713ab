//! Simulated (truth) galaxy catalog
//!
//! The truth catalog is loaded once per run either from a pickle file, with the intensity
//! cutouts of every source, or from a CSV file (optionally gzipped) with only the scalar
//! columns: `id,x,y,size,redshift,flux_u,...,flux_y`.

use crate::{
    band::{Band, PerBand},
    context::Context,
    exposure::Image,
    flux,
};
use flate2::read::GzDecoder;
use serde::Deserialize;
use std::{collections::BTreeMap, fs::File, io::Read, ops::Deref, path::Path};

#[derive(thiserror::Error, Debug)]
pub enum CatalogError {
    #[error("Failed to open the simulated catalog")]
    Io(#[from] std::io::Error),
    #[error("Failed to deserialize the CSV file")]
    Csv(#[from] csv::Error),
    #[error("Failed to deserialize the pickle file")]
    Pickle(#[from] serde_pickle::Error),
    #[error("Source #{id} has no {band} flux")]
    MissingFlux { id: u64, band: Band },
}
type Result<T> = std::result::Result<T, CatalogError>;

/// Simulated source
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TruthSource {
    pub id: u64,
    pub x: f64,
    pub y: f64,
    pub flux: PerBand<f64>,
    /// Intensity cutout in each band
    pub intensity: PerBand<Image>,
    pub size: f64,
    pub redshift: f64,
    pub sed: PerBand<f64>,
}
impl TruthSource {
    pub fn new(id: u64, x: f64, y: f64) -> Self {
        Self {
            id,
            x,
            y,
            ..Default::default()
        }
    }
    pub fn flux(self, band: Band, value: f64) -> Self {
        let mut flux = self.flux;
        flux[band] = value;
        Self { flux, ..self }
    }
    pub fn intensity(self, band: Band, cutout: Image) -> Self {
        let mut intensity = self.intensity;
        intensity[band] = cutout;
        Self { intensity, ..self }
    }
    /// Copy of the source with zero flux, SED, size, redshift and intensity, moved to (x,y)
    pub fn zeroed_at(&self, x: f64, y: f64) -> Self {
        Self {
            id: self.id,
            x,
            y,
            flux: PerBand::splat(0f64),
            intensity: self.intensity.map(Image::zeros_like),
            size: 0f64,
            redshift: 0f64,
            sed: PerBand::splat(0f64),
        }
    }
    /// Peak intensity in `band` over the noise level, NaN without a cutout
    pub fn peak_to_noise(&self, band: Band, noise: f64) -> f64 {
        self.intensity[band]
            .max()
            .map_or(f64::NAN, |peak| peak / noise)
    }
}

#[derive(Deserialize, Debug)]
struct Record {
    id: u64,
    x: f64,
    y: f64,
    size: f64,
    redshift: f64,
    flux: BTreeMap<Band, f64>,
    #[serde(default)]
    intensity: BTreeMap<Band, Image>,
}

#[derive(Deserialize, Debug)]
struct CsvRecord {
    id: u64,
    x: f64,
    y: f64,
    #[serde(default)]
    size: f64,
    #[serde(default)]
    redshift: f64,
    #[serde(default)]
    flux_u: Option<f64>,
    #[serde(default)]
    flux_g: Option<f64>,
    #[serde(default)]
    flux_r: Option<f64>,
    #[serde(default)]
    flux_i: Option<f64>,
    #[serde(default)]
    flux_z: Option<f64>,
    #[serde(default)]
    flux_y: Option<f64>,
}
impl CsvRecord {
    fn flux(&self) -> PerBand<Option<f64>> {
        PerBand::from([
            self.flux_u,
            self.flux_g,
            self.flux_r,
            self.flux_i,
            self.flux_z,
            self.flux_y,
        ])
    }
}

/// Truth table: the simulated sources and the bands they are measured in
#[derive(Debug, Clone, Default)]
pub struct SimCatalog {
    bands: Vec<Band>,
    sources: Vec<TruthSource>,
}
impl Deref for SimCatalog {
    type Target = Vec<TruthSource>;

    fn deref(&self) -> &Self::Target {
        &self.sources
    }
}
impl SimCatalog {
    /// Creates the catalog, computing the SED of every source from its flux in `bands`
    pub fn new(bands: &[Band], sources: Vec<TruthSource>) -> Self {
        let sources = sources
            .into_iter()
            .map(|source| {
                let (sed, _) = flux::sed_from_flux(&source.flux, bands);
                TruthSource { sed, ..source }
            })
            .collect();
        Self {
            bands: bands.to_vec(),
            sources,
        }
    }
    pub fn bands(&self) -> &[Band] {
        &self.bands
    }
    /// Loads a CSV file if the path ends with `.csv` or `.csv.gz`, a pickle file otherwise
    pub fn load<P: AsRef<Path>>(ctx: &Context, path: P, bands: &[Band]) -> Result<Self> {
        let path = path.as_ref();
        log::info!(target: ctx.log_target(), "Loading {:?}...", path);
        let name = path.to_string_lossy();
        let catalog = if name.ends_with(".csv") || name.ends_with(".csv.gz") {
            Self::from_csv(path, bands)?
        } else {
            Self::from_pickle(path, bands)?
        };
        log::info!(target: ctx.log_target(), "... {} simulated sources", catalog.len());
        Ok(catalog)
    }
    /// Loads a pickled list of sources
    pub fn from_pickle<P: AsRef<Path>>(path: P, bands: &[Band]) -> Result<Self> {
        let mut file = File::open(path.as_ref())?;
        let records: Vec<Record> = serde_pickle::from_reader(&mut file, Default::default())?;
        let sources = records
            .into_iter()
            .map(|record| {
                let mut flux = PerBand::splat(0f64);
                for &band in bands {
                    flux[band] = *record.flux.get(&band).ok_or(CatalogError::MissingFlux {
                        id: record.id,
                        band,
                    })?;
                }
                let mut intensity: PerBand<Image> = Default::default();
                for (band, cutout) in record.intensity {
                    intensity[band] = cutout;
                }
                Ok(TruthSource {
                    id: record.id,
                    x: record.x,
                    y: record.y,
                    flux,
                    intensity,
                    size: record.size,
                    redshift: record.redshift,
                    sed: PerBand::default(),
                })
            })
            .collect::<Result<Vec<TruthSource>>>()?;
        Ok(Self::new(bands, sources))
    }
    /// Loads a CSV file, gzipped if the extension is `gz`
    pub fn from_csv<P: AsRef<Path>>(path: P, bands: &[Band]) -> Result<Self> {
        let path = path.as_ref();
        let mut contents = String::new();
        let csv_file = File::open(path)?;
        if path.extension().is_some_and(|ext| ext == "gz") {
            let mut gz = GzDecoder::new(csv_file);
            gz.read_to_string(&mut contents)?;
        } else {
            let mut csv_file = csv_file;
            csv_file.read_to_string(&mut contents)?;
        }
        let mut rdr = csv::Reader::from_reader(contents.as_bytes());
        let mut sources = vec![];
        for result in rdr.deserialize() {
            let record: CsvRecord = result?;
            let record_flux = record.flux();
            let mut flux = PerBand::splat(0f64);
            for &band in bands {
                flux[band] = record_flux[band].ok_or(CatalogError::MissingFlux {
                    id: record.id,
                    band,
                })?;
            }
            sources.push(TruthSource {
                id: record.id,
                x: record.x,
                y: record.y,
                flux,
                size: record.size,
                redshift: record.redshift,
                ..Default::default()
            });
        }
        Ok(Self::new(bands, sources))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{write::GzEncoder, Compression};
    use std::io::Write;

    const CSV: &str = "id,x,y,size,redshift,flux_g,flux_r,flux_i\n\
                       1,10.0,10.0,2.5,0.3,10.0,30.0,60.0\n\
                       2,40.0,12.0,1.5,0.8,0.0,0.0,0.0\n";

    #[test]
    fn load_csv() {
        let path = std::env::temp_dir().join("deblend-sim_truth.csv");
        std::fs::write(&path, CSV).unwrap();
        let catalog = SimCatalog::from_csv(&path, &[Band::G, Band::R, Band::I]).unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog[0].flux[Band::R], 30.);
        assert!((catalog[0].sed[Band::I] - 0.6).abs() < 1e-12);
        assert_eq!(catalog[1].sed, PerBand::splat(0f64));
        assert!(catalog[0].intensity[Band::G].is_empty());
    }

    #[test]
    fn load_gzipped_csv() {
        let path = std::env::temp_dir().join("deblend-sim_truth.csv.gz");
        let mut gz = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        gz.write_all(CSV.as_bytes()).unwrap();
        gz.finish().unwrap();
        let catalog = SimCatalog::load(&Context::new(), &path, &[Band::I]).unwrap();
        assert_eq!(catalog[1].x, 40.);
        assert_eq!(catalog[0].sed[Band::I], 1.);
    }

    #[test]
    fn missing_band() {
        let path = std::env::temp_dir().join("deblend-sim_truth_z.csv");
        std::fs::write(&path, CSV).unwrap();
        assert!(matches!(
            SimCatalog::from_csv(&path, &[Band::Z]),
            Err(CatalogError::MissingFlux { id: 1, band: Band::Z })
        ));
    }

    #[test]
    fn zeroed_source() {
        let source = TruthSource::new(7, 1., 2.)
            .flux(Band::I, 10.)
            .intensity(Band::I, Image::new(2, 1, vec![3., 4.]));
        let zeroed = source.zeroed_at(5., 6.);
        assert_eq!((zeroed.x, zeroed.y), (5., 6.));
        assert_eq!(zeroed.flux[Band::I], 0.);
        assert_eq!(zeroed.intensity[Band::I].data, vec![0., 0.]);
        assert_eq!(source.peak_to_noise(Band::I, 2.), 2.);
        assert!(source.peak_to_noise(Band::G, 2.).is_nan());
    }
}
