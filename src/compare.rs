//! Deblending methods comparison
//!
//! The flux and the SED of the peaks measured with each deblending method are compared to the
//! flux and the SED of the matched simulated sources.
//! Sources fainter than a minimum flux are left out of the statistics.

use crate::{
    band::{Band, PerBand},
    context::{Context, RenderError},
    flux,
    matcher::MatchTable,
    peaks::PeakTable,
    stats::{self, ERROR_BINS},
};

#[derive(thiserror::Error, Debug)]
pub enum CompareError {
    #[error("No deblending method to compare")]
    NoMethod,
    #[error("{method} has {n_table} peak tables for {n_sim} match tables")]
    TableCount {
        method: String,
        n_table: usize,
        n_sim: usize,
    },
    #[error("{method} has {n_row} peaks for {n_sim} simulated matches in exposure #{exposure}")]
    Length {
        method: String,
        exposure: usize,
        n_row: usize,
        n_sim: usize,
    },
    #[error("Unknown isolated sources reference method: {0}")]
    UnknownReference(String),
    #[error("Failed to display the comparison")]
    Render(#[from] RenderError),
}
type Result<T> = std::result::Result<T, CompareError>;

pub const ISOLATED: &str = "Isolated";

/// Comparison parameters
#[derive(Debug, Clone)]
pub struct CompareConfig {
    min_flux: f64,
    reference_band: Band,
    isolated_reference: Option<String>,
}
impl Default for CompareConfig {
    fn default() -> Self {
        Self {
            min_flux: 50.,
            reference_band: Band::I,
            isolated_reference: None,
        }
    }
}
impl CompareConfig {
    /// Minimum simulated flux of the sources included in the statistics
    pub fn min_flux(self, min_flux: f64) -> Self {
        Self { min_flux, ..self }
    }
    /// Band of the flux cut applied to the SED errors
    pub fn reference_band(self, reference_band: Band) -> Self {
        Self {
            reference_band,
            ..self
        }
    }
    /// Method whose flux errors of the isolated sources are reported, the first method if not set
    pub fn isolated_reference<S: Into<String>>(self, method: S) -> Self {
        Self {
            isolated_reference: Some(method.into()),
            ..self
        }
    }
}

/// Statistics of a series of errors
#[derive(Debug, Clone, Default)]
pub struct ErrorStats {
    /// Series label
    pub label: String,
    /// Pairs of simulated flux and error
    pub samples: Vec<(f64, f64)>,
    /// Number of non finite errors left out
    pub dropped: usize,
    /// Mean of the absolute errors
    pub mean_abs: Option<f64>,
    pub rms: Option<f64>,
    /// Fraction of the absolute errors in percent within each of [ERROR_BINS]
    pub histogram: Vec<f64>,
}
impl ErrorStats {
    pub fn new<S, I>(label: S, samples: I) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = (f64, f64)>,
    {
        let (samples, non_finite): (Vec<_>, Vec<_>) = samples
            .into_iter()
            .partition(|(_, error)| error.is_finite());
        let errors: Vec<f64> = samples.iter().map(|(_, e)| *e).collect();
        let abs_errors: Vec<f64> = errors.iter().map(|e| e.abs()).collect();
        let percent: Vec<f64> = abs_errors.iter().map(|e| 100. * e).collect();
        Self {
            label: label.into(),
            dropped: non_finite.len(),
            mean_abs: stats::mean(&abs_errors),
            rms: stats::rms(&errors),
            histogram: stats::clipped_histogram(&percent, &ERROR_BINS),
            samples,
        }
    }
    pub fn len(&self) -> usize {
        self.samples.len()
    }
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// SED errors of the matched sources, one series per method
#[derive(Debug, Clone, Default)]
pub struct SedComparison {
    pub all: Vec<ErrorStats>,
    /// Sources brighter than the minimum flux in the reference band
    pub good: Vec<ErrorStats>,
}

/// Fractional flux errors of the matched bright sources in one band
///
/// One series per method for the blended sources, followed by the isolated sources series.
#[derive(Debug, Clone, Default)]
pub struct FluxComparison {
    pub series: Vec<ErrorStats>,
}

/// Detection and matching counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    pub simulated: usize,
    pub detected: usize,
    pub matched: usize,
    pub matched_isolated: usize,
    pub matched_blended: usize,
    pub duplicates: usize,
}

/// Comparison of all the methods
#[derive(Debug, Clone, Default)]
pub struct Comparison {
    /// The stacked simulated matches
    pub sim: MatchTable,
    pub sim_seds: Vec<PerBand<f64>>,
    /// The stacked peak tables of each method, with their SEDs
    pub methods: Vec<(String, PeakTable)>,
    pub totals: Totals,
    pub sed: SedComparison,
    pub flux: Vec<(Band, FluxComparison)>,
}

fn stack<T: FromIterator<T>>(tables: Vec<T>, with_image: impl Fn(T, usize) -> T) -> T {
    tables
        .into_iter()
        .enumerate()
        .map(|(n, table)| with_image(table, n + 1))
        .collect()
}

fn sed_error(meas: &PerBand<f64>, sim: &PerBand<f64>, bands: &[Band]) -> f64 {
    let sum: f64 = bands
        .iter()
        .map(|&band| ((meas[band] - sim[band]) / sim[band]).powi(2))
        .sum();
    (sum / bands.len() as f64).sqrt()
}

/// Pairs of simulated flux and fractional flux error of the matched sources
/// brighter than `min_flux`, either blended or isolated
fn flux_errors<'a>(
    sim: &'a MatchTable,
    table: &'a PeakTable,
    blended: &'a [bool],
    band: Band,
    min_flux: f64,
    keep_blended: bool,
) -> impl Iterator<Item = (f64, f64)> + 'a {
    sim.iter()
        .zip(table.iter())
        .zip(blended)
        .filter(move |&((sim_row, _), &b)| {
            sim_row.matched && b == keep_blended && !(sim_row.source.flux[band] < min_flux)
        })
        .map(move |((sim_row, row), _)| {
            let sim_flux = sim_row.source.flux[band];
            (sim_flux, (row.flux[band] - sim_flux) / sim_flux)
        })
}

/// Compares the flux and the SED measured with each deblending method to the simulated ones
///
/// `sim_tables` and the tables of each method hold one table per exposure, in the same order.
pub fn compare_meas_to_sim(
    ctx: &mut Context,
    sim_tables: Vec<MatchTable>,
    methods: Vec<(String, Vec<PeakTable>)>,
    bands: &[Band],
    config: &CompareConfig,
) -> Result<Comparison> {
    if methods.is_empty() {
        return Err(CompareError::NoMethod);
    }
    for (method, tables) in &methods {
        if tables.len() != sim_tables.len() {
            return Err(CompareError::TableCount {
                method: method.clone(),
                n_table: tables.len(),
                n_sim: sim_tables.len(),
            });
        }
        for (n, (table, sim)) in tables.iter().zip(&sim_tables).enumerate() {
            if table.len() != sim.len() {
                return Err(CompareError::Length {
                    method: method.clone(),
                    exposure: n + 1,
                    n_row: table.len(),
                    n_sim: sim.len(),
                });
            }
        }
    }
    let sim = stack(sim_tables, MatchTable::with_image);
    let methods: Vec<(String, PeakTable)> = methods
        .into_iter()
        .map(|(name, tables)| {
            let table = stack(tables, PeakTable::with_image);
            (name, flux::calculate_seds_from_flux(&table, bands).0)
        })
        .collect();
    let (_, reference) = methods.first().ok_or(CompareError::NoMethod)?;
    let isolated_table = match &config.isolated_reference {
        None => reference,
        Some(name) => methods
            .iter()
            .find(|(method, _)| method == name)
            .map(|(_, table)| table)
            .ok_or_else(|| CompareError::UnknownReference(name.clone()))?,
    };
    let blended: Vec<bool> = reference.iter().map(|row| row.blended).collect();

    let totals = Totals {
        simulated: sim.len(),
        detected: blended.len(),
        matched: sim.n_matched(),
        matched_isolated: sim
            .iter()
            .zip(&blended)
            .filter(|&(row, &b)| row.matched && !b)
            .count(),
        matched_blended: sim
            .iter()
            .zip(&blended)
            .filter(|&(row, &b)| row.matched && b)
            .count(),
        duplicates: sim.n_duplicate(),
    };
    let target = ctx.log_target().to_string();
    log::info!(target: target.as_str(), "Total Simulated Sources: {}", totals.simulated);
    log::info!(target: target.as_str(), "Total Detected Sources: {}", totals.detected);
    log::info!(target: target.as_str(), "Total Matches: {}", totals.matched);
    log::info!(target: target.as_str(), "Matched Isolated sources: {}", totals.matched_isolated);
    log::info!(target: target.as_str(), "Matched Blended sources: {}", totals.matched_blended);
    log::info!(target: target.as_str(), "Total Duplicates: {}", totals.duplicates);

    let (sim_seds, _) = flux::seds_from_flux(sim.iter().map(|row| &row.source.flux), bands);
    let reference_band = config.reference_band;
    let mut sed = SedComparison::default();
    for (method, table) in &methods {
        let errors: Vec<(f64, f64)> = sim
            .iter()
            .zip(table.iter())
            .zip(&sim_seds)
            .filter(|((sim_row, _), _)| sim_row.matched)
            .map(|((sim_row, row), sim_sed)| {
                let meas_sed = row.sed.clone().unwrap_or_default();
                (
                    sim_row.source.flux[reference_band],
                    sed_error(&meas_sed, sim_sed, bands),
                )
            })
            .collect();
        let good = errors
            .iter()
            .filter(|(sim_flux, _)| *sim_flux > config.min_flux)
            .cloned();
        sed.good.push(ErrorStats::new(method.as_str(), good));
        let all = ErrorStats::new(method.as_str(), errors);
        log::debug!(
            target: target.as_str(),
            "{} SED errors: {} sources, {} dropped",
            method,
            all.len(),
            all.dropped
        );
        sed.all.push(all);
    }
    ctx.render(|r| r.sed_comparison(&sed))?;

    let mut flux = vec![];
    for &band in bands {
        let mut series: Vec<ErrorStats> = methods
            .iter()
            .map(|(method, table)| {
                ErrorStats::new(
                    method.as_str(),
                    flux_errors(&sim, table, &blended, band, config.min_flux, true),
                )
            })
            .collect();
        series.push(ErrorStats::new(
            ISOLATED,
            flux_errors(&sim, isolated_table, &blended, band, config.min_flux, false),
        ));
        for stats in &series {
            log::info!(
                target: target.as_str(),
                "Filter {} {}: mean |error| {:?}, rms {:?} ({} sources, {} dropped)",
                band,
                stats.label,
                stats.mean_abs,
                stats.rms,
                stats.len(),
                stats.dropped
            );
        }
        let comparison = FluxComparison { series };
        ctx.render(|r| r.flux_comparison(band, &comparison))?;
        flux.push((band, comparison));
    }

    Ok(Comparison {
        sim,
        sim_seds,
        methods,
        totals,
        sed,
        flux,
    })
}
