//! Flux and SED of the deblended peaks
//!
//! The peak table flux columns are filled by one of the deblending strategies:
//!  - [deblend_sim_exposures]: sum of the flux portions of a [Deblender],
//!  - [nmf_flux]: sum of the templates of a [DeblendedParent],
//!  - [flux_portion]: parent flux re-apportioned with the templates of a [DeblendedParent],
//!  - [isolated_flux]: sum of the footprint pixels for isolated peaks.
//!
//! Each strategy returns a new table, rows of parents without results are copied as they are.

use crate::{
    band::{Band, PerBand},
    context::{Context, RenderError},
    detection::{DetectionCatalog, Footprint},
    exposure::{Exposure, ExposureError, Image},
    matcher::MatchTable,
    peaks::{PeakRow, PeakTable},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(thiserror::Error, Debug)]
pub enum FluxError {
    #[error("Deblending of parent #{parent} failed")]
    Deblender {
        parent: u64,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("{n_exposure} exposures given for {n_band} bands")]
    ExposureCount { n_band: usize, n_exposure: usize },
    #[error("{n_noise} noise levels given for {n_band} bands")]
    NoiseLength { n_band: usize, n_noise: usize },
    #[error("{n_peak} peaks for {n_match} matches")]
    TableLength { n_peak: usize, n_match: usize },
    #[error("Failed to extract the footprint image")]
    Exposure(#[from] ExposureError),
    #[error("Failed to display a flux discrepancy")]
    Render(#[from] RenderError),
}
type Result<T> = std::result::Result<T, FluxError>;

/// SED over `bands` and its normalization constant
///
/// A source without flux has a SED of zeros and a normalization of 0.
/// Bands not in `bands` are 0.
pub fn sed_from_flux(flux: &PerBand<f64>, bands: &[Band]) -> (PerBand<f64>, f64) {
    let normalization: f64 = flux.select(bands).sum();
    let mut sed = PerBand::splat(0f64);
    if normalization != 0f64 {
        for &band in bands {
            sed[band] = flux[band] / normalization;
        }
    }
    (sed, normalization)
}

/// SEDs and normalization constants of a set of sources
pub fn seds_from_flux<'a, I>(fluxes: I, bands: &[Band]) -> (Vec<PerBand<f64>>, Vec<f64>)
where
    I: IntoIterator<Item = &'a PerBand<f64>>,
{
    fluxes
        .into_iter()
        .map(|flux| sed_from_flux(flux, bands))
        .unzip()
}

/// A new table with the SED of every peak, and the SED normalization constants
pub fn calculate_seds_from_flux(table: &PeakTable, bands: &[Band]) -> (PeakTable, Vec<f64>) {
    let (seds, normalization) = seds_from_flux(table.iter().map(|row| &row.flux), bands);
    let table = table.map_rows(|k, row| PeakRow {
        sed: Some(seds[k].clone()),
        ..row.clone()
    });
    (table, normalization)
}

impl PeakTable {
    /// SEDs over the bands of the table, see [calculate_seds_from_flux]
    pub fn with_seds(&self) -> (PeakTable, Vec<f64>) {
        calculate_seds_from_flux(self, self.bands())
    }
}

fn fill_flux<F>(peaks: &PeakTable, bands: &[Band], mut flux: F) -> PeakTable
where
    F: FnMut(&PeakRow, usize, Band) -> Option<f64>,
{
    peaks.map_rows(|_, row| {
        let mut row = row.clone();
        for (fidx, &band) in bands.iter().enumerate() {
            if let Some(value) = flux(&row, fidx, band) {
                row.flux[band] = value;
            }
        }
        row
    })
}

/// Flux portions of the peaks of a parent, `peaks[peak_idx][band]`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeblenderResult {
    pub peaks: Vec<PerBandImages>,
}
/// One image per band, in the order of the deblended bands
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerBandImages(pub Vec<Image>);

/// Deblending engine apportioning the flux of a footprint among its peaks
pub trait Deblender {
    /// Deblends `footprint` in all `exposures`, one per band
    ///
    /// `fwhm` is the PSF FWHM in each exposure.
    fn deblend(
        &self,
        bands: &[Band],
        footprint: &Footprint,
        exposures: &[Exposure],
        fwhm: &[f64],
    ) -> std::result::Result<DeblenderResult, Box<dyn std::error::Error + Send + Sync>>;
}

/// Results of [deblend_sim_exposures]
#[derive(Debug, Clone, Default)]
pub struct DeblendOutput {
    /// Deblender results per parent id
    pub results: BTreeMap<u64, DeblenderResult>,
    /// The peak table with the flux of the deblended peaks
    pub table: PeakTable,
}

/// Deblends all the blended parents of `detections`
pub fn deblend_sim_exposures<D: Deblender>(
    ctx: &Context,
    deblender: &D,
    bands: &[Band],
    detections: &DetectionCatalog,
    exposures: &[Exposure],
    peaks: &PeakTable,
) -> Result<DeblendOutput> {
    if exposures.len() < bands.len() {
        return Err(FluxError::ExposureCount {
            n_band: bands.len(),
            n_exposure: exposures.len(),
        });
    }
    let fwhm: Vec<f64> = exposures.iter().map(Exposure::psf_fwhm).collect();
    let mut results = BTreeMap::new();
    for (n, blend) in detections.blended().enumerate() {
        log::debug!(target: ctx.log_target(), "Deblending blend {}", n);
        let result = deblender
            .deblend(bands, &blend.footprint, exposures, &fwhm)
            .map_err(|source| FluxError::Deblender {
                parent: blend.id,
                source,
            })?;
        results.insert(blend.id, result);
    }
    let table = fill_flux(peaks, bands, |row, fidx, _| {
        results
            .get(&row.parent)?
            .peaks
            .get(row.peak_idx)?
            .0
            .get(fidx)
            .map(Image::sum)
    });
    Ok(DeblendOutput { results, table })
}

/// Deblended parent with one template per peak and per band
pub trait DeblendedParent {
    fn n_band(&self) -> usize;
    fn n_peak(&self) -> usize;
    /// Template of the peak `peak_idx` in the band `fidx`
    fn template(&self, fidx: usize, peak_idx: usize) -> Option<&[f64]>;
    /// Flux of the peak `peak_idx` in the band `fidx` once the parent flux is re-apportioned
    fn peak_flux(&self, fidx: usize, peak_idx: usize) -> Option<f64>;
}

/// Parent images and peak templates
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateParent {
    /// Parent image in each band
    pub data: Vec<Image>,
    /// `templates[band][peak]`
    pub templates: Vec<Vec<Image>>,
}
impl DeblendedParent for TemplateParent {
    fn n_band(&self) -> usize {
        self.templates.len()
    }
    fn n_peak(&self) -> usize {
        self.templates.first().map_or(0, Vec::len)
    }
    fn template(&self, fidx: usize, peak_idx: usize) -> Option<&[f64]> {
        self.templates
            .get(fidx)?
            .get(peak_idx)
            .map(|t| t.data.as_slice())
    }
    /// Each pixel of the parent image is shared among the peaks in proportion of their templates
    fn peak_flux(&self, fidx: usize, peak_idx: usize) -> Option<f64> {
        let data = self.data.get(fidx)?;
        let templates = self.templates.get(fidx)?;
        let template = templates.get(peak_idx)?;
        Some(
            data.data
                .iter()
                .enumerate()
                .map(|(i, &value)| {
                    let total: f64 = templates.iter().filter_map(|t| t.data.get(i)).sum();
                    match template.data.get(i) {
                        Some(&t) if total > 0f64 => value * t / total,
                        _ => 0f64,
                    }
                })
                .sum(),
        )
    }
}

/// Peak flux as the sum of the peak template
pub fn nmf_flux<P: DeblendedParent>(
    peaks: &PeakTable,
    parents: &BTreeMap<u64, P>,
    bands: &[Band],
) -> PeakTable {
    fill_flux(peaks, bands, |row, fidx, _| {
        parents
            .get(&row.parent)?
            .template(fidx, row.peak_idx)
            .map(|t| t.iter().sum())
    })
}

/// Peak flux as the parent flux re-apportioned with the templates
pub fn flux_portion<P: DeblendedParent>(
    peaks: &PeakTable,
    parents: &BTreeMap<u64, P>,
    bands: &[Band],
) -> PeakTable {
    fill_flux(peaks, bands, |row, fidx, _| {
        parents.get(&row.parent)?.peak_flux(fidx, row.peak_idx)
    })
}

/// Template flux and template overlaps of the peaks of a deblended parent
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Degeneracy {
    pub parent: u64,
    /// Template flux of each peak summed over all the bands
    pub total_flux: Vec<f64>,
    /// `true` for the peaks with a positive total flux
    pub good_flux: Vec<bool>,
    /// `correlation[i][j]`: normalized dot product of the templates of peaks i and j,
    /// restricted to the pixels above the minimum flux
    ///
    /// The diagonal and the pairs with an empty template are 0.
    pub correlation: Vec<Vec<f64>>,
}
impl Degeneracy {
    /// Most correlated pair of peaks
    pub fn max_correlation(&self) -> Option<(usize, usize, f64)> {
        self.correlation
            .iter()
            .enumerate()
            .flat_map(|(i, row)| {
                row.iter()
                    .enumerate()
                    .skip(i + 1)
                    .map(move |(j, &c)| (i, j, c))
            })
            .max_by(|a, b| a.2.total_cmp(&b.2))
    }
}

/// Templates of a peak in all the bands
fn peak_templates<P: DeblendedParent>(
    parent: &P,
    peak_idx: usize,
) -> impl Iterator<Item = &[f64]> + '_ {
    (0..parent.n_band()).filter_map(move |fidx| parent.template(fidx, peak_idx))
}

fn degeneracy<P: DeblendedParent>(id: u64, parent: &P, min_flux: f64) -> Degeneracy {
    let n_peak = parent.n_peak();
    let total_flux: Vec<f64> = (0..n_peak)
        .map(|k| peak_templates(parent, k).flat_map(|t| t.iter()).sum())
        .collect();
    let masked: Vec<Vec<f64>> = (0..n_peak)
        .map(|k| {
            peak_templates(parent, k)
                .flat_map(|t| t.iter().map(|&v| if v > min_flux { v } else { 0f64 }))
                .collect()
        })
        .collect();
    let norms: Vec<f64> = masked
        .iter()
        .map(|t| t.iter().map(|v| v * v).sum::<f64>().sqrt())
        .collect();
    let correlation = (0..n_peak)
        .map(|i| {
            (0..n_peak)
                .map(|j| {
                    if i == j || norms[i] == 0f64 || norms[j] == 0f64 {
                        0f64
                    } else {
                        let dot: f64 =
                            masked[i].iter().zip(&masked[j]).map(|(a, b)| a * b).sum();
                        dot / (norms[i] * norms[j])
                    }
                })
                .collect()
        })
        .collect();
    Degeneracy {
        parent: id,
        good_flux: total_flux.iter().map(|&f| f > 0f64).collect(),
        total_flux,
        correlation,
    }
}

/// Checks every deblended parent for peaks without flux and for overlapping templates
///
/// Template pixels below `min_flux` are left out of the correlations.
/// Each result is handed to the context renderer.
pub fn check_for_degeneracy<P: DeblendedParent>(
    ctx: &mut Context,
    parents: &BTreeMap<u64, P>,
    min_flux: f64,
) -> Result<Vec<Degeneracy>> {
    let mut checks = vec![];
    for (&id, parent) in parents {
        let check = degeneracy(id, parent, min_flux);
        log::info!(
            target: ctx.log_target(),
            "Parent {}: {} peaks, {} without flux, max. template correlation: {:?}",
            id,
            check.total_flux.len(),
            check.good_flux.iter().filter(|good| !**good).count(),
            check.max_correlation()
        );
        ctx.render(|r| r.degeneracy(&check))?;
        checks.push(check);
    }
    Ok(checks)
}

/// Thresholds of the isolated flux discrepancy report
#[derive(Debug, Clone)]
pub struct IsolatedFluxConfig {
    flux_thresh: f64,
    flux_ratio: f64,
}
impl Default for IsolatedFluxConfig {
    fn default() -> Self {
        Self {
            flux_thresh: 2.,
            flux_ratio: 0.5,
        }
    }
}
impl IsolatedFluxConfig {
    /// Minimum simulated peak intensity over noise for a discrepancy to be reported
    pub fn flux_thresh(self, flux_thresh: f64) -> Self {
        Self {
            flux_thresh,
            ..self
        }
    }
    /// Minimum fractional flux difference for a discrepancy to be reported
    pub fn flux_ratio(self, flux_ratio: f64) -> Self {
        Self { flux_ratio, ..self }
    }
}

/// Isolated source whose measured flux is far from the simulated flux
#[derive(Debug, Clone, PartialEq)]
pub struct FluxDiscrepancy {
    /// Row in the peak table
    pub row: usize,
    pub parent: u64,
    pub band: Band,
    pub sim_flux: f64,
    /// Simulated peak intensity
    pub max_flux: f64,
    pub flux: f64,
    /// Flux difference in percent of the simulated flux
    pub percent: i64,
}

/// Flux of the isolated matched peaks, summed over their footprint
///
/// Returns the new table and the sources with a flux discrepancy, those are also handed to
/// the context renderer with their image.
pub fn isolated_flux(
    ctx: &mut Context,
    bands: &[Band],
    exposures: &[Exposure],
    peaks: &PeakTable,
    matches: &MatchTable,
    avg_noise: &[f64],
    config: &IsolatedFluxConfig,
) -> Result<(PeakTable, Vec<FluxDiscrepancy>)> {
    if exposures.len() < bands.len() {
        return Err(FluxError::ExposureCount {
            n_band: bands.len(),
            n_exposure: exposures.len(),
        });
    }
    if avg_noise.len() < bands.len() {
        return Err(FluxError::NoiseLength {
            n_band: bands.len(),
            n_noise: avg_noise.len(),
        });
    }
    if peaks.len() != matches.len() {
        return Err(FluxError::TableLength {
            n_peak: peaks.len(),
            n_match: matches.len(),
        });
    }
    let mut rows = Vec::with_capacity(peaks.len());
    let mut discrepancies = vec![];
    for (n, (peak, sim)) in peaks.iter().zip(matches.iter()).enumerate() {
        let mut row = peak.clone();
        if peak.blended || !sim.matched {
            rows.push(row);
            continue;
        }
        let bbox = peak.footprint.bbox;
        let mask = peak.footprint.pixel_mask();
        for (fidx, &band) in bands.iter().enumerate() {
            let img = exposures[fidx].extract_image(&bbox)?;
            let flux = img.masked_sum(&mask);
            row.flux[band] = flux;

            let sim_flux = sim.source.flux[band];
            let max_flux = sim.source.intensity[band].max().unwrap_or(f64::NAN);
            let diff = (flux - sim_flux).abs() / sim_flux;
            if diff > config.flux_ratio && max_flux / avg_noise[fidx] > config.flux_thresh {
                log::info!(
                    target: ctx.log_target(),
                    "n: {}, Filter: {}, simFlux: {}, max flux: {}, total flux: {}",
                    n,
                    band,
                    sim_flux,
                    max_flux,
                    flux
                );
                let discrepancy = FluxDiscrepancy {
                    row: n,
                    parent: peak.parent,
                    band,
                    sim_flux,
                    max_flux,
                    flux,
                    percent: (100. * diff) as i64,
                };
                ctx.render(|r| r.flux_discrepancy(&discrepancy, &img))?;
                discrepancies.push(discrepancy);
            }
        }
        rows.push(row);
    }
    Ok((PeakTable::new(peaks.bands(), rows), discrepancies))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        catalog::TruthSource,
        detection::{PeakRecord, SourceRecord},
        exposure::BBox,
        matcher::MatchRow,
        peaks,
    };

    const BANDS: [Band; 3] = [Band::G, Band::R, Band::I];

    #[test]
    fn unit_sum_sed() {
        let flux = PerBand::from([99., 10., 20., 70., 0., 0.]);
        let (sed, norm) = sed_from_flux(&flux, &BANDS);
        assert_eq!(norm, 100.);
        assert!((BANDS.iter().map(|&b| sed[b]).sum::<f64>() - 1.).abs() < 1e-12);
        assert_eq!(sed[Band::U], 0.);
    }

    #[test]
    fn zero_flux_sed() {
        let (sed, norm) = sed_from_flux(&PerBand::splat(0f64), &BANDS);
        assert_eq!(norm, 0.);
        assert_eq!(sed, PerBand::splat(0f64));
    }

    fn detections() -> DetectionCatalog {
        DetectionCatalog::from(vec![
            SourceRecord {
                id: 1,
                footprint: Footprint::new(BBox::new(0, 0, 4, 4), vec![PeakRecord { ix: 1, iy: 1 }]),
            },
            SourceRecord {
                id: 2,
                footprint: Footprint::new(
                    BBox::new(4, 0, 4, 4),
                    vec![PeakRecord { ix: 5, iy: 1 }, PeakRecord { ix: 6, iy: 2 }],
                ),
            },
        ])
    }

    #[test]
    fn seds_of_peak_table() {
        let peaks =
            peaks::build_peak_table(&Context::new(), &detections(), &[Band::G, Band::R]);
        let filled = peaks.map_rows(|k, row| {
            let mut row = row.clone();
            row.flux[Band::G] = k as f64;
            row.flux[Band::R] = 1.;
            row
        });
        let (table, norm) = calculate_seds_from_flux(&filled, &[Band::G, Band::R]);
        assert_eq!(norm, vec![1., 2., 3.]);
        let sed = table[2].sed.as_ref().unwrap();
        assert!((sed[Band::G] - 2. / 3.).abs() < 1e-12);
        assert!(peaks[0].sed.is_none());
    }

    struct EqualSplit;
    impl Deblender for EqualSplit {
        fn deblend(
            &self,
            bands: &[Band],
            footprint: &Footprint,
            exposures: &[Exposure],
            fwhm: &[f64],
        ) -> std::result::Result<DeblenderResult, Box<dyn std::error::Error + Send + Sync>>
        {
            assert_eq!(fwhm.len(), exposures.len());
            let n = footprint.peaks.len();
            let peaks = (0..n)
                .map(|_| {
                    PerBandImages(
                        exposures[..bands.len()]
                            .iter()
                            .map(|e| {
                                let img = e.extract_image(&footprint.bbox).unwrap();
                                Image::new(
                                    img.width,
                                    img.height,
                                    img.data.iter().map(|v| v / n as f64).collect(),
                                )
                            })
                            .collect(),
                    )
                })
                .collect();
            Ok(DeblenderResult { peaks })
        }
    }

    fn exposure(value: f32) -> Exposure {
        Exposure {
            bbox: BBox::new(0, 0, 8, 4),
            image: vec![value; 32],
            variance: vec![1.; 32],
            mask: vec![0; 32],
            psf_radius: 1.,
        }
    }

    #[test]
    fn old_deblender_flux() {
        let bands = [Band::G, Band::R];
        let detections = detections();
        let exposures = vec![exposure(1.), exposure(2.)];
        let ctx = Context::new();
        let peaks = peaks::build_peak_table(&ctx, &detections, &bands);
        let output =
            deblend_sim_exposures(&ctx, &EqualSplit, &bands, &detections, &exposures, &peaks)
                .unwrap();
        assert_eq!(output.results.len(), 1);
        assert!(output.table[0].flux[Band::G].is_nan());
        assert_eq!(output.table[1].flux[Band::G], 8.);
        assert_eq!(output.table[2].flux[Band::R], 16.);
    }

    #[test]
    fn missing_exposure() {
        let detections = detections();
        let ctx = Context::new();
        let peaks = peaks::build_peak_table(&ctx, &detections, &BANDS);
        let result =
            deblend_sim_exposures(&ctx, &EqualSplit, &BANDS, &detections, &[exposure(1.)], &peaks);
        assert!(matches!(
            result,
            Err(FluxError::ExposureCount {
                n_band: 3,
                n_exposure: 1
            })
        ));
    }

    fn template_parents() -> BTreeMap<u64, TemplateParent> {
        let parent = TemplateParent {
            data: vec![Image::new(2, 1, vec![10., 30.])],
            templates: vec![vec![
                Image::new(2, 1, vec![1., 1.]),
                Image::new(2, 1, vec![1., 3.]),
            ]],
        };
        BTreeMap::from([(2u64, parent)])
    }

    #[test]
    fn template_flux() {
        let bands = [Band::I];
        let peaks = peaks::build_peak_table(&Context::new(), &detections(), &bands);
        let table = nmf_flux(&peaks, &template_parents(), &bands);
        assert!(table[0].flux[Band::I].is_nan());
        assert_eq!(table[1].flux[Band::I], 2.);
        assert_eq!(table[2].flux[Band::I], 4.);
    }

    #[test]
    fn reapportioned_flux() {
        let bands = [Band::I];
        let peaks = peaks::build_peak_table(&Context::new(), &detections(), &bands);
        let table = flux_portion(&peaks, &template_parents(), &bands);
        assert_eq!(table[1].flux[Band::I], 5. + 7.5);
        assert_eq!(table[2].flux[Band::I], 5. + 22.5);
    }

    #[test]
    fn degenerate_templates() {
        let mut parents = template_parents();
        parents.insert(
            5,
            TemplateParent {
                data: vec![Image::new(2, 1, vec![4., 4.]); 2],
                templates: vec![
                    vec![
                        Image::new(2, 1, vec![2., 0.]),
                        Image::new(2, 1, vec![1., 0.]),
                        Image::new(2, 1, vec![0., 0.]),
                    ],
                    vec![
                        Image::new(2, 1, vec![0., 0.]),
                        Image::new(2, 1, vec![0., 0.]),
                        Image::new(2, 1, vec![-1., 0.]),
                    ],
                ],
            },
        );
        let checks = check_for_degeneracy(&mut Context::new(), &parents, 0.).unwrap();
        assert_eq!(checks.len(), 2);

        let blend = &checks[0];
        assert_eq!(blend.parent, 2);
        assert_eq!(blend.total_flux, vec![2., 4.]);
        assert_eq!(blend.good_flux, vec![true, true]);
        let expected = 4. / 20f64.sqrt();
        assert!((blend.correlation[0][1] - expected).abs() < 1e-12);
        assert_eq!(blend.correlation[0][1], blend.correlation[1][0]);
        assert_eq!(blend.correlation[0][0], 0.);

        let degenerate = &checks[1];
        assert_eq!(degenerate.total_flux, vec![2., 1., -1.]);
        assert_eq!(degenerate.good_flux, vec![true, true, false]);
        assert!((degenerate.correlation[0][1] - 1.).abs() < 1e-12);
        assert_eq!(degenerate.correlation[0][2], 0.);
        let (i, j, _) = degenerate.max_correlation().unwrap();
        assert_eq!((i, j), (0, 1));

        let checks = check_for_degeneracy(&mut Context::new(), &parents, 1.5).unwrap();
        assert_eq!(checks[0].correlation[0][1], 0.);
        assert_eq!(checks[1].correlation[0][1], 0.);
    }

    #[test]
    fn isolated_source_flux() {
        let bands = [Band::G];
        let peaks = peaks::build_peak_table(&Context::new(), &detections(), &bands);
        let sim = |flux: f64, matched: bool| MatchRow {
            source: TruthSource::new(1, 1., 1.)
                .flux(Band::G, flux)
                .intensity(Band::G, Image::new(1, 1, vec![10.])),
            matched,
            ..Default::default()
        };
        let matches = MatchTable::new(&bands, vec![sim(100., true), sim(0., false), sim(0., false)]);
        let (table, discrepancies) = isolated_flux(
            &mut Context::new(),
            &bands,
            &[exposure(2.)],
            &peaks,
            &matches,
            &[1.],
            &IsolatedFluxConfig::default(),
        )
        .unwrap();
        assert_eq!(table[0].flux[Band::G], 32.);
        assert!(table[1].flux[Band::G].is_nan());
        assert_eq!(discrepancies.len(), 1);
        assert_eq!(discrepancies[0].percent, 68);

        let (_, discrepancies) = isolated_flux(
            &mut Context::new(),
            &bands,
            &[exposure(2.)],
            &peaks,
            &matches,
            &[1.],
            &IsolatedFluxConfig::default().flux_thresh(20.),
        )
        .unwrap();
        assert!(discrepancies.is_empty());
    }
}
