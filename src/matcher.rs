//! Peak to truth matching
//!
//! Every peak is matched to its nearest simulated source. Matches at or beyond the maximum
//! separation are rejected, and truth sources matched by more than one peak flag all these
//! peaks as duplicates. Simulated sources that no peak matched are the undetected sources:
//! their peak intensity over the image noise tells whether they were too faint to be detected.

use crate::{
    band::{Band, PerBand},
    catalog::{SimCatalog, TruthSource},
    context::{Context, RenderError},
    exposure::{BBox, Exposure, ExposureError, Image},
    flux,
    peaks::PeakTable,
    rtree::SpatialIndex,
};
use rayon::prelude::*;
use std::{
    collections::{BTreeMap, BTreeSet},
    ops::Deref,
};

#[derive(thiserror::Error, Debug)]
pub enum MatchError {
    #[error("{n_noise} noise levels given for {n_band} bands")]
    NoiseLength { n_band: usize, n_noise: usize },
    #[error("{table} row #{row} has non finite coordinates ({x},{y})")]
    Coordinate {
        table: &'static str,
        row: usize,
        x: f64,
        y: f64,
    },
    #[error("Failed to build the nearest neighbor search thread pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Failed to display the matches")]
    Render(#[from] RenderError),
    #[error("Failed to extract the parent image")]
    Exposure(#[from] ExposureError),
}
type Result<T> = std::result::Result<T, MatchError>;

/// Default maximum separation [pixel] between a peak and its simulated source
pub const MAX_SEPARATION: f64 = 3.;

/// Matching parameters
#[derive(Debug, Clone)]
pub struct MatchConfig {
    max_separation: f64,
    pool_size: Option<usize>,
}
impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            max_separation: MAX_SEPARATION,
            pool_size: None,
        }
    }
}
impl MatchConfig {
    /// Peaks must be closer than `max_separation` to be matched
    pub fn max_separation(self, max_separation: f64) -> Self {
        Self {
            max_separation,
            ..self
        }
    }
    /// Number of threads for the nearest neighbor search, the rayon global pool is used otherwise
    pub fn pool_size(self, pool_size: usize) -> Self {
        Self {
            pool_size: Some(pool_size),
            ..self
        }
    }
    pub fn get_max_separation(&self) -> f64 {
        self.max_separation
    }
}

/// Simulated source matched to a peak
#[derive(Debug, Clone, Default)]
pub struct MatchRow {
    /// The nearest simulated source, zeroed and moved to the peak if not matched
    pub source: TruthSource,
    /// Row of the nearest source in the truth table
    pub truth_index: Option<usize>,
    pub distance: f64,
    pub matched: bool,
    pub duplicate: bool,
    /// 1-based exposure number once tables are stacked, 0 otherwise
    pub image: usize,
}

/// One row per peak
#[derive(Debug, Clone, Default)]
pub struct MatchTable {
    bands: Vec<Band>,
    rows: Vec<MatchRow>,
}
impl Deref for MatchTable {
    type Target = Vec<MatchRow>;

    fn deref(&self) -> &Self::Target {
        &self.rows
    }
}
impl MatchTable {
    pub fn new(bands: &[Band], rows: Vec<MatchRow>) -> Self {
        Self {
            bands: bands.to_vec(),
            rows,
        }
    }
    pub fn bands(&self) -> &[Band] {
        &self.bands
    }
    pub fn n_matched(&self) -> usize {
        self.iter().filter(|row| row.matched).count()
    }
    pub fn n_duplicate(&self) -> usize {
        self.iter().filter(|row| row.duplicate).count()
    }
    /// SED and normalization of every row, computed from the simulated flux
    pub fn seds(&self) -> (Vec<PerBand<f64>>, Vec<f64>) {
        flux::seds_from_flux(self.iter().map(|row| &row.source.flux), &self.bands)
    }
    /// Sets the exposure number of every row
    pub fn with_image(self, image: usize) -> Self {
        Self {
            rows: self
                .rows
                .into_iter()
                .map(|row| MatchRow { image, ..row })
                .collect(),
            ..self
        }
    }
}
impl FromIterator<MatchTable> for MatchTable {
    /// Stacks the tables, the bands of the first table are kept
    fn from_iter<T: IntoIterator<Item = MatchTable>>(iter: T) -> Self {
        iter.into_iter()
            .fold(None, |stack: Option<MatchTable>, table| match stack {
                None => Some(table),
                Some(mut stack) => {
                    stack.rows.extend(table.rows);
                    Some(stack)
                }
            })
            .unwrap_or_default()
    }
}

/// Simulated source that no peak matched
#[derive(Debug, Clone)]
pub struct UnmatchedRow {
    /// Row in the truth table
    pub index: usize,
    pub source: TruthSource,
    /// Peak intensity over noise in each band, NaN if unknown
    pub peak_to_noise: PerBand<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct UnmatchedTable {
    bands: Vec<Band>,
    rows: Vec<UnmatchedRow>,
}
impl Deref for UnmatchedTable {
    type Target = Vec<UnmatchedRow>;

    fn deref(&self) -> &Self::Target {
        &self.rows
    }
}
impl UnmatchedTable {
    pub fn new(bands: &[Band], rows: Vec<UnmatchedRow>) -> Self {
        Self {
            bands: bands.to_vec(),
            rows,
        }
    }
    pub fn bands(&self) -> &[Band] {
        &self.bands
    }
    /// Largest peak over noise ratio across the bands of each source
    pub fn max_ratios(&self) -> Vec<f64> {
        self.iter()
            .map(|row| {
                row.peak_to_noise
                    .select(&self.bands)
                    .cloned()
                    .filter(|r| !r.is_nan())
                    .fold(f64::NAN, f64::max)
            })
            .collect()
    }
}

/// Output of [match_to_ref]
#[derive(Debug, Clone, Default)]
pub struct MatchResult {
    pub table: MatchTable,
    /// Row of the nearest simulated source for each peak, `None` if the truth table is empty
    pub idx: Vec<Option<usize>>,
    pub unmatched: UnmatchedTable,
}

fn check_coordinates<I>(table: &'static str, xy: I) -> Result<()>
where
    I: IntoIterator<Item = [f64; 2]>,
{
    match xy
        .into_iter()
        .enumerate()
        .find(|(_, [x, y])| !(x.is_finite() && y.is_finite()))
    {
        Some((row, [x, y])) => Err(MatchError::Coordinate { table, row, x, y }),
        None => Ok(()),
    }
}

fn nearest_neighbors(
    index: &SpatialIndex,
    points: &[[f64; 2]],
    pool_size: Option<usize>,
) -> Result<Vec<Option<(usize, f64)>>> {
    let query = || {
        points
            .par_iter()
            .map(|&xy| index.nearest(xy))
            .collect::<Vec<_>>()
    };
    Ok(match pool_size {
        Some(n_thread) => rayon::ThreadPoolBuilder::new()
            .num_threads(n_thread)
            .build()?
            .install(query),
        None => query(),
    })
}

/// Matches the peaks to the simulated sources
///
/// `avg_noise` is the noise level in each of `bands`; without it the peak over noise ratios
/// of the undetected sources are NaN.
pub fn match_to_ref(
    ctx: &mut Context,
    peaks: &PeakTable,
    catalog: &SimCatalog,
    bands: &[Band],
    config: &MatchConfig,
    avg_noise: Option<&[f64]>,
) -> Result<MatchResult> {
    if let Some(noise) = avg_noise {
        if noise.len() < bands.len() {
            return Err(MatchError::NoiseLength {
                n_band: bands.len(),
                n_noise: noise.len(),
            });
        }
    }
    let peak_xy: Vec<[f64; 2]> = peaks.iter().map(|row| row.xy()).collect();
    check_coordinates("peak", peak_xy.iter().cloned())?;
    check_coordinates("truth", catalog.iter().map(|s| [s.x, s.y]))?;

    let index = SpatialIndex::new(catalog.iter().map(|s| [s.x, s.y]));
    let nearest = nearest_neighbors(&index, &peak_xy, config.pool_size)?;
    let idx: Vec<Option<usize>> = nearest.iter().map(|nn| nn.map(|(i, _)| i)).collect();
    let matched: Vec<bool> = nearest
        .iter()
        .map(|nn| nn.is_some_and(|(_, d)| d < config.max_separation))
        .collect();

    let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
    idx.iter()
        .zip(&matched)
        .filter_map(|(i, &m)| if m { *i } else { None })
        .for_each(|i| *counts.entry(i).or_default() += 1);

    let rows: Vec<MatchRow> = peak_xy
        .iter()
        .zip(&nearest)
        .zip(&matched)
        .map(|((&[x, y], nn), &matched)| match *nn {
            Some((i, distance)) if matched => MatchRow {
                source: catalog[i].clone(),
                truth_index: Some(i),
                distance,
                matched,
                duplicate: counts.get(&i).is_some_and(|&n| n > 1),
                image: 0,
            },
            Some((i, distance)) => MatchRow {
                source: catalog[i].zeroed_at(x, y),
                truth_index: Some(i),
                distance,
                ..Default::default()
            },
            None => MatchRow {
                source: TruthSource::new(0, x, y),
                distance: f64::INFINITY,
                ..Default::default()
            },
        })
        .collect();
    let table = MatchTable::new(bands, rows);

    let detected: BTreeSet<usize> = counts.into_keys().collect();
    let undetected: Vec<usize> = (0..catalog.len())
        .filter(|i| !detected.contains(i))
        .collect();
    log::info!(target: ctx.log_target(), "Sources not detected: {}", undetected.len());
    log::debug!(
        target: ctx.log_target(),
        "{} peaks, {} matched, {} duplicates",
        table.len(),
        table.n_matched(),
        table.n_duplicate()
    );

    let unmatched_rows = undetected
        .into_iter()
        .map(|index| {
            let source = catalog[index].clone();
            let mut peak_to_noise = PerBand::splat(f64::NAN);
            if let Some(noise) = avg_noise {
                for (&band, &band_noise) in bands.iter().zip(noise) {
                    peak_to_noise[band] = source.peak_to_noise(band, band_noise);
                }
            }
            UnmatchedRow {
                index,
                source,
                peak_to_noise,
            }
        })
        .collect();
    let unmatched = UnmatchedTable::new(bands, unmatched_rows);
    ctx.render(|r| r.unmatched(bands, &unmatched, avg_noise))?;

    Ok(MatchResult {
        table,
        idx,
        unmatched,
    })
}

/// Image of a parent with unmatched peaks, with coordinates relative to its bounding box
#[derive(Debug, Clone)]
pub struct ParentOverlay {
    pub parent: u64,
    pub bbox: BBox,
    pub image: Image,
    /// Matched peaks inside the bounding box
    pub matched: Vec<[f64; 2]>,
    /// Unmatched peaks inside the bounding box
    pub unmatched: Vec<[f64; 2]>,
    /// Simulated sources inside the bounding box
    pub truth: Vec<[f64; 2]>,
}

/// Overlays of all the parents with at least one unmatched peak, in peak table order
///
/// The overlays are handed to the context renderer.
pub fn parent_overlays(
    ctx: &mut Context,
    peaks: &PeakTable,
    matches: &MatchTable,
    catalog: &SimCatalog,
    exposure: &Exposure,
) -> Result<Vec<ParentOverlay>> {
    let mut parents: Vec<u64> = vec![];
    for (peak, row) in peaks.iter().zip(matches.iter()) {
        if !row.matched && !parents.contains(&peak.parent) {
            parents.push(peak.parent);
        }
    }
    let mut overlays = vec![];
    for parent in parents {
        let Some(first) = peaks.iter().find(|peak| peak.parent == parent) else {
            continue;
        };
        let bbox = first.footprint.bbox;
        let image = exposure.extract_image(&bbox)?;
        let origin = |x: f64, y: f64| [x - bbox.min_x as f64, y - bbox.min_y as f64];
        let (mut matched, mut unmatched) = (vec![], vec![]);
        for (peak, row) in peaks.iter().zip(matches.iter()) {
            if bbox.contains_strict(peak.x, peak.y) {
                if row.matched {
                    matched.push(origin(peak.x, peak.y));
                } else {
                    unmatched.push(origin(peak.x, peak.y));
                }
            }
        }
        let truth = catalog
            .iter()
            .filter(|s| bbox.contains_inclusive(s.x, s.y))
            .map(|s| origin(s.x, s.y))
            .collect();
        let overlay = ParentOverlay {
            parent,
            bbox,
            image,
            matched,
            unmatched,
            truth,
        };
        ctx.render(|r| r.parent_overlay(&overlay))?;
        overlays.push(overlay);
    }
    Ok(overlays)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{detection::Footprint, peaks::PeakRow};
    use rand::Rng;
    use std::sync::Arc;

    fn peak_table(xy: &[(f64, f64)], bands: &[Band]) -> PeakTable {
        let footprint = Arc::new(Footprint::default());
        PeakTable::new(
            bands,
            xy.iter()
                .enumerate()
                .map(|(k, &(x, y))| PeakRow {
                    parent: k as u64,
                    peak_idx: 0,
                    x,
                    y,
                    blended: false,
                    footprint: Arc::clone(&footprint),
                    flux: PerBand::splat(f64::NAN),
                    sed: None,
                    image: 0,
                })
                .collect(),
        )
    }

    fn catalog(xy: &[(f64, f64)]) -> SimCatalog {
        SimCatalog::new(
            &[Band::I],
            xy.iter()
                .enumerate()
                .map(|(k, &(x, y))| {
                    TruthSource {
                        size: 1.,
                        redshift: 0.5,
                        ..TruthSource::new(k as u64 + 1, x, y)
                    }
                    .flux(Band::I, 100.)
                    .intensity(Band::I, Image::new(2, 1, vec![5., 20.]))
                })
                .collect(),
        )
    }

    fn run(peaks: &[(f64, f64)], truth: &[(f64, f64)]) -> MatchResult {
        match_to_ref(
            &mut Context::new(),
            &peak_table(peaks, &[Band::I]),
            &catalog(truth),
            &[Band::I],
            &MatchConfig::default(),
            Some(&[4.]),
        )
        .unwrap()
    }

    #[test]
    fn single_match() {
        let result = run(&[(10., 11.)], &[(10., 10.)]);
        assert_eq!(result.table.len(), 1);
        let row = &result.table[0];
        assert!(row.matched);
        assert_eq!(row.distance, 1.);
        assert!(!row.duplicate);
        assert_eq!(row.source.id, 1);
        assert_eq!(row.source.flux[Band::I], 100.);
        assert_eq!(row.source.sed[Band::I], 1.);
        assert_eq!(result.idx, vec![Some(0)]);
        assert!(result.unmatched.is_empty());
    }

    #[test]
    fn far_peak_is_unmatched() {
        let result = run(&[(10., 10.)], &[(0., 0.)]);
        let row = &result.table[0];
        assert!(!row.matched);
        assert!(!row.duplicate);
        assert_eq!(row.source.flux[Band::I], 0.);
        assert_eq!(row.source.sed[Band::I], 0.);
        assert_eq!((row.source.size, row.source.redshift), (0., 0.));
        assert_eq!((row.source.x, row.source.y), (10., 10.));
        assert_eq!(row.source.intensity[Band::I].data, vec![0., 0.]);
        assert_eq!(result.unmatched.len(), 1);
        assert_eq!(result.unmatched[0].index, 0);
        assert_eq!(result.unmatched[0].peak_to_noise[Band::I], 5.);
        assert_eq!(result.unmatched.max_ratios(), vec![5.]);
    }

    #[test]
    fn shared_truth_source() {
        let result = run(&[(0., 0.), (0., 0.)], &[(0., 0.), (0., 1.)]);
        assert_eq!(result.idx, vec![Some(0), Some(0)]);
        assert!(result.table.iter().all(|row| row.matched && row.duplicate));
        assert_eq!(result.unmatched.len(), 1);
        assert_eq!(result.unmatched[0].index, 1);
    }

    #[test]
    fn separation_is_exclusive() {
        let result = run(&[(0., 3.), (0., 2.999)], &[(0., 0.)]);
        assert!(!result.table[0].matched);
        assert_eq!(result.table[0].distance, 3.);
        assert!(result.table[1].matched);
        // the unmatched peak doesn't count as a duplicate
        assert!(!result.table[1].duplicate);
        assert!(result.unmatched.is_empty());
    }

    #[test]
    fn empty_tables() {
        let result = run(&[], &[(0., 0.), (5., 5.)]);
        assert!(result.table.is_empty());
        assert_eq!(result.unmatched.len(), 2);

        let result = run(&[(1., 2.), (3., 4.)], &[]);
        assert_eq!(result.table.len(), 2);
        assert!(result.table.iter().all(|row| !row.matched));
        assert_eq!((result.table[1].source.x, result.table[1].source.y), (3., 4.));
        assert_eq!(result.idx, vec![None, None]);
        assert!(result.unmatched.is_empty());
    }

    #[test]
    fn short_noise_list() {
        let bands = [Band::G, Band::I];
        let result = match_to_ref(
            &mut Context::new(),
            &peak_table(&[(0., 0.)], &bands),
            &catalog(&[(0., 0.)]),
            &bands,
            &MatchConfig::default(),
            Some(&[1.]),
        );
        assert!(matches!(
            result,
            Err(MatchError::NoiseLength {
                n_band: 2,
                n_noise: 1
            })
        ));
    }

    #[test]
    fn missing_noise() {
        let result = match_to_ref(
            &mut Context::new(),
            &peak_table(&[], &[Band::I]),
            &catalog(&[(0., 0.)]),
            &[Band::I],
            &MatchConfig::default(),
            None,
        )
        .unwrap();
        assert!(result.unmatched[0].peak_to_noise[Band::I].is_nan());
    }

    #[test]
    fn non_finite_coordinates() {
        let result = match_to_ref(
            &mut Context::new(),
            &peak_table(&[(0., f64::NAN)], &[Band::I]),
            &catalog(&[(0., 0.)]),
            &[Band::I],
            &MatchConfig::default(),
            None,
        );
        assert!(matches!(
            result,
            Err(MatchError::Coordinate {
                table: "peak",
                row: 0,
                ..
            })
        ));
    }

    fn random_points(n: usize, rng: &mut impl Rng) -> Vec<(f64, f64)> {
        (0..n)
            .map(|_| {
                (
                    rng.gen_range(0..40) as f64,
                    rng.gen_range(0..40) as f64,
                )
            })
            .collect()
    }

    #[test]
    fn random_catalogs() {
        let mut rng = rand::thread_rng();
        for _ in 0..20 {
            let peaks = random_points(rng.gen_range(0..60), &mut rng);
            let truth = random_points(rng.gen_range(0..60), &mut rng);
            let result = run(&peaks, &truth);
            assert_eq!(result.table.len(), peaks.len());
            let matched: Vec<usize> = result
                .table
                .iter()
                .zip(&result.idx)
                .filter(|(row, _)| row.matched)
                .filter_map(|(_, i)| *i)
                .collect();
            for (row, i) in result.table.iter().zip(&result.idx) {
                assert_eq!(row.matched, row.distance < MAX_SEPARATION);
                let shared = row.matched
                    && matched.iter().filter(|&j| Some(*j) == *i).count() > 1;
                assert_eq!(row.duplicate, shared);
                if !row.matched {
                    assert_eq!(row.source.flux[Band::I], 0.);
                }
            }
            let distinct: BTreeSet<usize> = matched.into_iter().collect();
            assert_eq!(result.unmatched.len(), truth.len() - distinct.len());
        }
    }

    #[test]
    fn pool_size_independence() {
        let mut rng = rand::thread_rng();
        let bands = [Band::I];
        let peaks = peak_table(&random_points(500, &mut rng), &bands);
        let truth = catalog(&random_points(300, &mut rng));
        let results: Vec<MatchResult> = [1, 2, 7]
            .into_iter()
            .map(|n| {
                match_to_ref(
                    &mut Context::new(),
                    &peaks,
                    &truth,
                    &bands,
                    &MatchConfig::default().pool_size(n),
                    None,
                )
                .unwrap()
            })
            .collect();
        for result in &results[1..] {
            assert_eq!(result.idx, results[0].idx);
            let distances = |r: &MatchResult| -> Vec<f64> {
                r.table.iter().map(|row| row.distance).collect()
            };
            assert_eq!(distances(result), distances(&results[0]));
        }
    }

    #[test]
    fn overlays_of_unmatched_parents() {
        let bands = [Band::I];
        let footprint = Arc::new(Footprint::new(BBox::new(0, 0, 10, 10), vec![]));
        let rows = [(2., 2.), (7., 7.)]
            .iter()
            .enumerate()
            .map(|(k, &(x, y))| PeakRow {
                parent: 3,
                peak_idx: k,
                x,
                y,
                blended: true,
                footprint: Arc::clone(&footprint),
                flux: PerBand::splat(f64::NAN),
                sed: None,
                image: 0,
            })
            .collect();
        let peaks = PeakTable::new(&bands, rows);
        let truth = catalog(&[(2., 3.), (10., 10.), (11., 11.)]);
        let mut ctx = Context::new();
        let result =
            match_to_ref(&mut ctx, &peaks, &truth, &bands, &MatchConfig::default(), None).unwrap();
        let exposure = Exposure {
            bbox: BBox::new(0, 0, 12, 12),
            image: vec![1.; 144],
            variance: vec![1.; 144],
            mask: vec![0; 144],
            psf_radius: 1.,
        };
        let overlays = parent_overlays(&mut ctx, &peaks, &result.table, &truth, &exposure).unwrap();
        assert_eq!(overlays.len(), 1);
        let overlay = &overlays[0];
        assert_eq!(overlay.parent, 3);
        assert_eq!(overlay.image.data.len(), 100);
        assert_eq!(overlay.matched, vec![[2., 2.]]);
        assert_eq!(overlay.unmatched, vec![[7., 7.]]);
        assert_eq!(overlay.truth, vec![[2., 3.], [10., 10.]]);
    }
}
