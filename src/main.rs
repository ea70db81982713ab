use anyhow::Context as _;
use deblend_sim::{
    band::{self, Band},
    compare::{self, CompareConfig},
    flux::{self, IsolatedFluxConfig, TemplateParent},
    matcher::{self, MatchConfig},
    peaks, Context, DetectionCatalog, Exposure, MatchTable, PeakTable, SimCatalog,
};
use std::{
    collections::BTreeMap,
    fs::{self, File},
    path::{Path, PathBuf},
};
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "deblend-sim",
    about = "Deblender validation against simulated catalogs"
)]
enum Opt {
    /// Matches the detected peaks to the simulated sources of one exposure set
    Match(MatchOpt),
    /// Compares the flux measured with different deblending methods to the simulated flux
    Compare(CompareOpt),
}

#[derive(Debug, StructOpt)]
struct MatchOpt {
    /// Simulated catalog, pickle or CSV (.csv or .csv.gz)
    #[structopt(long)]
    truth: PathBuf,
    /// Merged detection catalog pickle
    #[structopt(long)]
    detections: PathBuf,
    /// Calibrated exposure pickles, one per band in the order of the bands
    #[structopt(long)]
    exposure: Vec<PathBuf>,
    /// Comma separated list of bands
    #[structopt(short, long, default_value = "g,r,i,z,y")]
    bands: String,
    /// Maximum peak to simulated source separation [pixel]
    #[structopt(long, default_value = "3")]
    max_separation: f64,
    /// Nearest neighbor search thread pool size
    #[structopt(long)]
    pool_size: Option<usize>,
    /// Mask planes excluded from the noise estimate
    #[structopt(long, default_value = "0")]
    and_mask: u32,
    /// Deblended parent templates pickle
    #[structopt(long)]
    templates: Option<PathBuf>,
    /// Minimum template pixel value of the template correlations
    #[structopt(long, default_value = "0")]
    template_min_flux: f64,
    /// Output directory of the CSV tables
    #[structopt(short, long, default_value = ".")]
    output: PathBuf,
    /// Output directory of the diagnostic plots
    #[structopt(long)]
    plot: Option<PathBuf>,
}

#[derive(Debug, StructOpt)]
struct CompareOpt {
    /// Glob pattern of the match tables
    #[structopt(long)]
    matches: String,
    /// Deblending method as `name=pattern` with the glob pattern of the method peak tables
    #[structopt(long, parse(try_from_str = parse_method))]
    method: Vec<(String, String)>,
    /// Comma separated list of bands
    #[structopt(short, long, default_value = "g,r,i,z,y")]
    bands: String,
    /// Minimum simulated flux of the sources included in the statistics
    #[structopt(long, default_value = "50")]
    min_flux: f64,
    /// Band of the SED flux cut
    #[structopt(long, default_value = "i")]
    reference_band: Band,
    /// Method of the isolated sources flux errors
    #[structopt(long)]
    isolated_reference: Option<String>,
    /// Output directory of the diagnostic plots
    #[structopt(long)]
    plot: Option<PathBuf>,
}

fn parse_method(arg: &str) -> Result<(String, String), String> {
    arg.split_once('=')
        .map(|(name, pattern)| (name.to_string(), pattern.to_string()))
        .ok_or_else(|| format!("expected name=pattern, found {:?}", arg))
}

fn context(plot: Option<&Path>) -> anyhow::Result<Context> {
    let ctx = Context::new();
    match plot {
        #[cfg(feature = "plot")]
        Some(dir) => Ok(ctx.renderer(deblend_sim::plot::PngRenderer::new(dir)?)),
        #[cfg(not(feature = "plot"))]
        Some(_) => {
            log::warn!("Built without the `plot` feature, no plot will be written");
            Ok(ctx)
        }
        None => Ok(ctx),
    }
}

fn glob_paths(pattern: &str) -> anyhow::Result<Vec<PathBuf>> {
    let mut paths = glob::glob(pattern)?.collect::<Result<Vec<PathBuf>, _>>()?;
    paths.sort();
    if paths.is_empty() {
        anyhow::bail!("No file matches {:?}", pattern);
    }
    Ok(paths)
}

fn run_match(opt: MatchOpt) -> anyhow::Result<()> {
    let bands = band::parse_bands(&opt.bands)?;
    let mut ctx = context(opt.plot.as_deref())?;
    let catalog = SimCatalog::load(&ctx, &opt.truth, &bands)
        .with_context(|| format!("loading {:?}", opt.truth))?;
    let detections = DetectionCatalog::from_path(&opt.detections)?;
    let exposures = opt
        .exposure
        .iter()
        .map(|path| {
            log::info!("Loading {:?}...", path);
            Exposure::from_path(path)
        })
        .collect::<Result<Vec<_>, _>>()?;
    if exposures.len() != bands.len() {
        anyhow::bail!(
            "{} exposures given for {} bands",
            exposures.len(),
            bands.len()
        );
    }
    let avg_noise = deblend_sim::get_noise(&exposures, opt.and_mask);
    log::info!("Noise: {:?}", avg_noise);

    let peaks = peaks::build_peak_table(&ctx, &detections, &bands);
    let config = MatchConfig::default().max_separation(opt.max_separation);
    let config = match opt.pool_size {
        Some(n) => config.pool_size(n),
        None => config,
    };
    let result = matcher::match_to_ref(
        &mut ctx,
        &peaks,
        &catalog,
        &bands,
        &config,
        Some(avg_noise.as_slice()),
    )?;
    println!(
        "{} peaks: {} matched, {} duplicates, {} undetected sources",
        peaks.len(),
        result.table.n_matched(),
        result.table.n_duplicate(),
        result.unmatched.len()
    );
    if let (true, Some(exposure)) = (ctx.has_renderer(), exposures.first()) {
        matcher::parent_overlays(&mut ctx, &peaks, &result.table, &catalog, exposure)?;
    }

    fs::create_dir_all(&opt.output)?;
    peaks.to_csv(opt.output.join("peaks.csv"))?;
    result.table.to_csv(opt.output.join("matches.csv"))?;
    result.unmatched.to_csv(opt.output.join("unmatched.csv"))?;

    let mut methods: Vec<(&str, PeakTable)> = vec![];
    if let Some(path) = &opt.templates {
        log::info!("Loading {:?}...", path);
        let mut file = File::open(path)?;
        let parents: BTreeMap<u64, TemplateParent> =
            serde_pickle::from_reader(&mut file, Default::default())?;
        let checks = flux::check_for_degeneracy(&mut ctx, &parents, opt.template_min_flux)?;
        println!(
            "{} deblended parents, {} with peaks without flux",
            checks.len(),
            checks
                .iter()
                .filter(|check| check.good_flux.contains(&false))
                .count()
        );
        methods.push(("nmf", flux::nmf_flux(&peaks, &parents, &bands)));
        methods.push(("portion", flux::flux_portion(&peaks, &parents, &bands)));
    } else {
        methods.push(("isolated", peaks.clone()));
    }
    let isolated = IsolatedFluxConfig::default();
    for (name, table) in methods {
        let (table, discrepancies) = flux::isolated_flux(
            &mut ctx,
            &bands,
            &exposures,
            &table,
            &result.table,
            &avg_noise,
            &isolated,
        )?;
        log::info!("{}: {} isolated flux discrepancies", name, discrepancies.len());
        let (table, _) = table.with_seds();
        table.to_csv(opt.output.join(format!("peaks_{}.csv", name)))?;
    }
    Ok(())
}

fn run_compare(opt: CompareOpt) -> anyhow::Result<()> {
    let bands = band::parse_bands(&opt.bands)?;
    let sim_tables = glob_paths(&opt.matches)?
        .into_iter()
        .map(MatchTable::from_csv)
        .collect::<Result<Vec<_>, _>>()?;
    let methods = opt
        .method
        .iter()
        .map(|(name, pattern)| {
            let tables = glob_paths(pattern)?
                .into_iter()
                .map(PeakTable::from_csv)
                .collect::<Result<Vec<_>, _>>()?;
            Ok((name.clone(), tables))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let config = CompareConfig::default()
        .min_flux(opt.min_flux)
        .reference_band(opt.reference_band);
    let config = match opt.isolated_reference {
        Some(method) => config.isolated_reference(method),
        None => config,
    };
    let mut ctx = context(opt.plot.as_deref())?;
    let comparison = compare::compare_meas_to_sim(&mut ctx, sim_tables, methods, &bands, &config)?;

    println!("{:#?}", comparison.totals);
    for (stats_good, stats_all) in comparison.sed.good.iter().zip(&comparison.sed.all) {
        println!(
            "SED {:>12}: {:>5} sources ({:>5} bright), histogram {:.3?}",
            stats_all.label,
            stats_all.len(),
            stats_good.len(),
            stats_good.histogram
        );
    }
    for (band, flux) in &comparison.flux {
        for stats in &flux.series {
            println!(
                "Filter {} {:>12}: mean |error| {:>8.4}, rms {:>8.4} ({} sources)",
                band,
                stats.label,
                stats.mean_abs.unwrap_or(f64::NAN),
                stats.rms.unwrap_or(f64::NAN),
                stats.len()
            );
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    match Opt::from_args() {
        Opt::Match(opt) => run_match(opt),
        Opt::Compare(opt) => run_compare(opt),
    }
}
