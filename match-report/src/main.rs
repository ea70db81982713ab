use deblend_sim::MatchTable;
use polars::prelude::*;
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "match-report", about = "Summary of the peak to simulated source matches")]
struct Opt {
    /// Glob pattern of the match tables
    #[structopt(default_value = "matches.csv")]
    pattern: String,
}

#[derive(Debug, Default)]
struct Stats {
    sample_name: String,
    sample_size: usize,
    mean: Option<f64>,
    median: Option<f64>,
    min: Option<f64>,
    max: Option<f64>,
}
impl From<&Float64Chunked> for Stats {
    fn from(data: &Float64Chunked) -> Self {
        Self {
            sample_name: data.name().to_string(),
            sample_size: data.len() - data.null_count(),
            mean: data.mean(),
            median: data.median(),
            min: data.min(),
            max: data.max(),
        }
    }
}
impl std::fmt::Display for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = |x: Option<f64>| x.map_or("-".to_string(), |x| format!("{:.3}", x));
        write!(
            f,
            "{:>12} [{:>6}]: mean {:>10}, median {:>10}, min {:>10}, max {:>10}",
            self.sample_name,
            self.sample_size,
            value(self.mean),
            value(self.median),
            value(self.min),
            value(self.max)
        )
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let opt = Opt::from_args();

    let mut paths = glob::glob(&opt.pattern)?.collect::<Result<Vec<PathBuf>, _>>()?;
    paths.sort();
    let table: MatchTable = paths
        .iter()
        .map(MatchTable::from_csv)
        .enumerate()
        .map(|(n, table)| table.map(|table| table.with_image(n + 1)))
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .collect();
    let df = table.to_dataframe()?;
    println!("{}", df.head(Some(10)));

    println!(
        "{} peaks in {} exposures: {} matched, {} duplicates",
        table.len(),
        paths.len(),
        table.n_matched(),
        table.n_duplicate()
    );
    let matched = df.column("matched")?.as_materialized_series().bool()?.clone();
    let df = df.filter(&matched)?;
    println!("Matched peaks:");
    for band in table.bands() {
        let column = df.column(&band.flux_column())?.as_materialized_series();
        println!(" - {}", Stats::from(column.f64()?));
    }
    let distance = df.column("distance")?.as_materialized_series();
    println!(" - {}", Stats::from(distance.f64()?));

    Ok(())
}
