//! PNG plots of the evaluation diagnostics

use crate::{
    band::Band,
    compare::{ErrorStats, FluxComparison, SedComparison},
    context::{Render, RenderError, Result},
    exposure::Image,
    flux::{Degeneracy, FluxDiscrepancy},
    matcher::{ParentOverlay, UnmatchedTable},
    stats::ERROR_BINS,
};
use itertools::{Itertools, MinMaxResult};
use plotters::prelude::*;
use std::{
    fs,
    ops::Range,
    path::{Path, PathBuf},
};

fn backend<E: std::fmt::Display>(e: E) -> RenderError {
    RenderError::Backend(e.to_string())
}

fn tableau(k: usize) -> RGBColor {
    let color = colorous::TABLEAU10[k % colorous::TABLEAU10.len()];
    RGBColor(color.r, color.g, color.b)
}

/// Range of the finite values with a 1% margin
fn range<I: IntoIterator<Item = f64>>(values: I) -> Range<f64> {
    match values
        .into_iter()
        .filter(|v| v.is_finite())
        .minmax_by(|a, b| a.total_cmp(b))
    {
        MinMaxResult::NoElements => 0f64..1f64,
        MinMaxResult::OneElement(v) => v - 1.0..v + 1.0,
        MinMaxResult::MinMax(a, b) if a == b => a - 1.0..b + 1.0,
        MinMaxResult::MinMax(a, b) => {
            let margin = (b - a) * 1e-2;
            a - margin..b + margin
        }
    }
}

/// Draws `image` in gray levels on `chart`, pixel (i,j) covers [i,i+1]x[j,j+1]
fn draw_image<DB: DrawingBackend>(
    chart: &mut ChartContext<'_, DB, Cartesian2d<RangedCoordf64, RangedCoordf64>>,
    image: &Image,
) -> Result<()> {
    let (lo, hi) = match image
        .data
        .iter()
        .cloned()
        .filter(|v| v.is_finite())
        .minmax_by(|a, b| a.total_cmp(b))
    {
        MinMaxResult::MinMax(lo, hi) => (lo, hi),
        _ => return Ok(()),
    };
    let pixels = image.data.iter().enumerate().map(|(k, &v)| {
        let (i, j) = ((k % image.width) as f64, (k / image.width) as f64);
        let t = if v.is_finite() { (v - lo) / (hi - lo) } else { 0. };
        let color = colorous::GREYS.eval_continuous(1. - t);
        Rectangle::new(
            [(i, j), (i + 1., j + 1.)],
            RGBColor(color.r, color.g, color.b).filled(),
        )
    });
    chart.draw_series(pixels).map_err(backend)?;
    Ok(())
}

/// Grouped histogram of the error series, one bar per series in each of [ERROR_BINS]
fn draw_histogram(path: &Path, title: &str, series: &[ErrorStats]) -> Result<()> {
    let plot = BitMapBackend::new(path, (768, 512)).into_drawing_area();
    plot.fill(&WHITE).map_err(backend)?;
    let y_max = series
        .iter()
        .flat_map(|s| s.histogram.iter().cloned())
        .fold(0f64, f64::max)
        .max(0.1);
    let mut chart = ChartBuilder::on(&plot)
        .caption(title, ("sans-serif", 20))
        .set_label_area_size(LabelAreaPosition::Left, 50)
        .set_label_area_size(LabelAreaPosition::Bottom, 40)
        .margin(10)
        .build_cartesian_2d(ERROR_BINS[0]..ERROR_BINS[ERROR_BINS.len() - 1], 0f64..y_max * 1.1)
        .map_err(backend)?;
    chart
        .configure_mesh()
        .x_desc("Error (%)")
        .y_desc("Fraction of Sources")
        .draw()
        .map_err(backend)?;
    let width = (ERROR_BINS[1] - ERROR_BINS[0]) / (series.len() + 1) as f64;
    for (k, stats) in series.iter().enumerate() {
        let rgb = tableau(k);
        let bars = ERROR_BINS
            .iter()
            .zip(&stats.histogram)
            .map(|(&edge, &fraction)| {
                let x0 = edge + width * (k as f64 + 0.5);
                Rectangle::new([(x0, 0.), (x0 + width, fraction)], rgb.filled())
            });
        chart
            .draw_series(bars)
            .map_err(backend)?
            .label(format!("{} ({})", stats.label, stats.len()))
            .legend(move |(x, y)| Rectangle::new([(x, y - 5), (x + 10, y + 5)], rgb.filled()));
    }
    chart
        .configure_series_labels()
        .border_style(&BLACK)
        .background_style(&WHITE.mix(0.8))
        .position(SeriesLabelPosition::UpperRight)
        .draw()
        .map_err(backend)?;
    plot.present().map_err(backend)?;
    Ok(())
}

/// Writes the diagnostic plots as PNG files into a directory
pub struct PngRenderer {
    dir: PathBuf,
}
impl PngRenderer {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
        })
    }
    fn path(&self, name: String) -> PathBuf {
        let path = self.dir.join(name);
        log::debug!("Plotting {:?}", path);
        path
    }
}
impl Render for PngRenderer {
    fn unmatched(
        &mut self,
        bands: &[Band],
        unmatched: &UnmatchedTable,
        _avg_noise: Option<&[f64]>,
    ) -> Result<()> {
        let path = self.path("unmatched.png".to_string());
        let plot = BitMapBackend::new(&path, (768, 512)).into_drawing_area();
        plot.fill(&WHITE).map_err(backend)?;
        let yrange = range(
            unmatched
                .iter()
                .flat_map(|row| bands.iter().map(move |&b| row.peak_to_noise[b])),
        );
        let mut chart = ChartBuilder::on(&plot)
            .caption("Undetected sources", ("sans-serif", 20))
            .set_label_area_size(LabelAreaPosition::Left, 50)
            .set_label_area_size(LabelAreaPosition::Bottom, 40)
            .margin(10)
            .build_cartesian_2d(-1f64..unmatched.len() as f64, yrange)
            .map_err(backend)?;
        chart
            .configure_mesh()
            .x_desc("Undetected source")
            .y_desc("Peak intensity / noise")
            .draw()
            .map_err(backend)?;
        for (k, &band) in bands.iter().enumerate() {
            let rgb = tableau(k);
            chart
                .draw_series(
                    unmatched
                        .iter()
                        .enumerate()
                        .map(|(n, row)| (n as f64, row.peak_to_noise[band]))
                        .filter(|(_, ratio)| ratio.is_finite())
                        .map(|xy| Circle::new(xy, 3, rgb.filled())),
                )
                .map_err(backend)?
                .label(band.to_string())
                .legend(move |(x, y)| Circle::new((x, y), 3, rgb.filled()));
        }
        chart
            .configure_series_labels()
            .border_style(&BLACK)
            .background_style(&WHITE.mix(0.8))
            .position(SeriesLabelPosition::UpperRight)
            .draw()
            .map_err(backend)?;
        plot.present().map_err(backend)?;
        Ok(())
    }

    fn parent_overlay(&mut self, overlay: &ParentOverlay) -> Result<()> {
        let path = self.path(format!("parent_{}.png", overlay.parent));
        let plot = BitMapBackend::new(&path, (512, 512)).into_drawing_area();
        plot.fill(&WHITE).map_err(backend)?;
        let mut chart = ChartBuilder::on(&plot)
            .caption(format!("Parent {}", overlay.parent), ("sans-serif", 20))
            .set_label_area_size(LabelAreaPosition::Left, 40)
            .set_label_area_size(LabelAreaPosition::Bottom, 40)
            .margin(10)
            .build_cartesian_2d(
                0f64..overlay.bbox.width as f64,
                0f64..overlay.bbox.height as f64,
            )
            .map_err(backend)?;
        chart.configure_mesh().draw().map_err(backend)?;
        draw_image(&mut chart, &overlay.image)?;
        let center = |&[x, y]: &[f64; 2]| (x + 0.5, y + 0.5);
        chart
            .draw_series(
                overlay
                    .truth
                    .iter()
                    .map(|xy| Circle::new(center(xy), 5, BLUE.stroke_width(2))),
            )
            .map_err(backend)?;
        chart
            .draw_series(
                overlay
                    .matched
                    .iter()
                    .map(|xy| Circle::new(center(xy), 3, GREEN.filled())),
            )
            .map_err(backend)?;
        chart
            .draw_series(
                overlay
                    .unmatched
                    .iter()
                    .map(|xy| Cross::new(center(xy), 4, RED.stroke_width(2))),
            )
            .map_err(backend)?;
        plot.present().map_err(backend)?;
        Ok(())
    }

    fn flux_discrepancy(&mut self, discrepancy: &FluxDiscrepancy, cutout: &Image) -> Result<()> {
        let path = self.path(format!(
            "discrepancy_{}_{}.png",
            discrepancy.row, discrepancy.band
        ));
        let plot = BitMapBackend::new(&path, (512, 512)).into_drawing_area();
        plot.fill(&WHITE).map_err(backend)?;
        let mut chart = ChartBuilder::on(&plot)
            .caption(
                format!(
                    "Parent {} ({}): {}%",
                    discrepancy.parent, discrepancy.band, discrepancy.percent
                ),
                ("sans-serif", 20),
            )
            .set_label_area_size(LabelAreaPosition::Left, 40)
            .set_label_area_size(LabelAreaPosition::Bottom, 40)
            .margin(10)
            .build_cartesian_2d(0f64..cutout.width as f64, 0f64..cutout.height as f64)
            .map_err(backend)?;
        chart.configure_mesh().draw().map_err(backend)?;
        draw_image(&mut chart, cutout)?;
        plot.present().map_err(backend)?;
        Ok(())
    }

    fn degeneracy(&mut self, degeneracy: &Degeneracy) -> Result<()> {
        let n = degeneracy.correlation.len();
        if n < 2 {
            return Ok(());
        }
        let path = self.path(format!("degeneracy_{}.png", degeneracy.parent));
        let plot = BitMapBackend::new(&path, (512, 512)).into_drawing_area();
        plot.fill(&WHITE).map_err(backend)?;
        let mut chart = ChartBuilder::on(&plot)
            .caption(
                format!("Parent {}: correlation between peak templates", degeneracy.parent),
                ("sans-serif", 18),
            )
            .set_label_area_size(LabelAreaPosition::Left, 40)
            .set_label_area_size(LabelAreaPosition::Bottom, 40)
            .margin(10)
            .build_cartesian_2d(0f64..n as f64, 0f64..n as f64)
            .map_err(backend)?;
        chart
            .configure_mesh()
            .disable_mesh()
            .x_desc("Peak")
            .y_desc("Peak")
            .draw()
            .map_err(backend)?;
        let cells = degeneracy
            .correlation
            .iter()
            .enumerate()
            .flat_map(|(i, row)| row.iter().enumerate().map(move |(j, &c)| (i, j, c)))
            .filter(|(_, _, c)| *c != 0f64)
            .map(|(i, j, c)| {
                let color = colorous::VIRIDIS.eval_continuous(c.clamp(0., 1.));
                let (x, y) = (i as f64, j as f64);
                Rectangle::new(
                    [(x, y), (x + 1., y + 1.)],
                    RGBColor(color.r, color.g, color.b).filled(),
                )
            });
        chart.draw_series(cells).map_err(backend)?;
        chart
            .draw_series(
                degeneracy
                    .good_flux
                    .iter()
                    .enumerate()
                    .filter(|(_, good)| !**good)
                    .map(|(k, _)| {
                        let xy = (k as f64 + 0.5, k as f64 + 0.5);
                        Cross::new(xy, 6, RED.stroke_width(2))
                    }),
            )
            .map_err(backend)?;
        plot.present().map_err(backend)?;
        Ok(())
    }

    fn sed_comparison(&mut self, sed: &SedComparison) -> Result<()> {
        draw_histogram(
            &self.path("sed_errors.png".to_string()),
            "SED errors",
            &sed.good,
        )
    }

    fn flux_comparison(&mut self, band: Band, flux: &FluxComparison) -> Result<()> {
        let path = self.path(format!("flux_{}.png", band));
        let plot = BitMapBackend::new(&path, (768, 512)).into_drawing_area();
        plot.fill(&WHITE).map_err(backend)?;
        let samples = || flux.series.iter().flat_map(|s| s.samples.iter());
        let mut chart = ChartBuilder::on(&plot)
            .caption(format!("Filter {}", band), ("sans-serif", 20))
            .set_label_area_size(LabelAreaPosition::Left, 50)
            .set_label_area_size(LabelAreaPosition::Bottom, 40)
            .margin(10)
            .build_cartesian_2d(
                range(samples().map(|(x, _)| *x)),
                range(samples().map(|(_, y)| *y)),
            )
            .map_err(backend)?;
        chart
            .configure_mesh()
            .x_desc("Simulated Flux (counts)")
            .y_desc("Fractional Error")
            .draw()
            .map_err(backend)?;
        for (k, stats) in flux.series.iter().enumerate() {
            let rgb = tableau(k);
            chart
                .draw_series(
                    stats
                        .samples
                        .iter()
                        .map(|&xy| Circle::new(xy, 2, rgb.filled())),
                )
                .map_err(backend)?
                .label(stats.label.as_str())
                .legend(move |(x, y)| Circle::new((x, y), 3, rgb.filled()));
        }
        chart
            .configure_series_labels()
            .border_style(&BLACK)
            .background_style(&WHITE.mix(0.8))
            .position(SeriesLabelPosition::UpperRight)
            .draw()
            .map_err(backend)?;
        plot.present().map_err(backend)?;

        draw_histogram(
            &self.path(format!("flux_{}_errors.png", band)),
            &format!("Filter {} Flux", band),
            &flux.series,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finite_range() {
        let r = range([3., f64::NAN, -1., f64::INFINITY]);
        assert!((r.start + 1.04).abs() < 1e-12 && (r.end - 3.04).abs() < 1e-12);
        assert_eq!(range([2.]), 1.0..3.0);
        assert_eq!(range(Vec::<f64>::new()), 0.0..1.0);
    }
}
