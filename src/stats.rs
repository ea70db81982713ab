//! Sample statistics

/// Error histogram bin edges in percent, the last bin collects everything above 20%
pub const ERROR_BINS: [f64; 6] = [0., 5., 10., 15., 20., 25.];

/// Median of the samples, `None` if there is none
pub fn median(data: &[f64]) -> Option<f64> {
    let mut data = data.to_vec();
    let n = data.len();
    if n == 0 {
        return None;
    }
    let (lower, &mut mid, _) = data.select_nth_unstable_by(n / 2, f64::total_cmp);
    if n % 2 == 1 {
        Some(mid)
    } else {
        // the lower half holds the (n/2-1)th sample as its maximum
        lower
            .iter()
            .cloned()
            .max_by(f64::total_cmp)
            .map(|fst| (fst + mid) / 2.0)
    }
}

pub fn mean(data: &[f64]) -> Option<f64> {
    match data.len() {
        0 => None,
        n => Some(data.iter().sum::<f64>() / n as f64),
    }
}

/// Root mean square
pub fn rms(data: &[f64]) -> Option<f64> {
    mean(&data.iter().map(|x| x * x).collect::<Vec<f64>>()).map(f64::sqrt)
}

/// Fraction of the samples in each bin of `bins`
///
/// Samples are clipped to the range of the bins first, so values past the last edge
/// land in the last bin.
pub fn clipped_histogram(data: &[f64], bins: &[f64]) -> Vec<f64> {
    let n_bin = bins.len().saturating_sub(1);
    let mut counts = vec![0f64; n_bin];
    if n_bin == 0 || data.is_empty() {
        return counts;
    }
    let (lo, hi) = (bins[0], bins[n_bin]);
    for value in data.iter().map(|x| x.clamp(lo, hi)) {
        let k = bins[1..]
            .iter()
            .position(|&edge| value < edge)
            .unwrap_or(n_bin - 1);
        counts[k] += 1.;
    }
    let n = data.len() as f64;
    counts.iter_mut().for_each(|c| *c /= n);
    counts
}
