use hdrhistogram::Histogram;
use serde::Serialize;

/// Frame rates are recorded in hundredths so the histogram keeps two decimals.
const FPS_SCALE: f64 = 100.0;
/// Highest frame rate the histogram tracks; faster samples are clamped.
const FPS_CEILING: f64 = 100_000.0;

/// Compute mean, median, 25th percentile and 75th percentile from samples.
pub fn compute_metrics(samples: &[f64]) -> Option<(f64, f64, f64, f64)> {
    if samples.len() < 2 {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    let mean = samples.iter().sum::<f64>() / n as f64;
    let median = sorted[n / 2];
    let p25 = sorted[n / 4];
    let p75 = sorted[3 * n / 4];
    Some((mean, median, p25, p75))
}

/// Value at quantile `q` (0..=1) via an HDR histogram.
pub fn quantile(samples: &[f64], q: f64) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let mut hist =
        Histogram::<u64>::new_with_bounds(1, (FPS_CEILING * FPS_SCALE) as u64, 3).ok()?;
    for s in samples.iter().filter(|s| s.is_finite() && **s >= 0.0) {
        hist.saturating_record((s * FPS_SCALE).round() as u64);
    }
    if hist.is_empty() {
        return None;
    }
    Some(hist.value_at_quantile(q.clamp(0.0, 1.0)) as f64 / FPS_SCALE)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FpsStats {
    pub samples: usize,
    pub mean: f64,
    pub median: f64,
    pub p25: f64,
    pub p75: f64,
    /// Only 1% of frames-per-second samples were slower than this.
    pub p1_low: f64,
}

pub fn fps_stats(samples: &[f64]) -> Option<FpsStats> {
    let (mean, median, p25, p75) = compute_metrics(samples)?;
    Some(FpsStats {
        samples: samples.len(),
        mean,
        median,
        p25,
        p75,
        p1_low: quantile(samples, 0.01)?,
    })
}
