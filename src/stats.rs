use crate::results::{
    MeasurementType, RawMeasurement, SeriesSummary, StatisticalSummary,
    Statistics,
};

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    values.iter().sum::<f64>() / values.len() as f64
}

fn sorted(values: &[f64]) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    sorted
}

/// Percentile of already sorted values, `percentile` in `0.0..=1.0`.
///
/// Interpolates linearly between the two closest ranks.
fn quartile(sorted: &[f64], percentile: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }

    let pos = (sorted.len() - 1) as f64 * percentile.clamp(0.0, 1.0);
    let base = pos.floor();
    let rest = pos - base;
    let base = base as usize;

    if base + 1 < sorted.len() {
        return sorted[base] + rest * (sorted[base + 1] - sorted[base]);
    }

    sorted[base]
}

pub fn percentile(values: &[f64], percentile: f64) -> f64 {
    quartile(&sorted(values), percentile)
}

pub fn median(values: &[f64]) -> f64 {
    percentile(values, 0.5)
}

/// Population variance.
pub fn variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    let mean = mean(values);
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
        / values.len() as f64
}

pub fn standard_deviation(values: &[f64]) -> f64 {
    variance(values).sqrt()
}

/// Descriptive statistics of a series. Empty input gives all zeros.
pub fn describe(values: &[f64]) -> Statistics {
    if values.is_empty() {
        return Statistics::default();
    }

    let sorted = sorted(values);

    Statistics {
        count: sorted.len(),
        mean: mean(&sorted),
        median: quartile(&sorted, 0.5),
        min: sorted[0],
        max: sorted[sorted.len() - 1],
        p95: quartile(&sorted, 0.95),
        p99: quartile(&sorted, 0.99),
        standard_deviation: standard_deviation(&sorted),
    }
}

/// Inverse coefficient of variation on a 0-100 scale.
///
/// `max(0, 100 - stddev / mean * 100)`, and 100 when there are fewer than
/// two values or the mean is zero.
pub fn stability_score(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 100.0;
    }

    let mean = mean(values);
    if mean == 0.0 {
        return 100.0;
    }

    let cv = standard_deviation(values) / mean.abs();
    (100.0 - cv * 100.0).clamp(0.0, 100.0)
}

fn tukey_fences(sorted: &[f64]) -> (f64, f64) {
    let q1 = quartile(sorted, 0.25);
    let q3 = quartile(sorted, 0.75);
    let iqr = q3 - q1;

    (q1 - 1.5 * iqr, q3 + 1.5 * iqr)
}

/// Tukey IQR rule. Datasets with fewer than four points have no outliers.
pub fn is_outlier(value: f64, dataset: &[f64]) -> bool {
    if dataset.len() < 4 {
        return false;
    }

    let (lower, upper) = tukey_fences(&sorted(dataset));
    value < lower || value > upper
}

/// Drop outliers, judging every value against the fences of the full
/// input rather than a shrinking set.
pub fn remove_outliers(values: &[f64]) -> Vec<f64> {
    if values.len() < 4 {
        return values.to_vec();
    }

    let (lower, upper) = tukey_fences(&sorted(values));
    values.iter().copied().filter(|v| *v >= lower && *v <= upper).collect()
}

/// Half-width of a confidence interval around the mean,
/// `t * stddev / sqrt(n)`.
///
/// This is an approximation rather than a Student-t table: the normal
/// quantiles 1.645, 1.96 and 2.58 are used for 90%, 95% and 99% once there
/// are at least 30 degrees of freedom, and a conservative 2.0 otherwise.
pub fn confidence_interval(values: &[f64], level: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }

    let n = values.len() as f64;
    t_score(level, values.len() - 1) * standard_deviation(values) / n.sqrt()
}

fn t_score(level: f64, degrees_of_freedom: usize) -> f64 {
    if degrees_of_freedom < 30 {
        return 2.0;
    }

    if (level - 0.90).abs() < 1e-9 {
        1.645
    } else if (level - 0.95).abs() < 1e-9 {
        1.96
    } else if (level - 0.99).abs() < 1e-9 {
        2.58
    } else {
        2.0
    }
}

fn summarize_series(values: &[f64]) -> Option<SeriesSummary> {
    if values.is_empty() {
        return None;
    }

    Some(SeriesSummary {
        statistics: describe(values),
        stability_score: stability_score(values),
        confidence_interval: confidence_interval(values, 0.95),
    })
}

/// Partition raw samples by type and describe each partition.
pub fn summarize(measurements: &[RawMeasurement]) -> StatisticalSummary {
    let values_of = |measurement_type: MeasurementType| -> Vec<f64> {
        measurements
            .iter()
            .filter(|m| m.measurement_type == measurement_type)
            .map(|m| m.value)
            .collect()
    };

    StatisticalSummary {
        download_stats: summarize_series(&values_of(
            MeasurementType::DownloadSpeed,
        )),
        upload_stats: summarize_series(&values_of(MeasurementType::UploadSpeed)),
        latency_stats: summarize_series(&values_of(MeasurementType::Latency)),
        jitter_stats: summarize_series(&values_of(MeasurementType::Jitter)),
        packet_loss_stats: summarize_series(&values_of(
            MeasurementType::PacketLoss,
        )),
    }
}
