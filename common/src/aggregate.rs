//! Outlier-robust aggregation of repeated sensor samples.
//!
//! Quartiles use linear interpolation between closest ranks, and any
//! sample outside `[Q1 - 1.5*IQR, Q3 + 1.5*IQR]` is rejected before
//! averaging. Below four samples the quartile estimates are unreliable,
//! so filtering is bypassed and the plain mean is returned.

use crate::types::AggregatedReading;

const IQR_MULTIPLIER: f64 = 1.5;
const MIN_SAMPLES_FOR_FILTERING: usize = 4;

/// Quartile by linear interpolation over sorted data (`q` in 0..=1).
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let position = q * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    if lower == upper {
        return sorted[lower];
    }
    let fraction = position - lower as f64;
    sorted[lower] + fraction * (sorted[upper] - sorted[lower])
}

/// IQR outlier rejection. Inputs shorter than four samples are returned
/// unchanged.
pub fn filter_outliers(samples: &[f64]) -> Vec<f64> {
    if samples.len() < MIN_SAMPLES_FOR_FILTERING {
        return samples.to_vec();
    }

    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let q1 = quantile(&sorted, 0.25);
    let q3 = quantile(&sorted, 0.75);
    let iqr = q3 - q1;
    let lower = q1 - IQR_MULTIPLIER * iqr;
    let upper = q3 + IQR_MULTIPLIER * iqr;

    samples
        .iter()
        .copied()
        .filter(|sample| (lower..=upper).contains(sample))
        .collect()
}

/// Mean of the surviving samples, rounded to two decimals. `None` when
/// nothing survives, so "no valid reading" stays distinguishable from a
/// genuine zero.
pub fn robust_mean(samples: &[f64]) -> Option<f64> {
    let surviving = filter_outliers(samples);
    if surviving.is_empty() {
        return None;
    }

    let mean = surviving.iter().sum::<f64>() / surviving.len() as f64;
    Some((mean * 100.0).round() / 100.0)
}

/// One cycle's worth of repeated polls, consumed by aggregation and
/// discarded afterwards.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorSampleSet {
    pub temperatures: Vec<f64>,
    pub humidities: Vec<f64>,
    pub lux_values: Vec<f64>,
}

impl SensorSampleSet {
    pub fn aggregate(&self) -> AggregatedReading {
        AggregatedReading {
            temperature: robust_mean(&self.temperatures),
            humidity: robust_mean(&self.humidities),
            lux: robust_mean(&self.lux_values),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn small_sets_bypass_filtering() {
        let samples = [1.0, 100.0, 1.0];
        assert_eq!(filter_outliers(&samples), samples.to_vec());
        assert_eq!(robust_mean(&samples), Some(34.0));
    }

    #[test]
    fn extreme_outlier_is_rejected() {
        let samples = [20.1, 20.3, 20.2, 20.0, 55.0];
        let surviving = filter_outliers(&samples);

        assert_eq!(surviving, vec![20.1, 20.3, 20.2, 20.0]);
        assert_eq!(robust_mean(&samples), Some(20.15));
    }

    #[test]
    fn empty_input_yields_none() {
        assert_eq!(robust_mean(&[]), None);
    }

    #[test]
    fn single_sample_rounds() {
        assert_eq!(robust_mean(&[21.005]), Some(21.01));
    }

    #[test]
    fn uniform_samples_survive_zero_iqr() {
        let samples = [5.0; 6];
        assert_eq!(filter_outliers(&samples).len(), 6);
        assert_eq!(robust_mean(&samples), Some(5.0));
    }

    #[test]
    fn sample_set_channels_are_independent() {
        let set = SensorSampleSet {
            temperatures: vec![20.1, 20.3, 20.2, 20.0, 55.0],
            humidities: vec![60.0, 60.2],
            lux_values: vec![],
        };

        let reading = set.aggregate();
        assert_eq!(reading.temperature, Some(20.15));
        assert_eq!(reading.humidity, Some(60.1));
        assert_eq!(reading.lux, None);
        assert!(reading.climate_valid());
        assert!(!reading.lux_valid());
    }
}
