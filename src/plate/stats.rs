//! Summary statistics over replicate well values
//!
//! Empty inputs yield NaN across the board rather than an error or zero: a
//! group with no usable wells has no mean, and downstream display code
//! renders NaN as blank. The standard deviation is the sample (n-1) form and
//! is NaN for a single value.

/// Summary of one set of replicate values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SummaryStats {
    pub n: usize,
    pub mean: f64,
    pub stddev: f64,
    pub min: f64,
    pub max: f64,
}

impl SummaryStats {
    pub fn compute(values: &[f64]) -> SummaryStats {
        let n = values.len();
        if n == 0 {
            return SummaryStats {
                n: 0,
                mean: f64::NAN,
                stddev: f64::NAN,
                min: f64::NAN,
                max: f64::NAN,
            };
        }

        let mean = values.iter().sum::<f64>() / n as f64;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for &v in values {
            min = min.min(v);
            max = max.max(v);
        }

        let stddev = if n < 2 {
            f64::NAN
        } else {
            let ss: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
            (ss / (n - 1) as f64).sqrt()
        };

        SummaryStats {
            n,
            mean,
            stddev,
            min,
            max,
        }
    }

    /// Coefficient of variation as a percentage; NaN when undefined.
    pub fn cv_percent(&self) -> f64 {
        if self.mean == 0.0 {
            f64::NAN
        } else {
            self.stddev / self.mean * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_is_all_nan() {
        let stats = SummaryStats::compute(&[]);
        assert_eq!(stats.n, 0);
        assert!(stats.mean.is_nan());
        assert!(stats.stddev.is_nan());
        assert!(stats.min.is_nan());
        assert!(stats.max.is_nan());
    }

    #[test]
    fn single_value_has_no_deviation() {
        let stats = SummaryStats::compute(&[4.5]);
        assert_eq!(stats.n, 1);
        assert_eq!(stats.mean, 4.5);
        assert_eq!(stats.min, 4.5);
        assert_eq!(stats.max, 4.5);
        assert!(stats.stddev.is_nan());
    }

    #[test]
    fn sample_stddev_uses_n_minus_one() {
        let stats = SummaryStats::compute(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert!((stats.mean - 5.0).abs() < 1e-12);
        // sample stddev of this classic set is ~2.138
        assert!((stats.stddev - 2.138089935299395).abs() < 1e-9);
        assert_eq!(stats.min, 2.0);
        assert_eq!(stats.max, 9.0);
    }

    #[test]
    fn cv_is_nan_for_zero_mean() {
        let stats = SummaryStats::compute(&[-1.0, 1.0]);
        assert!(stats.cv_percent().is_nan());
    }
}
