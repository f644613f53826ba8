/// Compute summary statistics (mean, median, 25th percentile, 75th percentile) from samples.
pub fn compute_metrics(samples: &[f64]) -> Option<(f64, f64, f64, f64)> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len();
    let mean = samples.iter().sum::<f64>() / n as f64;
    let median = sorted[n / 2];
    let p25 = sorted[n / 4];
    let p75 = sorted[3 * n / 4];
    Some((mean, median, p25, p75))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_has_no_metrics() {
        assert_eq!(compute_metrics(&[]), None);
    }

    #[test]
    fn single_sample_is_every_statistic() {
        assert_eq!(compute_metrics(&[4.0]), Some((4.0, 4.0, 4.0, 4.0)));
    }

    #[test]
    fn unsorted_samples() {
        let (mean, median, p25, p75) = compute_metrics(&[40.0, 10.0, 30.0, 20.0]).unwrap();
        assert_eq!(mean, 25.0);
        assert_eq!(median, 30.0);
        assert_eq!(p25, 20.0);
        assert_eq!(p75, 40.0);
    }
}
