//! Component C: per-exon filter cascade (spec §4.C).
//!
//! Decides, for one exon within one cluster, whether the robust Gaussian
//! fit of its FPM distribution is trustworthy enough to call CNVs from, or
//! whether it must be flagged no-call with a specific rejection tag for
//! diagnostics.

use crate::cnv::robust_gaussian::{self, FitError};
use crate::cnv::types::{ExonFilterTag, ExonMetrics};

fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

/// Fraction of samples whose FPM falls within `mean ± 2*stdev`.
fn weight(v: &[f64], mean: f64, stdev: f64) -> f64 {
    let lo = mean - 2.0 * stdev;
    let hi = mean + 2.0 * stdev;
    let in_window = v.iter().filter(|&&x| x > lo && x < hi).count();
    in_window as f64 / v.len() as f64
}

/// Run the four-rule filter cascade on one exon's FPM vector `v`.
///
/// `v` need not be sorted; it is sorted internally to compute the median.
pub fn filter_exon(v: &[f64], uncov_threshold: f64) -> ExonMetrics {
    let mut sorted = v.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());

    // Filter n1: exon not covered.
    if median(&sorted) == 0.0 {
        return ExonMetrics::rejected(ExonFilterTag::Med0);
    }

    // Filter n2: robust Gaussian fit does not converge.
    let (mean, mut stdev) = match robust_gaussian::fit(v) {
        Ok(pair) => pair,
        Err(FitError::ZeroMedian | FitError::EmptyWindow | FitError::DidNotConverge(_)) => {
            return ExonMetrics::rejected(ExonFilterTag::NoRg)
        }
    };

    // Filter n3a: a zero robust mean cannot be distinguished from CN0.
    if mean == 0.0 {
        return ExonMetrics::rejected(ExonFilterTag::Mean0);
    }

    // All samples share the same coverage value: manufacture a synthetic
    // spread (+-5%) rather than dividing by a zero stdev downstream.
    if stdev == 0.0 {
        stdev = mean / 20.0;
    }

    // Filter n3b: pseudo z-score vs. the uncovered-exon threshold.
    let z = (mean - uncov_threshold) / stdev;
    if z < 3.0 {
        return ExonMetrics::rejected(ExonFilterTag::LowZ);
    }

    // Filter n4: the robust Gaussian must explain at least half the
    // samples' coverage.
    let w = weight(v, mean, stdev);
    if w < 0.5 {
        return ExonMetrics::rejected(ExonFilterTag::LowWeight);
    }

    ExonMetrics::callable(mean, stdev)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    // all-zero coverage: MED0, filter n1.
    #[case::all_zero(vec![0.0; 40], 1.0, ExonFilterTag::Med0)]
    // tight, well-separated coverage well above threshold: CALLABLE.
    #[case::tight_and_covered(
        (0..40).map(|i| 10.0 + (i as f64 % 5.0) * 0.1 - 0.2).collect(),
        1.0,
        ExonFilterTag::Callable
    )]
    // mean too close to the uncovered-exon threshold: LOW_Z, filter n3b.
    #[case::close_to_threshold(
        (0..40).map(|i| 1.0 + (i as f64 % 5.0) * 0.02).collect(),
        0.95,
        ExonFilterTag::LowZ
    )]
    fn filter_cascade_tags_as_expected(
        #[case] v: Vec<f64>,
        #[case] uncov_threshold: f64,
        #[case] expected: ExonFilterTag,
    ) {
        assert_eq!(filter_exon(&v, uncov_threshold).tag, expected);
    }

    #[test]
    fn bimodal_exon_with_minority_main_peak_is_low_weight() {
        // 60% of samples scattered widely, 40% tightly clustered: the
        // robust fit locks onto the tight cluster but explains <50% of
        // the data.
        let mut v: Vec<f64> = (0..24).map(|i| 10.0 + (i as f64 % 3.0) * 0.05).collect();
        v.extend((0..36).map(|i| 2.0 + (i as f64 % 7.0) * 3.0));
        let metrics = filter_exon(&v, 0.5);
        assert_eq!(metrics.tag, ExonFilterTag::LowWeight);
    }

    #[test]
    fn monotonicity_raising_uncov_threshold_cannot_turn_low_z_callable() {
        let v: Vec<f64> = (0..40).map(|i| 10.0 + (i as f64 % 5.0) * 0.1 - 0.2).collect();
        let low = filter_exon(&v, 1.0);
        assert_eq!(low.tag, ExonFilterTag::Callable);

        // Raising the threshold can only ever reduce the z-score, so once
        // the verdict has dropped to LOW_Z it must stay LOW_Z for every
        // higher threshold in the sweep; assert this is forced to trigger
        // at least once rather than leaving the check conditional on it.
        let thresholds = [1.0, 3.0, 5.0, 7.0, 9.0, 9.5, 9.9, 9.95, 9.99];
        let mut saw_low_z = false;
        let mut previously_low_z = false;
        for &t in &thresholds {
            let tag = filter_exon(&v, t).tag;
            if previously_low_z {
                assert_eq!(tag, ExonFilterTag::LowZ, "threshold {t} regressed LOW_Z back to CALLABLE");
            }
            if tag == ExonFilterTag::LowZ {
                saw_low_z = true;
                previously_low_z = true;
            }
        }
        assert!(saw_low_z, "sweep never reached LOW_Z; fixture no longer exercises the invariant");
    }
}
