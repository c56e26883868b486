//! Component D: per-sample emission evaluator (spec §4.D).
//!
//! Turns one sample's FPM at one exon, plus that exon's fitted
//! distribution parameters, into a normalized 4-vector of posterior-like
//! values, one per CN state, that the Viterbi decoder (component F)
//! treats as emission probabilities.

use crate::cnv::gamma::{self, GammaParams};
use crate::cnv::types::{Priors, NUM_STATES};
use statrs::distribution::Continuous;
use statrs::distribution::Normal;

/// CN3+ emission model. Spec §9 flags two coexisting formulations in the
/// source and fixes the Gaussian one as canonical; `GammaTail` is kept as
/// the documented configurable alternative, not inferred functionality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Cn3Model {
    Gaussian,
    GammaTail,
}

impl Default for Cn3Model {
    fn default() -> Self {
        Cn3Model::Gaussian
    }
}

fn normal_pdf(x: f64, mean: f64, stdev: f64) -> f64 {
    Normal::new(mean, stdev).map(|d| d.pdf(x)).unwrap_or(0.0)
}

/// CN3+ pdf under the empirical gamma-tail alternative
/// (`shape=8, loc=mean+stdev, scale=log10(mean+stdev+1)`), ported from the
/// reference implementation's `getDistributionObjects`.
fn cn3_gamma_tail_pdf(x: f64, mean: f64, stdev: f64) -> f64 {
    let loc = mean + stdev;
    let scale = (loc + 1.0).log10();
    if scale <= 0.0 {
        return 0.0;
    }
    let params = GammaParams {
        shape: 8.0,
        loc,
        scale,
    };
    gamma::pdf(&params, x)
}

/// Evaluate the 4-vector of normalized emission values for one
/// `(cluster, exon, sample)` triple.
///
/// Returns `None` if the four weighted densities all vanish (the
/// no-call sentinel case in spec §4.D).
pub fn evaluate(
    gamma_params: &GammaParams,
    uncov_threshold: f64,
    mean: f64,
    stdev: f64,
    priors: &Priors,
    cn3_model: Cn3Model,
    fpm: f64,
) -> Option<[f64; NUM_STATES]> {
    let cn0_norm = 1.0 - gamma::cdf(gamma_params, uncov_threshold);
    let p0 = if fpm <= mean / 2.0 && cn0_norm > 0.0 {
        gamma::pdf(gamma_params, fpm) / cn0_norm
    } else {
        0.0
    };
    let p1 = normal_pdf(fpm, mean / 2.0, stdev);
    let p2 = normal_pdf(fpm, mean, stdev);
    let p3 = match cn3_model {
        Cn3Model::Gaussian => normal_pdf(fpm, 1.5 * mean, stdev),
        Cn3Model::GammaTail => cn3_gamma_tail_pdf(fpm, mean, stdev),
    };

    let q = [p0 * priors[0], p1 * priors[1], p2 * priors[2], p3 * priors[3]];
    let sum: f64 = q.iter().sum();
    if sum <= 0.0 || !sum.is_finite() {
        return None;
    }
    Some([q[0] / sum, q[1] / sum, q[2] / sum, q[3] / sum])
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::approx_eq;

    fn flat_priors() -> Priors {
        [0.25, 0.25, 0.25, 0.25]
    }

    fn fixture_gamma() -> GammaParams {
        GammaParams {
            shape: 2.0,
            loc: 0.0,
            scale: 0.5,
        }
    }

    #[test]
    fn emission_sums_to_one() {
        let q = evaluate(
            &fixture_gamma(),
            1.0,
            10.0,
            1.0,
            &flat_priors(),
            Cn3Model::Gaussian,
            10.0,
        )
        .unwrap();
        let sum: f64 = q.iter().sum();
        assert!(approx_eq!(f64, sum, 1.0, epsilon = 1e-9));
        assert!(q.iter().all(|&p| p >= 0.0));
    }

    #[test]
    fn fpm_at_cn2_mean_favors_cn2() {
        let q = evaluate(
            &fixture_gamma(),
            1.0,
            10.0,
            1.0,
            &flat_priors(),
            Cn3Model::Gaussian,
            10.0,
        )
        .unwrap();
        assert!(q[2] > q[0]);
        assert!(q[2] > q[1]);
        assert!(q[2] > q[3]);
    }

    #[test]
    fn fpm_at_cn1_mean_favors_cn1() {
        let q = evaluate(
            &fixture_gamma(),
            1.0,
            10.0,
            0.4,
            &flat_priors(),
            Cn3Model::Gaussian,
            5.0,
        )
        .unwrap();
        assert!(q[1] > q[2]);
    }

    #[test]
    fn fpm_at_cn3_mean_favors_cn3_under_gaussian_model() {
        let q = evaluate(
            &fixture_gamma(),
            1.0,
            10.0,
            0.4,
            &flat_priors(),
            Cn3Model::Gaussian,
            15.0,
        )
        .unwrap();
        assert!(q[3] > q[2]);
    }

    #[test]
    fn cn0_is_zero_above_half_mean() {
        let q = evaluate(
            &fixture_gamma(),
            1.0,
            10.0,
            1.0,
            &flat_priors(),
            Cn3Model::Gaussian,
            6.0,
        )
        .unwrap();
        assert_eq!(q[0], 0.0);
    }
}
