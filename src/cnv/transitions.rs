//! Component E: distance-aware transition adjuster (spec §4.E).
//!
//! Interpolates between a cluster's base transition matrix (valid for
//! adjacent exons) and the state priors (valid when two called exons are
//! far enough apart that correlation between their CN states should be
//! negligible), by a power law in the genomic distance between them.

use crate::cnv::types::{Priors, TransMatrix, NUM_STATES};

/// Default power-law exponent. Spec §9 leaves this a parameter; `1.0`
/// (linear interpolation) is the simplest choice consistent with "smoothly
/// adjusted following a power law" and is used unless overridden.
pub const DEFAULT_POWER: f64 = 1.0;

fn prior_matrix(priors: &Priors) -> TransMatrix {
    let mut m = TransMatrix::zeros((NUM_STATES, NUM_STATES));
    for mut row in m.rows_mut() {
        for (j, v) in row.iter_mut().enumerate() {
            *v = priors[j];
        }
    }
    m
}

/// Adjust `base` towards `priors` as genomic distance `d` grows from 0 to
/// `dmax`, using exponent `power`.
///
/// - `d <= 0` returns `base` unchanged.
/// - `d >= dmax` returns the rank-1 matrix whose every row is `priors`.
/// - otherwise linearly (or power-law-ly) interpolates; the result stays
///   row-stochastic because both endpoints are.
pub fn adjust(base: &TransMatrix, priors: &Priors, d: i64, dmax: i64, power: f64) -> TransMatrix {
    if d <= 0 {
        return base.clone();
    }
    if d >= dmax {
        return prior_matrix(priors);
    }

    let alpha = (d as f64 / dmax as f64).powf(power);
    let pi = prior_matrix(priors);
    base.mapv(|v| v * (1.0 - alpha)) + pi.mapv(|v| v * alpha)
}
