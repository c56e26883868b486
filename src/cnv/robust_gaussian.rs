//! Component B: robust Gaussian fitter (spec §4.B).
//!
//! Iteratively repositions a truncated window around the running mean of a
//! 1-D sample until it converges on the dominant Gaussian component of an
//! otherwise-unknown mixture, locating the CN2 coverage peak of one exon
//! within one cluster while ignoring contamination from other CN states
//! or outliers.

use crate::cnv::erf::truncated_integral_and_sigma;

/// Truncation half-width in units of `sigma`, fixed by spec §4.B.
const BANDWIDTH: f64 = 2.0;
/// Convergence tolerance on `|delta_mu| + |delta_sigma|`, fixed by spec §4.B.
const EPS: f64 = 1.0e-5;
/// Defensive bound on EM iterations; real inputs converge in a handful.
const MAX_ITERS: usize = 1_000;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitError {
    #[error("cannot fit: sample median is zero")]
    ZeroMedian,
    #[error("cannot fit: truncated window is empty")]
    EmptyWindow,
    #[error("cannot fit: exceeded {0} EM iterations without converging")]
    DidNotConverge(usize),
}

fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

fn mean(xs: &[f64]) -> f64 {
    xs.iter().sum::<f64>() / xs.len() as f64
}

fn stdev(xs: &[f64]) -> f64 {
    let m = mean(xs);
    (xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / xs.len() as f64).sqrt()
}

/// Fit `(mu, sigma)` of the dominant Gaussian component of `x`, starting
/// from the sample median/std-over-3 as in spec §4.B.
pub fn fit(x: &[f64]) -> Result<(f64, f64), FitError> {
    let mut sorted = x.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mu0 = median(&sorted);
    if mu0 == 0.0 {
        return Err(FitError::ZeroMedian);
    }
    let sigma0 = stdev(x) / 3.0;
    fit_from(x, mu0, sigma0)
}

/// Same EM loop as [`fit`], but starting from caller-supplied `(mu, sigma)`
/// rather than deriving them from `x`. Used directly by property tests that
/// check idempotence (spec §8.5): fitting a sample drawn from
/// `N(mu, sigma)` truncated to `[mu ± 2*sigma]`, starting exactly at
/// `(mu, sigma)`, must return `(mu, sigma)` within `eps`.
pub fn fit_from(x: &[f64], mu0: f64, sigma0: f64) -> Result<(f64, f64), FitError> {
    let k = truncated_integral_and_sigma(BANDWIDTH);

    let mut mu = mu0;
    let mut sigma = sigma0;
    let mut mu_prev = mu + 1.0;
    let mut sigma_prev = sigma + 1.0;

    let mut iters = 0;
    while (mu - mu_prev).abs() + (sigma - sigma_prev).abs() > EPS {
        iters += 1;
        if iters > MAX_ITERS {
            return Err(FitError::DidNotConverge(MAX_ITERS));
        }

        let lo = mu - BANDWIDTH * sigma;
        let hi = mu + BANDWIDTH * sigma;
        let window: Vec<f64> = x.iter().copied().filter(|&v| v > lo && v < hi).collect();
        if window.is_empty() {
            return Err(FitError::EmptyWindow);
        }

        let new_mu = mean(&window);
        let var = window.iter().map(|v| (v - new_mu).powi(2)).sum::<f64>() / window.len() as f64;
        let new_sigma = var.sqrt() / k;

        mu_prev = mu;
        sigma_prev = sigma;
        mu = new_mu;
        sigma = new_sigma;
    }

    Ok((mu, sigma))
}
