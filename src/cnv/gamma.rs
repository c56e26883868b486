//! Three-parameter gamma distribution: maximum-likelihood fit with a free
//! location parameter, and the pdf/cdf evaluations the emission evaluator
//! (§4.D) and the density/threshold estimator (§4.A) need.
//!
//! SciPy's `gamma.fit` with `floc` unset runs a generic Nelder-Mead
//! minimization of the negative log-likelihood over `(shape, loc, scale)`
//! jointly; its initial guess comes from the method of moments. We get
//! equivalent MLE semantics without a general-purpose optimizer by
//! exploiting that, for any fixed `loc`, the (shape, scale) that maximize
//! the likelihood of `x - loc` have a closed (iterative) form, the
//! classic gamma MLE via the digamma function (Minka, *Estimating a Gamma
//! Distribution*, 2002), and then line-searching `loc` with golden-section
//! search on the resulting profile log-likelihood. `loc` is one-dimensional
//! and the profile is unimodal in practice for the coverage data this is
//! fit to, so golden section converges reliably without a general solver.

use statrs::distribution::{Continuous, ContinuousCDF, Gamma as StatrsGamma};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GammaParams {
    pub shape: f64,
    pub loc: f64,
    pub scale: f64,
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GammaFitError {
    #[error("gamma fit needs at least 2 points, got {0}")]
    TooFewPoints(usize),
    #[error("gamma fit did not converge to a usable location parameter")]
    DidNotConverge,
}

/// Digamma function via asymptotic expansion, shifted up via the recurrence
/// `digamma(x) = digamma(x+1) - 1/x` until the argument is large enough for
/// the series to be accurate.
fn digamma(mut x: f64) -> f64 {
    let mut result = 0.0;
    while x < 6.0 {
        result -= 1.0 / x;
        x += 1.0;
    }
    let inv = 1.0 / x;
    let inv2 = inv * inv;
    result += x.ln() - 0.5 * inv
        - inv2 * (1.0 / 12.0 - inv2 * (1.0 / 120.0 - inv2 * (1.0 / 252.0)));
    result
}

/// Trigamma function (derivative of digamma), same shift-then-series
/// strategy, via `trigamma(x) = trigamma(x+1) + 1/x^2`.
fn trigamma(mut x: f64) -> f64 {
    let mut result = 0.0;
    while x < 6.0 {
        result += 1.0 / (x * x);
        x += 1.0;
    }
    let inv = 1.0 / x;
    let inv2 = inv * inv;
    result += inv
        + 0.5 * inv2
        + inv2 * inv * (1.0 / 6.0 - inv2 * (1.0 / 30.0 - inv2 * (1.0 / 42.0)));
    result
}

/// MLE of `(shape, scale)` for a gamma distribution with `loc=0`, given a
/// strictly-positive sample `y`.
fn fit_shape_scale(y: &[f64]) -> (f64, f64) {
    let n = y.len() as f64;
    let y_bar = y.iter().sum::<f64>() / n;
    let ln_y_bar = y_bar.ln();
    let mean_ln_y = y.iter().map(|v| v.ln()).sum::<f64>() / n;
    let s = ln_y_bar - mean_ln_y;

    // s -> 0 only in the degenerate case of (near-)zero spread; treat it as
    // an extremely peaked gamma rather than dividing by zero.
    if s <= 1e-12 {
        let shape = 1e6;
        return (shape, y_bar / shape);
    }

    // Minka's closed-form initial guess for the shape.
    let mut k = (3.0 - s + ((s - 3.0).powi(2) + 24.0 * s).sqrt()) / (12.0 * s);
    k = k.max(1e-6);

    for _ in 0..100 {
        let f = k.ln() - digamma(k) - s;
        let f_prime = 1.0 / k - trigamma(k);
        if f_prime.abs() < 1e-300 {
            break;
        }
        let step = f / f_prime;
        let next = k - step;
        if !next.is_finite() || next <= 0.0 {
            break;
        }
        let converged = (next - k).abs() < 1e-10 * k.max(1.0);
        k = next;
        if converged {
            break;
        }
    }

    let scale = y_bar / k;
    (k, scale)
}

fn profile_log_likelihood(x: &[f64], loc: f64) -> f64 {
    let y: Vec<f64> = x.iter().map(|v| v - loc).collect();
    let (shape, scale) = fit_shape_scale(&y);
    let Ok(dist) = StatrsGamma::new(shape, 1.0 / scale) else {
        return f64::NEG_INFINITY;
    };
    y.iter().map(|&v| dist.ln_pdf(v)).sum()
}

/// Fit a 3-parameter gamma distribution to `x` by maximum likelihood, with
/// `loc` free (equivalent semantics to `scipy.stats.gamma.fit(x)`).
///
/// Requires `x` non-empty with at least 2 distinct values and all entries
/// finite; `x` need not be sorted.
pub fn fit(x: &[f64]) -> Result<GammaParams, GammaFitError> {
    if x.len() < 2 {
        return Err(GammaFitError::TooFewPoints(x.len()));
    }
    let min_x = x.iter().cloned().fold(f64::INFINITY, f64::min);
    let max_x = x.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let range = (max_x - min_x).max(1e-9);

    // loc must stay strictly below min(x) so that x - loc > 0 everywhere;
    // search a generous floor below the data's range for the profile
    // optimum, as scipy's initial moment-based guess does not pin loc to
    // any particular boundary.
    let hi = min_x - range * 1e-6 - 1e-9;
    let lo = min_x - range * 10.0 - 1e-6;

    let golden = (5.0_f64.sqrt() - 1.0) / 2.0;
    let (mut a, mut b) = (lo, hi);
    let mut c = b - golden * (b - a);
    let mut d = a + golden * (b - a);
    let mut fc = profile_log_likelihood(x, c);
    let mut fd = profile_log_likelihood(x, d);

    for _ in 0..200 {
        if (b - a).abs() < 1e-10 * range.max(1.0) {
            break;
        }
        if fc > fd {
            b = d;
            d = c;
            fd = fc;
            c = b - golden * (b - a);
            fc = profile_log_likelihood(x, c);
        } else {
            a = c;
            c = d;
            fc = fd;
            d = a + golden * (b - a);
            fd = profile_log_likelihood(x, d);
        }
    }

    let loc = (a + b) / 2.0;
    if !loc.is_finite() {
        return Err(GammaFitError::DidNotConverge);
    }
    let y: Vec<f64> = x.iter().map(|v| v - loc).collect();
    let (shape, scale) = fit_shape_scale(&y);
    if !shape.is_finite() || !scale.is_finite() || shape <= 0.0 || scale <= 0.0 {
        return Err(GammaFitError::DidNotConverge);
    }

    Ok(GammaParams { shape, loc, scale })
}

/// `pdf(x)` of the fitted gamma; zero for `x <= loc`.
pub fn pdf(params: &GammaParams, x: f64) -> f64 {
    if x <= params.loc {
        return 0.0;
    }
    match StatrsGamma::new(params.shape, 1.0 / params.scale) {
        Ok(dist) => dist.pdf(x - params.loc),
        Err(_) => 0.0,
    }
}

/// `cdf(x)` of the fitted gamma; zero for `x <= loc`.
pub fn cdf(params: &GammaParams, x: f64) -> f64 {
    if x <= params.loc {
        return 0.0;
    }
    match StatrsGamma::new(params.shape, 1.0 / params.scale) {
        Ok(dist) => dist.cdf(x - params.loc),
        Err(_) => 0.0,
    }
}
