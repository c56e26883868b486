//! Self-contained series-expansion computation of the standard-normal pdf
//! and erf, avoiding a special-function dependency for a single narrow use
//! (the truncated-normal variance correction in [`crate::cnv::robust_gaussian`]).
//!
//! Ported faithfully from the reference Python implementation's
//! `normal_erf`/`truncated_integral_and_sigma`: a direct power-series
//! evaluation of `exp(-x^2/2)` term by term, rather than a call into
//! `libm::erf`.

/// Standard-normal pdf and erf-like integral of `x`, both evaluated via the
/// same running power series (so they share rounding behavior), after
/// standardizing `x` with `(mu, sigma)`.
///
/// Returns `(pdf, half_erf)` where `half_erf` is `erf((x-mu)/(sigma*sqrt2))/2`,
/// clipped to `[-0.5, 0.5]` (an exact probability can never leave that
/// range; clipping only guards against series truncation error at the
/// tails).
pub fn normal_erf(x: f64, mu: f64, sigma: f64, depth: u32) -> (f64, f64) {
    let z = (x - mu) / sigma;
    let mut term = 1.0_f64;
    let mut normal = 1.0_f64;
    let mut erf = z;

    for i in 1..depth {
        term = -term * z * z / 2.0 / i as f64;
        normal += term;
        erf += term * z / (2.0 * i as f64 + 1.0);
    }

    let sqrt_2pi = (2.0 * std::f64::consts::PI).sqrt();
    let pdf = (normal / sqrt_2pi / sigma).max(0.0);
    let half_erf = (erf / sqrt_2pi / sigma).clamp(-0.5, 0.5);
    (pdf, half_erf)
}

/// Standard-normal pdf/erf with the reference implementation's default
/// `mu=0, sigma=1, depth=50`.
pub fn normal_erf_standard(x: f64) -> (f64, f64) {
    normal_erf(x, 0.0, 1.0, 50)
}

/// Stdev of a standard normal distribution truncated to `[-x, x]`.
///
/// Derived from the identity `Var[trunc] = 1 - x * phi(x) / Phi_half(x)`
/// where `phi` is the standard-normal pdf and `Phi_half` is the half-erf
/// integral above, both evaluated by [`normal_erf_standard`].
pub fn truncated_integral_and_sigma(x: f64) -> f64 {
    let (pdf, half_erf) = normal_erf_standard(x);
    (1.0 - pdf * x / half_erf).sqrt()
}
