// src/alloc.rs
//
// Per-rank particle buffer sizing.
//
// A rank's occupancy fluctuates with the density contrast on the scale of its
// sub-volume. Treating that contrast as Gaussian with variance sigma^2, the
// buffer overflows when the contrast exceeds factor - 1.

use std::f64::consts::PI;

use tracing::info;

use crate::error::{PmError, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AllocEstimate {
    pub factor: f64,
    pub sigma: f64,
    /// Probability that at least one rank overruns at `factor`.
    pub overrun_probability: f64,
}

/// Smallest factor on the 1.001 * 1.01^k ladder whose job-wide overrun
/// probability is below `failure_rate`.
///
/// `sigma2(r)` is the density variance smoothed at radius `r`; `volume` is the
/// mean sub-volume of one rank.
pub fn estimate_alloc_factor<F>(
    volume: f64,
    ntask: usize,
    failure_rate: f64,
    sigma2: F,
) -> Result<AllocEstimate>
where
    F: Fn(f64) -> f64,
{
    if ntask == 0 {
        return Err(PmError::config("alloc estimate needs at least one rank"));
    }
    if !(failure_rate > 0.0 && failure_rate < 1.0) {
        return Err(PmError::config(format!(
            "failure_rate must lie in (0, 1), got {}",
            failure_rate
        )));
    }
    if !(volume > 0.0) {
        return Err(PmError::config(format!(
            "alloc estimate volume must be positive, got {}",
            volume
        )));
    }

    let r = (4.0 * PI / 3.0 * volume).cbrt();
    let s2 = sigma2(r);
    if !(s2.is_finite() && s2 >= 0.0) {
        return Err(PmError::config(format!(
            "density variance at R = {} is not usable: {}",
            r, s2
        )));
    }
    let sigma = s2.sqrt();

    let mut factor = 1.001;
    let overrun_probability = loop {
        let x = factor - 1.0;
        let p = libm::erfc(x / std::f64::consts::SQRT_2 / sigma);
        // 1 - (1 - p)^N without cancellation at small p
        let p_any = -((-p).ln_1p() * ntask as f64).exp_m1();
        if p_any < failure_rate {
            break p_any;
        }
        factor *= 1.01;
    };

    info!(
        "Sigma {:.6} AllocFactor {:.6} Overrun probability {:e}",
        sigma, factor, overrun_probability
    );

    Ok(AllocEstimate {
        factor,
        sigma,
        overrun_probability,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sigma2(r: f64) -> f64 {
        // steep power law, large on small scales
        (8.0 / r).powf(1.2)
    }

    #[test]
    fn rejects_bad_inputs() {
        assert!(estimate_alloc_factor(1.0, 0, 0.01, sigma2).is_err());
        assert!(estimate_alloc_factor(1.0, 4, 0.0, sigma2).is_err());
        assert!(estimate_alloc_factor(1.0, 4, 1.0, sigma2).is_err());
        assert!(estimate_alloc_factor(-1.0, 4, 0.01, sigma2).is_err());
        assert!(estimate_alloc_factor(1.0, 4, 0.01, |_| f64::NAN).is_err());
    }

    #[test]
    fn zero_variance_needs_no_headroom() {
        let e = estimate_alloc_factor(1000.0, 16, 1e-6, |_| 0.0).unwrap();
        assert_eq!(e.factor, 1.001);
    }

    #[test]
    fn stricter_failure_rate_never_shrinks_factor() {
        let v = 1e5;
        let mut last = 0.0;
        for rate in [0.5, 0.1, 1e-2, 1e-4, 1e-8] {
            let e = estimate_alloc_factor(v, 8, rate, sigma2).unwrap();
            assert!(e.factor >= last, "rate {}: {} < {}", rate, e.factor, last);
            assert!(e.overrun_probability < rate);
            last = e.factor;
        }
    }

    #[test]
    fn more_ranks_never_shrink_factor() {
        let v = 1e5;
        let mut last = 0.0;
        for ntask in [1usize, 2, 16, 256, 65536] {
            let e = estimate_alloc_factor(v, ntask, 1e-3, sigma2).unwrap();
            assert!(e.factor >= last, "ntask {}: {} < {}", ntask, e.factor, last);
            last = e.factor;
        }
    }
}
