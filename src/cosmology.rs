// src/cosmology.rs

use serde::{Deserialize, Serialize};

/// Flat LambdaCDM background, matter plus a cosmological constant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cosmology {
    pub omega_m: f64,
}

impl Cosmology {
    pub fn new(omega_m: f64) -> Self {
        Self { omega_m }
    }

    pub fn omega_lambda(&self) -> f64 {
        1.0 - self.omega_m
    }

    /// H(a) / H0
    pub fn hubble_ea(&self, a: f64) -> f64 {
        (self.omega_m / (a * a * a) + self.omega_lambda()).sqrt()
    }

    /// Matter density parameter at scale factor `a`.
    pub fn omega_m_a(&self, a: f64) -> f64 {
        let e = self.hubble_ea(a);
        self.omega_m / (a * a * a) / (e * e)
    }

    /// Integral of da / (a^2 E) from `a0` to `a1`; scales accelerations into
    /// velocity changes.
    pub fn kick_integral(&self, a0: f64, a1: f64) -> f64 {
        simpson(|a| 1.0 / (a * a * self.hubble_ea(a)), a0, a1)
    }

    /// Integral of da / (a^3 E) from `a0` to `a1`; scales velocities into
    /// displacements.
    pub fn drift_integral(&self, a0: f64, a1: f64) -> f64 {
        simpson(|a| 1.0 / (a * a * a * self.hubble_ea(a)), a0, a1)
    }
}

fn simpson<F: Fn(f64) -> f64>(f: F, a: f64, b: f64) -> f64 {
    const N: usize = 64;
    if a == b {
        return 0.0;
    }
    let h = (b - a) / N as f64;
    let mut sum = f(a) + f(b);
    for i in 1..N {
        let w = if i % 2 == 1 { 4.0 } else { 2.0 };
        sum += w * f(a + i as f64 * h);
    }
    sum * h / 3.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn einstein_de_sitter_integrals_are_analytic() {
        let c = Cosmology::new(1.0);
        assert_relative_eq!(c.hubble_ea(0.25), 8.0, max_relative = 1e-12);
        assert_relative_eq!(c.omega_m_a(0.3), 1.0, max_relative = 1e-12);
        // E = a^-3/2: da/(a^2 E) = a^-1/2 da
        let k = c.kick_integral(0.25, 1.0);
        assert_relative_eq!(k, 2.0 * (1.0 - 0.5), max_relative = 1e-8);
        // da/(a^3 E) = a^-3/2 da
        let d = c.drift_integral(0.25, 1.0);
        assert_relative_eq!(d, 2.0 * (2.0 - 1.0), max_relative = 1e-6);
    }

    #[test]
    fn integrals_are_antisymmetric() {
        let c = Cosmology::new(0.3);
        assert_eq!(c.kick_integral(0.5, 0.5), 0.0);
        assert_relative_eq!(
            c.drift_integral(0.4, 0.6),
            -c.drift_integral(0.6, 0.4),
            max_relative = 1e-12
        );
    }
}
