// src/stepping.rs
//
// Leapfrog time stepping in scale factor.
//
// Positions live at a_x, velocities at a_v; the offset is never collapsed.
// The schedule places a_v half a step (geometric mean) behind a_x.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::cosmology::Cosmology;
use crate::error::{PmError, Result};
use crate::particles::{AttrMask, ParticleStore};

/// Whether particle-mesh forces are evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForceMode {
    #[default]
    Pm,
    Off,
}

impl ForceMode {
    #[inline]
    pub fn uses_pm(self) -> bool {
        self == ForceMode::Pm
    }
}

/// Drift and kick interval of one step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepWindow {
    pub a_x: f64,
    pub a_x1: f64,
    pub a_v: f64,
    pub a_v1: f64,
}

#[derive(Debug, Clone)]
pub struct StepSchedule {
    times: Vec<f64>,
}

impl StepSchedule {
    pub fn new(times: Vec<f64>) -> Result<Self> {
        if times.is_empty() {
            return Err(PmError::config("time_step list is empty"));
        }
        if times.iter().any(|&a| !(a > 0.0)) {
            return Err(PmError::config("time_step entries must be positive"));
        }
        if times.windows(2).any(|w| w[1] <= w[0]) {
            return Err(PmError::config("time_step must be strictly increasing"));
        }
        Ok(Self { times })
    }

    pub fn nsteps(&self) -> usize {
        self.times.len()
    }

    pub fn a_initial(&self) -> f64 {
        self.times[0]
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn window(&self, i: usize) -> StepWindow {
        let t = &self.times;
        let last = t.len() - 1;
        let a_x = t[i];
        let a_x1 = if i < last { t[i + 1] } else { t[i] };
        let a_v = if i == 0 { t[0] } else { (t[i - 1] * t[i]).sqrt() };
        let a_v1 = if i < last { (t[i] * t[i + 1]).sqrt() } else { t[i] };
        StepWindow { a_x, a_x1, a_v, a_v1 }
    }
}

/// Kick/drift collaborator of the scheduler.
pub trait Integrator {
    /// Velocities from `a_v` to `a_v1` using accelerations computed at `a_x`.
    fn kick(&mut self, store: &mut ParticleStore, a_v: f64, a_v1: f64, a_x: f64, mode: ForceMode);

    /// Positions from `a_x` to `a_x1` using velocities at `a_v1`.
    fn drift(&mut self, store: &mut ParticleStore, a_x: f64, a_x1: f64, a_v1: f64, mode: ForceMode);

    /// Fill `to` with `from` advanced to `aout` (positions from `a_x`,
    /// velocities from `a_v`). `to` keeps its own attribute mask.
    fn interpolate(
        &self,
        from: &ParticleStore,
        to: &mut ParticleStore,
        aout: f64,
        a_x: f64,
        a_v: f64,
        mode: ForceMode,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct LeapfrogIntegrator {
    pub cosmology: Cosmology,
}

impl LeapfrogIntegrator {
    pub fn new(cosmology: Cosmology) -> Self {
        Self { cosmology }
    }

    /// Velocity change per unit acceleration over [a0, a1].
    fn kick_factor(&self, a0: f64, a1: f64) -> f64 {
        -1.5 * self.cosmology.omega_m * self.cosmology.kick_integral(a0, a1)
    }

    fn drift_factor(&self, a0: f64, a1: f64) -> f64 {
        self.cosmology.drift_integral(a0, a1)
    }
}

impl Integrator for LeapfrogIntegrator {
    fn kick(&mut self, store: &mut ParticleStore, a_v: f64, a_v1: f64, _a_x: f64, mode: ForceMode) {
        if !mode.uses_pm() {
            return;
        }
        let f = self.kick_factor(a_v, a_v1);
        let np = store.np;
        store.v[..np]
            .par_iter_mut()
            .zip(store.acc[..np].par_iter())
            .for_each(|(v, acc)| {
                for d in 0..3 {
                    v[d] += acc[d] * f;
                }
            });
    }

    fn drift(&mut self, store: &mut ParticleStore, a_x: f64, a_x1: f64, _a_v1: f64, _mode: ForceMode) {
        let f = self.drift_factor(a_x, a_x1);
        let np = store.np;
        store.x[..np]
            .par_iter_mut()
            .zip(store.v[..np].par_iter())
            .for_each(|(x, v)| {
                for d in 0..3 {
                    x[d] += v[d] * f;
                }
            });
    }

    fn interpolate(
        &self,
        from: &ParticleStore,
        to: &mut ParticleStore,
        aout: f64,
        a_x: f64,
        a_v: f64,
        mode: ForceMode,
    ) -> Result<()> {
        let kick = if mode.uses_pm() && from.has(AttrMask::ACC) {
            self.kick_factor(a_v, aout)
        } else {
            0.0
        };
        let drift = self.drift_factor(a_x, aout);

        to.clear();
        for i in 0..from.np {
            let mut p = from.get(i);
            for d in 0..3 {
                p.x[d] += p.v[d] * drift;
                p.v[d] += p.acc[d] * kick;
            }
            to.push(p)?;
        }
        Ok(())
    }
}
