// src/initial.rs
//
// Initial particle states for the driver.
//
// Particles start on the Lagrangian lattice q and are displaced in the
// Zel'dovich form x = q + psi(q). The growing-mode momentum that goes with it
// is p = a^2 E(a) f(a) psi with f = Omega_m(a)^0.55, which is what the drift
// (dx/da = p / (a^3 E)) needs to keep the displacement on the growing mode.
//
// psi is stored in DX1 when the store carries it.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::cosmology::Cosmology;
use crate::error::{PmError, Result};
use crate::grid::wrap_position;
use crate::particles::{AttrMask, ParticleStore};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InitialCondition {
    /// Unperturbed lattice.
    #[default]
    Lattice,
    /// psi_x = amplitude * sin(2 pi mode q_x / L); psi_y = psi_z = 0.
    PlaneWave { amplitude: f64, mode: usize },
    /// Each component uniform in [-amplitude, amplitude], drawn per particle id.
    Noise { amplitude: f64 },
}

impl InitialCondition {
    pub fn validate(&self) -> Result<()> {
        match *self {
            InitialCondition::Lattice => Ok(()),
            InitialCondition::PlaneWave { amplitude, mode } => {
                if mode == 0 {
                    return Err(PmError::config("plane wave mode must be at least 1"));
                }
                if !amplitude.is_finite() {
                    return Err(PmError::config("plane wave amplitude must be finite"));
                }
                Ok(())
            }
            InitialCondition::Noise { amplitude } => {
                if !(amplitude.is_finite() && amplitude >= 0.0) {
                    return Err(PmError::config("noise amplitude must be finite and >= 0"));
                }
                Ok(())
            }
        }
    }

    fn displacement(&self, q: &[f64; 3], id: u64, box_size: f64, seed: u64) -> [f64; 3] {
        match *self {
            InitialCondition::Lattice => [0.0; 3],
            InitialCondition::PlaneWave { amplitude, mode } => {
                let phase = 2.0 * PI * mode as f64 * q[0] / box_size;
                [amplitude * phase.sin(), 0.0, 0.0]
            }
            InitialCondition::Noise { amplitude } => {
                let mut rng = XorShift64::new(seed ^ id.wrapping_mul(0x9E37_79B9_7F4A_7C15));
                let mut d = [0.0; 3];
                for c in d.iter_mut() {
                    *c = amplitude * (rng.next_f64() * 2.0 - 1.0);
                }
                d
            }
        }
    }
}

/// Displace the owned particles of a freshly laid lattice and give them
/// growing-mode momenta at scale factor `a`.
pub fn apply_initial_condition(
    store: &mut ParticleStore,
    ic: &InitialCondition,
    box_size: f64,
    cosmology: &Cosmology,
    a: f64,
    seed: u64,
) -> Result<()> {
    ic.validate()?;
    if !store.has(AttrMask::POS | AttrMask::ID) {
        return Err(PmError::config("initial conditions need positions and ids"));
    }
    let growth_rate = cosmology.omega_m_a(a).powf(0.55);
    let p_factor = a * a * cosmology.hubble_ea(a) * growth_rate;
    let has_vel = store.has(AttrMask::VEL);
    let has_dx1 = store.has(AttrMask::DX1);

    for i in 0..store.np {
        let psi = ic.displacement(&store.x[i], store.id[i], box_size, seed);
        for d in 0..3 {
            store.x[i][d] = wrap_position(store.x[i][d] + psi[d], box_size);
            if has_vel {
                store.v[i][d] = p_factor * psi[d];
            }
            if has_dx1 {
                store.dx1[i][d] = psi[d];
            }
        }
    }
    Ok(())
}

// ---------------------------
// Small deterministic RNG
// ---------------------------

#[derive(Debug, Clone)]
pub struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    pub fn new(seed: u64) -> Self {
        let s = if seed == 0 { 0x9E3779B97F4A7C15 } else { seed };
        Self { state: s }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    /// Top 53 bits mapped to [0, 1).
    pub fn next_f64(&mut self) -> f64 {
        let u = self.next_u64() >> 11;
        (u as f64) * (1.0 / ((1u64 << 53) as f64))
    }
}
