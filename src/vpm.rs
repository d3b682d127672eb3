// src/vpm.rs
//
// Variable-resolution particle mesh: one mesh per activation scale factor.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::comm::Communicator;
use crate::error::{PmError, Result};
use crate::force::MeshBuffers;
use crate::mesh::ParticleMesh;

/// Mesh `nc * pm_nc_factor` per side becomes active at `a_start`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VpmInit {
    pub a_start: f64,
    pub pm_nc_factor: usize,
}

pub struct MeshLevel<C: Communicator> {
    pub a_start: f64,
    pub pm_nc_factor: usize,
    pub mesh: ParticleMesh<C>,
    pub buffers: MeshBuffers,
}

impl<C: Communicator> MeshLevel<C> {
    /// Particles per mesh cell is 1 / density_factor for a uniform lattice.
    pub fn density_factor(&self) -> f64 {
        let f = self.pm_nc_factor as f64;
        f * f * f
    }
}

/// Index of the last entry with `a_start <= a`.
pub fn find_level(inits: &[VpmInit], a: f64) -> Option<usize> {
    inits.iter().rposition(|v| v.a_start <= a)
}

pub struct MeshSelector<C: Communicator> {
    levels: Vec<MeshLevel<C>>,
}

impl<C: Communicator> MeshSelector<C> {
    pub fn new(
        inits: &[VpmInit],
        nc: usize,
        box_size: f64,
        comm: &C,
        a_initial: f64,
    ) -> Result<Self> {
        let first = inits
            .first()
            .ok_or_else(|| PmError::config("mesh schedule (vpm) is empty"))?;
        if first.a_start > a_initial {
            return Err(PmError::config(format!(
                "mesh schedule starts at a = {} but the run starts at a = {}",
                first.a_start, a_initial
            )));
        }
        for w in inits.windows(2) {
            if w[1].a_start <= w[0].a_start {
                return Err(PmError::config("mesh schedule a_start must be increasing"));
            }
            if w[1].pm_nc_factor < w[0].pm_nc_factor {
                return Err(PmError::config(
                    "mesh schedule pm_nc_factor must not decrease",
                ));
            }
        }
        if inits.iter().any(|v| v.pm_nc_factor == 0) {
            return Err(PmError::config("pm_nc_factor must be at least 1"));
        }

        let mut levels = Vec::with_capacity(inits.len());
        for init in inits {
            let nmesh = nc * init.pm_nc_factor;
            let mesh = ParticleMesh::new(nmesh, box_size, comm)?;
            let buffers = MeshBuffers::new(&mesh);
            debug!(
                "mesh level a_start={} Nmesh={} local slab {:?}",
                init.a_start,
                nmesh,
                mesh.x_region()
            );
            levels.push(MeshLevel {
                a_start: init.a_start,
                pm_nc_factor: init.pm_nc_factor,
                mesh,
                buffers,
            });
        }
        Ok(Self { levels })
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    fn index(&self, a: f64) -> usize {
        // Construction guarantees the first level covers the whole run.
        self.levels
            .iter()
            .rposition(|l| l.a_start <= a)
            .unwrap_or(0)
    }

    pub fn select(&self, a: f64) -> &MeshLevel<C> {
        &self.levels[self.index(a)]
    }

    pub fn select_mut(&mut self, a: f64) -> &mut MeshLevel<C> {
        let i = self.index(a);
        &mut self.levels[i]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SerialComm;

    fn vpm(pairs: &[(f64, usize)]) -> Vec<VpmInit> {
        pairs
            .iter()
            .map(|&(a_start, pm_nc_factor)| VpmInit {
                a_start,
                pm_nc_factor,
            })
            .collect()
    }

    #[test]
    fn step_function_of_scale_factor() {
        let inits = vpm(&[(0.0, 1), (0.5, 2), (0.8, 3)]);
        assert_eq!(find_level(&inits, 0.1), Some(0));
        assert_eq!(find_level(&inits, 0.5), Some(1));
        assert_eq!(find_level(&inits, 0.79), Some(1));
        assert_eq!(find_level(&inits, 1.0), Some(2));
        assert_eq!(find_level(&inits[1..], 0.1), None);
    }

    #[test]
    fn selector_builds_one_mesh_per_level() {
        let inits = vpm(&[(0.1, 1), (0.5, 2)]);
        let sel = MeshSelector::new(&inits, 4, 10.0, &SerialComm, 0.1).unwrap();
        assert_eq!(sel.len(), 2);
        assert_eq!(sel.select(0.2).mesh.nmesh(), 4);
        assert_eq!(sel.select(0.6).mesh.nmesh(), 8);
        assert_eq!(sel.select(0.6).density_factor(), 8.0);
    }

    #[test]
    fn selector_rejects_uncovered_start_and_bad_order() {
        let late = vpm(&[(0.2, 1)]);
        assert!(MeshSelector::new(&late, 4, 1.0, &SerialComm, 0.1).is_err());
        let unordered = vpm(&[(0.0, 1), (0.0, 2)]);
        assert!(MeshSelector::new(&unordered, 4, 1.0, &SerialComm, 0.1).is_err());
        let shrinking = vpm(&[(0.0, 2), (0.5, 1)]);
        assert!(MeshSelector::new(&shrinking, 4, 1.0, &SerialComm, 0.1).is_err());
        assert!(MeshSelector::new(&[], 4, 1.0, &SerialComm, 0.1).is_err());
    }
}
