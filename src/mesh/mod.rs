// src/mesh/mod.rs
//
// Distributed Fourier mesh.
//
// Real space is split into x-slabs, one per rank. After the forward transform
// the complex field is transposed into y-slabs and only the half space
// kz in [0, n/2] is stored (the field is real).
//
// Layouts (n = Nmesh, nz2 = n/2 + 1):
//   real    : [(ix - x0) * n + iy] * n + iz          ix in x_region
//   complex : [(iy - y0) * n + ix] * nz2 + kz        iy in y_region
//
// Both transforms are unnormalised: c2r(r2c(f)) = Norm * f with Norm = n^3.

pub mod fft;
pub mod kernels;

use rustfft::num_complex::Complex;

use crate::comm::Communicator;
use crate::error::{PmError, Result};
use crate::grid::{slab_owner, Grid3D, SlabRange};

use self::fft::FftPlans;

/// Per-axis wavevector tables indexed by mesh index `0..n`.
#[derive(Debug, Clone)]
pub struct KFactors {
    /// k
    pub k: Vec<f64>,
    /// k^2
    pub kk: Vec<f64>,
    /// Finite-difference gradient sin(k h) / h.
    pub k_finite: Vec<f64>,
    /// Finite-difference Laplacian k^2 sinc^2(k h / 2).
    pub kk_finite: Vec<f64>,
    /// CIC aliasing correction 1 - 2/3 sin^2(k h / 2).
    pub cic: Vec<f64>,
    /// CIC window sinc^2(k h / 2).
    pub window: Vec<f64>,
}

#[inline]
fn sinc_unnormed(x: f64) -> f64 {
    if x.abs() < 1e-5 {
        let x2 = x * x;
        1.0 - x2 / 6.0 + x2 * x2 / 120.0
    } else {
        x.sin() / x
    }
}

impl KFactors {
    pub fn new(grid: &Grid3D) -> Self {
        let n = grid.n;
        let h = grid.cell_size();
        let k0 = grid.k0();

        let mut f = KFactors {
            k: Vec::with_capacity(n),
            kk: Vec::with_capacity(n),
            k_finite: Vec::with_capacity(n),
            kk_finite: Vec::with_capacity(n),
            cic: Vec::with_capacity(n),
            window: Vec::with_capacity(n),
        };

        for i in 0..n {
            // the even-n Nyquist index maps to -n/2
            let signed = if i < (n + 1) / 2 { i as f64 } else { i as f64 - n as f64 };
            let k = signed * k0;
            let w = k * h;
            let ff = sinc_unnormed(0.5 * w);
            let s = (0.5 * w).sin();
            f.k.push(k);
            f.kk.push(k * k);
            f.k_finite.push(w.sin() / h);
            f.kk_finite.push(k * k * ff * ff);
            f.cic.push(1.0 - 2.0 / 3.0 * s * s);
            f.window.push(ff * ff);
        }
        f
    }
}

/// Cloud-in-cell stencil along one axis: two cells and their weights.
#[inline]
fn cic_axis(grid: &Grid3D, x: f64) -> ([usize; 2], [f64; 2]) {
    let u = x / grid.cell_size();
    let i0 = u.floor();
    let f = u - i0;
    let i0 = i0 as isize;
    (
        [grid.wrap_index(i0), grid.wrap_index(i0 + 1)],
        [1.0 - f, f],
    )
}

pub struct ParticleMesh<C: Communicator> {
    grid: Grid3D,
    comm: C,
    x_region: SlabRange,
    y_region: SlabRange,
    kfac: KFactors,
    plans: FftPlans,
}

impl<C: Communicator> ParticleMesh<C> {
    pub fn new(nmesh: usize, box_size: f64, comm: &C) -> Result<Self> {
        if nmesh < 2 {
            return Err(PmError::config(format!("Nmesh must be >= 2, got {}", nmesh)));
        }
        if !(box_size > 0.0) {
            return Err(PmError::config(format!(
                "BoxSize must be positive, got {}",
                box_size
            )));
        }
        if comm.size() > nmesh {
            return Err(PmError::config(format!(
                "{} ranks cannot share a mesh of {} slabs",
                comm.size(),
                nmesh
            )));
        }

        let grid = Grid3D::new(nmesh, box_size);
        Ok(Self {
            grid,
            comm: comm.clone(),
            x_region: SlabRange::split(nmesh, comm.size(), comm.rank()),
            y_region: SlabRange::split(nmesh, comm.size(), comm.rank()),
            kfac: KFactors::new(&grid),
            plans: FftPlans::new(nmesh),
        })
    }

    #[inline]
    pub fn grid(&self) -> &Grid3D {
        &self.grid
    }

    #[inline]
    pub fn comm(&self) -> &C {
        &self.comm
    }

    #[inline]
    pub fn nmesh(&self) -> usize {
        self.grid.n
    }

    #[inline]
    pub fn box_size(&self) -> f64 {
        self.grid.box_size
    }

    pub fn volume(&self) -> f64 {
        self.grid.volume()
    }

    /// Transform normalisation, the number of mesh points.
    pub fn norm(&self) -> f64 {
        self.grid.n_cells() as f64
    }

    /// Real-space x range owned by this rank.
    #[inline]
    pub fn x_region(&self) -> SlabRange {
        self.x_region
    }

    /// Complex-space y range owned by this rank.
    #[inline]
    pub fn y_region(&self) -> SlabRange {
        self.y_region
    }

    /// Stored kz modes per (x, y) row.
    #[inline]
    pub fn nz2(&self) -> usize {
        self.grid.n / 2 + 1
    }

    pub fn real_len(&self) -> usize {
        self.x_region.len() * self.grid.n * self.grid.n
    }

    pub fn complex_len(&self) -> usize {
        self.y_region.len() * self.grid.n * self.nz2()
    }

    #[inline]
    pub fn k_factors(&self) -> &KFactors {
        &self.kfac
    }

    pub(crate) fn plans(&self) -> &FftPlans {
        &self.plans
    }

    /// Rank owning the x-slab of real-space mesh index `ix`.
    #[inline]
    pub fn slab_rank(&self, ix: usize) -> usize {
        slab_owner(self.grid.n, self.comm.size(), ix)
    }

    /// Rank owning the mesh cell that contains `pos`.
    #[inline]
    pub fn pos_to_rank(&self, pos: &[f64; 3]) -> usize {
        self.slab_rank(self.grid.cell_of(pos[0]))
    }

    /// Ranks other than this one whose cells the CIC stencil of `pos` touches.
    pub fn stencil_ranks(&self, pos: &[f64; 3]) -> impl Iterator<Item = usize> {
        let (cells, _) = cic_axis(&self.grid, pos[0]);
        let me = self.comm.rank();
        let a = self.slab_rank(cells[0]);
        let b = self.slab_rank(cells[1]);
        let first = (a != me).then_some(a);
        let second = (b != me && b != a).then_some(b);
        first.into_iter().chain(second)
    }

    #[inline]
    fn real_index(&self, ix: usize, iy: usize, iz: usize) -> usize {
        let n = self.grid.n;
        ((ix - self.x_region.start) * n + iy) * n + iz
    }

    /// Deposit unit mass per position onto the local cells (CIC).
    /// Stencil cells outside this rank's slab are skipped; ghosts supply them.
    pub fn paint(&self, real: &mut [f64], positions: &[[f64; 3]]) {
        debug_assert_eq!(real.len(), self.real_len());
        for pos in positions {
            let (cx, wx) = cic_axis(&self.grid, pos[0]);
            let (cy, wy) = cic_axis(&self.grid, pos[1]);
            let (cz, wz) = cic_axis(&self.grid, pos[2]);
            for a in 0..2 {
                if !self.x_region.contains(cx[a]) {
                    continue;
                }
                for b in 0..2 {
                    for c in 0..2 {
                        let idx = self.real_index(cx[a], cy[b], cz[c]);
                        real[idx] += wx[a] * wy[b] * wz[c];
                    }
                }
            }
        }
    }

    /// CIC interpolation of `real` at `pos`, using local cells only.
    pub fn readout(&self, real: &[f64], pos: &[f64; 3]) -> f64 {
        let (cx, wx) = cic_axis(&self.grid, pos[0]);
        let (cy, wy) = cic_axis(&self.grid, pos[1]);
        let (cz, wz) = cic_axis(&self.grid, pos[2]);
        let mut value = 0.0;
        for a in 0..2 {
            if !self.x_region.contains(cx[a]) {
                continue;
            }
            for b in 0..2 {
                for c in 0..2 {
                    value += wx[a] * wy[b] * wz[c] * real[self.real_index(cx[a], cy[b], cz[c])];
                }
            }
        }
        value
    }

    /// Forward transform of this rank's real slab (collective).
    pub fn r2c(&self, real: &[f64], complex: &mut [Complex<f64>]) {
        fft::r2c(self, real, complex);
    }

    /// Inverse transform; `complex` is used as scratch and left unspecified.
    pub fn c2r(&self, complex: &mut [Complex<f64>], real: &mut [f64]) {
        fft::c2r(self, complex, real);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{LocalWorld, SerialComm};

    #[test]
    fn k_factors_vanish_at_origin_and_are_odd() {
        let g = Grid3D::new(8, 100.0);
        let f = KFactors::new(&g);
        assert_eq!(f.k[0], 0.0);
        assert_eq!(f.kk_finite[0], 0.0);
        assert!((f.k_finite[1] + f.k_finite[7]).abs() < 1e-12);
        assert!((f.kk[1] - f.kk[7]).abs() < 1e-12);
        // finite-difference Laplacian never exceeds the continuum one
        for i in 0..8 {
            assert!(f.kk_finite[i] <= f.kk[i] + 1e-12);
        }
    }

    #[test]
    fn paint_conserves_mass_on_one_rank() {
        let mesh = ParticleMesh::new(8, 8.0, &SerialComm).unwrap();
        let mut real = vec![0.0; mesh.real_len()];
        let pos = [[0.3, 7.9, 4.5], [7.99, 0.0, 2.25], [3.5, 3.5, 3.5]];
        mesh.paint(&mut real, &pos);
        let total: f64 = real.iter().sum();
        assert!((total - 3.0).abs() < 1e-12);
    }

    #[test]
    fn readout_of_constant_field_is_constant() {
        let mesh = ParticleMesh::new(6, 3.0, &SerialComm).unwrap();
        let real = vec![2.5; mesh.real_len()];
        for pos in [[0.1, 0.2, 0.3], [2.9, 2.9, 2.9], [1.5, 0.0, 2.0]] {
            assert!((mesh.readout(&real, &pos) - 2.5).abs() < 1e-12);
        }
    }

    #[test]
    fn stencil_crossing_slab_edge_reports_neighbour() {
        let out = LocalWorld::run(2, |comm| {
            let mesh = ParticleMesh::new(8, 8.0, &comm).unwrap();
            // cell 3 belongs to rank 0; its upper CIC neighbour cell 4 to rank 1
            let edge: Vec<usize> = mesh.stencil_ranks(&[3.5, 1.0, 1.0]).collect();
            // cell 7 wraps onto cell 0
            let wrap: Vec<usize> = mesh.stencil_ranks(&[7.5, 1.0, 1.0]).collect();
            let inner: Vec<usize> = mesh.stencil_ranks(&[1.5, 1.0, 1.0]).collect();
            (comm.rank(), edge, wrap, inner)
        })
        .unwrap();
        for (rank, edge, wrap, inner) in out {
            if rank == 0 {
                assert_eq!(edge, vec![1]);
                assert_eq!(wrap, vec![1]);
                assert!(inner.is_empty());
            } else {
                assert_eq!(edge, vec![0]);
                assert_eq!(wrap, vec![0]);
                assert_eq!(inner, vec![0]);
            }
        }
    }

    #[test]
    fn too_many_ranks_is_a_config_error() {
        let out = LocalWorld::run(3, |comm| ParticleMesh::new(2, 1.0, &comm).is_err()).unwrap();
        assert!(out.iter().all(|&e| e));
    }
}
