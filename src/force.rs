// src/force.rs
//
// Particle-mesh force evaluation.
//
//   ghosts(pos) -> paint -> r2c -> power spectrum
//   for each axis: kernel -> c2r -> readout -> reduce ghosts
//   drop ghosts
//
// `canvas` keeps the transformed density for all three axes; `workspace` is
// overwritten by each axis's kernel and consumed by the inverse transform.

use rayon::prelude::*;
use rustfft::num_complex::Complex;

use crate::comm::Communicator;
use crate::error::{PmError, Result};
use crate::ghosts::{Attribute, Ghosts};
use crate::mesh::kernels::{apply_force_kernel, bin_power_spectrum};
use crate::mesh::ParticleMesh;
use crate::particles::{AttrMask, ParticleStore};
use crate::power::PowerSpectrum;
use crate::walltime::ClockTable;

/// Scratch fields owned by one mesh and reused across force evaluations.
pub struct MeshBuffers {
    pub real: Vec<f64>,
    pub canvas: Vec<Complex<f64>>,
    pub workspace: Vec<Complex<f64>>,
}

impl MeshBuffers {
    pub fn new<C: Communicator>(mesh: &ParticleMesh<C>) -> Self {
        let zero = Complex::new(0.0, 0.0);
        Self {
            real: vec![0.0; mesh.real_len()],
            canvas: vec![zero; mesh.complex_len()],
            workspace: vec![zero; mesh.complex_len()],
        }
    }

    pub fn reset(&mut self) {
        let zero = Complex::new(0.0, 0.0);
        self.real.par_iter_mut().for_each(|v| *v = 0.0);
        self.canvas.par_iter_mut().for_each(|v| *v = zero);
        self.workspace.par_iter_mut().for_each(|v| *v = zero);
    }
}

/// Gravitational acceleration on every owned particle of `store`.
///
/// `store` must already be decomposed onto `mesh`'s slabs. On return `ps`
/// holds the reduced and normalised spectrum of the painted density.
pub fn compute_force<C: Communicator>(
    store: &mut ParticleStore,
    mesh: &ParticleMesh<C>,
    buffers: &mut MeshBuffers,
    density_factor: f64,
    ps: &mut PowerSpectrum,
    clock: &mut ClockTable,
) -> Result<()> {
    compute_force_with(
        store,
        mesh,
        buffers,
        density_factor,
        ps,
        clock,
        apply_force_kernel,
    )
}

/// As `compute_force`, with the per-axis transfer function supplied by the
/// caller: `kernel(mesh, density_k, out_k, axis)`.
pub fn compute_force_with<C, K>(
    store: &mut ParticleStore,
    mesh: &ParticleMesh<C>,
    buffers: &mut MeshBuffers,
    density_factor: f64,
    ps: &mut PowerSpectrum,
    clock: &mut ClockTable,
    kernel: K,
) -> Result<()>
where
    C: Communicator,
    K: Fn(&ParticleMesh<C>, &[Complex<f64>], &mut [Complex<f64>], usize),
{
    if !store.has(AttrMask::POS | AttrMask::ACC) {
        return Err(PmError::config(
            "force evaluation needs positions and accelerations in the store",
        ));
    }
    let comm = mesh.comm();

    buffers.reset();
    clock.measure("/Force/Init");

    let ghosts = Ghosts::append(store, mesh, AttrMask::POS)?;
    clock.measure("/Force/AppendGhosts");

    // Counts particles per cell; at pm_nc_factor > 1 this is below the density
    // and density_factor compensates at readout.
    let len = store.len();
    mesh.paint(&mut buffers.real, &store.x[..len]);
    clock.measure("/Force/Paint");

    mesh.r2c(&buffers.real, &mut buffers.canvas);
    clock.measure("/Force/FFT");

    ps.reset();
    bin_power_spectrum(mesh, &buffers.canvas, ps);
    ps.reduce(comm);
    ps.normalize(mesh.volume(), mesh.norm(), density_factor);
    clock.measure("/Force/PowerSpectrum");

    let scale = density_factor / mesh.norm();
    for d in 0..3 {
        kernel(mesh, &buffers.canvas, &mut buffers.workspace, d);
        clock.measure("/Force/Transfer");

        mesh.c2r(&mut buffers.workspace, &mut buffers.real);
        clock.measure("/Force/FFT");

        let real = &buffers.real;
        store.acc[..len]
            .par_iter_mut()
            .zip(store.x[..len].par_iter())
            .for_each(|(acc, x)| {
                acc[d] = mesh.readout(real, x) * scale;
            });
        clock.measure("/Force/Readout");

        ghosts.reduce(store, Attribute::Acceleration(d), comm)?;
        clock.measure("/Force/ReduceGhosts");
    }

    ghosts.destroy(store);
    comm.barrier();
    clock.measure("/Force/Finish");
    Ok(())
}
