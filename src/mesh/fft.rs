// src/mesh/fft.rs
//
// Slab-decomposed 3D real-to-complex transform.
//
// Forward:  z rows (keep nz2 modes) -> y columns -> all-to-all transpose from
//           x-slabs to y-slabs -> x columns.
// Inverse:  the same steps in reverse, rebuilding the full z spectrum from the
//           stored half through Hermitian symmetry before the last 1D pass.
//
// Columns are made contiguous by a local transpose, then processed in parallel
// over rows of the scratch buffer.

use std::sync::Arc;

use rayon::prelude::*;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use super::ParticleMesh;
use crate::comm::Communicator;
use crate::grid::SlabRange;

pub(crate) struct FftPlans {
    forward: Arc<dyn Fft<f64>>,
    inverse: Arc<dyn Fft<f64>>,
}

impl FftPlans {
    pub(crate) fn new(n: usize) -> Self {
        let mut planner = FftPlanner::<f64>::new();
        Self {
            forward: planner.plan_fft_forward(n),
            inverse: planner.plan_fft_inverse(n),
        }
    }
}

pub(super) fn r2c<C: Communicator>(
    mesh: &ParticleMesh<C>,
    real: &[f64],
    complex: &mut [Complex<f64>],
) {
    let n = mesh.nmesh();
    let nz2 = mesh.nz2();
    let xr = mesh.x_region();
    let lx = xr.len();
    let comm = mesh.comm();
    let plans = mesh.plans();
    assert_eq!(real.len(), mesh.real_len(), "r2c: real buffer has wrong size");
    assert_eq!(complex.len(), mesh.complex_len(), "r2c: complex buffer has wrong size");

    // 1) z rows: half[(ixl*n + iy)*nz2 + kz]
    let mut half = vec![Complex::new(0.0, 0.0); lx * n * nz2];
    half.par_chunks_mut(nz2)
        .zip(real.par_chunks(n))
        .for_each_init(
            || vec![Complex::new(0.0, 0.0); n],
            |row, (out, src)| {
                for (r, &s) in row.iter_mut().zip(src) {
                    *r = Complex::new(s, 0.0);
                }
                plans.forward.process(row);
                out.copy_from_slice(&row[..nz2]);
            },
        );

    // 2) y columns, made contiguous: cols[(ixl*nz2 + kz)*n + ky]
    let mut cols = vec![Complex::new(0.0, 0.0); lx * nz2 * n];
    {
        let half_ro: &[Complex<f64>] = &half;
        cols.par_chunks_mut(n).enumerate().for_each(|(c, col)| {
            let ixl = c / nz2;
            let kz = c % nz2;
            for iy in 0..n {
                col[iy] = half_ro[(ixl * n + iy) * nz2 + kz];
            }
            plans.forward.process(col);
        });
    }
    drop(half);

    // 3) x-slabs -> y-slabs. Message to rank r is ordered (ixl, kyl, kz).
    let size = comm.size();
    let send: Vec<Vec<Complex<f64>>> = (0..size)
        .map(|r| {
            let yr = SlabRange::split(n, size, r);
            let mut buf = Vec::with_capacity(lx * yr.len() * nz2);
            for ixl in 0..lx {
                for ky in yr.start..yr.end {
                    for kz in 0..nz2 {
                        buf.push(cols[(ixl * nz2 + kz) * n + ky]);
                    }
                }
            }
            buf
        })
        .collect();
    drop(cols);
    let recv = comm.all_to_all(send);

    let yr = mesh.y_region();
    let ly = yr.len();
    for (src, buf) in recv.iter().enumerate() {
        let sx = SlabRange::split(n, size, src);
        let mut it = buf.iter();
        for ix in sx.start..sx.end {
            for kyl in 0..ly {
                let base = (kyl * n + ix) * nz2;
                for (dst, v) in complex[base..base + nz2].iter_mut().zip(&mut it) {
                    *dst = *v;
                }
            }
        }
    }

    // 4) x columns
    transform_x_columns(complex, n, nz2, ly, &plans.forward);
}

pub(super) fn c2r<C: Communicator>(
    mesh: &ParticleMesh<C>,
    complex: &mut [Complex<f64>],
    real: &mut [f64],
) {
    let n = mesh.nmesh();
    let nz2 = mesh.nz2();
    let yr = mesh.y_region();
    let ly = yr.len();
    let lx = mesh.x_region().len();
    let comm = mesh.comm();
    let plans = mesh.plans();
    assert_eq!(real.len(), mesh.real_len(), "c2r: real buffer has wrong size");
    assert_eq!(complex.len(), mesh.complex_len(), "c2r: complex buffer has wrong size");

    // 1) x columns: complex now holds (kyl, ix, kz)
    transform_x_columns(complex, n, nz2, ly, &plans.inverse);

    // 2) y-slabs -> x-slabs. Message to rank r is ordered (kyl, ixl, kz).
    let size = comm.size();
    let send: Vec<Vec<Complex<f64>>> = (0..size)
        .map(|r| {
            let xr = SlabRange::split(n, size, r);
            let mut buf = Vec::with_capacity(ly * xr.len() * nz2);
            for kyl in 0..ly {
                for ix in xr.start..xr.end {
                    let base = (kyl * n + ix) * nz2;
                    buf.extend_from_slice(&complex[base..base + nz2]);
                }
            }
            buf
        })
        .collect();
    let recv = comm.all_to_all(send);

    // cols[(ixl*nz2 + kz)*n + ky]
    let mut cols = vec![Complex::new(0.0, 0.0); lx * nz2 * n];
    for (src, buf) in recv.iter().enumerate() {
        let sy = SlabRange::split(n, size, src);
        let mut it = buf.iter();
        for ky in sy.start..sy.end {
            for ixl in 0..lx {
                for kz in 0..nz2 {
                    if let Some(v) = it.next() {
                        cols[(ixl * nz2 + kz) * n + ky] = *v;
                    }
                }
            }
        }
    }

    // 3) y columns
    cols.par_chunks_mut(n).for_each(|col| plans.inverse.process(col));

    // 4) z rows from the stored half spectrum
    let cols_ro: &[Complex<f64>] = &cols;
    real.par_chunks_mut(n).enumerate().for_each_init(
        || vec![Complex::new(0.0, 0.0); n],
        |row, (r, out)| {
            let ixl = r / n;
            let iy = r % n;
            for kz in 0..nz2 {
                row[kz] = cols_ro[(ixl * nz2 + kz) * n + iy];
            }
            for kz in nz2..n {
                row[kz] = row[n - kz].conj();
            }
            plans.inverse.process(row);
            for (o, v) in out.iter_mut().zip(row.iter()) {
                *o = v.re;
            }
        },
    );
}

/// 1D transforms along x of a y-slab laid out as [(kyl*n + ix)*nz2 + kz].
fn transform_x_columns(
    data: &mut [Complex<f64>],
    n: usize,
    nz2: usize,
    ly: usize,
    fft: &Arc<dyn Fft<f64>>,
) {
    let total = ly * n * nz2;
    if total == 0 {
        return;
    }

    // Transpose: tmp[(kyl*nz2 + kz)*n + ix] = data[(kyl*n + ix)*nz2 + kz]
    let mut tmp = vec![Complex::new(0.0, 0.0); total];
    {
        let data_ro: &[Complex<f64>] = &*data;
        tmp.par_chunks_mut(n).enumerate().for_each(|(c, col)| {
            let kyl = c / nz2;
            let kz = c % nz2;
            for ix in 0..n {
                col[ix] = data_ro[(kyl * n + ix) * nz2 + kz];
            }
            fft.process(col);
        });
    }

    // Transpose back (parallel over x rows)
    let tmp_ro: &[Complex<f64>] = &tmp;
    data.par_chunks_mut(nz2).enumerate().for_each(|(r, row)| {
        let kyl = r / n;
        let ix = r % n;
        for kz in 0..nz2 {
            row[kz] = tmp_ro[(kyl * nz2 + kz) * n + ix];
        }
    });
}
