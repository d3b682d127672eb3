// src/mesh/kernels.rs
//
// Per-mode transfer functions on the local complex slab.
//
// All kernels read `from` and write `to` (both laid out as the y-slab complex
// field of the mesh) and never communicate. The global mode index passed to a
// transfer closure is [kx, ky, kz] with kz in 0..=n/2.

use rayon::prelude::*;
use rustfft::num_complex::Complex;

use super::ParticleMesh;
use crate::comm::Communicator;
use crate::power::PowerSpectrum;

/// Apply `f(mode, value)` to every local mode.
pub fn apply_transfer<C, F>(
    mesh: &ParticleMesh<C>,
    from: &[Complex<f64>],
    to: &mut [Complex<f64>],
    f: F,
) where
    C: Communicator,
    F: Fn([usize; 3], Complex<f64>) -> Complex<f64> + Sync,
{
    let n = mesh.nmesh();
    let nz2 = mesh.nz2();
    let y0 = mesh.y_region().start;
    debug_assert_eq!(from.len(), mesh.complex_len());
    debug_assert_eq!(to.len(), mesh.complex_len());

    to.par_chunks_mut(nz2)
        .zip(from.par_chunks(nz2))
        .enumerate()
        .for_each(|(r, (dst, src))| {
            let ky = y0 + r / n;
            let kx = r % n;
            for kz in 0..nz2 {
                dst[kz] = f([kx, ky, kz], src[kz]);
            }
        });
}

/// Fourier-space force along `axis`: value * (-i k_axis / k^2) using the
/// finite-difference forms. Modes with k^2 <= 0 are zeroed.
pub fn apply_force_kernel<C: Communicator>(
    mesh: &ParticleMesh<C>,
    from: &[Complex<f64>],
    to: &mut [Complex<f64>],
    axis: usize,
) {
    let fac = mesh.k_factors();
    apply_transfer(mesh, from, to, |i, v| {
        let kk = fac.kk_finite[i[0]] + fac.kk_finite[i[1]] + fac.kk_finite[i[2]];
        if kk > 0.0 {
            let s = fac.k_finite[i[axis]] / kk;
            Complex::new(v.im * s, -v.re * s)
        } else {
            Complex::new(0.0, 0.0)
        }
    });
}

/// Gaussian low-pass exp(-k^2 r_s^2 / 2). The mean mode is zeroed.
pub fn apply_smoothing_kernel<C: Communicator>(
    mesh: &ParticleMesh<C>,
    from: &[Complex<f64>],
    to: &mut [Complex<f64>],
    r_s: f64,
) {
    let fac = mesh.k_factors();
    apply_transfer(mesh, from, to, |i, v| {
        let kk = fac.kk[i[0]] + fac.kk[i[1]] + fac.kk[i[2]];
        if kk > 0.0 {
            v * (-0.5 * kk * r_s * r_s).exp()
        } else {
            Complex::new(0.0, 0.0)
        }
    });
}

/// Sharp cut: keep modes with k^2 <= k_th^2.
pub fn apply_lowpass_kernel<C: Communicator>(
    mesh: &ParticleMesh<C>,
    from: &[Complex<f64>],
    to: &mut [Complex<f64>],
    k_th: f64,
) {
    let fac = mesh.k_factors();
    let k2 = k_th * k_th;
    apply_transfer(mesh, from, to, |i, v| {
        let kk = fac.kk[i[0]] + fac.kk[i[1]] + fac.kk[i[2]];
        if kk <= k2 {
            v
        } else {
            Complex::new(0.0, 0.0)
        }
    });
}

/// Finite-difference derivative along `axis`: value * i k_finite.
pub fn apply_diff_kernel<C: Communicator>(
    mesh: &ParticleMesh<C>,
    from: &[Complex<f64>],
    to: &mut [Complex<f64>],
    axis: usize,
) {
    let fac = mesh.k_factors();
    apply_transfer(mesh, from, to, |i, v| {
        let k = fac.k_finite[i[axis]];
        Complex::new(-v.im * k, v.re * k)
    });
}

/// Deconvolve the CIC window, dividing by the product of sinc^2(k h / 2).
pub fn apply_decic_kernel<C: Communicator>(
    mesh: &ParticleMesh<C>,
    from: &[Complex<f64>],
    to: &mut [Complex<f64>],
) {
    let fac = mesh.k_factors();
    apply_transfer(mesh, from, to, |i, v| {
        let w = fac.window[i[0]] * fac.window[i[1]] * fac.window[i[2]];
        v / w
    });
}

/// Accumulate |delta_k|^2 into radial bins of width k0 (rank-local; the
/// caller reduces and normalises).
///
/// Each stored kz mode stands for itself and its conjugate at -kz, except the
/// planes kz = 0 and, for even n, kz = n/2, which are their own partners.
/// Counting the kz = n/2 plane once keeps the weighted total at n^3. With
/// `PowerSpectrum::for_mesh` sizing that plane lies at |k| >= (n/2) k0, past
/// the last bin, so the published spectrum is the same either way.
pub fn bin_power_spectrum<C: Communicator>(
    mesh: &ParticleMesh<C>,
    field: &[Complex<f64>],
    ps: &mut PowerSpectrum,
) {
    let n = mesh.nmesh();
    let nz2 = mesh.nz2();
    let y0 = mesh.y_region().start;
    let k0 = mesh.grid().k0();
    let fac = mesh.k_factors();
    let size = ps.len();
    let nyquist = if n % 2 == 0 { Some(n / 2) } else { None };

    let (k, p, cnt) = field
        .par_chunks(nz2)
        .enumerate()
        .fold(
            || (vec![0.0; size], vec![0.0; size], vec![0.0; size]),
            |(mut k, mut p, mut cnt), (r, row)| {
                let ky = y0 + r / n;
                let kx = r % n;
                let kk_xy = fac.kk[kx] + fac.kk[ky];
                for (kz, v) in row.iter().enumerate() {
                    let kmag = (kk_xy + fac.kk[kz]).sqrt();
                    let bin = (kmag / k0).floor() as usize;
                    if bin >= size {
                        continue;
                    }
                    let w = if kz == 0 || Some(kz) == nyquist { 1.0 } else { 2.0 };
                    k[bin] += w * kmag;
                    p[bin] += w * v.norm_sqr();
                    cnt[bin] += w;
                }
                (k, p, cnt)
            },
        )
        .reduce(
            || (vec![0.0; size], vec![0.0; size], vec![0.0; size]),
            |(mut k1, mut p1, mut c1), (k2, p2, c2)| {
                for b in 0..size {
                    k1[b] += k2[b];
                    p1[b] += p2[b];
                    c1[b] += c2[b];
                }
                (k1, p1, c1)
            },
        );

    for b in 0..size {
        ps.k[b] += k[b];
        ps.p[b] += p[b];
        ps.n[b] += cnt[b];
    }
}
