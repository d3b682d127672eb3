// src/power.rs
//
// Radially binned power spectrum of the painted density, its text output, and
// a tabulated linear P(k) used for the density variance sigma^2(R).

use std::f64::consts::PI;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::comm::Communicator;
use crate::error::{PmError, Result};

/// Per-bin sums of k, |delta|^2 and mode count. After `normalize` the first
/// two hold bin means and `p` is a physical power.
#[derive(Debug, Clone, PartialEq)]
pub struct PowerSpectrum {
    pub k: Vec<f64>,
    pub p: Vec<f64>,
    pub n: Vec<f64>,
}

impl PowerSpectrum {
    pub fn new(size: usize) -> Self {
        Self {
            k: vec![0.0; size],
            p: vec![0.0; size],
            n: vec![0.0; size],
        }
    }

    /// One bin per fundamental wavenumber up to half the mesh.
    pub fn for_mesh(nmesh: usize) -> Self {
        Self::new(nmesh / 2)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.k.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.k.is_empty()
    }

    pub fn reset(&mut self) {
        self.k.iter_mut().for_each(|v| *v = 0.0);
        self.p.iter_mut().for_each(|v| *v = 0.0);
        self.n.iter_mut().for_each(|v| *v = 0.0);
    }

    /// Sum the bins over every rank of the mesh.
    pub fn reduce<C: Communicator>(&mut self, comm: &C) {
        comm.all_reduce_sum(&mut self.p);
        comm.all_reduce_sum(&mut self.n);
        comm.all_reduce_sum(&mut self.k);
    }

    /// Turn sums into means, then scale p by `volume / norm^2 * density_factor^2`.
    /// Empty bins are left at zero.
    pub fn normalize(&mut self, volume: f64, norm: f64, density_factor: f64) {
        let scale = volume / (norm * norm) * density_factor * density_factor;
        for b in 0..self.len() {
            if self.n[b] > 0.0 {
                self.k[b] /= self.n[b];
                self.p[b] /= self.n[b];
                self.p[b] *= scale;
            } else {
                self.k[b] = 0.0;
                self.p[b] = 0.0;
            }
        }
    }

    /// Write the `# k p N` table followed by the 7-entry metadata block.
    pub fn write_text(&self, path: &Path, volume: f64, ntotal: f64, boxsize: f64) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut w = BufWriter::new(File::create(path)?);
        writeln!(w, "# k p N ")?;
        for b in 0..self.len() {
            writeln!(
                w,
                "{} {} {}",
                format_g(self.k[b]),
                format_g(self.p[b]),
                format_g(self.n[b])
            )?;
        }
        writeln!(w, "# metadata 7")?;
        writeln!(w, "# volume {} float64", format_g(volume))?;
        writeln!(w, "# shotnoise {} float64", format_g(volume / ntotal))?;
        writeln!(w, "# N1 {} int", format_g(ntotal))?;
        writeln!(w, "# N2 {} int", format_g(ntotal))?;
        writeln!(w, "# Lz {} float64", format_g(boxsize))?;
        writeln!(w, "# Lx {} float64", format_g(boxsize))?;
        writeln!(w, "# Ly {} float64", format_g(boxsize))?;
        w.flush()?;
        Ok(())
    }
}

/// `<prefix><seed:05>_<a:.4>.txt`
pub fn power_spectrum_path(prefix: &str, seed: u64, a: f64) -> PathBuf {
    PathBuf::from(format!("{}{:05}_{:.4}.txt", prefix, seed, a))
}

/// C `printf("%g")`: six significant digits, trailing zeros removed, exponent
/// form outside [1e-4, 1e6).
pub fn format_g(x: f64) -> String {
    if x.is_nan() {
        return "nan".to_string();
    }
    if x.is_infinite() {
        return if x > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if x == 0.0 {
        return if x.is_sign_negative() { "-0" } else { "0" }.to_string();
    }

    // rounding to 6 digits can bump the exponent (999999.5 -> 1e+06)
    let sci = format!("{:.5e}", x);
    let (mantissa, exp) = match sci.split_once('e') {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => (sci.as_str(), 0),
    };

    if !(-4..6).contains(&exp) {
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", trim_fraction(mantissa), sign, exp.abs())
    } else {
        let decimals = (5 - exp) as usize;
        trim_fraction(&format!("{:.*}", decimals, x)).to_string()
    }
}

fn trim_fraction(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

/// Linear power spectrum P(k) given as a table, interpolated in log-log space.
#[derive(Debug, Clone)]
pub struct TabulatedPower {
    ln_k: Vec<f64>,
    ln_p: Vec<f64>,
}

impl TabulatedPower {
    pub fn from_pairs(pairs: &[(f64, f64)]) -> Result<Self> {
        if pairs.len() < 2 {
            return Err(PmError::config("power table needs at least two rows"));
        }
        let mut ln_k = Vec::with_capacity(pairs.len());
        let mut ln_p = Vec::with_capacity(pairs.len());
        for (i, &(k, p)) in pairs.iter().enumerate() {
            if !(k > 0.0) || !(p > 0.0) {
                return Err(PmError::config(format!(
                    "power table row {}: k and P must be positive, got {} {}",
                    i, k, p
                )));
            }
            let lk = k.ln();
            if let Some(&prev) = ln_k.last() {
                if lk <= prev {
                    return Err(PmError::config(format!(
                        "power table row {}: k must be strictly increasing",
                        i
                    )));
                }
            }
            ln_k.push(lk);
            ln_p.push(p.ln());
        }
        Ok(Self { ln_k, ln_p })
    }

    /// Whitespace separated `k P(k)` columns; `#` starts a comment line.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let mut pairs = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut cols = line.split_whitespace().map(str::parse::<f64>);
            match (cols.next(), cols.next()) {
                (Some(Ok(k)), Some(Ok(p))) => pairs.push((k, p)),
                _ => {
                    return Err(PmError::config(format!(
                        "{}:{}: expected two numbers",
                        path.display(),
                        lineno + 1
                    )))
                }
            }
        }
        Self::from_pairs(&pairs)
    }

    pub fn k_min(&self) -> f64 {
        self.ln_k[0].exp()
    }

    pub fn k_max(&self) -> f64 {
        self.ln_k[self.ln_k.len() - 1].exp()
    }

    /// P(k); zero outside the tabulated range.
    pub fn eval(&self, k: f64) -> f64 {
        if !(k > 0.0) {
            return 0.0;
        }
        let lk = k.ln();
        let last = self.ln_k.len() - 1;
        if lk < self.ln_k[0] || lk > self.ln_k[last] {
            return 0.0;
        }
        let j = self.ln_k.partition_point(|&x| x <= lk).clamp(1, last);
        let (x0, x1) = (self.ln_k[j - 1], self.ln_k[j]);
        let (y0, y1) = (self.ln_p[j - 1], self.ln_p[j]);
        let t = (lk - x0) / (x1 - x0);
        (y0 + t * (y1 - y0)).exp()
    }

    /// Variance of the density field smoothed by a top-hat of radius `r`:
    /// 1/(2 pi^2) * integral k^2 P(k) W^2(k r) dk.
    pub fn sigma2(&self, r: f64) -> f64 {
        const SUBSTEPS: usize = 16;
        let last = self.ln_k.len() - 1;
        let mut sum = 0.0;
        let integrand = |lk: f64| {
            let k = lk.exp();
            let w = top_hat_window(k * r);
            // dk = k dlnk
            k * k * k * self.eval(k) * w * w
        };
        for j in 0..last {
            let (a, b) = (self.ln_k[j], self.ln_k[j + 1]);
            let h = (b - a) / SUBSTEPS as f64;
            let mut prev = integrand(a);
            for s in 1..=SUBSTEPS {
                let next = integrand(a + s as f64 * h);
                sum += 0.5 * h * (prev + next);
                prev = next;
            }
        }
        sum / (2.0 * PI * PI)
    }
}

/// Fourier transform of a unit top-hat sphere.
fn top_hat_window(x: f64) -> f64 {
    if x < 1e-3 {
        let x2 = x * x;
        1.0 - x2 / 10.0 + x2 * x2 / 280.0
    } else {
        3.0 * (x.sin() - x * x.cos()) / (x * x * x)
    }
}
