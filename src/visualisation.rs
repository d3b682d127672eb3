// src/visualisation.rs

use std::path::Path;

use plotters::prelude::*;

use crate::error::{PmError, Result};
use crate::power::PowerSpectrum;

fn plot_err<E: std::fmt::Display>(e: E) -> PmError {
    PmError::Plot(e.to_string())
}

/// Log-log P(k) to SVG, with the shot-noise level as a dashed reference.
/// Bins with zero modes or non-positive power are left out.
pub fn save_power_spectrum_plot(ps: &PowerSpectrum, shot_noise: f64, path: &Path) -> Result<()> {
    let pts: Vec<(f64, f64)> = ps
        .k
        .iter()
        .zip(&ps.p)
        .zip(&ps.n)
        .filter(|((k, p), n)| **n > 0.0 && **k > 0.0 && **p > 0.0)
        .map(|((k, p), _)| (*k, *p))
        .collect();
    if pts.is_empty() {
        return Err(PmError::Plot("power spectrum has no populated bins".into()));
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let k_min = pts.iter().map(|p| p.0).fold(f64::INFINITY, f64::min);
    let k_max = pts.iter().map(|p| p.0).fold(0.0, f64::max);
    let mut p_min = pts.iter().map(|p| p.1).fold(f64::INFINITY, f64::min);
    let mut p_max = pts.iter().map(|p| p.1).fold(0.0, f64::max);
    if shot_noise > 0.0 {
        p_min = p_min.min(shot_noise);
        p_max = p_max.max(shot_noise);
    }

    let root = SVGBackend::new(path, (900, 600)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err)?;

    let mut chart = ChartBuilder::on(&root)
        .margin(20)
        .caption("Matter power spectrum", ("sans-serif", 24))
        .x_label_area_size(45)
        .y_label_area_size(70)
        .build_cartesian_2d(
            (k_min * 0.9..k_max * 1.1).log_scale(),
            (p_min * 0.5..p_max * 2.0).log_scale(),
        )
        .map_err(plot_err)?;

    chart
        .configure_mesh()
        .x_desc("k [h/Mpc]")
        .y_desc("P(k) [(Mpc/h)^3]")
        .axis_desc_style(("sans-serif", 16))
        .draw()
        .map_err(plot_err)?;

    chart
        .draw_series(LineSeries::new(pts.iter().copied(), &BLUE))
        .map_err(plot_err)?
        .label("P(k)")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], BLUE));

    if shot_noise > 0.0 {
        chart
            .draw_series(DashedLineSeries::new(
                [(k_min, shot_noise), (k_max, shot_noise)],
                6,
                4,
                RED.stroke_width(1),
            ))
            .map_err(plot_err)?
            .label("shot noise")
            .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], RED));
    }

    chart
        .configure_series_labels()
        .border_style(BLACK)
        .background_style(WHITE.mix(0.8))
        .draw()
        .map_err(plot_err)?;

    root.present().map_err(plot_err)?;
    Ok(())
}
