// src/simulation.rs
//
// The stepping loop.
//
// Per step i with window (a_x, a_x1, a_v, a_v1):
//   wrap -> decompose onto the selected mesh -> load imbalance
//   -> force (pm only) -> power spectrum output -> barrier
//   -> snapshots due at (a_x, a_v)
//   -> stop if a_x >= 1
//   -> kick a_v..a_v1 -> snapshots due at (a_x, a_v1) -> drift a_x..a_x1

use tracing::{debug, info};

use crate::comm::{agree, Communicator};
use crate::error::Result;
use crate::extensions::{ExtensionContext, ExtensionPoint, Extensions};
use crate::force::compute_force;
use crate::particles::ParticleStore;
use crate::power::{format_g, power_spectrum_path, PowerSpectrum};
use crate::snapshot::{SnapshotWriter, Snapshots};
use crate::stepping::{ForceMode, Integrator, StepSchedule};
use crate::visualisation::save_power_spectrum_plot;
use crate::vpm::MeshSelector;
use crate::walltime::ClockTable;

/// Owned particle counts relative to the mean across ranks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadImbalance {
    pub min: f64,
    pub max: f64,
}

/// Collective. An empty world reports perfect balance.
pub fn measure_load_imbalance<C: Communicator>(np: usize, comm: &C) -> LoadImbalance {
    let counts = comm.all_gather(np);
    let total: usize = counts.iter().sum();
    if total == 0 {
        return LoadImbalance { min: 1.0, max: 1.0 };
    }
    let mean = total as f64 / counts.len() as f64;
    let lo = counts.iter().copied().min().unwrap_or(0);
    let hi = counts.iter().copied().max().unwrap_or(0);
    LoadImbalance {
        min: lo as f64 / mean,
        max: hi as f64 / mean,
    }
}

/// Where and how the per-step power spectrum is written (rank 0 only).
#[derive(Debug, Clone)]
pub struct PowerOutput {
    pub prefix: String,
    pub seed: u64,
    /// Total particle count, for the shot-noise metadata.
    pub ntotal: usize,
    /// Also draw an SVG next to each text file.
    pub plot: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    Terminal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub steps: usize,
    pub snapshots: usize,
    pub final_a_x: f64,
    pub imbalance: Vec<LoadImbalance>,
}

pub struct Simulation<C, I, W>
where
    C: Communicator,
    I: Integrator,
    W: SnapshotWriter,
{
    comm: C,
    pub store: ParticleStore,
    meshes: MeshSelector<C>,
    schedule: StepSchedule,
    pub integrator: I,
    pub snapshots: Snapshots<W>,
    mode: ForceMode,
    power_output: Option<PowerOutput>,
    extensions: Extensions,
    pub clock: ClockTable,
    power: Option<PowerSpectrum>,
    imbalance: Vec<LoadImbalance>,
}

impl<C, I, W> Simulation<C, I, W>
where
    C: Communicator,
    I: Integrator,
    W: SnapshotWriter,
{
    pub fn new(
        comm: C,
        store: ParticleStore,
        meshes: MeshSelector<C>,
        schedule: StepSchedule,
        integrator: I,
        snapshots: Snapshots<W>,
    ) -> Self {
        Self {
            comm,
            store,
            meshes,
            schedule,
            integrator,
            snapshots,
            mode: ForceMode::Pm,
            power_output: None,
            extensions: Extensions::new(),
            clock: ClockTable::new(),
            power: None,
            imbalance: Vec::new(),
        }
    }

    pub fn with_force_mode(mut self, mode: ForceMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_power_output(mut self, out: PowerOutput) -> Self {
        self.power_output = Some(out);
        self
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    pub fn force_mode(&self) -> ForceMode {
        self.mode
    }

    /// Spectrum of the most recent force evaluation.
    pub fn last_power_spectrum(&self) -> Option<&PowerSpectrum> {
        self.power.as_ref()
    }

    pub fn schedule(&self) -> &StepSchedule {
        &self.schedule
    }

    /// Run every scheduled step, or until a step starts at a_x >= 1.
    pub fn run(&mut self) -> Result<RunSummary> {
        self.snapshots.schedule.check_reachable(&self.schedule)?;
        let a0 = self.schedule.a_initial();
        self.clock.restart();
        self.snapshots.check(
            &self.store,
            a0,
            a0,
            &self.integrator,
            self.mode,
            &self.comm,
            &mut self.clock,
        )?;

        let mut steps = 0;
        let mut final_a_x = a0;
        for i in 0..self.schedule.nsteps() {
            let w = self.schedule.window(i);
            let outcome = self.step(i)?;
            steps += 1;
            if outcome == StepOutcome::Terminal {
                final_a_x = w.a_x;
                break;
            }
            final_a_x = w.a_x1;
        }

        Ok(RunSummary {
            steps,
            snapshots: self.snapshots.written(),
            final_a_x,
            imbalance: self.imbalance.clone(),
        })
    }

    /// One pass of the loop body. Collective.
    pub fn step(&mut self, i: usize) -> Result<StepOutcome> {
        let w = self.schedule.window(i);
        let comm = &self.comm;
        let level = self.meshes.select_mut(w.a_x);
        let boxsize = level.mesh.box_size();

        if comm.is_root() {
            info!(
                "==== Step {} a_x = {:6.4} a_x1 = {:6.4} a_v = {:6.4} a_v1 = {:6.4} Nmesh = {} ====",
                i,
                w.a_x,
                w.a_x1,
                w.a_v,
                w.a_v1,
                level.mesh.nmesh()
            );
        }

        self.store.wrap(boxsize);
        self.clock.measure("/Stepping/Periodic");

        let mesh = &level.mesh;
        self.store.decompose(|x| mesh.pos_to_rank(x), comm)?;
        self.clock.measure("/Stepping/Decompose");

        let imbalance = measure_load_imbalance(self.store.np, comm);
        if comm.is_root() {
            info!(
                "Load imbalance is - {} / + {}",
                format_g(imbalance.min),
                format_g(imbalance.max)
            );
        }
        self.imbalance.push(imbalance);

        if self.mode.uses_pm() {
            let density_factor = level.density_factor();
            let mut ps = PowerSpectrum::for_mesh(level.mesh.nmesh());
            compute_force(
                &mut self.store,
                &level.mesh,
                &mut level.buffers,
                density_factor,
                &mut ps,
                &mut self.clock,
            )?;

            let result = self.extensions.invoke(&ExtensionContext {
                point: ExtensionPoint::AfterForce,
                step: i,
                a_x: w.a_x,
                a_v: w.a_v,
                store: &self.store,
                power: Some(&ps),
            });
            agree(comm, result, "after-force extension")?;

            if let Some(out) = &self.power_output {
                let result = if comm.is_root() {
                    write_power_output(out, &ps, level.mesh.volume(), boxsize, w.a_x)
                } else {
                    Ok(())
                };
                agree(comm, result, "power spectrum output")?;
            }
            self.clock.measure("/Stepping/PowerSpectrum");
            self.power = Some(ps);
        }

        comm.barrier();
        self.clock.measure("/Stepping/Wait");

        self.snapshots.check(
            &self.store,
            w.a_x,
            w.a_v,
            &self.integrator,
            self.mode,
            comm,
            &mut self.clock,
        )?;

        if w.a_x >= 1.0 {
            debug!("a_x = {} reached the end of the run", w.a_x);
            return Ok(StepOutcome::Terminal);
        }

        self.integrator
            .kick(&mut self.store, w.a_v, w.a_v1, w.a_x, self.mode);
        self.clock.measure("/Stepping/kick");
        let result = self.extensions.invoke(&ExtensionContext {
            point: ExtensionPoint::AfterKick,
            step: i,
            a_x: w.a_x,
            a_v: w.a_v1,
            store: &self.store,
            power: None,
        });
        agree(comm, result, "after-kick extension")?;

        // An epoch may fall strictly inside the kick just taken.
        self.snapshots.check(
            &self.store,
            w.a_x,
            w.a_v1,
            &self.integrator,
            self.mode,
            comm,
            &mut self.clock,
        )?;

        self.integrator
            .drift(&mut self.store, w.a_x, w.a_x1, w.a_v1, self.mode);
        self.clock.measure("/Stepping/drift");
        let result = self.extensions.invoke(&ExtensionContext {
            point: ExtensionPoint::AfterDrift,
            step: i,
            a_x: w.a_x1,
            a_v: w.a_v1,
            store: &self.store,
            power: None,
        });
        agree(comm, result, "after-drift extension")?;

        Ok(StepOutcome::Continue)
    }
}

fn write_power_output(
    out: &PowerOutput,
    ps: &PowerSpectrum,
    volume: f64,
    boxsize: f64,
    a: f64,
) -> Result<()> {
    let path = power_spectrum_path(&out.prefix, out.seed, a);
    ps.write_text(&path, volume, out.ntotal as f64, boxsize)?;
    debug!("power spectrum written to {}", path.display());
    if out.plot {
        let shot_noise = volume / out.ntotal.max(1) as f64;
        save_power_spectrum_plot(ps, shot_noise, &path.with_extension("svg"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{LocalWorld, SerialComm};

    #[test]
    fn uniform_counts_are_balanced() {
        let out = LocalWorld::run(4, |comm| measure_load_imbalance(10, &comm)).unwrap();
        for imb in out {
            assert!((imb.min - 1.0).abs() < 1e-12);
            assert!((imb.max - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn skewed_counts_report_both_sides() {
        let out = LocalWorld::run(2, |comm| {
            measure_load_imbalance(if comm.rank() == 0 { 1 } else { 3 }, &comm)
        })
        .unwrap();
        assert_eq!(out[0], LoadImbalance { min: 0.5, max: 1.5 });
        assert_eq!(out[0], out[1]);
    }

    #[test]
    fn empty_world_is_balanced() {
        let imb = measure_load_imbalance(0, &SerialComm);
        assert_eq!(imb, LoadImbalance { min: 1.0, max: 1.0 });
    }
}
