// src/snapshot.rs
//
// Output epochs and the interpolated snapshots taken at them.

use tracing::{debug, info};

use crate::comm::{agree, Communicator};
use crate::error::{PmError, Result};
use crate::particles::{AttrMask, ParticleStore};
use crate::stepping::{ForceMode, Integrator, StepSchedule};
use crate::walltime::ClockTable;

/// Persists one rank's share of a snapshot.
pub trait SnapshotWriter {
    fn write(&mut self, snapshot: &ParticleStore, aout: f64, rank: usize) -> Result<()>;
}

/// `None` discards snapshots.
impl<W: SnapshotWriter> SnapshotWriter for Option<W> {
    fn write(&mut self, snapshot: &ParticleStore, aout: f64, rank: usize) -> Result<()> {
        match self {
            Some(w) => w.write(snapshot, aout, rank),
            None => Ok(()),
        }
    }
}

/// Increasing output scale factors and a cursor into them.
#[derive(Debug, Clone)]
pub struct SnapshotSchedule {
    aout: Vec<f64>,
    iout: usize,
}

impl SnapshotSchedule {
    pub fn new(aout: Vec<f64>) -> Result<Self> {
        if aout.iter().any(|&a| !(a > 0.0)) {
            return Err(PmError::config("output scale factors must be positive"));
        }
        if aout.windows(2).any(|w| w[1] <= w[0]) {
            return Err(PmError::config(
                "output epochs must be strictly increasing in a (decreasing in z)",
            ));
        }
        Ok(Self { aout, iout: 0 })
    }

    /// a = 1 / (1 + z) for every output redshift.
    pub fn from_redshifts(zout: &[f64]) -> Result<Self> {
        if let Some(z) = zout.iter().find(|&&z| !(z > -1.0)) {
            return Err(PmError::config(format!("output redshift {} is not > -1", z)));
        }
        Self::new(zout.iter().map(|z| 1.0 / (1.0 + z)).collect())
    }

    pub fn aout(&self) -> &[f64] {
        &self.aout
    }

    pub fn nout(&self) -> usize {
        self.aout.len()
    }

    pub fn iout(&self) -> usize {
        self.iout
    }

    pub fn is_done(&self) -> bool {
        self.iout == self.aout.len()
    }

    /// The pending epoch if it was crossed during a kick (a_x < aout < a_v)
    /// or at a drift boundary (a_x >= aout >= a_v).
    pub fn next_due(&self, a_x: f64, a_v: f64) -> Option<f64> {
        let aout = *self.aout.get(self.iout)?;
        let after_kick = a_x < aout && aout < a_v;
        let after_drift = a_x >= aout && aout >= a_v;
        (after_kick || after_drift).then_some(aout)
    }

    pub fn advance(&mut self) {
        if self.iout < self.aout.len() {
            self.iout += 1;
        }
    }

    /// Epochs are taken in order, so one the steps never cross would hold
    /// back every epoch after it. All of them must lie within the span of
    /// `steps`.
    pub fn check_reachable(&self, steps: &StepSchedule) -> Result<()> {
        let first = steps.a_initial();
        let last = steps.times().last().copied().unwrap_or(first);
        match self.aout.iter().find(|&&a| a < first || a > last) {
            Some(a) => Err(PmError::config(format!(
                "output epoch a = {} lies outside the time steps [{}, {}]",
                a, first, last
            ))),
            None => Ok(()),
        }
    }
}

/// Snapshot schedule bound to a writer and the box it wraps into.
pub struct Snapshots<W> {
    pub schedule: SnapshotSchedule,
    pub writer: W,
    boxsize: f64,
    written: usize,
}

impl<W: SnapshotWriter> Snapshots<W> {
    pub fn new(schedule: SnapshotSchedule, writer: W, boxsize: f64) -> Self {
        Self {
            schedule,
            writer,
            boxsize,
            written: 0,
        }
    }

    pub fn written(&self) -> usize {
        self.written
    }

    /// Write every epoch now due for a store synchronised at `a_x` (positions)
    /// and `a_v` (velocities). Returns true once all epochs are written.
    /// Collective: every rank writes its own particles.
    #[allow(clippy::too_many_arguments)]
    pub fn check<C, I>(
        &mut self,
        store: &ParticleStore,
        a_x: f64,
        a_v: f64,
        integrator: &I,
        mode: ForceMode,
        comm: &C,
        clock: &mut ClockTable,
    ) -> Result<bool>
    where
        C: Communicator,
        I: Integrator + ?Sized,
    {
        while let Some(aout) = self.schedule.next_due(a_x, a_v) {
            debug!("Taking a snapshot at a = {}", aout);
            let mut snapshot = ParticleStore::new(
                store.np_upper,
                AttrMask::ID | AttrMask::POS | AttrMask::VEL,
            );
            integrator.interpolate(store, &mut snapshot, aout, a_x, a_v, mode)?;
            clock.measure("/Snapshot/KickDrift");

            snapshot.wrap(self.boxsize);
            clock.measure("/Snapshot/Periodic");

            let result = self.writer.write(&snapshot, aout, comm.rank());
            agree(comm, result, "snapshot write")?;
            clock.measure("/Snapshot/IO");

            comm.barrier();
            clock.measure("/Snapshot/Wait");

            self.schedule.advance();
            self.written += 1;
            if comm.is_root() {
                info!(
                    "snapshot {} written z = {:6.4} a = {:6.4}",
                    self.schedule.iout(),
                    1.0 / aout - 1.0,
                    aout
                );
            }
        }
        Ok(self.schedule.is_done())
    }
}
