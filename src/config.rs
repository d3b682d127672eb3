// src/config.rs
//
// Run parameters (read from JSON) and the resolved run description written to
// `<run dir>/config.json`.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PmError, Result};
use crate::initial::InitialCondition;
use crate::snapshot::SnapshotSchedule;
use crate::stepping::{ForceMode, StepSchedule};
use crate::vpm::VpmInit;

/// Per-rank storage over-allocation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocFactor {
    Fixed(f64),
    /// Size from the linear power spectrum so that the chance of any rank
    /// overflowing stays below `failure_rate`.
    Estimate { failure_rate: f64 },
}

impl Default for AllocFactor {
    fn default() -> Self {
        AllocFactor::Fixed(2.0)
    }
}

fn default_vpm() -> Vec<VpmInit> {
    vec![VpmInit {
        a_start: 0.0,
        pm_nc_factor: 2,
    }]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Parameters {
    /// Particles per side.
    pub nc: usize,
    pub boxsize: f64,
    pub omega_m: f64,
    /// Scale factors of the step boundaries, strictly increasing.
    pub time_step: Vec<f64>,
    /// Output redshifts, decreasing.
    #[serde(default)]
    pub zout: Vec<f64>,
    #[serde(default = "default_vpm")]
    pub vpm: Vec<VpmInit>,
    #[serde(default)]
    pub alloc_factor: AllocFactor,
    #[serde(default)]
    pub linear_power_file: Option<PathBuf>,
    #[serde(default)]
    pub random_seed: u64,
    #[serde(default)]
    pub snapshot_filename: Option<String>,
    #[serde(default)]
    pub measure_power_spectrum_filename: Option<String>,
    #[serde(default)]
    pub force_mode: ForceMode,
    #[serde(default)]
    pub initial: InitialCondition,
    #[serde(default)]
    pub plot_power_spectrum: bool,
}

impl Parameters {
    pub fn from_file(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let params: Parameters = serde_json::from_reader(BufReader::new(file))?;
        Ok(params)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn step_schedule(&self) -> Result<StepSchedule> {
        StepSchedule::new(self.time_step.clone())
    }

    pub fn snapshot_schedule(&self) -> Result<SnapshotSchedule> {
        SnapshotSchedule::from_redshifts(&self.zout)
    }

    /// Startup checks; every failure is a `Config` error.
    pub fn validate(&self) -> Result<()> {
        if self.nc == 0 {
            return Err(PmError::config("nc must be at least 1"));
        }
        if !(self.boxsize > 0.0 && self.boxsize.is_finite()) {
            return Err(PmError::config(format!(
                "boxsize must be positive, got {}",
                self.boxsize
            )));
        }
        if !(self.omega_m > 0.0 && self.omega_m <= 1.0) {
            return Err(PmError::config(format!(
                "omega_m must lie in (0, 1], got {}",
                self.omega_m
            )));
        }
        let steps = self.step_schedule()?;
        self.snapshot_schedule()?.check_reachable(&steps)?;

        let first = self
            .vpm
            .first()
            .ok_or_else(|| PmError::config("vpm is empty"))?;
        if first.a_start > steps.a_initial() {
            return Err(PmError::config(format!(
                "vpm starts at a = {} after the first step a = {}",
                first.a_start,
                steps.a_initial()
            )));
        }

        match self.alloc_factor {
            AllocFactor::Fixed(f) => {
                if !(f >= 1.0 && f.is_finite()) {
                    return Err(PmError::config(format!(
                        "alloc_factor must be >= 1, got {}",
                        f
                    )));
                }
            }
            AllocFactor::Estimate { failure_rate } => {
                if !(failure_rate > 0.0 && failure_rate < 1.0) {
                    return Err(PmError::config(format!(
                        "failure_rate must lie in (0, 1), got {}",
                        failure_rate
                    )));
                }
                if self.linear_power_file.is_none() {
                    return Err(PmError::config(
                        "alloc_factor estimate needs linear_power_file",
                    ));
                }
            }
        }

        self.initial.validate()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunInfo {
    pub binary: String,
    pub run_id: String,
    pub timestamp_unix: Option<u64>,
}

/// What actually ran: the parameters plus everything resolved at startup.
#[derive(Debug, Clone, Serialize)]
pub struct RunConfig {
    pub parameters: Parameters,
    pub ranks: usize,
    pub alloc_factor: f64,
    pub run: RunInfo,
}

impl RunConfig {
    pub fn write_to_dir(&self, out_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(out_dir)?;
        let path = out_dir.join("config.json");
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }
}
