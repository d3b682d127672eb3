// src/walltime.rs
//
// Labelled wall-clock accounting. Each `measure` charges the time since the
// previous checkpoint to a label such as "/Force/FFT".

use std::collections::BTreeMap;
use std::time::Instant;

use crate::comm::Communicator;

#[derive(Debug, Clone)]
pub struct ClockTable {
    last: Instant,
    seconds: BTreeMap<String, f64>,
}

/// One label across all ranks.
#[derive(Debug, Clone, PartialEq)]
pub struct ClockSummary {
    pub label: String,
    pub min: f64,
    pub mean: f64,
    pub max: f64,
}

impl Default for ClockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockTable {
    pub fn new() -> Self {
        Self {
            last: Instant::now(),
            seconds: BTreeMap::new(),
        }
    }

    /// Charge the time since the last checkpoint to `label`.
    pub fn measure(&mut self, label: &str) {
        let now = Instant::now();
        let dt = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        *self.seconds.entry(label.to_string()).or_insert(0.0) += dt;
    }

    /// Move the checkpoint without charging anything.
    pub fn restart(&mut self) {
        self.last = Instant::now();
    }

    pub fn elapsed(&self, label: &str) -> f64 {
        self.seconds.get(label).copied().unwrap_or(0.0)
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.seconds.keys().map(String::as_str)
    }

    /// min / mean / max per label over every rank (collective). A label a rank
    /// never measured counts as zero there.
    pub fn summary<C: Communicator>(&self, comm: &C) -> Vec<ClockSummary> {
        let tables = comm.all_gather(self.seconds.clone());
        let mut labels: Vec<&String> = tables.iter().flat_map(|t| t.keys()).collect();
        labels.sort();
        labels.dedup();

        let nranks = tables.len() as f64;
        labels
            .into_iter()
            .map(|label| {
                let values: Vec<f64> = tables
                    .iter()
                    .map(|t| t.get(label).copied().unwrap_or(0.0))
                    .collect();
                ClockSummary {
                    label: label.clone(),
                    min: values.iter().copied().fold(f64::INFINITY, f64::min),
                    mean: values.iter().sum::<f64>() / nranks,
                    max: values.iter().copied().fold(0.0, f64::max),
                }
            })
            .collect()
    }
}
