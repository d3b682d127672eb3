// src/error.rs

use thiserror::Error;

/// Every fault in the solver is fatal; errors only travel up to the driver.
#[derive(Debug, Error)]
pub enum PmError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(
        "capacity overflow on rank {rank} during {stage}: need {needed} slots, have {capacity}"
    )]
    CapacityOverflow {
        rank: usize,
        needed: usize,
        capacity: usize,
        stage: &'static str,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("plot error: {0}")]
    Plot(String),
}

pub type Result<T> = std::result::Result<T, PmError>;

impl PmError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        PmError::Config(msg.into())
    }
}
