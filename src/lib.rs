// src/lib.rs

pub mod alloc;
pub mod comm;
pub mod config;
pub mod cosmology;
pub mod error;
pub mod extensions;
pub mod force;
pub mod ghosts;
pub mod grid;
pub mod initial;
pub mod mesh;
pub mod particles;
pub mod power;
pub mod simulation;
pub mod snapshot;
pub mod snapshot_io;
pub mod stepping;
pub mod visualisation;
pub mod vpm;
pub mod walltime;
