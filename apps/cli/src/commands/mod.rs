//! Command implementations for the Cadence CLI.

pub mod checkpoint;
pub mod train;
