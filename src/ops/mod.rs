//! Operations.
//!
//! - `telemetry` - Structured logging setup and runtime level control

pub mod telemetry;

pub use telemetry::*;
