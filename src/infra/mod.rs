//! Infrastructure adapters and runtime bootstrap.

pub mod error;
pub mod gateway;
pub mod telemetry;
