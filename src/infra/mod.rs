//! Infrastructure adapters and runtime bootstrap.

pub mod bus;
pub mod error;
pub mod node;
pub mod store;
pub mod telemetry;
