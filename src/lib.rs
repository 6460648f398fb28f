//! Cache-coherence core of the template engine.
//!
//! Keeps an in-process document cache consistent with the authoritative
//! store across service instances, using change events delivered over a
//! message bus.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
