//! Application ports and error reporting.

pub mod bus;
pub mod error;
pub mod repos;
