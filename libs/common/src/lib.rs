//! Shared service plumbing
//!
//! Logging bootstrap shared by acquisition services: console output plus an
//! optional daily rolling file.

pub mod logging;

pub use logging::{init_with_config, LogConfig};
