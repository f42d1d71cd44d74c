//! High-level application primitives.
//!
//! This crate provides the common pieces needed to bootstrap an application prior to running,
//! such as initializing the logging subsystem.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod logging;

/// Common imports.
pub mod prelude {
    pub use super::logging::{fatal_and_exit, initialize_logging};
}
