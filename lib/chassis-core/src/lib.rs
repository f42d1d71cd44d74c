//! Core primitives for assembling and running chassis-based services.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod closer;
pub mod runtime;
pub mod service;
pub mod shutdown;
pub mod task;
