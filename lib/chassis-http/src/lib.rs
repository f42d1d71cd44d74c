//! HTTP serving and client plumbing for chassis services.
//!
//! The server side composes [`middleware`] links into a [`Pipeline`][middleware::Pipeline] and
//! runs it behind [`server::HttpService`], which plugs into the runtime as a supervised
//! service. The client side mirrors the same idea outbound: [`client::HttpClient`] wraps a
//! transport in round-trip hops such as circuit breaking and retrying.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod client;
pub mod middleware;
pub mod server;
