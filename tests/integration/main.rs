//! Overmesh integration test harness.
//!
//! Every test here runs whole nodes (transport, rendezvous manager and
//! resolver router) over the in-memory network, so no sockets, namespaces
//! or root are needed:
//!
//!   cargo test --test integration
//!
//! Delivery is driven by the test: nothing moves until `run_until_idle`.

mod api;
mod infra;
mod rendezvous;
mod resolver;

pub use infra::*;
