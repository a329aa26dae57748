//! # Runtime
//!
//! - `initialization.rs` - process startup (crypto, tracing, metrics server, clients)
//! - `error_policy.rs` - per-resource requeue backoff for failed reconciliations
//! - `watch_loop.rs` - controller loops and shutdown

pub mod error_policy;
pub mod initialization;
pub mod watch_loop;
