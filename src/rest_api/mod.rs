//! Operational HTTP endpoints
//!
//! `/health` for liveness, `/ready` once the controllers are running and
//! `/metrics` in the Prometheus text format.

mod handlers;
mod server;

pub use server::{router, run_server, ApiState};
