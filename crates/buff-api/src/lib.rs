//! HTTP surface for the simulation run manager.
//!
//! `routes::build_router` composes the full application; `main.rs` attaches
//! middleware (CORS, tracing) and serves it. Handlers are `pub(crate)` so
//! the scenario tests drive the bare router in-process.

pub mod errors;
pub mod routes;
pub mod state;
