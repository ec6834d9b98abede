//! Process wiring for the `herald` binary: ledger connection, pipeline
//! construction and the liveness endpoint.

pub mod bootstrap;
pub mod routes;
pub mod state;
