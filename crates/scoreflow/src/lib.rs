pub mod api;
pub mod bulk;
pub mod config;
pub mod convergence;
pub mod db;
pub mod deals;
pub mod discovery;
pub mod gate;
pub mod ledger;
pub mod queue;
pub mod telemetry;
