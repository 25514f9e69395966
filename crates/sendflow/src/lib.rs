pub mod api;
pub mod assign;
pub mod config;
pub mod db;
pub mod procedures;
pub mod queue;
pub mod telemetry;

pub use telemetry::init_tracing;
