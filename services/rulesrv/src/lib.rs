//! RuleSrv Library
//!
//! HTTP front end of the greenhouse rule engine.
//!
//! ## Architecture
//!
//! - `ingest`: deduplicates sensor readings and runs the evaluation pass
//! - `routes`: axum handlers for readings, ticks, history and command polling
//! - `app`: SQLite pool, engine, scheduler and retention task wiring
//! - `config`: figment-layered YAML + environment configuration

pub mod api_types;
pub mod app;
pub mod config;
pub mod ingest;
pub mod logging;
pub mod routes;

// Re-export app state and initialization
pub use app::{
    build_app_state, create_app_state, open_database, spawn_retention, AppState, Engine,
    Scheduler,
};
pub use config::{Config, ConfigError};
pub use ingest::{ingest_reading, ReadingDeduplicator};

// Re-export route creation
pub use routes::create_routes;
