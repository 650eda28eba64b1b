pub mod app_context;
pub mod clients;
pub mod config;
pub mod exporter;
pub mod metrics;
pub mod utils;
