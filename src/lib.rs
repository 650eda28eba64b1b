pub mod agent;
pub mod core;
