pub mod config;
pub mod recorder;
pub mod service;
pub mod source;
pub mod telemetry;
