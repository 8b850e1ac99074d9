pub mod app;
pub mod chain;
pub mod config;
pub mod engine;
pub mod errors;
pub mod hub;
pub mod marketdata;
pub mod server;
pub mod telemetry;
pub mod utils;

pub use app::{App, RunningApp};
pub use config::{LogFormat, Settings};
pub use errors::{AppError, AppResult};
