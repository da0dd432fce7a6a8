pub mod app;
pub mod cli;
pub mod config;
pub mod control;
pub mod diff;
pub mod error;
pub mod logging;
pub mod scan;
pub mod sources;
pub mod task;
pub mod version;

pub use error::{ScanError, ScanResult};
