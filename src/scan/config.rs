//! Orchestrator Configuration
//!
//! Static settings shared by every scan task a registry runs.
//!
//! ```rust,no_run
//! use rulescan::scan::config::OrchestratorConfig;
//!
//! let config = OrchestratorConfig::builder()
//!     .with_max_active_tasks(4)
//!     .with_channel_capacity(256)
//!     .build()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::path::PathBuf;
use serde::{Deserialize, Serialize};

/// Orchestrator configuration parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Directory for persisted task records (None = in-memory store)
    pub store_dir: Option<PathBuf>,
    /// Tasks allowed to execute at the same time
    pub max_active_tasks: usize,
    /// Outbound response buffer per control stream
    pub channel_capacity: usize,
    /// Default for tasks that do not set `ignore_language`
    pub ignore_language: bool,
    /// Buffer between the diff producer and its consumer
    pub diff_channel_capacity: usize,
}

/// Configuration validation error
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Maximum active tasks must be greater than zero")]
    InvalidMaxActiveTasks,
    #[error("Channel capacity must be greater than zero")]
    InvalidChannelCapacity,
    #[error("Diff channel capacity must be greater than zero")]
    InvalidDiffChannelCapacity,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            store_dir: None,
            max_active_tasks: num_cpus::get().max(1),
            channel_capacity: 128,
            ignore_language: false,
            diff_channel_capacity: 64,
        }
    }
}

impl OrchestratorConfig {
    pub fn builder() -> OrchestratorConfigBuilder {
        OrchestratorConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_active_tasks == 0 {
            return Err(ConfigError::InvalidMaxActiveTasks);
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::InvalidChannelCapacity);
        }
        if self.diff_channel_capacity == 0 {
            return Err(ConfigError::InvalidDiffChannelCapacity);
        }
        Ok(())
    }
}

/// Fluent builder for [`OrchestratorConfig`]
#[derive(Debug, Default)]
pub struct OrchestratorConfigBuilder {
    config: OrchestratorConfig,
}

impl OrchestratorConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.store_dir = Some(dir.into());
        self
    }

    pub fn with_max_active_tasks(mut self, tasks: usize) -> Self {
        self.config.max_active_tasks = tasks;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity;
        self
    }

    pub fn with_ignore_language(mut self, ignore: bool) -> Self {
        self.config.ignore_language = ignore;
        self
    }

    pub fn with_diff_channel_capacity(mut self, capacity: usize) -> Self {
        self.config.diff_channel_capacity = capacity;
        self
    }

    /// Build and validate
    pub fn build(self) -> Result<OrchestratorConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
