//! # Router Configuration
//!
//! TOML-backed settings for a router instance. Only two concerns are
//! configurable: the router name (used in log fields) and the sizing of the
//! bounded worker pool created for every channel.
//!
//! ```toml
//! [router]
//! name = "nmr"
//!
//! [executor]
//! workers = 4           # concurrently running process() tasks per channel
//! queue_capacity = 1024 # accepted-but-unfinished tasks per channel
//! ```
//!
//! Sections may be omitted; missing values fall back to [`NmrConfig::default`].

use crate::NmrError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main router configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct NmrConfig {
    pub router: RouterSettings,
    pub executor: ExecutorConfig,
}

/// Core router settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RouterSettings {
    /// Human-readable name
    pub name: String,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            name: "nmr".to_string(),
        }
    }
}

/// Per-channel worker pool sizing
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Maximum number of `process` tasks running at once on one channel
    pub workers: usize,
    /// Maximum number of accepted tasks (running or waiting) on one channel
    pub queue_capacity: usize,
}

const DEFAULT_QUEUE_CAPACITY: usize = 1024;

impl Default for ExecutorConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self::for_parallelism(parallelism)
    }
}

impl ExecutorConfig {
    /// One worker per core, never more workers than queue slots
    fn for_parallelism(parallelism: usize) -> Self {
        Self {
            workers: parallelism.clamp(1, DEFAULT_QUEUE_CAPACITY),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl NmrConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, NmrError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| NmrError::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml_str(toml_str: &str) -> Result<Self, NmrError> {
        let config: Self = toml::from_str(toml_str)
            .map_err(|e| NmrError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), NmrError> {
        if self.router.name.trim().is_empty() {
            return Err(NmrError::Config("router.name must not be empty".to_string()));
        }

        if self.executor.workers == 0 {
            return Err(NmrError::Config("executor.workers must be > 0".to_string()));
        }

        if self.executor.queue_capacity < self.executor.workers {
            return Err(NmrError::Config(
                "executor.queue_capacity must be >= executor.workers".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = NmrConfig::default();
        assert_eq!(config.router.name, "nmr");
        assert!(config.executor.workers > 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_workers_fit_queue_on_large_hosts() {
        let executor = ExecutorConfig::for_parallelism(4096);
        assert_eq!(executor.workers, DEFAULT_QUEUE_CAPACITY);

        let config = NmrConfig {
            executor,
            ..NmrConfig::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(ExecutorConfig::for_parallelism(0).workers, 1);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = NmrConfig::from_toml_str(
            r#"
            [executor]
            workers = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.executor.workers, 2);
        assert_eq!(config.executor.queue_capacity, 1024);
        assert_eq!(config.router.name, "nmr");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let result = NmrConfig::from_toml_str(
            r#"
            [executor]
            workers = 0
            "#,
        );
        assert!(matches!(result, Err(NmrError::Config(_))));

        let result = NmrConfig::from_toml_str(
            r#"
            [executor]
            workers = 8
            queue_capacity = 4
            "#,
        );
        assert!(matches!(result, Err(NmrError::Config(_))));

        let result = NmrConfig::from_toml_str("[router]\nname = \"  \"\n");
        assert!(matches!(result, Err(NmrError::Config(_))));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[router]\nname = \"bus\"\n\n[executor]\nworkers = 3\nqueue_capacity = 16"
        )
        .unwrap();

        let config = NmrConfig::from_file(file.path()).unwrap();
        assert_eq!(config.router.name, "bus");
        assert_eq!(config.executor.workers, 3);
        assert_eq!(config.executor.queue_capacity, 16);

        let missing = NmrConfig::from_file("/nonexistent/nmr.toml");
        assert!(matches!(missing, Err(NmrError::Config(_))));
    }
}
