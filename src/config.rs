//! Environment-driven configuration.
//!
//! Recognized variables:
//!
//! - `DATABASE_URL` — connection string for the relational store
//! - `MAX_CONCURRENT_RUNS` — coordinator-side semaphore bound
//! - `DEFAULT_MAX_ITERATIONS` — engine iteration bound when a run does not
//!   override it
//! - `DEFAULT_RUN_TIMEOUT_SECONDS` — wall-clock budget when a run does not
//!   override it; `0` disables the default budget
//! - `CORS_ORIGINS` — comma-separated allowed origins, parsed here and
//!   handed to the HTTP layer
//!
//! A `.env` file in the working directory is honored. Unset or unparseable
//! values fall back to defaults with a warning rather than failing startup.

use std::time::Duration;

use crate::runtimes::{CoordinatorConfig, DEFAULT_MAX_ITERATIONS};

/// Resolved configuration for wiring up a deployment.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    /// Storage connection string.
    pub database_url: String,
    /// Bound on concurrently executing runs.
    pub max_concurrent_runs: usize,
    /// Default iteration bound.
    pub default_max_iterations: u32,
    /// Default per-run wall-clock budget.
    pub default_run_timeout: Option<Duration>,
    /// Allowed origins for the transport layer.
    pub cors_origins: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://flowgraph.db".to_string(),
            max_concurrent_runs: 10,
            default_max_iterations: DEFAULT_MAX_ITERATIONS,
            default_run_timeout: Some(Duration::from_secs(300)),
            cors_origins: vec!["*".to_string()],
        }
    }
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "unparseable value; using default");
            None
        }
    }
}

impl EngineConfig {
    /// Load from the process environment (and `.env`, if present).
    #[must_use]
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let default_run_timeout = match parsed_var::<u64>("DEFAULT_RUN_TIMEOUT_SECONDS") {
            Some(0) => None,
            Some(seconds) => Some(Duration::from_secs(seconds)),
            None => defaults.default_run_timeout,
        };
        let cors_origins = std::env::var("CORS_ORIGINS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|origins| !origins.is_empty())
            .unwrap_or(defaults.cors_origins);

        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            max_concurrent_runs: parsed_var("MAX_CONCURRENT_RUNS")
                .unwrap_or(defaults.max_concurrent_runs),
            default_max_iterations: parsed_var("DEFAULT_MAX_ITERATIONS")
                .unwrap_or(defaults.default_max_iterations),
            default_run_timeout,
            cors_origins,
        }
    }

    /// The coordinator tuning slice of this configuration.
    #[must_use]
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            max_concurrent_runs: self.max_concurrent_runs,
            default_max_iterations: self.default_max_iterations,
            default_timeout: self.default_run_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent_runs, 10);
        assert_eq!(config.default_max_iterations, DEFAULT_MAX_ITERATIONS);
        assert_eq!(config.default_run_timeout, Some(Duration::from_secs(300)));
        assert_eq!(config.cors_origins, vec!["*".to_string()]);
    }

    #[test]
    fn coordinator_slice_mirrors_fields() {
        let config = EngineConfig {
            max_concurrent_runs: 3,
            default_max_iterations: 7,
            default_run_timeout: None,
            ..Default::default()
        };
        let slice = config.coordinator_config();
        assert_eq!(slice.max_concurrent_runs, 3);
        assert_eq!(slice.default_max_iterations, 7);
        assert_eq!(slice.default_timeout, None);
    }

    // Environment-variable parsing is covered indirectly; mutating process
    // env in parallel unit tests races with other tests.
}
