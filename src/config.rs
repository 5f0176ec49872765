//! Core-owned tunables, loaded from TOML. Grounded on `config.rs`'s
//! `include_str!`-default-plus-override pattern; generalized from an empty
//! placeholder struct to the handful of values the scheduling window,
//! transport, patch bay, and supervisor read at construction time.

use std::path::Path;

use serde::Deserialize;

use crate::common::Seconds;

pub const DEFAULT_CONFIG_TOML: &str = include_str!("default-config.toml");

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub display_interval: Seconds,
    pub min_schedule_ahead: Seconds,
    pub schedule_ahead_factor: f64,
    pub connection_defer_delay: Seconds,
    pub supervisor_shutdown_timeout_ms: u64,
}

impl Config {
    pub fn max_schedule_ahead(&self) -> Seconds {
        self.min_schedule_ahead * self.schedule_ahead_factor
    }

    /// Load from `config_path`, or the built-in default when `None`.
    pub fn load(config_path: Option<&Path>) -> Config {
        let toml_str = match config_path {
            None => DEFAULT_CONFIG_TOML.into(),
            Some(path) => std::fs::read_to_string(path)
                .unwrap_or_else(|e| panic!("cannot load config file {path:?}: {e}")),
        };
        toml::from_str(&toml_str)
            .unwrap_or_else(|e| panic!("cannot parse config toml {toml_str:?}: {e}"))
    }
}

impl Default for Config {
    fn default() -> Config {
        Config::load(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_parses() {
        let config = Config::default();
        assert_eq!(0.050, config.display_interval);
        assert_eq!(0.100, config.max_schedule_ahead());
    }

    #[test]
    fn missing_override_file_panics_with_path_in_message() {
        let result = std::panic::catch_unwind(|| {
            Config::load(Some(Path::new("/nonexistent/path/to/config.toml")))
        });
        assert!(result.is_err());
    }
}
