//! Configuration management for the load balancer.
//!
//! Configuration is read from an optional TOML file and then overridden by
//! `LB_`-prefixed environment variables (`LB_SERVER__PORT=9000`). Every
//! section has serde defaults, so an empty configuration is runnable.

use std::collections::HashSet;
use std::env;

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use thiserror::Error;

use crate::models::Config;

/// Errors that can occur while loading configuration
#[derive(Error, Debug)]
pub enum ConfigLoadError {
    #[error("Configuration source error: {0}")]
    Source(#[from] ConfigError),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Load configuration from the config file and environment variables
pub fn load_config() -> Result<Config, ConfigLoadError> {
    let config_file = env::var("CONFIG_FILE").unwrap_or_else(|_| "config/default.toml".to_string());

    let config: Config = ConfigBuilder::builder()
        .add_source(File::with_name(&config_file).required(false))
        .add_source(
            Environment::with_prefix("LB")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;

    validate(config)
}

/// Reject configurations the engine cannot run with and normalise the rest
pub fn validate(mut config: Config) -> Result<Config, ConfigLoadError> {
    if config.backends.is_empty() {
        return Err(ConfigLoadError::Invalid("at least one backend is required".into()));
    }

    let mut seen = HashSet::new();
    for backend in &config.backends {
        if backend.weight == 0 {
            return Err(ConfigLoadError::Invalid(format!(
                "backend {} has a weight of zero",
                backend.address
            )));
        }
        if !seen.insert(backend.address.as_str()) {
            return Err(ConfigLoadError::Invalid(format!(
                "backend {} is configured twice",
                backend.address
            )));
        }
    }

    if config.rate_limit.points == 0 {
        return Err(ConfigLoadError::Invalid("rate_limit.points must be non-zero".into()));
    }
    if config.rate_limit.duration_ms == 0 {
        return Err(ConfigLoadError::Invalid("rate_limit.duration_ms must be non-zero".into()));
    }
    if config.ddos_detection.sweep_interval_ms == 0 {
        return Err(ConfigLoadError::Invalid(
            "ddos_detection.sweep_interval_ms must be non-zero".into(),
        ));
    }
    if config.health_check.interval_ms == 0 {
        return Err(ConfigLoadError::Invalid("health_check.interval_ms must be non-zero".into()));
    }

    let detection = &mut config.ddos_detection;
    detection.challenge_ratio = detection.challenge_ratio.clamp(0.0, 1.0);
    detection.blocked_countries = detection
        .blocked_countries
        .iter()
        .map(|c| c.to_ascii_uppercase())
        .collect();
    detection.bot_signatures = detection
        .bot_signatures
        .iter()
        .map(|s| s.to_ascii_lowercase())
        .collect();

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BackendConfig;

    #[test]
    fn test_defaults_are_valid() {
        let config = validate(Config::default()).unwrap();
        assert_eq!(config.backends.len(), 4);
        assert_eq!(config.rate_limit.points, 20);
    }

    #[test]
    fn test_rejects_empty_backends() {
        let config = Config {
            backends: Vec::new(),
            ..Config::default()
        };
        assert!(matches!(validate(config), Err(ConfigLoadError::Invalid(_))));
    }

    #[test]
    fn test_rejects_zero_weight() {
        let config = Config {
            backends: vec![BackendConfig {
                address: "http://localhost:3001".into(),
                weight: 0,
            }],
            ..Config::default()
        };
        assert!(validate(config).is_err());
    }

    #[test]
    fn test_normalises_lists() {
        let mut config = Config::default();
        config.ddos_detection.challenge_ratio = 4.0;
        config.ddos_detection.blocked_countries = vec!["kp".into()];
        config.ddos_detection.bot_signatures = vec!["HeadlessChrome".into()];

        let config = validate(config).unwrap();
        assert_eq!(config.ddos_detection.challenge_ratio, 1.0);
        assert_eq!(config.ddos_detection.blocked_countries, vec!["KP".to_string()]);
        assert_eq!(config.ddos_detection.bot_signatures, vec!["headlesschrome".to_string()]);
    }

    #[test]
    fn test_parses_toml_source() {
        let toml = r#"
            [routing]
            policy = "latency_ranked"

            [rate_limit]
            points = 5

            [[backends]]
            address = "http://10.0.0.1:80"
            weight = 3
        "#;
        let config: Config = ConfigBuilder::builder()
            .add_source(File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.routing.policy, crate::models::RoutingPolicy::LatencyRanked);
        assert_eq!(config.rate_limit.points, 5);
        assert_eq!(config.rate_limit.duration_ms, 1_000);
        assert_eq!(config.backends.len(), 1);
        assert_eq!(config.backends[0].weight, 3);
    }
}
