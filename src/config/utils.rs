/// Configuration utilities - loading and parsing
///
/// There is no global configuration instance: callers load an
/// `EngineConfig` and hand it to `CallEngine::from_config`.
use super::schemas::EngineConfig;
use crate::errors::ConfigError;
use crate::logger::{self, LogTag};
use std::path::Path;

/// Default configuration file path
pub const CONFIG_FILE_PATH: &str = "data/geocall.toml";

/// Parse and validate configuration from TOML text
pub fn parse_config(contents: &str) -> Result<EngineConfig, ConfigError> {
    let config = toml::from_str::<EngineConfig>(contents)?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from a TOML file
///
/// A missing file yields the defaults; an unreadable or invalid file is an error.
pub fn load_config_from_path(path: impl AsRef<Path>) -> Result<EngineConfig, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        logger::warning(
            LogTag::Config,
            &format!("Config file '{}' not found, using default values", path.display()),
        );
        return Ok(EngineConfig::default());
    }

    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let config = parse_config(&contents)?;

    logger::info(LogTag::Config, &format!("Loaded config from '{}'", path.display()));
    Ok(config)
}

/// Load from `CONFIG_FILE_PATH`
pub fn load_config() -> Result<EngineConfig, ConfigError> {
    load_config_from_path(CONFIG_FILE_PATH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = parse_config(
            r#"
            [cache]
            capacity = 250

            [geocode]
            rate_per_second = 0.5

            [routing.retry]
            max_attempts = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.cache.capacity, 250);
        assert_eq!(config.cache.default_ttl_secs, 3600);
        assert_eq!(config.geocode.rate_per_second, 0.5);
        // Untouched fields keep the per-service preset
        assert_eq!(config.geocode.burst, 1);
        assert_eq!(config.geocode.cache_ttl_secs, 86_400);
        assert_eq!(config.routing.retry.max_attempts, 5);
        assert_eq!(config.routing.retry.initial_delay_ms, 500);
        assert_eq!(config.routing.rate_per_second, 5.0);
        assert_eq!(config.routing.burst, 5);
        assert_eq!(config.routing.cache_ttl_secs, 3600);
        assert_eq!(config.map_features, EngineConfig::default().map_features);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = parse_config("[geocode]\nburst = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));

        let err = parse_config("[geocode\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[map_features]\nrate_per_second = 4.0\nburst = 8").unwrap();

        let config = load_config_from_path(file.path()).unwrap();
        assert_eq!(config.map_features.rate_per_second, 4.0);
        assert_eq!(config.map_features.burst, 8);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from_path(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, EngineConfig::default());
    }
}
