//! Service configuration
//!
//! Loaded once at startup, usually from a JSON file:
//!
//! ```
//! let config = svgshot::Config::from_json_str(r#"{
//!     "pool": { "max": 2, "max_uses": 10 },
//!     "conversion_timeout_ms": 60000
//! }"#).unwrap();
//! assert_eq!(config.pool.max, 2);
//! assert_eq!(config.navigation_timeout_ms, 30000);
//! ```

use crate::capture::CaptureLimits;
use crate::pool::PoolConfig;
use crate::request::Timeouts;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[cfg(feature = "cdp")]
use crate::cdp::ChromeConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub pool: PoolConfig,
    pub capture: CaptureLimits,
    /// Default navigation timeout in milliseconds
    pub navigation_timeout_ms: u64,
    /// Default whole-conversion deadline in milliseconds
    pub conversion_timeout_ms: u64,
    #[cfg(feature = "cdp")]
    pub chrome: ChromeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            capture: CaptureLimits::default(),
            navigation_timeout_ms: 30000,
            conversion_timeout_ms: 300000,
            #[cfg(feature = "cdp")]
            chrome: ChromeConfig::default(),
        }
    }
}

impl Config {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)
            .map_err(|e| Error::ConfigError(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        self.capture.validate()?;
        if self.navigation_timeout_ms == 0 || self.conversion_timeout_ms == 0 {
            return Err(Error::ConfigError("timeouts must be positive".into()));
        }
        Ok(())
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            navigation: Duration::from_millis(self.navigation_timeout_ms),
            conversion: Duration::from_millis(self.conversion_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_gives_defaults() {
        let config = Config::from_json_str("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.timeouts(), Timeouts::default());
        assert_eq!(config.capture.tile_size, 256);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = Config::from_json_str(r#"{ "pool": { "maximum": 3 } }"#).unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
        assert!(Config::from_json_str(r#"{ "threads": 3 }"#).is_err());
    }

    #[test]
    fn invalid_values_are_rejected() {
        for json in [
            r#"{ "pool": { "max": 0 } }"#,
            r#"{ "pool": { "min": 5, "max": 2 } }"#,
            r#"{ "pool": { "max_uses": 0 } }"#,
            r#"{ "capture": { "tile_size": 0 } }"#,
            r#"{ "conversion_timeout_ms": 0 }"#,
        ] {
            let err = Config::from_json_str(json).unwrap_err();
            assert!(matches!(err, Error::ConfigError(_)), "{} gave {:?}", json, err);
        }
    }

    #[test]
    fn loads_from_file() {
        let path = std::env::temp_dir().join(format!("svgshot-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "navigation_timeout_ms": 1234 }"#).unwrap();
        let config = Config::from_json_file(&path).unwrap();
        assert_eq!(config.timeouts().navigation, Duration::from_millis(1234));
        std::fs::remove_file(&path).ok();

        assert!(matches!(
            Config::from_json_file(&path),
            Err(Error::ConfigError(_))
        ));
    }
}
