//! Ambient configuration shared by the CLI and library entry points:
//! timeouts, cache locations, and endpoint selection.

use crate::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_REST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SOAP_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_ELEVATION_TIMEOUT: Duration = Duration::from_secs(20);

/// Process-wide configuration, built once at startup and threaded through
/// every component that needs a timeout, cache path, or endpoint choice.
#[derive(Clone, Debug)]
pub struct Config {
    pub cache_dir: PathBuf,
    pub rest_timeout: Duration,
    pub soap_timeout: Duration,
    pub elevation_timeout: Duration,
    pub https_proxy: Option<String>,
    pub market: String,
    pub language: String,
    pub endpoint: crate::display_catalog::Endpoint,
}

impl Config {
    /// Builds a `Config` rooted at `cache_dir`, with every other field at
    /// its documented default.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            rest_timeout: DEFAULT_REST_TIMEOUT,
            soap_timeout: DEFAULT_SOAP_TIMEOUT,
            elevation_timeout: DEFAULT_ELEVATION_TIMEOUT,
            https_proxy: None,
            market: "US".to_string(),
            language: "en".to_string(),
            endpoint: crate::display_catalog::Endpoint::Production,
        }
    }

    pub fn device_token_cache_path(&self) -> PathBuf {
        self.cache_dir.join("device-token.cache")
    }

    pub fn winget_extract_dir(&self) -> PathBuf {
        self.cache_dir.join("winget")
    }

    pub fn ensure_cache_dir(&self) -> Result<(), crate::Error> {
        std::fs::create_dir_all(&self.cache_dir)?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        let cache_dir = default_cache_dir();
        Self::new(cache_dir)
    }
}

fn default_cache_dir() -> PathBuf {
    let base = std::env::var_os("ProgramData")
        .or_else(|| std::env::var_os("XDG_CACHE_HOME"))
        .map(std::path::PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);

    PathBuf::from_path_buf(base.join("msappkit"))
        .unwrap_or_else(|pb| Path::new("msappkit-cache").join(pb.to_string_lossy().as_ref()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_config_has_documented_timeouts() {
        let config = Config::default();
        assert_eq!(config.rest_timeout, Duration::from_secs(30));
        assert_eq!(config.soap_timeout, Duration::from_secs(60));
        assert_eq!(config.elevation_timeout, Duration::from_secs(20));
    }

    #[test]
    fn derived_paths_are_nested_under_cache_dir() {
        let config = Config::new(PathBuf::from("/tmp/msappkit-test"));
        assert!(config.device_token_cache_path().starts_with(&config.cache_dir));
        assert!(config.winget_extract_dir().starts_with(&config.cache_dir));
    }
}
