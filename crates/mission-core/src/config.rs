//! Site configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use mission_common::{LogConfig, LogFormat, RetryConfig};
use mission_net::LoaderConfig;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::{ConfigError, ConfigResult};

/// Cache generation label shipped with the current site build
pub const DEFAULT_CACHE_VERSION: &str = "mission-report-v1";

/// Document served to navigations when neither cache nor network can answer
pub const DEFAULT_FALLBACK_DOCUMENT: &str = "/introduction.html";

/// Assets that must be cached before the site works offline
pub const DEFAULT_CRITICAL_ASSETS: [&str; 4] = [
    "/",
    "/introduction.html",
    "/sources/scripts/index.css",
    "/sources/scripts/index.js",
];

/// Site configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    /// Origin the site is served from
    pub origin: Url,

    /// Path of the worker script; its directory is the default scope
    pub script_path: String,

    /// Cache generation settings
    pub cache: CacheSettings,

    /// Directory holding the durable cache generations
    pub storage_dir: PathBuf,

    /// Network settings
    pub loader: LoaderSettings,

    /// Retry policy for the install step
    pub install_retry: RetryConfig,

    /// Logging settings
    pub log: LogSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Generation label, bumped on deploy
    pub version: String,

    /// Paths preloaded at install time, in order
    pub critical_assets: Vec<String>,

    /// Path of the offline navigation fallback
    pub fallback_document: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderSettings {
    /// User agent string
    pub user_agent: Option<String>,

    /// Accept-Language header
    pub accept_language: String,

    /// Transport timeout in seconds
    pub timeout_secs: u64,

    /// Maximum redirects followed
    pub max_redirects: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Level name (error, warn, info, debug, trace)
    pub level: String,

    /// Output format
    pub format: LogFormat,

    /// Optional EnvFilter directive string
    pub filter: Option<String>,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            origin: default_origin(),
            script_path: "/sw.js".to_string(),
            cache: CacheSettings::default(),
            storage_dir: dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("mission-report")
                .join("caches"),
            loader: LoaderSettings::default(),
            install_retry: RetryConfig::default(),
            log: LogSettings::default(),
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            version: DEFAULT_CACHE_VERSION.to_string(),
            critical_assets: DEFAULT_CRITICAL_ASSETS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            fallback_document: DEFAULT_FALLBACK_DOCUMENT.to_string(),
        }
    }
}

impl Default for LoaderSettings {
    fn default() -> Self {
        let defaults = LoaderConfig::default();
        Self {
            user_agent: None,
            accept_language: defaults.accept_language,
            timeout_secs: defaults.timeout.as_secs(),
            max_redirects: defaults.max_redirects,
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            filter: None,
        }
    }
}

fn default_origin() -> Url {
    Url::parse("http://localhost:8000/").expect("static origin literal is valid")
}

impl SiteConfig {
    /// Load and validate a JSON config file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config: SiteConfig =
            serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        config.validate()?;
        debug!(path = %path.display(), version = %config.cache.version, "Loaded site config");
        Ok(config)
    }

    /// Load `path` if given, otherwise use defaults
    pub fn load_or_default(path: Option<&Path>) -> ConfigResult<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Check the invariants the cache manager relies on
    pub fn validate(&self) -> ConfigResult<()> {
        if !matches!(self.origin.scheme(), "http" | "https") || self.origin.host().is_none() {
            return Err(ConfigError::InvalidOrigin(self.origin.to_string()));
        }

        if self.cache.version.trim().is_empty() {
            return Err(ConfigError::invalid("cache.version must not be empty"));
        }

        for asset in &self.cache.critical_assets {
            if !asset.starts_with('/') {
                return Err(ConfigError::invalid(format!(
                    "critical asset '{asset}' must be an absolute path"
                )));
            }
        }

        if !self
            .cache
            .critical_assets
            .iter()
            .any(|a| a == &self.cache.fallback_document)
        {
            return Err(ConfigError::invalid(format!(
                "fallback document '{}' must be one of the critical assets",
                self.cache.fallback_document
            )));
        }

        if !self.script_path.starts_with('/') {
            return Err(ConfigError::invalid("script_path must be an absolute path"));
        }

        let multiplier = self.install_retry.backoff_multiplier;
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(ConfigError::invalid(format!(
                "install_retry.backoff_multiplier must be at least 1.0, got {multiplier}"
            )));
        }

        Ok(())
    }

    /// Absolute URL of the worker script
    pub fn script_url(&self) -> ConfigResult<Url> {
        self.origin
            .join(&self.script_path)
            .map_err(|e| ConfigError::invalid(format!("script_path: {e}")))
    }

    /// Network settings for [`mission_net::HttpFetcher`]
    pub fn loader_config(&self) -> LoaderConfig {
        let defaults = LoaderConfig::default();
        LoaderConfig {
            user_agent: self.loader.user_agent.clone().unwrap_or(defaults.user_agent),
            accept_language: self.loader.accept_language.clone(),
            timeout: Duration::from_secs(self.loader.timeout_secs),
            max_redirects: self.loader.max_redirects,
        }
    }

    /// Logging settings for [`mission_common::init_logging`]
    pub fn log_config(&self) -> LogConfig {
        // Verbose levels also get source locations and span events
        let base = match self.log.level.to_ascii_lowercase().as_str() {
            "debug" | "trace" => LogConfig::debug(),
            _ => LogConfig::default(),
        };
        let config = base
            .with_level_name(&self.log.level)
            .with_format(self.log.format);
        match self.log.filter {
            Some(ref filter) => config.with_filter(filter.clone()),
            None => config,
        }
    }
}
