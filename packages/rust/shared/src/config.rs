//! Application configuration for enrichkit.
//!
//! User config lives at `~/.enrichkit/enrichkit.toml`.
//! CLI flags override config file values, which override defaults.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EnrichError, Result};
use crate::types::LookupKind;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "enrichkit.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".enrichkit";

/// Default database file name inside the config directory.
const DATABASE_FILE_NAME: &str = "enrichkit.db";

// ---------------------------------------------------------------------------
// Config structs (matching enrichkit.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Retry/backoff policy.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Lookup cache policy.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Per-call timeouts.
    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    /// Token-bucket limits keyed by lookup kind (`linkedin-search`, ...).
    #[serde(default = "default_rate_limits")]
    pub rate_limits: HashMap<String, RateLimitConfig>,

    /// External source endpoints.
    #[serde(default)]
    pub sources: SourcesConfig,

    /// Work stack settings.
    #[serde(default)]
    pub stack: StackConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            defaults: DefaultsConfig::default(),
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            timeouts: TimeoutsConfig::default(),
            rate_limits: default_rate_limits(),
            sources: SourcesConfig::default(),
            stack: StackConfig::default(),
        }
    }
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Database path. Empty means `~/.enrichkit/enrichkit.db`.
    #[serde(default)]
    pub database_path: String,

    /// Worker pool size.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Rows fetched per pending-record page.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            database_path: String::new(),
            workers: default_workers(),
            page_size: default_page_size(),
        }
    }
}

fn default_workers() -> usize {
    8
}
fn default_page_size() -> u32 {
    500
}

/// `[retry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries allowed after the first attempt for transient failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Backoff base delay in ms (doubled per attempt).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff cap in ms.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    60_000
}

/// `[cache]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Default entry TTL in seconds.
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,

    /// In-memory capacity (0 = unbounded).
    #[serde(default = "default_cache_capacity")]
    pub max_entries: usize,

    /// Also persist lookups in the database.
    #[serde(default = "default_true")]
    pub persistent: bool,

    /// TTL overrides per lookup kind, in seconds.
    #[serde(default)]
    pub ttl_overrides: HashMap<String, u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl(),
            max_entries: default_cache_capacity(),
            persistent: true,
            ttl_overrides: HashMap::new(),
        }
    }
}

fn default_cache_ttl() -> u64 {
    7 * 24 * 60 * 60
}
fn default_cache_capacity() -> usize {
    100_000
}
fn default_true() -> bool {
    true
}

/// `[timeouts]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    /// Per adapter call.
    #[serde(default = "default_lookup_timeout")]
    pub lookup_timeout_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            lookup_timeout_ms: default_lookup_timeout(),
        }
    }
}

fn default_lookup_timeout() -> u64 {
    30_000
}

/// `[rate_limits.<kind>]` entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Sustained requests per second.
    pub per_second: f64,
    /// Bucket size.
    #[serde(default = "default_burst")]
    pub burst: u32,
}

fn default_burst() -> u32 {
    1
}

fn default_rate_limits() -> HashMap<String, RateLimitConfig> {
    HashMap::from([
        (
            LookupKind::LinkedinSearch.as_str().to_string(),
            RateLimitConfig {
                per_second: 2.0,
                burst: 2,
            },
        ),
        (
            LookupKind::ProfilePage.as_str().to_string(),
            RateLimitConfig {
                per_second: 1.0,
                burst: 1,
            },
        ),
        (
            LookupKind::Location.as_str().to_string(),
            RateLimitConfig {
                per_second: 10.0,
                burst: 5,
            },
        ),
    ])
}

/// `[sources]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesConfig {
    /// Base URL of the profile lookup API (`{base}/{email}/{name}`).
    #[serde(default)]
    pub lookup_api_url: String,

    /// Name of the env var holding the lookup API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub lookup_api_key_env: String,

    /// Subscriber page template; `{id}` is replaced by the record id.
    #[serde(default)]
    pub location_url_template: String,

    /// Name of the env var holding the cookie header for subscriber pages.
    #[serde(default = "default_cookie_env")]
    pub location_cookie_env: String,

    /// Extra personal email domains on top of the built-in list.
    #[serde(default)]
    pub personal_domains: Vec<String>,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            lookup_api_url: String::new(),
            lookup_api_key_env: default_api_key_env(),
            location_url_template: String::new(),
            location_cookie_env: default_cookie_env(),
            personal_domains: Vec::new(),
        }
    }
}

fn default_api_key_env() -> String {
    "ENRICHKIT_LOOKUP_API_KEY".into()
}
fn default_cookie_env() -> String {
    "ENRICHKIT_LOCATION_COOKIE".into()
}

/// `[stack]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackConfig {
    /// Stack that discovered profile URLs are pushed to.
    #[serde(default = "default_stack_name")]
    pub name: String,

    /// Items moved per drain.
    #[serde(default = "default_drain_size")]
    pub drain_size: u32,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            name: default_stack_name(),
            drain_size: default_drain_size(),
        }
    }
}

fn default_stack_name() -> String {
    "linkedin".into()
}
fn default_drain_size() -> u32 {
    1_000
}

// ---------------------------------------------------------------------------
// Pipeline config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Token bucket parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    pub per_second: f64,
    pub burst: u32,
}

/// Runtime pipeline configuration, merged from config file and CLI flags.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// Pending-record page size.
    pub page_size: u32,
    /// Retries after the first attempt for transient failures.
    pub max_retries: u32,
    /// Backoff base delay.
    pub base_delay: Duration,
    /// Backoff cap.
    pub max_delay: Duration,
    /// Per adapter call timeout.
    pub lookup_timeout: Duration,
    /// Default cache TTL.
    pub cache_ttl: Duration,
    /// Cache TTL per kind, falling back to `cache_ttl`.
    pub cache_ttl_overrides: HashMap<LookupKind, Duration>,
    /// In-memory cache capacity (`None` = unbounded).
    pub cache_capacity: Option<usize>,
    /// Whether lookups are also cached in the database.
    pub persistent_cache: bool,
    /// Rate limits per kind; kinds without an entry are unlimited.
    pub rate_limits: HashMap<LookupKind, RateLimit>,
    /// Stack that discovered URLs go to.
    pub stack_name: String,
}

impl PipelineConfig {
    /// TTL for cache entries of `kind`.
    pub fn ttl_for(&self, kind: LookupKind) -> Duration {
        self.cache_ttl_overrides
            .get(&kind)
            .copied()
            .unwrap_or(self.cache_ttl)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for PipelineConfig {
    fn from(config: &AppConfig) -> Self {
        let by_kind = |name: &str| name.parse::<LookupKind>().ok();

        Self {
            workers: config.defaults.workers.max(1),
            page_size: config.defaults.page_size.max(1),
            max_retries: config.retry.max_retries,
            base_delay: Duration::from_millis(config.retry.base_delay_ms),
            max_delay: Duration::from_millis(config.retry.max_delay_ms),
            lookup_timeout: Duration::from_millis(config.timeouts.lookup_timeout_ms),
            cache_ttl: Duration::from_secs(config.cache.ttl_secs),
            cache_ttl_overrides: config
                .cache
                .ttl_overrides
                .iter()
                .filter_map(|(k, secs)| Some((by_kind(k)?, Duration::from_secs(*secs))))
                .collect(),
            cache_capacity: (config.cache.max_entries > 0).then_some(config.cache.max_entries),
            persistent_cache: config.cache.persistent,
            rate_limits: config
                .rate_limits
                .iter()
                .filter_map(|(k, rl)| {
                    Some((
                        by_kind(k)?,
                        RateLimit {
                            per_second: rl.per_second,
                            burst: rl.burst.max(1),
                        },
                    ))
                })
                .collect(),
            stack_name: config.stack.name.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.enrichkit/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| EnrichError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.enrichkit/enrichkit.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Resolve the database path, defaulting to the config directory.
pub fn database_path(config: &AppConfig) -> Result<PathBuf> {
    let configured = config.defaults.database_path.trim();
    if configured.is_empty() {
        return Ok(config_dir()?.join(DATABASE_FILE_NAME));
    }
    if let Some(rest) = configured.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| EnrichError::config("could not determine home directory"))?;
        return Ok(home.join(rest));
    }
    Ok(PathBuf::from(configured))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| EnrichError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| EnrichError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| EnrichError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| EnrichError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| EnrichError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read the lookup API key from the configured env var.
pub fn lookup_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.sources.lookup_api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(EnrichError::config(format!(
            "lookup API key not found. Set the {var_name} environment variable."
        ))),
    }
}
