//! TOML-based configuration for Gatehouse
//!
//! Both services read one file (`gatehouse.toml`). Every field has a default
//! so an empty file is a valid local setup. Secrets are never written in the
//! file: the `auth.keys_env` field names the environment variable that holds
//! them, and `.env` files are loaded before it is resolved.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure loaded from gatehouse.toml
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatehouseConfig {
    /// Listener settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Key and token settings.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Identity store settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Sales service settings.
    #[serde(default)]
    pub sales: SalesConfig,
}

// ============= Server Configuration =============

/// Listener and logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Default log filter.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[serde(default)]
    pub log_json: bool,

    /// Per-request deadline applied by the pipeline
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Allowed CORS origins, `*` for any
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            log_json: false,
            request_timeout_ms: default_request_timeout_ms(),
            cors_origins: default_cors_origins(),
        }
    }
}

impl ServerConfig {
    /// Per-request deadline.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// `host:port`.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ============= Authentication Configuration =============

/// Key sources and token settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Environment variable holding a JSON object of kid to private PEM
    #[serde(default = "default_keys_env")]
    pub keys_env: String,

    /// Directory of `<kid>.pem` files, empty to skip
    #[serde(default = "default_keys_folder")]
    pub keys_folder: String,

    /// Kid used when the server mints tokens on its own behalf
    #[serde(default = "default_active_kid")]
    pub active_kid: String,

    /// Issuer stamped on and required of tokens.
    #[serde(default = "default_issuer")]
    pub issuer: String,

    /// Tolerance applied to token time checks
    #[serde(default = "default_clock_skew_secs")]
    pub clock_skew_secs: i64,
}

fn default_keys_env() -> String {
    "GATEHOUSE_KEYS".to_string()
}

fn default_keys_folder() -> String {
    "zarf/keys/".to_string()
}

fn default_active_kid() -> String {
    "54bb2165-71e1-41a6-af3e-7da4a0e1e2c1".to_string()
}

fn default_issuer() -> String {
    "service project".to_string()
}

fn default_clock_skew_secs() -> i64 {
    30
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            keys_env: default_keys_env(),
            keys_folder: default_keys_folder(),
            active_kid: default_active_kid(),
            issuer: default_issuer(),
            clock_skew_secs: default_clock_skew_secs(),
        }
    }
}

// ============= Database Configuration =============

/// Identity store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Local database path, `:memory:` for the in-memory store
    #[serde(default = "default_database_url")]
    pub url: String,
}

fn default_database_url() -> String {
    "./data/gatehouse.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

impl DatabaseConfig {
    /// True for the in-memory store.
    pub fn is_memory(&self) -> bool {
        self.url == ":memory:"
    }
}

// ============= Sales Configuration =============

/// Settings used only by the sales service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SalesConfig {
    /// Base URL of the auth service
    #[serde(default = "default_auth_host")]
    pub auth_host: String,

    /// Authorize round-trip bound in milliseconds.
    #[serde(default = "default_authorize_timeout_ms")]
    pub authorize_timeout_ms: u64,

    /// Identity cache entry lifetime
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Identity cache segments.
    #[serde(default = "default_cache_shards")]
    pub cache_shards: usize,
}

fn default_auth_host() -> String {
    "http://localhost:6000".to_string()
}

fn default_authorize_timeout_ms() -> u64 {
    5_000
}

fn default_cache_ttl_secs() -> u64 {
    60
}

fn default_cache_shards() -> usize {
    10
}

impl Default for SalesConfig {
    fn default() -> Self {
        Self {
            auth_host: default_auth_host(),
            authorize_timeout_ms: default_authorize_timeout_ms(),
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_shards: default_cache_shards(),
        }
    }
}

impl SalesConfig {
    /// Authorize round-trip bound.
    pub fn authorize_timeout(&self) -> Duration {
        Duration::from_millis(self.authorize_timeout_ms)
    }

    /// Identity cache entry lifetime.
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

// ============= Configuration Loading & Validation =============

/// Configuration warnings that don't prevent operation but may indicate issues
#[derive(Debug, Clone)]
pub struct ConfigWarning {
    /// What was noticed.
    pub kind: ConfigWarningKind,
    /// Human-readable detail.
    pub message: String,
}

/// Kinds of [`ConfigWarning`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigWarningKind {
    /// CORS allows any origin.
    WildcardCors,
    /// No key source configured.
    NoKeySource,
    /// Users live only in memory.
    MemoryDatabase,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Errors that can occur during configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// No file at the given path.
    #[error("Configuration file not found: {0}")]
    FileNotFound(PathBuf),

    /// File could not be read.
    #[error("Failed to read configuration file: {0}")]
    ReadError(#[from] std::io::Error),

    /// File is not valid TOML.
    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// A referenced variable is unset.
    #[error("Environment variable '{0}' referenced in config is not set")]
    MissingEnvVar(String),
}

impl GatehouseConfig {
    /// Load and validate configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: GatehouseConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for internal consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::ValidationError(
                "server.port must be non-zero".to_string(),
            ));
        }
        if self.server.request_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "server.request_timeout_ms must be positive".to_string(),
            ));
        }
        if self.auth.issuer.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "auth.issuer must not be empty".to_string(),
            ));
        }
        if self.auth.clock_skew_secs < 0 {
            return Err(ConfigError::ValidationError(
                "auth.clock_skew_secs must not be negative".to_string(),
            ));
        }
        if self.sales.authorize_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "sales.authorize_timeout_ms must be positive".to_string(),
            ));
        }
        if self.sales.cache_shards == 0 {
            return Err(ConfigError::ValidationError(
                "sales.cache_shards must be at least 1".to_string(),
            ));
        }
        if !self.sales.auth_host.starts_with("http://") && !self.sales.auth_host.starts_with("https://") {
            return Err(ConfigError::ValidationError(format!(
                "sales.auth_host '{}' must be an http(s) URL",
                self.sales.auth_host
            )));
        }

        Ok(())
    }

    /// Validate configuration with warnings for settings that work but are
    /// rarely intended outside development
    pub fn validate_with_warnings(&self) -> Result<Vec<ConfigWarning>, ConfigError> {
        self.validate()?;

        let mut warnings = Vec::new();

        if self.server.cors_origins.iter().any(|o| o == "*") {
            warnings.push(ConfigWarning {
                kind: ConfigWarningKind::WildcardCors,
                message: "server.cors_origins allows any origin".to_string(),
            });
        }

        if self.resolve_env(&self.auth.keys_env).is_none() && self.auth.keys_folder.is_empty() {
            warnings.push(ConfigWarning {
                kind: ConfigWarningKind::NoKeySource,
                message: format!(
                    "no key source: '{}' is unset and auth.keys_folder is empty",
                    self.auth.keys_env
                ),
            });
        }

        if self.database.is_memory() {
            warnings.push(ConfigWarning {
                kind: ConfigWarningKind::MemoryDatabase,
                message: "database.url is ':memory:', identities are lost on restart".to_string(),
            });
        }

        Ok(warnings)
    }

    /// Get a resolved value from an env var reference
    pub fn resolve_env(&self, env_name: &str) -> Option<String> {
        std::env::var(env_name).ok().filter(|v| !v.is_empty())
    }

    /// Get the key document from the environment
    pub fn keys_document(&self) -> Result<String, ConfigError> {
        self.resolve_env(&self.auth.keys_env)
            .ok_or_else(|| ConfigError::MissingEnvVar(self.auth.keys_env.clone()))
    }
}
