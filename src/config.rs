//! Configuration Module
//!
//! Handles configuration loading from YAML files, environment variables, and
//! command-line arguments, with per-section validation and defaults.

use crate::{GatewayError, Result};
use clap::{Arg, Command};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

/// Custom deserializer for Duration from string format like "30s", "5m", "1h"
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Accepts a decimal number followed by an optional unit suffix.
    /// A bare number means seconds.
    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("duration is empty".to_string());
        }

        let boundary = s
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(s.len());
        let (number, unit) = s.split_at(boundary);
        if number.is_empty() {
            return Err(format!("duration '{}' has no numeric part", s));
        }

        let value: f64 = number
            .parse()
            .map_err(|_| format!("bad number in duration '{}'", s))?;
        if !value.is_finite() || value < 0.0 {
            return Err(format!("duration '{}' is out of range", s));
        }

        let seconds_per_unit = match unit.trim() {
            "" | "s" | "sec" => 1.0,
            "ms" => 1e-3,
            "m" | "min" => 60.0,
            "h" => 3600.0,
            other => return Err(format!("unrecognized duration unit '{}'", other)),
        };

        Ok(Duration::from_secs_f64(value * seconds_per_unit))
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub object: ObjectConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and connection handling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_ssl_port")]
    pub ssl_port: u16,
    /// PEM certificate chain; TLS listener is disabled when empty
    #[serde(default)]
    pub ssl_certfile: String,
    /// PEM private key; must be set together with ssl_certfile
    #[serde(default)]
    pub ssl_keyfile: String,
    /// Number of accept-loop tasks per listener
    #[serde(default = "default_num_of_acceptors")]
    pub num_of_acceptors: usize,
    /// Requests served per keep-alive connection before it is closed
    #[serde(default = "default_max_keepalive")]
    pub max_keepalive: usize,
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

fn default_port() -> u16 {
    8080
}

fn default_ssl_port() -> u16 {
    8443
}

fn default_num_of_acceptors() -> usize {
    16
}

fn default_max_keepalive() -> usize {
    1024
}

fn default_max_concurrent_requests() -> usize {
    200
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            ssl_port: default_ssl_port(),
            ssl_certfile: String::new(),
            ssl_keyfile: String::new(),
            num_of_acceptors: default_num_of_acceptors(),
            max_keepalive: default_max_keepalive(),
            max_concurrent_requests: default_max_concurrent_requests(),
        }
    }
}

impl ServerConfig {
    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.num_of_acceptors == 0 {
            return Err("num_of_acceptors must be at least 1".to_string());
        }
        if self.max_concurrent_requests == 0 {
            return Err("max_concurrent_requests must be at least 1".to_string());
        }
        if self.ssl_certfile.is_empty() != self.ssl_keyfile.is_empty() {
            return Err(
                "ssl_certfile and ssl_keyfile must be set together or not at all".to_string(),
            );
        }
        Ok(())
    }

    /// True when a TLS listener should be started
    pub fn tls_enabled(&self) -> bool {
        !self.ssl_certfile.is_empty()
    }
}

/// Edge cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// "inner" runs the cache inline in the object handlers; anything else
    /// engages the request/response interceptors
    #[serde(default = "default_cache_method")]
    pub cache_method: String,
    /// Freshness TTL
    #[serde(
        deserialize_with = "duration_serde::deserialize",
        serialize_with = "duration_serde::serialize",
        default = "default_cache_expire"
    )]
    pub cache_expire: Duration,
    /// Upper bound on cacheable body size in bytes
    #[serde(default = "default_cache_max_content_len")]
    pub cache_max_content_len: u64,
    /// Content-type allow-list; empty allows any
    #[serde(default)]
    pub cachable_content_type: Vec<String>,
    /// Path regex allow-list; empty allows any
    #[serde(default)]
    pub cachable_path_pattern: Vec<String>,
}

fn default_cache_method() -> String {
    "inner".to_string()
}

fn default_cache_expire() -> Duration {
    Duration::from_secs(300)
}

fn default_cache_max_content_len() -> u64 {
    1024 * 1024
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_method: default_cache_method(),
            cache_expire: default_cache_expire(),
            cache_max_content_len: default_cache_max_content_len(),
            cachable_content_type: Vec::new(),
            cachable_path_pattern: Vec::new(),
        }
    }
}

impl CacheConfig {
    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.cache_expire.is_zero() {
            return Err("cache_expire must be greater than zero".to_string());
        }
        for pattern in &self.cachable_path_pattern {
            if let Err(e) = regex::Regex::new(pattern) {
                return Err(format!("Invalid cachable_path_pattern '{}': {}", pattern, e));
            }
        }
        Ok(())
    }

    /// True when the cache runs inline in the object handlers
    pub fn is_internal_mode(&self) -> bool {
        self.cache_method == "inner"
    }
}

/// Object size thresholds and RPC tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectConfig {
    /// Body size at or above which the large-object path engages
    #[serde(default = "default_threshold_obj_len")]
    pub threshold_obj_len: u64,
    /// Chunk window size for large uploads
    #[serde(default = "default_chunked_obj_len")]
    pub chunked_obj_len: u64,
    /// Absolute upper bound on object size; at or above is rejected with 400
    #[serde(default = "default_max_len_for_obj")]
    pub max_len_for_obj: u64,
    /// Per-RPC timeout against the storage cluster
    #[serde(
        deserialize_with = "duration_serde::deserialize",
        serialize_with = "duration_serde::serialize",
        default = "default_rpc_timeout"
    )]
    pub rpc_timeout: Duration,
}

fn default_threshold_obj_len() -> u64 {
    1024 * 1024
}

fn default_chunked_obj_len() -> u64 {
    5 * 1024 * 1024
}

fn default_max_len_for_obj() -> u64 {
    2 * 1024 * 1024 * 1024
}

fn default_rpc_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for ObjectConfig {
    fn default() -> Self {
        Self {
            threshold_obj_len: default_threshold_obj_len(),
            chunked_obj_len: default_chunked_obj_len(),
            max_len_for_obj: default_max_len_for_obj(),
            rpc_timeout: default_rpc_timeout(),
        }
    }
}

impl ObjectConfig {
    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.chunked_obj_len == 0 {
            return Err("chunked_obj_len must be greater than zero".to_string());
        }
        if self.threshold_obj_len > self.max_len_for_obj {
            return Err(format!(
                "threshold_obj_len ({}) must not exceed max_len_for_obj ({})",
                self.threshold_obj_len, self.max_len_for_obj
            ));
        }
        if self.rpc_timeout.is_zero() {
            return Err("rpc_timeout must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_access_log_enabled")]
    pub access_log_enabled: bool,
    #[serde(default = "default_access_log_dir")]
    pub access_log_dir: PathBuf,
    #[serde(default = "default_app_log_dir")]
    pub app_log_dir: PathBuf,
    #[serde(
        deserialize_with = "duration_serde::deserialize",
        serialize_with = "duration_serde::serialize",
        default = "default_access_log_flush_interval"
    )]
    pub access_log_flush_interval: Duration,
    #[serde(default = "default_access_log_buffer_size")]
    pub access_log_buffer_size: usize,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_access_log_enabled() -> bool {
    true
}

fn default_access_log_dir() -> PathBuf {
    PathBuf::from("/var/log/storage-gateway/access")
}

fn default_app_log_dir() -> PathBuf {
    PathBuf::from("/var/log/storage-gateway/app")
}

fn default_access_log_flush_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_access_log_buffer_size() -> usize {
    1000
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            access_log_enabled: default_access_log_enabled(),
            access_log_dir: default_access_log_dir(),
            app_log_dir: default_app_log_dir(),
            access_log_flush_interval: default_access_log_flush_interval(),
            access_log_buffer_size: default_access_log_buffer_size(),
        }
    }
}

impl Config {
    /// Load configuration from CLI arguments, file, and environment
    pub fn load() -> Result<Self> {
        let matches = Self::build_cli().get_matches();

        let mut config = Self::default();

        // Load from config file if specified
        if let Some(config_path) = matches.get_one::<String>("config") {
            config = Self::load_from_file(config_path)?;
        }

        // Override with environment variables
        config.apply_env_overrides();

        // Override with command line arguments
        config.apply_cli_overrides(&matches);

        config.validate()?;

        info!(
            "Listener: port={}, tls={}, acceptors={}, max_keepalive={}",
            config.server.port,
            if config.server.tls_enabled() {
                format!("on (port {})", config.server.ssl_port)
            } else {
                "off".to_string()
            },
            config.server.num_of_acceptors,
            config.server.max_keepalive
        );
        info!(
            "Edge cache: method={}, expire={}s, max_content_len={}",
            config.cache.cache_method,
            config.cache.cache_expire.as_secs(),
            config.cache.cache_max_content_len
        );
        info!(
            "Object path: threshold={}, chunk={}, max={}, rpc_timeout={}s",
            config.object.threshold_obj_len,
            config.object.chunked_obj_len,
            config.object.max_len_for_obj,
            config.object.rpc_timeout.as_secs()
        );

        debug!("Configuration: {:?}", config);

        Ok(config)
    }

    /// Load configuration from a YAML file
    pub fn load_from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::ConfigError(format!("Failed to read config file {}: {}", path, e))
        })?;
        let config: Config = serde_yaml::from_str(&contents).map_err(|e| {
            GatewayError::ConfigError(format!("Failed to parse config file {}: {}", path, e))
        })?;
        Ok(config)
    }

    /// Validate all sections
    pub fn validate(&self) -> Result<()> {
        self.server
            .validate()
            .map_err(|e| GatewayError::ConfigError(format!("Invalid server configuration: {}", e)))?;
        self.cache
            .validate()
            .map_err(|e| GatewayError::ConfigError(format!("Invalid cache configuration: {}", e)))?;
        self.object
            .validate()
            .map_err(|e| GatewayError::ConfigError(format!("Invalid object configuration: {}", e)))?;
        Ok(())
    }

    /// Build CLI argument parser
    fn build_cli() -> Command {
        Command::new("storage-gateway")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Object-serving HTTP gateway for a content-addressed storage cluster")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path"),
            )
            .arg(
                Arg::new("port")
                    .long("port")
                    .value_name("PORT")
                    .help("Listener port (default: 8080)"),
            )
            .arg(
                Arg::new("ssl-port")
                    .long("ssl-port")
                    .value_name("PORT")
                    .help("TLS listener port (default: 8443)"),
            )
            .arg(
                Arg::new("cache-method")
                    .long("cache-method")
                    .value_name("METHOD")
                    .help("Cache mode: inner (inline) or interceptor"),
            )
            .arg(
                Arg::new("max-concurrent-requests")
                    .long("max-concurrent-requests")
                    .value_name("COUNT")
                    .help("Maximum number of concurrent requests"),
            )
            .arg(
                Arg::new("log-level")
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level: trace, debug, info, warn, error"),
            )
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("GATEWAY_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }

        if let Ok(port) = std::env::var("GATEWAY_SSL_PORT") {
            if let Ok(port) = port.parse() {
                self.server.ssl_port = port;
            }
        }

        if let Ok(method) = std::env::var("GATEWAY_CACHE_METHOD") {
            self.cache.cache_method = method;
        }

        if let Ok(expire) = std::env::var("GATEWAY_CACHE_EXPIRE") {
            if let Ok(secs) = expire.parse::<u64>() {
                self.cache.cache_expire = Duration::from_secs(secs);
            }
        }

        if let Ok(max_requests) = std::env::var("GATEWAY_MAX_CONCURRENT_REQUESTS") {
            if let Ok(max_requests) = max_requests.parse() {
                self.server.max_concurrent_requests = max_requests;
            }
        }

        if let Ok(access_log_dir) = std::env::var("GATEWAY_ACCESS_LOG_DIR") {
            self.logging.access_log_dir = PathBuf::from(access_log_dir);
        }

        if let Ok(app_log_dir) = std::env::var("GATEWAY_APP_LOG_DIR") {
            self.logging.app_log_dir = PathBuf::from(app_log_dir);
        }
    }

    /// Apply command line argument overrides
    fn apply_cli_overrides(&mut self, matches: &clap::ArgMatches) {
        if let Some(port) = matches.get_one::<String>("port") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }

        if let Some(port) = matches.get_one::<String>("ssl-port") {
            if let Ok(port) = port.parse() {
                self.server.ssl_port = port;
            }
        }

        if let Some(method) = matches.get_one::<String>("cache-method") {
            self.cache.cache_method = method.clone();
        }

        if let Some(count) = matches.get_one::<String>("max-concurrent-requests") {
            if let Ok(count) = count.parse() {
                self.server.max_concurrent_requests = count;
            }
        }

        if let Some(level) = matches.get_one::<String>("log-level") {
            self.logging.log_level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.cache.is_internal_mode());
        assert!(!config.server.tls_enabled());
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(
            duration_serde::parse_duration("30s").unwrap(),
            Duration::from_secs(30)
        );
        assert_eq!(
            duration_serde::parse_duration("5m").unwrap(),
            Duration::from_secs(300)
        );
        assert_eq!(
            duration_serde::parse_duration("500ms").unwrap(),
            Duration::from_millis(500)
        );
        // A bare number counts as seconds.
        assert_eq!(
            duration_serde::parse_duration("45").unwrap(),
            Duration::from_secs(45)
        );
        assert!(duration_serde::parse_duration("abc").is_err());
        assert!(duration_serde::parse_duration("10x").is_err());
        assert!(duration_serde::parse_duration("").is_err());
    }

    #[test]
    fn test_yaml_round_trip() {
        let yaml = r#"
server:
  port: 9000
  num_of_acceptors: 4
cache:
  cache_method: interceptor
  cache_expire: "60s"
  cachable_path_pattern:
    - "^/images/.*"
object:
  threshold_obj_len: 1048576
  chunked_obj_len: 2097152
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.num_of_acceptors, 4);
        assert!(!config.cache.is_internal_mode());
        assert_eq!(config.cache.cache_expire, Duration::from_secs(60));
        assert_eq!(config.object.chunked_obj_len, 2 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_regex_rejected() {
        let mut config = Config::default();
        config.cache.cachable_path_pattern = vec!["[unclosed".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_threshold_above_max_rejected() {
        let mut config = Config::default();
        config.object.threshold_obj_len = config.object.max_len_for_obj + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_lonely_ssl_certfile_rejected() {
        let mut config = Config::default();
        config.server.ssl_certfile = "/etc/certs/gateway.pem".to_string();
        assert!(config.validate().is_err());
    }
}
