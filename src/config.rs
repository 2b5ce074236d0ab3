//! Configuration types, read from the environment.
//!
//! Every section has a `from_env()` constructor. Optional values fall back to
//! defaults; a value that is present but unparsable is an error rather than
//! silently ignored.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Source of configuration values, keyed by environment variable name.
type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn required(lookup: Lookup<'_>, key: &str) -> Result<String, ConfigError> {
    lookup(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
}

fn parsed<T>(lookup: Lookup<'_>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn secs(lookup: Lookup<'_>, key: &str, default: u64) -> Result<Duration, ConfigError> {
    parsed(lookup, key, default).map(Duration::from_secs)
}

// ── Server ──────────────────────────────────────────────────────────

/// HTTP listener configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Upper bound on handling one HTTP request.
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&env_lookup)
    }

    fn from_lookup(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            bind_addr: parsed(lookup, "CHATROUTE_BIND", defaults.bind_addr)?,
            request_timeout: secs(lookup, "CHATROUTE_REQUEST_TIMEOUT_SECS", 30)?,
        })
    }
}

// ── Store ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub db_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/chatroute.db"),
        }
    }
}

impl StoreConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&env_lookup)
    }

    fn from_lookup(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            db_path: lookup("CHATROUTE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| Self::default().db_path),
        })
    }
}

// ── Queue ───────────────────────────────────────────────────────────

/// Queue processing and retry policy.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Attempts before a job is marked failed.
    pub max_attempts: i64,
    /// Jobs claimed per sweep.
    pub batch_size: usize,
    /// How long a claimed job stays hidden from other sweeps.
    pub visibility_timeout: Duration,
    /// Interval of the background sweep.
    pub sweep_interval: Duration,
    /// First retry delay; doubles per attempt.
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub default_priority: i64,
    /// Priority of jobs that deliver a conversation to human support.
    pub handoff_priority: i64,
    /// How long processed message ids are remembered for deduplication.
    pub ledger_retention: Duration,
    /// Capacity of the processor nudge channel.
    pub nudge_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            batch_size: 10,
            visibility_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
            default_priority: 0,
            handoff_priority: 10,
            ledger_retention: Duration::from_secs(7 * 24 * 3600),
            nudge_capacity: 16,
        }
    }
}

impl QueueConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&env_lookup)
    }

    fn from_lookup(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        let d = Self::default();
        let config = Self {
            max_attempts: parsed(lookup, "CHATROUTE_QUEUE_MAX_ATTEMPTS", d.max_attempts)?,
            batch_size: parsed(lookup, "CHATROUTE_QUEUE_BATCH_SIZE", d.batch_size)?,
            visibility_timeout: secs(lookup, "CHATROUTE_QUEUE_VISIBILITY_SECS", 60)?,
            sweep_interval: secs(lookup, "CHATROUTE_QUEUE_SWEEP_SECS", 30)?,
            backoff_base: secs(lookup, "CHATROUTE_QUEUE_BACKOFF_BASE_SECS", 5)?,
            backoff_max: secs(lookup, "CHATROUTE_QUEUE_BACKOFF_MAX_SECS", 300)?,
            default_priority: parsed(lookup, "CHATROUTE_QUEUE_DEFAULT_PRIORITY", d.default_priority)?,
            handoff_priority: parsed(lookup, "CHATROUTE_QUEUE_HANDOFF_PRIORITY", d.handoff_priority)?,
            ledger_retention: secs(lookup, "CHATROUTE_LEDGER_RETENTION_SECS", 7 * 24 * 3600)?,
            nudge_capacity: d.nudge_capacity,
        };

        if config.max_attempts < 1 {
            return Err(ConfigError::InvalidValue {
                key: "CHATROUTE_QUEUE_MAX_ATTEMPTS".into(),
                message: "must be at least 1".into(),
            });
        }
        if config.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CHATROUTE_QUEUE_BATCH_SIZE".into(),
                message: "must be at least 1".into(),
            });
        }
        if config.sweep_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "CHATROUTE_QUEUE_SWEEP_SECS".into(),
                message: "must be at least 1".into(),
            });
        }
        Ok(config)
    }

    /// Retry delay after the `attempts`-th failure: `base * 2^(attempts-1)`, capped.
    pub fn backoff_for(&self, attempts: i64) -> Duration {
        let exponent = (attempts - 1).clamp(0, 31) as u32;
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.backoff_max)
    }
}

// ── Outbound transport ──────────────────────────────────────────────

/// WhatsApp messaging API credentials.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Base URL, e.g. `https://api.example.com/v1`.
    pub api_url: String,
    pub instance_id: String,
    pub api_token: SecretString,
    pub timeout: Duration,
}

impl TransportConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&env_lookup)
    }

    fn from_lookup(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            api_url: required(lookup, "WHATSAPP_API_URL")?
                .trim_end_matches('/')
                .to_string(),
            instance_id: required(lookup, "WHATSAPP_INSTANCE_ID")?,
            api_token: SecretString::from(required(lookup, "WHATSAPP_API_TOKEN")?),
            timeout: secs(lookup, "WHATSAPP_TIMEOUT_SECS", 10)?,
        })
    }
}

/// Human-support console ingestion endpoint.
#[derive(Debug, Clone)]
pub struct HumanSupportConfig {
    pub url: String,
    pub timeout: Duration,
}

impl HumanSupportConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&env_lookup)
    }

    fn from_lookup(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            url: required(lookup, "HUMAN_SUPPORT_URL")?,
            timeout: secs(lookup, "HUMAN_SUPPORT_TIMEOUT_SECS", 10)?,
        })
    }
}

// ── Logging ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{other}' (expected json or pretty)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Write daily-rotated log files here instead of stderr.
    pub dir: Option<PathBuf>,
    /// Fallback filter when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            dir: None,
            filter: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&env_lookup)
    }

    fn from_lookup(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            format: parsed(lookup, "CHATROUTE_LOG_FORMAT", LogFormat::Pretty)?,
            dir: lookup("CHATROUTE_LOG_DIR").map(PathBuf::from),
            filter: lookup("CHATROUTE_LOG_FILTER").unwrap_or_else(|| "info".to_string()),
        })
    }
}

// ── Aggregate ───────────────────────────────────────────────────────

/// Everything the binary needs to start.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub queue: QueueConfig,
    pub transport: TransportConfig,
    pub human_support: HumanSupportConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&env_lookup)
    }

    fn from_lookup(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            server: ServerConfig::from_lookup(lookup)?,
            store: StoreConfig::from_lookup(lookup)?,
            queue: QueueConfig::from_lookup(lookup)?,
            transport: TransportConfig::from_lookup(lookup)?,
            human_support: HumanSupportConfig::from_lookup(lookup)?,
            logging: LoggingConfig::from_lookup(lookup)?,
        })
    }
}
