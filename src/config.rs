use config::{Config, ConfigError, Environment, File, Map};
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub governance: GovernanceConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Health server port (disabled when unset)
    #[serde(default)]
    pub health_port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    /// JSON-RPC endpoint of the chain hosting the governor
    #[serde(default)]
    pub rpc_url: String,
    /// Governor contract address (0x-prefixed, 20 bytes)
    #[serde(default)]
    pub governor_address: String,
    /// Private key used to sign execution transactions
    #[serde(default)]
    pub signer_key: SignerKey,
    /// Upper bound for any single ledger call
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
}

fn default_call_timeout() -> u64 {
    30
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            rpc_url: String::new(),
            governor_address: String::new(),
            signer_key: SignerKey::default(),
            call_timeout_secs: default_call_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct GovernanceConfig {
    /// Minimum vote tally before a proposal may be executed.
    /// Values above 2^53 must be written as a quoted string in TOML.
    #[serde(default, deserialize_with = "deserialize_vote_count")]
    pub quorum: u128,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between full sweeps of pending proposals
    #[serde(default)]
    pub sweep_interval_secs: u64,
    /// Proposals processed concurrently per sweep / event burst
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_executions: usize,
    /// Seconds between heartbeat log lines
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// How long shutdown waits for in-flight executions
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

fn default_max_concurrent() -> usize {
    4
}

fn default_heartbeat_interval() -> u64 {
    3600
}

fn default_drain_timeout() -> u64 {
    120
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 0,
            max_concurrent_executions: default_max_concurrent(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            drain_timeout_secs: default_drain_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// PostgreSQL URL for the persistent execution ledger.
    /// When unset the ledger lives in memory only.
    #[serde(default)]
    pub database_url: Option<String>,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Signing key material. Redacted in `Debug` and wiped on drop.
#[derive(Clone, Default, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct SignerKey(String);

impl SignerKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for SignerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "SignerKey(<unset>)")
        } else {
            write!(f, "SignerKey(<redacted>)")
        }
    }
}

/// Environment key for the quorum, read raw so values beyond `u64` survive
const QUORUM_ENV: &str = "GOVWATCH_GOVERNANCE__QUORUM";

/// Parse a decimal vote count, tolerating `_` separators and one pair of
/// surrounding quotes (as left by `.env` files and container runtimes).
fn parse_vote_count(raw: &str) -> Result<u128, String> {
    let trimmed = raw.trim();
    let unquoted = trimmed
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| trimmed.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
        .unwrap_or(trimmed);
    unquoted
        .trim()
        .replace('_', "")
        .parse::<u128>()
        .map_err(|e| format!("invalid vote count '{}': {}", raw, e))
}

fn deserialize_vote_count<'de, D>(deserializer: D) -> Result<u128, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(u64),
        Float(f64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Int(v) => Ok(u128::from(v)),
        Raw::Float(v) if v >= 0.0 && v.fract() == 0.0 && v <= 9_007_199_254_740_992.0 => {
            Ok(v as u128)
        }
        Raw::Float(v) => Err(serde::de::Error::custom(format!(
            "vote count {} is not exactly representable; write it as a quoted string in TOML",
            v
        ))),
        Raw::Text(s) => parse_vote_count(&s).map_err(serde::de::Error::custom),
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        Self::load_with_env(config_dir.as_ref(), None)
    }

    /// Load with an explicit environment map instead of the process
    /// environment when `env` is set.
    fn load_with_env(
        config_dir: &Path,
        env: Option<Map<String, String>>,
    ) -> Result<Self, ConfigError> {
        // `try_parsing` turns integers beyond i64 into lossy floats, so the
        // quorum bypasses it and is applied as a string override.
        let raw_quorum = match &env {
            Some(vars) => vars.get(QUORUM_ENV).cloned(),
            None => std::env::var(QUORUM_ENV).ok(),
        };

        let mut builder = Config::builder()
            // Start with default values
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("ledger.call_timeout_secs", 30)?
            .set_default("store.max_connections", 5)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("GOVWATCH_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (GOVWATCH_LEDGER__RPC_URL, etc.)
            .add_source(
                Environment::with_prefix("GOVWATCH")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            );

        if let Some(raw) = raw_quorum {
            let quorum = parse_vote_count(&raw)
                .map_err(|e| ConfigError::Message(format!("{}: {}", QUORUM_ENV, e)))?;
            builder = builder.set_override("governance.quorum", quorum.to_string())?;
        }

        builder.build()?.try_deserialize()
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.sweep_interval_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.ledger.call_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.heartbeat_interval_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.scheduler.drain_timeout_secs)
    }

    /// Validate configuration values.
    ///
    /// Every problem is reported at once so an operator can fix the whole
    /// environment in one pass.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        // Ledger endpoint
        if self.ledger.rpc_url.trim().is_empty() {
            errors.push("ledger.rpc_url is required".to_string());
        } else if let Err(e) = url::Url::parse(self.ledger.rpc_url.trim()) {
            errors.push(format!("ledger.rpc_url is not a valid URL: {}", e));
        }

        let address = self.ledger.governor_address.trim();
        if address.is_empty() {
            errors.push("ledger.governor_address is required".to_string());
        } else if address.parse::<alloy::primitives::Address>().is_err() {
            errors.push(format!(
                "ledger.governor_address is not a valid address: {}",
                address
            ));
        }

        if self.ledger.signer_key.is_empty() {
            errors.push("ledger.signer_key is required".to_string());
        }

        if self.ledger.call_timeout_secs == 0 {
            errors.push("ledger.call_timeout_secs must be positive".to_string());
        }

        // Governance
        if self.governance.quorum == 0 {
            errors.push("governance.quorum is required and must be positive".to_string());
        }

        // Scheduler
        if self.scheduler.sweep_interval_secs == 0 {
            errors.push("scheduler.sweep_interval_secs is required and must be positive".to_string());
        }

        if self.scheduler.max_concurrent_executions == 0 {
            errors.push("scheduler.max_concurrent_executions must be at least 1".to_string());
        }

        if self.scheduler.heartbeat_interval_secs == 0 {
            errors.push("scheduler.heartbeat_interval_secs must be positive".to_string());
        }

        if let Some(url) = &self.store.database_url {
            if url.trim().is_empty() {
                errors.push("store.database_url is set but empty".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// One line per setting, safe to print (no key material)
    pub fn redacted_summary(&self) -> Vec<String> {
        vec![
            format!("ledger.rpc_url = {}", self.ledger.rpc_url),
            format!("ledger.governor_address = {}", self.ledger.governor_address),
            format!("ledger.signer_key = {:?}", self.ledger.signer_key),
            format!("ledger.call_timeout_secs = {}", self.ledger.call_timeout_secs),
            format!("governance.quorum = {}", self.governance.quorum),
            format!(
                "scheduler.sweep_interval_secs = {}",
                self.scheduler.sweep_interval_secs
            ),
            format!(
                "scheduler.max_concurrent_executions = {}",
                self.scheduler.max_concurrent_executions
            ),
            format!(
                "store.database_url = {}",
                if self.store.database_url.is_some() {
                    "<set>"
                } else {
                    "<unset, in-memory ledger>"
                }
            ),
            format!(
                "health_port = {}",
                self.health_port
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "<disabled>".to_string())
            ),
        ]
    }
}
