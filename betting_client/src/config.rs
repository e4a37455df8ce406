//! Client configuration
//!
//! Built-in defaults, then an optional TOML file, then `BETTING_*`
//! environment variables (a `.env` file is honoured), then validation. The
//! signing key is only ever read from the environment.

use std::{
    env, fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use ethereum_types::Address;
use serde::{
    de::{
        value::{Error as DeError, StrDeserializer},
        IntoDeserializer,
    },
    Deserialize, Serialize,
};
use tracing::{info, warn};

use crate::{
    hook::PoolKey,
    phase_clock::{BatchSchedule, DEFAULT_COMMIT_DURATION, DEFAULT_REVEAL_DURATION},
};

const ENV_PREFIX: &str = "BETTING_";

/// Largest uint24 / int24 values the pool key can carry
const MAX_FEE: u32 = (1 << 24) - 1;
const MAX_TICK_SPACING: i32 = (1 << 23) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Staging,
    Production,
    Test,
}

impl Environment {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "production" | "prod" => Environment::Production,
            "staging" | "stage" => Environment::Staging,
            "test" | "testing" => Environment::Test,
            _ => Environment::Development,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Staging => "staging",
            Environment::Production => "production",
            Environment::Test => "test",
        }
    }
}

impl Default for Environment {
    fn default() -> Self {
        Environment::Development
    }
}

/// String that never shows up in `Debug` output or serialized config
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretString(***)")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub environment: Environment,
    pub chain: ChainConfig,
    pub market: MarketConfig,
    pub batch: BatchConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub rpc_url: String,
    pub chain_id: u64,
    /// Deployed private betting hook
    pub hook_address: Address,
    /// Receipt polling interval while waiting for confirmation
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Stop waiting after this long; `None` waits indefinitely
    #[serde(with = "humantime_serde")]
    pub confirmation_timeout: Option<Duration>,
    #[serde(skip)]
    pub private_key: Option<SecretString>,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://localhost:8545".to_string(),
            chain_id: 31337,
            hook_address: Address::zero(),
            poll_interval: Duration::from_secs(2),
            confirmation_timeout: None,
            private_key: None,
        }
    }
}

/// Pool the market lives in; `hooks` is always the configured hook
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    pub currency0: Address,
    pub currency1: Address,
    pub fee: u32,
    pub tick_spacing: i32,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            currency0: Address::zero(),
            currency1: Address::zero(),
            fee: 3000,
            tick_spacing: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    #[serde(with = "humantime_serde")]
    pub commit_duration: Duration,
    #[serde(with = "humantime_serde")]
    pub reveal_duration: Duration,
    /// Read `BATCH_DURATION` / `REVEAL_WINDOW` from the hook on connect
    pub sync_from_chain: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            commit_duration: DEFAULT_COMMIT_DURATION,
            reveal_duration: DEFAULT_REVEAL_DURATION,
            sync_from_chain: false,
        }
    }
}

impl BatchConfig {
    pub fn schedule(&self) -> BatchSchedule {
        BatchSchedule::new(self.commit_duration, self.reveal_duration)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory of the file-backed secret store
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".betting_client"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("Configuration file error: {0}")]
    FileError(String),

    #[error("Environment variable error: {0}")]
    EnvError(String),
}

impl ClientConfig {
    /// Layered load; `path` is an optional TOML file
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if dotenv::dotenv().is_ok() {
            info!("Loaded .env file");
        }

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;

        info!(
            environment = config.environment.as_str(),
            chain_id = config.chain.chain_id,
            hook = ?config.chain.hook_address,
            "Configuration loaded"
        );
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::FileError(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
            .map_err(|e| ConfigError::FileError(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::FileError(e.to_string()))
    }

    /// Pool key of the configured market
    pub fn pool_key(&self) -> PoolKey {
        PoolKey {
            currency0: self.market.currency0,
            currency1: self.market.currency1,
            fee: self.market.fee,
            tick_spacing: self.market.tick_spacing,
            hooks: self.chain.hook_address,
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = env_var("ENVIRONMENT") {
            self.environment = Environment::from_str(&value);
        }

        if let Some(value) = env_var("RPC_URL") {
            self.chain.rpc_url = value;
        }
        if let Some(value) = env_var("CHAIN_ID") {
            self.chain.chain_id = parse_env("CHAIN_ID", &value)?;
        }
        if let Some(value) = env_var("HOOK_ADDRESS") {
            self.chain.hook_address = parse_env("HOOK_ADDRESS", &value)?;
        }
        if let Some(value) = env_var("POLL_INTERVAL") {
            self.chain.poll_interval = parse_duration("POLL_INTERVAL", &value)?;
        }
        if let Some(value) = env_var("CONFIRMATION_TIMEOUT") {
            self.chain.confirmation_timeout = Some(parse_duration("CONFIRMATION_TIMEOUT", &value)?);
        }
        if let Some(value) = env_var("PRIVATE_KEY") {
            self.chain.private_key = Some(SecretString::new(value));
        }

        if let Some(value) = env_var("CURRENCY0") {
            self.market.currency0 = parse_env("CURRENCY0", &value)?;
        }
        if let Some(value) = env_var("CURRENCY1") {
            self.market.currency1 = parse_env("CURRENCY1", &value)?;
        }
        if let Some(value) = env_var("POOL_FEE") {
            self.market.fee = parse_env("POOL_FEE", &value)?;
        }
        if let Some(value) = env_var("TICK_SPACING") {
            self.market.tick_spacing = parse_env("TICK_SPACING", &value)?;
        }

        if let Some(value) = env_var("COMMIT_DURATION") {
            self.batch.commit_duration = parse_duration("COMMIT_DURATION", &value)?;
        }
        if let Some(value) = env_var("REVEAL_DURATION") {
            self.batch.reveal_duration = parse_duration("REVEAL_DURATION", &value)?;
        }
        if let Some(value) = env_var("SYNC_SCHEDULE") {
            self.batch.sync_from_chain = parse_env("SYNC_SCHEDULE", &value)?;
        }

        if let Some(value) = env_var("DATA_DIR") {
            self.storage.data_dir = PathBuf::from(value);
        }
        if let Some(value) = env_var("LOG_LEVEL") {
            self.logging.level = value;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let rpc_url = self.chain.rpc_url.trim();
        if rpc_url.is_empty() {
            return Err(ConfigError::MissingRequired("chain.rpc_url".to_string()));
        }
        // the chain client only has an HTTP transport
        if !["http://", "https://"]
            .iter()
            .any(|scheme| rpc_url.starts_with(scheme))
        {
            return Err(ConfigError::InvalidValue(format!(
                "chain.rpc_url must be http(s): {}",
                rpc_url
            )));
        }
        if self.chain.hook_address.is_zero() {
            return Err(ConfigError::MissingRequired("chain.hook_address".to_string()));
        }
        if self.chain.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "chain.poll_interval must be greater than zero".to_string(),
            ));
        }

        if self.market.currency0 >= self.market.currency1 {
            return Err(ConfigError::InvalidValue(
                "market.currency0 must sort below market.currency1".to_string(),
            ));
        }
        if self.market.fee > MAX_FEE {
            return Err(ConfigError::InvalidValue(format!(
                "market.fee {} does not fit in uint24",
                self.market.fee
            )));
        }
        if self.market.tick_spacing <= 0 || self.market.tick_spacing > MAX_TICK_SPACING {
            return Err(ConfigError::InvalidValue(format!(
                "market.tick_spacing {} out of range",
                self.market.tick_spacing
            )));
        }

        if self.batch.commit_duration.is_zero() || self.batch.reveal_duration.is_zero() {
            return Err(ConfigError::InvalidValue(
                "batch durations must be greater than zero".to_string(),
            ));
        }

        if self.environment == Environment::Production {
            if rpc_url.contains("://localhost") || rpc_url.contains("://127.0.0.1") {
                return Err(ConfigError::InvalidValue(
                    "local RPC endpoint not allowed in production".to_string(),
                ));
            }
            if self.chain.private_key.is_none() {
                warn!("No signing key configured; the client will be read-only");
            }
        }

        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(format!("{}{}", ENV_PREFIX, name))
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn parse_env<T: FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::EnvError(format!("{}{}={:?}", ENV_PREFIX, name, value)))
}

/// Same syntax as the file: "500ms", "5m", "1h 30m"
fn parse_duration(name: &str, value: &str) -> Result<Duration, ConfigError> {
    let deserializer: StrDeserializer<'_, DeError> = value.trim().into_deserializer();
    humantime_serde::deserialize(deserializer)
        .map_err(|e: DeError| ConfigError::EnvError(format!("{}{}: {}", ENV_PREFIX, name, e)))
}
