// Configuration management with layered configuration (file, env)

use chrono::NaiveTime;
use chrono_tz::Tz;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub database: DatabaseConfig,
    pub nats: NatsConfig,
    pub chain: ChainConfig,
    pub scheduler: SchedulerConfig,
    pub policy: PolicyConfig,
    pub oracle: OracleConfig,
    pub notifier: NotifierConfig,
    pub links: LinksConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsConfig {
    pub url: String,
    pub stream_name: String,
    pub subject_prefix: String,
    pub publish_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub node_url: String,
    #[serde(default)]
    pub api_key: String,
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub launch_retry_seconds: u64,
    pub epoch_recheck_seconds: u64,
    pub identity_refresh_seconds: u64,
    pub state_poll_seconds: u64,
}

/// Business policy behind percent-of-epoch triggers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub blocks_per_minute: u32,
    /// Time of day percent triggers are moved to, `HH:MM:SS`
    pub snap_time: String,
    pub snap_timezone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    pub initial_cursor: u64,
    pub idle_delay_ms: u64,
    pub error_delay_ms: u64,
    pub step_delay_ms: u64,
    pub reveal_delay_blocks: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Nats,
    Log,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    pub transport: TransportKind,
    pub templates_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinksConfig {
    pub oracle_view_url: String,
    pub wallet_url: String,
    pub explorer_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    #[serde(default)]
    pub metrics_port: u16,
}

/// Parsed form of [`PolicyConfig`] handed to the fire-time calculations
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochPolicy {
    pub blocks_per_minute: u32,
    pub snap_time: NaiveTime,
    pub snap_timezone: Tz,
}

impl Default for EpochPolicy {
    fn default() -> Self {
        Self {
            blocks_per_minute: 3,
            snap_time: NaiveTime::from_hms_opt(13, 30, 0).unwrap_or(NaiveTime::MIN),
            snap_timezone: Tz::UTC,
        }
    }
}

impl PolicyConfig {
    pub fn parse(&self) -> Result<EpochPolicy, String> {
        if self.blocks_per_minute == 0 {
            return Err("Policy blocks_per_minute must be greater than 0".to_string());
        }
        let snap_time = NaiveTime::parse_from_str(&self.snap_time, "%H:%M:%S")
            .map_err(|e| format!("Invalid policy snap_time '{}': {}", self.snap_time, e))?;
        let snap_timezone = Tz::from_str(&self.snap_timezone)
            .map_err(|e| format!("Invalid policy snap_timezone '{}': {}", self.snap_timezone, e))?;

        Ok(EpochPolicy {
            blocks_per_minute: self.blocks_per_minute,
            snap_time,
            snap_timezone,
        })
    }
}

impl SchedulerConfig {
    pub fn launch_retry(&self) -> Duration {
        Duration::from_secs(self.launch_retry_seconds)
    }

    pub fn epoch_recheck(&self) -> Duration {
        Duration::from_secs(self.epoch_recheck_seconds)
    }

    pub fn identity_refresh(&self) -> Duration {
        Duration::from_secs(self.identity_refresh_seconds)
    }

    pub fn state_poll(&self) -> Duration {
        Duration::from_secs(self.state_poll_seconds)
    }
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.database.url.is_empty() {
            return Err("Database URL cannot be empty".to_string());
        }
        if self.database.max_connections == 0 {
            return Err("Database max_connections must be greater than 0".to_string());
        }

        if self.notifier.transport == TransportKind::Nats {
            if self.nats.url.is_empty() {
                return Err("NATS URL cannot be empty".to_string());
            }
            if self.nats.stream_name.is_empty() {
                return Err("NATS stream_name cannot be empty".to_string());
            }
        }

        if self.chain.node_url.is_empty() {
            return Err("Chain node_url cannot be empty".to_string());
        }
        if self.chain.request_timeout_seconds == 0 {
            return Err("Chain request_timeout_seconds must be greater than 0".to_string());
        }

        if self.scheduler.launch_retry_seconds == 0
            || self.scheduler.epoch_recheck_seconds == 0
            || self.scheduler.identity_refresh_seconds == 0
            || self.scheduler.state_poll_seconds == 0
        {
            return Err("Scheduler intervals must be greater than 0".to_string());
        }

        self.policy.parse()?;

        if self.oracle.idle_delay_ms == 0 || self.oracle.error_delay_ms == 0 {
            return Err("Oracle idle_delay_ms and error_delay_ms must be greater than 0".to_string());
        }

        if self.notifier.templates_path.is_empty() {
            return Err("Notifier templates_path cannot be empty".to_string());
        }

        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "postgresql://localhost/epoch_notifier".to_string(),
                max_connections: 10,
                min_connections: 2,
                connect_timeout_seconds: 30,
            },
            nats: NatsConfig {
                url: "nats://localhost:4222".to_string(),
                stream_name: "NOTIFICATIONS".to_string(),
                subject_prefix: "notifications".to_string(),
                publish_timeout_seconds: 5,
            },
            chain: ChainConfig {
                node_url: "http://localhost:9009".to_string(),
                api_key: String::new(),
                request_timeout_seconds: 30,
            },
            scheduler: SchedulerConfig {
                launch_retry_seconds: 5,
                epoch_recheck_seconds: 300,
                identity_refresh_seconds: 300,
                state_poll_seconds: 60,
            },
            policy: PolicyConfig {
                blocks_per_minute: 3,
                snap_time: "13:30:00".to_string(),
                snap_timezone: "UTC".to_string(),
            },
            oracle: OracleConfig {
                initial_cursor: 1,
                idle_delay_ms: 5000,
                error_delay_ms: 1000,
                step_delay_ms: 1,
                reveal_delay_blocks: 30,
            },
            notifier: NotifierConfig {
                transport: TransportKind::Nats,
                templates_path: "config/notifications.json".to_string(),
            },
            links: LinksConfig {
                oracle_view_url: "https://app.idena.io/oracles/view?id=".to_string(),
                wallet_url: "https://app.idena.io/wallets".to_string(),
                explorer_url: "https://scan.idena.io".to_string(),
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                metrics_port: 0,
            },
        }
    }
}
