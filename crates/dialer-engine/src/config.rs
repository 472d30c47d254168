//! Engine configuration
//!
//! Process-wide settings live here and are loaded once at startup. Campaign
//! pacing (dial method, ratio bounds, abandon threshold, hopper size, wrap-up
//! timeout) is stored with the campaign itself and re-read on every scheduler
//! tick, so it can change without a restart.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::database::leads::LeadStatus;
use crate::error::{DialerError, Result};
use crate::scheduler::pacing::RatioStepPolicy;

/// Top level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// General settings
    pub general: GeneralConfig,

    /// Dial-ratio scheduler settings
    pub scheduler: SchedulerConfig,

    /// Call/agent matcher and event consumer settings
    pub matcher: MatcherConfig,

    /// Session reaper settings
    pub reaper: ReaperConfig,

    /// Lead recycling policy
    pub recycle: RecycleConfig,

    /// Telephony servers the engine talks to
    pub gateways: Vec<GatewayConfig>,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Agent-facing HTTP API
    pub api: ApiConfig,

    /// Logging
    pub logging: LogConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Name of this dialer node, used in logs and channel ids
    pub node_name: String,
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Scheduler tick in milliseconds
    pub tick_interval_ms: u64,

    /// Age after which a hopper entry stuck in "dialing" is returned to "available"
    pub stale_dial_secs: u64,

    /// Lifetime of an "available" hopper entry before it is dropped and refetched
    pub hopper_ttl_secs: u64,

    /// Rolling window over which the abandon rate is measured
    pub abandon_window_secs: u64,

    /// Dial ratio self-tuning steps
    pub ratio_policy: RatioStepPolicy,
}

/// Matcher / event consumer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Timeout applied to every gateway command, milliseconds
    pub command_timeout_ms: u64,

    /// Number of event worker tasks per telephony server. Events are sharded
    /// by channel id so per-channel ordering holds.
    pub event_workers: usize,

    /// Buffer size of each event worker queue
    pub event_queue_size: usize,
}

/// Reaper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    /// Sweep interval in seconds
    pub interval_secs: u64,

    /// Sessions without a heartbeat for this long are closed
    pub heartbeat_timeout_secs: u64,

    /// Sessions that never leave `connecting` for this long are force-closed
    pub connecting_timeout_secs: u64,

    /// Safety window for sessions stuck on a call (crash recovery)
    pub stuck_session_secs: u64,

    /// Attempts left initiated/ringing this long are treated as lost
    pub lost_call_secs: u64,

    /// Closed sessions are dropped from the in-memory registry after this long
    pub closed_session_retention_secs: u64,
}

/// Recycle policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecycleConfig {
    /// Multiplier applied to the campaign retry delay for each further attempt
    pub backoff_multiplier: f64,

    /// Upper bound for the computed retry delay, seconds
    pub max_retry_delay_secs: u64,

    /// Status rewrite rules applied by the reaper sweep
    pub rules: Vec<RecycleRule>,
}

/// Move leads from one status to another once they have rested long enough
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecycleRule {
    pub source_status: LeadStatus,
    pub target_status: LeadStatus,
    /// Minimum time since the last call, seconds
    pub after_secs: u64,
    /// Only leads with fewer attempts than this are recycled
    pub max_attempts: u32,
}

/// Kind of telephony control plane connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayKind {
    /// In-process simulated telephony server
    Loopback,
    /// Asterisk REST Interface
    Ari,
}

/// One telephony server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Server id referenced by campaigns and agent sessions
    pub id: String,

    pub kind: GatewayKind,

    /// Base URL of the REST interface, e.g. `http://pbx1:8088/ari`
    #[serde(default)]
    pub url: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Stasis application name the dialer registers
    #[serde(default = "default_app_name")]
    pub app: String,
}

fn default_app_name() -> String {
    "autodialer".to_string()
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file path, or `:memory:`
    pub path: String,

    /// Maximum pool connections (ignored for in-memory databases)
    pub max_connections: u32,

    /// Busy timeout in milliseconds
    pub busy_timeout_ms: u64,
}

/// HTTP API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind_addr: SocketAddr,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default level when `RUST_LOG` is not set
    pub level: String,

    /// Emit JSON lines instead of human readable output
    pub json: bool,

    /// Include source file and line in every line
    pub file_info: bool,

    /// Log span open and close
    pub spans: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            node_name: "dialer-1".to_string(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            stale_dial_secs: 30,
            hopper_ttl_secs: 600,
            abandon_window_secs: 3600,
            ratio_policy: RatioStepPolicy::default(),
        }
    }
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 3000,
            event_workers: 4,
            event_queue_size: 1024,
        }
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            heartbeat_timeout_secs: 300,
            connecting_timeout_secs: 60,
            stuck_session_secs: 4 * 3600,
            lost_call_secs: 180,
            closed_session_retention_secs: 3600,
        }
    }
}

impl Default for RecycleConfig {
    fn default() -> Self {
        Self {
            backoff_multiplier: 2.0,
            max_retry_delay_secs: 24 * 3600,
            rules: Vec::new(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "autodialer.db".to_string(),
            max_connections: 8,
            busy_timeout_ms: 5000,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file_info: false,
            spans: false,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn stale_dial_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_dial_secs as i64)
    }

    pub fn hopper_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.hopper_ttl_secs as i64)
    }

    pub fn abandon_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.abandon_window_secs as i64)
    }
}

impl MatcherConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

impl ReaperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| DialerError::config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(text).map_err(|e| DialerError::config(e.to_string()))?;
        config.validate().map_err(DialerError::config)?;
        Ok(config)
    }

    /// Configuration suited to tests: in-memory database, one loopback
    /// telephony server, no HTTP listener.
    pub fn for_testing() -> Self {
        Self {
            gateways: vec![GatewayConfig {
                id: "loopback".to_string(),
                kind: GatewayKind::Loopback,
                url: String::new(),
                username: String::new(),
                password: String::new(),
                app: default_app_name(),
            }],
            database: DatabaseConfig {
                path: ":memory:".to_string(),
                ..Default::default()
            },
            api: ApiConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.scheduler.tick_interval_ms == 0 {
            return Err("scheduler.tick_interval_ms must be greater than 0".to_string());
        }
        if self.scheduler.stale_dial_secs == 0 {
            return Err("scheduler.stale_dial_secs must be greater than 0".to_string());
        }
        self.scheduler.ratio_policy.validate()?;

        if self.matcher.command_timeout_ms == 0 {
            return Err("matcher.command_timeout_ms must be greater than 0".to_string());
        }
        if self.matcher.event_workers == 0 {
            return Err("matcher.event_workers must be at least 1".to_string());
        }

        if self.reaper.interval_secs == 0 {
            return Err("reaper.interval_secs must be greater than 0".to_string());
        }
        if self.reaper.heartbeat_timeout_secs == 0 {
            return Err("reaper.heartbeat_timeout_secs must be greater than 0".to_string());
        }

        if self.recycle.backoff_multiplier < 1.0 {
            return Err("recycle.backoff_multiplier must be >= 1.0".to_string());
        }
        for rule in &self.recycle.rules {
            if rule.target_status == LeadStatus::Dnc || rule.source_status == LeadStatus::Dnc {
                return Err("recycle rules may not move leads into or out of dnc".to_string());
            }
        }

        let mut seen = std::collections::HashSet::new();
        for gateway in &self.gateways {
            if gateway.id.is_empty() {
                return Err("gateway id cannot be empty".to_string());
            }
            if !seen.insert(gateway.id.as_str()) {
                return Err(format!("duplicate gateway id '{}'", gateway.id));
            }
            if gateway.kind == GatewayKind::Ari && gateway.url.is_empty() {
                return Err(format!("gateway '{}' needs a url", gateway.id));
            }
        }

        if self.database.path.is_empty() {
            return Err("database.path cannot be empty".to_string());
        }

        Ok(())
    }
}
