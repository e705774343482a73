//! Configuration types for the sync layer
//!
//! This module defines all configuration structures used throughout the crate.

use serde::{Deserialize, Serialize};

/// Main sync configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Local mirror store configuration
    #[serde(default)]
    pub mirror: MirrorStoreConfig,

    /// Offline queue configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// Remote backend configuration
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Membership workflow policy
    #[serde(default)]
    pub membership: MembershipConfig,

    /// Optional engine settings
    #[serde(default)]
    pub engine: EngineConfig,
}

impl SyncConfig {
    /// Create a new configuration with defaults
    ///
    /// The defaults keep everything in memory and run without a remote
    /// backend, which makes every write queue locally.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.mirror.validate()?;
        self.queue.validate()?;
        self.remote.validate()?;
        self.membership.validate()?;
        self.engine.validate()?;
        Ok(())
    }
}

/// Local mirror store configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MirrorStoreConfig {
    /// Single JSON document on disk
    File {
        /// Path to the mirror file
        path: String,
    },

    /// In-memory mirror (not persistent)
    #[default]
    Memory,

    /// Custom mirror store
    Custom {
        /// Factory name to use
        factory: String,
        /// Custom configuration data
        config: serde_json::Value,
    },
}

impl MirrorStoreConfig {
    /// Validate the mirror configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            MirrorStoreConfig::File { path } => {
                if path.is_empty() {
                    return Err(crate::Error::config("Mirror file path cannot be empty"));
                }
                Ok(())
            }
            MirrorStoreConfig::Custom { factory, .. } => {
                if factory.is_empty() {
                    return Err(crate::Error::config(
                        "Custom mirror store factory cannot be empty",
                    ));
                }
                Ok(())
            }
            MirrorStoreConfig::Memory => Ok(()),
        }
    }

    /// Get the mirror store type name
    pub fn type_name(&self) -> &str {
        match self {
            MirrorStoreConfig::File { .. } => "file",
            MirrorStoreConfig::Memory => "memory",
            MirrorStoreConfig::Custom { factory, .. } => factory,
        }
    }
}

/// Durable action log configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionLogConfig {
    /// JSONL file, one action per line
    File {
        /// Path to the queue file
        path: String,
    },

    /// In-memory log (pending actions are lost on exit)
    #[default]
    Memory,

    /// Custom action log
    Custom {
        /// Factory name to use
        factory: String,
        /// Custom configuration data
        config: serde_json::Value,
    },
}

impl ActionLogConfig {
    /// Validate the action log configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            ActionLogConfig::File { path } => {
                if path.is_empty() {
                    return Err(crate::Error::config("Queue file path cannot be empty"));
                }
                Ok(())
            }
            ActionLogConfig::Custom { factory, .. } => {
                if factory.is_empty() {
                    return Err(crate::Error::config(
                        "Custom action log factory cannot be empty",
                    ));
                }
                Ok(())
            }
            ActionLogConfig::Memory => Ok(()),
        }
    }

    /// Get the action log type name
    pub fn type_name(&self) -> &str {
        match self {
            ActionLogConfig::File { .. } => "file",
            ActionLogConfig::Memory => "memory",
            ActionLogConfig::Custom { factory, .. } => factory,
        }
    }
}

/// Offline queue configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Durable storage for pending actions
    #[serde(default)]
    pub log: ActionLogConfig,

    /// Period of the interval notifier armed by the daemon (in seconds)
    ///
    /// Set to 0 to only flush on explicit connectivity signals.
    #[serde(default = "default_auto_flush_interval_secs")]
    pub auto_flush_interval_secs: u64,

    /// Optional eviction of stale or excess actions
    #[serde(default)]
    pub eviction: EvictionPolicy,

    /// Defer the rest of a scope for the current pass after a failure
    ///
    /// Off by default: a failing action does not stop later actions, even
    /// in the same scope.
    #[serde(default)]
    pub hold_scope_on_failure: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            log: ActionLogConfig::default(),
            auto_flush_interval_secs: default_auto_flush_interval_secs(),
            eviction: EvictionPolicy::default(),
            hold_scope_on_failure: false,
        }
    }
}

impl QueueConfig {
    /// Validate the queue configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.log.validate()?;
        self.eviction.validate()
    }

    /// Auto-flush period, `None` when disabled
    pub fn auto_flush_interval(&self) -> Option<std::time::Duration> {
        (self.auto_flush_interval_secs > 0)
            .then(|| std::time::Duration::from_secs(self.auto_flush_interval_secs))
    }
}

/// Upper bound for time-based policies (100 years)
pub const MAX_POLICY_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Seconds to a chrono duration, saturating instead of panicking
fn duration_from_secs(secs: u64) -> chrono::TimeDelta {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::TimeDelta::try_seconds)
        .unwrap_or(chrono::TimeDelta::MAX)
}

/// Eviction policy for the offline queue
///
/// Both limits default to `None`, meaning the queue never drops an action on
/// its own. Every eviction is logged and reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictionPolicy {
    /// Drop actions queued longer than this (in seconds)
    #[serde(default)]
    pub max_age_secs: Option<u64>,

    /// Keep at most this many actions, dropping the oldest first
    #[serde(default)]
    pub max_actions: Option<usize>,
}

impl EvictionPolicy {
    /// Policy that never evicts
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Check if no limit is set
    pub fn is_unbounded(&self) -> bool {
        self.max_age_secs.is_none() && self.max_actions.is_none()
    }

    /// Maximum age as a chrono duration
    pub fn max_age(&self) -> Option<chrono::TimeDelta> {
        self.max_age_secs.map(duration_from_secs)
    }

    /// Validate the policy
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.max_actions == Some(0) {
            return Err(crate::Error::config(
                "Eviction max_actions must be > 0 (omit it for an unbounded queue)",
            ));
        }
        if self.max_age_secs == Some(0) {
            return Err(crate::Error::config(
                "Eviction max_age_secs must be > 0 (omit it for an unbounded queue)",
            ));
        }
        if self.max_age_secs.is_some_and(|secs| secs > MAX_POLICY_SECS) {
            return Err(crate::Error::config(format!(
                "Eviction max_age_secs must be <= {} (omit it for an unbounded queue)",
                MAX_POLICY_SECS
            )));
        }
        Ok(())
    }
}

/// Remote backend configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemoteConfig {
    /// No backend: writes queue, subscriptions are local-only
    #[default]
    Unconfigured,

    /// JSON/HTTP document API
    Http {
        /// Base URL (e.g., "https://sync.example.com/v1")
        base_url: String,
        /// Polling interval for live queries (in seconds)
        #[serde(default = "default_poll_interval_secs")]
        poll_interval_secs: u64,
        /// Per-request timeout (in seconds)
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
        /// Optional bearer token
        #[serde(default)]
        api_token: Option<String>,
    },

    /// Custom remote adapter
    Custom {
        /// Factory name to use
        factory: String,
        /// Custom configuration data
        config: serde_json::Value,
    },
}

impl RemoteConfig {
    /// Validate the remote configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            RemoteConfig::Http {
                base_url,
                poll_interval_secs,
                timeout_secs,
                api_token,
            } => {
                if base_url.is_empty() {
                    return Err(crate::Error::config("HTTP remote base URL cannot be empty"));
                }
                if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
                    return Err(crate::Error::config(format!(
                        "HTTP remote base URL must start with http:// or https://, got '{}'",
                        base_url
                    )));
                }
                if *poll_interval_secs == 0 {
                    return Err(crate::Error::config("HTTP remote poll interval must be > 0"));
                }
                if *timeout_secs == 0 {
                    return Err(crate::Error::config("HTTP remote timeout must be > 0"));
                }
                if let Some(token) = api_token
                    && token.is_empty()
                {
                    return Err(crate::Error::config(
                        "HTTP remote API token cannot be empty when set",
                    ));
                }
                Ok(())
            }
            RemoteConfig::Custom { factory, config } => {
                if factory.is_empty() {
                    return Err(crate::Error::config(
                        "Custom remote factory cannot be empty",
                    ));
                }
                if config.is_null() {
                    return Err(crate::Error::config("Custom remote config cannot be null"));
                }
                Ok(())
            }
            RemoteConfig::Unconfigured => Ok(()),
        }
    }

    /// Get the remote type name
    pub fn type_name(&self) -> &str {
        match self {
            RemoteConfig::Unconfigured => "unconfigured",
            RemoteConfig::Http { .. } => "http",
            RemoteConfig::Custom { factory, .. } => factory,
        }
    }
}

/// Membership workflow policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipConfig {
    /// Minimum time between a processed request and its renewal (in seconds)
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

impl MembershipConfig {
    /// Cooldown as a chrono duration
    pub fn cooldown(&self) -> chrono::TimeDelta {
        duration_from_secs(self.cooldown_secs)
    }

    /// Validate the membership policy
    ///
    /// A zero cooldown is allowed and disables rate limiting.
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.cooldown_secs > MAX_POLICY_SECS {
            return Err(crate::Error::config(format!(
                "Membership cooldown_secs must be <= {}",
                MAX_POLICY_SECS
            )));
        }
        Ok(())
    }
}

/// Engine configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Capacity of the sync event channel
    ///
    /// When full, new events are dropped (with a warning log).
    ///
    /// Default: 1000 events
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

impl EngineConfig {
    /// Validate the engine settings
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.event_channel_capacity == 0 {
            return Err(crate::Error::config("Event channel capacity must be > 0"));
        }
        Ok(())
    }
}

fn default_auto_flush_interval_secs() -> u64 {
    30
}

fn default_poll_interval_secs() -> u64 {
    15
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_cooldown_secs() -> u64 {
    12 * 60 * 60
}

fn default_event_channel_capacity() -> usize {
    1000
}
