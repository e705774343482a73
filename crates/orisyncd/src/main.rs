// # orisyncd - Sync Daemon
//
// Thin integration layer around orisync-core. All sync logic lives in the
// library; this binary only:
// 1. Reads configuration from environment variables
// 2. Initializes tracing and the runtime
// 3. Registers backends and builds the engine
// 4. Arms automatic queue replay
// 5. Waits for a shutdown signal, then flushes and exits
//
// ## Configuration
//
// All configuration is done via environment variables:
//
// ### Mirror
// - `ORISYNC_MIRROR_TYPE`: file or memory (default: file)
// - `ORISYNC_MIRROR_PATH`: Path to the mirror file (default: /var/lib/orisync/mirror.json)
//
// ### Queue
// - `ORISYNC_QUEUE_TYPE`: file or memory (default: file)
// - `ORISYNC_QUEUE_PATH`: Path to the queue file (default: /var/lib/orisync/queue.jsonl)
// - `ORISYNC_FLUSH_INTERVAL_SECS`: Auto-flush period, 0 disables (default: 30)
// - `ORISYNC_MAX_ACTION_AGE_SECS`: Evict actions older than this (default: keep)
// - `ORISYNC_MAX_ACTIONS`: Evict the oldest actions beyond this count (default: keep)
// - `ORISYNC_HOLD_SCOPE_ON_FAILURE`: Stop a scope's replay at its first failure (default: false)
//
// ### Remote
// - `ORISYNC_REMOTE_URL`: Base URL of the document API (unset: local only)
// - `ORISYNC_REMOTE_TOKEN`: Bearer token (optional)
// - `ORISYNC_REMOTE_POLL_INTERVAL_SECS`: Live query polling period (default: 15)
// - `ORISYNC_REMOTE_TIMEOUT_SECS`: Per-request timeout (default: 10)
//
// ### Membership
// - `ORISYNC_MEMBERSHIP_COOLDOWN_SECS`: Cooldown between requests (default: 43200)
//
// ### Logging
// - `ORISYNC_LOG_LEVEL`: trace, debug, info, warn or error (default: info)
//
// ## Example
//
// ```bash
// export ORISYNC_REMOTE_URL=https://sync.example.com/v1
// export ORISYNC_REMOTE_TOKEN=your_token
// export ORISYNC_MIRROR_PATH=/var/lib/orisync/mirror.json
// export ORISYNC_QUEUE_PATH=/var/lib/orisync/queue.jsonl
//
// orisyncd
// ```

use anyhow::{Context, Result};
use orisync_core::config::{
    ActionLogConfig, EvictionPolicy, MirrorStoreConfig, RemoteConfig, SyncConfig,
};
use orisync_core::connectivity::IntervalNotifier;
use orisync_core::traits::ConnectivityNotifier;
use orisync_core::{AdapterRegistry, SyncEngine, SyncEvent};
use std::env;
use std::process::ExitCode;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Upper bound for the final flush on shutdown
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error (unexpected)
#[derive(Debug, Clone, Copy)]
enum OrisyncExitCode {
    /// Clean shutdown (normal exit)
    CleanShutdown = 0,
    /// Configuration error or startup failure
    ConfigError = 1,
    /// Runtime error (unexpected failure)
    RuntimeError = 2,
}

impl From<OrisyncExitCode> for ExitCode {
    fn from(code: OrisyncExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Daemon configuration
#[derive(Debug)]
struct Config {
    sync: SyncConfig,
    log_level: Level,
}

/// Read and parse an optional variable
fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name).filter(|value| !value.trim().is_empty()) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{} has an invalid value '{}': {}", name, value, e)),
        None => Ok(None),
    }
}

fn parse_level(value: &str) -> Result<Level> {
    match value.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => anyhow::bail!(
            "ORISYNC_LOG_LEVEL '{}' is not valid. \
            Valid levels: trace, debug, info, warn, error",
            value
        ),
    }
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from any variable source
    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut sync = SyncConfig::new();

        sync.mirror = match lookup("ORISYNC_MIRROR_TYPE").as_deref().unwrap_or("file") {
            "file" => MirrorStoreConfig::File {
                path: lookup("ORISYNC_MIRROR_PATH")
                    .unwrap_or_else(|| "/var/lib/orisync/mirror.json".to_string()),
            },
            "memory" => MirrorStoreConfig::Memory,
            other => anyhow::bail!(
                "ORISYNC_MIRROR_TYPE '{}' is not supported. Supported types: file, memory",
                other
            ),
        };

        sync.queue.log = match lookup("ORISYNC_QUEUE_TYPE").as_deref().unwrap_or("file") {
            "file" => ActionLogConfig::File {
                path: lookup("ORISYNC_QUEUE_PATH")
                    .unwrap_or_else(|| "/var/lib/orisync/queue.jsonl".to_string()),
            },
            "memory" => ActionLogConfig::Memory,
            other => anyhow::bail!(
                "ORISYNC_QUEUE_TYPE '{}' is not supported. Supported types: file, memory",
                other
            ),
        };

        if let Some(secs) = parse_var(&lookup, "ORISYNC_FLUSH_INTERVAL_SECS")? {
            sync.queue.auto_flush_interval_secs = secs;
        }
        sync.queue.eviction = EvictionPolicy {
            max_age_secs: parse_var(&lookup, "ORISYNC_MAX_ACTION_AGE_SECS")?,
            max_actions: parse_var(&lookup, "ORISYNC_MAX_ACTIONS")?,
        };
        if let Some(hold) = parse_var(&lookup, "ORISYNC_HOLD_SCOPE_ON_FAILURE")? {
            sync.queue.hold_scope_on_failure = hold;
        }

        sync.remote = match lookup("ORISYNC_REMOTE_URL").filter(|url| !url.trim().is_empty()) {
            Some(base_url) => RemoteConfig::Http {
                base_url,
                poll_interval_secs: parse_var(&lookup, "ORISYNC_REMOTE_POLL_INTERVAL_SECS")?
                    .unwrap_or(15),
                timeout_secs: parse_var(&lookup, "ORISYNC_REMOTE_TIMEOUT_SECS")?.unwrap_or(10),
                api_token: lookup("ORISYNC_REMOTE_TOKEN"),
            },
            None => RemoteConfig::Unconfigured,
        };

        if let Some(secs) = parse_var(&lookup, "ORISYNC_MEMBERSHIP_COOLDOWN_SECS")? {
            sync.membership.cooldown_secs = secs;
        }

        let log_level = parse_level(
            lookup("ORISYNC_LOG_LEVEL")
                .as_deref()
                .unwrap_or("info"),
        )?;

        Ok(Self { sync, log_level })
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        self.sync.validate().context("Invalid sync configuration")?;

        if let RemoteConfig::Http { base_url, .. } = &self.sync.remote
            && base_url.starts_with("http://")
        {
            eprintln!(
                "WARNING: ORISYNC_REMOTE_URL uses HTTP (not HTTPS). \
                The API token is sent in clear text."
            );
        }
        #[cfg(not(feature = "http"))]
        if matches!(self.sync.remote, RemoteConfig::Http { .. }) {
            anyhow::bail!("ORISYNC_REMOTE_URL is set but orisyncd was built without the 'http' feature");
        }
        Ok(())
    }
}

fn main() -> ExitCode {
    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            return OrisyncExitCode::ConfigError.into();
        }
    };

    // Validate configuration
    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {:#}", e);
        return OrisyncExitCode::ConfigError.into();
    }

    let subscriber = FmtSubscriber::builder().with_max_level(config.log_level).finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return OrisyncExitCode::ConfigError.into();
    }

    info!("Starting orisyncd daemon");

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return OrisyncExitCode::RuntimeError.into();
        }
    };

    rt.block_on(async {
        match run_daemon(config).await {
            Ok(()) => OrisyncExitCode::CleanShutdown,
            Err(e) => {
                error!("Daemon error: {:#}", e);
                OrisyncExitCode::RuntimeError
            }
        }
    })
    .into()
}

/// Build the registry with every compiled-in backend
fn build_registry() -> AdapterRegistry {
    let registry = AdapterRegistry::new();

    #[cfg(feature = "http")]
    {
        info!("Registering HTTP remote");
        orisync_remote_http::register(&registry);
    }

    registry
}

/// Pick the signal that drives automatic replay
fn flush_notifier(sync: &SyncConfig) -> Result<Option<Box<dyn ConnectivityNotifier>>> {
    let period = match sync.queue.auto_flush_interval() {
        Some(period) => period,
        None => return Ok(None),
    };

    #[cfg(feature = "http")]
    if let RemoteConfig::Http {
        base_url,
        timeout_secs,
        ..
    } = &sync.remote
    {
        let probe = orisync_remote_http::HttpConnectivityProbe::new(
            base_url,
            period,
            Duration::from_secs(*timeout_secs),
        )?;
        info!("Replaying queue when {} becomes reachable", probe.health_url());
        return Ok(Some(Box::new(probe)));
    }

    Ok(Some(Box::new(IntervalNotifier::new(period))))
}

/// Run the daemon
async fn run_daemon(config: Config) -> Result<()> {
    let registry = build_registry();

    info!("Remote type: {}", config.sync.remote.type_name());
    info!("Mirror store type: {}", config.sync.mirror.type_name());
    info!("Action log type: {}", config.sync.queue.log.type_name());

    let notifier = flush_notifier(&config.sync)?;
    let (engine, events) = registry
        .create_engine(config.sync)
        .await
        .context("Failed to create sync engine")?;

    let event_logger = tokio::spawn(log_events(events));

    // Replay whatever a previous run left behind
    let report = engine.flush_offline_actions(None).await?;
    if report.remaining > 0 {
        info!("{} action(s) still pending after startup flush", report.remaining);
    }

    match notifier {
        Some(notifier) => {
            engine.start_auto_flush(notifier);
        }
        None => info!("Auto-flush disabled, queue replays on explicit flush only"),
    }

    info!("Daemon initialized successfully");

    let signal = wait_for_shutdown().await?;
    info!("Received shutdown signal: {}", signal);

    shutdown(&engine).await;
    drop(engine);
    event_logger.abort();

    info!("Shutting down daemon");
    Ok(())
}

/// Final flush attempt, then persist state
async fn shutdown(engine: &SyncEngine) {
    engine.stop_auto_flush();
    match tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, engine.flush_offline_actions(None)).await {
        Ok(Ok(report)) => debug!("Final flush: {:?}", report),
        Ok(Err(e)) => warn!("Final flush failed: {}", e),
        Err(_) => warn!(
            "Final flush did not finish within {:?}, pending actions stay queued",
            SHUTDOWN_FLUSH_TIMEOUT
        ),
    }
    if let Err(e) = engine.shutdown().await {
        error!("Failed to persist state on shutdown: {}", e);
    }
}

/// Forward sync events to the log
async fn log_events(mut events: mpsc::Receiver<SyncEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SyncEvent::RemoteWriteQueued { scope, id, error, .. } => {
                info!("Queued {}/{} for replay: {}", scope, id, error)
            }
            SyncEvent::ActionFailed {
                action_id,
                action_type,
                attempts,
                error,
            } => warn!(
                "{} action {} failed (attempt {}): {}",
                action_type, action_id, attempts, error
            ),
            SyncEvent::ActionEvicted {
                action_id, reason, ..
            } => warn!("Action {} evicted: {}", action_id, reason),
            SyncEvent::SourceError { source_key, error } => {
                warn!("Live query '{}' failed: {}", source_key, error)
            }
            other => debug!("Sync event: {:?}", other),
        }
    }
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
///
/// # Returns
///
/// Returns the name of the signal received.
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

/// Wait for shutdown signals (SIGINT only)
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to wait for CTRL-C: {}", e))?;
    Ok("SIGINT")
}
