//! Plugin-based adapter registry
//!
//! The registry allows remote adapters, mirror stores and action logs to be
//! registered dynamically at runtime, avoiding hardcoded if-else chains.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use orisync_core::registry::AdapterRegistry;
//! use orisync_core::config::SyncConfig;
//!
//! // Memory and file backends are registered out of the box
//! let registry = AdapterRegistry::new();
//!
//! // Backends from other crates register themselves
//! orisync_remote_http::register(&registry);
//!
//! let (engine, events) = registry.create_engine(config).await?;
//! ```
//!
//! ## Registration
//!
//! Implementations should register themselves during initialization:
//!
//! ```rust,ignore
//! // In orisync-remote-http crate
//! pub fn register(registry: &AdapterRegistry) {
//!     registry.register_remote("http", Box::new(HttpRemoteFactory));
//! }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::mpsc;

use crate::config::{ActionLogConfig, MirrorStoreConfig, RemoteConfig, SyncConfig};
use crate::engine::SyncEngine;
use crate::error::{Error, Result};
use crate::events::SyncEvent;
use crate::log::{FileActionLogFactory, MemoryActionLogFactory};
use crate::mirror::{FileMirrorStoreFactory, MemoryMirrorStoreFactory};
use crate::traits::{ActionLog, MirrorStore, RemoteAdapter};
use crate::traits::{ActionLogFactory, MirrorStoreFactory, RemoteAdapterFactory, UnconfiguredRemoteFactory};

/// Registry for plugin-based backend creation
///
/// The registry maintains maps of backend type names to factory objects,
/// allowing dynamic instantiation based on configuration.
///
/// ## Thread Safety
///
/// The registry uses interior mutability with RwLock, allowing concurrent
/// reads and exclusive writes.
pub struct AdapterRegistry {
    /// Registered remote adapter factories
    remotes: RwLock<HashMap<String, Box<dyn RemoteAdapterFactory>>>,

    /// Registered mirror store factories
    mirrors: RwLock<HashMap<String, Box<dyn MirrorStoreFactory>>>,

    /// Registered action log factories
    logs: RwLock<HashMap<String, Box<dyn ActionLogFactory>>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl AdapterRegistry {
    /// Create a registry with the built-in backends
    ///
    /// Registered out of the box: remote `unconfigured`, mirror stores
    /// `memory` and `file`, action logs `memory` and `file`.
    pub fn new() -> Self {
        let registry = Self::empty();
        registry.register_remote("unconfigured", Box::new(UnconfiguredRemoteFactory));
        registry.register_mirror_store("memory", Box::new(MemoryMirrorStoreFactory));
        registry.register_mirror_store("file", Box::new(FileMirrorStoreFactory));
        registry.register_action_log("memory", Box::new(MemoryActionLogFactory));
        registry.register_action_log("file", Box::new(FileActionLogFactory));
        registry
    }

    /// Create a registry with nothing registered
    pub fn empty() -> Self {
        Self {
            remotes: RwLock::new(HashMap::new()),
            mirrors: RwLock::new(HashMap::new()),
            logs: RwLock::new(HashMap::new()),
        }
    }

    /// Register a remote adapter factory
    ///
    /// # Parameters
    ///
    /// - `name`: Remote type name (e.g., "http")
    /// - `factory`: Factory object for creating adapter instances
    pub fn register_remote(&self, name: impl Into<String>, factory: Box<dyn RemoteAdapterFactory>) {
        write(&self.remotes).insert(name.into(), factory);
    }

    /// Register a mirror store factory
    pub fn register_mirror_store(&self, name: impl Into<String>, factory: Box<dyn MirrorStoreFactory>) {
        write(&self.mirrors).insert(name.into(), factory);
    }

    /// Register an action log factory
    pub fn register_action_log(&self, name: impl Into<String>, factory: Box<dyn ActionLogFactory>) {
        write(&self.logs).insert(name.into(), factory);
    }

    /// Create a remote adapter from configuration
    ///
    /// # Returns
    ///
    /// - `Ok(Arc<dyn RemoteAdapter>)`: Created adapter
    /// - `Err(Error)`: If the type is not registered or creation fails
    pub fn create_remote(&self, config: &RemoteConfig) -> Result<Arc<dyn RemoteAdapter>> {
        let remote_type = config.type_name();
        let remotes = read(&self.remotes);
        let factory = remotes
            .get(remote_type)
            .ok_or_else(|| Error::config(format!("Unknown remote type: {}", remote_type)))?;
        factory.create(config)
    }

    /// Create a mirror store from configuration
    pub fn create_mirror_store(&self, config: &MirrorStoreConfig) -> Result<Arc<dyn MirrorStore>> {
        let store_type = config.type_name();
        let mirrors = read(&self.mirrors);
        let factory = mirrors
            .get(store_type)
            .ok_or_else(|| Error::config(format!("Unknown mirror store type: {}", store_type)))?;
        factory.create(config)
    }

    /// Create an action log from configuration
    pub fn create_action_log(&self, config: &ActionLogConfig) -> Result<Box<dyn ActionLog>> {
        let log_type = config.type_name();
        let logs = read(&self.logs);
        let factory = logs
            .get(log_type)
            .ok_or_else(|| Error::config(format!("Unknown action log type: {}", log_type)))?;
        factory.create(config)
    }

    /// Build an engine with every backend taken from configuration
    pub async fn create_engine(
        &self,
        config: SyncConfig,
    ) -> Result<(SyncEngine, mpsc::Receiver<SyncEvent>)> {
        config.validate()?;
        let remote = self.create_remote(&config.remote)?;
        let mirror = self.create_mirror_store(&config.mirror)?;
        let log = self.create_action_log(&config.queue.log)?;
        SyncEngine::new(remote, mirror, log, config).await
    }

    /// List all registered remote types
    pub fn list_remotes(&self) -> Vec<String> {
        read(&self.remotes).keys().cloned().collect()
    }

    /// List all registered mirror store types
    pub fn list_mirror_stores(&self) -> Vec<String> {
        read(&self.mirrors).keys().cloned().collect()
    }

    /// List all registered action log types
    pub fn list_action_logs(&self) -> Vec<String> {
        read(&self.logs).keys().cloned().collect()
    }

    /// Check if a remote type is registered
    pub fn has_remote(&self, name: &str) -> bool {
        read(&self.remotes).contains_key(name)
    }

    /// Check if a mirror store type is registered
    pub fn has_mirror_store(&self, name: &str) -> bool {
        read(&self.mirrors).contains_key(name)
    }

    /// Check if an action log type is registered
    pub fn has_action_log(&self, name: &str) -> bool {
        read(&self.logs).contains_key(name)
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
