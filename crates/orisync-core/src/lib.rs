// # orisync-core
//
// Core library for the offline-first sync layer.
//
// ## Architecture Overview
//
// This library keeps an on-device mirror of remote collections and makes
// every write local-first:
// - **MirrorStore**: Synchronous local copy of remote collections
// - **OfflineQueue**: Durable queue replaying writes the remote did not confirm
// - **RemoteAdapter**: Trait for the concrete remote backend
// - **SubscriptionMerger**: Merges live remote queries and the mirror into one view
// - **MembershipWorkflow**: Club membership requests with cooldown and blocks
// - **SyncEngine**: Entry point owning all of the above
// - **AdapterRegistry**: Plugin-based registry for backends
//
// ## Design Principles
//
// 1. **Local-First**: A write is visible locally before any network I/O
// 2. **No Silent Loss**: Unconfirmed writes stay queued until replayed
// 3. **Plugin-Based**: Backends are registered dynamically, no hard-coded if-else
// 4. **Library-First**: All core functionality can be used as a library
// 5. **Idempotency**: Replay handlers upsert, so replaying twice is harmless

pub mod clock;
pub mod config;
pub mod connectivity;
pub mod engine;
pub mod error;
pub mod events;
pub mod log;
pub mod membership;
pub mod merger;
pub mod mirror;
pub mod queue;
pub mod registry;
pub mod traits;

// Re-export core types for convenience
pub use traits::{ActionLog, ConnectivityNotifier, MirrorStore, RemoteAdapter};
pub use traits::{ActionContext, MirroredRecord, OfflineAction, QueryDescriptor, RemoteDocument};
pub use engine::SyncEngine;
pub use registry::AdapterRegistry;
pub use config::{SyncConfig, MirrorStoreConfig, ActionLogConfig, RemoteConfig};
pub use error::{Error, Result};
pub use events::SyncEvent;
pub use queue::{ActionHandler, FlushFilter, FlushReport, OfflineQueue};
pub use merger::{AccessPolicy, SubscribeRequest, Subscription};
pub use membership::{Decision, MembershipWorkflow, RequestOutcome};
pub use mirror::{FileMirrorStore, MemoryMirrorStore};
pub use log::{FileActionLog, MemoryActionLog};
pub use clock::{Clock, ManualClock, SystemClock};
