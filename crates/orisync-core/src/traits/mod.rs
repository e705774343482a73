//! Core traits for the sync layer
//!
//! This module defines the abstract interfaces that all implementations must follow.
//!
//! - [`MirrorStore`]: Local, synchronous copy of remote collections
//! - [`ActionLog`]: Durable storage behind the offline action queue
//! - [`RemoteAdapter`]: Boundary to the concrete remote backend
//! - [`ConnectivityNotifier`]: Signal that drives automatic queue replay

pub mod mirror_store;
pub mod action_log;
pub mod remote;
pub mod connectivity;

pub use mirror_store::{MirrorStore, MirrorStoreFactory, MirroredRecord, ListQuery, SortOrder};
pub use action_log::{ActionLog, ActionLogFactory, ActionContext, OfflineAction};
pub use remote::{
    FieldFilter, QueryDescriptor, RemoteAdapter, RemoteAdapterFactory, RemoteDocument,
    SnapshotStream, UnconfiguredRemote, UnconfiguredRemoteFactory,
};
pub use connectivity::{ConnectivityEvent, ConnectivityNotifier};
