//! changefeed core - Change stream tracking for replicated document stores.
//!
//! This crate turns a document store's change streams into typed, ordered,
//! resumable [`ChangeEvent`](changefeed_proto::ChangeEvent)s delivered to
//! per-entity subscribers. One [`StreamTask`] watches one collection on a
//! worker thread; the [`ChangeTracker`] starts, stops and supervises them.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod pool;
pub mod store;
pub mod subscriber;
pub mod task;
pub mod translate;

pub use config::{DatastoreConfig, ReadPreferenceTag, TrackerConfig};
pub use coordinator::{ChangeTracker, ConnectionContext, ConnectionRegistry};
pub use error::{
    ConfigError, DispatchError, StoreError, SubscriberError, TrackerError, TranslateError,
};
pub use pool::{Interrupt, TaskFuture, WorkerPool};
pub use store::{
    ChangeCursor, DocumentStore, ReadConcern, ReadOptions, ReadPreference, StoreConnector,
    StoreSession, WatchOptions, WatchedCollection,
};
pub use subscriber::{
    ChangeSubscriber, ChangeTrackingInfo, Dispatch, RawChangeSubscriber, TrackingRegistration,
    TypedDispatcher,
};
pub use task::{StreamTask, TaskState, TaskStats};
pub use translate::{should_process, translate};

// Store backends
pub use store::memory::{MemoryCollection, MemoryConnector};
#[cfg(feature = "mongodb")]
pub use store::mongo::MongoConnector;

/// Re-export protocol types.
pub use changefeed_proto as proto;
