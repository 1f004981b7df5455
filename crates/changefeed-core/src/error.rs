//! Core error types.

use thiserror::Error;

/// Error raised by a typed subscriber callback.
pub type SubscriberError = Box<dyn std::error::Error + Send + Sync>;

/// Errors reported by a store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Could not connect to the datastore.
    #[error("connection error: {0}")]
    Connection(String),

    /// The resume token is malformed or no longer in the store's history.
    #[error("resume token {token} is not usable: {reason}")]
    ResumeTokenInvalid { token: String, reason: String },

    /// A blocking read was interrupted.
    #[error("operation interrupted")]
    Interrupted,

    /// The cursor or client has been closed.
    #[error("{0} is closed")]
    Closed(&'static str),

    /// Any other backend failure.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Errors raised while translating a raw notification.
#[derive(Debug, Error)]
pub enum TranslateError {
    /// The stream was invalidated and has no consistent continuation point.
    #[error("change stream for {namespace} was invalidated at {token}")]
    Invalidated { namespace: String, token: String },

    /// The notification's operation has no change event mapping.
    #[error("unsupported change operation: {0}")]
    UnsupportedOperation(String),

    /// A document-level notification without a document key.
    #[error("{0} notification carries no document key")]
    MissingDocumentKey(String),

    /// The full document does not match the tracked entity type.
    #[error("failed to decode {entity_type} document {uuid}: {source}")]
    Decode {
        entity_type: String,
        uuid: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors raised while dispatching a notification to a subscriber.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Translation failed.
    #[error(transparent)]
    Translate(#[from] TranslateError),

    /// The subscriber returned an error.
    #[error("subscriber failed: {0}")]
    Subscriber(SubscriberError),

    /// The subscriber panicked.
    #[error("subscriber panicked: {0}")]
    Panicked(String),
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file could not be parsed.
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration is inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors returned by the change tracker.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Store error while preparing a stream.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Invalid tracking descriptor.
    #[error("descriptor error: {0}")]
    Descriptor(#[from] changefeed_proto::Error),

    /// Worker pool could not be created.
    #[error("worker pool error: {0}")]
    Pool(#[from] std::io::Error),

    /// `start` was called on a running tracker.
    #[error("change tracker is already started")]
    AlreadyStarted,
}
