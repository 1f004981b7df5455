//! Document store abstraction.
//!
//! The tracker only needs a narrow slice of a replicated document store:
//! connecting to a deployment, opening a collection with read settings,
//! optionally starting a causally consistent session, and opening a
//! resumable change stream cursor with a bounded wait per poll.
//!
//! ## Architecture
//!
//! ```text
//! StoreConnector::connect(uri)      -> DocumentStore      (one per datastore)
//! DocumentStore::collection(..)     -> WatchedCollection  (one per stream task)
//! WatchedCollection::watch(..)      -> ChangeCursor       (owned by one task)
//! ChangeCursor::next_change()       -> RawChange          (blocks <= max_await)
//! ```
//!
//! Backends: [`memory`] (in-process, always available) and `mongo` (MongoDB
//! driver, behind the `mongodb` feature).

pub mod memory;
#[cfg(feature = "mongodb")]
pub mod mongo;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use changefeed_proto::{Namespace, RawChange, ResumeToken};

use crate::error::StoreError;

/// Which replica-set members a read may target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadPreference {
    /// Only the primary.
    Primary,
    /// Secondaries when available, otherwise the primary.
    SecondaryPreferred,
    /// Only secondaries carrying the given tag set.
    Secondary {
        /// Required member tags.
        tag_set: BTreeMap<String, String>,
    },
}

impl ReadPreference {
    /// Secondary reads restricted to members tagged `key=value`.
    pub fn tagged_secondary(key: &str, value: &str) -> Self {
        let mut tag_set = BTreeMap::new();
        tag_set.insert(key.to_string(), value.to_string());
        ReadPreference::Secondary { tag_set }
    }

    /// Whether reads under this preference need a causally consistent session.
    ///
    /// Secondary-preferred reads accept eventual consistency.
    pub fn requires_session(&self) -> bool {
        !matches!(self, ReadPreference::SecondaryPreferred)
    }
}

/// Read isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadConcern {
    /// Most recent data on the queried member.
    Local,
    /// Data acknowledged by a majority of members.
    Majority,
}

/// Settings applied to a collection handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOptions {
    /// Read concern.
    pub read_concern: ReadConcern,
    /// Read preference.
    pub read_preference: ReadPreference,
}

impl ReadOptions {
    /// Majority reads with the given preference.
    pub fn majority(read_preference: ReadPreference) -> Self {
        Self {
            read_concern: ReadConcern::Majority,
            read_preference,
        }
    }
}

/// Session settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Enable causally consistent reads.
    pub causal_consistency: bool,
}

/// How update notifications carry their document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullDocument {
    /// Only the delta.
    Default,
    /// Look up the current document when the notification is read.
    UpdateLookup,
}

/// Options for opening a change stream cursor.
#[derive(Clone)]
pub struct WatchOptions {
    /// Resume after this token; start from now when absent.
    pub resume_after: Option<ResumeToken>,
    /// Maximum time a single poll blocks.
    pub max_await: Duration,
    /// Update document mode.
    pub full_document: FullDocument,
    /// Session to read under.
    pub session: Option<Arc<dyn StoreSession>>,
}

impl WatchOptions {
    /// Options for a stream starting now with update lookup.
    pub fn new(max_await: Duration) -> Self {
        Self {
            resume_after: None,
            max_await,
            full_document: FullDocument::UpdateLookup,
            session: None,
        }
    }

    /// Resume after a token.
    pub fn with_resume_after(mut self, token: Option<ResumeToken>) -> Self {
        self.resume_after = token;
        self
    }

    /// Read under a session.
    pub fn with_session(mut self, session: Option<Arc<dyn StoreSession>>) -> Self {
        self.session = session;
        self
    }
}

impl std::fmt::Debug for WatchOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchOptions")
            .field("resume_after", &self.resume_after)
            .field("max_await", &self.max_await)
            .field("full_document", &self.full_document)
            .field("session", &self.session.as_ref().map(|s| s.id()))
            .finish()
    }
}

/// Opens connections to datastore deployments.
pub trait StoreConnector: Send + Sync {
    /// Connect to the deployment at `uri`.
    fn connect(&self, uri: &str) -> Result<Arc<dyn DocumentStore>, StoreError>;
}

/// A connection to one datastore deployment.
pub trait DocumentStore: Send + Sync {
    /// Open a collection handle with the given read settings.
    fn collection(
        &self,
        database: &str,
        collection: &str,
        options: &ReadOptions,
    ) -> Result<Arc<dyn WatchedCollection>, StoreError>;

    /// Start a session.
    fn start_session(&self, options: SessionOptions) -> Result<Arc<dyn StoreSession>, StoreError>;

    /// Release the connection. Further calls fail with [`StoreError::Closed`].
    fn close(&self);
}

/// A client session.
pub trait StoreSession: Send + Sync {
    /// Session identifier, for logging.
    fn id(&self) -> String;

    /// Options the session was started with.
    fn options(&self) -> SessionOptions;

    /// End the session.
    fn end(&self);
}

/// A collection whose changes can be watched.
pub trait WatchedCollection: Send + Sync {
    /// The collection's namespace.
    fn namespace(&self) -> Namespace;

    /// Open a change stream cursor.
    ///
    /// Fails with [`StoreError::ResumeTokenInvalid`] when `resume_after` is
    /// no longer in the store's history.
    fn watch(&self, options: &WatchOptions) -> Result<Box<dyn ChangeCursor>, StoreError>;
}

/// A resumable change stream cursor.
pub trait ChangeCursor: Send {
    /// Wait up to the cursor's max await for the next notification.
    ///
    /// `Ok(None)` means the wait elapsed without a change.
    fn next_change(&mut self) -> Result<Option<RawChange>, StoreError>;

    /// Whether further notifications can arrive.
    fn is_alive(&self) -> bool;

    /// Token of the last notification returned, if any.
    fn resume_token(&self) -> Option<ResumeToken>;

    /// Close the cursor. Idempotent.
    fn close(&mut self);
}
