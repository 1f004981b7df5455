//! In-process document store with change streams.
//!
//! Each collection keeps its documents and an ordered change log. Every write
//! appends one entry with a monotonically increasing Log Sequence Number
//! (LSN); resume tokens are the big-endian LSN in hex. Cursors read the log
//! from their position and block on a condition variable, up to their max
//! await, when they reach the end.
//!
//! ## Behavior mirrored from replicated stores
//!
//! - Update notifications look up the *current* document when read, so an
//!   update followed by a delete yields an update without a full document.
//! - [`MemoryCollection::truncate_before`] drops old history; tokens pointing
//!   into it can no longer be resumed from.
//! - Dropping a collection emits `drop` followed by `invalidate`.
//! - Each collection keeps at most a fixed number of log entries
//!   ([`DEFAULT_RETENTION`] unless set with `with_retention`). Older entries
//!   are discarded as new ones arrive, like an oplog rolling over.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::{DashMap, DashSet};
use parking_lot::{Condvar, Mutex};
use serde_json::Value;

use changefeed_proto::{
    Document, DocumentId, Namespace, OperationType, RawChange, ResumeToken, UpdateDescription,
};

use super::{
    ChangeCursor, DocumentStore, FullDocument, ReadOptions, SessionOptions, StoreConnector,
    StoreSession, WatchOptions, WatchedCollection,
};
use crate::error::StoreError;

/// Change log entries kept per collection by default.
pub const DEFAULT_RETENTION: usize = 100_000;

/// Encode an LSN as a resume token.
fn encode_token(lsn: u64) -> ResumeToken {
    ResumeToken::new(hex::encode(lsn.to_be_bytes()))
}

/// Decode a resume token back into its LSN.
fn decode_token(token: &ResumeToken) -> Result<u64, StoreError> {
    let invalid = |reason: &str| StoreError::ResumeTokenInvalid {
        token: token.to_string(),
        reason: reason.to_string(),
    };
    let bytes = hex::decode(token.as_str()).map_err(|_| invalid("not a hex token"))?;
    let bytes: [u8; 8] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| invalid("wrong token length"))?;
    Ok(u64::from_be_bytes(bytes))
}

/// Extract the identity of a document from its `_id` field.
///
/// `{"$oid": "<hex>"}` is read as an object id.
fn document_id(document: &Document) -> Option<DocumentId> {
    match document.get("_id")? {
        Value::String(s) => Some(DocumentId::String(s.clone())),
        Value::Object(map) => match map.get("$oid") {
            Some(Value::String(hex_str)) => DocumentId::parse_object_id(hex_str).ok(),
            _ => Some(DocumentId::Other(Value::Object(map.clone()))),
        },
        other => Some(DocumentId::Other(other.clone())),
    }
}

fn as_document(value: Value) -> Result<Document, StoreError> {
    changefeed_proto::raw::try_document(value).map_err(|e| StoreError::Backend(e.to_string()))
}

/// Failure injected into the next read of a collection's cursors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The read is interrupted.
    Interrupted,
    /// The read fails with a backend error.
    Backend(String),
}

impl From<Fault> for StoreError {
    fn from(fault: Fault) -> Self {
        match fault {
            Fault::Interrupted => StoreError::Interrupted,
            Fault::Backend(message) => StoreError::Backend(message),
        }
    }
}

/// Connector that hands out clients for in-process deployments, keyed by URI.
pub struct MemoryConnector {
    deployments: DashMap<String, Arc<MemoryDeployment>>,
    refused: DashSet<String>,
    retention: usize,
}

impl MemoryConnector {
    /// Create a connector with no deployments.
    pub fn new() -> Self {
        Self {
            deployments: DashMap::new(),
            refused: DashSet::new(),
            retention: DEFAULT_RETENTION,
        }
    }

    /// Change log entries kept per collection in deployments created from now on.
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention.max(1);
        self
    }

    /// Get the deployment at `uri`, creating it if needed.
    pub fn deployment(&self, uri: &str) -> Arc<MemoryDeployment> {
        self.deployments
            .entry(uri.to_string())
            .or_insert_with(|| Arc::new(MemoryDeployment::new(uri).with_retention(self.retention)))
            .value()
            .clone()
    }

    /// Make connections to `uri` fail.
    pub fn refuse(&self, uri: &str) {
        self.refused.insert(uri.to_string());
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreConnector for MemoryConnector {
    fn connect(&self, uri: &str) -> Result<Arc<dyn DocumentStore>, StoreError> {
        if self.refused.contains(uri) {
            return Err(StoreError::Connection(format!("{} refused the connection", uri)));
        }
        let deployment = self.deployment(uri);
        deployment.open_clients.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(uri, "connected to in-memory deployment");
        Ok(Arc::new(MemoryClient {
            deployment,
            closed: AtomicBool::new(false),
        }))
    }
}

/// An in-process deployment: a set of collections plus connection bookkeeping.
pub struct MemoryDeployment {
    uri: String,
    collections: DashMap<Namespace, MemoryCollection>,
    read_options: DashMap<Namespace, ReadOptions>,
    open_clients: AtomicUsize,
    sessions_started: AtomicU64,
    active_sessions: AtomicUsize,
    retention: usize,
}

impl MemoryDeployment {
    /// Create an empty deployment.
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            collections: DashMap::new(),
            read_options: DashMap::new(),
            open_clients: AtomicUsize::new(0),
            sessions_started: AtomicU64::new(0),
            active_sessions: AtomicUsize::new(0),
            retention: DEFAULT_RETENTION,
        }
    }

    /// Keep at most `retention` change log entries per collection.
    ///
    /// Applies to collections created after the call.
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention.max(1);
        self
    }

    /// The deployment's URI.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Get a collection, creating it if needed.
    pub fn collection(&self, database: &str, collection: &str) -> MemoryCollection {
        let namespace = Namespace::new(database, collection);
        self.collections
            .entry(namespace.clone())
            .or_insert_with(|| MemoryCollection::new(namespace, self.retention))
            .value()
            .clone()
    }

    /// Read options the collection was last opened with by a client.
    pub fn read_options(&self, database: &str, collection: &str) -> Option<ReadOptions> {
        self.read_options
            .get(&Namespace::new(database, collection))
            .map(|options| options.value().clone())
    }

    /// Number of clients connected and not yet closed.
    pub fn open_clients(&self) -> usize {
        self.open_clients.load(Ordering::SeqCst)
    }

    /// Total number of sessions ever started.
    pub fn sessions_started(&self) -> u64 {
        self.sessions_started.load(Ordering::SeqCst)
    }

    /// Number of sessions started and not yet ended.
    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::SeqCst)
    }
}

/// A client connected to a [`MemoryDeployment`].
pub struct MemoryClient {
    deployment: Arc<MemoryDeployment>,
    closed: AtomicBool,
}

impl MemoryClient {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed("client"));
        }
        Ok(())
    }
}

impl DocumentStore for MemoryClient {
    fn collection(
        &self,
        database: &str,
        collection: &str,
        options: &ReadOptions,
    ) -> Result<Arc<dyn WatchedCollection>, StoreError> {
        self.ensure_open()?;
        let handle = self.deployment.collection(database, collection);
        self.deployment
            .read_options
            .insert(handle.namespace(), options.clone());
        Ok(Arc::new(handle))
    }

    fn start_session(&self, options: SessionOptions) -> Result<Arc<dyn StoreSession>, StoreError> {
        self.ensure_open()?;
        let id = self.deployment.sessions_started.fetch_add(1, Ordering::SeqCst) + 1;
        self.deployment.active_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemorySession {
            id,
            options,
            deployment: self.deployment.clone(),
            ended: AtomicBool::new(false),
        }))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.deployment.open_clients.fetch_sub(1, Ordering::SeqCst);
            tracing::debug!(uri = %self.deployment.uri, "closed in-memory client");
        }
    }
}

struct MemorySession {
    id: u64,
    options: SessionOptions,
    deployment: Arc<MemoryDeployment>,
    ended: AtomicBool,
}

impl StoreSession for MemorySession {
    fn id(&self) -> String {
        format!("memory-session-{}", self.id)
    }

    fn options(&self) -> SessionOptions {
        self.options
    }

    fn end(&self) {
        if !self.ended.swap(true, Ordering::SeqCst) {
            self.deployment.active_sessions.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// One change log entry.
#[derive(Debug, Clone)]
struct LogEntry {
    lsn: u64,
    change: RawChange,
    /// Fill the full document from the current state when read.
    lookup: bool,
}

struct CollectionState {
    documents: HashMap<String, Document>,
    log: VecDeque<LogEntry>,
    /// Next LSN to assign.
    next_lsn: u64,
    /// LSN of the oldest retained entry (equals `next_lsn` when empty).
    first_retained: u64,
    /// Maximum number of retained entries.
    retention: usize,
    faults: VecDeque<Fault>,
}

impl CollectionState {
    fn get(&self, lsn: u64) -> Option<&LogEntry> {
        if lsn < self.first_retained {
            return None;
        }
        self.log.get((lsn - self.first_retained) as usize)
    }
}

struct CollectionInner {
    namespace: Namespace,
    state: Mutex<CollectionState>,
    changed: Condvar,
    open_cursors: AtomicUsize,
}

/// A collection with a change log. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemoryCollection {
    inner: Arc<CollectionInner>,
}

impl MemoryCollection {
    fn new(namespace: Namespace, retention: usize) -> Self {
        Self {
            inner: Arc::new(CollectionInner {
                namespace,
                state: Mutex::new(CollectionState {
                    documents: HashMap::new(),
                    log: VecDeque::new(),
                    next_lsn: 1,
                    first_retained: 1,
                    retention,
                    faults: VecDeque::new(),
                }),
                changed: Condvar::new(),
                open_cursors: AtomicUsize::new(0),
            }),
        }
    }

    /// Append a change to the log under the state lock and wake readers.
    fn append(
        &self,
        state: &mut CollectionState,
        mut change: RawChange,
        lookup: bool,
    ) -> ResumeToken {
        let lsn = state.next_lsn;
        state.next_lsn += 1;
        change.token = encode_token(lsn);
        let token = change.token.clone();
        state.log.push_back(LogEntry { lsn, change, lookup });
        while state.log.len() > state.retention {
            state.log.pop_front();
        }
        if let Some(front) = state.log.front() {
            state.first_retained = front.lsn;
        }
        self.inner.changed.notify_all();
        token
    }

    fn placeholder_token() -> ResumeToken {
        ResumeToken::new(String::new())
    }

    /// Insert a document. The document must carry an `_id`.
    pub fn insert(&self, document: Value) -> Result<DocumentId, StoreError> {
        let document = as_document(document)?;
        let id = document_id(&document)
            .ok_or_else(|| StoreError::Backend("document has no _id".into()))?;
        let key = id.to_uuid_string();

        let mut state = self.inner.state.lock();
        if state.documents.contains_key(&key) {
            return Err(StoreError::Backend(format!("duplicate key {}", key)));
        }
        state.documents.insert(key, document.clone());
        let change = RawChange::insert(
            Self::placeholder_token(),
            self.inner.namespace.clone(),
            id.clone(),
            document,
        );
        self.append(&mut state, change, false);
        Ok(id)
    }

    /// Set fields on an existing document.
    pub fn update(&self, id: &DocumentId, fields: Value) -> Result<ResumeToken, StoreError> {
        let fields = as_document(fields)?;
        let key = id.to_uuid_string();

        let mut state = self.inner.state.lock();
        let document = state
            .documents
            .get_mut(&key)
            .ok_or_else(|| StoreError::Backend(format!("document {} not found", key)))?;
        for (field, value) in &fields {
            document.insert(field.clone(), value.clone());
        }
        let change = RawChange::update(
            Self::placeholder_token(),
            self.inner.namespace.clone(),
            id.clone(),
            None,
            UpdateDescription::new(fields),
        );
        Ok(self.append(&mut state, change, true))
    }

    /// Replace an existing document, keeping its `_id`.
    pub fn replace(&self, id: &DocumentId, replacement: Value) -> Result<ResumeToken, StoreError> {
        let mut replacement = as_document(replacement)?;
        let key = id.to_uuid_string();

        let mut state = self.inner.state.lock();
        let document = state
            .documents
            .get_mut(&key)
            .ok_or_else(|| StoreError::Backend(format!("document {} not found", key)))?;
        if let Some(original_id) = document.get("_id") {
            replacement.insert("_id".to_string(), original_id.clone());
        }
        *document = replacement.clone();
        let change = RawChange::replace(
            Self::placeholder_token(),
            self.inner.namespace.clone(),
            id.clone(),
            Some(replacement),
        );
        Ok(self.append(&mut state, change, false))
    }

    /// Delete a document.
    pub fn delete(&self, id: &DocumentId) -> Result<ResumeToken, StoreError> {
        let key = id.to_uuid_string();

        let mut state = self.inner.state.lock();
        if state.documents.remove(&key).is_none() {
            return Err(StoreError::Backend(format!("document {} not found", key)));
        }
        let change = RawChange::delete(
            Self::placeholder_token(),
            self.inner.namespace.clone(),
            id.clone(),
        );
        Ok(self.append(&mut state, change, false))
    }

    /// Drop every document. Emits `drop` then `invalidate`.
    pub fn drop_collection(&self) -> ResumeToken {
        let mut state = self.inner.state.lock();
        state.documents.clear();
        let namespace = self.inner.namespace.clone();
        self.append(
            &mut state,
            RawChange::stream_event(
                OperationType::Drop,
                Self::placeholder_token(),
                namespace.clone(),
            ),
            false,
        );
        self.append(
            &mut state,
            RawChange::invalidate(Self::placeholder_token(), namespace),
            false,
        );
        tracing::debug!(namespace = %self.inner.namespace, "collection dropped");
        encode_token(state.next_lsn - 1)
    }

    /// Append an arbitrary notification as-is, assigning it the next token.
    pub fn push_raw(&self, change: RawChange) -> ResumeToken {
        let mut state = self.inner.state.lock();
        self.append(&mut state, change, false)
    }

    /// Fail the next cursor read with `fault`.
    pub fn inject_fault(&self, fault: Fault) {
        let mut state = self.inner.state.lock();
        state.faults.push_back(fault);
        self.inner.changed.notify_all();
    }

    /// Drop history before the entry at `token` (exclusive).
    ///
    /// Returns the number of entries removed.
    pub fn truncate_before(&self, token: &ResumeToken) -> Result<u64, StoreError> {
        let before = decode_token(token)?;
        let mut state = self.inner.state.lock();
        let mut removed = 0u64;
        while let Some(front) = state.log.front() {
            if front.lsn >= before {
                break;
            }
            state.log.pop_front();
            removed += 1;
        }
        state.first_retained = state
            .log
            .front()
            .map(|entry| entry.lsn)
            .unwrap_or(state.next_lsn);
        Ok(removed)
    }

    /// Drop all history.
    pub fn truncate_all(&self) -> u64 {
        let mut state = self.inner.state.lock();
        let removed = state.log.len() as u64;
        state.log.clear();
        state.first_retained = state.next_lsn;
        removed
    }

    /// Token of the most recent change, if any was ever written.
    pub fn current_token(&self) -> Option<ResumeToken> {
        let state = self.inner.state.lock();
        (state.next_lsn > 1).then(|| encode_token(state.next_lsn - 1))
    }

    /// Current state of a document.
    pub fn document(&self, id: &DocumentId) -> Option<Document> {
        let state = self.inner.state.lock();
        state.documents.get(&id.to_uuid_string()).cloned()
    }

    /// Number of documents.
    pub fn len(&self) -> usize {
        self.inner.state.lock().documents.len()
    }

    /// Whether the collection holds no documents.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of cursors opened and not yet closed.
    pub fn open_cursors(&self) -> usize {
        self.inner.open_cursors.load(Ordering::SeqCst)
    }
}

impl WatchedCollection for MemoryCollection {
    fn namespace(&self) -> Namespace {
        self.inner.namespace.clone()
    }

    fn watch(&self, options: &WatchOptions) -> Result<Box<dyn ChangeCursor>, StoreError> {
        let position = {
            let state = self.inner.state.lock();
            match &options.resume_after {
                Some(token) => {
                    let lsn = decode_token(token)?;
                    if state.get(lsn).is_none() {
                        return Err(StoreError::ResumeTokenInvalid {
                            token: token.to_string(),
                            reason: "resume point is no longer in the change log".into(),
                        });
                    }
                    lsn + 1
                }
                None => state.next_lsn,
            }
        };

        self.inner.open_cursors.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(
            namespace = %self.inner.namespace,
            position,
            session = ?options.session.as_ref().map(|s| s.id()),
            "opened change cursor"
        );

        Ok(Box::new(MemoryCursor {
            collection: self.inner.clone(),
            position,
            max_await: options.max_await,
            lookup: options.full_document == FullDocument::UpdateLookup,
            last_token: None,
            alive: true,
            closed: false,
        }))
    }
}

/// Cursor over a [`MemoryCollection`]'s change log.
struct MemoryCursor {
    collection: Arc<CollectionInner>,
    /// Next LSN to read.
    position: u64,
    max_await: Duration,
    lookup: bool,
    last_token: Option<ResumeToken>,
    alive: bool,
    closed: bool,
}

impl ChangeCursor for MemoryCursor {
    fn next_change(&mut self) -> Result<Option<RawChange>, StoreError> {
        if self.closed {
            return Err(StoreError::Closed("cursor"));
        }
        if !self.alive {
            return Ok(None);
        }

        let deadline = Instant::now() + self.max_await;
        let mut state = self.collection.state.lock();
        loop {
            if let Some(fault) = state.faults.pop_front() {
                return Err(fault.into());
            }
            if self.position < state.first_retained {
                return Err(StoreError::Backend(
                    "change stream history lost: cursor position was truncated".into(),
                ));
            }

            if let Some(entry) = state.get(self.position) {
                let mut change = entry.change.clone();
                if entry.lookup && self.lookup {
                    change.full_document = change
                        .document_id
                        .as_ref()
                        .and_then(|id| state.documents.get(&id.to_uuid_string()).cloned());
                }
                self.position = entry.lsn + 1;
                if change.operation == OperationType::Invalidate {
                    self.alive = false;
                }
                self.last_token = Some(change.token.clone());
                return Ok(Some(change));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            self.collection.changed.wait_for(&mut state, deadline - now);
        }
    }

    fn is_alive(&self) -> bool {
        self.alive && !self.closed
    }

    fn resume_token(&self) -> Option<ResumeToken> {
        self.last_token.clone()
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.collection.open_cursors.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for MemoryCursor {
    fn drop(&mut self) {
        self.close();
    }
}
