//! MongoDB backend using the driver's synchronous API.
//!
//! Change stream events are converted to [`RawChange`]s with documents in
//! relaxed extended JSON. Resume tokens are the extended JSON text of the
//! driver's token.
//!
//! Driver sessions are exclusive to one operation at a time, so each cursor
//! opened under a [`StoreSession`] starts its own driver session with the
//! same options.
//!
//! Closing a [`MongoClient`] marks it and every collection handle it gave
//! out as closed, so no new change stream can be opened through them. The
//! driver releases its connection pool once the last handle is dropped,
//! which happens when the tasks holding them exit.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use mongodb::bson::{self, Bson, Document as BsonDocument};
use mongodb::change_stream::event::{
    ChangeStreamEvent, OperationType as MongoOperation, ResumeToken as MongoResumeToken,
};
use mongodb::error::{Error as MongoError, ErrorKind};
use mongodb::options::{
    CollectionOptions, FullDocumentType, ReadConcern as MongoReadConcern,
    ReadPreference as MongoReadPreference, ReadPreferenceOptions, SelectionCriteria,
};
use mongodb::sync::{ChangeStream, Client, ClientSession, Collection, SessionChangeStream};
use parking_lot::Mutex;
use serde_json::Value;

use changefeed_proto::raw::document;
use changefeed_proto::{
    Document, DocumentId, Namespace, OperationType, RawChange, ResumeToken, UpdateDescription,
};

use super::{
    ChangeCursor, DocumentStore, FullDocument, ReadConcern, ReadOptions, ReadPreference,
    SessionOptions, StoreConnector, StoreSession, WatchOptions, WatchedCollection,
};
use crate::error::StoreError;

/// Server error codes with a dedicated meaning for change streams.
const CODE_INTERRUPTED: i32 = 11601;
const CODE_CURSOR_KILLED: i32 = 237;
const CODE_HISTORY_LOST: i32 = 286;
const CODE_BAD_RESUME: i32 = 280;

fn store_error(e: MongoError) -> StoreError {
    if let ErrorKind::Command(command) = e.kind.as_ref() {
        match command.code {
            CODE_INTERRUPTED | CODE_CURSOR_KILLED => return StoreError::Interrupted,
            _ => {}
        }
    }
    StoreError::Backend(e.to_string())
}

fn resume_error(token: &ResumeToken, e: MongoError) -> StoreError {
    if let ErrorKind::Command(command) = e.kind.as_ref() {
        if command.code == CODE_HISTORY_LOST || command.code == CODE_BAD_RESUME {
            return StoreError::ResumeTokenInvalid {
                token: token.to_string(),
                reason: command.message.clone(),
            };
        }
    }
    store_error(e)
}

fn encode_token(token: &MongoResumeToken) -> Result<ResumeToken, StoreError> {
    let bson = bson::to_bson(token).map_err(|e| StoreError::Backend(e.to_string()))?;
    Ok(ResumeToken::new(bson.into_relaxed_extjson().to_string()))
}

fn decode_token(token: &ResumeToken) -> Result<MongoResumeToken, StoreError> {
    let invalid = |reason: String| StoreError::ResumeTokenInvalid {
        token: token.to_string(),
        reason,
    };
    let json: Value = serde_json::from_str(token.as_str()).map_err(|e| invalid(e.to_string()))?;
    let bson = Bson::try_from(json).map_err(|e| invalid(e.to_string()))?;
    bson::from_bson(bson).map_err(|e| invalid(e.to_string()))
}

fn to_document(doc: BsonDocument) -> Document {
    document(Bson::Document(doc).into_relaxed_extjson())
}

fn to_document_id(id: &Bson) -> DocumentId {
    match id {
        Bson::ObjectId(oid) => DocumentId::ObjectId(oid.bytes()),
        Bson::String(s) => DocumentId::String(s.clone()),
        other => DocumentId::Other(other.clone().into_relaxed_extjson()),
    }
}

fn to_operation(operation: &MongoOperation) -> OperationType {
    match operation {
        MongoOperation::Insert => OperationType::Insert,
        MongoOperation::Update => OperationType::Update,
        MongoOperation::Replace => OperationType::Replace,
        MongoOperation::Delete => OperationType::Delete,
        MongoOperation::Drop => OperationType::Drop,
        MongoOperation::Rename => OperationType::Rename,
        MongoOperation::DropDatabase => OperationType::DropDatabase,
        MongoOperation::Invalidate => OperationType::Invalidate,
        MongoOperation::Other(name) => OperationType::Other(name.clone()),
        other => OperationType::Other(format!("{:?}", other)),
    }
}

fn to_raw_change(
    event: ChangeStreamEvent<BsonDocument>,
    fallback: &Namespace,
) -> Result<RawChange, StoreError> {
    let namespace = event
        .ns
        .map(|ns| Namespace::new(ns.db, ns.coll.unwrap_or_else(|| fallback.collection.clone())))
        .unwrap_or_else(|| fallback.clone());

    Ok(RawChange {
        operation: to_operation(&event.operation_type),
        token: encode_token(&event.id)?,
        namespace,
        document_id: event
            .document_key
            .as_ref()
            .and_then(|key| key.get("_id"))
            .map(to_document_id),
        full_document: event.full_document.map(to_document),
        update_description: event.update_description.map(|delta| {
            UpdateDescription::new(to_document(delta.updated_fields))
                .with_removed_fields(delta.removed_fields)
        }),
    })
}

fn to_read_preference(preference: &ReadPreference) -> MongoReadPreference {
    match preference {
        ReadPreference::Primary => MongoReadPreference::Primary,
        ReadPreference::SecondaryPreferred => {
            MongoReadPreference::SecondaryPreferred { options: None }
        }
        ReadPreference::Secondary { tag_set } => {
            let tag_set = tag_set
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            MongoReadPreference::Secondary {
                options: Some(ReadPreferenceOptions::builder().tag_sets(vec![tag_set]).build()),
            }
        }
    }
}

/// Connects to MongoDB deployments by connection string.
#[derive(Debug, Default, Clone, Copy)]
pub struct MongoConnector;

impl MongoConnector {
    /// Create a connector.
    pub fn new() -> Self {
        Self
    }
}

impl StoreConnector for MongoConnector {
    fn connect(&self, uri: &str) -> Result<Arc<dyn DocumentStore>, StoreError> {
        let client = Client::with_uri_str(uri).map_err(|e| StoreError::Connection(e.to_string()))?;
        tracing::debug!("connected to mongodb deployment");
        Ok(Arc::new(MongoClient {
            client: Mutex::new(Some(client)),
            closed: Arc::new(AtomicBool::new(false)),
            sessions: AtomicU64::new(0),
        }))
    }
}

/// A connected MongoDB client.
pub struct MongoClient {
    client: Mutex<Option<Client>>,
    /// Shared with every collection handle.
    closed: Arc<AtomicBool>,
    sessions: AtomicU64,
}

impl MongoClient {
    fn client(&self) -> Result<Client, StoreError> {
        self.client.lock().clone().ok_or(StoreError::Closed("client"))
    }
}

impl DocumentStore for MongoClient {
    fn collection(
        &self,
        database: &str,
        collection: &str,
        options: &ReadOptions,
    ) -> Result<Arc<dyn WatchedCollection>, StoreError> {
        let client = self.client()?;
        let read_concern = match options.read_concern {
            ReadConcern::Local => MongoReadConcern::local(),
            ReadConcern::Majority => MongoReadConcern::majority(),
        };
        let collection_options = CollectionOptions::builder()
            .read_concern(read_concern)
            .selection_criteria(SelectionCriteria::ReadPreference(to_read_preference(
                &options.read_preference,
            )))
            .build();
        let handle = client
            .database(database)
            .collection_with_options::<BsonDocument>(collection, collection_options);

        Ok(Arc::new(MongoCollection {
            client,
            closed: self.closed.clone(),
            collection: handle,
            namespace: Namespace::new(database, collection),
        }))
    }

    fn start_session(&self, options: SessionOptions) -> Result<Arc<dyn StoreSession>, StoreError> {
        let client = self.client()?;
        // Validates that the deployment supports sessions
        let session = client
            .start_session()
            .causal_consistency(options.causal_consistency)
            .run()
            .map_err(store_error)?;
        let id = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Arc::new(MongoSession {
            id,
            options,
            session: Mutex::new(Some(session)),
        }))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if self.client.lock().take().is_some() {
            tracing::debug!("closed mongodb client");
        }
    }
}

struct MongoSession {
    id: u64,
    options: SessionOptions,
    session: Mutex<Option<ClientSession>>,
}

impl StoreSession for MongoSession {
    fn id(&self) -> String {
        format!("mongodb-session-{}", self.id)
    }

    fn options(&self) -> SessionOptions {
        self.options
    }

    fn end(&self) {
        self.session.lock().take();
    }
}

struct MongoCollection {
    client: Client,
    closed: Arc<AtomicBool>,
    collection: Collection<BsonDocument>,
    namespace: Namespace,
}

impl WatchedCollection for MongoCollection {
    fn namespace(&self) -> Namespace {
        self.namespace.clone()
    }

    fn watch(&self, options: &WatchOptions) -> Result<Box<dyn ChangeCursor>, StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed("client"));
        }
        let resume_after = options.resume_after.as_ref().map(decode_token).transpose()?;
        let full_document = match options.full_document {
            FullDocument::Default => FullDocumentType::Default,
            FullDocument::UpdateLookup => FullDocumentType::UpdateLookup,
        };
        let on_error = |e: MongoError| match &options.resume_after {
            Some(token) => resume_error(token, e),
            None => store_error(e),
        };

        let mut watch = self
            .collection
            .watch()
            .full_document(full_document)
            .max_await_time(options.max_await);
        if let Some(token) = resume_after {
            watch = watch.resume_after(token);
        }

        let stream = match &options.session {
            Some(session) => {
                let mut driver_session = self
                    .client
                    .start_session()
                    .causal_consistency(session.options().causal_consistency)
                    .run()
                    .map_err(store_error)?;
                let stream = watch.session(&mut driver_session).run().map_err(on_error)?;
                Stream::Session(stream, driver_session)
            }
            None => Stream::Plain(watch.run().map_err(on_error)?),
        };

        tracing::trace!(namespace = %self.namespace, "opened mongodb change stream");
        Ok(Box::new(MongoCursor {
            stream: Some(stream),
            namespace: self.namespace.clone(),
        }))
    }
}

enum Stream {
    Plain(ChangeStream<ChangeStreamEvent<BsonDocument>>),
    Session(SessionChangeStream<ChangeStreamEvent<BsonDocument>>, ClientSession),
}

struct MongoCursor {
    stream: Option<Stream>,
    namespace: Namespace,
}

impl ChangeCursor for MongoCursor {
    fn next_change(&mut self) -> Result<Option<RawChange>, StoreError> {
        let event = match self.stream.as_mut() {
            Some(Stream::Plain(stream)) => stream.next_if_any().map_err(store_error)?,
            Some(Stream::Session(stream, session)) => {
                stream.next_if_any(session).map_err(store_error)?
            }
            None => return Err(StoreError::Closed("cursor")),
        };
        event
            .map(|event| to_raw_change(event, &self.namespace))
            .transpose()
    }

    fn is_alive(&self) -> bool {
        match &self.stream {
            Some(Stream::Plain(stream)) => stream.is_alive(),
            Some(Stream::Session(stream, _)) => stream.is_alive(),
            None => false,
        }
    }

    fn resume_token(&self) -> Option<ResumeToken> {
        let token = match &self.stream {
            Some(Stream::Plain(stream)) => stream.resume_token(),
            Some(Stream::Session(stream, _)) => stream.resume_token(),
            None => None,
        }?;
        encode_token(&token).ok()
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            tracing::trace!(namespace = %self.namespace, "closed mongodb change stream");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::oid::ObjectId;
    use mongodb::bson::doc;
    use std::time::Duration;

    #[test]
    fn test_document_id_conversion() {
        let oid = ObjectId::parse_str("5f1d7e4b9c1a2b3c4d5e6f70").unwrap();
        assert_eq!(
            to_document_id(&Bson::ObjectId(oid)).to_uuid_string(),
            "5f1d7e4b9c1a2b3c4d5e6f70"
        );
        assert_eq!(to_document_id(&Bson::String("A".into())).to_uuid_string(), "A");
        assert_eq!(to_document_id(&Bson::Int32(7)).to_uuid_string(), "7");
    }

    #[test]
    fn test_document_conversion() {
        let converted = to_document(doc! { "name": "alice", "age": 30 });
        assert_eq!(converted.get("name"), Some(&Value::from("alice")));
        assert_eq!(converted.get("age"), Some(&Value::from(30)));
    }

    #[test]
    fn test_read_preference_conversion() {
        assert!(matches!(
            to_read_preference(&ReadPreference::SecondaryPreferred),
            MongoReadPreference::SecondaryPreferred { .. }
        ));
        match to_read_preference(&ReadPreference::tagged_secondary("region", "east")) {
            MongoReadPreference::Secondary { options: Some(options) } => {
                let tag_sets = options.tag_sets.unwrap();
                assert_eq!(tag_sets[0].get("region").map(String::as_str), Some("east"));
            }
            other => panic!("unexpected read preference {:?}", other),
        }
    }

    #[test]
    fn test_closed_client_refuses_new_streams() {
        // Client construction does not contact the server
        let store = MongoConnector::new()
            .connect("mongodb://localhost:27017")
            .unwrap();
        let users = store
            .collection("app", "users", &ReadOptions::majority(ReadPreference::Primary))
            .unwrap();
        store.close();

        let result = users.watch(&WatchOptions::new(Duration::from_millis(20)));
        assert!(matches!(result, Err(StoreError::Closed("client"))));
        assert!(matches!(
            store.collection("app", "users", &ReadOptions::majority(ReadPreference::Primary)),
            Err(StoreError::Closed("client"))
        ));
    }

    #[test]
    fn test_malformed_token_is_rejected() {
        assert!(matches!(
            decode_token(&ResumeToken::new("not json")),
            Err(StoreError::ResumeTokenInvalid { .. })
        ));
    }
}
