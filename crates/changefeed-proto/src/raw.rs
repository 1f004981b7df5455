//! Raw change notifications.
//!
//! A [`RawChange`] is what a store backend reads off its native change
//! stream, converted into store-agnostic values. It is translated into a
//! typed [`ChangeEvent`](crate::ChangeEvent) before reaching subscribers.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::event::ResumeToken;

/// A document as a JSON object.
pub type Document = serde_json::Map<String, Value>;

/// Convert a JSON value into a document.
pub fn try_document(value: Value) -> Result<Document, Error> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(Error::InvalidDocument(format!("expected object, got {}", other))),
    }
}

/// Convert a JSON value into a document.
///
/// Non-object values yield an empty document.
pub fn document(value: Value) -> Document {
    try_document(value).unwrap_or_default()
}

/// Operation classification of a raw notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationType {
    /// Document inserted.
    Insert,
    /// Document updated in place.
    Update,
    /// Document replaced wholesale.
    Replace,
    /// Document deleted.
    Delete,
    /// The stream can no longer continue.
    Invalidate,
    /// Collection dropped.
    Drop,
    /// Collection renamed.
    Rename,
    /// Database dropped.
    DropDatabase,
    /// Any operation this model does not name.
    Other(String),
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationType::Insert => f.write_str("insert"),
            OperationType::Update => f.write_str("update"),
            OperationType::Replace => f.write_str("replace"),
            OperationType::Delete => f.write_str("delete"),
            OperationType::Invalidate => f.write_str("invalidate"),
            OperationType::Drop => f.write_str("drop"),
            OperationType::Rename => f.write_str("rename"),
            OperationType::DropDatabase => f.write_str("dropDatabase"),
            OperationType::Other(name) => f.write_str(name),
        }
    }
}

/// Native identity of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DocumentId {
    /// String identifier.
    String(String),
    /// 12-byte object identifier.
    ObjectId([u8; 12]),
    /// Any other identifier value.
    Other(Value),
}

impl DocumentId {
    /// Parse a 24-character hex object id.
    pub fn parse_object_id(hex_str: &str) -> Result<Self, Error> {
        let mut bytes = [0u8; 12];
        hex::decode_to_slice(hex_str, &mut bytes)
            .map_err(|_| Error::InvalidObjectId(hex_str.to_string()))?;
        Ok(DocumentId::ObjectId(bytes))
    }

    /// Identity as a string, whatever the native representation.
    ///
    /// Object ids render as lowercase hex; other values as compact JSON,
    /// except bare strings which render without quotes.
    pub fn to_uuid_string(&self) -> String {
        match self {
            DocumentId::String(s) => s.clone(),
            DocumentId::ObjectId(bytes) => hex::encode(bytes),
            DocumentId::Other(Value::String(s)) => s.clone(),
            DocumentId::Other(value) => value.to_string(),
        }
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_uuid_string())
    }
}

/// Database and collection a notification belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    /// Database name.
    pub database: String,
    /// Collection name.
    pub collection: String,
}

impl Namespace {
    /// Create a namespace.
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

/// Delta carried by an in-place update.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UpdateDescription {
    /// Fields set by the update, with their new values.
    pub updated_fields: Document,
    /// Fields removed by the update.
    #[serde(default)]
    pub removed_fields: Vec<String>,
}

impl UpdateDescription {
    /// Create a delta with only updated fields.
    pub fn new(updated_fields: Document) -> Self {
        Self {
            updated_fields,
            removed_fields: Vec::new(),
        }
    }

    /// Add removed fields.
    pub fn with_removed_fields(mut self, fields: Vec<String>) -> Self {
        self.removed_fields = fields;
        self
    }
}

/// A change notification as read from a store's change stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
    /// Operation classification.
    pub operation: OperationType,
    /// Position of this notification in the stream.
    pub token: ResumeToken,
    /// Where the change happened.
    pub namespace: Namespace,
    /// Identity of the changed document; absent for stream-level events.
    pub document_id: Option<DocumentId>,
    /// Document after the change, or the looked-up current document for
    /// updates. May be absent when the lookup raced with a deletion.
    pub full_document: Option<Document>,
    /// Delta for in-place updates.
    pub update_description: Option<UpdateDescription>,
}

impl RawChange {
    /// Create an insert notification.
    pub fn insert(
        token: ResumeToken,
        namespace: Namespace,
        id: DocumentId,
        full_document: Document,
    ) -> Self {
        Self {
            operation: OperationType::Insert,
            token,
            namespace,
            document_id: Some(id),
            full_document: Some(full_document),
            update_description: None,
        }
    }

    /// Create an in-place update notification.
    pub fn update(
        token: ResumeToken,
        namespace: Namespace,
        id: DocumentId,
        full_document: Option<Document>,
        delta: UpdateDescription,
    ) -> Self {
        Self {
            operation: OperationType::Update,
            token,
            namespace,
            document_id: Some(id),
            full_document,
            update_description: Some(delta),
        }
    }

    /// Create a replace notification.
    pub fn replace(
        token: ResumeToken,
        namespace: Namespace,
        id: DocumentId,
        full_document: Option<Document>,
    ) -> Self {
        Self {
            operation: OperationType::Replace,
            token,
            namespace,
            document_id: Some(id),
            full_document,
            update_description: None,
        }
    }

    /// Create a delete notification.
    pub fn delete(token: ResumeToken, namespace: Namespace, id: DocumentId) -> Self {
        Self {
            operation: OperationType::Delete,
            token,
            namespace,
            document_id: Some(id),
            full_document: None,
            update_description: None,
        }
    }

    /// Create a stream-level notification (drop, rename, invalidate, ...).
    pub fn stream_event(
        operation: OperationType,
        token: ResumeToken,
        namespace: Namespace,
    ) -> Self {
        Self {
            operation,
            token,
            namespace,
            document_id: None,
            full_document: None,
            update_description: None,
        }
    }

    /// Create an invalidate notification.
    pub fn invalidate(token: ResumeToken, namespace: Namespace) -> Self {
        Self::stream_event(OperationType::Invalidate, token, namespace)
    }
}
