//! Typed change events delivered to subscribers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::raw::Document;

/// Types of changes a change stream can report.
///
/// `Replace` is accepted when classifying raw notifications but is emitted as
/// `Update`, and `Invalidate` is never emitted at all. Subscribers therefore
/// only ever observe `Insert`, `Update` and `Delete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    /// A new document was inserted.
    Insert,
    /// An existing document was updated (or replaced).
    Update,
    /// A document was deleted.
    Delete,
    /// A document was replaced wholesale.
    Replace,
    /// The watched stream lost its continuation point.
    Invalidate,
}

impl ChangeType {
    /// Whether events of this type can be handed to a subscriber.
    pub fn is_deliverable(&self) -> bool {
        matches!(self, ChangeType::Insert | ChangeType::Update | ChangeType::Delete)
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeType::Insert => "INSERT",
            ChangeType::Update => "UPDATE",
            ChangeType::Delete => "DELETE",
            ChangeType::Replace => "REPLACE",
            ChangeType::Invalidate => "INVALIDATE",
        };
        f.write_str(name)
    }
}

/// Opaque resume position within a change stream.
///
/// The textual shape is whatever the backing store defines; it is only ever
/// handed back to the same store to resume a cursor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeToken(String);

impl ResumeToken {
    /// Wrap a store-defined token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The token's textual form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the token, returning its textual form.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ResumeToken {
    fn from(token: String) -> Self {
        Self(token)
    }
}

impl From<&str> for ResumeToken {
    fn from(token: &str) -> Self {
        Self(token.to_string())
    }
}

/// A typed change to one document of a tracked collection.
///
/// Payload shape per change type:
///
/// | change type | `full_document` | `changes` |
/// |-------------|-----------------|-----------|
/// | `Insert`    | present         | `None`    |
/// | `Update`    | present         | delta for in-place updates, `None` for replacements |
/// | `Delete`    | `None`          | `None`    |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent<T> {
    /// Position to resume from after this event.
    pub token: ResumeToken,
    /// The kind of change.
    pub change_type: ChangeType,
    /// Name of the tracked entity type.
    pub entity_type: String,
    /// Identity of the changed document, normalized to a string.
    pub uuid: String,
    /// Document state after the change.
    pub full_document: Option<T>,
    /// Updated fields for in-place updates.
    pub changes: Option<Document>,
}

impl<T> ChangeEvent<T> {
    /// Field paths touched by an in-place update.
    pub fn changed_fields(&self) -> Vec<&str> {
        self.changes
            .as_ref()
            .map(|changes| changes.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Whether every field touched by this update is one of `fields`.
    ///
    /// Returns false when the event carries no delta, since a replacement or
    /// insert may have touched anything.
    pub fn is_change_field_subset(&self, fields: &[&str]) -> bool {
        match &self.changes {
            Some(changes) => changes.keys().all(|key| fields.contains(&key.as_str())),
            None => false,
        }
    }
}

/// Where a tracked entity type lives.
///
/// Resolved by the caller (from configuration or annotations) before tracking
/// starts. A missing datastore means the primary datastore.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityDescriptor {
    /// Name of the entity type (e.g., "User").
    pub entity_type: String,
    /// Name of the owning datastore.
    #[serde(default)]
    pub datastore: Option<String>,
    /// Database override; the datastore's default database when absent.
    #[serde(default)]
    pub database: Option<String>,
    /// Collection holding the entity's documents.
    pub collection: String,
}

impl EntityDescriptor {
    /// Create a descriptor for an entity stored in the primary datastore.
    pub fn new(entity_type: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            datastore: None,
            database: None,
            collection: collection.into(),
        }
    }

    /// Set the owning datastore.
    pub fn with_datastore(mut self, datastore: impl Into<String>) -> Self {
        self.datastore = Some(datastore.into());
        self
    }

    /// Set the database override.
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Check that the descriptor names both a type and a collection.
    pub fn validate(&self) -> Result<(), Error> {
        if self.entity_type.is_empty() {
            return Err(Error::InvalidDescriptor("entity type is empty".into()));
        }
        if self.collection.is_empty() {
            return Err(Error::InvalidDescriptor(format!(
                "collection for {} is empty",
                self.entity_type
            )));
        }
        Ok(())
    }
}
