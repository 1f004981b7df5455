//! Raw notification filtering and translation.
//!
//! | raw operation | change type | full document | changes |
//! |---------------|-------------|---------------|---------|
//! | insert        | `Insert`    | document      | `None`  |
//! | replace       | `Update`    | document      | `None`  |
//! | update        | `Update`    | looked up     | updated fields |
//! | delete        | `Delete`    | `None`        | `None`  |
//! | invalidate    | error: [`TranslateError::Invalidated`] |||

use serde::de::DeserializeOwned;
use serde_json::Value;

use changefeed_proto::{ChangeEvent, ChangeType, Document, OperationType, RawChange};

use crate::error::TranslateError;

/// Whether a raw notification should be translated and delivered.
///
/// Document-carrying notifications whose lookup raced with a deletion come
/// back without a full document and are dropped. Deletes never carry one and
/// always pass.
pub fn should_process(change: &RawChange) -> bool {
    change.full_document.is_some() || change.operation == OperationType::Delete
}

/// Translate a raw notification into a typed change event.
pub fn translate<T: DeserializeOwned>(
    change: RawChange,
    entity_type: &str,
) -> Result<ChangeEvent<T>, TranslateError> {
    let (change_type, keep_delta) = match &change.operation {
        OperationType::Insert => (ChangeType::Insert, false),
        OperationType::Replace => (ChangeType::Update, false),
        OperationType::Update => (ChangeType::Update, true),
        OperationType::Delete => (ChangeType::Delete, false),
        OperationType::Invalidate => {
            return Err(TranslateError::Invalidated {
                namespace: change.namespace.to_string(),
                token: change.token.into_inner(),
            });
        }
        other => return Err(TranslateError::UnsupportedOperation(other.to_string())),
    };

    let uuid = change
        .document_id
        .as_ref()
        .map(|id| id.to_uuid_string())
        .ok_or_else(|| TranslateError::MissingDocumentKey(change.operation.to_string()))?;

    let full_document = match change_type {
        ChangeType::Delete => None,
        _ => change
            .full_document
            .map(|document| decode(document, entity_type, &uuid))
            .transpose()?,
    };

    let changes = if keep_delta {
        Some(
            change
                .update_description
                .map(|delta| delta.updated_fields)
                .unwrap_or_default(),
        )
    } else {
        None
    };

    Ok(ChangeEvent {
        token: change.token,
        change_type,
        entity_type: entity_type.to_string(),
        uuid,
        full_document,
        changes,
    })
}

fn decode<T: DeserializeOwned>(
    document: Document,
    entity_type: &str,
    uuid: &str,
) -> Result<T, TranslateError> {
    serde_json::from_value(Value::Object(document)).map_err(|source| TranslateError::Decode {
        entity_type: entity_type.to_string(),
        uuid: uuid.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use changefeed_proto::raw::document;
    use changefeed_proto::{DocumentId, Namespace, ResumeToken, UpdateDescription};
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Deserialize)]
    struct User {
        #[serde(rename = "_id")]
        id: String,
        name: String,
    }

    fn ns() -> Namespace {
        Namespace::new("app", "users")
    }

    fn token() -> ResumeToken {
        ResumeToken::new("0000000000000007")
    }

    fn id() -> DocumentId {
        DocumentId::String("A".into())
    }

    fn alice() -> Document {
        document(json!({"_id": "A", "name": "alice"}))
    }

    #[test]
    fn test_insert() {
        let change = RawChange::insert(token(), ns(), id(), alice());
        let event: ChangeEvent<User> = translate(change, "User").unwrap();

        assert_eq!(event.change_type, ChangeType::Insert);
        assert_eq!(event.entity_type, "User");
        assert_eq!(event.uuid, "A");
        assert_eq!(event.token, token());
        assert_eq!(event.full_document.unwrap().name, "alice");
        assert!(event.changes.is_none());
    }

    #[test]
    fn test_replace_is_reported_as_update() {
        let change = RawChange::replace(token(), ns(), id(), Some(alice()));
        let event: ChangeEvent<User> = translate(change, "User").unwrap();

        assert_eq!(event.change_type, ChangeType::Update);
        assert!(event.full_document.is_some());
        assert!(event.changes.is_none());
    }

    #[test]
    fn test_update_carries_delta() {
        let delta = UpdateDescription::new(document(json!({"name": "alice"})))
            .with_removed_fields(vec!["nickname".into()]);
        let change = RawChange::update(token(), ns(), id(), Some(alice()), delta);
        let event: ChangeEvent<User> = translate(change, "User").unwrap();

        assert_eq!(event.change_type, ChangeType::Update);
        assert!(event.full_document.is_some());
        assert_eq!(event.changes, Some(document(json!({"name": "alice"}))));
    }

    #[test]
    fn test_delete() {
        let change = RawChange::delete(token(), ns(), id());
        let event: ChangeEvent<User> = translate(change, "User").unwrap();

        assert_eq!(event.change_type, ChangeType::Delete);
        assert_eq!(event.uuid, "A");
        assert!(event.full_document.is_none());
        assert!(event.changes.is_none());
    }

    #[test]
    fn test_invalidate_is_fatal() {
        let change = RawChange::invalidate(token(), ns());
        let result = translate::<User>(change, "User");

        match result {
            Err(TranslateError::Invalidated { namespace, token }) => {
                assert_eq!(namespace, "app.users");
                assert_eq!(token, "0000000000000007");
            }
            other => panic!("expected invalidation, got {:?}", other),
        }
    }

    #[test]
    fn test_object_id_is_normalized() {
        let oid = DocumentId::parse_object_id("5f1d7e4b9c1a2b3c4d5e6f70").unwrap();
        let change = RawChange::delete(token(), ns(), oid);
        let event: ChangeEvent<Value> = translate(change, "User").unwrap();
        assert_eq!(event.uuid, "5f1d7e4b9c1a2b3c4d5e6f70");
    }

    #[test]
    fn test_unsupported_and_malformed() {
        let drop = RawChange::stream_event(OperationType::Drop, token(), ns());
        assert!(matches!(
            translate::<Value>(drop, "User"),
            Err(TranslateError::UnsupportedOperation(op)) if op == "drop"
        ));

        let mut keyless = RawChange::delete(token(), ns(), id());
        keyless.document_id = None;
        assert!(matches!(
            translate::<Value>(keyless, "User"),
            Err(TranslateError::MissingDocumentKey(_))
        ));

        let wrong_shape = RawChange::insert(token(), ns(), id(), document(json!({"_id": "A"})));
        assert!(matches!(
            translate::<User>(wrong_shape, "User"),
            Err(TranslateError::Decode { .. })
        ));
    }

    #[test]
    fn test_should_process() {
        assert!(should_process(&RawChange::insert(token(), ns(), id(), alice())));
        assert!(should_process(&RawChange::delete(token(), ns(), id())));

        let raced = RawChange::update(token(), ns(), id(), None, UpdateDescription::default());
        assert!(!should_process(&raced));
        assert!(!should_process(&RawChange::replace(token(), ns(), id(), None)));
        assert!(!should_process(&RawChange::invalidate(token(), ns())));
    }
}
