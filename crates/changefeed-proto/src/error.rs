//! Protocol error types.

use thiserror::Error;

/// Protocol-level errors.
#[derive(Debug, Error)]
pub enum Error {
    /// An object id was not 24 hex characters.
    #[error("invalid object id: {0}")]
    InvalidObjectId(String),

    /// An entity descriptor is missing a required part.
    #[error("invalid entity descriptor: {0}")]
    InvalidDescriptor(String),

    /// A document value was not a JSON object.
    #[error("invalid document: {0}")]
    InvalidDocument(String),
}
