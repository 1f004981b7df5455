//! changefeed protocol types.
//!
//! This crate defines the data model shared by the change tracking engine and
//! its consumers: the typed [`ChangeEvent`] delivered to subscribers and the
//! store-agnostic [`RawChange`] notification read from a change stream.
//!
//! # Modules
//!
//! - [`event`] - Typed change events, change types and resume tokens
//! - [`raw`] - Raw change notifications as produced by a store backend
//! - [`error`] - Protocol error types
//!
//! All types are plain data. Documents are JSON object maps so that any
//! backend can hand them over without exposing its native encoding.

pub mod error;
pub mod event;
pub mod raw;

pub use error::Error;

pub use event::{ChangeEvent, ChangeType, EntityDescriptor, ResumeToken};
pub use raw::{Document, DocumentId, Namespace, OperationType, RawChange, UpdateDescription};
