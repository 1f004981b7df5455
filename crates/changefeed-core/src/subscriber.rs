//! Subscriber contracts and typed dispatch.
//!
//! A stream task only ever talks to a [`RawChangeSubscriber`]. Typed
//! consumers implement [`ChangeSubscriber<T>`] and are wrapped in a
//! [`TypedDispatcher`], which filters, translates and then invokes them, so
//! the task itself stays agnostic of entity types.

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use changefeed_proto::{ChangeEvent, EntityDescriptor, OperationType, RawChange, ResumeToken};

use crate::error::{DispatchError, SubscriberError};
use crate::translate::{should_process, translate};

/// Outcome of handing a raw notification to a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The notification was delivered.
    Delivered,
    /// The notification was dropped by the filter policy.
    Filtered,
}

/// Low-level callback receiving raw notifications.
pub trait RawChangeSubscriber: Send + Sync {
    /// Handle one notification. Called synchronously on the stream task's
    /// thread; the next notification is not read until this returns.
    fn on_raw_change(&self, change: RawChange) -> Result<Dispatch, DispatchError>;
}

impl<F> RawChangeSubscriber for F
where
    F: Fn(RawChange) -> Result<Dispatch, DispatchError> + Send + Sync,
{
    fn on_raw_change(&self, change: RawChange) -> Result<Dispatch, DispatchError> {
        self(change)
    }
}

/// Typed callback receiving change events for one entity type.
pub trait ChangeSubscriber<T>: Send + Sync {
    /// Handle one event.
    fn on_change(&self, event: ChangeEvent<T>) -> Result<(), SubscriberError>;
}

impl<T, F> ChangeSubscriber<T> for F
where
    F: Fn(ChangeEvent<T>) -> Result<(), SubscriberError> + Send + Sync,
{
    fn on_change(&self, event: ChangeEvent<T>) -> Result<(), SubscriberError> {
        self(event)
    }
}

/// Adapts a typed subscriber to the raw callback contract.
pub struct TypedDispatcher<T> {
    entity_type: String,
    subscriber: Arc<dyn ChangeSubscriber<T>>,
}

impl<T> TypedDispatcher<T> {
    /// Wrap a typed subscriber for the given entity type.
    pub fn new(entity_type: impl Into<String>, subscriber: Arc<dyn ChangeSubscriber<T>>) -> Self {
        Self {
            entity_type: entity_type.into(),
            subscriber,
        }
    }
}

impl<T> RawChangeSubscriber for TypedDispatcher<T>
where
    T: DeserializeOwned + 'static,
{
    fn on_raw_change(&self, change: RawChange) -> Result<Dispatch, DispatchError> {
        // Invalidations carry no document but must still reach the translator
        if change.operation != OperationType::Invalidate && !should_process(&change) {
            tracing::trace!(
                entity_type = %self.entity_type,
                operation = %change.operation,
                token = %change.token,
                "dropping notification without full document"
            );
            return Ok(Dispatch::Filtered);
        }

        let event = translate::<T>(change, &self.entity_type)?;
        tracing::debug!(
            entity_type = %self.entity_type,
            uuid = %event.uuid,
            change_type = %event.change_type,
            "dispatching change event"
        );
        self.subscriber
            .on_change(event)
            .map_err(DispatchError::Subscriber)?;
        Ok(Dispatch::Delivered)
    }
}

/// Binds a tracked entity type to its subscriber and resume position.
pub struct ChangeTrackingInfo<T> {
    descriptor: EntityDescriptor,
    subscriber: Arc<dyn ChangeSubscriber<T>>,
    resume_token: Option<ResumeToken>,
}

impl<T> ChangeTrackingInfo<T> {
    /// Track `descriptor`, delivering events to `subscriber`.
    pub fn new<S>(descriptor: EntityDescriptor, subscriber: S) -> Self
    where
        S: ChangeSubscriber<T> + 'static,
    {
        Self {
            descriptor,
            subscriber: Arc::new(subscriber),
            resume_token: None,
        }
    }

    /// Resume after the given token instead of starting from now.
    pub fn with_resume_token(mut self, token: Option<ResumeToken>) -> Self {
        self.resume_token = token;
        self
    }

    /// The tracked entity's descriptor.
    pub fn descriptor(&self) -> &EntityDescriptor {
        &self.descriptor
    }

    /// The last known resume token.
    pub fn resume_token(&self) -> Option<&ResumeToken> {
        self.resume_token.as_ref()
    }
}

impl<T> ChangeTrackingInfo<T>
where
    T: DeserializeOwned + 'static,
{
    /// Erase the entity type so infos for different types can be started together.
    pub fn register(self) -> TrackingRegistration {
        let dispatcher = TypedDispatcher::new(self.descriptor.entity_type.clone(), self.subscriber);
        TrackingRegistration {
            descriptor: self.descriptor,
            subscriber: Arc::new(dispatcher),
            resume_token: self.resume_token,
        }
    }
}

impl<T> From<ChangeTrackingInfo<T>> for TrackingRegistration
where
    T: DeserializeOwned + 'static,
{
    fn from(info: ChangeTrackingInfo<T>) -> Self {
        info.register()
    }
}

/// A tracking info with its entity type erased.
#[derive(Clone)]
pub struct TrackingRegistration {
    /// The tracked entity's descriptor.
    pub descriptor: EntityDescriptor,
    /// Callback receiving raw notifications.
    pub subscriber: Arc<dyn RawChangeSubscriber>,
    /// The last known resume token.
    pub resume_token: Option<ResumeToken>,
}

impl TrackingRegistration {
    /// Register a low-level subscriber directly.
    pub fn raw<S>(
        descriptor: EntityDescriptor,
        subscriber: S,
        resume_token: Option<ResumeToken>,
    ) -> Self
    where
        S: RawChangeSubscriber + 'static,
    {
        Self {
            descriptor,
            subscriber: Arc::new(subscriber),
            resume_token,
        }
    }
}

impl fmt::Debug for TrackingRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackingRegistration")
            .field("descriptor", &self.descriptor)
            .field("resume_token", &self.resume_token)
            .finish()
    }
}
