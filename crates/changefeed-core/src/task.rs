//! Change stream task.
//!
//! A [`StreamTask`] owns one cursor over one collection and runs a blocking
//! read loop on its worker thread:
//!
//! ```text
//! Opening --(cursor open, stale token falls back to "now")--> Running
//! Opening --(interrupted)-----------------------------------> ClosedOk
//! Opening --(open failure / backend panic)------------------> ClosedError
//! Running --(interrupt / stream exhausted)------------------> ClosedOk
//! Running --(store error / dispatch error / panic)----------> ClosedError
//! ```
//!
//! Notifications are handed to the subscriber synchronously; the next one is
//! not read until the subscriber returns, so a slow subscriber only slows its
//! own stream.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use changefeed_proto::{Namespace, ResumeToken};

use crate::error::{DispatchError, StoreError};
use crate::pool::{panic_message, Interrupt};
use crate::store::{ChangeCursor, StoreSession, WatchOptions, WatchedCollection};
use crate::subscriber::{Dispatch, RawChangeSubscriber};

/// Lifecycle state of a stream task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Opening the cursor.
    Opening = 0,
    /// Reading notifications.
    Running = 1,
    /// Stopped on request or because the stream ended.
    ClosedOk = 2,
    /// Stopped by an error.
    ClosedError = 3,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskState::Opening,
            1 => TaskState::Running,
            2 => TaskState::ClosedOk,
            _ => TaskState::ClosedError,
        }
    }

    /// Whether the task has terminated.
    pub fn is_closed(&self) -> bool {
        matches!(self, TaskState::ClosedOk | TaskState::ClosedError)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Opening => "opening",
            TaskState::Running => "running",
            TaskState::ClosedOk => "closed",
            TaskState::ClosedError => "failed",
        };
        f.write_str(name)
    }
}

/// Snapshot of a task's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskStats {
    /// Notifications delivered to the subscriber.
    pub delivered: u64,
    /// Notifications dropped by the filter policy.
    pub filtered: u64,
    /// Times the cursor was reopened without a token.
    pub resume_fallbacks: u64,
}

/// Shared, observable status of one task.
#[derive(Debug)]
pub struct TaskStatus {
    state: AtomicU8,
    delivered: AtomicU64,
    filtered: AtomicU64,
    resume_fallbacks: AtomicU64,
}

impl TaskStatus {
    /// A fresh status in the `Opening` state.
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(TaskState::Opening as u8),
            delivered: AtomicU64::new(0),
            filtered: AtomicU64::new(0),
            resume_fallbacks: AtomicU64::new(0),
        }
    }

    /// Current state.
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Current counters.
    pub fn stats(&self) -> TaskStats {
        TaskStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            resume_fallbacks: self.resume_fallbacks.load(Ordering::Relaxed),
        }
    }

    fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Why the read loop stopped.
#[derive(Debug)]
enum Exit {
    Interrupted,
    Exhausted,
    Open(StoreError),
    Store(StoreError),
    Dispatch(DispatchError),
    Panicked(String),
}

/// Closes the cursor however the read loop exits.
struct CursorGuard(Box<dyn ChangeCursor>);

impl Drop for CursorGuard {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// One change stream over one collection.
pub struct StreamTask {
    entity_type: String,
    collection: Arc<dyn WatchedCollection>,
    subscriber: Arc<dyn RawChangeSubscriber>,
    resume_token: Option<ResumeToken>,
    session: Option<Arc<dyn StoreSession>>,
    max_await: Duration,
    status: Arc<TaskStatus>,
}

impl StreamTask {
    /// Create a task; it does nothing until [`run`](Self::run).
    pub fn new(
        entity_type: impl Into<String>,
        collection: Arc<dyn WatchedCollection>,
        subscriber: Arc<dyn RawChangeSubscriber>,
        resume_token: Option<ResumeToken>,
        max_await: Duration,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            collection,
            subscriber,
            resume_token,
            session: None,
            max_await,
            status: Arc::new(TaskStatus::new()),
        }
    }

    /// Read under a session.
    pub fn with_session(mut self, session: Option<Arc<dyn StoreSession>>) -> Self {
        self.session = session;
        self
    }

    /// Entity type this task tracks.
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// Handle for observing this task's state.
    pub fn status(&self) -> Arc<TaskStatus> {
        self.status.clone()
    }

    /// Run until interrupted, the stream ends, or an error occurs.
    ///
    /// Never panics on subscriber or store failures; the outcome is the
    /// returned (and published) terminal state.
    pub fn run(self, interrupt: &Interrupt) -> TaskState {
        let namespace = self.collection.namespace();
        info!(
            entity_type = %self.entity_type,
            namespace = %namespace,
            resume = self.resume_token.is_some(),
            "change stream task starting"
        );

        let (exit, last_token) =
            catch_unwind(AssertUnwindSafe(|| self.open_and_read(&namespace, interrupt)))
                .unwrap_or_else(|panic| (Exit::Panicked(panic_message(&*panic)), None));
        let final_state = self.classify(exit, &namespace, last_token);

        self.status.set_state(final_state);
        final_state
    }

    fn open_and_read(
        &self,
        namespace: &Namespace,
        interrupt: &Interrupt,
    ) -> (Exit, Option<ResumeToken>) {
        let cursor = match self.open_cursor(namespace, interrupt) {
            Ok(cursor) => cursor,
            Err(e) => return (Exit::Open(e), None),
        };

        // Dropped on unwind too, so a panicking backend still gets its cursor closed
        let mut guard = CursorGuard(cursor);
        self.status.set_state(TaskState::Running);
        let exit = self.read_loop(guard.0.as_mut(), interrupt);
        (exit, guard.0.resume_token())
    }

    /// Open the cursor, falling back to "now" when the resume token is unusable.
    ///
    /// No fallback is attempted once interruption was requested.
    fn open_cursor(
        &self,
        namespace: &Namespace,
        interrupt: &Interrupt,
    ) -> Result<Box<dyn ChangeCursor>, StoreError> {
        let options = WatchOptions::new(self.max_await).with_session(self.session.clone());

        if let Some(token) = &self.resume_token {
            match self
                .collection
                .watch(&options.clone().with_resume_after(Some(token.clone())))
            {
                Ok(cursor) => return Ok(cursor),
                Err(StoreError::Interrupted) => return Err(StoreError::Interrupted),
                Err(_) if interrupt.is_set() => return Err(StoreError::Interrupted),
                Err(e) => {
                    // Changes between the stale token and now are lost.
                    error!(
                        entity_type = %self.entity_type,
                        namespace = %namespace,
                        token = %token,
                        error = %e,
                        "failed to resume change stream, restarting from current position"
                    );
                    self.status.resume_fallbacks.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        self.collection.watch(&options)
    }

    fn read_loop(&self, cursor: &mut dyn ChangeCursor, interrupt: &Interrupt) -> Exit {
        loop {
            if interrupt.is_set() {
                return Exit::Interrupted;
            }
            if !cursor.is_alive() {
                return Exit::Exhausted;
            }

            let change = match cursor.next_change() {
                Ok(Some(change)) => change,
                Ok(None) => continue,
                Err(e) => return Exit::Store(e),
            };

            let subscriber = &self.subscriber;
            let outcome = catch_unwind(AssertUnwindSafe(|| subscriber.on_raw_change(change)))
                .unwrap_or_else(|panic| Err(DispatchError::Panicked(panic_message(&*panic))));

            match outcome {
                Ok(Dispatch::Delivered) => {
                    self.status.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Dispatch::Filtered) => {
                    self.status.filtered.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => return Exit::Dispatch(e),
            }
        }
    }

    fn classify(
        &self,
        exit: Exit,
        namespace: &Namespace,
        last_token: Option<ResumeToken>,
    ) -> TaskState {
        let last_token = last_token.map(|t| t.into_inner()).unwrap_or_default();
        match exit {
            Exit::Interrupted
            | Exit::Open(StoreError::Interrupted)
            | Exit::Store(StoreError::Interrupted) => {
                warn!(
                    entity_type = %self.entity_type,
                    namespace = %namespace,
                    last_token = %last_token,
                    "change stream task interrupted"
                );
                TaskState::ClosedOk
            }
            Exit::Exhausted => {
                debug!(
                    entity_type = %self.entity_type,
                    namespace = %namespace,
                    last_token = %last_token,
                    "change stream ended"
                );
                TaskState::ClosedOk
            }
            Exit::Open(e) => {
                error!(
                    entity_type = %self.entity_type,
                    namespace = %namespace,
                    error = %e,
                    "failed to open change stream"
                );
                TaskState::ClosedError
            }
            Exit::Store(e) => {
                error!(
                    entity_type = %self.entity_type,
                    namespace = %namespace,
                    last_token = %last_token,
                    error = %e,
                    "change stream read failed"
                );
                TaskState::ClosedError
            }
            Exit::Dispatch(e) => {
                error!(
                    entity_type = %self.entity_type,
                    namespace = %namespace,
                    last_token = %last_token,
                    error = %e,
                    "change stream task failed"
                );
                TaskState::ClosedError
            }
            Exit::Panicked(message) => {
                error!(
                    entity_type = %self.entity_type,
                    namespace = %namespace,
                    last_token = %last_token,
                    panic = %message,
                    "change stream backend panicked"
                );
                TaskState::ClosedError
            }
        }
    }
}
