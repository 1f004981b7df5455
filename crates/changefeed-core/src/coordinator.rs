//! Tracking coordinator.
//!
//! [`ChangeTracker`] resolves datastores, opens one collection handle per
//! tracked entity type and runs one [`StreamTask`] per entity on a fixed-size
//! [`WorkerPool`]. Connections are held per datastore in a
//! [`ConnectionRegistry`] and all of them are closed on [`ChangeTracker::stop`].
//!
//! Terminated tasks are never restarted; [`ChangeTracker::is_any_alive`] is
//! the signal an external supervisor watches.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use changefeed_proto::Namespace;

use crate::config::{DatastoreConfig, TrackerConfig};
use crate::error::{StoreError, TrackerError};
use crate::pool::{TaskFuture, WorkerPool};
use crate::store::{
    DocumentStore, ReadOptions, ReadPreference, SessionOptions, StoreConnector, StoreSession,
};
use crate::subscriber::TrackingRegistration;
use crate::task::{StreamTask, TaskState, TaskStats, TaskStatus};

/// Connection state for one datastore.
pub struct ConnectionContext {
    datastore: String,
    database: String,
    client: Arc<dyn DocumentStore>,
    read_preference: ReadPreference,
    session: Option<Arc<dyn StoreSession>>,
}

impl ConnectionContext {
    /// Datastore name.
    pub fn datastore(&self) -> &str {
        &self.datastore
    }

    /// Database change streams are opened against.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Connected client.
    pub fn client(&self) -> &Arc<dyn DocumentStore> {
        &self.client
    }

    /// Read preference applied to collection handles.
    pub fn read_preference(&self) -> &ReadPreference {
        &self.read_preference
    }

    /// Causally consistent session, present only for tagged reads.
    pub fn session(&self) -> Option<&Arc<dyn StoreSession>> {
        self.session.as_ref()
    }

    fn close(&self) {
        if let Some(session) = &self.session {
            session.end();
        }
        self.client.close();
        debug!(datastore = %self.datastore, "closed datastore connection");
    }
}

/// Connections keyed by datastore name.
pub struct ConnectionRegistry {
    connector: Arc<dyn StoreConnector>,
    contexts: DashMap<String, Arc<ConnectionContext>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new(connector: Arc<dyn StoreConnector>) -> Self {
        Self {
            connector,
            contexts: DashMap::new(),
        }
    }

    /// Get the context for `name`, connecting on first use.
    pub fn get_or_connect(
        &self,
        name: &str,
        datastore: &DatastoreConfig,
        read_preference: &ReadPreference,
    ) -> Result<Arc<ConnectionContext>, StoreError> {
        if let Some(context) = self.contexts.get(name) {
            return Ok(context.value().clone());
        }

        let client = self.connector.connect(&datastore.uri)?;
        let session = if read_preference.requires_session() {
            match client.start_session(SessionOptions {
                causal_consistency: true,
            }) {
                Ok(session) => Some(session),
                Err(e) => {
                    client.close();
                    return Err(e);
                }
            }
        } else {
            None
        };

        info!(
            datastore = name,
            database = %datastore.database,
            read_preference = ?read_preference,
            session = session.is_some(),
            "connected to datastore"
        );

        let context = Arc::new(ConnectionContext {
            datastore: name.to_string(),
            database: datastore.database.clone(),
            client,
            read_preference: read_preference.clone(),
            session,
        });
        self.contexts.insert(name.to_string(), context.clone());
        Ok(context)
    }

    /// Get an existing context.
    pub fn get(&self, name: &str) -> Option<Arc<ConnectionContext>> {
        self.contexts.get(name).map(|context| context.value().clone())
    }

    /// Number of connected datastores.
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    /// Whether no datastore is connected.
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Close and forget every context. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let names: Vec<String> = self.contexts.iter().map(|entry| entry.key().clone()).collect();
        let mut closed = 0;
        for name in names {
            if let Some((_, context)) = self.contexts.remove(&name) {
                context.close();
                closed += 1;
            }
        }
        closed
    }
}

/// A submitted stream task as seen by the tracker.
struct TrackedTask {
    entity_type: String,
    namespace: Namespace,
    future: TaskFuture,
    status: Arc<TaskStatus>,
}

impl TrackedTask {
    fn state(&self) -> TaskState {
        let state = self.status.state();
        if !self.future.is_done() || state.is_closed() {
            return state;
        }
        if self.future.is_cancelled() && state == TaskState::Opening {
            // Discarded from the queue before it ever ran
            TaskState::ClosedOk
        } else {
            TaskState::ClosedError
        }
    }
}

#[derive(Default)]
struct TrackerState {
    pool: Option<WorkerPool>,
    tasks: Vec<TrackedTask>,
    running: bool,
}

/// Runs one change stream per tracked entity type.
pub struct ChangeTracker {
    config: TrackerConfig,
    registry: ConnectionRegistry,
    state: Mutex<TrackerState>,
}

impl ChangeTracker {
    /// Create a tracker connecting through `connector`.
    pub fn new(config: TrackerConfig, connector: Arc<dyn StoreConnector>) -> Self {
        Self {
            config,
            registry: ConnectionRegistry::new(connector),
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// The tracker's configuration.
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Per-datastore connections.
    pub fn connections(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Start one stream task per registration.
    ///
    /// Either every task is submitted or, on error, nothing is left running
    /// and all connections opened so far are closed.
    pub fn start<I>(&self, registrations: I) -> Result<(), TrackerError>
    where
        I: IntoIterator,
        I::Item: Into<TrackingRegistration>,
    {
        let mut state = self.state.lock();
        if state.running {
            return Err(TrackerError::AlreadyStarted);
        }
        self.config.validate()?;

        let registrations: Vec<TrackingRegistration> =
            registrations.into_iter().map(Into::into).collect();
        let tasks = match self.build_tasks(registrations) {
            Ok(tasks) => tasks,
            Err(e) => {
                self.registry.close_all();
                return Err(e);
            }
        };

        let pool = match WorkerPool::new(self.config.pool_size) {
            Ok(pool) => pool,
            Err(e) => {
                self.registry.close_all();
                return Err(TrackerError::Pool(e));
            }
        };
        if tasks.len() > pool.size() {
            warn!(
                tasks = tasks.len(),
                pool_size = pool.size(),
                "more tracked entities than workers, excess tasks will wait"
            );
        }

        let mut tracked = Vec::with_capacity(tasks.len());
        for (namespace, task) in tasks {
            let entity_type = task.entity_type().to_string();
            let status = task.status();
            let future = pool.submit(move |interrupt| {
                task.run(&interrupt);
            });
            tracked.push(TrackedTask {
                entity_type,
                namespace,
                future,
                status,
            });
        }

        info!(
            tasks = tracked.len(),
            datastores = self.registry.len(),
            pool_size = pool.size(),
            "change tracker started"
        );
        state.tasks = tracked;
        state.pool = Some(pool);
        state.running = true;
        Ok(())
    }

    fn build_tasks(
        &self,
        registrations: Vec<TrackingRegistration>,
    ) -> Result<Vec<(Namespace, StreamTask)>, TrackerError> {
        let read_preference = self.config.read_preference();
        let mut tasks = Vec::with_capacity(registrations.len());

        for registration in registrations {
            let descriptor = &registration.descriptor;
            descriptor.validate()?;

            let (name, datastore) = self.config.resolve_datastore(descriptor.datastore.as_deref())?;
            if descriptor.datastore.as_deref().is_some_and(|requested| requested != name) {
                debug!(
                    entity_type = %descriptor.entity_type,
                    requested = ?descriptor.datastore,
                    datastore = name,
                    "unmapped datastore, using primary"
                );
            }

            let context = self.registry.get_or_connect(name, datastore, &read_preference)?;
            let database = descriptor.database.as_deref().unwrap_or(context.database());
            let collection = context.client().collection(
                database,
                &descriptor.collection,
                &ReadOptions::majority(context.read_preference().clone()),
            )?;
            let namespace = collection.namespace();

            let task = StreamTask::new(
                descriptor.entity_type.clone(),
                collection,
                registration.subscriber.clone(),
                registration.resume_token.clone(),
                self.config.max_await,
            )
            .with_session(context.session().cloned());
            tasks.push((namespace, task));
        }

        Ok(tasks)
    }

    /// Interrupt every task, discard queued ones and close all connections.
    ///
    /// Does not wait for tasks to close their cursors. Safe to call more than
    /// once and before [`start`](Self::start).
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if !state.running {
            return;
        }

        for task in &state.tasks {
            task.future.cancel(true);
        }
        let discarded = state
            .pool
            .take()
            .map(|pool| pool.shutdown_now())
            .unwrap_or_default();
        let closed = self.registry.close_all();
        state.running = false;

        info!(
            tasks = state.tasks.len(),
            discarded,
            datastores = closed,
            "change tracker stopped"
        );
    }

    /// Whether any submitted task has not completed.
    pub fn is_any_alive(&self) -> bool {
        self.state.lock().tasks.iter().any(|task| !task.future.is_done())
    }

    /// Number of submitted tasks.
    pub fn task_count(&self) -> usize {
        self.state.lock().tasks.len()
    }

    /// Entity type and state of each task, in submission order.
    pub fn task_states(&self) -> Vec<(String, TaskState)> {
        self.state
            .lock()
            .tasks
            .iter()
            .map(|task| (task.entity_type.clone(), task.state()))
            .collect()
    }

    /// Entity type, namespace and counters of each task.
    pub fn task_stats(&self) -> Vec<(String, Namespace, TaskStats)> {
        self.state
            .lock()
            .tasks
            .iter()
            .map(|task| {
                (
                    task.entity_type.clone(),
                    task.namespace.clone(),
                    task.status.stats(),
                )
            })
            .collect()
    }
}

impl Drop for ChangeTracker {
    fn drop(&mut self) {
        self.stop();
    }
}
