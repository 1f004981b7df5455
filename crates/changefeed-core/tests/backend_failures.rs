//! Tracker behavior when the store backend itself misbehaves.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;

use changefeed_core::proto::{ChangeEvent, EntityDescriptor, Namespace, RawChange, ResumeToken};
use changefeed_core::store::{SessionOptions, StoreSession};
use changefeed_core::{
    ChangeCursor, ChangeTracker, ChangeTrackingInfo, DatastoreConfig, DocumentStore, ReadOptions,
    StoreConnector, StoreError, SubscriberError, TaskState, TrackerConfig, WatchOptions,
    WatchedCollection,
};

fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Backend whose cursors panic on their first read.
#[derive(Default)]
struct BrokenDriver {
    cursors_closed: Arc<AtomicUsize>,
    clients_closed: Arc<AtomicBool>,
}

struct BrokenClient {
    cursors_closed: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

struct BrokenCollection {
    namespace: Namespace,
    cursors_closed: Arc<AtomicUsize>,
}

struct BrokenCursor {
    cursors_closed: Arc<AtomicUsize>,
}

impl StoreConnector for BrokenDriver {
    fn connect(&self, _uri: &str) -> Result<Arc<dyn DocumentStore>, StoreError> {
        Ok(Arc::new(BrokenClient {
            cursors_closed: self.cursors_closed.clone(),
            closed: self.clients_closed.clone(),
        }))
    }
}

impl DocumentStore for BrokenClient {
    fn collection(
        &self,
        database: &str,
        collection: &str,
        _options: &ReadOptions,
    ) -> Result<Arc<dyn WatchedCollection>, StoreError> {
        Ok(Arc::new(BrokenCollection {
            namespace: Namespace::new(database, collection),
            cursors_closed: self.cursors_closed.clone(),
        }))
    }

    fn start_session(&self, _options: SessionOptions) -> Result<Arc<dyn StoreSession>, StoreError> {
        Err(StoreError::Backend("sessions not supported".into()))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl WatchedCollection for BrokenCollection {
    fn namespace(&self) -> Namespace {
        self.namespace.clone()
    }

    fn watch(&self, _options: &WatchOptions) -> Result<Box<dyn ChangeCursor>, StoreError> {
        Ok(Box::new(BrokenCursor {
            cursors_closed: self.cursors_closed.clone(),
        }))
    }
}

impl ChangeCursor for BrokenCursor {
    fn next_change(&mut self) -> Result<Option<RawChange>, StoreError> {
        panic!("driver bug")
    }

    fn is_alive(&self) -> bool {
        true
    }

    fn resume_token(&self) -> Option<ResumeToken> {
        None
    }

    fn close(&mut self) {
        self.cursors_closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_backend_panic_reports_failed_task() {
    let driver = Arc::new(BrokenDriver::default());
    let config = TrackerConfig::new(DatastoreConfig::new("broken://cluster", "app"))
        .with_pool_size(2)
        .with_max_await(Duration::from_millis(20));
    let tracker = ChangeTracker::new(config, driver.clone());

    let users = ChangeTrackingInfo::new(
        EntityDescriptor::new("User", "users"),
        |_: ChangeEvent<Value>| -> Result<(), SubscriberError> { Ok(()) },
    );
    tracker.start(vec![users]).unwrap();

    assert!(wait_until(|| !tracker.is_any_alive()));
    assert_eq!(
        tracker.task_states(),
        vec![("User".to_string(), TaskState::ClosedError)]
    );
    assert_eq!(driver.cursors_closed.load(Ordering::SeqCst), 1);

    tracker.stop();
    assert!(driver.clients_closed.load(Ordering::SeqCst));
    assert_eq!(
        tracker.task_states(),
        vec![("User".to_string(), TaskState::ClosedError)]
    );
}
