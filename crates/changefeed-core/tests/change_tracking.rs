//! End-to-end change tracking tests against the in-memory store.

use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};

use changefeed_core::proto::{ChangeEvent, ChangeType, EntityDescriptor, RawChange, ResumeToken};
use changefeed_core::store::memory::MemoryDeployment;
use changefeed_core::{
    ChangeTracker, ChangeTrackingInfo, DatastoreConfig, Dispatch, DispatchError, MemoryCollection,
    MemoryConnector, SubscriberError, TaskState, TrackerConfig, TrackingRegistration,
};

const URI: &str = "memory://cluster";
const DATABASE: &str = "shop";

static TRACING: Once = Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

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

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct Product {
    #[serde(rename = "_id")]
    id: String,
    name: String,
    #[serde(default)]
    price: Option<u64>,
}

type Received<T> = Arc<Mutex<Vec<ChangeEvent<T>>>>;

/// A tracker over one in-memory deployment.
struct TestContext {
    connector: Arc<MemoryConnector>,
    deployment: Arc<MemoryDeployment>,
    tracker: ChangeTracker,
}

impl TestContext {
    fn new() -> Self {
        Self::with_pool_size(4)
    }

    fn with_pool_size(pool_size: usize) -> Self {
        init_tracing();
        let connector = Arc::new(MemoryConnector::new());
        let deployment = connector.deployment(URI);
        let config = TrackerConfig::new(DatastoreConfig::new(URI, DATABASE))
            .with_pool_size(pool_size)
            .with_max_await(Duration::from_millis(20));
        let tracker = ChangeTracker::new(config, connector.clone());
        Self {
            connector,
            deployment,
            tracker,
        }
    }

    fn collection(&self, name: &str) -> MemoryCollection {
        self.deployment.collection(DATABASE, name)
    }

    fn wait_running(&self) {
        assert!(wait_until(|| self
            .tracker
            .task_states()
            .iter()
            .all(|(_, state)| *state == TaskState::Running)));
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        self.tracker.stop();
    }
}

fn recording<T>(entity_type: &str, collection: &str) -> (Received<T>, ChangeTrackingInfo<T>)
where
    T: Send + 'static,
{
    let received: Received<T> = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let info = ChangeTrackingInfo::new(
        EntityDescriptor::new(entity_type, collection),
        move |event: ChangeEvent<T>| -> Result<(), SubscriberError> {
            sink.lock().push(event);
            Ok(())
        },
    );
    (received, info)
}

#[test]
fn test_insert_update_delete_sequence() {
    let ctx = TestContext::new();
    let (received, info) = recording::<Value>("Product", "products");
    ctx.tracker.start(vec![info]).unwrap();
    ctx.wait_running();

    let products = ctx.collection("products");
    let id = products.insert(json!({"_id": "A", "name": "lamp"})).unwrap();
    assert!(wait_until(|| received.lock().len() == 1));
    products.update(&id, json!({"x": 1})).unwrap();
    assert!(wait_until(|| received.lock().len() == 2));
    products.delete(&id).unwrap();
    assert!(wait_until(|| received.lock().len() == 3));

    let events = received.lock();
    let types: Vec<_> = events.iter().map(|e| e.change_type).collect();
    assert_eq!(types, vec![ChangeType::Insert, ChangeType::Update, ChangeType::Delete]);
    assert!(events.iter().all(|e| e.uuid == "A"));
    assert!(events.iter().all(|e| e.entity_type == "Product"));

    assert!(events[0].changes.is_none());
    assert_eq!(events[1].changes, Some(changefeed_core::proto::raw::document(json!({"x": 1}))));
    assert!(events[2].changes.is_none());

    assert!(events[0].full_document.is_some());
    assert_eq!(events[1].full_document.as_ref().unwrap()["x"], json!(1));
    assert!(events[2].full_document.is_none());
}

#[test]
fn test_typed_documents_and_replace() {
    let ctx = TestContext::new();
    let (received, info) = recording::<Product>("Product", "products");
    ctx.tracker.start(vec![info]).unwrap();
    ctx.wait_running();

    let products = ctx.collection("products");
    let id = products.insert(json!({"_id": "B", "name": "desk"})).unwrap();
    assert!(wait_until(|| received.lock().len() == 1));
    products.replace(&id, json!({"name": "standing desk", "price": 450})).unwrap();
    assert!(wait_until(|| received.lock().len() == 2));

    let events = received.lock();
    assert_eq!(events[1].change_type, ChangeType::Update);
    assert!(events[1].changes.is_none());
    assert_eq!(
        events[1].full_document,
        Some(Product {
            id: "B".into(),
            name: "standing desk".into(),
            price: Some(450),
        })
    );
}

#[test]
fn test_update_racing_delete_is_dropped() {
    let ctx = TestContext::new();
    let products = ctx.collection("products");
    let id = products.insert(json!({"_id": "C", "name": "chair"})).unwrap();
    let resume_from = products.current_token();
    products.update(&id, json!({"name": "armchair"})).unwrap();
    products.delete(&id).unwrap();

    let (received, info) = recording::<Value>("Product", "products");
    ctx.tracker.start(vec![info.with_resume_token(resume_from)]).unwrap();

    assert!(wait_until(|| received.lock().len() == 1));
    std::thread::sleep(Duration::from_millis(50));
    let events = received.lock();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].change_type, ChangeType::Delete);

    let stats = ctx.tracker.task_stats();
    assert_eq!(stats[0].2.delivered, 1);
    assert_eq!(stats[0].2.filtered, 1);
}

#[test]
fn test_expired_token_restarts_from_now() {
    let ctx = TestContext::new();
    let products = ctx.collection("products");
    let id = products.insert(json!({"_id": "D", "name": "shelf"})).unwrap();
    let stale = products.current_token().unwrap();
    products.update(&id, json!({"name": "bookshelf"})).unwrap();
    products.truncate_all();

    let (received, info) = recording::<Value>("Product", "products");
    ctx.tracker.start(vec![info.with_resume_token(Some(stale))]).unwrap();
    ctx.wait_running();

    products.insert(json!({"_id": "E", "name": "rug"})).unwrap();
    assert!(wait_until(|| received.lock().len() == 1));
    assert_eq!(received.lock()[0].uuid, "E");
    assert!(ctx.tracker.is_any_alive());
    assert_eq!(ctx.tracker.task_stats()[0].2.resume_fallbacks, 1);
}

#[test]
fn test_garbage_token_still_reaches_running() {
    let ctx = TestContext::new();
    let (received, info) = recording::<Value>("Product", "products");
    let info = info.with_resume_token(Some(ResumeToken::new("{\"_data\": \"8263\"}")));
    ctx.tracker.start(vec![info]).unwrap();
    ctx.wait_running();

    ctx.collection("products")
        .insert(json!({"_id": "F", "name": "vase"}))
        .unwrap();
    assert!(wait_until(|| received.lock().len() == 1));
}

#[test]
fn test_resume_continues_after_token() {
    let ctx = TestContext::new();
    let products = ctx.collection("products");
    products.insert(json!({"_id": "G1", "name": "one"})).unwrap();
    let token = products.current_token();
    products.insert(json!({"_id": "G2", "name": "two"})).unwrap();
    products.insert(json!({"_id": "G3", "name": "three"})).unwrap();

    let (received, info) = recording::<Value>("Product", "products");
    ctx.tracker.start(vec![info.with_resume_token(token)]).unwrap();

    assert!(wait_until(|| received.lock().len() == 2));
    let uuids: Vec<_> = received.lock().iter().map(|e| e.uuid.clone()).collect();
    assert_eq!(uuids, vec!["G2", "G3"]);
}

#[test]
fn test_dropped_collection_fails_only_its_task() {
    let ctx = TestContext::new();
    let (products_received, products) = recording::<Value>("Product", "products");
    let (orders_received, orders) = recording::<Value>("Order", "orders");
    ctx.tracker.start(vec![products, orders]).unwrap();
    ctx.wait_running();

    ctx.collection("products").drop_collection();
    assert!(wait_until(|| ctx.tracker.task_states()[0].1 == TaskState::ClosedError));
    assert_eq!(ctx.tracker.task_states()[1].1, TaskState::Running);
    assert!(ctx.tracker.is_any_alive());
    assert!(products_received.lock().is_empty());

    ctx.collection("orders")
        .insert(json!({"_id": "O1", "total": 10}))
        .unwrap();
    assert!(wait_until(|| orders_received.lock().len() == 1));
}

#[test]
fn test_failing_subscriber_is_isolated() {
    let ctx = TestContext::new();
    let failing = ChangeTrackingInfo::new(
        EntityDescriptor::new("Product", "products"),
        |_: ChangeEvent<Value>| -> Result<(), SubscriberError> {
            Err("search index unavailable".into())
        },
    );
    let (orders_received, orders) = recording::<Value>("Order", "orders");
    ctx.tracker
        .start(vec![failing.register(), orders.register()])
        .unwrap();
    ctx.wait_running();

    ctx.collection("products")
        .insert(json!({"_id": "P", "name": "mirror"}))
        .unwrap();
    assert!(wait_until(|| ctx.tracker.task_states()[0].1 == TaskState::ClosedError));
    assert_eq!(ctx.collection("products").open_cursors(), 0);

    ctx.collection("orders")
        .insert(json!({"_id": "O2", "total": 20}))
        .unwrap();
    assert!(wait_until(|| orders_received.lock().len() == 1));
    assert_eq!(ctx.tracker.task_states()[1].1, TaskState::Running);
}

#[test]
fn test_raw_subscriber_sees_every_notification() {
    let ctx = TestContext::new();
    let seen: Arc<Mutex<Vec<RawChange>>> = Arc::default();
    let sink = seen.clone();
    let raw = TrackingRegistration::raw(
        EntityDescriptor::new("Audit", "audit"),
        move |change: RawChange| -> Result<Dispatch, DispatchError> {
            sink.lock().push(change);
            Ok(Dispatch::Delivered)
        },
        None,
    );
    ctx.tracker.start(vec![raw]).unwrap();
    ctx.wait_running();

    ctx.collection("audit").drop_collection();
    assert!(wait_until(|| seen.lock().len() == 2));
    // The cursor dies after the invalidation, ending the task cleanly
    assert!(wait_until(|| ctx.tracker.task_states()[0].1 == TaskState::ClosedOk));
}

#[test]
fn test_excess_tasks_wait_for_a_worker() {
    let ctx = TestContext::with_pool_size(1);
    let (_, first) = recording::<Value>("Product", "products");
    let (second_received, second) = recording::<Value>("Order", "orders");
    ctx.tracker.start(vec![first, second]).unwrap();

    assert!(wait_until(|| ctx.tracker.task_states()[0].1 == TaskState::Running));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(ctx.tracker.task_states()[1].1, TaskState::Opening);

    ctx.collection("orders")
        .insert(json!({"_id": "O3", "total": 5}))
        .unwrap();
    std::thread::sleep(Duration::from_millis(50));
    assert!(second_received.lock().is_empty());

    ctx.tracker.stop();
    assert!(wait_until(|| !ctx.tracker.is_any_alive()));
    assert_eq!(ctx.tracker.task_states()[1].1, TaskState::ClosedOk);
}

#[test]
fn test_stop_releases_everything() {
    let ctx = TestContext::new();
    let (_, products) = recording::<Value>("Product", "products");
    let (_, orders) = recording::<Value>("Order", "orders");
    ctx.tracker.start(vec![products, orders]).unwrap();
    ctx.wait_running();
    assert_eq!(ctx.collection("products").open_cursors(), 1);

    ctx.tracker.stop();
    ctx.tracker.stop();

    assert!(wait_until(|| !ctx.tracker.is_any_alive()));
    assert!(wait_until(|| ctx.collection("products").open_cursors() == 0
        && ctx.collection("orders").open_cursors() == 0));
    assert_eq!(ctx.deployment.open_clients(), 0);
    assert_eq!(ctx.connector.deployment(URI).open_clients(), 0);
    assert!(ctx
        .tracker
        .task_states()
        .iter()
        .all(|(_, state)| *state == TaskState::ClosedOk));
}

#[test]
fn test_config_from_toml() {
    let config = TrackerConfig::from_toml_str(
        r#"
        primary_datastore = "main"
        pool_size = 2
        max_await_ms = 25

        [datastores.main]
        uri = "memory://cluster"
        database = "shop"
        "#,
    )
    .unwrap();

    let connector = Arc::new(MemoryConnector::new());
    let tracker = ChangeTracker::new(config, connector.clone());
    let (received, info) = recording::<Value>("Product", "products");
    tracker.start(vec![info]).unwrap();
    assert!(wait_until(|| tracker.task_states()[0].1 == TaskState::Running));

    connector
        .deployment(URI)
        .collection(DATABASE, "products")
        .insert(json!({"_id": "H", "name": "clock"}))
        .unwrap();
    assert!(wait_until(|| received.lock().len() == 1));
    tracker.stop();
}
