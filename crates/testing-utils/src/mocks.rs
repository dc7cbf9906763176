//! In-memory implementations of the collaborator ports
//!
//! Every mock records what it was asked to do and supports injected
//! failures, so tests can drive retry and isolation paths without any
//! external service.

use parking_lot::Mutex;
use portal_domain::{
    DatastoreConnector, DatastoreSession, DocumentDelivery, DocumentSender, MessageSender,
    Notification, NotificationSender, OutboundMessage, RecordUpdater, ResourceUpload,
    ResourceUploader, StorageClient, StorageConnector, StoredObject,
};
use portal_errors::{ErrorKind, WorkerError, WorkerResult};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Records every message, notification, document and upload it receives
#[derive(Default)]
pub struct RecordingMessaging {
    messages: Mutex<Vec<OutboundMessage>>,
    notifications: Mutex<Vec<Notification>>,
    documents: Mutex<Vec<DocumentDelivery>>,
    uploads: Mutex<Vec<ResourceUpload>>,
    failing: Mutex<HashSet<String>>,
    calls: AtomicUsize,
}

impl RecordingMessaging {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls addressed to `recipient` (phone number, email, recipient or
    /// record id) fail with a connection error and are not recorded.
    pub fn fail_recipient(&self, recipient: &str) {
        self.failing.lock().insert(recipient.to_string());
    }

    pub fn recover_recipient(&self, recipient: &str) {
        self.failing.lock().remove(recipient);
    }

    pub fn messages(&self) -> Vec<OutboundMessage> {
        self.messages.lock().clone()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().clone()
    }

    pub fn documents(&self) -> Vec<DocumentDelivery> {
        self.documents.lock().clone()
    }

    pub fn uploads(&self) -> Vec<ResourceUpload> {
        self.uploads.lock().clone()
    }

    /// Number of calls, including failed ones
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self, recipient: &str) -> WorkerResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().contains(recipient) {
            return Err(WorkerError::external(
                ErrorKind::Connection,
                format!("provider rejected {recipient}"),
            ));
        }
        Ok(())
    }
}

impl MessageSender for RecordingMessaging {
    fn send_message(&self, message: &OutboundMessage) -> WorkerResult<Value> {
        self.check(&message.phone_number)?;
        let mut messages = self.messages.lock();
        messages.push(message.clone());
        Ok(json!({ "sid": format!("SM{:04}", messages.len()), "status": "queued" }))
    }
}

impl NotificationSender for RecordingMessaging {
    fn send_notification(&self, notification: &Notification) -> WorkerResult<Value> {
        self.check(&notification.to_email)?;
        self.notifications.lock().push(notification.clone());
        Ok(json!({ "accepted": [notification.to_email] }))
    }
}

impl DocumentSender for RecordingMessaging {
    fn send_document(&self, delivery: &DocumentDelivery) -> WorkerResult<Value> {
        self.check(&delivery.recipient)?;
        self.documents.lock().push(delivery.clone());
        Ok(json!({ "delivered": true, "email": delivery.send_email }))
    }
}

impl ResourceUploader for RecordingMessaging {
    fn upload_resource(&self, upload: &ResourceUpload) -> WorkerResult<Value> {
        self.check(&upload.record_id)?;
        self.uploads.lock().push(upload.clone());
        Ok(json!({ "record_id": upload.record_id, "uploaded": true }))
    }
}

/// A file held by [`InMemoryStorage`]
#[derive(Debug, Clone, PartialEq)]
pub struct StoredFile {
    pub id: String,
    pub container_id: String,
    pub name: String,
    pub content: Vec<u8>,
    pub mime_type: String,
}

#[derive(Default)]
struct StorageState {
    containers: HashMap<(String, String), String>,
    files: HashMap<String, StoredFile>,
    next_id: u64,
    containers_created: usize,
    lookups: usize,
}

impl StorageState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }
}

/// Object storage kept in memory; every connection shares the same state
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    state: Arc<Mutex<StorageState>>,
    failing_files: Arc<Mutex<HashSet<String>>>,
    refuse_connections: Arc<AtomicBool>,
    connections: Arc<AtomicUsize>,
    upload_delay: Arc<Mutex<Duration>>,
    slow_files: Arc<Mutex<HashMap<String, Duration>>>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uploads of `filename` fail with a permanent error
    pub fn fail_file(&self, filename: &str) {
        self.failing_files.lock().insert(filename.to_string());
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Each upload sleeps for `delay`, so tests can observe concurrency
    pub fn set_upload_delay(&self, delay: Duration) {
        *self.upload_delay.lock() = delay;
    }

    /// Uploads of `filename` sleep for `delay` instead of the shared upload delay
    pub fn slow_file(&self, filename: &str, delay: Duration) {
        self.slow_files.lock().insert(filename.to_string(), delay);
    }

    pub fn seed_file(&self, id: &str, name: &str, content: &[u8]) {
        self.state.lock().files.insert(
            id.to_string(),
            StoredFile {
                id: id.to_string(),
                container_id: "root".to_string(),
                name: name.to_string(),
                content: content.to_vec(),
                mime_type: "application/octet-stream".to_string(),
            },
        );
    }

    pub fn container_id(&self, parent_id: &str, name: &str) -> Option<String> {
        self.state
            .lock()
            .containers
            .get(&(parent_id.to_string(), name.to_string()))
            .cloned()
    }

    pub fn containers_created(&self) -> usize {
        self.state.lock().containers_created
    }

    pub fn container_lookups(&self) -> usize {
        self.state.lock().lookups
    }

    /// Files uploaded so far, ordered by name
    pub fn files(&self) -> Vec<StoredFile> {
        let mut files: Vec<StoredFile> = self.state.lock().files.values().cloned().collect();
        files.sort_by(|a, b| a.name.cmp(&b.name));
        files
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Highest number of uploads that were running at the same time
    pub fn peak_concurrent_uploads(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

impl StorageConnector for InMemoryStorage {
    fn connect(&self) -> WorkerResult<Box<dyn StorageClient>> {
        if self.refuse_connections.load(Ordering::SeqCst) {
            return Err(WorkerError::connection("storage service unavailable"));
        }
        self.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(InMemoryStorageClient {
            storage: self.clone(),
        }))
    }
}

struct InMemoryStorageClient {
    storage: InMemoryStorage,
}

impl StorageClient for InMemoryStorageClient {
    fn find_container(&mut self, parent_id: &str, name: &str) -> WorkerResult<Option<String>> {
        let mut state = self.storage.state.lock();
        state.lookups += 1;
        Ok(state
            .containers
            .get(&(parent_id.to_string(), name.to_string()))
            .cloned())
    }

    fn create_container(&mut self, parent_id: &str, name: &str) -> WorkerResult<String> {
        let mut state = self.storage.state.lock();
        let id = state.next_id("folder");
        state
            .containers
            .insert((parent_id.to_string(), name.to_string()), id.clone());
        state.containers_created += 1;
        Ok(id)
    }

    fn upload(
        &mut self,
        container_id: &str,
        filename: &str,
        content: &[u8],
        mime_type: &str,
    ) -> WorkerResult<StoredObject> {
        let running = self.storage.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.storage.peak_in_flight.fetch_max(running, Ordering::SeqCst);
        let delay = self
            .storage
            .slow_files
            .lock()
            .get(filename)
            .copied()
            .unwrap_or_else(|| *self.storage.upload_delay.lock());
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        let result = self.store(container_id, filename, content, mime_type);
        self.storage.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn download(&mut self, resource_id: &str) -> WorkerResult<Vec<u8>> {
        self.storage
            .state
            .lock()
            .files
            .get(resource_id)
            .map(|file| file.content.clone())
            .ok_or_else(|| {
                WorkerError::external(ErrorKind::Permanent, format!("{resource_id} not found"))
            })
    }
}

impl InMemoryStorageClient {
    fn store(
        &self,
        container_id: &str,
        filename: &str,
        content: &[u8],
        mime_type: &str,
    ) -> WorkerResult<StoredObject> {
        if self.storage.failing_files.lock().contains(filename) {
            return Err(WorkerError::external(
                ErrorKind::Permanent,
                format!("upload of {filename} rejected"),
            ));
        }
        let mut state = self.storage.state.lock();
        let id = state.next_id("file");
        state.files.insert(
            id.clone(),
            StoredFile {
                id: id.clone(),
                container_id: container_id.to_string(),
                name: filename.to_string(),
                content: content.to_vec(),
                mime_type: mime_type.to_string(),
            },
        );
        Ok(StoredObject {
            web_url: Some(format!("https://storage.test/{id}")),
            id,
            name: filename.to_string(),
            size: content.len() as u64,
        })
    }
}

/// One recorded [`RecordUpdater`] call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedUpdate {
    pub record_id: String,
    pub object_id: String,
    pub container_path: String,
}

#[derive(Default)]
pub struct RecordingRecordUpdater {
    updates: Mutex<Vec<RecordedUpdate>>,
    fail: AtomicBool,
}

impl RecordingRecordUpdater {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn updates(&self) -> Vec<RecordedUpdate> {
        self.updates.lock().clone()
    }
}

impl RecordUpdater for RecordingRecordUpdater {
    fn record_upload(
        &self,
        record_id: &str,
        object: &StoredObject,
        container_path: &str,
    ) -> WorkerResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(WorkerError::external(
                ErrorKind::Connection,
                "record store unavailable",
            ));
        }
        self.updates.lock().push(RecordedUpdate {
            record_id: record_id.to_string(),
            object_id: object.id.clone(),
            container_path: container_path.to_string(),
        });
        Ok(())
    }
}

/// Datastore whose sessions echo requests back
#[derive(Clone, Default)]
pub struct InMemoryDatastore {
    connections: Arc<AtomicUsize>,
    refuse_connections: Arc<AtomicBool>,
    unhealthy: Arc<AtomicBool>,
    executed: Arc<AtomicUsize>,
}

impl InMemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Existing sessions fail `ping` and `execute` with a connection error
    pub fn set_unhealthy(&self, unhealthy: bool) {
        self.unhealthy.store(unhealthy, Ordering::SeqCst);
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }
}

impl DatastoreConnector for InMemoryDatastore {
    fn connect(&self) -> WorkerResult<Box<dyn DatastoreSession>> {
        if self.refuse_connections.load(Ordering::SeqCst) {
            return Err(WorkerError::connection("datastore unreachable"));
        }
        let session_id = self.connections.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(InMemorySession {
            session_id,
            datastore: self.clone(),
        }))
    }
}

struct InMemorySession {
    session_id: usize,
    datastore: InMemoryDatastore,
}

impl DatastoreSession for InMemorySession {
    fn execute(&mut self, request: &Value) -> WorkerResult<Value> {
        self.ping()?;
        self.datastore.executed.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "session": self.session_id, "echo": request }))
    }

    fn ping(&mut self) -> WorkerResult<()> {
        if self.datastore.unhealthy.load(Ordering::SeqCst) {
            return Err(WorkerError::connection("datastore connection reset"));
        }
        Ok(())
    }
}
