//! Common test utilities for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use topicfed::config::FederationConfig;
use topicfed::data::{ActorRecord, Category, Database, NewActor, Post, content, store};
use topicfed::error::AppError;
use topicfed::federation::publish::enable_category;
use topicfed::federation::signature::generate_keypair;
use topicfed::federation::{Federation, Job, TaskScheduler, default_registry};

pub const BASE_URL: &str = "http://forum.test";
pub const AS_PUBLIC: &str = "https://www.w3.org/ns/activitystreams#Public";

// =============================================================================
// Scheduler
// =============================================================================

/// Scheduler that keeps jobs instead of running them.
#[derive(Default)]
pub struct RecordingScheduler {
    pending: Mutex<HashMap<String, Job>>,
}

impl RecordingScheduler {
    pub fn job(&self, key: &str) -> Option<Job> {
        self.pending.lock().unwrap().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.pending.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Pending deliveries as `(to_actor, activity)`.
    pub fn deliveries(&self) -> Vec<(String, Value)> {
        let mut deliveries: Vec<(String, Value)> = self
            .pending
            .lock()
            .unwrap()
            .values()
            .filter_map(|job| match job {
                Job::Deliver {
                    to_actor, activity, ..
                } => Some((to_actor.clone(), activity.clone())),
                _ => None,
            })
            .collect();
        deliveries.sort_by(|a, b| a.0.cmp(&b.0));
        deliveries
    }

    /// Pretend every pending job ran.
    pub fn fire_all(&self) -> Vec<Job> {
        self.pending.lock().unwrap().drain().map(|(_, job)| job).collect()
    }
}

#[async_trait]
impl TaskScheduler for RecordingScheduler {
    async fn schedule(
        &self,
        key: &str,
        job: Job,
        _delay: Option<Duration>,
    ) -> Result<bool, AppError> {
        Ok(self
            .pending
            .lock()
            .unwrap()
            .insert(key.to_string(), job)
            .is_some())
    }

    async fn cancel(&self, key: &str) -> bool {
        self.pending.lock().unwrap().remove(key).is_some()
    }

    async fn is_pending(&self, key: &str) -> bool {
        self.pending.lock().unwrap().contains_key(key)
    }
}

// =============================================================================
// Federation
// =============================================================================

pub struct TestFederation {
    pub federation: Arc<Federation>,
    pub scheduler: Arc<RecordingScheduler>,
    pub _temp_dir: TempDir,
}

impl TestFederation {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: FederationConfig) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(Database::connect(&temp_dir.path().join("test.db")).await.unwrap());
        let scheduler = Arc::new(RecordingScheduler::default());
        let federation = Federation::new(
            db,
            config,
            BASE_URL,
            default_registry(),
            scheduler.clone(),
        )
        .unwrap()
        .with_actor_key_bits(1024);

        Self {
            federation: Arc::new(federation),
            scheduler,
            _temp_dir: temp_dir,
        }
    }

    pub fn db(&self) -> &Database {
        self.federation.db()
    }

    /// A category and the Group federating it.
    pub async fn federated_category(&self, slug: &str, full_topic: bool) -> (Category, ActorRecord) {
        let mut conn = self.db().acquire().await.unwrap();
        let category = content::create_category(&mut conn, slug, slug, full_topic)
            .await
            .unwrap();
        drop(conn);
        let group = enable_category(&self.federation, category.id).await.unwrap();
        (category, group)
    }

    /// A local user and the first post of a new topic in `category_id`.
    pub async fn local_topic(&self, category_id: i64, username: &str, title: &str, body: &str) -> Post {
        let mut conn = self.db().acquire().await.unwrap();
        let user = content::create_user(&mut conn, username, None, false)
            .await
            .unwrap();
        let topic = content::create_topic(&mut conn, Some(category_id), user.id, title)
            .await
            .unwrap();
        content::create_post(&mut conn, topic.id, user.id, body, None)
            .await
            .unwrap()
    }

    pub async fn store_remote_actor(&self, ap_id: &str) -> ActorRecord {
        let mut conn = self.db().acquire().await.unwrap();
        store::upsert_actor(&mut conn, &remote_actor(ap_id, None))
            .await
            .unwrap();
        store::find_actor(&mut conn, ap_id).await.unwrap().unwrap()
    }

    pub async fn follow(&self, follower: &str, followed: &str) {
        let mut conn = self.db().acquire().await.unwrap();
        store::add_follow(&mut conn, follower, followed).await.unwrap();
    }

    pub async fn count(&self, table: &str) -> i64 {
        let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(self.db().pool())
            .await
            .unwrap();
        count
    }
}

pub fn test_config() -> FederationConfig {
    FederationConfig {
        allow_private_hosts: true,
        verify_signatures: false,
        fetch_timeout_seconds: 5,
        ..Default::default()
    }
}

pub fn remote_actor(ap_id: &str, public_key_pem: Option<String>) -> NewActor {
    let url = url::Url::parse(ap_id).unwrap();
    let domain = match url.port() {
        Some(port) => format!("{}:{}", url.host_str().unwrap(), port),
        None => url.host_str().unwrap().to_string(),
    };
    NewActor {
        ap_id: ap_id.to_string(),
        ap_type: "Person".to_string(),
        username: ap_id.rsplit('/').next().map(str::to_string),
        domain,
        inbox: Some(format!("{}/inbox", ap_id)),
        outbox: Some(format!("{}/outbox", ap_id)),
        public_key_pem,
        ..Default::default()
    }
}

// =============================================================================
// Documents
// =============================================================================

pub fn note(id: &str, author: &str, content: &str, in_reply_to: Option<&str>) -> Value {
    let mut note = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "Note",
        "id": id,
        "attributedTo": author,
        "content": content,
        "published": "2026-03-01T12:00:00Z",
        "to": [AS_PUBLIC],
    });
    if let Some(parent) = in_reply_to {
        note["inReplyTo"] = json!(parent);
    }
    note
}

pub fn activity(kind: &str, id: &str, actor: &str, object: Value, cc: &[&str]) -> Value {
    json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": kind,
        "id": id,
        "actor": actor,
        "object": object,
        "to": [AS_PUBLIC],
        "cc": cc,
        "published": "2026-03-01T12:00:00Z",
    })
}

pub fn actor_document(id: &str, public_key_pem: &str) -> Value {
    json!({
        "@context": [
            "https://www.w3.org/ns/activitystreams",
            "https://w3id.org/security/v1"
        ],
        "type": "Person",
        "id": id,
        "preferredUsername": id.rsplit('/').next().unwrap(),
        "inbox": format!("{}/inbox", id),
        "outbox": format!("{}/outbox", id),
        "publicKey": {
            "id": format!("{}#main-key", id),
            "owner": id,
            "publicKeyPem": public_key_pem,
        }
    })
}

/// `(private, public)` PEM pair small enough for tests.
pub fn test_keypair() -> (String, String) {
    generate_keypair(1024).unwrap()
}

// =============================================================================
// Remote server
// =============================================================================

/// Request received by the fake remote server.
#[derive(Debug, Clone)]
pub struct Received {
    pub path: String,
    pub headers: HeaderMap,
    pub body: Value,
    pub raw: Vec<u8>,
}

#[derive(Default)]
struct RemoteState {
    documents: Mutex<HashMap<String, Value>>,
    received: Mutex<Vec<Received>>,
    inbox_status: AtomicU16,
}

/// Real HTTP server serving documents by path and recording POSTs.
#[derive(Clone)]
pub struct RemoteServer {
    pub base: String,
    state: Arc<RemoteState>,
}

impl RemoteServer {
    pub async fn start() -> Self {
        let state = Arc::new(RemoteState::default());
        state.inbox_status.store(202, Ordering::SeqCst);

        let app = Router::new().fallback(remote_handler).with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base: format!("http://{}", addr),
            state,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// Serve `document` at `path`.
    pub fn put(&self, path: &str, document: Value) {
        self.state
            .documents
            .lock()
            .unwrap()
            .insert(path.to_string(), document);
    }

    /// Serve an actor at `path` and return its `(id, private key)`.
    pub fn put_actor(&self, path: &str) -> (String, String) {
        let (private_key, public_key) = test_keypair();
        let id = self.url(path);
        self.put(path, actor_document(&id, &public_key));
        (id, private_key)
    }

    pub fn set_inbox_status(&self, status: u16) {
        self.state.inbox_status.store(status, Ordering::SeqCst);
    }

    pub fn received(&self) -> Vec<Received> {
        self.state.received.lock().unwrap().clone()
    }
}

async fn remote_handler(
    State(state): State<Arc<RemoteState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    if method == Method::POST {
        state.received.lock().unwrap().push(Received {
            path,
            headers,
            body: serde_json::from_slice(&body).unwrap_or(Value::Null),
            raw: body.to_vec(),
        });
        let status = StatusCode::from_u16(state.inbox_status.load(Ordering::SeqCst))
            .unwrap_or(StatusCode::ACCEPTED);
        return status.into_response();
    }

    match state.documents.lock().unwrap().get(&path) {
        Some(document) => (
            [(axum::http::header::CONTENT_TYPE, "application/activity+json")],
            document.to_string(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
