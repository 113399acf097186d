//! Exercises [`RepoClient`] against an in-process stub of the repository
//! file API, covering the token handshake, the expired-token retry and the
//! wire shape of every operation.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, head};
use axum::{Json, Router};
use serde_json::json;
use tokio::sync::Mutex;

use librepo::{ClientOptions, Error, RepoClient};

#[derive(Default)]
struct Stub {
    /// Count of handshakes served; the current token is `token-<n>`.
    token_gen: AtomicU32,
    /// Refuse the next handshake with 401.
    reject_auth: AtomicBool,
    /// Reject the next data request with 403 plus `x-csrf-token: required`.
    expire_next: AtomicBool,
    stat_calls: AtomicU32,
    last_write: Mutex<Option<(String, Vec<u8>)>>,
    /// (parent dir, name, directory) of the last create.
    last_create: Mutex<Option<(String, String, bool)>>,
    /// (parent dir, location, target) of the last move.
    last_move: Mutex<Option<(String, String, String)>>,
}

impl Stub {
    fn current_token(&self) -> String {
        format!("token-{}", self.token_gen.load(Ordering::SeqCst))
    }

    /// 403 when the request does not carry the current token, or when the
    /// test armed a forced expiry.
    fn check_token(&self, headers: &HeaderMap) -> Option<Response> {
        let got = headers
            .get("x-csrf-token")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if self.expire_next.swap(false, Ordering::SeqCst) || got != self.current_token() {
            return Some(
                (StatusCode::FORBIDDEN, [("x-csrf-token", "required")]).into_response(),
            );
        }
        None
    }
}

async fn token(State(stub): State<Arc<Stub>>, headers: HeaderMap) -> Response {
    if stub.reject_auth.load(Ordering::SeqCst) || !headers.contains_key("authorization") {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if headers.get("x-csrf-token").and_then(|v| v.to_str().ok()) != Some("fetch") {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let n = stub.token_gen.fetch_add(1, Ordering::SeqCst) + 1;
    (StatusCode::OK, [("x-csrf-token", format!("token-{n}"))]).into_response()
}

fn docs_listing(depth: u32) -> serde_json::Value {
    let sub_children = if depth >= 2 {
        json!([{
            "Name": "b.txt",
            "Directory": false,
            "Location": "/docs/sub/b.txt",
            "ModifiedAt": 1_700_000_300_000i64,
        }])
    } else {
        json!([])
    };
    json!({
        "Name": "docs",
        "Directory": true,
        "Children": [
            {
                "Name": "a.txt",
                "Directory": false,
                "Location": "/docs/a.txt",
                "ModifiedAt": 1_700_000_100_000i64,
            },
            {
                "Name": "sub",
                "Directory": true,
                "Location": "/docs/sub",
                "Children": sub_children,
            },
        ],
    })
}

async fn get_root(
    State(stub): State<Arc<Stub>>,
    Query(q): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if let Some(denied) = stub.check_token(&headers) {
        return denied;
    }
    if q.get("parts").map(String::as_str) == Some("meta") {
        stub.stat_calls.fetch_add(1, Ordering::SeqCst);
        return (StatusCode::OK, Json(json!({"Name": "", "Directory": true}))).into_response();
    }
    let body = json!({
        "Name": "",
        "Directory": true,
        "Children": [
            { "Name": "docs", "Directory": true, "Location": "/docs" },
        ],
    });
    (StatusCode::OK, Json(body)).into_response()
}

async fn get_path(
    State(stub): State<Arc<Stub>>,
    Path(path): Path<String>,
    Query(q): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if let Some(denied) = stub.check_token(&headers) {
        return denied;
    }
    let depth = q.get("depth").and_then(|d| d.parse::<u32>().ok());
    match (path.as_str(), depth) {
        ("docs", Some(0)) => {
            stub.stat_calls.fetch_add(1, Ordering::SeqCst);
            (StatusCode::OK, Json(json!({"Name": "docs", "Directory": true}))).into_response()
        }
        ("docs", Some(d)) => (StatusCode::OK, Json(docs_listing(d))).into_response(),
        ("docs/a.txt", Some(0)) => {
            stub.stat_calls.fetch_add(1, Ordering::SeqCst);
            let body = json!({
                "Name": "a.txt",
                "Directory": false,
                "ModifiedAt": 1_700_000_100_000i64,
            });
            (StatusCode::OK, Json(body)).into_response()
        }
        ("docs/a.txt", None) => (StatusCode::OK, "hello repository").into_response(),
        ("project/x.txt", Some(0)) => {
            stub.stat_calls.fetch_add(1, Ordering::SeqCst);
            (StatusCode::OK, Json(json!({"Name": "x.txt", "Directory": false}))).into_response()
        }
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn post_path(
    State(stub): State<Arc<Stub>>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(denied) = stub.check_token(&headers) {
        return denied;
    }
    let doc: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };
    if headers.contains_key("x-create-options") {
        let location = doc["Location"].as_str().unwrap_or_default().to_string();
        let target = doc["Target"].as_str().unwrap_or_default().to_string();
        *stub.last_move.lock().await = Some((path, location, target));
        return StatusCode::CREATED.into_response();
    }
    let name = doc["Name"].as_str().unwrap_or_default().to_string();
    let directory = doc["Directory"].as_bool().unwrap_or_default();
    *stub.last_create.lock().await = Some((path, name, directory));
    StatusCode::CREATED.into_response()
}

async fn put_path(
    State(stub): State<Arc<Stub>>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(denied) = stub.check_token(&headers) {
        return denied;
    }
    if path != "docs/a.txt" {
        return StatusCode::NOT_FOUND.into_response();
    }
    *stub.last_write.lock().await = Some((path, body.to_vec()));
    StatusCode::OK.into_response()
}

async fn delete_path(
    State(stub): State<Arc<Stub>>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Some(denied) = stub.check_token(&headers) {
        return denied;
    }
    if path == "docs/a.txt" || path == "docs/sub" {
        StatusCode::NO_CONTENT.into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

async fn spawn_stub(stub: Arc<Stub>) -> SocketAddr {
    let app = Router::new()
        .route("/api/files", head(token))
        .route("/api/files/", get(get_root))
        .route(
            "/api/files/{*path}",
            get(get_path)
                .post(post_path)
                .put(put_path)
                .delete(delete_path),
        )
        .with_state(stub);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn connect(addr: SocketAddr) -> RepoClient {
    let opts = ClientOptions::new(format!("http://{addr}"), "alice", "secret");
    RepoClient::connect(opts).await.unwrap()
}

#[tokio::test]
async fn handshake_fetches_token_before_first_request() {
    let stub = Arc::new(Stub::default());
    let addr = spawn_stub(stub.clone()).await;

    let client = connect(addr).await;
    assert_eq!(stub.token_gen.load(Ordering::SeqCst), 1);

    let doc = client.stat("/docs/a.txt").await.unwrap();
    assert_eq!(doc.name, "a.txt");
    assert!(!doc.directory);
    assert_eq!(doc.modified_at, Some(1_700_000_100_000));
    assert_eq!(stub.stat_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn connect_rejects_bad_credentials() {
    let stub = Arc::new(Stub::default());
    stub.reject_auth.store(true, Ordering::SeqCst);
    let addr = spawn_stub(stub).await;

    let opts = ClientOptions::new(format!("http://{addr}"), "alice", "wrong");
    match RepoClient::connect(opts).await {
        Err(Error::Auth(_)) => {}
        other => panic!("expected auth error, got {other:?}"),
    }
}

#[tokio::test]
async fn expired_token_is_refreshed_and_request_retried() {
    let stub = Arc::new(Stub::default());
    let addr = spawn_stub(stub.clone()).await;
    let client = connect(addr).await;

    stub.expire_next.store(true, Ordering::SeqCst);
    let doc = client.stat("/docs").await.unwrap();
    assert!(doc.directory);
    // One extra handshake, and the stat still went through exactly once.
    assert_eq!(stub.token_gen.load(Ordering::SeqCst), 2);
    assert_eq!(stub.stat_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stat_maps_missing_path_to_not_found() {
    let stub = Arc::new(Stub::default());
    let addr = spawn_stub(stub).await;
    let client = connect(addr).await;

    let err = client.stat("/missing.txt").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn list_directory_expands_to_requested_depth() {
    let stub = Arc::new(Stub::default());
    let addr = spawn_stub(stub).await;
    let client = connect(addr).await;

    let shallow = client.list_directory("/docs", 1).await.unwrap();
    assert_eq!(shallow.children.len(), 2);
    let sub = shallow.children.iter().find(|c| c.name == "sub").unwrap();
    assert!(sub.directory);
    assert!(sub.children.is_empty());

    let deep = client.list_directory("/docs", 3).await.unwrap();
    let sub = deep.children.iter().find(|c| c.name == "sub").unwrap();
    assert_eq!(sub.children.len(), 1);
    assert_eq!(sub.children[0].location, "/docs/sub/b.txt");

    let root = client.list_directory("/", 1).await.unwrap();
    assert_eq!(root.children.len(), 1);
    assert_eq!(root.children[0].name, "docs");
}

#[tokio::test]
async fn read_and_write_round_trip() {
    let stub = Arc::new(Stub::default());
    let addr = spawn_stub(stub.clone()).await;
    let client = connect(addr).await;

    let content = client.read_file("/docs/a.txt").await.unwrap();
    assert_eq!(content, b"hello repository");

    client.write_file("/docs/a.txt", b"rewritten").await.unwrap();
    let written = stub.last_write.lock().await.clone();
    assert_eq!(written, Some(("docs/a.txt".to_string(), b"rewritten".to_vec())));
}

#[tokio::test]
async fn create_posts_to_the_parent_directory() {
    let stub = Arc::new(Stub::default());
    let addr = spawn_stub(stub.clone()).await;
    let client = connect(addr).await;

    client.create("/docs", "c.txt", false).await.unwrap();
    let created = stub.last_create.lock().await.clone();
    assert_eq!(created, Some(("docs".to_string(), "c.txt".to_string(), false)));

    client.create("/docs", "nested", true).await.unwrap();
    let created = stub.last_create.lock().await.clone();
    assert_eq!(created, Some(("docs".to_string(), "nested".to_string(), true)));
}

#[tokio::test]
async fn delete_maps_statuses() {
    let stub = Arc::new(Stub::default());
    let addr = spawn_stub(stub).await;
    let client = connect(addr).await;

    client.delete("/docs/a.txt").await.unwrap();
    assert!(client.delete("/missing.txt").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn rename_moves_within_the_directory_only() {
    let stub = Arc::new(Stub::default());
    let addr = spawn_stub(stub.clone()).await;
    let client = connect(addr).await;

    client.rename("/docs/a.txt", "/docs/b.txt").await.unwrap();
    let moved = stub.last_move.lock().await.clone();
    assert_eq!(
        moved,
        Some((
            "docs".to_string(),
            "/docs/a.txt".to_string(),
            "b.txt".to_string()
        ))
    );

    // Cross-directory moves are refused before any request is made.
    *stub.last_move.lock().await = None;
    let err = client.rename("/docs/a.txt", "/other/a.txt").await.unwrap_err();
    assert!(matches!(err, Error::OpNotAllowed(_)));
    assert!(stub.last_move.lock().await.is_none());

    // Renaming to the same name is a no-op.
    client.rename("/docs/a.txt", "/docs/a.txt").await.unwrap();
    assert!(stub.last_move.lock().await.is_none());
}

#[tokio::test]
async fn base_directory_prefixes_every_request() {
    let stub = Arc::new(Stub::default());
    let addr = spawn_stub(stub.clone()).await;

    let mut opts = ClientOptions::new(format!("http://{addr}"), "alice", "secret");
    opts.base = "project/".to_string();
    let client = RepoClient::connect(opts).await.unwrap();
    assert_eq!(client.base(), "/project");

    let doc = client.stat("/x.txt").await.unwrap();
    assert_eq!(doc.name, "x.txt");
    assert_eq!(stub.stat_calls.load(Ordering::SeqCst), 1);
}
