//! Scriptable upstream API served by axum on 127.0.0.1:0
//!
//! Every path serves a list of JSON pages selected by the `page` query
//! parameter (page 1 when absent). Failures can be queued per page as HTTP
//! statuses that are returned before the page itself.

use axum::{
    extract::{Query, State},
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    Json, Router,
};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct MockState {
    pages: HashMap<String, Vec<Value>>,
    failures: HashMap<(String, i64), VecDeque<u16>>,
    hits: HashMap<(String, i64), usize>,
    queries: Vec<(String, HashMap<String, String>)>,
}

pub struct MockUpstream {
    addr: SocketAddr,
    state: Arc<Mutex<MockState>>,
}

impl MockUpstream {
    pub async fn start() -> Self {
        let state = Arc::new(Mutex::new(MockState::default()));
        let app = Router::new().fallback(serve).with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock upstream");
        let addr = listener.local_addr().expect("No local address");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("Mock upstream failed");
        });

        Self { addr, state }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn set_pages(&self, path: &str, pages: Vec<Value>) {
        self.state.lock().unwrap().pages.insert(path.to_string(), pages);
    }

    /// Answer the next requests for `page` with `statuses`, in order
    pub fn fail_next(&self, path: &str, page: i64, statuses: &[u16]) {
        self.state
            .lock()
            .unwrap()
            .failures
            .entry((path.to_string(), page))
            .or_default()
            .extend(statuses.iter().copied());
    }

    pub fn hits(&self, path: &str, page: i64) -> usize {
        self.state
            .lock()
            .unwrap()
            .hits
            .get(&(path.to_string(), page))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_hits(&self, path: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .hits
            .iter()
            .filter(|((p, _), _)| p == path)
            .map(|(_, n)| *n)
            .sum()
    }

    /// Query parameters of every request so far
    pub fn queries(&self) -> Vec<(String, HashMap<String, String>)> {
        self.state.lock().unwrap().queries.clone()
    }
}

async fn serve(
    State(state): State<Arc<Mutex<MockState>>>,
    uri: Uri,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let path = uri.path().to_string();
    let page: i64 = params
        .get("page")
        .and_then(|p| p.parse().ok())
        .unwrap_or(1);

    let mut state = state.lock().unwrap();
    *state.hits.entry((path.clone(), page)).or_default() += 1;
    state.queries.push((path.clone(), params));

    if let Some(status) = state
        .failures
        .get_mut(&(path.clone(), page))
        .and_then(|queue| queue.pop_front())
    {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return (status, Json(json!({ "detail": "scripted failure" }))).into_response();
    }

    match state
        .pages
        .get(&path)
        .and_then(|pages| pages.get((page - 1).max(0) as usize))
    {
        Some(body) => Json(body.clone()).into_response(),
        None => (StatusCode::NOT_FOUND, Json(json!({ "detail": "no such page" }))).into_response(),
    }
}
