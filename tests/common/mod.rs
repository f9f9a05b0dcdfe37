//! Shared harness for integration tests: a scripted HTTP client standing in
//! for real backends, and engine construction helpers.
#![allow(dead_code)]

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::body::Body;
use http::{HeaderMap, Method, StatusCode, Uri};
use hyper::{Request, Response};
use l8e_harbor::{
    adapters::StaticTokenAuth,
    core::middleware::MiddlewareDeps,
    engine::{EngineSettings, ProxyEngine},
    ports::{
        auth::Identity,
        http_client::{HttpClient, HttpClientError, HttpClientResult},
    },
};
use tokio_util::sync::CancellationToken;

/// One scripted upstream reaction.
#[derive(Clone)]
pub enum Script {
    /// Respond with this status and body "ok".
    Status(u16),
    /// Fail at the transport level.
    ConnectError,
    /// Hang longer than any per-attempt budget used in tests.
    Hang,
}

/// What the mock observed for one upstream call.
#[derive(Clone, Debug)]
pub struct Recorded {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
}

/// An [`HttpClient`] that replays a script and records every request.
/// Once the script is exhausted it answers 200.
pub struct ScriptedClient {
    script: Mutex<VecDeque<Script>>,
    pub requests: Mutex<Vec<Recorded>>,
}

impl ScriptedClient {
    pub fn new(script: impl IntoIterator<Item = Script>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn recorded(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    fn next_script(&self) -> Script {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Status(200))
    }
}

#[async_trait::async_trait]
impl HttpClient for ScriptedClient {
    async fn send_request(&self, req: Request<Body>) -> HttpClientResult<Response<Body>> {
        self.requests.lock().unwrap().push(Recorded {
            method: req.method().clone(),
            uri: req.uri().clone(),
            headers: req.headers().clone(),
        });
        match self.next_script() {
            Script::Status(code) => Ok(Response::builder()
                .status(StatusCode::from_u16(code).unwrap())
                .body(Body::from("ok"))
                .unwrap()),
            Script::ConnectError => Err(HttpClientError::Connect("connection refused".into())),
            Script::Hang => {
                tokio::time::sleep(Duration::from_secs(600)).await;
                Err(HttpClientError::Connect("unreachable".into()))
            }
        }
    }

    async fn probe(
        &self,
        _req: Request<Body>,
        _timeout: Duration,
    ) -> HttpClientResult<StatusCode> {
        // Probing behaviour is exercised via unit tests; integration tests
        // drive health state through the registry directly.
        Ok(StatusCode::OK)
    }
}

/// Engine wired to the scripted client, with the static token `secret`
/// resolving to admin/alice for auth tests.
pub fn engine_with(client: Arc<ScriptedClient>) -> Arc<ProxyEngine> {
    let auth = StaticTokenAuth::new(
        [(
            "secret".to_string(),
            Identity {
                subject: "alice".to_string(),
                role: "admin".to_string(),
            },
        )]
        .into(),
    );
    Arc::new(ProxyEngine::new(
        client,
        MiddlewareDeps {
            auth: Arc::new(auth),
        },
        EngineSettings::default(),
        CancellationToken::new(),
    ))
}

pub fn client_addr() -> Option<SocketAddr> {
    Some("203.0.113.10:50000".parse().unwrap())
}

pub fn get(path: &str) -> Request<Body> {
    Request::builder()
        .method(Method::GET)
        .uri(path)
        .body(Body::empty())
        .unwrap()
}

pub async fn body_string(resp: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
    String::from_utf8_lossy(&bytes).to_string()
}
