//! rollcall-testkit — a loopback HTTP server for tests.
//!
//! Every request is answered by a caller-supplied handler and then reported
//! on a channel, so tests can assert on what the client actually sent.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// A request as the stub saw it.
#[derive(Debug, Clone)]
pub struct StubRequest {
    pub method: String,
    /// Path and query, e.g. `/service?func=attendance`.
    pub target: String,
    pub content_type: Option<String>,
    pub body: String,
}

impl StubRequest {
    /// Value of a form field in the body, undecoded.
    pub fn form(&self, name: &str) -> Option<&str> {
        self.body.split('&').find_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            (k == name).then_some(v)
        })
    }

    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or_default()
    }
}

pub struct StubResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl StubResponse {
    pub fn json(status: u16, body: &str) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: body.as_bytes().to_vec(),
        }
    }

    pub fn bytes(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_type: "application/octet-stream",
            body,
        }
    }
}

impl IntoResponse for StubResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, [(CONTENT_TYPE, self.content_type)], self.body).into_response()
    }
}

/// Serve every request with `handler` until the runtime shuts down.
///
/// Returns the base URL (`http://127.0.0.1:<port>`) and the request log.
pub async fn serve_with<F>(handler: F) -> (String, mpsc::UnboundedReceiver<StubRequest>)
where
    F: Fn(&StubRequest) -> StubResponse + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = Arc::new(handler);
    let app = Router::new().fallback(
        move |method: Method, uri: Uri, headers: HeaderMap, body: Bytes| {
            let handler = handler.clone();
            let tx = tx.clone();
            async move {
                let request = StubRequest {
                    method: method.to_string(),
                    target: uri
                        .path_and_query()
                        .map(|pq| pq.as_str().to_string())
                        .unwrap_or_else(|| uri.path().to_string()),
                    content_type: headers
                        .get(CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string),
                    body: String::from_utf8_lossy(&body).into_owned(),
                };
                let response = handler(&request);
                let _ = tx.send(request);
                response
            }
        },
    );

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback stub");
    let addr = listener.local_addr().expect("stub address");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), rx)
}

/// Answer requests with canned JSON bodies, in order. Once they run out
/// every request gets a 500.
pub async fn serve(
    responses: Vec<(u16, &'static str)>,
) -> (String, mpsc::UnboundedReceiver<StubRequest>) {
    let queue = Mutex::new(responses.into_iter().collect::<VecDeque<_>>());
    serve_with(move |_| {
        let (status, body) = queue
            .lock()
            .map(|mut q| q.pop_front())
            .ok()
            .flatten()
            .unwrap_or((500, "no canned response left"));
        StubResponse::json(status, body)
    })
    .await
}
