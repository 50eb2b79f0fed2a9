use crate::backend::Backend;
use crate::error::ProxyError;
use crate::protocol::{ChatRequest, ChatTurn, StreamData, STREAM_DATA_HEADER};
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderValue, StatusCode};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::error::Error;
use std::sync::Arc;

pub struct ProxyConfig {
    pub listen: String,
    pub backend_url: String,
}

struct ServerState {
    backend: Backend,
}

type ServerResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

pub async fn run(config: ProxyConfig) -> ServerResult<()> {
    let app = router(&config);

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    tracing::info!(
        listen = %config.listen,
        backend = %config.backend_url,
        "chat proxy listening"
    );
    axum::serve(listener, app).await?;

    Ok(())
}

pub fn router(config: &ProxyConfig) -> Router {
    let state = Arc::new(ServerState {
        backend: Backend::new(&config.backend_url),
    });

    Router::new()
        .route("/api/chat", post(chat))
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

// The body is taken raw so malformed JSON surfaces as our own 500 rather
// than the extractor's 4xx.
async fn chat(
    State(state): State<Arc<ServerState>>,
    body: Bytes,
) -> Result<Response, ProxyError> {
    proxy_chat(&state.backend, &body).await
}

async fn proxy_chat(backend: &Backend, body: &[u8]) -> Result<Response, ProxyError> {
    let request: ChatRequest = serde_json::from_slice(body)?;
    let data = request.data.unwrap_or_default();

    let session_id = match data.session_id.filter(|id| !id.is_empty()) {
        Some(id) => id,
        None => {
            let id = backend.create_session().await?;
            tracing::info!(session_id = %id, "created backend session");
            id
        }
    };

    let last = request.messages.last().ok_or(ProxyError::NoMessages)?;
    let turn = ChatTurn {
        message: last.content.clone(),
        event_id: data.event_id,
        attachments: data.attachments,
    };

    tracing::debug!(session_id = %session_id, "forwarding chat turn");
    let upstream = backend.send_chat(&session_id, &turn).await?;

    let stream_data = serde_json::to_string(&StreamData { session_id })?;
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/event-stream")
        .header(CACHE_CONTROL, "no-cache")
        .header(STREAM_DATA_HEADER, HeaderValue::from_str(&stream_data)?)
        .body(Body::from_stream(upstream.bytes_stream()))?;

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ErrorBody;
    use axum::extract::Path;
    use axum::response::IntoResponse;
    use axum::routing::put;
    use futures::{stream, StreamExt};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::sync::{oneshot, Mutex};

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        CreateSession,
        Chat { session_id: String, body: Value },
    }

    struct MockBackend {
        session_status: StatusCode,
        session_id: &'static str,
        chat_status: StatusCode,
        chat_chunks: Vec<&'static str>,
        calls: Mutex<Vec<Call>>,
    }

    impl MockBackend {
        fn new() -> Self {
            Self {
                session_status: StatusCode::OK,
                session_id: "abc",
                chat_status: StatusCode::OK,
                chat_chunks: vec!["Hello"],
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    async fn mock_create_session(State(mock): State<Arc<MockBackend>>) -> Response {
        mock.calls.lock().await.push(Call::CreateSession);
        if !mock.session_status.is_success() {
            return (mock.session_status, "unavailable").into_response();
        }
        Json(json!({ "data": { "session_id": mock.session_id } })).into_response()
    }

    async fn mock_chat(
        State(mock): State<Arc<MockBackend>>,
        Path(session_id): Path<String>,
        Json(body): Json<Value>,
    ) -> Response {
        mock.calls.lock().await.push(Call::Chat { session_id, body });
        if !mock.chat_status.is_success() {
            return (mock.chat_status, mock.chat_chunks.concat()).into_response();
        }
        let chunks = mock
            .chat_chunks
            .clone()
            .into_iter()
            .map(|chunk| Ok::<_, std::io::Error>(chunk));
        Response::builder()
            .header(CONTENT_TYPE, "text/event-stream")
            .body(Body::from_stream(stream::iter(chunks)))
            .unwrap()
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    async fn start(mock: MockBackend) -> (String, Arc<MockBackend>) {
        let mock = Arc::new(mock);
        let backend = Router::new()
            .route("/sessions", put(mock_create_session))
            .route("/sessions/:id/chat", post(mock_chat))
            .with_state(Arc::clone(&mock));
        let backend_url = serve(backend).await;

        let proxy = router(&ProxyConfig {
            listen: "127.0.0.1:0".to_string(),
            backend_url: format!("{}/", backend_url),
        });
        (serve(proxy).await, mock)
    }

    async fn post_chat(proxy_url: &str, body: Value) -> reqwest::Response {
        reqwest::Client::new()
            .post(format!("{}/api/chat", proxy_url))
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    fn hi(data: Value) -> Value {
        json!({
            "messages": [{ "id": "1", "role": "user", "content": "hi" }],
            "data": data
        })
    }

    fn stream_data(response: &reqwest::Response) -> StreamData {
        let header = response
            .headers()
            .get(STREAM_DATA_HEADER)
            .expect("stream data header")
            .to_str()
            .unwrap();
        serde_json::from_str(header).unwrap()
    }

    #[tokio::test]
    async fn new_conversation_creates_session_and_streams_reply() {
        let (proxy, mock) = start(MockBackend::new()).await;

        let response = post_chat(&proxy, hi(json!({}))).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );
        assert_eq!(
            stream_data(&response),
            StreamData {
                session_id: "abc".to_string()
            }
        );
        assert_eq!(response.text().await.unwrap(), "Hello");

        let calls = mock.calls.lock().await;
        assert_eq!(
            *calls,
            vec![
                Call::CreateSession,
                Call::Chat {
                    session_id: "abc".to_string(),
                    body: json!({ "message": "hi" }),
                },
            ]
        );
    }

    #[tokio::test]
    async fn empty_session_id_is_treated_as_missing() {
        let (proxy, mock) = start(MockBackend::new()).await;

        let response = post_chat(&proxy, hi(json!({ "sessionId": "" }))).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(stream_data(&response).session_id, "abc");
        assert_eq!(mock.calls.lock().await[0], Call::CreateSession);
    }

    #[tokio::test]
    async fn missing_data_creates_session() {
        let (proxy, mock) = start(MockBackend::new()).await;

        let body = json!({ "messages": [{ "id": "1", "role": "user", "content": "hi" }] });
        let response = post_chat(&proxy, body).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(mock.calls.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn existing_session_is_reused_without_creation() {
        let (proxy, mock) = start(MockBackend::new()).await;

        for _ in 0..2 {
            let response = post_chat(&proxy, hi(json!({ "sessionId": "xyz" }))).await;
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(stream_data(&response).session_id, "xyz");
        }

        let calls = mock.calls.lock().await;
        assert_eq!(calls.len(), 2);
        assert!(!calls.contains(&Call::CreateSession));
        assert!(calls.iter().all(|call| matches!(
            call,
            Call::Chat { session_id, .. } if session_id == "xyz"
        )));
    }

    #[tokio::test]
    async fn forwards_last_message_event_id_and_attachments() {
        let (proxy, mock) = start(MockBackend::new()).await;

        let body = json!({
            "messages": [
                { "id": "1", "role": "user", "content": "first" },
                { "id": "2", "role": "assistant", "content": "reply" },
                { "id": "3", "role": "user", "content": "second" }
            ],
            "data": {
                "sessionId": "xyz",
                "eventId": "evt-1",
                "attachments": [{ "name": "notes.txt" }]
            }
        });
        post_chat(&proxy, body).await;

        let calls = mock.calls.lock().await;
        assert_eq!(
            calls[0],
            Call::Chat {
                session_id: "xyz".to_string(),
                body: json!({
                    "message": "second",
                    "event_id": "evt-1",
                    "attachments": [{ "name": "notes.txt" }]
                }),
            }
        );
    }

    #[tokio::test]
    async fn streamed_body_is_passed_through_unchanged() {
        let mut mock = MockBackend::new();
        mock.chat_chunks = vec!["data: Hel", "lo\n\n", "data: world\n\n"];
        let (proxy, _) = start(mock).await;

        let response = post_chat(&proxy, hi(json!({ "sessionId": "xyz" }))).await;

        assert_eq!(
            response.bytes().await.unwrap().as_ref(),
            b"data: Hello\n\ndata: world\n\n"
        );
    }

    #[tokio::test]
    async fn first_chunk_reaches_client_while_backend_holds_stream() {
        let (release, held) = oneshot::channel::<()>();
        let held = Arc::new(Mutex::new(Some(held)));
        let backend = Router::new().route(
            "/sessions/:id/chat",
            post(move || {
                let held = Arc::clone(&held);
                async move {
                    let held = held.lock().await.take().expect("single chat call");
                    let first = stream::once(async { Ok::<_, std::io::Error>("data: first\n\n") });
                    let rest = stream::once(async move {
                        let _ = held.await;
                        Ok("data: rest\n\n")
                    });
                    Response::builder()
                        .header(CONTENT_TYPE, "text/event-stream")
                        .body(Body::from_stream(first.chain(rest)))
                        .unwrap()
                }
            }),
        );
        let backend_url = serve(backend).await;
        let proxy = serve(router(&ProxyConfig {
            listen: "127.0.0.1:0".to_string(),
            backend_url,
        }))
        .await;

        let response = post_chat(&proxy, hi(json!({ "sessionId": "xyz" }))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let mut body = response.bytes_stream();

        let expected: &[u8] = b"data: first\n\n";
        let mut received = Vec::new();
        while received.len() < expected.len() {
            let chunk = tokio::time::timeout(Duration::from_secs(5), body.next())
                .await
                .expect("first chunk arrives before the backend finishes")
                .expect("stream still open")
                .unwrap();
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received, expected);

        release.send(()).unwrap();
        while let Some(chunk) = body.next().await {
            received.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(received, b"data: first\n\ndata: rest\n\n");
    }

    #[tokio::test]
    async fn unregistered_backend_status_is_kept() {
        let mut mock = MockBackend::new();
        mock.chat_status = StatusCode::from_u16(499).unwrap();
        mock.chat_chunks = vec!["client closed"];
        let (proxy, _) = start(mock).await;

        let response = post_chat(&proxy, hi(json!({ "sessionId": "xyz" }))).await;

        assert_eq!(response.status().as_u16(), 499);
        let body: ErrorBody = response.json().await.unwrap();
        assert_eq!(body.details.as_deref(), Some("client closed"));
    }

    #[tokio::test]
    async fn session_creation_failure_is_internal_error() {
        let mut mock = MockBackend::new();
        mock.session_status = StatusCode::SERVICE_UNAVAILABLE;
        let (proxy, mock) = start(mock).await;

        let response = post_chat(&proxy, hi(json!({}))).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: ErrorBody = response.json().await.unwrap();
        assert_eq!(body.error, "Internal Server Error");
        assert_eq!(body.details, None);
        assert_eq!(*mock.calls.lock().await, vec![Call::CreateSession]);
    }

    #[tokio::test]
    async fn backend_chat_failure_keeps_status_and_details() {
        let mut mock = MockBackend::new();
        mock.chat_status = StatusCode::NOT_FOUND;
        mock.chat_chunks = vec!["session not found"];
        let (proxy, _) = start(mock).await;

        let response = post_chat(&proxy, hi(json!({ "sessionId": "xyz" }))).await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: ErrorBody = response.json().await.unwrap();
        assert_eq!(
            body,
            ErrorBody {
                error: "Backend service failed".to_string(),
                details: Some("session not found".to_string()),
            }
        );
    }

    #[tokio::test]
    async fn malformed_json_is_internal_error() {
        let (proxy, mock) = start(MockBackend::new()).await;

        let response = reqwest::Client::new()
            .post(format!("{}/api/chat", proxy))
            .body("{not json")
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: ErrorBody = response.json().await.unwrap();
        assert_eq!(body.error, "Internal Server Error");
        assert!(mock.calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn empty_messages_is_internal_error() {
        let (proxy, _) = start(MockBackend::new()).await;

        let body = json!({ "messages": [], "data": { "sessionId": "xyz" } });
        let response = post_chat(&proxy, body).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn unreachable_backend_is_internal_error() {
        let proxy = serve(router(&ProxyConfig {
            listen: "127.0.0.1:0".to_string(),
            backend_url: "http://127.0.0.1:1".to_string(),
        }))
        .await;

        let response = post_chat(&proxy, hi(json!({ "sessionId": "xyz" }))).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (proxy, _) = start(MockBackend::new()).await;

        let body: Value = reqwest::get(format!("{}/health", proxy))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(body, json!({ "status": "ok" }));
    }
}
