//! WHIP/WHEP clients against a local axum SFU over real HTTP

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{patch, post},
    Router,
};
use parking_lot::Mutex;

use webrtc_bridge::http::HttpClientConfig;
use webrtc_bridge::p2p::{P2PConfig, P2PSession};
use webrtc_bridge::sfu::{WhepClient, WhepConfig, WhipClient, WhipConfig};
use webrtc_bridge::webrtc::{MdnsMode, MediaFrame};
use webrtc_bridge::ErrorKind;

const ANSWER_SDP: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";

#[derive(Debug, Clone)]
struct Recorded {
    method: Method,
    path: String,
    content_type: Option<String>,
    authorization: Option<String>,
    body: String,
}

#[derive(Clone, Default)]
struct MockSfu {
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl MockSfu {
    fn record(&self, method: Method, path: String, headers: &HeaderMap, body: &str) {
        let header = |name: header::HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        self.requests.lock().push(Recorded {
            method,
            path,
            content_type: header(header::CONTENT_TYPE),
            authorization: header(header::AUTHORIZATION),
            body: body.to_string(),
        });
    }

    fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().clone()
    }
}

fn unauthorized(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("invalid-token"))
}

async fn whip_post(State(sfu): State<MockSfu>, headers: HeaderMap, body: String) -> Response {
    sfu.record(Method::POST, "/whip".into(), &headers, &body);
    if unauthorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    (
        StatusCode::CREATED,
        [
            (header::LOCATION, "/resource/abc123"),
            (header::CONTENT_TYPE, "application/sdp"),
        ],
        ANSWER_SDP,
    )
        .into_response()
}

/// Answers WHEP offers with a real webrtc-rs peer
async fn whep_post(State(sfu): State<MockSfu>, headers: HeaderMap, body: String) -> Response {
    sfu.record(Method::POST, "/whep".into(), &headers, &body);

    let session = P2PSession::new(P2PConfig {
        mdns_mode: MdnsMode::Disabled,
        ..Default::default()
    });
    let answer = match session.initialize_as_client("whep0001").await {
        Ok(()) => session.set_remote_offer(&body).await,
        Err(e) => Err(e),
    };
    session.disconnect().await;

    match answer {
        Ok(answer) => (
            StatusCode::CREATED,
            [(header::LOCATION, "/resource/def456")],
            answer,
        )
            .into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

async fn resource_patch(
    State(sfu): State<MockSfu>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: String,
) -> StatusCode {
    sfu.record(Method::PATCH, format!("/resource/{}", id), &headers, &body);
    StatusCode::NO_CONTENT
}

async fn resource_delete(
    State(sfu): State<MockSfu>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> StatusCode {
    sfu.record(Method::DELETE, format!("/resource/{}", id), &headers, "");
    StatusCode::OK
}

async fn start_sfu() -> (MockSfu, SocketAddr) {
    let sfu = MockSfu::default();
    let app = Router::new()
        .route("/whip", post(whip_post))
        .route("/whep", post(whep_post))
        .route("/resource/:id", patch(resource_patch).delete(resource_delete))
        .with_state(sfu.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (sfu, addr)
}

fn http_config() -> HttpClientConfig {
    HttpClientConfig {
        request_timeout_ms: 10_000,
        connect_timeout_ms: 2_000,
    }
}

#[tokio::test]
async fn test_whip_publish_trickle_and_teardown() {
    let (sfu, addr) = start_sfu().await;

    let client = WhipClient::with_http_config(
        WhipConfig {
            bearer_token: Some("secret".into()),
            ..WhipConfig::new(format!("http://{}/whip", addr))
        },
        &http_config(),
    )
    .unwrap();

    let answer = client.send_offer("v=0\r\nfake-offer\r\n").await.unwrap();
    assert_eq!(answer, ANSWER_SDP);
    assert!(client.is_connected());
    assert_eq!(
        client.resource_url().as_deref(),
        Some(format!("http://{}/resource/abc123", addr).as_str())
    );

    client
        .send_ice_candidate("candidate:1 1 UDP 2130706431 192.168.1.2 50000 typ host", "0")
        .await
        .unwrap();

    client.disconnect().await;
    assert!(!client.is_connected());
    client.disconnect().await;

    let requests = sfu.requests();
    assert_eq!(requests.len(), 3);

    assert_eq!(requests[0].method, Method::POST);
    assert_eq!(requests[0].content_type.as_deref(), Some("application/sdp"));
    assert_eq!(requests[0].authorization.as_deref(), Some("Bearer secret"));
    assert_eq!(requests[0].body, "v=0\r\nfake-offer\r\n");

    assert_eq!(requests[1].method, Method::PATCH);
    assert_eq!(requests[1].path, "/resource/abc123");
    assert_eq!(
        requests[1].content_type.as_deref(),
        Some("application/trickle-ice-sdpfrag")
    );
    assert!(requests[1].body.starts_with("a=candidate:1 1 UDP"));

    assert_eq!(requests[2].method, Method::DELETE);
    assert_eq!(requests[2].path, "/resource/abc123");
    assert_eq!(requests[2].authorization.as_deref(), Some("Bearer secret"));
}

#[tokio::test]
async fn test_whip_rejected_token() {
    let (sfu, addr) = start_sfu().await;

    let client = WhipClient::with_http_config(
        WhipConfig {
            bearer_token: Some("invalid-token".into()),
            ..WhipConfig::new(format!("http://{}/whip", addr))
        },
        &http_config(),
    )
    .unwrap();

    let err = client.send_offer("v=0\r\n").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);
    assert!(!err.is_transient());
    assert!(!client.is_connected());
    assert_eq!(client.resource_url(), None);

    // No resource was created, so nothing is deleted
    client.disconnect().await;
    assert_eq!(sfu.requests().len(), 1);
}

#[tokio::test]
async fn test_unreachable_endpoint_is_network_error() {
    // Bind then drop to get a port nobody listens on
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = WhipClient::with_http_config(
        WhipConfig::new(format!("http://{}/whip", addr)),
        &http_config(),
    )
    .unwrap();

    let err = client.send_offer("v=0\r\n").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Network);
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_whep_connect_with_real_peer() {
    let (sfu, addr) = start_sfu().await;

    let client = WhepClient::with_http_config(
        WhepConfig {
            mdns_mode: MdnsMode::Disabled,
            on_video_frame: Some(Arc::new(|_frame: MediaFrame| {})),
            ..WhepConfig::new(format!("http://{}/whep", addr))
        },
        &http_config(),
    )
    .await
    .unwrap();

    client.connect().await.unwrap();
    assert!(client.is_connected());
    assert_eq!(
        client.resource_url().as_deref(),
        Some(format!("http://{}/resource/def456", addr).as_str())
    );

    let posted = sfu.requests();
    assert_eq!(posted[0].method, Method::POST);
    assert!(posted[0].body.contains("m=video"));

    client.disconnect().await;
    assert!(!client.is_connected());

    let deletes: Vec<_> = sfu
        .requests()
        .into_iter()
        .filter(|r| r.method == Method::DELETE)
        .collect();
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].path, "/resource/def456");
}
