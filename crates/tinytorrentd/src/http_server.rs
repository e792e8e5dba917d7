//! HTTP/WS Server (C8) — spec section 4.5.
//!
//! Router wiring and middleware layering follow
//! `librqbit::http_api::HttpApi::make_http_api_and_run` directly: a
//! `CorsLayer` built from an `AllowOrigin::predicate`, a `TraceLayer` with a
//! custom span, `.with_state(...)`, then `axum::serve`. What's new here is
//! the auth gate (the teacher's HTTP API has none — it assumes a trusted
//! LAN) and the WebSocket sync loop (the teacher has no equivalent; built
//! from `axum_extract::WebSocketUpgrade` the way `Dastari-librarian`'s
//! GraphQL-subscription endpoint wires one up).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error_span, info, warn};

use crate::dispatcher;
use crate::engine::EngineHandle;
use crate::error::{DaemonError, Kind};
use crate::events::{DaemonEvent, EventBus};
use crate::wire::{RpcRequest, WsServerMessage};

/// Transmission clients without a valid `X-Transmission-Session-Id` get
/// rejected with this status and a fresh id to retry with (spec section
/// 4.5, Transmission RPC v17 compatibility requirement).
const CSRF_HEADER: &str = "x-transmission-session-id";
const AUTH_HEADER: &str = "x-tt-auth";
const PATCH_DEBOUNCE: Duration = Duration::from_millis(200);
/// Spec section 4.5: "send pings periodically; drop clients that fail to
/// respond within a bounded window." The window is a small multiple of the
/// cadence so one missed tick under load doesn't drop an otherwise-live client.
const WS_PING_INTERVAL: Duration = Duration::from_secs(15);
const WS_PONG_TIMEOUT: Duration = Duration::from_secs(45);

#[derive(Clone)]
pub struct AppState {
    pub engine: EngineHandle,
    pub events: EventBus,
    pub token: Arc<str>,
    pub session_id: Arc<str>,
}

/// Spec section 4.5 gates *every* HTTP request behind loopback+token auth,
/// static UI assets included — there is no unauthenticated route. The auth
/// middleware therefore wraps the whole router, fallback route and all,
/// rather than just the two API endpoints.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/transmission/rpc", post(rpc_handler))
        .route("/ws", get(ws_handler))
        .fallback(crate::assets::serve_ui)
        .layer(middleware::from_fn_with_state(state.clone(), auth_guard))
        .layer(cors_layer())
        .layer(
            TraceLayer::new_for_http().make_span_with(|req: &Request| {
                error_span!("request", method = %req.method(), uri = %req.uri())
            }),
        )
        .with_state(state)
}

pub async fn run(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    let app = build_router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app).await?;
    Ok(())
}

fn cors_layer() -> CorsLayer {
    CorsLayer::default()
        .allow_origin(AllowOrigin::predicate(|origin, _| is_loopback_origin(origin)))
        .allow_headers(tower_http::cors::AllowHeaders::list([
            axum::http::header::CONTENT_TYPE,
            AUTH_HEADER.parse().unwrap(),
            CSRF_HEADER.parse().unwrap(),
        ]))
}

/// Spec section 4.5: `Origin`, if present, must match the native app scheme
/// or a trusted loopback origin; `file://` is tolerated; opaque origins
/// (serialized as the literal string `"null"`) are rejected, not waved
/// through.
fn is_loopback_origin(origin: &HeaderValue) -> bool {
    let Ok(s) = origin.to_str() else { return false };
    s.starts_with("tt-app://")
        || s.starts_with("file://")
        || s.starts_with("http://localhost")
        || s.starts_with("http://127.0.0.1")
        || s.starts_with("http://[::1]")
}

fn host_is_loopback_alias(headers: &HeaderMap) -> bool {
    let Some(host) = headers.get(axum::http::header::HOST).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let host = host.split(':').next().unwrap_or(host);
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}

fn extract_token(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    if let Some(v) = headers.get(AUTH_HEADER).and_then(|v| v.to_str().ok()) {
        return Some(v.to_string());
    }
    query_token.map(str::to_string)
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Rejects anything that didn't arrive over loopback with a valid token,
/// before the request reaches either the RPC handler or the WS upgrade
/// (spec section 4.5: "every transport, not just HTTP, is gated").
///
/// Status codes differ by transport per spec section 4.5/8: a non-loopback
/// `Host` is always 403, but a missing/invalid token is 401 for plain HTTP
/// and 403 for the WS upgrade (the handshake is refused before accept,
/// never a 401).
async fn auth_guard(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let is_ws = req.uri().path() == "/ws";

    if !host_is_loopback_alias(req.headers()) {
        return StatusCode::FORBIDDEN.into_response();
    }

    let query_token = req
        .uri()
        .query()
        .and_then(|q| serde_urlencoded::from_str::<TokenQuery>(q).ok())
        .and_then(|q| q.token);

    let ok = extract_token(req.headers(), query_token.as_deref())
        .map(|t| constant_time_eq(t.as_bytes(), state.token.as_bytes()))
        .unwrap_or(false);

    if !ok {
        let status = if is_ws {
            StatusCode::FORBIDDEN
        } else {
            StatusCode::UNAUTHORIZED
        };
        return (status, "missing or invalid auth token").into_response();
    }

    next.run(req).await
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

async fn rpc_handler(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let supplied = headers
        .get(CSRF_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if supplied != state.session_id.as_ref() {
        let mut response = (StatusCode::CONFLICT, "X-Transmission-Session-Id header required")
            .into_response();
        response.headers_mut().insert(
            CSRF_HEADER,
            HeaderValue::from_str(&state.session_id).unwrap(),
        );
        return response;
    }

    if body.is_empty() {
        let err = DaemonError::new(Kind::EmptyPayload, "empty RPC payload");
        return Json(err.to_rpc_body(None)).into_response();
    }

    // Parsed manually rather than via the `Json` extractor: malformed bodies
    // still get a 200 with `{result:"error"}` (spec section 7), not axum's
    // default 400 rejection.
    let request: RpcRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            let err = DaemonError::with_source(Kind::InvalidJson, "invalid request body", e.into());
            return Json(err.to_rpc_body(None)).into_response();
        }
    };

    Json(dispatcher::dispatch(&state.engine, request).await).into_response()
}

#[derive(Deserialize)]
struct WsQuery {
    #[allow(dead_code)]
    token: Option<String>,
}

async fn ws_handler(
    State(state): State<AppState>,
    Query(_query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let snapshot = state.engine.latest();
    let greeting = WsServerMessage::SyncSnapshot {
        sequence: snapshot.sequence,
        data: serde_json::to_value(&*snapshot).unwrap_or(json!(null)),
    };
    if send_message(&mut socket, &greeting).await.is_err() {
        return;
    }

    let mut patches = state.engine.subscribe_patches();
    let mut events = state.events.subscribe();
    let mut debounce = tokio::time::interval(PATCH_DEBOUNCE);
    debounce.tick().await; // first tick fires immediately; consume it
    let mut pending_patch = None;

    let mut ping_tick = tokio::time::interval(WS_PING_INTERVAL);
    ping_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_tick.tick().await;
    let mut last_pong = tokio::time::Instant::now();

    loop {
        tokio::select! {
            biased;

            incoming = socket.recv() => {
                match incoming {
                    None => break,
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = tokio::time::Instant::now();
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(error = %err, "websocket read error");
                        break;
                    }
                }
            }

            _ = ping_tick.tick() => {
                if last_pong.elapsed() > WS_PONG_TIMEOUT {
                    warn!("websocket client failed to respond to ping within bound, dropping");
                    break;
                }
                if socket.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }

            patch = patches.recv() => {
                match patch {
                    Ok(patch) => pending_patch = Some(patch),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "ws client fell behind patch stream");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }

            _ = debounce.tick() => {
                if let Some(patch) = pending_patch.take() {
                    let message = WsServerMessage::SyncPatch {
                        sequence: patch.sequence,
                        data: serde_json::to_value(&*patch).unwrap_or(json!(null)),
                    };
                    if send_message(&mut socket, &message).await.is_err() {
                        break;
                    }
                }
            }

            event = events.recv() => {
                match event {
                    Ok(DaemonEvent::SettingsChanged) => {
                        let message = WsServerMessage::Event { name: "settings-changed", data: json!({}) };
                        if send_message(&mut socket, &message).await.is_err() { break; }
                    }
                    Ok(DaemonEvent::TorrentsDirty(hashes)) => {
                        let message = WsServerMessage::Event {
                            name: "torrents-dirty",
                            data: json!({ "info_hashes": hashes }),
                        };
                        if send_message(&mut socket, &message).await.is_err() { break; }
                    }
                    Ok(DaemonEvent::Shutdown) => {
                        let message = WsServerMessage::Event { name: "app-shutdown", data: json!({}) };
                        let _ = send_message(&mut socket, &message).await;
                        break;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    info!("websocket client disconnected");
}

async fn send_message(socket: &mut WebSocket, message: &WsServerMessage) -> Result<(), axum::Error> {
    let text = serde_json::to_string(message).unwrap_or_default();
    socket.send(Message::Text(text.into())).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with_host(host: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::HOST, HeaderValue::from_str(host).unwrap());
        headers
    }

    #[test]
    fn loopback_host_aliases_accepted() {
        assert!(host_is_loopback_alias(&headers_with_host("127.0.0.1:51413")));
        assert!(host_is_loopback_alias(&headers_with_host("localhost")));
        assert!(host_is_loopback_alias(&headers_with_host("::1")));
    }

    #[test]
    fn non_loopback_host_rejected() {
        assert!(!host_is_loopback_alias(&headers_with_host("example.com")));
        assert!(!host_is_loopback_alias(&headers_with_host("192.168.1.5:9091")));
    }

    #[test]
    fn opaque_origin_is_rejected_but_file_and_app_scheme_tolerated() {
        assert!(!is_loopback_origin(&HeaderValue::from_static("null")));
        assert!(is_loopback_origin(&HeaderValue::from_static("file://")));
        assert!(is_loopback_origin(&HeaderValue::from_static("tt-app://main")));
        assert!(is_loopback_origin(&HeaderValue::from_static("http://127.0.0.1:5173")));
        assert!(!is_loopback_origin(&HeaderValue::from_static("http://evil.example")));
    }

    #[test]
    fn constant_time_eq_matches_only_identical_tokens() {
        assert!(constant_time_eq(b"abc123", b"abc123"));
        assert!(!constant_time_eq(b"abc123", b"abc124"));
        assert!(!constant_time_eq(b"short", b"longerstring"));
    }

    #[test]
    fn extract_token_prefers_header_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTH_HEADER, HeaderValue::from_static("header-token"));
        assert_eq!(
            extract_token(&headers, Some("query-token")),
            Some("header-token".to_string())
        );
        assert_eq!(
            extract_token(&HeaderMap::new(), Some("query-token")),
            Some("query-token".to_string())
        );
        assert_eq!(extract_token(&HeaderMap::new(), None), None);
    }
}

/// Router-level tests (spec section 8 scenarios 1/3): drives the real
/// `build_router` output through `tower::ServiceExt::oneshot`, the same
/// in-process request style `VannaDii-Revaer`'s `http::auth` tests use,
/// rather than opening a real socket.
#[cfg(test)]
mod router_tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    const TOKEN: &str = "test-token-0123456789abcdef";
    const SESSION_ID: &str = "test-session-id";

    async fn test_state() -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().unwrap();
        let repo: Arc<dyn crate::persistence::PersistenceRepository> = Arc::new(
            crate::persistence::SqlitePersistenceRepository::open(dir.path())
                .await
                .unwrap(),
        );
        let events = EventBus::new();
        let config = Arc::new(crate::config::ConfigurationService::new(
            crate::config::CoreSettings::default(),
            events.clone(),
        ));
        let (engine, _consumer) = EngineHandle::for_test(config, repo);
        let state = AppState {
            engine,
            events,
            token: Arc::from(TOKEN),
            session_id: Arc::from(SESSION_ID),
        };
        (dir, state)
    }

    fn rpc_request(body: serde_json::Value, token: Option<&str>, session_id: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/transmission/rpc")
            .header(axum::http::header::HOST, "127.0.0.1:51413")
            .header(axum::http::header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(AUTH_HEADER, token);
        }
        if let Some(session_id) = session_id {
            builder = builder.header(CSRF_HEADER, session_id);
        }
        builder.body(Body::from(serde_json::to_vec(&body).unwrap())).unwrap()
    }

    #[tokio::test]
    async fn missing_token_rejected_with_401() {
        let (_dir, state) = test_state().await;
        let router = build_router(state);
        let req = rpc_request(json!({"method": "tt-get-capabilities"}), None, Some(SESSION_ID));
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wrong_token_rejected_with_401() {
        let (_dir, state) = test_state().await;
        let router = build_router(state);
        let req = rpc_request(json!({"method": "tt-get-capabilities"}), Some("nope"), Some(SESSION_ID));
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn non_loopback_host_rejected_with_403_even_with_valid_token() {
        let (_dir, state) = test_state().await;
        let router = build_router(state);
        let req = Request::builder()
            .method("POST")
            .uri("/transmission/rpc")
            .header(axum::http::header::HOST, "evil.example")
            .header(AUTH_HEADER, TOKEN)
            .header(CSRF_HEADER, SESSION_ID)
            .body(Body::from(
                serde_json::to_vec(&json!({"method": "tt-get-capabilities"})).unwrap(),
            ))
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn missing_session_id_gets_409_with_fresh_session_header() {
        let (_dir, state) = test_state().await;
        let router = build_router(state);
        let req = rpc_request(json!({"method": "tt-get-capabilities"}), Some(TOKEN), None);
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(
            resp.headers().get(CSRF_HEADER).unwrap().to_str().unwrap(),
            SESSION_ID
        );
    }

    #[tokio::test]
    async fn valid_request_dispatches_and_returns_success() {
        let (_dir, state) = test_state().await;
        let router = build_router(state);
        let req = rpc_request(
            json!({"method": "tt-get-capabilities"}),
            Some(TOKEN),
            Some(SESSION_ID),
        );
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["result"], "success");
        assert_eq!(json["arguments"]["rpc-version"], 17);
    }

    #[tokio::test]
    async fn empty_torrent_get_returns_empty_list() {
        // spec section 8 scenario 1: new data dir, no torrents added yet.
        let (_dir, state) = test_state().await;
        let router = build_router(state);
        let req = rpc_request(
            json!({"method": "torrent-get", "arguments": {"fields": ["hashString"]}}),
            Some(TOKEN),
            Some(SESSION_ID),
        );
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["result"], "success");
        assert_eq!(json["arguments"]["torrents"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn torrent_get_projects_requested_fields_and_uses_camel_case_keys() {
        use crate::snapshot::{ErrorSubKind, SessionSnapshot, TorrentSnapshot, TorrentStatus};

        let (_dir, state) = test_state().await;
        state.engine.publish_for_test(SessionSnapshot {
            sequence: 1,
            session: Default::default(),
            torrents: vec![TorrentSnapshot {
                id: 1,
                info_hash: "a".repeat(40),
                name: "test torrent".to_string(),
                status: TorrentStatus::Downloading,
                error_kind: ErrorSubKind::None,
                error_code: None,
                error_message: None,
                rate_down_bps: 0,
                rate_up_bps: 0,
                downloaded_bytes: 0,
                uploaded_bytes: 0,
                percent_complete: 0.0,
                metadata_percent_complete: 1.0,
                labels: vec![],
                sequential_download: false,
                super_seeding: false,
                paused: false,
                rehash_active: false,
                rehash_start_count: 0,
                rehash_complete_count: 0,
                tracker_announces: 0,
                dht_replies: 0,
                peer_connections: 0,
                save_path: "/tmp".to_string(),
            }],
        });
        let router = build_router(state);
        let req = rpc_request(
            json!({"method": "torrent-get", "arguments": {"fields": ["hashString"]}}),
            Some(TOKEN),
            Some(SESSION_ID),
        );
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let torrents = json["arguments"]["torrents"].as_array().unwrap();
        assert_eq!(torrents.len(), 1);
        let torrent = torrents[0].as_object().unwrap();
        assert_eq!(torrent.len(), 1);
        assert_eq!(torrent["hashString"], "a".repeat(40));
        assert!(torrent.get("info_hash").is_none());
    }

    #[tokio::test]
    async fn empty_rpc_body_is_rejected_without_crossing_into_invalid_json() {
        let (_dir, state) = test_state().await;
        let router = build_router(state);
        let req = Request::builder()
            .method("POST")
            .uri("/transmission/rpc")
            .header(axum::http::header::HOST, "127.0.0.1")
            .header(AUTH_HEADER, TOKEN)
            .header(CSRF_HEADER, SESSION_ID)
            .body(Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["result"], "error");
        assert_eq!(json["arguments"]["message"], "empty RPC payload");
    }

    #[tokio::test]
    async fn static_asset_fallback_serves_index_html_with_nosniff() {
        let (_dir, state) = test_state().await;
        let router = build_router(state);
        let req = Request::builder()
            .method("GET")
            .uri("/some/spa/route")
            .header(axum::http::header::HOST, "127.0.0.1")
            .header(AUTH_HEADER, TOKEN)
            .body(Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );
    }
}
