//! Integration tests for the gateway core.
//!
//! These drive `Gateway::handle` end to end over the scriptable mock
//! engine: classic CGI parsing, redirect resolution, tunnel proxying,
//! compile-once caching, fingerprint invalidation, and idle eviction.

mod support;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use axum::body::Body;
use http::header::{CONTENT_TYPE, LOCATION, TRANSFER_ENCODING};
use http::{Method, Request, Response, StatusCode, Uri};
use tempfile::TempDir;

use support::MockEngine;
use wcgi_gateway_common::{CacheConfig, CgiError, GatewayError, ScriptConfig};
use wcgi_gateway_server::{ForwardedClient, Gateway, RedirectDelegate, RequestContext};

// ============================================================================
// Helpers
// ============================================================================

fn write_script(dir: &TempDir, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path
}

fn bump_mtime(path: &Path) {
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(5))
        .unwrap();
}

fn context(dir: &TempDir, script: &Path) -> RequestContext {
    let config = ScriptConfig {
        document_root: dir.path().display().to_string(),
        ..ScriptConfig::default()
    };
    RequestContext::new(&config, script.to_path_buf())
        .with_remote_addr("10.0.0.9:40000".parse().unwrap())
}

fn gateway(engine: Arc<MockEngine>) -> Gateway {
    gateway_with_idle(engine, 60)
}

fn gateway_with_idle(engine: Arc<MockEngine>, idle_timeout_secs: u64) -> Gateway {
    Gateway::new(engine, &CacheConfig { idle_timeout_secs })
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(http::header::CONTENT_LENGTH, body.len())
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_string(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Wait for an asynchronous teardown to become observable.
async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not met: {what}");
}

// ============================================================================
// Classic CGI bridge
// ============================================================================

#[tokio::test]
async fn test_classic_response_roundtrip() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "app.wasm", b"Content-Type: text/plain\r\n\r\nhello");
    let gateway = gateway(MockEngine::classic());

    let response = gateway
        .handle(context(&dir, &script), get("/app.wasm"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "text/plain");
    assert_eq!(body_string(response).await, "hello");
}

#[tokio::test]
async fn test_status_only_response() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "app.wasm", b"Status: 404\r\n\r\n");
    let gateway = gateway(MockEngine::classic());

    let response = gateway
        .handle(context(&dir, &script), get("/app.wasm"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(response.headers().get(CONTENT_TYPE).is_none());
    assert_eq!(body_string(response).await, "");
}

#[tokio::test]
async fn test_output_without_blank_line_fails() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "app.wasm", b"Content-Type: text/plain\r\n");
    let gateway = gateway(MockEngine::classic());

    let result = gateway.handle(context(&dir, &script), get("/app.wasm")).await;

    assert!(matches!(
        result,
        Err(GatewayError::Cgi(CgiError::NoHeaders))
    ));
}

#[tokio::test]
async fn test_missing_content_type_fails() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "app.wasm", b"X-Custom: yes\r\n\r\nbody");
    let gateway = gateway(MockEngine::classic());

    let result = gateway.handle(context(&dir, &script), get("/app.wasm")).await;

    assert!(matches!(
        result,
        Err(GatewayError::Cgi(CgiError::MissingContentType))
    ));
}

#[tokio::test]
async fn test_post_body_reaches_stdin() {
    let dir = TempDir::new().unwrap();
    // The mock echoes stdin after the scripted output.
    let script = write_script(&dir, "app.wasm", b"Content-Type: text/plain\r\n\r\n");
    let gateway = gateway(MockEngine::classic());

    let response = gateway
        .handle(context(&dir, &script), post("/app.wasm", "ping"))
        .await
        .unwrap();

    assert_eq!(body_string(response).await, "ping");
}

#[tokio::test]
async fn test_chunked_body_rejected() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "app.wasm", b"Content-Type: text/plain\r\n\r\n");
    let gateway = gateway(MockEngine::classic());

    let req = Request::builder()
        .method(Method::POST)
        .uri("/app.wasm")
        .header(TRANSFER_ENCODING, "chunked")
        .body(Body::from("body"))
        .unwrap();

    let result = gateway.handle(context(&dir, &script), req).await;
    assert!(matches!(result, Err(GatewayError::ChunkedBody)));
}

#[tokio::test]
async fn test_script_not_found() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("missing.wasm");
    let gateway = gateway(MockEngine::classic());

    let result = gateway.handle(context(&dir, &missing), get("/missing.wasm")).await;
    assert!(matches!(result, Err(GatewayError::ScriptNotFound { .. })));
}

#[tokio::test]
async fn test_script_is_directory() {
    let dir = TempDir::new().unwrap();
    let sub = dir.path().join("sub");
    std::fs::create_dir(&sub).unwrap();
    let gateway = gateway(MockEngine::classic());

    let result = gateway.handle(context(&dir, &sub), get("/sub")).await;
    assert!(matches!(result, Err(GatewayError::ScriptIsDirectory { .. })));
}

// ============================================================================
// Redirect handling
// ============================================================================

struct Recorder {
    seen: Mutex<Option<(Method, Uri, bool)>>,
}

#[async_trait]
impl RedirectDelegate for Recorder {
    async fn dispatch(&self, req: Request<Body>) -> Response<Body> {
        let forwarded = req.extensions().get::<ForwardedClient>().is_some();
        *self.seen.lock().unwrap() = Some((req.method().clone(), req.uri().clone(), forwarded));
        Response::new(Body::from("redirected"))
    }
}

#[tokio::test]
async fn test_local_redirect_without_delegate_is_302() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "app.wasm", b"Location: /new\r\n\r\n");
    let gateway = gateway(MockEngine::classic());

    let response = gateway
        .handle(context(&dir, &script), get("/app.wasm"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(response.headers().get(LOCATION).unwrap(), "/new");
}

#[tokio::test]
async fn test_local_redirect_with_delegate_dispatches_internally() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "app.wasm", b"Location: /new\r\n\r\n");
    let recorder = Arc::new(Recorder {
        seen: Mutex::new(None),
    });
    let gateway = gateway(MockEngine::classic()).with_redirect(recorder.clone());

    let response = gateway
        .handle(context(&dir, &script), get("/app.wasm"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "redirected");

    let (method, uri, forwarded) = recorder.seen.lock().unwrap().clone().unwrap();
    assert_eq!(method, Method::GET);
    assert_eq!(uri, Uri::from_static("/new"));
    assert!(forwarded, "synthetic request should carry client facts");
}

#[tokio::test]
async fn test_absolute_redirect_passes_through() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "app.wasm", b"Location: https://example.com/\r\n\r\n");
    let recorder = Arc::new(Recorder {
        seen: Mutex::new(None),
    });
    let gateway = gateway(MockEngine::classic()).with_redirect(recorder.clone());

    let response = gateway
        .handle(context(&dir, &script), get("/app.wasm"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FOUND);
    assert!(recorder.seen.lock().unwrap().is_none());
}

// ============================================================================
// Lifecycle cache
// ============================================================================

#[tokio::test]
async fn test_compile_once_under_concurrent_load() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "app.wasm", b"Content-Type: text/plain\r\n\r\nok");
    let engine = MockEngine::classic();
    let gateway = Arc::new(gateway(engine.clone()));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let gateway = gateway.clone();
        let ctx = context(&dir, &script);
        handles.push(tokio::spawn(async move {
            gateway.handle(ctx, get("/app.wasm")).await.unwrap()
        }));
    }
    for handle in handles {
        let response = handle.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    assert_eq!(engine.compile_count(), 1);
    assert_eq!(gateway.cached_modules(), 1);
    assert_eq!(gateway.live_instances(), 1);
}

#[tokio::test]
async fn test_fingerprint_invalidation_recompiles() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "app.wasm", b"Content-Type: text/plain\r\n\r\nv1");
    let engine = MockEngine::classic();
    let gateway = gateway(engine.clone());

    let response = gateway
        .handle(context(&dir, &script), get("/app.wasm"))
        .await
        .unwrap();
    assert_eq!(body_string(response).await, "v1");
    assert_eq!(engine.compile_count(), 1);

    std::fs::write(&script, b"Content-Type: text/plain\r\n\r\nv2").unwrap();
    bump_mtime(&script);

    let response = gateway
        .handle(context(&dir, &script), get("/app.wasm"))
        .await
        .unwrap();
    assert_eq!(body_string(response).await, "v2");
    assert_eq!(engine.compile_count(), 2);
    // The superseded module was released, not accumulated.
    assert_eq!(gateway.cached_modules(), 1);
}

#[tokio::test]
async fn test_compile_failure_is_not_cached() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "app.wasm", b"Content-Type: text/plain\r\n\r\nok");
    let engine = MockEngine::classic();
    let gateway = gateway(engine.clone());

    engine.set_fail_compile(true);
    let result = gateway.handle(context(&dir, &script), get("/app.wasm")).await;
    assert!(matches!(result, Err(GatewayError::Engine(_))));
    assert_eq!(gateway.cached_modules(), 0);

    engine.set_fail_compile(false);
    let response = gateway
        .handle(context(&dir, &script), get("/app.wasm"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(engine.compile_count(), 1);
}

#[tokio::test]
async fn test_execution_failure_evicts_module() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "app.wasm", b"Content-Type: text/plain\r\n\r\nok");
    let engine = MockEngine::classic();
    let gateway = Arc::new(gateway(engine.clone()));

    engine.set_trap(true);
    let result = gateway.handle(context(&dir, &script), get("/app.wasm")).await;
    // A trapped instance produced no output at all.
    assert!(matches!(
        result,
        Err(GatewayError::Cgi(CgiError::NoHeaders))
    ));

    let gw = gateway.clone();
    eventually("module evicted after trap", move || {
        gw.cached_modules() == 0
    })
    .await;

    engine.set_trap(false);
    let response = gateway
        .handle(context(&dir, &script), get("/app.wasm"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(engine.compile_count(), 2);
}

// ============================================================================
// WCGI tunnel
// ============================================================================

#[tokio::test]
async fn test_tunnel_roundtrip() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "app.wasm", b"persistent");
    let engine = MockEngine::tunnel();
    let gateway = gateway(engine.clone());

    let response = gateway
        .handle(context(&dir, &script), get("/app.wasm?x=1"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "echo:/app.wasm:");
    assert_eq!(engine.live_instances(), 1);
    assert_eq!(gateway.cached_sessions(), 1);
}

#[tokio::test]
async fn test_tunnel_session_reused_across_requests() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "app.wasm", b"persistent");
    let engine = MockEngine::tunnel();
    let gateway = gateway(engine.clone());

    for _ in 0..3 {
        let response = gateway
            .handle(context(&dir, &script), get("/app.wasm"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    assert_eq!(engine.compile_count(), 1);
    assert_eq!(engine.live_instances(), 1, "one instance serves all requests");
    assert_eq!(gateway.cached_sessions(), 1);
}

#[tokio::test]
async fn test_concurrent_requests_use_independent_streams() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "app.wasm", b"persistent");
    let engine = MockEngine::tunnel();
    let gateway = Arc::new(gateway(engine.clone()));

    // The slow stream is opened first but answers last; each request must
    // still receive exactly its own stream's response.
    let slow = {
        let gateway = gateway.clone();
        let ctx = context(&dir, &script);
        tokio::spawn(async move {
            gateway
                .handle(ctx, post("/app.wasm/slow", "alpha"))
                .await
                .unwrap()
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let fast = {
        let gateway = gateway.clone();
        let ctx = context(&dir, &script);
        tokio::spawn(async move {
            gateway
                .handle(ctx, post("/app.wasm", "beta"))
                .await
                .unwrap()
        })
    };

    let fast_body = body_string(fast.await.unwrap()).await;
    let slow_body = body_string(slow.await.unwrap()).await;

    assert_eq!(fast_body, "echo:/app.wasm:beta");
    assert_eq!(slow_body, "echo:/app.wasm/slow:alpha");
    assert_eq!(engine.live_instances(), 1, "both streams shared one session");
}

#[tokio::test]
async fn test_force_classic_overrides_capability() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "app.wasm", b"Content-Type: text/plain\r\n\r\nclassic");
    let engine = MockEngine::tunnel();
    let gateway = gateway(engine.clone());

    let mut ctx = context(&dir, &script);
    ctx.force_classic = true;

    let response = gateway.handle(ctx, get("/app.wasm")).await.unwrap();

    assert_eq!(body_string(response).await, "classic");
    assert_eq!(gateway.cached_sessions(), 0);
}

#[tokio::test]
async fn test_idle_eviction_closes_session() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "app.wasm", b"persistent");
    let engine = MockEngine::tunnel();
    let gateway = Arc::new(gateway_with_idle(engine.clone(), 1));

    let response = gateway
        .handle(context(&dir, &script), get("/app.wasm"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(engine.live_instances(), 1);

    let gw = gateway.clone();
    let eng = engine.clone();
    eventually("idle session torn down", move || {
        eng.live_instances() == 0 && gw.cached_sessions() == 0 && gw.live_instances() == 0
    })
    .await;
}

#[tokio::test]
async fn test_invalidation_replaces_session() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "app.wasm", b"persistent");
    let engine = MockEngine::tunnel();
    let gateway = gateway(engine.clone());

    let response = gateway
        .handle(context(&dir, &script), get("/app.wasm"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    std::fs::write(&script, b"persistent-v2").unwrap();
    bump_mtime(&script);

    let response = gateway
        .handle(context(&dir, &script), get("/app.wasm"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(engine.compile_count(), 2);
    assert_eq!(gateway.cached_sessions(), 1);

    // The superseded instance must not keep running alongside the new one.
    let eng = engine.clone();
    eventually("old instance stopped", move || eng.live_instances() == 1).await;
}

#[tokio::test]
async fn test_shutdown_closes_all_sessions() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "app.wasm", b"persistent");
    let engine = MockEngine::tunnel();
    let gateway = Arc::new(gateway(engine.clone()));

    gateway
        .handle(context(&dir, &script), get("/app.wasm"))
        .await
        .unwrap();
    assert_eq!(engine.live_instances(), 1);

    gateway.shut_down();

    let eng = engine.clone();
    let gw = gateway.clone();
    eventually("all sessions closed", move || {
        eng.live_instances() == 0 && gw.cached_sessions() == 0
    })
    .await;
}
