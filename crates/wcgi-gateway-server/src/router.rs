//! HTTP router configuration.
//!
//! Every path falls through to the script handler; the only reserved route
//! is the health check.

use std::time::Duration;

use axum::Router;
use axum::routing::get;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handler::{handle_script, health_check};
use crate::state::AppState;

/// Build the application router.
///
/// Routes:
/// - `GET /healthz` - Health check
/// - anything else  - Resolved against the document root and executed
pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .fallback(handle_script)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(request_timeout))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use tower::util::ServiceExt;

    use async_trait::async_trait;
    use wcgi_gateway_common::{EngineError, GatewayConfig};
    use wcgi_gateway_core::engine::{CompiledScript, ScriptEngine};

    struct NullEngine;

    #[async_trait]
    impl ScriptEngine for NullEngine {
        async fn compile(
            &self,
            _bytes: Vec<u8>,
        ) -> Result<Arc<dyn CompiledScript>, EngineError> {
            Err(EngineError::compilation("null engine"))
        }
    }

    fn router() -> Router {
        let state = AppState::new(GatewayConfig::default(), Arc::new(NullEngine));
        build_router(state, Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = router();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_script_is_not_found() {
        let app = router();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/no-such-script.wasm")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
