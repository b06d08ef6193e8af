//! Request handlers for script execution.
//!
//! The catch-all handler resolves the requested path to a script under the
//! configured document root, builds the per-request context, and hands the
//! request to the gateway. Errors map onto the gateway's taxonomy: missing
//! script and directory paths are 404s, chunked bodies 400, everything else
//! a logged 500.

use std::net::SocketAddr;
use std::path::PathBuf;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use http::Request;
use tracing::{debug, error, instrument};
use uuid::Uuid;

use wcgi_gateway_common::GatewayError;

use crate::context::{ForwardedClient, RequestContext};
use crate::state::AppState;

/// Execute the script a request resolves to.
#[instrument(skip(state, req), fields(request_id = %Uuid::new_v4(), path = %req.uri().path()))]
pub async fn handle_script(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    req: Request<Body>,
) -> Response {
    let config = state.config();

    let Some(script_path) = resolve_script_path(&config.scripts.document_root, req.uri().path())
    else {
        return error_response(StatusCode::NOT_FOUND, "script not found");
    };

    // Internally redirected requests carry the original client's facts.
    let forwarded = req.extensions().get::<ForwardedClient>().copied();
    let tls = forwarded.map_or_else(|| is_forwarded_https(req.headers()), |f| f.tls);
    let remote_addr = forwarded
        .and_then(|f| f.remote_addr)
        .or(connect_info.map(|ConnectInfo(addr)| addr));

    let mut ctx = RequestContext::new(&config.scripts, script_path).with_tls(tls);
    if let Some(addr) = remote_addr {
        ctx = ctx.with_remote_addr(addr);
    }

    match state.gateway().handle(ctx, req).await {
        Ok(response) => response,
        Err(error) => error_to_response(&error),
    }
}

/// Health check handler.
///
/// Returns 200 OK if the server is running.
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Map a gateway error onto an HTTP response.
fn error_to_response(error: &GatewayError) -> Response {
    let status = match error {
        GatewayError::ScriptNotFound { .. } | GatewayError::ScriptIsDirectory { .. } => {
            StatusCode::NOT_FOUND
        }
        GatewayError::ChunkedBody => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status.is_server_error() {
        error!(%error, "request failed");
    } else {
        debug!(%error, "request rejected");
    }

    error_response(status, &error.to_string())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, message.to_string()).into_response()
}

/// Resolve a request path against the document root.
///
/// Rejects any path that tries to climb out of the root.
fn resolve_script_path(document_root: &str, uri_path: &str) -> Option<PathBuf> {
    let mut path = PathBuf::from(document_root);
    for segment in uri_path.split('/') {
        match segment {
            "" | "." => {}
            ".." => return None,
            segment => path.push(segment),
        }
    }
    Some(path)
}

/// A TLS-terminating front end marks encrypted connections this way.
fn is_forwarded_https(headers: &http::HeaderMap) -> bool {
    headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|proto| proto.eq_ignore_ascii_case("https"))
}
