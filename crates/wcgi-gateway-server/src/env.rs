//! CGI environment construction.
//!
//! Builds the RFC 3875 environment map for one request: server and request
//! metadata, one `HTTP_<NAME>` variable per incoming header, content
//! metadata, inherited host variables, and caller-supplied extras.

use std::collections::BTreeMap;

use http::header::{CONTENT_TYPE, COOKIE, HOST};
use http::{HeaderMap, Method, Uri};

use crate::context::RequestContext;

/// Gateway identification reported to scripts.
const SERVER_SOFTWARE: &str = concat!("wcgi-gateway/", env!("CARGO_PKG_VERSION"));

/// Build the complete CGI environment for one request.
pub fn build_cgi_env(
    ctx: &RequestContext,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
) -> BTreeMap<String, String> {
    let root = if ctx.script_name.is_empty() {
        "/"
    } else {
        &ctx.script_name
    };

    let path = uri.path();
    let path_info = if root != "/" && path.starts_with(root) {
        &path[root.len()..]
    } else {
        path
    };

    let host = headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| uri.authority().map(|authority| authority.to_string()))
        .unwrap_or_default();

    let request_uri = uri
        .path_and_query()
        .map_or_else(|| uri.path().to_string(), |pq| pq.as_str().to_string());

    let mut env = BTreeMap::new();
    env.insert("SERVER_SOFTWARE".into(), SERVER_SOFTWARE.into());
    env.insert("SERVER_NAME".into(), host.clone());
    env.insert("SERVER_PROTOCOL".into(), "HTTP/1.1".into());
    env.insert("HTTP_HOST".into(), host.clone());
    env.insert("GATEWAY_INTERFACE".into(), "CGI/1.1".into());
    env.insert("REQUEST_METHOD".into(), method.as_str().into());
    env.insert("QUERY_STRING".into(), uri.query().unwrap_or("").into());
    env.insert("REQUEST_URI".into(), request_uri);
    env.insert("PATH_INFO".into(), path_info.into());
    env.insert("SCRIPT_NAME".into(), root.into());
    env.insert(
        "SCRIPT_FILENAME".into(),
        ctx.script_path.display().to_string(),
    );
    env.insert("SERVER_PORT".into(), trailing_port(&host));

    if let Some(remote) = ctx.remote_addr {
        env.insert("REMOTE_ADDR".into(), remote.ip().to_string());
        env.insert("REMOTE_HOST".into(), remote.ip().to_string());
        env.insert("REMOTE_PORT".into(), remote.port().to_string());
    }

    if ctx.tls {
        env.insert("HTTPS".into(), "on".into());
    }

    for name in headers.keys() {
        let cgi_name: String = name.as_str().chars().map(upper_case_underscore).collect();
        if cgi_name == "PROXY" {
            continue;
        }
        let join = if *name == COOKIE { "; " } else { ", " };
        let value = headers
            .get_all(name)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .collect::<Vec<_>>()
            .join(join);
        env.insert(format!("HTTP_{cgi_name}"), value);
    }

    if let Some(length) = content_length(headers) {
        if length > 0 {
            env.insert("CONTENT_LENGTH".into(), length.to_string());
        }
    }
    if let Some(ctype) = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        env.insert("CONTENT_TYPE".into(), ctype.into());
    }

    for name in &ctx.inherit_env {
        if let Ok(value) = std::env::var(name) {
            if !value.is_empty() {
                env.insert(name.clone(), value);
            }
        }
    }

    for (key, value) in &ctx.extra_env {
        env.insert(key.clone(), value.clone());
    }

    env
}

/// Extract the port from a `host[:port]` string, defaulting to 80.
fn trailing_port(host: &str) -> String {
    if let Some((_, port)) = host.rsplit_once(':') {
        if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) {
            return port.to_string();
        }
    }
    "80".into()
}

/// Header-name character mapping per the CGI convention: upper-cased, with
/// `-` (and the environment-hostile `=`) replaced by `_`.
fn upper_case_underscore(c: char) -> char {
    match c {
        'a'..='z' => c.to_ascii_uppercase(),
        '-' | '=' => '_',
        _ => c,
    }
}

/// Declared request body length, if parseable.
fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(http::header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}
