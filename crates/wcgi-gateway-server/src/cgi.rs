//! Classic one-shot CGI bridge.
//!
//! Translates one HTTP request into one module execution with CGI-standard
//! environment variables, then parses the module's standard-output byte
//! stream — header lines, a blank line, then the body — back into an HTTP
//! response.
//!
//! Parsing is streaming and line-oriented with a fixed line-buffer limit.
//! A malformed header line or invalid header name is logged and skipped; a
//! bad `Status:` value, an over-long line, or output that ends before the
//! blank-line terminator aborts the request with a 500. Once the status
//! line is committed the remaining output streams verbatim, and later
//! failures are logged only.

use std::io::Cursor;
use std::sync::Arc;

use axum::body::Body;
use bytes::BytesMut;
use http::header::{CONTENT_TYPE, LOCATION, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode, Uri};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::io::ReaderStream;
use tracing::{error, warn};

use wcgi_gateway_common::{CgiError, GatewayError};
use wcgi_gateway_core::engine::{
    CompiledScript, InstanceSpec, StderrSpec, StdinSpec, StdoutSpec,
};

use crate::context::{ForwardedClient, RequestContext};
use crate::env::build_cgi_env;
use crate::gateway::RedirectDelegate;

/// Longest header line the parser accepts from a script.
pub const HEADER_LINE_LIMIT: usize = 1024;

/// Capacity of the in-process pipe carrying the script's output.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Execute a script once and translate its output into a response.
///
/// `failure_hook` runs if the instance fails to start, traps, or exits
/// non-zero; the gateway uses it to evict the responsible cache entry so
/// the next request retries from scratch.
pub async fn execute<F>(
    script: Arc<dyn CompiledScript>,
    ctx: &RequestContext,
    req: Request<Body>,
    redirect: Option<Arc<dyn RedirectDelegate>>,
    failure_hook: F,
) -> Result<Response<Body>, GatewayError>
where
    F: FnOnce() + Send + 'static,
{
    if is_chunked(req.headers()) {
        return Err(GatewayError::ChunkedBody);
    }

    let env = build_cgi_env(ctx, req.method(), req.uri(), req.headers());
    let body = axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .map_err(|e| GatewayError::Io(std::io::Error::other(e)))?;

    let (stdout_read, stdout_write) = tokio::io::simplex(PIPE_CAPACITY);

    let spec = InstanceSpec {
        args: vec![ctx.script_path.display().to_string()],
        env: env.into_iter().collect(),
        stdin: if body.is_empty() {
            StdinSpec::Null
        } else {
            StdinSpec::Bytes(body)
        },
        stdout: StdoutSpec::Writer(Box::new(stdout_write)),
        stderr: if ctx.debug {
            StderrSpec::Inherit
        } else {
            StderrSpec::Discard
        },
        workdir: ctx.workdir.clone(),
        net_rule: None,
    };

    // The instance runs concurrently with the parser below; closing its
    // stdout (normally or not) is what terminates parsing.
    let script_path = ctx.script_path.clone();
    tokio::spawn(async move {
        match script.start(spec).await {
            Ok(outcome) if outcome.is_success() => {}
            Ok(outcome) => {
                warn!(
                    script = %script_path.display(),
                    ?outcome,
                    "script finished abnormally"
                );
                failure_hook();
            }
            Err(error) => {
                error!(
                    script = %script_path.display(),
                    %error,
                    "script execution failed"
                );
                failure_hook();
            }
        }
    });

    let mut reader = HeaderReader::new(stdout_read);
    let head = parse_headers(&mut reader).await?;
    respond(head, reader, ctx, redirect).await
}

/// Parsed response head: the optional `Status:` code and all other headers.
#[derive(Debug, Default)]
struct ResponseHead {
    status: Option<u16>,
    headers: HeaderMap,
}

/// Read header lines until the blank-line terminator.
async fn parse_headers<R>(reader: &mut HeaderReader<R>) -> Result<ResponseHead, CgiError>
where
    R: AsyncRead + Unpin,
{
    let mut head = ResponseHead::default();
    let mut header_lines = 0usize;
    let mut saw_blank_line = false;

    while let Some(line) = reader.next_line().await? {
        if line.is_empty() {
            saw_blank_line = true;
            break;
        }
        header_lines += 1;

        let text = String::from_utf8_lossy(&line);
        let Some((name, value)) = text.split_once(':') else {
            warn!(line = %text, "bogus header line from script");
            continue;
        };
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            warn!(name = %name, "invalid header name from script");
            continue;
        };
        let value = value.trim();

        if name.as_str() == "status" {
            let Some(code) = value.get(..3).and_then(|c| c.parse::<u16>().ok()) else {
                warn!(value = %value, "bogus status from script");
                return Err(CgiError::BadStatus {
                    value: value.into(),
                });
            };
            head.status = Some(code);
        } else {
            match HeaderValue::from_str(value) {
                Ok(value) => {
                    head.headers.append(name, value);
                }
                Err(_) => warn!(value = %value, "invalid header value from script"),
            }
        }
    }

    if header_lines == 0 || !saw_blank_line {
        return Err(CgiError::NoHeaders);
    }
    Ok(head)
}

/// Resolve status/redirect semantics and assemble the outgoing response.
async fn respond<R>(
    head: ResponseHead,
    reader: HeaderReader<R>,
    ctx: &RequestContext,
    redirect: Option<Arc<dyn RedirectDelegate>>,
) -> Result<Response<Body>, GatewayError>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let ResponseHead {
        mut status,
        headers,
    } = head;

    if let Some(location) = headers.get(LOCATION).and_then(|v| v.to_str().ok()) {
        if location.starts_with('/') {
            if let Some(delegate) = redirect {
                return internal_redirect(delegate, ctx, location).await;
            }
        }
        if status.is_none() {
            status = Some(StatusCode::FOUND.as_u16());
        }
    }

    if status.is_none() && !headers.contains_key(CONTENT_TYPE) {
        return Err(CgiError::MissingContentType.into());
    }

    let code = status.unwrap_or(200);
    let status = StatusCode::from_u16(code).map_err(|_| CgiError::BadStatus {
        value: code.to_string(),
    })?;

    let (leftover, remainder) = reader.into_remaining();
    let body = Cursor::new(leftover.freeze()).chain(remainder);

    let mut response = Response::new(Body::from_stream(ReaderStream::new(body)));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

/// Dispatch a synthesized GET to the internal-redirect delegate.
///
/// The synthetic request carries the client's address and TLS state but
/// drops the original body and headers, mirroring HTTP redirect semantics
/// rather than URL rewriting.
async fn internal_redirect(
    delegate: Arc<dyn RedirectDelegate>,
    ctx: &RequestContext,
    location: &str,
) -> Result<Response<Body>, GatewayError> {
    let uri: Uri = location.parse().map_err(|_| CgiError::BadLocation {
        value: location.into(),
    })?;

    let mut synth = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .map_err(|_| CgiError::BadLocation {
            value: location.into(),
        })?;
    synth.extensions_mut().insert(ForwardedClient {
        remote_addr: ctx.remote_addr,
        tls: ctx.tls,
    });

    Ok(delegate.dispatch(synth).await)
}

/// CGI has no chunked-transfer framing.
fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| {
            value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("chunked"))
        })
}

/// Bounded, line-oriented reader over a script's output stream.
struct HeaderReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R> HeaderReader<R>
where
    R: AsyncRead + Unpin,
{
    fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(HEADER_LINE_LIMIT),
        }
    }

    /// Next line without its terminator; `None` at end-of-output.
    ///
    /// A final line without a newline is still returned; the caller's
    /// blank-line accounting decides whether that is an error.
    async fn next_line(&mut self) -> Result<Option<Vec<u8>>, CgiError> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let mut line = self.buf.split_to(pos + 1);
                line.truncate(pos);
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                return Ok(Some(line.to_vec()));
            }
            if self.buf.len() >= HEADER_LINE_LIMIT {
                return Err(CgiError::HeaderLineTooLong);
            }
            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(self.buf.split().to_vec()));
            }
        }
    }

    /// Hand back buffered-but-unread bytes plus the underlying stream.
    fn into_remaining(self) -> (BytesMut, R) {
        (self.buf, self.inner)
    }
}
