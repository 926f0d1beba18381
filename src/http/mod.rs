//! Static File Serving
//!
//! Minimal HTTP/1.1 responder for non-upgrade connections: serves the
//! dashboard files below `www_root`, one request per connection. HTML pages
//! declaring `<meta name="metrics" content="...">` get a security token
//! cookie for the WebSocket session that follows.

use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::tokens::TokenStore;
use crate::websocket::handshake::TOKEN_COOKIE;

/// Response status codes used by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    BadRequest,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    InternalServerError,
    ServiceUnavailable,
}

impl StatusCode {
    pub fn code(self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::BadRequest => 400,
            StatusCode::Forbidden => 403,
            StatusCode::NotFound => 404,
            StatusCode::MethodNotAllowed => 405,
            StatusCode::InternalServerError => 500,
            StatusCode::ServiceUnavailable => 503,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::Forbidden => "Forbidden",
            StatusCode::NotFound => "Not Found",
            StatusCode::MethodNotAllowed => "Method Not Allowed",
            StatusCode::InternalServerError => "Internal Server Error",
            StatusCode::ServiceUnavailable => "Service Unavailable",
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code(), self.reason())
    }
}

/// Complete error response with a small HTML body
pub fn status_response(status: StatusCode) -> String {
    let body = format!("<html><body><h1>{}</h1></body></html>", status);
    format!(
        "HTTP/1.1 {}\r\n\
         Content-Type: text/html\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    )
}

/// Errors while answering a static file request
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Malformed request line")]
    MalformedRequest,

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("Path traversal rejected: {0}")]
    Forbidden(String),

    #[error("File not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl HttpError {
    pub fn status(&self) -> StatusCode {
        match self {
            HttpError::MalformedRequest => StatusCode::BadRequest,
            HttpError::MethodNotAllowed(_) => StatusCode::MethodNotAllowed,
            HttpError::Forbidden(_) => StatusCode::Forbidden,
            HttpError::NotFound(_) => StatusCode::NotFound,
            HttpError::Io { .. } => StatusCode::InternalServerError,
        }
    }
}

/// Extract the request target from the request line
pub fn parse_request_path(initial: &[u8]) -> Result<String, HttpError> {
    let text = String::from_utf8_lossy(initial);
    let line = text.lines().next().ok_or(HttpError::MalformedRequest)?;
    let mut parts = line.split_whitespace();

    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v)) => (m, t, v),
        _ => return Err(HttpError::MalformedRequest),
    };
    if !version.starts_with("HTTP/") || !target.starts_with('/') {
        return Err(HttpError::MalformedRequest);
    }
    if method != "GET" {
        return Err(HttpError::MethodNotAllowed(method.to_string()));
    }

    Ok(target.to_string())
}

/// Map a request target to a file below `www_root`
pub fn resolve_path(www_root: &Path, target: &str) -> Result<PathBuf, HttpError> {
    let path = target
        .split(['?', '#'])
        .next()
        .unwrap_or(target);

    if path.contains("..") {
        return Err(HttpError::Forbidden(path.to_string()));
    }

    let relative = path.trim_start_matches('/');
    let mut resolved = www_root.join(relative);
    if relative.is_empty() || path.ends_with('/') {
        resolved.push("index.html");
    }
    Ok(resolved)
}

/// Content type for a file, by extension
pub fn mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match ext.as_deref() {
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("ico") => "image/x-icon",
        _ => "text/plain",
    }
}

/// Find the `content` of `<meta name="metrics" content="...">`
pub fn scan_metrics_meta(html: &str) -> Option<String> {
    // ASCII lowercasing keeps byte offsets aligned with `html`
    let lower = html.to_ascii_lowercase();
    let mut offset = 0;

    while let Some(found) = lower[offset..].find("<meta") {
        let start = offset + found;
        let end = lower[start..].find('>').map(|e| start + e)?;
        let tag = &html[start..end];
        let tag_lower = &lower[start..end];

        let is_metrics = attribute(tag, tag_lower, "name")
            .map(|name| name.eq_ignore_ascii_case("metrics"))
            .unwrap_or(false);
        if is_metrics {
            if let Some(content) = attribute(tag, tag_lower, "content") {
                return Some(content.to_string());
            }
        }
        offset = end;
    }
    None
}

fn attribute<'a>(tag: &'a str, tag_lower: &str, name: &str) -> Option<&'a str> {
    let needle = format!("{}=", name);
    let mut offset = 0;

    while let Some(found) = tag_lower[offset..].find(&needle) {
        let at = offset + found;
        offset = at + needle.len();

        let preceded_by_space = tag_lower[..at]
            .chars()
            .last()
            .map(char::is_whitespace)
            .unwrap_or(false);
        if !preceded_by_space {
            continue;
        }

        let rest = &tag[offset..];
        let quote = rest.chars().next()?;
        if quote != '"' && quote != '\'' {
            let value = rest.split(|c: char| c.is_whitespace() || c == '/').next()?;
            return Some(value);
        }
        let inner = &rest[1..];
        let close = inner.find(quote)?;
        return Some(&inner[..close]);
    }
    None
}

/// Answer a plain HTTP request from the connection's initial bytes
///
/// Returns the status sent. Only write failures are errors; request
/// problems are answered with the matching status page.
pub async fn serve_static<W>(
    writer: &mut W,
    initial: &[u8],
    www_root: &Path,
    tokens: &TokenStore,
) -> std::io::Result<StatusCode>
where
    W: AsyncWrite + Unpin,
{
    match load(initial, www_root).await {
        Ok((path, body)) => {
            let mime = mime_type(&path);
            let mut head = format!(
                "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n",
                StatusCode::Ok,
                mime,
                body.len()
            );

            if mime == "text/html" {
                if let Some(allowed) = scan_metrics_meta(&String::from_utf8_lossy(&body)) {
                    let token = tokens.issue(&allowed).await;
                    head.push_str(&format!(
                        "Set-Cookie: {}={}; Path=/; SameSite=Strict\r\n",
                        TOKEN_COOKIE, token
                    ));
                }
            }
            head.push_str("\r\n");

            writer.write_all(head.as_bytes()).await?;
            writer.write_all(&body).await?;
            writer.flush().await?;

            tracing::debug!(path = %path.display(), bytes = body.len(), "Served static file");
            Ok(StatusCode::Ok)
        }
        Err(e) => {
            let status = e.status();
            match &e {
                HttpError::Io { .. } => tracing::warn!(error = %e, "Static file request failed"),
                _ => tracing::debug!(error = %e, status = status.code(), "Static file request rejected"),
            }
            writer.write_all(status_response(status).as_bytes()).await?;
            writer.flush().await?;
            Ok(status)
        }
    }
}

async fn load(initial: &[u8], www_root: &Path) -> Result<(PathBuf, Vec<u8>), HttpError> {
    let target = parse_request_path(initial)?;
    let path = resolve_path(www_root, &target)?;

    match tokio::fs::read(&path).await {
        Ok(body) => Ok((path, body)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(HttpError::NotFound(path)),
        Err(source) => Err(HttpError::Io { path, source }),
    }
}
