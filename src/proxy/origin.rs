use std::fmt;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{StatusCode, Uri};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::proxy::http::codec::{ConnectionClosed, read_response_head};
use crate::settings::Settings;

/// Redirect hops followed before the fetch gives up.
pub const MAX_REDIRECTS: usize = 10;

/// Why an origin fetch produced no cacheable body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchCause {
    Timeout,
    Connection,
    UpstreamStatus(u16),
    Protocol,
    BodyTooLarge,
}

impl FetchCause {
    /// Stable label for metrics and access logs.
    pub fn label(&self) -> &'static str {
        match self {
            FetchCause::Timeout => "timeout",
            FetchCause::Connection => "connection",
            FetchCause::UpstreamStatus(_) => "upstream_status",
            FetchCause::Protocol => "protocol",
            FetchCause::BodyTooLarge => "body_too_large",
        }
    }
}

impl fmt::Display for FetchCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchCause::Timeout => f.write_str("timeout"),
            FetchCause::Connection => f.write_str("connection"),
            FetchCause::UpstreamStatus(code) => write!(f, "upstream-status:{code}"),
            FetchCause::Protocol => f.write_str("protocol"),
            FetchCause::BodyTooLarge => f.write_str("body-too-large"),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("fetching {url} failed ({cause}): {detail}")]
pub struct FetchError {
    pub url: String,
    pub cause: FetchCause,
    pub detail: String,
}

impl FetchError {
    pub fn new(url: &Uri, cause: FetchCause, detail: impl Into<String>) -> Self {
        Self {
            url: url.to_string(),
            cause,
            detail: detail.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.cause == FetchCause::Timeout
    }

    /// Report a failure on a redirect hop against the URL that was requested.
    fn reached_from(mut self, requested: &Uri) -> Self {
        let hop = std::mem::replace(&mut self.url, requested.to_string());
        self.detail = format!("{} (after redirect to {hop})", self.detail);
        self
    }
}

/// Source of bodies for cache misses.
#[async_trait]
pub trait Origin: Send + Sync {
    /// Fetch the complete body at `url`. Only a 2xx answer, possibly reached
    /// through redirects, is a success.
    async fn fetch(&self, url: &Uri) -> Result<Bytes, FetchError>;
}

/// Plain HTTP/1.0 client, one connection per hop.
///
/// Requests are sent as HTTP/1.0 so a conforming origin frames the body with
/// `Content-Length` or by closing the connection, never chunked. 301, 302, 303
/// and 307 answers are followed to other `http` URLs, up to [`MAX_REDIRECTS`]
/// hops, all within the one fetch timeout.
#[derive(Debug, Clone)]
pub struct HttpOrigin {
    timeout: Duration,
    max_header_bytes: usize,
    max_body_bytes: u64,
}

impl HttpOrigin {
    pub fn new(timeout: Duration, max_header_bytes: usize, max_body_bytes: u64) -> Self {
        Self {
            timeout,
            max_header_bytes,
            max_body_bytes,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.fetch_timeout(),
            settings.max_response_header_size,
            settings.max_body_size,
        )
    }

    async fn follow(&self, url: &Uri) -> Result<Bytes, FetchError> {
        let mut current = url.clone();
        let mut redirects = 0;
        loop {
            let answer = self.exchange(&current).await;
            let (status, next) = match answer {
                Ok(Answer::Body(body)) => return Ok(body),
                Ok(Answer::Redirect { status, location }) => (status, location),
                Err(err) if redirects > 0 => return Err(err.reached_from(url)),
                Err(err) => return Err(err),
            };
            if redirects == MAX_REDIRECTS {
                return Err(FetchError::new(
                    url,
                    FetchCause::UpstreamStatus(status.as_u16()),
                    format!("gave up after {MAX_REDIRECTS} redirects, last to {current}"),
                ));
            }
            redirects += 1;
            debug!(from = %current, to = %next, status = status.as_u16(), "following origin redirect");
            current = next;
        }
    }

    async fn exchange(&self, url: &Uri) -> Result<Answer, FetchError> {
        let target = OriginTarget::from_uri(url)
            .map_err(|detail| FetchError::new(url, FetchCause::Protocol, detail))?;

        let stream = TcpStream::connect((target.host.as_str(), target.port))
            .await
            .map_err(|err| {
                FetchError::new(
                    url,
                    FetchCause::Connection,
                    format!("failed to connect to {}: {err}", target.authority),
                )
            })?;
        if let Err(err) = stream.set_nodelay(true) {
            debug!(error = %err, origin = %target.authority, "failed to enable TCP_NODELAY");
        }
        let peer = stream
            .peer_addr()
            .map_err(|err| connection_error(url, "origin connection lost", err))?;

        let mut reader = BufReader::new(stream);
        reader
            .get_mut()
            .write_all(target.request().as_bytes())
            .await
            .map_err(|err| connection_error(url, "failed to send request", err))?;

        let head = read_response_head(&mut reader, peer, self.max_header_bytes)
            .await
            .map_err(|err| {
                let cause = if err.downcast_ref::<io::Error>().is_some()
                    || err.downcast_ref::<ConnectionClosed>().is_some()
                {
                    FetchCause::Connection
                } else {
                    FetchCause::Protocol
                };
                FetchError::new(url, cause, format!("{err:#}"))
            })?;

        if is_followed_redirect(head.status) {
            let location = head.location.as_deref().ok_or_else(|| {
                FetchError::new(
                    url,
                    FetchCause::Protocol,
                    format!("origin answered {} without a Location", head.status),
                )
            })?;
            let location = resolve_location(url, location)
                .map_err(|detail| FetchError::new(url, FetchCause::Protocol, detail))?;
            return Ok(Answer::Redirect {
                status: head.status,
                location,
            });
        }
        if !head.status.is_success() {
            return Err(FetchError::new(
                url,
                FetchCause::UpstreamStatus(head.status.as_u16()),
                format!("origin answered {}", head.status),
            ));
        }
        if head.transfer_encoding_present {
            return Err(FetchError::new(
                url,
                FetchCause::Protocol,
                "origin used Transfer-Encoding on an HTTP/1.0 request",
            ));
        }

        let body = match head.content_length {
            Some(length) => {
                if length > self.max_body_bytes {
                    return Err(FetchError::new(
                        url,
                        FetchCause::BodyTooLarge,
                        format!(
                            "declared length {length} exceeds limit of {} bytes",
                            self.max_body_bytes
                        ),
                    ));
                }
                let mut body = Vec::with_capacity(length as usize);
                (&mut reader)
                    .take(length)
                    .read_to_end(&mut body)
                    .await
                    .map_err(|err| connection_error(url, "failed to read body", err))?;
                if (body.len() as u64) < length {
                    return Err(FetchError::new(
                        url,
                        FetchCause::Connection,
                        format!(
                            "origin closed after {} of {length} body bytes",
                            body.len()
                        ),
                    ));
                }
                body
            }
            None => {
                let mut body = Vec::new();
                (&mut reader)
                    .take(self.max_body_bytes.saturating_add(1))
                    .read_to_end(&mut body)
                    .await
                    .map_err(|err| connection_error(url, "failed to read body", err))?;
                if body.len() as u64 > self.max_body_bytes {
                    return Err(FetchError::new(
                        url,
                        FetchCause::BodyTooLarge,
                        format!("body exceeds limit of {} bytes", self.max_body_bytes),
                    ));
                }
                body
            }
        };

        Ok(Answer::Body(Bytes::from(body)))
    }
}

enum Answer {
    Body(Bytes),
    Redirect { status: StatusCode, location: Uri },
}

fn is_followed_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
    )
}

/// Resolve a `Location` value against the URL that produced it. Only `http`
/// targets are accepted; fragments are dropped.
fn resolve_location(base: &Uri, location: &str) -> Result<Uri, String> {
    let reference = location.split('#').next().unwrap_or_default();
    if reference.is_empty() {
        return Err("redirect has an empty Location".to_string());
    }
    let authority = base.authority().map(|a| a.as_str()).unwrap_or_default();

    let absolute = if reference.starts_with("//") {
        format!("http:{reference}")
    } else if has_scheme(reference) {
        reference.to_string()
    } else if reference.starts_with('/') {
        format!("http://{authority}{reference}")
    } else {
        let path = base.path();
        let directory = &path[..path.rfind('/').map_or(0, |idx| idx + 1)];
        format!("http://{authority}{directory}{reference}")
    };

    let uri: Uri = absolute
        .parse()
        .map_err(|err| format!("invalid redirect Location '{location}': {err}"))?;
    match uri.scheme_str() {
        Some("http") => {}
        other => {
            return Err(format!(
                "redirect to unsupported scheme '{}'",
                other.unwrap_or_default()
            ));
        }
    }
    if uri.host().is_none_or(str::is_empty) {
        return Err(format!("redirect Location '{location}' has no host"));
    }
    Ok(uri)
}

fn has_scheme(reference: &str) -> bool {
    let Some((scheme, _)) = reference.split_once(':') else {
        return false;
    };
    let mut chars = scheme.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

#[async_trait]
impl Origin for HttpOrigin {
    async fn fetch(&self, url: &Uri) -> Result<Bytes, FetchError> {
        match timeout(self.timeout, self.follow(url)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::new(
                url,
                FetchCause::Timeout,
                format!(
                    "no complete response within {:.3}s",
                    self.timeout.as_secs_f64()
                ),
            )),
        }
    }
}

fn connection_error(url: &Uri, context: &str, err: io::Error) -> FetchError {
    FetchError::new(url, FetchCause::Connection, format!("{context}: {err}"))
}

struct OriginTarget {
    host: String,
    port: u16,
    authority: String,
    path_and_query: String,
}

impl OriginTarget {
    fn from_uri(url: &Uri) -> Result<Self, String> {
        match url.scheme_str() {
            Some("http") | None => {}
            Some(other) => return Err(format!("unsupported origin scheme '{other}'")),
        }
        let authority = url
            .authority()
            .ok_or_else(|| format!("origin URL '{url}' has no host"))?;
        let host = authority
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        if host.is_empty() {
            return Err(format!("origin URL '{url}' has no host"));
        }
        let path_and_query = url
            .path_and_query()
            .map(|pq| pq.as_str())
            .filter(|pq| !pq.is_empty())
            .unwrap_or("/")
            .to_string();
        Ok(Self {
            host,
            port: authority.port_u16().unwrap_or(80),
            authority: authority.as_str().to_string(),
            path_and_query,
        })
    }

    fn request(&self) -> String {
        format!(
            "GET {} HTTP/1.0\r\nHost: {}\r\nUser-Agent: tilecache/{}\r\nAccept: */*\r\nConnection: close\r\n\r\n",
            self.path_and_query,
            self.authority,
            env!("CARGO_PKG_VERSION")
        )
    }
}
