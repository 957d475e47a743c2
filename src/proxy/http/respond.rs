use std::time::Duration;

use anyhow::Result;
use http::StatusCode;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::io_util::write_all_with_timeout;
use crate::logging::AccessLogBuilder;
use crate::util::timeout_with_context;

/// Write a `200 OK` carrying a cached or freshly fetched body.
///
/// `gzip` adds `Content-Encoding: gzip` whatever the body is; operators who
/// only cache pre-compressed tiles rely on it.
pub async fn send_body<S>(
    stream: &mut S,
    body: &[u8],
    gzip: bool,
    timeout_dur: Duration,
) -> Result<usize>
where
    S: AsyncWrite + Unpin,
{
    let encoding = if gzip { "Content-Encoding: gzip\r\n" } else { "" };
    let header = format!(
        "HTTP/1.1 200 OK\r\n{encoding}Content-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    write_all_with_timeout(
        stream,
        header.as_bytes(),
        timeout_dur,
        "writing response header",
    )
    .await?;
    let mut written = header.len();
    if !body.is_empty() {
        write_all_with_timeout(stream, body, timeout_dur, "writing response body").await?;
        written += body.len();
    }
    Ok(written)
}

pub async fn respond_with_access_log<S>(
    stream: &mut S,
    status: StatusCode,
    body: &[u8],
    timeout_dur: Duration,
    elapsed: Duration,
    log_builder: AccessLogBuilder,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let bytes_out = send_response(stream, status, body, timeout_dur).await?;
    shutdown_stream(stream, timeout_dur).await?;
    log_builder
        .status(status)
        .bytes_out(bytes_out as u64)
        .elapsed(elapsed)
        .log();
    Ok(())
}

/// Plain-text response for errors and rejected requests.
pub async fn send_response<S>(
    stream: &mut S,
    status: StatusCode,
    body: &[u8],
    timeout_dur: Duration,
) -> Result<usize>
where
    S: AsyncWrite + Unpin,
{
    let reason = status.canonical_reason().unwrap_or("Unknown");
    let allow = if status == StatusCode::METHOD_NOT_ALLOWED {
        "Allow: GET\r\n"
    } else {
        ""
    };
    let header = format!(
        "HTTP/1.1 {} {reason}\r\n{allow}Content-Length: {}\r\nConnection: close\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n",
        status.as_u16(),
        body.len()
    );
    write_all_with_timeout(
        stream,
        header.as_bytes(),
        timeout_dur,
        "writing response header",
    )
    .await?;
    let mut written = header.len();
    if !body.is_empty() {
        write_all_with_timeout(stream, body, timeout_dur, "writing response body").await?;
        written += body.len();
    }
    Ok(written)
}

pub async fn shutdown_stream<S>(stream: &mut S, timeout_dur: Duration) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    timeout_with_context(
        timeout_dur,
        stream.shutdown(),
        "shutting down client stream",
    )
    .await
}
