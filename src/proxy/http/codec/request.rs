use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use http::{Method, Version};
use tokio::io::{AsyncRead, BufReader};
use tokio::time::Instant;
use tracing::debug;

use super::HeaderBudget;
use super::line::read_line_with_deadline;

#[derive(Debug)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    pub version: Version,
    pub header_bytes: usize,
}

/// Read a request line and drain its headers. Header values are not needed by
/// the gateway; only their total size is enforced. Returns `None` when the
/// client closes before sending anything.
pub async fn read_request_head<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    header_timeout: Duration,
    max_header_bytes: usize,
) -> Result<Option<RequestHead>>
where
    S: AsyncRead + Unpin,
{
    let deadline = Instant::now() + header_timeout;
    let mut budget = HeaderBudget::new(max_header_bytes, "request headers exceed configured limit")?;

    let mut line = String::new();
    let read = read_line_with_deadline(reader, &mut line, deadline, peer, max_header_bytes).await?;
    if read == 0 {
        debug!(peer = %peer, "connection closed before request line");
        return Ok(None);
    }
    budget.record(read)?;
    let (method, target, version) = parse_request_line(line.trim_end_matches(['\r', '\n']))?;

    loop {
        let remaining = max_header_bytes.saturating_sub(budget.used()).max(1);
        let read = read_line_with_deadline(reader, &mut line, deadline, peer, remaining)
            .await
            .with_context(|| format!("reading request headers from {peer}"))?;
        if read == 0 {
            bail!("connection closed during request headers from {peer}");
        }
        budget.record(read)?;
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        if !trimmed.contains(':') {
            bail!("header missing ':' separator from {peer}");
        }
    }

    Ok(Some(RequestHead {
        method,
        target,
        version,
        header_bytes: budget.used(),
    }))
}

pub fn parse_request_line(line: &str) -> Result<(Method, String, Version)> {
    if line.is_empty() {
        bail!("empty request line");
    }
    let mut parts = line.split_whitespace();
    let method_str = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing method"))?;
    let target = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing target"))?;
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing version"))?;
    if parts.next().is_some() {
        bail!("malformed request line: unexpected data");
    }
    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        other => bail!("invalid HTTP version '{other}'"),
    };
    let method = Method::from_bytes(method_str.as_bytes())
        .with_context(|| format!("invalid method '{method_str}'"))?;
    Ok((method, target.to_string(), version))
}
