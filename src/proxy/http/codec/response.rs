use std::net::SocketAddr;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::{StatusCode, Version};
use tokio::io::{AsyncRead, BufReader};

use super::HeaderBudget;
use super::line::{ConnectionClosed, read_line};

#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub content_length: Option<u64>,
    pub transfer_encoding_present: bool,
    /// Raw `Location` value, kept for redirects.
    pub location: Option<String>,
}

/// Read an origin status line and headers, keeping only what framing and
/// redirects need.
/// The caller bounds the read with its own timeout.
pub async fn read_response_head<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    max_header_bytes: usize,
) -> Result<ResponseHead>
where
    S: AsyncRead + Unpin,
{
    ensure!(
        max_header_bytes > 0,
        "max response header size must be greater than zero"
    );
    let mut budget = HeaderBudget::new(
        max_header_bytes,
        "origin response headers exceed configured limit",
    )?;

    let mut status_line = String::new();
    let bytes = read_line(reader, &mut status_line, peer, max_header_bytes).await?;
    if bytes == 0 {
        return Err(ConnectionClosed { peer }.into());
    }
    budget.record(bytes)?;
    let (_, status) = parse_status_line(status_line.trim_end_matches(['\r', '\n']))?;

    let mut content_length = None;
    let mut transfer_encoding_present = false;
    let mut location = None;
    let mut header_line = String::new();
    loop {
        let remaining = max_header_bytes.saturating_sub(budget.used()).max(1);
        let read = read_line(reader, &mut header_line, peer, remaining).await?;
        if read == 0 {
            return Err(ConnectionClosed { peer }.into());
        }
        budget.record(read)?;
        let trimmed = header_line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        let (name, value) = trimmed
            .split_once(':')
            .ok_or_else(|| anyhow!("header missing ':' separator from origin"))?;
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-length") {
            let parsed: u64 = value
                .parse()
                .with_context(|| format!("invalid Content-Length value '{value}'"))?;
            if content_length.is_some_and(|existing| existing != parsed) {
                bail!("conflicting Content-Length headers from origin");
            }
            content_length = Some(parsed);
        }
        if name.eq_ignore_ascii_case("transfer-encoding") {
            transfer_encoding_present = true;
        }
        if name.eq_ignore_ascii_case("location") {
            location = Some(value.to_string());
        }
    }

    Ok(ResponseHead {
        status,
        content_length,
        transfer_encoding_present,
        location,
    })
}

pub fn parse_status_line(value: &str) -> Result<(Version, StatusCode)> {
    let mut parts = value.split_whitespace();
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("origin status line missing HTTP version"))?;
    let status = parts
        .next()
        .ok_or_else(|| anyhow!("origin status line missing status code"))?;

    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        other => bail!("unsupported origin HTTP version '{other}'"),
    };

    let status_code: u16 = status
        .parse()
        .with_context(|| format!("invalid origin status code '{status}'"))?;
    let status = StatusCode::from_u16(status_code)
        .with_context(|| format!("invalid origin status code '{status_code}'"))?;
    Ok((version, status))
}
