use std::borrow::Cow;
use std::net::SocketAddr;

use anyhow::Result;
use http::{Method, StatusCode, Uri};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

use crate::logging::AccessLogBuilder;
use crate::metrics;
use crate::proxy::AppContext;

use super::codec::read_request_head;
use super::respond::{respond_with_access_log, send_body, shutdown_stream};

pub async fn handle_http(stream: TcpStream, peer: SocketAddr, app: AppContext) -> Result<()> {
    metrics::inc_inflight();
    let result = serve_connection(stream, peer, &app).await;
    metrics::dec_inflight();
    result
}

/// One request per connection: read the head, answer, close.
pub async fn serve_connection<S>(stream: S, peer: SocketAddr, app: &AppContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let start = Instant::now();
    let client_timeout = app.settings.client_timeout();
    let mut reader = BufReader::new(stream);

    let head = match read_request_head(
        &mut reader,
        peer,
        client_timeout,
        app.settings.max_request_header_size,
    )
    .await
    {
        Ok(Some(head)) => head,
        Ok(None) => return Ok(()),
        Err(err) => {
            debug!(peer = %peer, error = %err, "rejecting malformed request");
            let log = AccessLogBuilder::new(peer)
                .error_reason("bad_request")
                .error_detail(format!("{err:#}"));
            respond_with_access_log(
                reader.get_mut(),
                StatusCode::BAD_REQUEST,
                b"malformed request\n",
                client_timeout,
                start.elapsed(),
                log,
            )
            .await?;
            return Ok(());
        }
    };

    let log = AccessLogBuilder::new(peer)
        .method(head.method.as_str())
        .path(head.target.as_str())
        .http_version(head.version)
        .request_header_bytes(head.header_bytes);
    let stream = reader.get_mut();

    if head.method != Method::GET {
        return respond_with_access_log(
            stream,
            StatusCode::METHOD_NOT_ALLOWED,
            b"only GET is supported\n",
            client_timeout,
            start.elapsed(),
            log.error_reason("method_not_allowed"),
        )
        .await;
    }

    let target = origin_form(&head.target);
    match app.handler.handle(&target).await {
        Ok(served) => {
            let bytes_out = send_body(
                stream,
                &served.body,
                app.settings.content_encoding_gzip,
                client_timeout,
            )
            .await?;
            shutdown_stream(stream, client_timeout).await?;

            let mut log = log
                .status(StatusCode::OK)
                .cache_lookup(served.lookup.as_str())
                .bytes_out(bytes_out as u64)
                .elapsed(start.elapsed());
            if let Some(store) = served.store {
                log = log.cache_store(store.as_str());
            }
            if let Some(origin) = served.origin {
                log = log.origin(origin);
            }
            log.log();
            Ok(())
        }
        Err(err) => {
            let status = err.status();
            let mut log = log
                .error_reason(err.reason())
                .error_detail(err.to_string());
            if status != StatusCode::BAD_REQUEST {
                log = log.cache_lookup("miss");
            }
            if let Some(origin) = err.origin() {
                log = log.origin(origin);
            }
            let body = format!("{}\n", status.canonical_reason().unwrap_or("error"));
            respond_with_access_log(
                stream,
                status,
                body.as_bytes(),
                client_timeout,
                start.elapsed(),
                log,
            )
            .await
        }
    }
}

/// Reduce an absolute-form target (`http://gateway/host/path`) to its path and
/// query. Anything else is passed through for the path mapper to judge.
fn origin_form(target: &str) -> Cow<'_, str> {
    if target.starts_with('/') {
        return Cow::Borrowed(target);
    }
    match target.parse::<Uri>() {
        Ok(uri) if uri.scheme().is_some() || uri.authority().is_some() => {
            let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
            Cow::Owned(path.to_string())
        }
        _ => Cow::Borrowed(target),
    }
}
