use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use thiserror::Error;
use tracing::{info, warn};

use crate::metrics;
use crate::proxy::cache::{CacheStore, FlightRole, MissCoalescer};
use crate::proxy::origin::{FetchError, Origin};
use crate::proxy::path::{MappedPath, PathError, PathMapper};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLookup {
    Hit,
    Miss,
}

impl CacheLookup {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheLookup::Hit => "hit",
            CacheLookup::Miss => "miss",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStoreOutcome {
    Stored,
    /// The body was served but could not be persisted.
    Failed,
    /// Another request fetched and persisted this body.
    Shared,
}

impl CacheStoreOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStoreOutcome::Stored => "stored",
            CacheStoreOutcome::Failed => "failed",
            CacheStoreOutcome::Shared => "shared",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Served {
    pub body: Bytes,
    pub lookup: CacheLookup,
    /// Set on misses only.
    pub store: Option<CacheStoreOutcome>,
    pub origin: Option<String>,
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

impl RequestError {
    pub fn status(&self) -> StatusCode {
        match self {
            RequestError::Path(_) => StatusCode::BAD_REQUEST,
            RequestError::Fetch(err) if err.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            RequestError::Fetch(_) => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            RequestError::Path(_) => "invalid_path",
            RequestError::Fetch(err) => err.cause.label(),
        }
    }

    pub fn origin(&self) -> Option<&str> {
        match self {
            RequestError::Path(_) => None,
            RequestError::Fetch(err) => Some(err.url.as_str()),
        }
    }
}

type FlightOutcome = Result<(Bytes, CacheStoreOutcome), FetchError>;

/// Serves one request path: map it, answer from disk when possible, otherwise
/// fetch from the origin and persist before answering.
///
/// Nothing is written to the cache unless the origin returned a complete 2xx
/// body, so failures never leave entries behind.
pub struct RequestHandler {
    mapper: PathMapper,
    store: CacheStore,
    origin: Arc<dyn Origin>,
    coalescer: Option<MissCoalescer<FlightOutcome>>,
}

impl RequestHandler {
    pub fn new(
        mapper: PathMapper,
        store: CacheStore,
        origin: Arc<dyn Origin>,
        coalesce_misses: bool,
    ) -> Self {
        Self {
            mapper,
            store,
            origin,
            coalescer: coalesce_misses.then(MissCoalescer::new),
        }
    }

    pub async fn handle(&self, request_path: &str) -> Result<Served, RequestError> {
        let mapped = self.mapper.map(request_path)?;

        if let Some(body) = self.lookup(&mapped).await {
            metrics::record_cache_lookup(true);
            return Ok(Served {
                body,
                lookup: CacheLookup::Hit,
                store: None,
                origin: None,
            });
        }
        metrics::record_cache_lookup(false);
        info!(key = %mapped.key, origin = %mapped.origin, "cache miss");

        let (body, store) = match &self.coalescer {
            None => self.fetch_and_persist(&mapped).await?,
            Some(coalescer) => {
                let (outcome, role) = coalescer
                    .run(&mapped.key, || self.fetch_or_reuse(&mapped))
                    .await;
                let (body, store) = outcome?;
                match role {
                    FlightRole::Leader => (body, store),
                    FlightRole::Follower => {
                        metrics::record_coalesced_miss();
                        (body, CacheStoreOutcome::Shared)
                    }
                }
            }
        };

        Ok(Served {
            body,
            lookup: CacheLookup::Miss,
            store: Some(store),
            origin: Some(mapped.origin.to_string()),
        })
    }

    /// A read failure other than absence is logged and treated as a miss.
    async fn lookup(&self, mapped: &MappedPath) -> Option<Bytes> {
        match self.store.get(&mapped.directory, &mapped.filename).await {
            Ok(body) => body,
            Err(err) => {
                metrics::record_cache_read_error();
                warn!(key = %mapped.key, error = %err, "cache read failed; fetching from origin");
                None
            }
        }
    }

    /// Leader work under coalescing. A flight that finished between this
    /// request's miss and its registration has already stored the entry.
    async fn fetch_or_reuse(&self, mapped: &MappedPath) -> FlightOutcome {
        if let Ok(Some(body)) = self.store.get(&mapped.directory, &mapped.filename).await {
            return Ok((body, CacheStoreOutcome::Shared));
        }
        self.fetch_and_persist(mapped).await
    }

    async fn fetch_and_persist(&self, mapped: &MappedPath) -> FlightOutcome {
        metrics::record_origin_fetch();
        let body = match self.origin.fetch(&mapped.origin).await {
            Ok(body) => body,
            Err(err) => {
                metrics::record_origin_error(err.cause.label());
                return Err(err);
            }
        };

        let store = match self
            .store
            .put(&mapped.directory, &mapped.filename, &body)
            .await
        {
            Ok(()) => {
                metrics::record_cache_store();
                CacheStoreOutcome::Stored
            }
            Err(err) => {
                metrics::record_cache_store_error();
                warn!(
                    key = %mapped.key,
                    error = %err,
                    "failed to persist cache entry; serving fetched body"
                );
                CacheStoreOutcome::Failed
            }
        };
        Ok((body, store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::origin::FetchCause;
    use async_trait::async_trait;
    use http::Uri;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    struct FakeOrigin {
        calls: AtomicUsize,
        urls: Mutex<Vec<String>>,
        delay: Duration,
        failure: Option<FetchCause>,
    }

    impl FakeOrigin {
        fn ok() -> Arc<Self> {
            Self::build(Duration::ZERO, None)
        }

        fn build(delay: Duration, failure: Option<FetchCause>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                urls: Mutex::new(Vec::new()),
                delay,
                failure,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Origin for FakeOrigin {
        async fn fetch(&self, url: &Uri) -> Result<Bytes, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.urls.lock().push(url.to_string());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match &self.failure {
                Some(cause) => Err(FetchError::new(url, cause.clone(), "fake failure")),
                None => Ok(Bytes::from(format!("body of {url}"))),
            }
        }
    }

    async fn handler(dir: &TempDir, origin: Arc<FakeOrigin>, coalesce: bool) -> RequestHandler {
        let store = CacheStore::open(dir.path().to_path_buf()).await.unwrap();
        RequestHandler::new(PathMapper::new(dir.path()), store, origin, coalesce)
    }

    #[tokio::test]
    async fn miss_fetches_persists_then_hits() {
        let dir = TempDir::new().unwrap();
        let origin = FakeOrigin::ok();
        let handler = handler(&dir, origin.clone(), false).await;

        let first = handler.handle("/example.com/a/b/c.html").await.unwrap();
        assert_eq!(first.lookup, CacheLookup::Miss);
        assert_eq!(first.store, Some(CacheStoreOutcome::Stored));
        assert_eq!(first.body, Bytes::from("body of http://example.com/a/b/c.html"));
        assert_eq!(
            origin.urls.lock().as_slice(),
            ["http://example.com/a/b/c.html".to_string()]
        );
        let on_disk = std::fs::read(dir.path().join("example.com/a/b/c.html")).unwrap();
        assert_eq!(on_disk, first.body);

        let second = handler.handle("/example.com/a/b/c.html").await.unwrap();
        assert_eq!(second.lookup, CacheLookup::Hit);
        assert_eq!(second.body, first.body);
        assert_eq!(origin.calls(), 1);
    }

    #[tokio::test]
    async fn existing_file_is_served_without_origin() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("example.com/x")).unwrap();
        std::fs::write(dir.path().join("example.com/x/y.txt"), b"pre-seeded").unwrap();
        let origin = FakeOrigin::ok();
        let handler = handler(&dir, origin.clone(), false).await;

        let served = handler.handle("/example.com/x/y.txt").await.unwrap();
        assert_eq!(served.lookup, CacheLookup::Hit);
        assert_eq!(served.body, Bytes::from_static(b"pre-seeded"));
        assert_eq!(origin.calls(), 0);
    }

    #[tokio::test]
    async fn origin_failure_leaves_no_entry() {
        let dir = TempDir::new().unwrap();
        let origin = FakeOrigin::build(Duration::ZERO, Some(FetchCause::UpstreamStatus(404)));
        let handler = handler(&dir, origin, false).await;

        let err = handler.handle("/example.com/missing").await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(err.reason(), "upstream_status");
        assert!(!dir.path().join("example.com/missing").exists());
    }

    #[tokio::test]
    async fn timeout_maps_to_gateway_timeout() {
        let dir = TempDir::new().unwrap();
        let origin = FakeOrigin::build(Duration::ZERO, Some(FetchCause::Timeout));
        let handler = handler(&dir, origin, false).await;

        let err = handler.handle("/example.com/slow").await.unwrap_err();
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
        assert!(!dir.path().join("example.com/slow").exists());
    }

    #[tokio::test]
    async fn invalid_path_never_reaches_origin() {
        let dir = TempDir::new().unwrap();
        let origin = FakeOrigin::ok();
        let handler = handler(&dir, origin.clone(), false).await;

        let err = handler.handle("/../etc/passwd").await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(matches!(err, RequestError::Path(PathError::Traversal(_))));
        assert_eq!(origin.calls(), 0);
    }

    #[tokio::test]
    async fn persist_failure_still_serves_body() {
        let dir = TempDir::new().unwrap();
        let origin = FakeOrigin::ok();
        let handler = handler(&dir, origin, false).await;

        handler.handle("/example.com/a").await.unwrap();
        let served = handler.handle("/example.com/a/b").await.unwrap();
        assert_eq!(served.store, Some(CacheStoreOutcome::Failed));
        assert_eq!(served.body, Bytes::from("body of http://example.com/a/b"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_without_coalescing_each_fetch() {
        let dir = TempDir::new().unwrap();
        let origin = FakeOrigin::build(Duration::from_millis(100), None);
        let handler = Arc::new(handler(&dir, origin.clone(), false).await);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let handler = handler.clone();
            tasks.push(tokio::spawn(async move {
                handler.handle("/example.com/tile.png").await
            }));
        }
        for task in tasks {
            let served = task.await.unwrap().unwrap();
            assert_eq!(served.body, Bytes::from("body of http://example.com/tile.png"));
        }
        assert_eq!(origin.calls(), 8);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn coalescing_shares_one_fetch() {
        let dir = TempDir::new().unwrap();
        let origin = FakeOrigin::build(Duration::from_millis(200), None);
        let handler = Arc::new(handler(&dir, origin.clone(), true).await);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let handler = handler.clone();
            tasks.push(tokio::spawn(async move {
                handler.handle("/example.com/tile.png").await
            }));
        }
        let mut stored = 0;
        for task in tasks {
            let served = task.await.unwrap().unwrap();
            assert_eq!(served.lookup, CacheLookup::Miss);
            if served.store == Some(CacheStoreOutcome::Stored) {
                stored += 1;
            }
        }
        assert_eq!(origin.calls(), 1);
        assert_eq!(stored, 1);
    }

    #[test]
    fn error_reasons_are_stable() {
        let url: Uri = "http://example.com/x".parse().unwrap();
        let err = RequestError::from(FetchError::new(&url, FetchCause::BodyTooLarge, "big"));
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(err.reason(), "body_too_large");
        assert_eq!(err.origin(), Some("http://example.com/x"));
        assert_eq!(RequestError::from(PathError::Empty).reason(), "invalid_path");
    }
}
