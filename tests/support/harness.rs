use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use tilecache::{
    cli::LogFormat,
    proxy::{
        AppContext,
        listener::serve_listener,
        origin::{HttpOrigin, Origin},
    },
    settings::Settings,
};

use super::dirs::TestDirs;
use super::http_utils::{HttpResponse, send_get};
use super::net::wait_for_listener;

fn default_test_settings(listen: SocketAddr, dirs: &TestDirs) -> Settings {
    Settings {
        listen,
        cache_dir: dirs.cache_dir.clone(),
        fetch_timeout: 5,
        client_timeout: 5,
        max_request_header_size: 32 * 1024,
        max_response_header_size: 4096,
        max_body_size: 1024 * 1024,
        content_encoding_gzip: true,
        coalesce_misses: false,
        log: LogFormat::Text,
        metrics_listen: None,
    }
}

pub struct GatewayHarness {
    pub dirs: TestDirs,
    pub addr: SocketAddr,
    pub settings: Arc<Settings>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<Result<()>>,
}

impl GatewayHarness {
    pub async fn get(&self, path: &str) -> Result<HttpResponse> {
        send_get(self.addr, path).await
    }

    /// Stop accepting and wait for the listener task to return.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.handle.await?
    }
}

#[derive(Default)]
pub struct GatewayHarnessBuilder {
    origin: Option<Arc<dyn Origin>>,
    settings_override: Option<Box<dyn FnOnce(&mut Settings) + Send>>,
}

impl GatewayHarnessBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_origin(mut self, origin: Arc<dyn Origin>) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn with_settings<F>(mut self, func: F) -> Self
    where
        F: FnOnce(&mut Settings) + Send + 'static,
    {
        self.settings_override = Some(Box::new(func));
        self
    }

    pub async fn spawn(mut self) -> Result<GatewayHarness> {
        let dirs = TestDirs::new()?;
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let mut settings = default_test_settings(addr, &dirs);
        if let Some(override_fn) = self.settings_override.take() {
            override_fn(&mut settings);
        }
        let settings = Arc::new(settings);

        let origin = self
            .origin
            .take()
            .unwrap_or_else(|| Arc::new(HttpOrigin::from_settings(&settings)));
        let app = AppContext::with_origin(settings.clone(), origin).await?;

        let (tx, rx) = oneshot::channel();
        let handle = tokio::spawn(serve_listener(listener, app, async move {
            let _ = rx.await;
        }));
        wait_for_listener(addr).await?;

        Ok(GatewayHarness {
            dirs,
            addr,
            settings,
            shutdown: Some(tx),
            handle,
        })
    }
}
