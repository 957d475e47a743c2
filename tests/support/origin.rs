use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration as StdDuration;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct MockRoute {
    pub status: u16,
    pub body: Vec<u8>,
    pub delay: StdDuration,
    pub location: Option<String>,
}

impl MockRoute {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            delay: StdDuration::ZERO,
            location: None,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: b"origin error".to_vec(),
            delay: StdDuration::ZERO,
            location: None,
        }
    }

    pub fn redirect(status: u16, location: impl Into<String>) -> Self {
        Self {
            status,
            body: Vec::new(),
            delay: StdDuration::ZERO,
            location: Some(location.into()),
        }
    }

    pub fn delayed(mut self, delay: StdDuration) -> Self {
        self.delay = delay;
        self
    }
}

/// Minimal HTTP origin that counts requests. Unrouted paths answer 200 with
/// `origin body for <path>`.
pub struct MockOrigin {
    addr: SocketAddr,
    requests: Arc<AtomicUsize>,
    paths: Arc<Mutex<Vec<String>>>,
    handle: JoinHandle<()>,
}

impl MockOrigin {
    pub async fn start() -> Result<Self> {
        Self::with_routes(HashMap::new()).await
    }

    pub async fn with_routes(routes: HashMap<String, MockRoute>) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let requests = Arc::new(AtomicUsize::new(0));
        let paths = Arc::new(Mutex::new(Vec::new()));
        let routes = Arc::new(routes);

        let handle = {
            let requests = requests.clone();
            let paths = paths.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((mut socket, _)) = listener.accept().await else {
                        return;
                    };
                    let requests = requests.clone();
                    let paths = paths.clone();
                    let routes = routes.clone();
                    tokio::spawn(async move {
                        let mut buf = [0u8; 4096];
                        let mut data = Vec::new();
                        loop {
                            let n = socket.read(&mut buf).await.unwrap_or(0);
                            if n == 0 {
                                break;
                            }
                            data.extend_from_slice(&buf[..n]);
                            if data.windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                        if data.is_empty() {
                            return;
                        }

                        let request = String::from_utf8_lossy(&data);
                        let path = request
                            .split_whitespace()
                            .nth(1)
                            .unwrap_or("/")
                            .to_string();
                        requests.fetch_add(1, Ordering::SeqCst);
                        paths.lock().push(path.clone());

                        let route = routes.get(&path).cloned().unwrap_or_else(|| {
                            MockRoute::ok(format!("origin body for {path}").into_bytes())
                        });
                        if !route.delay.is_zero() {
                            tokio::time::sleep(route.delay).await;
                        }
                        let location = route
                            .location
                            .as_ref()
                            .map(|location| format!("Location: {location}\r\n"))
                            .unwrap_or_default();
                        let head = format!(
                            "HTTP/1.0 {} Mock\r\n{location}Content-Length: {}\r\nContent-Type: application/octet-stream\r\n\r\n",
                            route.status,
                            route.body.len()
                        );
                        let _ = socket.write_all(head.as_bytes()).await;
                        let _ = socket.write_all(&route.body).await;
                        let _ = socket.shutdown().await;
                    });
                }
            })
        };

        Ok(Self {
            addr,
            requests,
            paths,
            handle,
        })
    }

    /// Host segment for gateway paths, e.g. `127.0.0.1:40123`.
    pub fn host(&self) -> String {
        self.addr.to_string()
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn paths(&self) -> Vec<String> {
        self.paths.lock().clone()
    }
}

impl Drop for MockOrigin {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
