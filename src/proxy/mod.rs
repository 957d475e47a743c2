pub mod cache;
pub mod handler;
pub mod http;
pub mod listener;
pub mod origin;
pub mod path;

use std::sync::Arc;

use anyhow::Result;

use crate::settings::Settings;

use cache::CacheStore;
use handler::RequestHandler;
use origin::{HttpOrigin, Origin};
use path::PathMapper;

#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub handler: Arc<RequestHandler>,
}

impl AppContext {
    pub fn new(settings: Arc<Settings>, handler: Arc<RequestHandler>) -> Self {
        Self { settings, handler }
    }

    /// Open the cache root and wire the handler to a real HTTP origin.
    pub async fn from_settings(settings: Arc<Settings>) -> Result<Self> {
        let origin: Arc<dyn Origin> = Arc::new(HttpOrigin::from_settings(&settings));
        Self::with_origin(settings, origin).await
    }

    pub async fn with_origin(settings: Arc<Settings>, origin: Arc<dyn Origin>) -> Result<Self> {
        let store = CacheStore::open(settings.cache_dir.clone()).await?;
        let mapper = PathMapper::new(store.root());
        let handler = RequestHandler::new(mapper, store, origin, settings.coalesce_misses);
        Ok(Self::new(settings, Arc::new(handler)))
    }
}

pub async fn run(app: AppContext) -> Result<()> {
    listener::start_listener(app).await
}
