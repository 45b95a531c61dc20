use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::sync::Mutex;
use tracing::{error, info};

use crate::{
    artifact::ArtifactStore,
    error::ServeError,
    inference::{Generator, ModelLoader},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// This call downloaded (if needed) and loaded the model.
    Loaded,
    AlreadyLoaded,
}

/// Owns the process-wide generator. The first successful `ensure_loaded`
/// fills it; later callers reuse it. Loads are serialized by the mutex, so
/// concurrent first requests wait for one load instead of racing.
pub struct ModelSlot {
    store: ArtifactStore,
    loader: Arc<dyn ModelLoader>,
    generator: Mutex<Option<Arc<dyn Generator>>>,
    loaded: AtomicBool,
}

impl ModelSlot {
    pub fn new(store: ArtifactStore, loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            store,
            loader,
            generator: Mutex::new(None),
            loaded: AtomicBool::new(false),
        }
    }

    /// Lock-free read, safe to call while a load is running.
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    pub async fn ensure_loaded(&self) -> Result<(Arc<dyn Generator>, LoadOutcome), ServeError> {
        let mut slot = self.generator.lock().await;
        if let Some(generator) = slot.as_ref() {
            return Ok((generator.clone(), LoadOutcome::AlreadyLoaded));
        }

        match self.load().await {
            Ok(generator) => {
                *slot = Some(generator.clone());
                self.loaded.store(true, Ordering::Release);
                info!("model loaded successfully");
                Ok((generator, LoadOutcome::Loaded))
            }
            Err(err) => {
                error!(%err, kind = err.kind(), "model load failed");
                Err(err)
            }
        }
    }

    pub async fn generator(&self) -> Result<Arc<dyn Generator>, ServeError> {
        self.ensure_loaded().await.map(|(generator, _)| generator)
    }

    async fn load(&self) -> Result<Arc<dyn Generator>, ServeError> {
        let dir = self.store.ensure_present().await?;
        let loader = self.loader.clone();

        info!(path = %dir.display(), "loading model");
        tokio::task::spawn_blocking(move || loader.load(&dir))
            .await
            .map_err(|e| ServeError::Load(format!("load task failed: {e}")))?
            .map_err(|e| ServeError::Load(format!("{e:#}")))
    }
}

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub slot: Arc<ModelSlot>,
    pub max_new_tokens: usize,
}

impl AppState {
    pub fn new(slot: ModelSlot, max_new_tokens: usize) -> Self {
        Self {
            slot: Arc::new(slot),
            max_new_tokens,
        }
    }
}
