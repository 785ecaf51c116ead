use super::interface::{DecodeEngine, DecoderBackend, RenderTarget};
use crate::error::EngineError;
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

static GLOBAL_LIBRARY: OnceLock<Arc<SharedLibrary>> = OnceLock::new();

#[derive(Debug, Default)]
struct LibraryState {
    loaded: bool,
    users: usize,
}

/// Process-wide handle on the decoding library.
///
/// The library is loaded on first acquisition and unloaded when the last
/// lease is released. Loading happens under the state lock, so concurrent
/// acquirers share a single load.
pub struct SharedLibrary {
    backend: Arc<dyn DecoderBackend>,
    state: Mutex<LibraryState>,
}

impl SharedLibrary {
    pub fn new(backend: Arc<dyn DecoderBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            state: Mutex::new(LibraryState::default()),
        })
    }

    /// Process-wide instance. The first backend installed wins; later
    /// callers get the existing library.
    pub fn global(backend: Arc<dyn DecoderBackend>) -> Arc<Self> {
        GLOBAL_LIBRARY
            .get_or_init(|| Self::new(backend))
            .clone()
    }

    /// Take a reference on the library, loading it if this is the first user
    pub async fn acquire(self: &Arc<Self>) -> Result<LibraryLease, EngineError> {
        let mut state = self.state.lock().await;

        if !state.loaded {
            info!("Loading decoder library");
            self.backend.load().await?;
            state.loaded = true;
        }

        state.users += 1;
        debug!("Decoder library acquired ({} users)", state.users);

        Ok(LibraryLease {
            library: Some(Arc::clone(self)),
        })
    }

    pub async fn user_count(&self) -> usize {
        self.state.lock().await.users
    }

    pub async fn is_loaded(&self) -> bool {
        self.state.lock().await.loaded
    }

    async fn release_one(&self) {
        let mut state = self.state.lock().await;
        state.users = state.users.saturating_sub(1);
        debug!("Decoder library released ({} users left)", state.users);

        if state.users == 0 && state.loaded {
            info!("Last decoder user released; unloading library");
            self.backend.unload().await;
            state.loaded = false;
        }
    }
}

/// One user's reference on the shared library
pub struct LibraryLease {
    library: Option<Arc<SharedLibrary>>,
}

impl LibraryLease {
    pub async fn create_engine(
        &self,
        target: &RenderTarget,
    ) -> Result<Arc<dyn DecodeEngine>, EngineError> {
        match &self.library {
            Some(library) => library.backend.create_engine(target).await,
            None => Err(EngineError::new(
                "InvalidStateError",
                "decoder library lease already released",
            )),
        }
    }

    pub async fn release(mut self) {
        if let Some(library) = self.library.take() {
            library.release_one().await;
        }
    }
}

impl Drop for LibraryLease {
    fn drop(&mut self) {
        if let Some(library) = self.library.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { library.release_one().await });
                }
                Err(_) => warn!("Decoder library lease dropped outside a runtime; not released"),
            }
        }
    }
}
