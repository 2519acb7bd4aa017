//! Shared collaborators for one pipeline process.

use std::sync::Arc;

use enrichkit_cache::LookupCache;
use enrichkit_shared::{EnrichError, LookupError, LookupKind, Payload, PipelineConfig, Result};
use enrichkit_sources::AdapterRegistry;
use enrichkit_storage::Storage;
use tokio::sync::watch;

use crate::rate_limit::RateLimiters;

/// In-memory lookup cache type used by the processor.
pub type MemoryCache = LookupCache<Payload, LookupError>;

/// Global stop request. Cloning shares the same signal.
#[derive(Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Ask every pipeline sharing this signal to stop.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the signal has been triggered.
    pub async fn triggered(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a pipeline run needs, passed explicitly.
pub struct PipelineContext {
    pub storage: Arc<Storage>,
    pub cache: Arc<MemoryCache>,
    pub registry: AdapterRegistry,
    pub limiters: RateLimiters,
    pub config: PipelineConfig,
    stop: StopSignal,
}

impl PipelineContext {
    pub fn new(storage: Arc<Storage>, registry: AdapterRegistry, config: PipelineConfig) -> Self {
        Self {
            storage,
            cache: Arc::new(MemoryCache::new(config.cache_capacity)),
            registry,
            limiters: RateLimiters::new(&config.rate_limits),
            config,
            stop: StopSignal::new(),
        }
    }

    /// A handle that can stop runs using this context.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Fail early when no adapter serves `kind`.
    pub fn require_adapter(&self, kind: LookupKind) -> Result<()> {
        if self.registry.get(kind).is_none() {
            return Err(EnrichError::config(format!(
                "no source configured for lookup kind '{kind}'"
            )));
        }
        Ok(())
    }
}
