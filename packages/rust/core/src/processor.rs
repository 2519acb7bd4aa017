//! One unit of lookup work.
//!
//! Order of operations for a lookup:
//! 1. normalize the record for the lookup kind
//! 2. fingerprint the normalized input
//! 3. memory cache (single-flight across concurrent callers)
//! 4. persistent cache, when enabled
//! 5. rate limiter, then the adapter under the per-call timeout
//! 6. validate, then write through to both caches
//!
//! The processor never touches record state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use enrichkit_shared::{LookupError, LookupKind, Payload, RecordId, RecordInput, normalize_url};
use enrichkit_sources::{NormalizedInput, RawResponse};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use crate::context::PipelineContext;
use crate::pool::{Task, TaskProcessor};

/// Cache key for a normalized lookup input.
pub fn fingerprint(kind: LookupKind, input: &NormalizedInput) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(input.canonical().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Turn a raw adapter answer into a payload, or reject it.
pub fn validate(raw: RawResponse) -> Result<Payload, LookupError> {
    if raw.fields.is_empty() {
        return Err(LookupError::InvalidResponse("response has no fields".into()));
    }
    let discovered_url = raw
        .discovered_url
        .map(|url| {
            normalize_url(&url).map_err(|e| {
                LookupError::InvalidResponse(format!("bad discovered url '{url}': {e}"))
            })
        })
        .transpose()?;

    Ok(Payload {
        fields: raw.fields,
        discovered_url,
    })
}

/// Runs lookups against the context's cache, limiters and adapters.
pub struct LookupProcessor {
    ctx: Arc<PipelineContext>,
}

impl LookupProcessor {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }

    /// Resolve one lookup for a record.
    #[instrument(skip_all, fields(record_id = %record_id, kind = %kind))]
    pub async fn process(
        &self,
        record_id: &RecordId,
        input: &RecordInput,
        kind: LookupKind,
    ) -> Result<Payload, LookupError> {
        let normalized = NormalizedInput::from_record(kind, record_id, input)?;
        let key = fingerprint(kind, &normalized);
        let ttl = self.ctx.config.ttl_for(kind);

        let cached = self
            .ctx
            .cache
            .get_or_try_insert_with(&key, ttl, self.resolve(kind, &key, &normalized, ttl))
            .await?;
        debug!(source = ?cached.source, "lookup resolved");
        Ok(cached.value)
    }

    /// Everything behind the memory cache.
    async fn resolve(
        &self,
        kind: LookupKind,
        key: &str,
        normalized: &NormalizedInput,
        ttl: Duration,
    ) -> Result<Payload, LookupError> {
        if let Some(payload) = self.read_persistent(key).await {
            debug!("persistent cache hit");
            return Ok(payload);
        }

        let adapter = self
            .ctx
            .registry
            .get(kind)
            .ok_or_else(|| LookupError::NotFound(format!("no source registered for {kind}")))?;

        self.ctx.limiters.acquire(kind).await;

        let timeout = self.ctx.config.lookup_timeout;
        let raw = tokio::time::timeout(timeout, adapter.fetch(normalized, timeout))
            .await
            .map_err(|_| LookupError::Timeout(timeout))??;

        let payload = validate(raw)?;
        self.write_persistent(kind, key, &payload, ttl).await;
        Ok(payload)
    }

    /// Persistent cache read. Backend and decode failures count as a miss.
    async fn read_persistent(&self, key: &str) -> Option<Payload> {
        if !self.ctx.config.persistent_cache {
            return None;
        }
        match self.ctx.storage.get_cached(key).await {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(payload) => Some(payload),
                Err(e) => {
                    warn!(error = %e, "undecodable persistent cache entry, ignoring");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "persistent cache read failed, treating as miss");
                None
            }
        }
    }

    async fn write_persistent(&self, kind: LookupKind, key: &str, payload: &Payload, ttl: Duration) {
        if !self.ctx.config.persistent_cache {
            return;
        }
        let json = match serde_json::to_string(payload) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "could not encode payload for persistent cache");
                return;
            }
        };
        if let Err(e) = self.ctx.storage.set_cached(key, kind, &json, ttl).await {
            warn!(error = %e, "persistent cache write failed");
        }
    }
}

#[async_trait]
impl TaskProcessor for LookupProcessor {
    async fn process(&self, task: &Task) -> Result<Payload, LookupError> {
        LookupProcessor::process(self, &task.record_id, &task.input, task.kind).await
    }
}
