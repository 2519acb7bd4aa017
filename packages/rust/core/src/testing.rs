//! Test doubles shared by the core test modules.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use enrichkit_shared::{LookupError, LookupKind, PipelineConfig, RecordInput, StateRecord};
use enrichkit_sources::{AdapterRegistry, NormalizedInput, RawResponse, SourceAdapter};
use enrichkit_storage::Storage;
use uuid::Uuid;

use crate::context::PipelineContext;

type Script = HashMap<String, VecDeque<Result<RawResponse, LookupError>>>;

/// Adapter answering from a per-input script, falling back to success.
#[derive(Clone)]
pub struct ScriptedAdapter {
    kind: LookupKind,
    pub calls: Arc<AtomicUsize>,
    script: Arc<Mutex<Script>>,
    delay: Duration,
    discover: bool,
}

impl ScriptedAdapter {
    pub fn new(kind: LookupKind) -> Self {
        Self {
            kind,
            calls: Arc::new(AtomicUsize::new(0)),
            script: Arc::new(Mutex::new(HashMap::new())),
            delay: Duration::ZERO,
            discover: false,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Default answers carry a profile URL derived from the input.
    pub fn discovering(mut self) -> Self {
        self.discover = true;
        self
    }

    /// Queue answers for the input identified by `key` (email, id or url).
    pub fn script(&self, key: &str, answers: Vec<Result<RawResponse, LookupError>>) {
        self.script
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .extend(answers);
    }

    /// Answer `err` for every call on `key`.
    pub fn always_fail(&self, key: &str, err: LookupError, times: usize) {
        self.script(key, (0..times).map(|_| Err(err.clone())).collect());
    }
}

fn key_of(input: &NormalizedInput) -> String {
    match input {
        NormalizedInput::Person { email, .. } | NormalizedInput::Email { email } => email.clone(),
        NormalizedInput::Subscriber { id } => id.clone(),
        NormalizedInput::Page { url } => url.clone(),
    }
}

#[async_trait]
impl SourceAdapter for ScriptedAdapter {
    fn kind(&self) -> LookupKind {
        self.kind
    }

    fn name(&self) -> &str {
        "scripted"
    }

    async fn fetch(
        &self,
        input: &NormalizedInput,
        _timeout: Duration,
    ) -> Result<RawResponse, LookupError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let key = key_of(input);
        let scripted = self
            .script
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(VecDeque::pop_front);
        if let Some(answer) = scripted {
            return answer;
        }

        let mut raw = raw_ok(&key);
        if self.discover {
            let slug: String = key
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
                .collect();
            raw.discovered_url = Some(format!("https://profiles.example.com/in/{slug}"));
        }
        Ok(raw)
    }
}

pub fn raw_ok(tag: &str) -> RawResponse {
    let mut fields = serde_json::Map::new();
    fields.insert("value".into(), tag.into());
    RawResponse {
        fields,
        discovered_url: None,
    }
}

pub fn email_input(email: &str) -> RecordInput {
    RecordInput {
        email: Some(email.to_string()),
        first_name: Some("Test".into()),
        last_name: Some("Person".into()),
        ..Default::default()
    }
}

pub fn temp_db_path() -> PathBuf {
    std::env::temp_dir().join(format!("ek_core_test_{}.db", Uuid::now_v7()))
}

pub async fn temp_storage() -> Arc<Storage> {
    Arc::new(Storage::open(&temp_db_path()).await.expect("open test db"))
}

/// Small delays and pages so tests exercise retries and paging quickly.
pub fn test_config() -> PipelineConfig {
    PipelineConfig {
        workers: 4,
        page_size: 2,
        max_retries: 3,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(40),
        lookup_timeout: Duration::from_secs(5),
        persistent_cache: false,
        rate_limits: HashMap::new(),
        ..PipelineConfig::default()
    }
}

pub async fn test_context(
    adapter: impl SourceAdapter + 'static,
    tweak: impl FnOnce(&mut PipelineConfig),
) -> Arc<PipelineContext> {
    context_with(temp_storage().await, vec![Arc::new(adapter)], tweak)
}

pub fn context_with(
    storage: Arc<Storage>,
    adapters: Vec<Arc<dyn SourceAdapter>>,
    tweak: impl FnOnce(&mut PipelineConfig),
) -> Arc<PipelineContext> {
    let mut registry = AdapterRegistry::new();
    for adapter in adapters {
        registry.register_arc(adapter);
    }
    let mut config = test_config();
    tweak(&mut config);
    Arc::new(PipelineContext::new(storage, registry, config))
}

/// Seed `Pending` records keyed by their email.
pub async fn seed(storage: &Storage, batch: &str, kind: LookupKind, emails: &[&str]) {
    for email in emails {
        let record = StateRecord::new_pending(batch, *email, kind, email_input(email));
        storage.create_state(&record).await.expect("seed record");
    }
}
