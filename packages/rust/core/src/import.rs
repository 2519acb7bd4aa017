//! Seeding a batch from a JSON-lines export of subscribers.
//!
//! Each non-empty line is one JSON object. The record id comes from `id` (or
//! `subscriber_id`), falling back to the normalized email. Known contact
//! fields map onto [`RecordInput`]; everything else is kept in `extra`.
//! Importing is idempotent: records already in the batch keep their state.

use std::collections::BTreeMap;
use std::path::Path;

use enrichkit_shared::{
    EnrichError, LookupKind, RecordInput, Result, StateRecord, normalize_email,
};
use enrichkit_storage::Storage;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{info, instrument, warn};

#[derive(Debug, Deserialize)]
struct ImportLine {
    #[serde(default, alias = "subscriber_id")]
    id: Option<Value>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    full_name: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

impl ImportLine {
    fn record_id(&self) -> Option<String> {
        let id = match &self.id {
            Some(Value::String(s)) => Some(s.trim().to_string()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        id.filter(|s| !s.is_empty()).or_else(|| {
            self.email
                .as_deref()
                .map(normalize_email)
                .filter(|e| !e.is_empty())
        })
    }

    fn into_input(self) -> RecordInput {
        RecordInput {
            email: self.email,
            first_name: self.first_name,
            last_name: self.last_name,
            full_name: self.full_name,
            url: self.url,
            extra: self.extra,
        }
    }
}

/// Counts from one import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportReport {
    /// Non-empty lines read.
    pub read: usize,
    pub created: usize,
    /// Lines whose record was already in the batch.
    pub existing: usize,
    /// Lines that were not JSON objects or had no usable id.
    pub invalid: usize,
}

/// Import JSON lines from `reader` into `batch_id` as `Pending` records.
#[instrument(skip_all, fields(batch_id = %batch_id, kind = %kind))]
pub async fn import_records<R>(
    storage: &Storage,
    batch_id: &str,
    kind: LookupKind,
    reader: R,
) -> Result<ImportReport>
where
    R: AsyncBufRead + Unpin,
{
    let mut report = ImportReport::default();
    let mut lines = reader.lines();
    let mut line_no = 0usize;

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| EnrichError::validation(format!("read error: {e}")))?
    {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        report.read += 1;

        let parsed: ImportLine = match serde_json::from_str(line) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(line = line_no, error = %e, "skipping unparseable line");
                report.invalid += 1;
                continue;
            }
        };
        let Some(record_id) = parsed.record_id() else {
            warn!(line = line_no, "skipping line without id or email");
            report.invalid += 1;
            continue;
        };

        let record = StateRecord::new_pending(batch_id, record_id, kind, parsed.into_input());
        if storage.create_state(&record).await? {
            report.created += 1;
        } else {
            report.existing += 1;
        }
    }

    info!(
        read = report.read,
        created = report.created,
        existing = report.existing,
        invalid = report.invalid,
        "import finished"
    );
    Ok(report)
}

/// Import a JSON-lines file.
pub async fn import_file(
    storage: &Storage,
    batch_id: &str,
    kind: LookupKind,
    path: &Path,
) -> Result<ImportReport> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| EnrichError::io(path, e))?;
    import_records(storage, batch_id, kind, BufReader::new(file)).await
}
