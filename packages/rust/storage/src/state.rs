//! Durable per-record progress keyed by `(batch_id, record_id)`.
//!
//! Saves use optimistic concurrency on a monotonic `version`. Re-saving a
//! record's current terminal status is a no-op. Every applied status change is
//! appended to `state_transitions`.

use chrono::Utc;
use enrichkit_shared::{
    BatchCounts, EnrichError, FailureReason, LookupKind, RecordId, RecordStatus, Result,
    StackItem, StateRecord,
};
use libsql::{Connection, Row, params};

use crate::{Storage, col, parse_time, stack};

const STATE_COLUMNS: &str = "batch_id, record_id, kind, input_json, status, attempt_count, \
     last_error, failure, payload_json, version, updated_at";

/// Statuses that still need work.
const PENDING_STATUSES: &str = "('pending', 'in_progress', 'failed')";

/// Result of [`Storage::save_state`].
#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    /// The write went through; carries the record at its new version.
    Applied(StateRecord),
    /// The record already held this terminal status; carries the stored row.
    Unchanged(StateRecord),
}

impl SaveOutcome {
    pub fn record(&self) -> &StateRecord {
        match self {
            Self::Applied(r) | Self::Unchanged(r) => r,
        }
    }

    pub fn into_record(self) -> StateRecord {
        match self {
            Self::Applied(r) | Self::Unchanged(r) => r,
        }
    }

    pub fn applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

impl Storage {
    // -----------------------------------------------------------------------
    // Record state operations
    // -----------------------------------------------------------------------

    /// Insert `record` as version 1 unless the key already exists.
    ///
    /// Returns `false` when the record was already present; existing progress
    /// is never overwritten.
    pub async fn create_state(&self, record: &StateRecord) -> Result<bool> {
        let (_gate, tx) = self.begin().await?;
        let outcome = insert_if_absent(&tx, record).await;
        Self::finish(tx, outcome).await
    }

    /// Load one record.
    pub async fn load_state(
        &self,
        batch_id: &str,
        record_id: &RecordId,
    ) -> Result<Option<StateRecord>> {
        load_on(&self.conn, batch_id, record_id).await
    }

    /// Persist a status change.
    ///
    /// Fails with [`EnrichError::StaleVersion`] when the stored version is not
    /// `record.version`, and with [`EnrichError::InvalidTransition`] when the
    /// state machine forbids the edge.
    pub async fn save_state(&self, record: &StateRecord) -> Result<SaveOutcome> {
        let (_gate, tx) = self.begin().await?;
        let outcome = apply_save(&tx, record).await;
        Self::finish(tx, outcome).await
    }

    /// Save a `Succeeded` record and push its discovered URL in one transaction.
    ///
    /// Either both writes land or neither does. Returns the save outcome and,
    /// when a push was attempted, whether the URL was new to the stack.
    pub async fn commit_success(
        &self,
        record: &StateRecord,
        push: Option<(&str, &StackItem)>,
    ) -> Result<(SaveOutcome, Option<bool>)> {
        if record.status != RecordStatus::Succeeded {
            return Err(EnrichError::validation(format!(
                "commit_success called with status {}",
                record.status
            )));
        }

        let (_gate, tx) = self.begin().await?;
        let outcome = async {
            let saved = apply_save(&tx, record).await?;
            let pushed = match push {
                Some((stack_name, item)) if saved.applied() => {
                    Some(stack::push_on(&tx, stack_name, item).await?)
                }
                _ => None,
            };
            Ok::<_, EnrichError>((saved, pushed))
        }
        .await;
        Self::finish(tx, outcome).await
    }

    /// Explicitly move a record back to `Pending`, whatever its status.
    ///
    /// Clears attempts, error, failure reason and payload.
    pub async fn reset_state(
        &self,
        batch_id: &str,
        record_id: &RecordId,
    ) -> Result<Option<StateRecord>> {
        let (_gate, tx) = self.begin().await?;
        let outcome = async {
            let Some(current) = load_on(&tx, batch_id, record_id).await? else {
                return Ok(None);
            };
            let reset = StateRecord {
                status: RecordStatus::Pending,
                attempt_count: 0,
                last_error: None,
                failure: None,
                payload: None,
                ..current.clone()
            };
            let saved = write_update(&tx, &current, &reset).await?;
            Ok::<_, EnrichError>(Some(saved))
        }
        .await;
        Self::finish(tx, outcome).await
    }

    /// Reset every `FailedPermanently` record of a batch. Returns how many.
    pub async fn reset_failed(&self, batch_id: &str) -> Result<u64> {
        let (_gate, tx) = self.begin().await?;
        let now = Utc::now().to_rfc3339();
        let outcome = async {
            tx.execute(
                "INSERT INTO state_transitions
                   (batch_id, record_id, from_status, to_status, attempt_count, version, at)
                 SELECT batch_id, record_id, status, 'pending', 0, version + 1, ?2
                 FROM record_state WHERE batch_id = ?1 AND status = 'failed_permanently'",
                params![batch_id, now.as_str()],
            )
            .await
            .map_err(EnrichError::storage)?;

            tx.execute(
                "UPDATE record_state SET
                   status = 'pending', attempt_count = 0, last_error = NULL,
                   failure = NULL, payload_json = NULL,
                   version = version + 1, updated_at = ?2
                 WHERE batch_id = ?1 AND status = 'failed_permanently'",
                params![batch_id, now.as_str()],
            )
            .await
            .map_err(EnrichError::storage)
        }
        .await;
        Self::finish(tx, outcome).await
    }

    /// Lazy cursor over the non-terminal records of a batch, by record id.
    pub fn list_pending(&self, batch_id: &str, page_size: u32) -> PendingCursor<'_> {
        PendingCursor {
            storage: self,
            batch_id: batch_id.to_string(),
            page_size: page_size.max(1),
            kind: None,
            after: None,
            exhausted: false,
        }
    }

    /// Records of a batch with the given status, by record id.
    pub async fn list_by_status(
        &self,
        batch_id: &str,
        status: RecordStatus,
        limit: u32,
    ) -> Result<Vec<StateRecord>> {
        let sql = format!(
            "SELECT {STATE_COLUMNS} FROM record_state
             WHERE batch_id = ?1 AND status = ?2
             ORDER BY record_id LIMIT ?3"
        );
        let mut rows = self
            .conn
            .query(&sql, params![batch_id, status.as_str(), limit as i64])
            .await
            .map_err(EnrichError::storage)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(EnrichError::storage)? {
            results.push(row_to_state(&row)?);
        }
        Ok(results)
    }

    /// Progress counts for a batch.
    pub async fn batch_counts(&self, batch_id: &str) -> Result<BatchCounts> {
        let mut rows = self
            .conn
            .query(
                "SELECT status, failure, COUNT(*) FROM record_state
                 WHERE batch_id = ?1 GROUP BY status, failure",
                params![batch_id],
            )
            .await
            .map_err(EnrichError::storage)?;

        let mut counts = BatchCounts::default();
        while let Some(row) = rows.next().await.map_err(EnrichError::storage)? {
            let status: RecordStatus = col::<String>(&row, 0)?.parse()?;
            let failure = col::<Option<String>>(&row, 1)?;
            let n = col::<i64>(&row, 2)? as u64;
            match status {
                RecordStatus::Pending => counts.pending += n,
                RecordStatus::InProgress => counts.in_progress += n,
                RecordStatus::Failed => counts.failed_retrying += n,
                RecordStatus::Succeeded => counts.succeeded += n,
                RecordStatus::FailedPermanently => {
                    if failure.as_deref().and_then(FailureReason::parse)
                        == Some(FailureReason::Exhausted)
                    {
                        counts.failed_exhausted += n;
                    } else {
                        counts.failed_permanently += n;
                    }
                }
            }
        }
        Ok(counts)
    }

    /// How many times a record entered a terminal status.
    pub async fn terminal_transition_count(
        &self,
        batch_id: &str,
        record_id: &RecordId,
    ) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM state_transitions
                 WHERE batch_id = ?1 AND record_id = ?2
                   AND to_status IN ('succeeded', 'failed_permanently')",
                params![batch_id, record_id.as_str()],
            )
            .await
            .map_err(EnrichError::storage)?;

        match rows.next().await.map_err(EnrichError::storage)? {
            Some(row) => Ok(col::<i64>(&row, 0)? as u64),
            None => Ok(0),
        }
    }
}

// ---------------------------------------------------------------------------
// PendingCursor
// ---------------------------------------------------------------------------

/// Keyset-paged cursor over non-terminal records (`Pending`, `InProgress`,
/// `Failed`), ordered by record id.
///
/// Each page is a fresh query, so rows written between pages are observed.
pub struct PendingCursor<'a> {
    storage: &'a Storage,
    batch_id: String,
    page_size: u32,
    kind: Option<LookupKind>,
    after: Option<String>,
    exhausted: bool,
}

impl PendingCursor<'_> {
    /// Only yield records staged for `kind`.
    pub fn of_kind(mut self, kind: LookupKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Fetch the next page. An empty page means the cursor is exhausted.
    pub async fn next_page(&mut self) -> Result<Vec<StateRecord>> {
        if self.exhausted {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT {STATE_COLUMNS} FROM record_state
             WHERE batch_id = ?1 AND status IN {PENDING_STATUSES}
               AND (?2 IS NULL OR record_id > ?2)
               AND (?3 IS NULL OR kind = ?3)
             ORDER BY record_id LIMIT ?4"
        );
        let mut rows = self
            .storage
            .conn
            .query(
                &sql,
                params![
                    self.batch_id.as_str(),
                    self.after.as_deref(),
                    self.kind.map(|k| k.as_str()),
                    self.page_size as i64
                ],
            )
            .await
            .map_err(EnrichError::storage)?;

        let mut page = Vec::new();
        while let Some(row) = rows.next().await.map_err(EnrichError::storage)? {
            page.push(row_to_state(&row)?);
        }

        if (page.len() as u32) < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.after = Some(last.record_id.0.clone());
        }
        Ok(page)
    }

    /// Start over from the lowest record id.
    pub fn restart(&mut self) {
        self.after = None;
        self.exhausted = false;
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

// ---------------------------------------------------------------------------
// Statement helpers (usable inside a transaction)
// ---------------------------------------------------------------------------

pub(crate) async fn load_on(
    conn: &Connection,
    batch_id: &str,
    record_id: &RecordId,
) -> Result<Option<StateRecord>> {
    let sql = format!(
        "SELECT {STATE_COLUMNS} FROM record_state WHERE batch_id = ?1 AND record_id = ?2"
    );
    let mut rows = conn
        .query(&sql, params![batch_id, record_id.as_str()])
        .await
        .map_err(EnrichError::storage)?;

    match rows.next().await.map_err(EnrichError::storage)? {
        Some(row) => Ok(Some(row_to_state(&row)?)),
        None => Ok(None),
    }
}

pub(crate) async fn insert_if_absent(conn: &Connection, record: &StateRecord) -> Result<bool> {
    let input_json = to_json(&record.input)?;
    let payload_json = record.payload.as_ref().map(to_json).transpose()?;
    let now = Utc::now().to_rfc3339();

    let inserted = conn
        .execute(
            "INSERT INTO record_state
               (batch_id, record_id, kind, input_json, status, attempt_count,
                last_error, failure, payload_json, version, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 1, ?10)
             ON CONFLICT(batch_id, record_id) DO NOTHING",
            params![
                record.batch_id.as_str(),
                record.record_id.as_str(),
                record.kind.as_str(),
                input_json.as_str(),
                record.status.as_str(),
                record.attempt_count as i64,
                record.last_error.as_deref(),
                record.failure.map(|f| f.as_str()),
                payload_json.as_deref(),
                now.as_str()
            ],
        )
        .await
        .map_err(EnrichError::storage)?;

    if inserted > 0 {
        log_transition(conn, record, None, 1, &now).await?;
    }
    Ok(inserted > 0)
}

async fn apply_save(conn: &Connection, record: &StateRecord) -> Result<SaveOutcome> {
    let Some(current) = load_on(conn, &record.batch_id, &record.record_id).await? else {
        if record.version != 0 {
            return Err(stale(record));
        }
        insert_if_absent(conn, record).await?;
        let created = load_on(conn, &record.batch_id, &record.record_id)
            .await?
            .ok_or_else(|| EnrichError::Storage("inserted record vanished".into()))?;
        return Ok(SaveOutcome::Applied(created));
    };

    if current.status.is_terminal() && current.status == record.status {
        return Ok(SaveOutcome::Unchanged(current));
    }
    if current.version != record.version {
        return Err(stale(record));
    }
    if !current.status.can_transition_to(record.status) {
        return Err(EnrichError::InvalidTransition {
            record_id: record.record_id.to_string(),
            from: current.status.to_string(),
            to: record.status.to_string(),
        });
    }

    Ok(SaveOutcome::Applied(
        write_update(conn, &current, record).await?,
    ))
}

/// Version-checked update from `current` to `next`, logging status changes.
async fn write_update(
    conn: &Connection,
    current: &StateRecord,
    next: &StateRecord,
) -> Result<StateRecord> {
    let input_json = to_json(&next.input)?;
    let payload_json = next.payload.as_ref().map(to_json).transpose()?;
    let new_version = current.version + 1;
    let now = Utc::now();
    let now_str = now.to_rfc3339();

    let updated = conn
        .execute(
            "UPDATE record_state SET
               input_json = ?3, status = ?4, attempt_count = ?5, last_error = ?6,
               failure = ?7, payload_json = ?8, version = ?9, updated_at = ?10
             WHERE batch_id = ?1 AND record_id = ?2 AND version = ?11",
            params![
                next.batch_id.as_str(),
                next.record_id.as_str(),
                input_json.as_str(),
                next.status.as_str(),
                next.attempt_count as i64,
                next.last_error.as_deref(),
                next.failure.map(|f| f.as_str()),
                payload_json.as_deref(),
                new_version,
                now_str.as_str(),
                current.version
            ],
        )
        .await
        .map_err(EnrichError::storage)?;

    if updated == 0 {
        return Err(stale(current));
    }

    let saved = StateRecord {
        version: new_version,
        updated_at: now,
        ..next.clone()
    };
    if current.status != next.status {
        log_transition(conn, &saved, Some(current.status), new_version, &now_str).await?;
    }
    Ok(saved)
}

async fn log_transition(
    conn: &Connection,
    record: &StateRecord,
    from: Option<RecordStatus>,
    version: i64,
    at: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO state_transitions
           (batch_id, record_id, from_status, to_status, attempt_count, version, at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            record.batch_id.as_str(),
            record.record_id.as_str(),
            from.map(|s| s.as_str()),
            record.status.as_str(),
            record.attempt_count as i64,
            version,
            at
        ],
    )
    .await
    .map_err(EnrichError::storage)?;
    Ok(())
}

fn stale(record: &StateRecord) -> EnrichError {
    EnrichError::StaleVersion {
        record_id: record.record_id.to_string(),
        expected: record.version,
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| EnrichError::Storage(format!("encode: {e}")))
}

fn row_to_state(row: &Row) -> Result<StateRecord> {
    let kind: LookupKind = col::<String>(row, 2)?.parse()?;
    let input = serde_json::from_str(&col::<String>(row, 3)?)
        .map_err(|e| EnrichError::Storage(format!("decode input: {e}")))?;
    let status: RecordStatus = col::<String>(row, 4)?.parse()?;
    let payload = col::<Option<String>>(row, 8)?
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| EnrichError::Storage(format!("decode payload: {e}")))?;

    Ok(StateRecord {
        batch_id: col(row, 0)?,
        record_id: RecordId(col(row, 1)?),
        kind,
        input,
        status,
        attempt_count: col::<i64>(row, 5)? as u32,
        last_error: col(row, 6)?,
        failure: col::<Option<String>>(row, 7)?
            .as_deref()
            .and_then(FailureReason::parse),
        payload,
        version: col(row, 9)?,
        updated_at: parse_time(&col::<String>(row, 10)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_storage;
    use enrichkit_shared::{Payload, RecordInput};
    use uuid::Uuid;

    fn pending(batch: &str, id: &str) -> StateRecord {
        StateRecord::new_pending(
            batch,
            id,
            LookupKind::LinkedinSearch,
            RecordInput {
                email: Some(format!("{id}@example.com")),
                ..Default::default()
            },
        )
    }

    async fn seeded(storage: &Storage, batch: &str, id: &str) -> StateRecord {
        assert!(storage.create_state(&pending(batch, id)).await.unwrap());
        storage
            .load_state(batch, &RecordId::from(id))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let storage = test_storage().await;
        let rec = seeded(&storage, "b1", "r1").await;
        assert_eq!(rec.version, 1);

        let in_progress = storage
            .save_state(&rec.with_status(RecordStatus::InProgress))
            .await
            .unwrap()
            .into_record();

        // Re-importing the same record must not reset progress.
        assert!(!storage.create_state(&pending("b1", "r1")).await.unwrap());
        let loaded = storage
            .load_state("b1", &RecordId::from("r1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status, RecordStatus::InProgress);
        assert_eq!(loaded.version, in_progress.version);
        assert_eq!(loaded.input.email.as_deref(), Some("r1@example.com"));
    }

    #[tokio::test]
    async fn save_bumps_version_and_rejects_stale() {
        let storage = test_storage().await;
        let rec = seeded(&storage, "b1", "r1").await;

        let saved = storage
            .save_state(&rec.with_status(RecordStatus::InProgress))
            .await
            .unwrap();
        assert!(saved.applied());
        assert_eq!(saved.record().version, 2);

        // Writing from the old version loses.
        let err = storage
            .save_state(&rec.with_status(RecordStatus::InProgress))
            .await
            .unwrap_err();
        assert!(matches!(err, EnrichError::StaleVersion { expected: 1, .. }));
    }

    #[tokio::test]
    async fn save_rejects_forbidden_edge() {
        let storage = test_storage().await;
        let rec = seeded(&storage, "b1", "r1").await;

        let err = storage
            .save_state(&rec.with_status(RecordStatus::Succeeded))
            .await
            .unwrap_err();
        assert!(matches!(err, EnrichError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn terminal_resave_is_noop_and_never_regresses() {
        let storage = test_storage().await;
        let rec = seeded(&storage, "b1", "r1").await;
        let running = storage
            .save_state(&rec.with_status(RecordStatus::InProgress))
            .await
            .unwrap()
            .into_record();
        let mut done = running.with_status(RecordStatus::Succeeded);
        done.payload = Some(Payload::default());
        let done = storage.save_state(&done).await.unwrap().into_record();

        // Same terminal status again, even from a stale copy: no-op.
        let again = storage
            .save_state(&running.with_status(RecordStatus::Succeeded))
            .await
            .unwrap();
        assert!(!again.applied());
        assert_eq!(again.record().version, done.version);

        // Leaving a terminal status needs an explicit reset.
        let err = storage
            .save_state(&done.with_status(RecordStatus::Pending))
            .await
            .unwrap_err();
        assert!(matches!(err, EnrichError::InvalidTransition { .. }));

        assert_eq!(
            storage
                .terminal_transition_count("b1", &RecordId::from("r1"))
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn reset_returns_terminal_record_to_pending() {
        let storage = test_storage().await;
        let rec = seeded(&storage, "b1", "r1").await;
        let mut failed = rec.with_status(RecordStatus::FailedPermanently);
        failed.failure = Some(FailureReason::Permanent);
        failed.last_error = Some("not found".into());
        storage.save_state(&failed).await.unwrap();

        let reset = storage
            .reset_state("b1", &RecordId::from("r1"))
            .await
            .unwrap()
            .expect("record exists");
        assert_eq!(reset.status, RecordStatus::Pending);
        assert_eq!(reset.attempt_count, 0);
        assert!(reset.failure.is_none());
        assert!(reset.last_error.is_none());

        assert!(
            storage
                .reset_state("b1", &RecordId::from("missing"))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn reset_failed_touches_only_terminal_failures() {
        let storage = test_storage().await;
        for id in ["a", "b", "c"] {
            seeded(&storage, "b1", id).await;
        }
        let b = storage.load_state("b1", &RecordId::from("b")).await.unwrap().unwrap();
        storage
            .save_state(&b.with_status(RecordStatus::FailedPermanently))
            .await
            .unwrap();

        assert_eq!(storage.reset_failed("b1").await.unwrap(), 1);
        let counts = storage.batch_counts("b1").await.unwrap();
        assert_eq!(counts.pending, 3);
        assert_eq!(counts.failed_terminal(), 0);
    }

    #[tokio::test]
    async fn pending_cursor_pages_in_record_order() {
        let storage = test_storage().await;
        for id in ["r5", "r1", "r4", "r2", "r3"] {
            seeded(&storage, "b1", id).await;
        }
        seeded(&storage, "other", "r0").await;

        // Make r2 terminal; it must not be listed.
        let r2 = storage.load_state("b1", &RecordId::from("r2")).await.unwrap().unwrap();
        storage
            .save_state(&r2.with_status(RecordStatus::FailedPermanently))
            .await
            .unwrap();

        let mut cursor = storage.list_pending("b1", 2);
        let mut seen = Vec::new();
        loop {
            let page = cursor.next_page().await.unwrap();
            if page.is_empty() {
                break;
            }
            assert!(page.len() <= 2);
            seen.extend(page.into_iter().map(|r| r.record_id.0));
        }
        assert_eq!(seen, vec!["r1", "r3", "r4", "r5"]);
        assert!(cursor.is_exhausted());

        cursor.restart();
        let first = cursor.next_page().await.unwrap();
        assert_eq!(first[0].record_id.as_str(), "r1");
    }

    #[tokio::test]
    async fn pending_cursor_filters_by_kind() {
        let storage = test_storage().await;
        seeded(&storage, "b1", "search").await;
        let mut location = pending("b1", "location");
        location.kind = LookupKind::Location;
        assert!(storage.create_state(&location).await.unwrap());

        let page = storage
            .list_pending("b1", 10)
            .of_kind(LookupKind::Location)
            .next_page()
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].record_id.as_str(), "location");

        let all = storage.list_pending("b1", 10).next_page().await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn batch_counts_split_failure_reasons() {
        let storage = test_storage().await;
        for id in ["a", "b", "c", "d"] {
            seeded(&storage, "b1", id).await;
        }

        let a = storage.load_state("b1", &RecordId::from("a")).await.unwrap().unwrap();
        let a = storage
            .save_state(&a.with_status(RecordStatus::InProgress))
            .await
            .unwrap()
            .into_record();
        storage
            .save_state(&a.with_status(RecordStatus::Succeeded))
            .await
            .unwrap();

        let b = storage.load_state("b1", &RecordId::from("b")).await.unwrap().unwrap();
        let mut b = b.with_status(RecordStatus::FailedPermanently);
        b.failure = Some(FailureReason::Permanent);
        storage.save_state(&b).await.unwrap();

        let c = storage.load_state("b1", &RecordId::from("c")).await.unwrap().unwrap();
        let mut c = c.with_status(RecordStatus::FailedPermanently);
        c.failure = Some(FailureReason::Exhausted);
        storage.save_state(&c).await.unwrap();

        let counts = storage.batch_counts("b1").await.unwrap();
        assert_eq!(counts.succeeded, 1);
        assert_eq!(counts.failed_permanently, 1);
        assert_eq!(counts.failed_exhausted, 1);
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.total(), 4);

        assert_eq!(storage.list_batches().await.unwrap(), vec!["b1".to_string()]);
        let failed = storage
            .list_by_status("b1", RecordStatus::FailedPermanently, 10)
            .await
            .unwrap();
        assert_eq!(failed.len(), 2);
    }

    #[tokio::test]
    async fn commit_success_pushes_atomically() {
        let storage = test_storage().await;
        let rec = seeded(&storage, "b1", "r1").await;
        let running = storage
            .save_state(&rec.with_status(RecordStatus::InProgress))
            .await
            .unwrap()
            .into_record();

        let item = StackItem {
            url: "https://www.linkedin.com/in/ada/".into(),
            record_id: RecordId::from("r1"),
            batch_id: "b1".into(),
            email: Some("r1@example.com".into()),
            pushed_at: Utc::now(),
            consumed: false,
        };

        // A stale version rolls back the push too.
        let stale_copy = rec.with_status(RecordStatus::Succeeded);
        assert!(
            storage
                .commit_success(&stale_copy, Some(("linkedin", &item)))
                .await
                .is_err()
        );
        assert_eq!(storage.stack_size("linkedin").await.unwrap(), 0);

        let (saved, pushed) = storage
            .commit_success(
                &running.with_status(RecordStatus::Succeeded),
                Some(("linkedin", &item)),
            )
            .await
            .unwrap();
        assert!(saved.applied());
        assert_eq!(pushed, Some(true));
        assert_eq!(storage.stack_size("linkedin").await.unwrap(), 1);

        // Redelivery of the same success changes nothing.
        let (again, pushed) = storage
            .commit_success(
                &running.with_status(RecordStatus::Succeeded),
                Some(("linkedin", &item)),
            )
            .await
            .unwrap();
        assert!(!again.applied());
        assert_eq!(pushed, None);
        assert_eq!(storage.stack_size("linkedin").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let tmp = std::env::temp_dir().join(format!("ek_test_{}.db", Uuid::now_v7()));
        {
            let storage = Storage::open(&tmp).await.unwrap();
            for id in ["r1", "r2", "r3"] {
                seeded(&storage, "b1", id).await;
            }
            let r1 = storage.load_state("b1", &RecordId::from("r1")).await.unwrap().unwrap();
            let r1 = storage
                .save_state(&r1.with_status(RecordStatus::InProgress))
                .await
                .unwrap()
                .into_record();
            storage
                .save_state(&r1.with_status(RecordStatus::Succeeded))
                .await
                .unwrap();
            let r2 = storage.load_state("b1", &RecordId::from("r2")).await.unwrap().unwrap();
            storage
                .save_state(&r2.with_status(RecordStatus::InProgress))
                .await
                .unwrap();
            // Dropped here without any shutdown step.
        }

        let storage = Storage::open(&tmp).await.unwrap();
        let mut cursor = storage.list_pending("b1", 10);
        let page = cursor.next_page().await.unwrap();
        let ids: Vec<_> = page.iter().map(|r| r.record_id.as_str()).collect();
        assert_eq!(ids, vec!["r2", "r3"]);
        assert_eq!(page[0].status, RecordStatus::InProgress);
    }
}
