//! Persistent LIFO work stack of discovered URLs.
//!
//! Rows in `stack_items` are never deleted: popping only flags them as
//! consumed, so the table is also the durable seen-set. Push and pop are each a
//! single statement, which keeps concurrent pushers from breaking either the
//! dedup or the ordering.

use chrono::Utc;
use enrichkit_shared::{
    EnrichError, LookupKind, RecordId, RecordInput, Result, StackItem, StateRecord, normalize_url,
};
use libsql::{Connection, Row, params};

use crate::{Storage, col, parse_time, state};

const ITEM_COLUMNS: &str = "url, record_id, batch_id, email, pushed_at, consumed";

impl Storage {
    // -----------------------------------------------------------------------
    // Work stack operations
    // -----------------------------------------------------------------------

    /// Push a discovered URL. Returns `false` if the normalized URL was ever
    /// pushed to this stack before, consumed or not.
    pub async fn push_stack(&self, stack: &str, item: &StackItem) -> Result<bool> {
        self.check_writable()?;
        let _gate = self.write_gate.lock().await;
        push_on(&self.conn, stack, item).await
    }

    /// Take the most recently pushed unconsumed item.
    pub async fn pop_stack(&self, stack: &str) -> Result<Option<StackItem>> {
        self.check_writable()?;
        let _gate = self.write_gate.lock().await;
        pop_on(&self.conn, stack).await
    }

    /// Look at the top unconsumed item without taking it.
    pub async fn peek_stack(&self, stack: &str) -> Result<Option<StackItem>> {
        Ok(self.peek_stack_many(stack, 1).await?.into_iter().next())
    }

    /// Up to `limit` unconsumed items, top first.
    pub async fn peek_stack_many(&self, stack: &str, limit: u32) -> Result<Vec<StackItem>> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM stack_items
             WHERE stack = ?1 AND consumed = 0
             ORDER BY seq DESC LIMIT ?2"
        );
        let mut rows = self
            .conn
            .query(&sql, params![stack, limit as i64])
            .await
            .map_err(EnrichError::storage)?;

        let mut items = Vec::new();
        while let Some(row) = rows.next().await.map_err(EnrichError::storage)? {
            items.push(row_to_item(&row)?);
        }
        Ok(items)
    }

    /// Number of unconsumed items.
    pub async fn stack_size(&self, stack: &str) -> Result<u64> {
        self.count(
            "SELECT COUNT(*) FROM stack_items WHERE stack = ?1 AND consumed = 0",
            stack,
        )
        .await
    }

    /// Number of URLs ever pushed (the seen-set size).
    pub async fn stack_seen(&self, stack: &str) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM stack_items WHERE stack = ?1", stack)
            .await
    }

    /// Pop up to `limit` items and seed them as `Pending` records of
    /// `batch_id`, all in one transaction.
    ///
    /// The normalized URL becomes the new record id, and the originating
    /// record is kept in the input's `extra` map.
    pub async fn stage_stack_items(
        &self,
        stack: &str,
        limit: u32,
        batch_id: &str,
        kind: LookupKind,
    ) -> Result<Vec<StateRecord>> {
        let (_gate, tx) = self.begin().await?;
        let outcome = async {
            let mut staged = Vec::new();
            for _ in 0..limit {
                let Some(item) = pop_on(&tx, stack).await? else {
                    break;
                };
                let record = staged_record(&item, batch_id, kind);
                if state::insert_if_absent(&tx, &record).await? {
                    staged.push(record);
                }
            }
            Ok::<_, EnrichError>(staged)
        }
        .await;
        Self::finish(tx, outcome).await
    }

    async fn count(&self, sql: &str, stack: &str) -> Result<u64> {
        let mut rows = self
            .conn
            .query(sql, params![stack])
            .await
            .map_err(EnrichError::storage)?;
        match rows.next().await.map_err(EnrichError::storage)? {
            Some(row) => Ok(col::<i64>(&row, 0)? as u64),
            None => Ok(0),
        }
    }
}

fn staged_record(item: &StackItem, batch_id: &str, kind: LookupKind) -> StateRecord {
    let mut input = RecordInput {
        email: item.email.clone(),
        url: Some(item.url.clone()),
        ..Default::default()
    };
    input
        .extra
        .insert("origin_batch".into(), item.batch_id.clone().into());
    input
        .extra
        .insert("origin_record".into(), item.record_id.0.clone().into());

    StateRecord::new_pending(batch_id, item.url.as_str(), kind, input)
}

pub(crate) async fn push_on(conn: &Connection, stack: &str, item: &StackItem) -> Result<bool> {
    let url = normalize_url(&item.url)
        .map_err(|e| EnrichError::Stack(format!("cannot push '{}': {e}", item.url)))?;
    let now = Utc::now().to_rfc3339();

    let inserted = conn
        .execute(
            "INSERT INTO stack_items (stack, url, record_id, batch_id, email, seq, consumed, pushed_at)
             VALUES (?1, ?2, ?3, ?4, ?5,
                     (SELECT COALESCE(MAX(seq), 0) + 1 FROM stack_items WHERE stack = ?1),
                     0, ?6)
             ON CONFLICT(stack, url) DO NOTHING",
            params![
                stack,
                url.as_str(),
                item.record_id.as_str(),
                item.batch_id.as_str(),
                item.email.as_deref(),
                now.as_str()
            ],
        )
        .await
        .map_err(EnrichError::storage)?;

    if inserted == 0 {
        tracing::debug!(stack, url = %url, "url already seen, not pushed");
    }
    Ok(inserted > 0)
}

async fn pop_on(conn: &Connection, stack: &str) -> Result<Option<StackItem>> {
    let now = Utc::now().to_rfc3339();
    let sql = format!(
        "UPDATE stack_items SET consumed = 1, consumed_at = ?2
         WHERE stack = ?1 AND url = (
             SELECT url FROM stack_items
             WHERE stack = ?1 AND consumed = 0
             ORDER BY seq DESC LIMIT 1
         )
         RETURNING {ITEM_COLUMNS}"
    );
    let mut rows = conn
        .query(&sql, params![stack, now.as_str()])
        .await
        .map_err(EnrichError::storage)?;

    match rows.next().await.map_err(EnrichError::storage)? {
        Some(row) => Ok(Some(row_to_item(&row)?)),
        None => Ok(None),
    }
}

fn row_to_item(row: &Row) -> Result<StackItem> {
    Ok(StackItem {
        url: col(row, 0)?,
        record_id: RecordId(col(row, 1)?),
        batch_id: col(row, 2)?,
        email: col(row, 3)?,
        pushed_at: parse_time(&col::<String>(row, 4)?)?,
        consumed: col::<i64>(row, 5)? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_storage;
    use enrichkit_shared::RecordStatus;
    use std::sync::Arc;

    fn item(url: &str, record: &str) -> StackItem {
        StackItem {
            url: url.into(),
            record_id: RecordId::from(record),
            batch_id: "b1".into(),
            email: Some(format!("{record}@example.com")),
            pushed_at: Utc::now(),
            consumed: false,
        }
    }

    #[tokio::test]
    async fn push_pop_is_lifo() {
        let storage = test_storage().await;
        for (i, url) in ["https://a.example/1", "https://a.example/2", "https://a.example/3"]
            .iter()
            .enumerate()
        {
            assert!(storage.push_stack("s", &item(url, &format!("r{i}"))).await.unwrap());
        }

        assert_eq!(storage.stack_size("s").await.unwrap(), 3);
        let top = storage.peek_stack("s").await.unwrap().unwrap();
        assert_eq!(top.url, "https://a.example/3");

        let popped: Vec<_> = [
            storage.pop_stack("s").await.unwrap().unwrap().url,
            storage.pop_stack("s").await.unwrap().unwrap().url,
            storage.pop_stack("s").await.unwrap().unwrap().url,
        ]
        .to_vec();
        assert_eq!(
            popped,
            vec!["https://a.example/3", "https://a.example/2", "https://a.example/1"]
        );
        assert!(storage.pop_stack("s").await.unwrap().is_none());
        assert_eq!(storage.stack_size("s").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn seen_urls_are_never_pushed_twice() {
        let storage = test_storage().await;
        assert!(
            storage
                .push_stack("s", &item("https://www.linkedin.com/in/ada/", "r1"))
                .await
                .unwrap()
        );
        // Same URL after normalization.
        assert!(
            !storage
                .push_stack("s", &item("https://www.linkedin.com/in/ada#top", "r2"))
                .await
                .unwrap()
        );

        storage.pop_stack("s").await.unwrap().unwrap();
        // Consumed URLs stay in the seen-set.
        assert!(
            !storage
                .push_stack("s", &item("https://www.linkedin.com/in/ada", "r3"))
                .await
                .unwrap()
        );
        assert_eq!(storage.stack_seen("s").await.unwrap(), 1);

        // Stacks are independent.
        assert!(
            storage
                .push_stack("other", &item("https://www.linkedin.com/in/ada", "r1"))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn push_rejects_non_http_urls() {
        let storage = test_storage().await;
        let err = storage
            .push_stack("s", &item("mailto:ada@example.com", "r1"))
            .await
            .unwrap_err();
        assert!(matches!(err, EnrichError::Stack(_)));
    }

    #[tokio::test]
    async fn concurrent_pushes_dedupe() {
        let storage = Arc::new(test_storage().await);
        let mut handles = Vec::new();
        for i in 0..20 {
            let storage = storage.clone();
            handles.push(tokio::spawn(async move {
                let url = format!("https://a.example/{}", i % 5);
                storage.push_stack("s", &item(&url, &format!("r{i}"))).await
            }));
        }

        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 5);
        assert_eq!(storage.stack_size("s").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn stage_moves_items_into_new_batch() {
        let storage = test_storage().await;
        for i in 0..3 {
            storage
                .push_stack("s", &item(&format!("https://a.example/{i}"), &format!("r{i}")))
                .await
                .unwrap();
        }

        let staged = storage
            .stage_stack_items("s", 2, "b2", LookupKind::ProfilePage)
            .await
            .unwrap();
        assert_eq!(staged.len(), 2);
        assert_eq!(staged[0].record_id.as_str(), "https://a.example/2");
        assert_eq!(staged[0].input.url.as_deref(), Some("https://a.example/2"));
        assert_eq!(staged[0].input.extra["origin_record"], "r2");
        assert_eq!(storage.stack_size("s").await.unwrap(), 1);

        let counts = storage.batch_counts("b2").await.unwrap();
        assert_eq!(counts.pending, 2);
        let loaded = storage
            .load_state("b2", &RecordId::from("https://a.example/1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status, RecordStatus::Pending);
        assert_eq!(loaded.kind, LookupKind::ProfilePage);
    }
}
