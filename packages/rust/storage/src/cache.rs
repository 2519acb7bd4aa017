//! Persistent lookup cache (second level behind the in-memory cache).
//!
//! Values are stored as JSON text. Expiry is wall-clock based so entries
//! survive restarts.

use std::time::Duration;

use chrono::Utc;
use enrichkit_shared::{EnrichError, LookupKind, Result};
use libsql::params;

use crate::{Storage, col};

impl Storage {
    // -----------------------------------------------------------------------
    // Lookup cache operations
    // -----------------------------------------------------------------------

    /// Get an unexpired cached value.
    pub async fn get_cached(&self, fingerprint: &str) -> Result<Option<String>> {
        let now = Utc::now().timestamp_millis();
        let mut rows = self
            .conn
            .query(
                "SELECT value_json FROM lookup_cache WHERE fingerprint = ?1 AND expires_at > ?2",
                params![fingerprint, now],
            )
            .await
            .map_err(EnrichError::storage)?;

        match rows.next().await.map_err(EnrichError::storage)? {
            Some(row) => Ok(Some(col::<String>(&row, 0)?)),
            None => Ok(None),
        }
    }

    /// Store a value in the cache (upserts).
    pub async fn set_cached(
        &self,
        fingerprint: &str,
        kind: LookupKind,
        value_json: &str,
        ttl: Duration,
    ) -> Result<()> {
        self.check_writable()?;
        let _gate = self.write_gate.lock().await;
        let now = Utc::now();
        let expires_at = i64::try_from(ttl.as_millis())
            .ok()
            .and_then(|ms| now.timestamp_millis().checked_add(ms))
            .unwrap_or(i64::MAX);
        let created_at = now.to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO lookup_cache (fingerprint, kind, value_json, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(fingerprint) DO UPDATE SET
                   kind = excluded.kind,
                   value_json = excluded.value_json,
                   created_at = excluded.created_at,
                   expires_at = excluded.expires_at",
                params![fingerprint, kind.as_str(), value_json, created_at.as_str(), expires_at],
            )
            .await
            .map_err(EnrichError::storage)?;
        Ok(())
    }

    /// Remove one cache entry.
    pub async fn invalidate_cached(&self, fingerprint: &str) -> Result<bool> {
        self.check_writable()?;
        let _gate = self.write_gate.lock().await;
        let removed = self
            .conn
            .execute(
                "DELETE FROM lookup_cache WHERE fingerprint = ?1",
                params![fingerprint],
            )
            .await
            .map_err(EnrichError::storage)?;
        Ok(removed > 0)
    }

    /// Remove every cache entry for a lookup kind.
    pub async fn invalidate_cached_kind(&self, kind: LookupKind) -> Result<u64> {
        self.check_writable()?;
        let _gate = self.write_gate.lock().await;
        self.conn
            .execute(
                "DELETE FROM lookup_cache WHERE kind = ?1",
                params![kind.as_str()],
            )
            .await
            .map_err(EnrichError::storage)
    }

    /// Delete expired entries. Returns how many were removed.
    pub async fn purge_expired_cache(&self) -> Result<u64> {
        self.check_writable()?;
        let _gate = self.write_gate.lock().await;
        let now = Utc::now().timestamp_millis();
        self.conn
            .execute(
                "DELETE FROM lookup_cache WHERE expires_at <= ?1",
                params![now],
            )
            .await
            .map_err(EnrichError::storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_storage;

    #[tokio::test]
    async fn cache_roundtrip_and_invalidate() {
        let storage = test_storage().await;
        assert!(storage.get_cached("fp1").await.unwrap().is_none());

        storage
            .set_cached("fp1", LookupKind::Location, r#"{"city":"Austin"}"#, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            storage.get_cached("fp1").await.unwrap().as_deref(),
            Some(r#"{"city":"Austin"}"#)
        );

        // Upsert replaces.
        storage
            .set_cached("fp1", LookupKind::Location, r#"{"city":"Boston"}"#, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            storage.get_cached("fp1").await.unwrap().as_deref(),
            Some(r#"{"city":"Boston"}"#)
        );

        assert!(storage.invalidate_cached("fp1").await.unwrap());
        assert!(storage.get_cached("fp1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_entries_are_invisible_and_purged() {
        let storage = test_storage().await;
        storage
            .set_cached("old", LookupKind::EmailClass, "{}", Duration::ZERO)
            .await
            .unwrap();
        storage
            .set_cached("new", LookupKind::EmailClass, "{}", Duration::from_secs(3600))
            .await
            .unwrap();

        assert!(storage.get_cached("old").await.unwrap().is_none());
        assert_eq!(storage.purge_expired_cache().await.unwrap(), 1);
        assert_eq!(
            storage.invalidate_cached_kind(LookupKind::EmailClass).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn huge_ttl_is_stored_as_far_future() {
        let storage = test_storage().await;
        storage
            .set_cached("fp", LookupKind::Location, "{}", Duration::from_secs(u64::MAX))
            .await
            .unwrap();
        assert_eq!(storage.get_cached("fp").await.unwrap().as_deref(), Some("{}"));
        assert_eq!(storage.purge_expired_cache().await.unwrap(), 0);
    }
}
