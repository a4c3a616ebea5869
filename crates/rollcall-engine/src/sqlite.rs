//! SQLite-backed identity roster and attendance ledger.

use crate::store::{AttendanceRecord, AttendanceStore, IdentityStore, SessionSummary, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rollcall_core::{Embedding, IdentityRecord};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use tokio_rusqlite::Connection;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    identity_key TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    embedding    BLOB,
    enrolled_at  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS attendance (
    session_id   TEXT NOT NULL,
    identity_key TEXT NOT NULL,
    marked_at    TEXT NOT NULL,
    PRIMARY KEY (session_id, identity_key)
);
";

/// One roster row, with or without an enrolled face.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RosterEntry {
    pub identity_key: String,
    pub display_name: String,
    pub has_embedding: bool,
}

#[derive(Clone)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Unavailable(format!("{}: {e}", parent.display())))?;
            }
        }
        let conn = Connection::open(path).await?;
        tracing::info!(path = %path.display(), "opened attendance database");
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().await?).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    /// Create or update an identity. `None` keeps any embedding already stored.
    pub async fn upsert_identity(
        &self,
        identity_key: &str,
        display_name: &str,
        embedding: Option<&Embedding>,
    ) -> Result<(), StoreError> {
        let key = identity_key.to_string();
        let name = display_name.to_string();
        let blob = embedding.map(|e| e.to_le_bytes());
        let now = Utc::now().to_rfc3339();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO identities (identity_key, display_name, embedding, enrolled_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(identity_key) DO UPDATE SET
                        display_name = excluded.display_name,
                        embedding = COALESCE(excluded.embedding, identities.embedding),
                        enrolled_at = excluded.enrolled_at",
                    params![key, name, blob, now],
                )?;
                Ok(())
            })
            .await?;

        tracing::info!(identity_key, display_name, with_embedding = embedding.is_some(), "identity stored");
        Ok(())
    }

    /// Remove an identity; returns whether it existed.
    pub async fn remove_identity(&self, identity_key: &str) -> Result<bool, StoreError> {
        let key = identity_key.to_string();
        let removed = self
            .conn
            .call(move |conn| Ok(conn.execute("DELETE FROM identities WHERE identity_key = ?1", params![key])?))
            .await?;
        Ok(removed > 0)
    }

    pub async fn roster(&self) -> Result<Vec<RosterEntry>, StoreError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT identity_key, display_name, embedding IS NOT NULL
                     FROM identities ORDER BY identity_key",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok(RosterEntry {
                            identity_key: row.get(0)?,
                            display_name: row.get(1)?,
                            has_embedding: row.get(2)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    /// When `identity_key` was marked present in `session_id`, if ever.
    pub async fn marked_at(&self, session_id: &str, identity_key: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let (session, key) = (session_id.to_string(), identity_key.to_string());
        let raw: Option<String> = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT marked_at FROM attendance WHERE session_id = ?1 AND identity_key = ?2",
                        params![session, key],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;
        Ok(raw.as_deref().and_then(parse_timestamp))
    }

    /// Present/absent state of every roster identity for one session.
    pub async fn session_summary(&self, session_id: &str) -> Result<SessionSummary, StoreError> {
        let session = session_id.to_string();
        let rows: Vec<(String, String, Option<String>)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT i.identity_key, i.display_name, a.marked_at
                     FROM identities i
                     LEFT JOIN attendance a
                       ON a.identity_key = i.identity_key AND a.session_id = ?1
                     ORDER BY i.identity_key",
                )?;
                let rows = stmt
                    .query_map(params![session], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let records = rows
            .into_iter()
            .map(|(identity_key, display_name, marked_at)| AttendanceRecord {
                session_id: session_id.to_string(),
                identity_key,
                display_name,
                marked_at: marked_at.as_deref().and_then(parse_timestamp),
            })
            .collect();

        Ok(SessionSummary::from_records(session_id, records))
    }
}

#[async_trait]
impl IdentityStore for SqliteStore {
    async fn load_identities(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        let rows: Vec<(String, String, Vec<u8>)> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT identity_key, display_name, embedding
                     FROM identities WHERE embedding IS NOT NULL ORDER BY identity_key",
                )?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for (identity_key, display_name, blob) in rows {
            match Embedding::from_le_bytes(&blob).filter(|e| !e.values.is_empty()) {
                Some(embedding) => records.push(IdentityRecord {
                    identity_key,
                    display_name,
                    embedding,
                }),
                None => {
                    let err = StoreError::CorruptEmbedding {
                        identity_key,
                        len: blob.len(),
                    };
                    tracing::warn!(error = %err, "skipping identity");
                }
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl AttendanceStore for SqliteStore {
    async fn mark_present(&self, session_id: &str, identity_key: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let (session, key) = (session_id.to_string(), identity_key.to_string());
        let inserted = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "INSERT OR IGNORE INTO attendance (session_id, identity_key, marked_at)
                     VALUES (?1, ?2, ?3)",
                    params![session, key, at.to_rfc3339()],
                )?)
            })
            .await?;

        if inserted == 0 {
            tracing::debug!(session_id, identity_key, "already marked present");
        }
        Ok(())
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    #[tokio::test]
    async fn test_load_only_identities_with_embeddings() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.upsert_identity("S2", "Bob", Some(&emb(&[0.0, 1.0]))).await.unwrap();
        store.upsert_identity("S1", "Alice", Some(&emb(&[1.0, 0.0]))).await.unwrap();
        store.upsert_identity("S3", "Carol", None).await.unwrap();

        let ids = store.load_identities().await.unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0].identity_key, "S1");
        assert_eq!(ids[0].embedding.values, vec![1.0, 0.0]);
        assert_eq!(ids[1].display_name, "Bob");

        let roster = store.roster().await.unwrap();
        assert_eq!(roster.len(), 3);
        assert!(!roster[2].has_embedding);
    }

    #[tokio::test]
    async fn test_upsert_without_embedding_keeps_existing() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.upsert_identity("S1", "Alice", Some(&emb(&[1.0, 0.0]))).await.unwrap();
        store.upsert_identity("S1", "Alice B.", None).await.unwrap();

        let ids = store.load_identities().await.unwrap();
        assert_eq!(ids[0].display_name, "Alice B.");
        assert_eq!(ids[0].embedding.values, vec![1.0, 0.0]);
    }

    #[tokio::test]
    async fn test_mark_present_is_idempotent() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.upsert_identity("S1", "Alice", Some(&emb(&[1.0]))).await.unwrap();
        store.upsert_identity("S2", "Bob", Some(&emb(&[1.0]))).await.unwrap();

        let first = Utc::now();
        store.mark_present("A", "S1", first).await.unwrap();
        store.mark_present("A", "S1", first + chrono::Duration::seconds(60)).await.unwrap();

        let at = store.marked_at("A", "S1").await.unwrap().unwrap();
        assert_eq!(at.timestamp(), first.timestamp());

        let summary = store.session_summary("A").await.unwrap();
        assert_eq!(summary.roster_size, 2);
        assert_eq!(summary.present, 1);
        assert_eq!(summary.absent, 1);
        assert!(summary.records[0].is_present());

        let other = store.session_summary("B").await.unwrap();
        assert_eq!(other.present, 0);
    }

    #[tokio::test]
    async fn test_remove_identity() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.upsert_identity("S1", "Alice", None).await.unwrap();
        assert!(store.remove_identity("S1").await.unwrap());
        assert!(!store.remove_identity("S1").await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_embedding_is_skipped() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.upsert_identity("S1", "Alice", Some(&emb(&[1.0]))).await.unwrap();
        store
            .conn
            .call(|conn| {
                conn.execute(
                    "INSERT INTO identities VALUES ('S2', 'Bob', x'010203', '')",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let ids = store.load_identities().await.unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(ids[0].identity_key, "S1");
    }
}
