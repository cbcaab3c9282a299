//! Embedded SQL metadata index, one table per namespace (spec §4.2).
//!
//! Grounded in `derive-sqlite::dbutil::open`'s bootstrap/pragma/migration shape:
//! a single `rusqlite::Connection`, a `PRAGMA`-tuned journal mode, and plain
//! parameterised statements run inside explicit transactions.

use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::blob::BlobId;
use crate::error::{Result, StorageError};

/// One `_mf_entries` row (spec §3 "Key Entry").
#[derive(Debug, Clone, PartialEq)]
pub struct KeyRow {
    pub key: String,
    pub blob_id: BlobId,
    pub expiration: Option<i64>,
    pub metadata: Option<Value>,
}

/// Outcome of a `get_entry` lookup that also performs lazy expiry GC.
pub enum GetOutcome {
    Found(KeyRow),
    /// The row existed but its `expiration` was <= now; it has been deleted and
    /// its blob id is returned so the caller can schedule background deletion.
    Expired { blob_id: BlobId },
    Missing,
}

/// Embedded SQL store for one namespace's `key -> blob_id/expiration/metadata` rows.
///
/// Held behind a `std::sync::Mutex` rather than an async one: every call is a
/// short synchronous SQLite transaction with no `.await` inside the critical
/// section, matching spec §5's "single logical writer" resource model.
pub struct MetadataDb {
    conn: Mutex<Connection>,
}

const BOOTSTRAP: &str = r#"
    PRAGMA journal_mode=WAL;
    PRAGMA case_sensitive_like = TRUE;
    CREATE TABLE IF NOT EXISTS _mf_entries (
        key TEXT PRIMARY KEY,
        blob_id TEXT NOT NULL,
        expiration INTEGER,
        metadata TEXT
    );
    CREATE INDEX IF NOT EXISTS _mf_entries_expiration ON _mf_entries(expiration);
"#;

impl MetadataDb {
    /// `path`: `None` opens an ephemeral in-memory database (spec §3 "Namespace"
    /// persistence root = absent).
    pub fn open(path: Option<&std::path::Path>) -> Result<Self> {
        let conn = match path {
            Some(path) => Connection::open(path)?,
            None => Connection::open_in_memory()?,
        };
        conn.execute_batch(BOOTSTRAP)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert or replace `key`'s row in a single transaction, returning the
    /// previous row's blob id (if any) for background deletion (spec §4.2 "put
    /// is a single transaction that returns the previous row's blob_id").
    pub fn put(
        &self,
        key: &str,
        blob_id: BlobId,
        expiration: Option<i64>,
        metadata: Option<&Value>,
    ) -> Result<Option<BlobId>> {
        let metadata_json = metadata.map(|m| m.to_string());
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let previous: Option<String> = tx
            .query_row(
                "SELECT blob_id FROM _mf_entries WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        tx.execute(
            "INSERT INTO _mf_entries (key, blob_id, expiration, metadata) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(key) DO UPDATE SET blob_id = excluded.blob_id, expiration = excluded.expiration, metadata = excluded.metadata",
            params![key, blob_id.to_hex(), expiration, metadata_json],
        )?;
        tx.commit()?;

        Ok(previous.and_then(|hex| BlobId::from_hex(&hex)))
    }

    /// Read `key`, lazily deleting (and reporting for GC) an expired row.
    /// `now_millis` is supplied by the caller so the clock is not read with the
    /// DB lock held (spec §4.3 "Ordering": expiry GC assumes a monotonic clock
    /// and is not serialised with `get`).
    pub fn get(&self, key: &str, now_millis: i64) -> Result<GetOutcome> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(String, Option<i64>, Option<String>)> = conn
            .query_row(
                "SELECT blob_id, expiration, metadata FROM _mf_entries WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((blob_id_hex, expiration, metadata)) = row else {
            return Ok(GetOutcome::Missing);
        };
        let blob_id = BlobId::from_hex(&blob_id_hex)
            .ok_or_else(|| StorageError::Corrupt(format!("bad blob id {blob_id_hex:?}")))?;

        if let Some(exp) = expiration {
            if exp <= now_millis {
                conn.execute("DELETE FROM _mf_entries WHERE key = ?1", params![key])?;
                return Ok(GetOutcome::Expired { blob_id });
            }
        }

        let metadata = metadata
            .map(|m| serde_json::from_str(&m))
            .transpose()
            .map_err(|e| StorageError::Corrupt(format!("bad metadata json: {e}")))?;

        Ok(GetOutcome::Found(KeyRow {
            key: key.to_string(),
            blob_id,
            expiration,
            metadata,
        }))
    }

    /// Delete `key` unconditionally. Returns the blob id to garbage-collect if a
    /// (non-expired) row existed (spec §4.3 "delete").
    pub fn delete(&self, key: &str, now_millis: i64) -> Result<Option<(BlobId, bool)>> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(String, Option<i64>)> = conn
            .query_row(
                "SELECT blob_id, expiration FROM _mf_entries WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((blob_id_hex, expiration)) = row else {
            return Ok(None);
        };
        conn.execute("DELETE FROM _mf_entries WHERE key = ?1", params![key])?;
        let blob_id = BlobId::from_hex(&blob_id_hex)
            .ok_or_else(|| StorageError::Corrupt(format!("bad blob id {blob_id_hex:?}")))?;
        let was_live = expiration.map(|e| e > now_millis).unwrap_or(true);
        Ok(Some((blob_id, was_live)))
    }

    /// List keys with the given prefix, in lexicographic UTF-8 order, strictly
    /// after `cursor_key`, up to `limit` rows. Also lazily deletes any expired
    /// rows encountered, returning their blob ids for GC (spec §4.3 "list").
    pub fn list(
        &self,
        prefix: &str,
        cursor_key: Option<&str>,
        limit: usize,
        now_millis: i64,
    ) -> Result<(Vec<KeyRow>, Vec<BlobId>)> {
        let escaped_prefix = escape_like(prefix);
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            "SELECT key, blob_id, expiration, metadata FROM _mf_entries
             WHERE key LIKE ?1 ESCAPE '\\' AND key > ?2
             ORDER BY key ASC
             LIMIT ?3",
        )?;
        let like_pattern = format!("{escaped_prefix}%");
        let cursor_key = cursor_key.unwrap_or("");
        // Query limit+1 to detect whether a next page exists (spec §4.3).
        let rows = stmt.query_map(
            params![like_pattern, cursor_key, (limit + 1) as i64],
            |row| {
                let key: String = row.get(0)?;
                let blob_id: String = row.get(1)?;
                let expiration: Option<i64> = row.get(2)?;
                let metadata: Option<String> = row.get(3)?;
                Ok((key, blob_id, expiration, metadata))
            },
        )?;

        let mut live = Vec::new();
        let mut expired_blob_ids = Vec::new();
        let mut expired_keys = Vec::new();

        for row in rows {
            let (key, blob_id_hex, expiration, metadata) = row?;
            let blob_id = BlobId::from_hex(&blob_id_hex)
                .ok_or_else(|| StorageError::Corrupt(format!("bad blob id {blob_id_hex:?}")))?;

            if let Some(exp) = expiration {
                if exp <= now_millis {
                    expired_keys.push(key);
                    expired_blob_ids.push(blob_id);
                    continue;
                }
            }

            let metadata = metadata
                .map(|m| serde_json::from_str(&m))
                .transpose()
                .map_err(|e| StorageError::Corrupt(format!("bad metadata json: {e}")))?;

            live.push(KeyRow {
                key,
                blob_id,
                expiration,
                metadata,
            });
        }

        for key in &expired_keys {
            conn.execute("DELETE FROM _mf_entries WHERE key = ?1", params![key])?;
        }

        Ok((live, expired_blob_ids))
    }
}

/// Escape `\`, `_`, `%` for use inside a `LIKE ... ESCAPE '\'` pattern
/// (spec §4.3 "Matches `key LIKE escaped_prefix || '%'`").
fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c == '\\' || c == '_' || c == '%' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_like_escapes_wildcards() {
        assert_eq!(escape_like("a%b_c\\d"), "a\\%b\\_c\\\\d");
    }

    #[test]
    fn put_then_get_round_trips() {
        let db = MetadataDb::open(None).unwrap();
        let id = BlobId::generate();
        let prev = db.put("k", id, None, None).unwrap();
        assert!(prev.is_none());

        match db.get("k", 0).unwrap() {
            GetOutcome::Found(row) => {
                assert_eq!(row.key, "k");
                assert_eq!(row.blob_id, id);
            }
            _ => panic!("expected Found"),
        }
    }

    #[test]
    fn expired_row_is_deleted_lazily() {
        let db = MetadataDb::open(None).unwrap();
        let id = BlobId::generate();
        db.put("k", id, Some(100), None).unwrap();

        match db.get("k", 200).unwrap() {
            GetOutcome::Expired { blob_id } => assert_eq!(blob_id, id),
            _ => panic!("expected Expired"),
        }
        match db.get("k", 200).unwrap() {
            GetOutcome::Missing => {}
            _ => panic!("expected Missing after lazy delete"),
        }
    }

    #[test]
    fn list_prefix_and_cursor_pagination() {
        let db = MetadataDb::open(None).unwrap();
        for k in ["a/1", "a/2", "a/3", "b/1"] {
            db.put(k, BlobId::generate(), None, None).unwrap();
        }

        let (page1, _) = db.list("a/", None, 2, 0).unwrap();
        assert_eq!(page1.len(), 2);
        assert_eq!(page1[0].key, "a/1");
        assert_eq!(page1[1].key, "a/2");

        let (page2, _) = db.list("a/", Some(&page1[1].key), 2, 0).unwrap();
        assert_eq!(page2.len(), 1);
        assert_eq!(page2[0].key, "a/3");
    }
}
