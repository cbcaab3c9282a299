//! Composes the Blob Store and Metadata DB into a transactional KV with TTL,
//! prefix listing, and cursors (spec §4.3).

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use miniflare_core::NamespaceId;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::blob::{BlobGetResult, BlobId, BlobStore, ByteRange, ByteStream, MultiRangeOpts, MultipartByteStream};
use crate::error::{Result, StorageError};
use crate::metadata::{GetOutcome, KeyRow, MetadataDb};

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// A value returned from `get`: the metadata row plus a byte stream sourced from
/// the backing blob.
pub struct GetValue {
    pub key: String,
    pub stream: ByteStream,
    pub expiration: Option<i64>,
    pub metadata: Option<Value>,
}

pub struct GetValueMulti {
    pub key: String,
    pub stream: MultipartByteStream,
    pub expiration: Option<i64>,
    pub metadata: Option<Value>,
}

pub struct PutRequest {
    pub key: String,
    pub value: ByteStream,
    pub expiration: Option<i64>,
    pub metadata: Option<Value>,
    pub cancel: Option<CancellationToken>,
}

pub struct ListRequest {
    pub prefix: Option<String>,
    pub cursor: Option<String>,
    pub limit: usize,
}

pub struct ListResult {
    pub keys: Vec<KeyRow>,
    pub cursor: Option<String>,
}

/// Composes a `BlobStore` + `MetadataDb` for one namespace (spec §4.3).
///
/// Background blob deletion runs on a dedicated task drained from a bounded
/// `mpsc` channel; a failed deletion is logged and dropped rather than
/// propagated, matching spec §5 "Blob GC is fire-and-forget and tolerates 404s".
pub struct KeyValueEngine {
    namespace: NamespaceId,
    blobs: Arc<dyn BlobStore>,
    db: MetadataDb,
    gc_tx: mpsc::Sender<BlobId>,
}

impl KeyValueEngine {
    pub fn new(namespace: NamespaceId, blobs: Arc<dyn BlobStore>, db: MetadataDb) -> Self {
        let (gc_tx, mut gc_rx) = mpsc::channel::<BlobId>(1024);
        let gc_blobs = blobs.clone();
        let gc_namespace = namespace.clone();
        tokio::spawn(async move {
            while let Some(id) = gc_rx.recv().await {
                if let Err(err) = gc_blobs.delete(&gc_namespace, &id).await {
                    tracing::warn!(?err, blob_id = %id, "background blob GC failed");
                }
            }
        });

        Self {
            namespace,
            blobs,
            db,
            gc_tx,
        }
    }

    fn schedule_gc(&self, id: BlobId) {
        // A full channel means GC is falling behind; drop and log rather than
        // block the caller on disk cleanup.
        if self.gc_tx.try_send(id).is_err() {
            tracing::warn!(blob_id = %id, "blob GC queue full, dropping background delete");
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<GetValue>> {
        self.get_ranged(key, None).await
    }

    pub async fn get_ranged(&self, key: &str, range: Option<ByteRange>) -> Result<Option<GetValue>> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey);
        }
        let outcome = self.db.get(key, now_millis())?;
        let row = match outcome {
            GetOutcome::Found(row) => row,
            GetOutcome::Expired { blob_id } => {
                self.schedule_gc(blob_id);
                return Ok(None);
            }
            GetOutcome::Missing => return Ok(None),
        };

        let Some(BlobGetResult { stream, .. }) = self.blobs.get(&self.namespace, &row.blob_id, range).await? else {
            return Ok(None);
        };

        Ok(Some(GetValue {
            key: row.key,
            stream,
            expiration: row.expiration,
            metadata: row.metadata,
        }))
    }

    pub async fn get_multi(&self, key: &str, ranges: &[ByteRange]) -> Result<Option<GetValueMulti>> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey);
        }
        let outcome = self.db.get(key, now_millis())?;
        let row = match outcome {
            GetOutcome::Found(row) => row,
            GetOutcome::Expired { blob_id } => {
                self.schedule_gc(blob_id);
                return Ok(None);
            }
            GetOutcome::Missing => return Ok(None),
        };

        let Some(stream) = self
            .blobs
            .get_multi(&self.namespace, &row.blob_id, ranges, MultiRangeOpts { content_type: None })
            .await?
        else {
            return Ok(None);
        };

        Ok(Some(GetValueMulti {
            key: row.key,
            stream,
            expiration: row.expiration,
            metadata: row.metadata,
        }))
    }

    /// Write the blob fully before inserting the metadata row, so
    /// length-validating wrappers can report accurate sizes (spec §4.3 "put").
    pub async fn put(&self, req: PutRequest) -> Result<()> {
        if req.key.is_empty() {
            return Err(StorageError::InvalidKey);
        }
        if let Some(exp) = req.expiration {
            if exp <= now_millis() {
                return Err(StorageError::ExpirationNotInFuture);
            }
        }

        let blob_id = self.blobs.put(&self.namespace, req.value).await?;

        if let Some(cancel) = &req.cancel {
            if cancel.is_cancelled() {
                self.schedule_gc(blob_id);
                return Err(StorageError::Aborted);
            }
        }

        let previous = self.db.put(&req.key, blob_id, req.expiration, req.metadata.as_ref())?;
        if let Some(previous) = previous {
            self.schedule_gc(previous);
        }
        Ok(())
    }

    /// Returns true iff the row existed and had not yet expired (spec §4.3
    /// "delete"). Always schedules blob GC if a row was removed, live or not.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey);
        }
        match self.db.delete(key, now_millis())? {
            Some((blob_id, was_live)) => {
                self.schedule_gc(blob_id);
                Ok(was_live)
            }
            None => Ok(false),
        }
    }

    pub async fn list(&self, req: ListRequest) -> Result<ListResult> {
        let prefix = req.prefix.unwrap_or_default();
        let cursor_key = req.cursor.as_deref().map(decode_cursor).transpose()?;

        let (mut rows, expired) = self
            .db
            .list(&prefix, cursor_key.as_deref(), req.limit, now_millis())?;
        for blob_id in expired {
            self.schedule_gc(blob_id);
        }

        let cursor = if rows.len() > req.limit {
            rows.truncate(req.limit);
            rows.last().map(|row| encode_cursor(&row.key))
        } else {
            None
        };

        Ok(ListResult { keys: rows, cursor })
    }
}

fn encode_cursor(key: &str) -> String {
    base64::encode(key.as_bytes())
}

fn decode_cursor(cursor: &str) -> Result<String> {
    let bytes = base64::decode(cursor).map_err(|_| StorageError::InvalidKey)?;
    String::from_utf8(bytes).map_err(|_| StorageError::InvalidKey)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::LocalDiskBlobStore;
    use bytes::Bytes;
    use miniflare_core::{PersistTarget, PluginKind};

    fn namespace() -> NamespaceId {
        NamespaceId::new(PluginKind::Kv, "test-ns", PersistTarget::Ephemeral)
    }

    fn byte_stream(data: &'static [u8]) -> ByteStream {
        Box::pin(tokio_stream::once(Ok(Bytes::from_static(data))))
    }

    async fn engine(dir: &tempfile::TempDir) -> KeyValueEngine {
        let blobs: Arc<dyn BlobStore> = Arc::new(LocalDiskBlobStore::new(dir.path()));
        let db = MetadataDb::open(None).unwrap();
        KeyValueEngine::new(namespace(), blobs, db)
    }

    #[tokio::test]
    async fn put_then_get_round_trips_value() {
        let dir = tempfile::tempdir().unwrap();
        let kv = engine(&dir).await;

        kv.put(PutRequest {
            key: "k".into(),
            value: byte_stream(b"hello"),
            expiration: None,
            metadata: None,
            cancel: None,
        })
        .await
        .unwrap();

        let got = kv.get("k").await.unwrap().expect("value present");
        let mut buf = Vec::new();
        let mut stream = got.stream;
        use futures::StreamExt;
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(buf, b"hello");
    }

    #[tokio::test]
    async fn empty_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let kv = engine(&dir).await;
        let err = kv.get("").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey));
    }

    #[tokio::test]
    async fn list_pagination_and_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let kv = engine(&dir).await;
        for k in ["a", "b", "c"] {
            kv.put(PutRequest {
                key: k.into(),
                value: byte_stream(b"x"),
                expiration: None,
                metadata: None,
                cancel: None,
            })
            .await
            .unwrap();
        }

        let page1 = kv
            .list(ListRequest {
                prefix: None,
                cursor: None,
                limit: 2,
            })
            .await
            .unwrap();
        assert_eq!(page1.keys.len(), 2);
        assert!(page1.cursor.is_some());

        let page2 = kv
            .list(ListRequest {
                prefix: None,
                cursor: page1.cursor,
                limit: 2,
            })
            .await
            .unwrap();
        assert_eq!(page2.keys.len(), 1);
        assert!(page2.cursor.is_none());
    }

    /// Scenario 2 (spec §8): a key put with a short expiration stops being
    /// visible to `get` and `list` once that time has passed.
    #[tokio::test]
    async fn expired_key_disappears_from_get_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let kv = engine(&dir).await;

        kv.put(PutRequest {
            key: "k".into(),
            value: byte_stream(b"hello"),
            expiration: Some(now_millis() + 50),
            metadata: None,
            cancel: None,
        })
        .await
        .unwrap();

        assert!(kv.get("k").await.unwrap().is_some());

        tokio::time::sleep(std::time::Duration::from_millis(80)).await;

        assert!(kv.get("k").await.unwrap().is_none());
        let listed = kv
            .list(ListRequest {
                prefix: None,
                cursor: None,
                limit: 10,
            })
            .await
            .unwrap();
        assert!(listed.keys.is_empty());
    }

    #[tokio::test]
    async fn put_rejects_expiration_not_in_future() {
        let dir = tempfile::tempdir().unwrap();
        let kv = engine(&dir).await;

        let err = kv
            .put(PutRequest {
                key: "k".into(),
                value: byte_stream(b"hello"),
                expiration: Some(now_millis() - 1000),
                metadata: None,
                cancel: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ExpirationNotInFuture));
    }
}
