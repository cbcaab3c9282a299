//! R2 bucket binding: combines the KeyValue Engine, Multipart Engine, and the
//! precondition evaluator into the object-store surface described by spec §4.4
//! and §4.5.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use md5::{Digest, Md5};
use sha2::{Sha256, Sha384, Sha512};

use crate::blob::{ByteRange, ByteStream};
use crate::error::{Result, StorageError};
use crate::kv::{KeyValueEngine, PutRequest};
use crate::multipart::{CreateUploadOptions, MultipartEngine, UploadedPart};
use crate::object::{Checksums, ChecksumAlgorithm, ObjectMetadata, ObjectOptions};
use crate::precondition::{self, OnlyIf, Verdict};

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub struct R2GetResult {
    pub metadata: ObjectMetadata,
    /// `None` when an `onlyIf` precondition failed: the caller should report
    /// this as a 304-style metadata-only response (spec §4.5).
    pub body: Option<ByteStream>,
}

/// Object-store binding sitting atop a namespace's `KeyValueEngine`: single-part
/// puts go straight through the KV engine, multipart uploads are delegated to
/// `MultipartEngine` (spec §4.4, §4.5).
pub struct R2Bucket {
    kv: Arc<KeyValueEngine>,
    multipart: MultipartEngine,
}

impl R2Bucket {
    pub fn new(kv: Arc<KeyValueEngine>) -> Self {
        let multipart = MultipartEngine::new(kv.clone());
        Self { kv, multipart }
    }

    pub async fn head(&self, key: &str) -> Result<Option<ObjectMetadata>> {
        let Some(value) = self.kv.get(key).await? else {
            return Ok(None);
        };
        let metadata = value.metadata.ok_or(StorageError::NotFound)?;
        Ok(Some(serde_json::from_value(metadata)?))
    }

    pub async fn get(
        &self,
        key: &str,
        range: Option<ByteRange>,
        only_if: Option<&OnlyIf>,
    ) -> Result<Option<R2GetResult>> {
        let Some(object) = self.head(key).await? else {
            if let Some(cond) = only_if {
                if precondition::evaluate(cond, None) == Verdict::Fail {
                    return Err(StorageError::NotFound);
                }
            }
            return Ok(None);
        };

        if let Some(cond) = only_if {
            if precondition::evaluate(cond, Some(&object)) == Verdict::Fail {
                return Ok(Some(R2GetResult { metadata: object, body: None }));
            }
        }

        let effective_range = range.unwrap_or(ByteRange { start: 0, end: object.size.saturating_sub(1) });

        let stream = if object.multipart.is_some() {
            self.multipart.read_range(&object, effective_range).await?
        } else {
            let Some(value) = self.kv.get_ranged(key, range).await? else {
                return Ok(None);
            };
            value.stream
        };

        Ok(Some(R2GetResult {
            metadata: object,
            body: Some(stream),
        }))
    }

    /// Single-part put: hashes the body once (for `etag` and optional checksum
    /// verification), then writes blob + metadata atomically via the KV engine
    /// (spec §4.5).
    pub async fn put(
        &self,
        key: &str,
        mut value: ByteStream,
        opts: ObjectOptions,
        only_if: Option<&OnlyIf>,
    ) -> Result<ObjectMetadata> {
        if let Some(cond) = only_if {
            let current = self.head(key).await?;
            if precondition::evaluate(cond, current.as_ref()) == Verdict::Fail {
                return Err(StorageError::NotFound);
            }
        }

        use futures::StreamExt;
        let mut buf = Vec::new();
        while let Some(chunk) = value.next().await {
            buf.extend_from_slice(&chunk?);
        }

        let md5_digest = Md5::digest(&buf);
        let mut checksums = Checksums {
            md5: Some(hex::encode(md5_digest)),
            ..Checksums::default()
        };

        if let Some((algorithm, expected)) = &opts.checksum {
            let computed = match algorithm {
                ChecksumAlgorithm::Md5 => md5_digest.to_vec(),
                ChecksumAlgorithm::Sha1 => sha1::Sha1::digest(&buf).to_vec(),
                ChecksumAlgorithm::Sha256 => Sha256::digest(&buf).to_vec(),
                ChecksumAlgorithm::Sha384 => Sha384::digest(&buf).to_vec(),
                ChecksumAlgorithm::Sha512 => Sha512::digest(&buf).to_vec(),
            };
            if &computed != expected {
                return Err(StorageError::ChecksumMismatch);
            }
            match algorithm {
                ChecksumAlgorithm::Sha1 => checksums.sha1 = Some(hex::encode(&computed)),
                ChecksumAlgorithm::Sha256 => checksums.sha256 = Some(hex::encode(&computed)),
                ChecksumAlgorithm::Sha384 => checksums.sha384 = Some(hex::encode(&computed)),
                ChecksumAlgorithm::Sha512 => checksums.sha512 = Some(hex::encode(&computed)),
                ChecksumAlgorithm::Md5 => {}
            }
        }

        let etag = hex::encode(md5_digest);
        let object = ObjectMetadata {
            key: key.to_string(),
            version: crate::blob::BlobId::generate().to_hex(),
            size: buf.len() as u64,
            etag: etag.clone(),
            http_etag: format!("\"{etag}\""),
            uploaded: now_millis(),
            http_metadata: opts.http_metadata,
            custom_metadata: opts.custom_metadata,
            checksums,
            multipart: None,
            range: None,
        };

        self.kv
            .put(PutRequest {
                key: key.to_string(),
                value: Box::pin(tokio_stream::once(Ok::<Bytes, std::io::Error>(Bytes::from(buf)))),
                expiration: None,
                metadata: Some(serde_json::to_value(&object)?),
                cancel: None,
            })
            .await?;

        Ok(object)
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.kv.delete(key).await?;
        Ok(())
    }

    pub async fn create_multipart_upload(&self, key: &str, opts: CreateUploadOptions) -> Result<String> {
        self.multipart.create(key, opts).await
    }

    pub async fn upload_part(&self, upload_id: &str, part_number: u32, value: ByteStream) -> Result<UploadedPart> {
        self.multipart.upload_part(upload_id, part_number, value).await
    }

    pub async fn abort_multipart_upload(&self, upload_id: &str) -> Result<()> {
        self.multipart.abort(upload_id).await
    }

    pub async fn complete_multipart_upload(
        &self,
        upload_id: &str,
        parts: &[UploadedPart],
    ) -> Result<ObjectMetadata> {
        self.multipart.complete(upload_id, parts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::LocalDiskBlobStore;
    use crate::metadata::MetadataDb;
    use crate::precondition::EtagList;
    use miniflare_core::{PersistTarget, PluginKind};

    fn namespace() -> miniflare_core::NamespaceId {
        miniflare_core::NamespaceId::new(PluginKind::R2, "bucket", PersistTarget::Ephemeral)
    }

    fn bytes_stream(data: &'static [u8]) -> ByteStream {
        Box::pin(tokio_stream::once(Ok(Bytes::from_static(data))))
    }

    async fn bucket(dir: &tempfile::TempDir) -> R2Bucket {
        let blobs: Arc<dyn crate::blob::BlobStore> = Arc::new(LocalDiskBlobStore::new(dir.path()));
        let db = MetadataDb::open(None).unwrap();
        let kv = Arc::new(KeyValueEngine::new(namespace(), blobs, db));
        R2Bucket::new(kv)
    }

    /// Scenario 3 (spec §8): PUT returns an etag; a matching `etagMatches`
    /// returns the full body, a mismatching one returns metadata only.
    #[tokio::test]
    async fn conditional_get_matches_and_mismatches() {
        let dir = tempfile::tempdir().unwrap();
        let bucket = bucket(&dir).await;

        let object = bucket
            .put("k", bytes_stream(b"hello"), ObjectOptions::default(), None)
            .await
            .unwrap();

        let matched = OnlyIf {
            etag_matches: Some(EtagList::from_header(&object.etag)),
            ..Default::default()
        };
        let result = bucket.get("k", None, Some(&matched)).await.unwrap().unwrap();
        assert!(result.body.is_some());

        let mismatched = OnlyIf {
            etag_matches: Some(EtagList::from_header("not-the-etag")),
            ..Default::default()
        };
        let result = bucket.get("k", None, Some(&mismatched)).await.unwrap().unwrap();
        assert!(result.body.is_none());
        assert_eq!(result.metadata.etag, object.etag);
    }

    #[tokio::test]
    async fn checksum_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let bucket = bucket(&dir).await;

        let opts = ObjectOptions {
            checksum: Some((ChecksumAlgorithm::Sha256, vec![0u8; 32])),
            ..Default::default()
        };
        let err = bucket.put("k", bytes_stream(b"hello"), opts, None).await.unwrap_err();
        assert!(matches!(err, StorageError::ChecksumMismatch));
    }
}
