//! Immutable content-addressed-by-unguessable-id byte store (spec §4.1).

use std::path::PathBuf;
use std::pin::Pin;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use miniflare_core::NamespaceId;
use rand::RngCore;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::{Result, StorageError};

const ID_LEN: usize = 40;
const RANDOM_LEN: usize = 32;

/// A 40-byte (320-bit) unguessable id: 32 random bytes followed by an 8-byte
/// big-endian millisecond timestamp suffix (spec §4.1 "Key decisions").
/// The suffix makes ids roughly time-ordered without weakening the entropy
/// an attacker would need to guess one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobId([u8; ID_LEN]);

impl BlobId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes[..RANDOM_LEN]);
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        bytes[RANDOM_LEN..].copy_from_slice(&millis.to_be_bytes());
        BlobId(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let bytes: [u8; ID_LEN] = bytes.try_into().ok()?;
        Some(BlobId(bytes))
    }
}

impl std::fmt::Display for BlobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Inclusive byte-offset range, as used by HTTP Range requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Result of a single-range `get`: the body, plus whether the range (if any was
/// requested) turned out to cover the whole object (spec §4.1 "Single-range GET").
pub struct BlobGetResult {
    pub stream: ByteStream,
    pub total_len: u64,
    pub range: Option<ByteRange>,
    pub covers_whole_content: bool,
}

/// Options controlling a multi-range (`multipart/byteranges`) GET.
pub struct MultiRangeOpts {
    pub content_type: Option<String>,
}

pub struct MultipartByteStream {
    pub stream: ByteStream,
    pub boundary: String,
    pub total_len: u64,
}

/// Blob storage backend contract (spec §4.1).
///
/// Modeled as a trait over a single concrete `LocalDiskBlobStore`, the same shape
/// as `control::services::builds_root::{BuildsRootService, LocalBuildsRoot}`: a
/// trait boundary exists so tests can swap in an in-memory backend, not because we
/// expect multiple production backends.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, namespace: &NamespaceId, data: ByteStream) -> Result<BlobId>;

    async fn get(
        &self,
        namespace: &NamespaceId,
        id: &BlobId,
        range: Option<ByteRange>,
    ) -> Result<Option<BlobGetResult>>;

    async fn get_multi(
        &self,
        namespace: &NamespaceId,
        id: &BlobId,
        ranges: &[ByteRange],
        opts: MultiRangeOpts,
    ) -> Result<Option<MultipartByteStream>>;

    async fn delete(&self, namespace: &NamespaceId, id: &BlobId) -> Result<()>;
}

/// `tokio::fs`-backed `BlobStore`, storing each blob as a single file under
/// `<root>/<namespace-label>/blobs/<id-hex>` (spec §6 "Persisted layout").
pub struct LocalDiskBlobStore {
    root: PathBuf,
}

impl LocalDiskBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn namespace_dir(&self, namespace: &NamespaceId) -> PathBuf {
        self.root.join(namespace.sanitised_label())
    }

    /// Resolve a blob id to its on-disk path, rejecting any id whose hex decoding
    /// or resulting path would escape the namespace's blob directory (spec §4.1
    /// "must not escape the namespace root").
    fn blob_path(&self, namespace: &NamespaceId, id: &BlobId) -> Option<PathBuf> {
        let dir = self.namespace_dir(namespace).join("blobs");
        let candidate = dir.join(id.to_hex());
        // `id.to_hex()` can never contain path separators or `..`, but we keep the
        // containment check explicit since it is the documented invariant.
        let file_name = candidate.file_name()?;
        if file_name.to_str()? != id.to_hex() {
            return None;
        }
        Some(candidate)
    }
}

#[async_trait]
impl BlobStore for LocalDiskBlobStore {
    async fn put(&self, namespace: &NamespaceId, mut data: ByteStream) -> Result<BlobId> {
        let id = BlobId::generate();
        let dir = self.namespace_dir(namespace).join("blobs");
        tokio::fs::create_dir_all(&dir).await?;
        let path = self.blob_path(namespace, &id).ok_or(StorageError::NotFound)?;

        let mut file = tokio::fs::File::create(&path).await?;
        while let Some(chunk) = data.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(id)
    }

    async fn get(
        &self,
        namespace: &NamespaceId,
        id: &BlobId,
        range: Option<ByteRange>,
    ) -> Result<Option<BlobGetResult>> {
        let Some(path) = self.blob_path(namespace, id) else {
            return Ok(None);
        };
        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let total_len = meta.len();

        let (start, len, covers_whole_content) = match range {
            Some(r) => (r.start, r.len().min(total_len.saturating_sub(r.start)), r.start == 0 && r.end + 1 >= total_len),
            None => (0, total_len, true),
        };

        let mut file = tokio::fs::File::open(&path).await?;
        if start > 0 {
            file.seek(std::io::SeekFrom::Start(start)).await?;
        }
        let limited = file.take(len);
        let stream = tokio_stream_from_reader(limited);

        Ok(Some(BlobGetResult {
            stream,
            total_len,
            range,
            covers_whole_content,
        }))
    }

    async fn get_multi(
        &self,
        namespace: &NamespaceId,
        id: &BlobId,
        ranges: &[ByteRange],
        opts: MultiRangeOpts,
    ) -> Result<Option<MultipartByteStream>> {
        let Some(path) = self.blob_path(namespace, id) else {
            return Ok(None);
        };
        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let total_len = meta.len();
        let boundary = format!("mfboundary{}", BlobId::generate().to_hex());

        let ranges = ranges.to_vec();
        let path_owned = path.clone();
        let boundary_owned = boundary.clone();
        let content_type = opts.content_type;

        let stream = async_stream::stream! {
            for (idx, range) in ranges.iter().enumerate() {
                let mut header = format!("--{boundary_owned}\r\n");
                if let Some(ct) = content_type.as_ref() {
                    header.push_str(&format!("Content-Type: {ct}\r\n"));
                }
                header.push_str(&format!(
                    "Content-Range: bytes {}-{}/{}\r\n\r\n",
                    range.start, range.end, total_len
                ));
                yield Ok(Bytes::from(header.into_bytes()));

                let mut file = match tokio::fs::File::open(&path_owned).await {
                    Ok(f) => f,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
                if let Err(e) = file.seek(std::io::SeekFrom::Start(range.start)).await {
                    yield Err(e);
                    return;
                }
                let mut remaining = range.len().min(total_len.saturating_sub(range.start));
                let mut buf = vec![0u8; 64 * 1024];
                while remaining > 0 {
                    let to_read = remaining.min(buf.len() as u64) as usize;
                    match file.read(&mut buf[..to_read]).await {
                        Ok(0) => break,
                        Ok(n) => {
                            remaining -= n as u64;
                            yield Ok(Bytes::copy_from_slice(&buf[..n]));
                        }
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
                yield Ok(Bytes::from_static(b"\r\n"));
                let _ = idx;
            }
            yield Ok(Bytes::from(format!("--{boundary_owned}--\r\n").into_bytes()));
        };

        Ok(Some(MultipartByteStream {
            stream: Box::pin(stream),
            boundary,
            total_len,
        }))
    }

    async fn delete(&self, namespace: &NamespaceId, id: &BlobId) -> Result<()> {
        let Some(path) = self.blob_path(namespace, id) else {
            return Ok(());
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            // A blob that is already gone is not an error: GC is best-effort and
            // idempotent (spec §4.1 "Failure semantics").
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn tokio_stream_from_reader<R>(reader: R) -> ByteStream
where
    R: tokio::io::AsyncRead + Send + 'static,
{
    let stream = tokio_util::io::ReaderStream::new(reader);
    Box::pin(stream)
}
