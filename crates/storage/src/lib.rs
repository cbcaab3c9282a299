//! Simulated Storage Engine: Blob Store, Metadata DB, KeyValue Engine,
//! Multipart Engine, and the R2 object-model/precondition layer built on top
//! of them (spec §4).

pub mod blob;
pub mod error;
pub mod kv;
pub mod metadata;
pub mod multipart;
pub mod object;
pub mod precondition;
pub mod r2;

pub use blob::{
    BlobGetResult, BlobId, BlobStore, ByteRange, ByteStream, LocalDiskBlobStore, MultiRangeOpts,
    MultipartByteStream,
};
pub use error::{Result, StorageError};
pub use kv::{GetValue, GetValueMulti, KeyValueEngine, ListRequest, ListResult, PutRequest};
pub use metadata::{GetOutcome, KeyRow, MetadataDb};
pub use multipart::{CreateUploadOptions, MultipartEngine, UploadedPart};
pub use object::{
    ChecksumAlgorithm, Checksums, HttpMetadata, JsonMetadata, MultipartInfo, MultipartPart,
    ObjectMetadata, ObjectOptions,
};
pub use precondition::{evaluate, EtagList, OnlyIf, Verdict};
pub use r2::{R2Bucket, R2GetResult};
