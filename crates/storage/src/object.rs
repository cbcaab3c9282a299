//! R2-style object metadata (spec §3 "Object Metadata (R2 flavour)").

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::blob::ByteRange;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpMetadata {
    pub content_type: Option<String>,
    pub content_language: Option<String>,
    pub content_disposition: Option<String>,
    pub content_encoding: Option<String>,
    pub cache_control: Option<String>,
    pub cache_expiry: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checksums {
    pub md5: Option<String>,
    pub sha1: Option<String>,
    pub sha256: Option<String>,
    pub sha384: Option<String>,
    pub sha512: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultipartPart {
    pub part_number: u32,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultipartInfo {
    pub upload_id: String,
    pub parts: Vec<MultipartPart>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub key: String,
    pub version: String,
    pub size: u64,
    /// MD5 for a single-part object; `md5(concat(md5-of-each-part))-n` for a
    /// completed multipart object (spec §4.4 "complete").
    pub etag: String,
    /// `etag` wrapped in double quotes, as returned in the `ETag` HTTP header.
    pub http_etag: String,
    pub uploaded: i64,
    #[serde(default)]
    pub http_metadata: HttpMetadata,
    #[serde(default)]
    pub custom_metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub checksums: Checksums,
    #[serde(default)]
    pub multipart: Option<MultipartInfo>,
    #[serde(default)]
    pub range: Option<ByteRange>,
}

impl ObjectMetadata {
    pub fn trimmed_etag(raw: &str) -> String {
        raw.trim().trim_matches('"').to_string()
    }
}

/// The loose custom-metadata and HTTP-metadata pair accepted by put/create calls.
#[derive(Debug, Clone, Default)]
pub struct ObjectOptions {
    pub http_metadata: HttpMetadata,
    pub custom_metadata: BTreeMap<String, String>,
    /// A single caller-supplied checksum algorithm/value pair, if any
    /// (spec §4.5 "exactly one allowed").
    pub checksum: Option<(ChecksumAlgorithm, Vec<u8>)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Md5,
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

/// Arbitrary JSON passed through as object metadata for bindings that want it
/// (distinct from `custom_metadata`'s string map, which is the R2 HTTP shape).
pub type JsonMetadata = Value;
