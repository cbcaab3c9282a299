use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::durable_object::DurableObjectDesignator;
use crate::namespace::PersistTarget;

/// A single ES module of a module-graph worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub path: String,
    pub contents: Vec<u8>,
}

/// Worker source: inline script, a module graph, or a path reference to either
/// (spec §3 "Worker" attributes).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Source {
    Script(String),
    ScriptPath(PathBuf),
    Modules(Vec<Module>),
}

/// A route glob matched against an incoming URL's `host/pathname` (spec §4.6 Router).
/// `*` is permitted at the end of the pattern (pathname prefix) and within the host
/// component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutePattern(pub String);

impl std::fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One binding declaration (spec §6 `Binding = { name, oneOf {...} }`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BindingValue {
    Parameter { value: String },
    Text { value: String },
    Data { value: Vec<u8> },
    Json { value: Value },
    WasmModule { path: PathBuf },
    CryptoKey { key: Value },
    Service { service_name: String, environment: Option<String> },
    DurableObjectNamespace(DurableObjectDesignator),
    KvNamespace { namespace_id: String },
    R2Bucket { bucket_name: String },
    R2Admin { bucket_name: String },
    Wrapped { inner: Box<BindingValue>, wrapper: String },
    Queue { queue_name: String },
}

/// Per-worker persistence overrides for each plugin kind (spec §6 "Persistence
/// per namespace kind").
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistOptions {
    pub kv_persist: Option<PersistTarget>,
    pub cache_persist: Option<PersistTarget>,
    pub durable_objects_persist: Option<PersistTarget>,
    pub r2_persist: Option<PersistTarget>,
}

/// A named unit of executable content plus bindings (spec §3 "Worker").
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerOptions {
    /// Unique across the tree; empty string is reserved for the root worker.
    pub name: String,
    pub source: Source,
    pub compatibility_date: String,
    pub compatibility_flags: Vec<String>,
    pub bindings: BTreeMap<String, BindingValue>,
    pub routes: Vec<RoutePattern>,
    pub durable_objects: Vec<(String, DurableObjectDesignator)>,
    pub kv_namespaces: Vec<String>,
    pub r2_buckets: Vec<String>,
    pub queues: Vec<String>,
    pub service_bindings: Vec<String>,
    pub outbound_service: Option<String>,
    pub root_path: PathBuf,
    pub upstream: Option<String>,
    pub persist: PersistOptions,
    /// Root-only: named child workers. Spec invariant: a mount's own `mounts` must
    /// be empty (one-level nesting, `ERR_MOUNT_NESTED`).
    pub mounts: BTreeMap<String, WorkerOptions>,
}

impl WorkerOptions {
    pub fn is_root(&self) -> bool {
        self.name.is_empty()
    }

    /// True if this worker (or, recursively, one of its mounts) is allowed to carry
    /// mounts. Only the tree's root worker is.
    pub fn has_mounts(&self) -> bool {
        !self.mounts.is_empty()
    }
}
