use std::path::PathBuf;

use url::Url;

/// Where a namespace's rows and blobs live on disk (spec §3 "Namespace", §6 "Persistence per namespace kind").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistTarget {
    /// `kvPersist: false` (or omitted) — ephemeral, torn down with the namespace.
    Ephemeral,
    /// `kvPersist: true` — default directory under the worker's root.
    Default,
    /// A filesystem path, resolved against the declaring worker's root if relative.
    Path(PathBuf),
    /// An opaque URL, used as-is (e.g. a remote object store in a real deployment).
    Url(Url),
}

impl PersistTarget {
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, PersistTarget::Ephemeral)
    }
}

/// The kind of plugin a namespace belongs to; selects the table/column shape and
/// size-limit rules layered on top of the shared KeyValue Engine (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PluginKind {
    Kv,
    Cache,
    DurableObjects,
    R2,
}

impl PluginKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginKind::Kv => "kv",
            PluginKind::Cache => "cache",
            PluginKind::DurableObjects => "do",
            PluginKind::R2 => "r2",
        }
    }
}

/// Triple (pluginKind, namespaceId, persistenceRoot): the keyspace identity for a
/// single `KeyValueEngine` instance (spec §3 "Namespace").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceId {
    pub plugin_kind: PluginKind,
    pub namespace_id: String,
    pub persist: PersistTarget,
}

impl NamespaceId {
    pub fn new(plugin_kind: PluginKind, namespace_id: impl Into<String>, persist: PersistTarget) -> Self {
        Self {
            plugin_kind,
            namespace_id: namespace_id.into(),
            persist,
        }
    }

    /// Sanitised on-disk label, safe to join onto a persistence root (spec §4.1 "Paths
    /// are derived from a sanitised namespace label + id").
    pub fn sanitised_label(&self) -> String {
        let cleaned: String = self
            .namespace_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}-{}", self.plugin_kind.as_str(), cleaned)
    }
}
