//! Runtime config wire encoder (spec §6, resolved in SPEC_FULL.md §4.9).
//!
//! The production format is Cap'n-Proto-shaped; the runtime subprocess that
//! would consume it is out of scope here (§1 Non-goals). `ConfigWriter`
//! follows the same traverse-struct/call-primitive encoding rule with a
//! self-describing tagged frame instead of a capnp schema: every field write
//! is length-prefixed so a reader can skip fields it does not understand.

use std::collections::BTreeMap;

use bytes::{BufMut, BytesMut};
use miniflare_core::{BindingValue, WorkerOptions};

/// Tag bytes identifying each primitive write, mirroring the `init*`/`set*`
/// calls of the capnp schema in spec §6.
mod tag {
    pub const SET_NAME: u8 = 1;
    pub const SET_COMPATIBILITY_DATE: u8 = 2;
    pub const ADD_COMPATIBILITY_FLAG: u8 = 3;
    pub const INIT_SERVICE: u8 = 4;
    pub const ADD_BINDING: u8 = 5;
    pub const END_SERVICE: u8 = 6;
    pub const END_SERVICES: u8 = 7;
}

/// A void-tagged field is signalled by this sentinel length rather than an
/// `undefined`/null write (spec §6 "Encoding rule").
const VOID_SENTINEL: u32 = u32::MAX;

/// Appends a length-prefixed binary encoding of a config tree to an internal
/// `BytesMut` buffer. One `ConfigWriter` encodes one `updateConfig` call's
/// worth of services.
pub struct ConfigWriter {
    buf: BytesMut,
}

impl ConfigWriter {
    pub fn new() -> Self {
        Self { buf: BytesMut::new() }
    }

    fn write_str(&mut self, tag: u8, value: &str) {
        self.buf.put_u8(tag);
        self.buf.put_u32(value.len() as u32);
        self.buf.put_slice(value.as_bytes());
    }

    fn write_void(&mut self, tag: u8) {
        self.buf.put_u8(tag);
        self.buf.put_u32(VOID_SENTINEL);
    }

    fn write_binding(&mut self, name: &str, value: &BindingValue) {
        self.buf.put_u8(tag::ADD_BINDING);
        let mut body = BytesMut::new();
        body.put_u32(name.len() as u32);
        body.put_slice(name.as_bytes());
        encode_binding_value(&mut body, value);
        self.buf.put_u32(body.len() as u32);
        self.buf.put_slice(&body);
    }

    /// Encode a single worker service: `init_service` / `set_name` /
    /// `set_compatibility_date` / `add_compatibility_flag`* / `add_binding`* /
    /// `end_service`, in that order (spec §6 `Worker` shape).
    pub fn init_service(&mut self, worker: &WorkerOptions) {
        self.buf.put_u8(tag::INIT_SERVICE);
        self.write_str(tag::SET_NAME, &worker.name);

        if worker.compatibility_date.is_empty() {
            self.write_void(tag::SET_COMPATIBILITY_DATE);
        } else {
            self.write_str(tag::SET_COMPATIBILITY_DATE, &worker.compatibility_date);
        }

        for flag in &worker.compatibility_flags {
            self.write_str(tag::ADD_COMPATIBILITY_FLAG, flag);
        }

        for (name, value) in &worker.bindings {
            self.write_binding(name, value);
        }

        self.buf.put_u8(tag::END_SERVICE);
    }

    /// Encode the root service plus every mount, then finish the frame.
    pub fn encode_tree(root: &WorkerOptions) -> BytesMut {
        let mut writer = Self::new();
        writer.init_service(root);
        for mount in root.mounts.values() {
            writer.init_service(mount);
        }
        writer.buf.put_u8(tag::END_SERVICES);
        writer.finish()
    }

    pub fn finish(self) -> BytesMut {
        self.buf
    }
}

impl Default for ConfigWriter {
    fn default() -> Self {
        Self::new()
    }
}

fn encode_binding_value(body: &mut BytesMut, value: &BindingValue) {
    fn put_tagged_str(body: &mut BytesMut, kind: u8, s: &str) {
        body.put_u8(kind);
        body.put_u32(s.len() as u32);
        body.put_slice(s.as_bytes());
    }
    fn put_tagged_bytes(body: &mut BytesMut, kind: u8, s: &[u8]) {
        body.put_u8(kind);
        body.put_u32(s.len() as u32);
        body.put_slice(s);
    }

    match value {
        BindingValue::Parameter { value } => put_tagged_str(body, 0, value),
        BindingValue::Text { value } => put_tagged_str(body, 1, value),
        BindingValue::Data { value } => put_tagged_bytes(body, 2, value),
        BindingValue::Json { value } => {
            put_tagged_str(body, 3, &serde_json::to_string(value).unwrap_or_default())
        }
        BindingValue::WasmModule { path } => {
            put_tagged_str(body, 4, &path.to_string_lossy())
        }
        BindingValue::CryptoKey { key } => {
            put_tagged_str(body, 5, &serde_json::to_string(key).unwrap_or_default())
        }
        BindingValue::Service { service_name, environment } => {
            put_tagged_str(body, 6, service_name);
            put_tagged_str(body, 6, environment.as_deref().unwrap_or(""));
        }
        BindingValue::DurableObjectNamespace(designator) => {
            put_tagged_str(body, 7, &designator.class_name);
            put_tagged_str(body, 7, designator.service_name.as_deref().unwrap_or(""));
        }
        BindingValue::KvNamespace { namespace_id } => put_tagged_str(body, 8, namespace_id),
        BindingValue::R2Bucket { bucket_name } => put_tagged_str(body, 9, bucket_name),
        BindingValue::R2Admin { bucket_name } => put_tagged_str(body, 10, bucket_name),
        BindingValue::Wrapped { inner, wrapper } => {
            put_tagged_str(body, 11, wrapper);
            encode_binding_value(body, inner);
        }
        BindingValue::Queue { queue_name } => put_tagged_str(body, 12, queue_name),
    }
}

/// Decode just enough of a frame to recover service names, for tests and for
/// the loopback's diagnostics endpoint.
pub fn decode_service_names(mut buf: &[u8]) -> Vec<String> {
    let mut names = Vec::new();
    while !buf.is_empty() {
        let t = buf[0];
        buf = &buf[1..];
        match t {
            tag::INIT_SERVICE | tag::END_SERVICE | tag::END_SERVICES => {}
            tag::SET_NAME | tag::SET_COMPATIBILITY_DATE | tag::ADD_COMPATIBILITY_FLAG | tag::ADD_BINDING => {
                let len = u32::from_be_bytes(buf[..4].try_into().unwrap());
                buf = &buf[4..];
                if len != VOID_SENTINEL {
                    if t == tag::SET_NAME {
                        names.push(String::from_utf8_lossy(&buf[..len as usize]).into_owned());
                    }
                    buf = &buf[len as usize..];
                }
            }
            _ => break,
        }
    }
    names
}

/// The assembled durable-object class map, re-expressed for wire encoding
/// convenience (not a distinct capnp message in the source, but a useful seam
/// here since the runtime would otherwise re-derive it).
pub type ClassMap = BTreeMap<(String, String), Option<String>>;

#[cfg(test)]
mod tests {
    use super::*;
    use miniflare_core::{PersistOptions, Source};
    use std::collections::BTreeMap as Map;
    use std::path::PathBuf;

    fn worker(name: &str) -> WorkerOptions {
        WorkerOptions {
            name: name.to_string(),
            source: Source::Script("x".to_string()),
            compatibility_date: "2024-01-01".to_string(),
            compatibility_flags: vec!["flag_a".to_string()],
            bindings: Map::new(),
            routes: Vec::new(),
            durable_objects: Vec::new(),
            kv_namespaces: Vec::new(),
            r2_buckets: Vec::new(),
            queues: Vec::new(),
            service_bindings: Vec::new(),
            outbound_service: None,
            root_path: PathBuf::new(),
            upstream: None,
            persist: PersistOptions::default(),
            mounts: Map::new(),
        }
    }

    #[test]
    fn round_trips_service_name() {
        let root = worker("");
        let frame = ConfigWriter::encode_tree(&root);
        let names = decode_service_names(&frame);
        assert_eq!(names, vec!["".to_string()]);
    }

    #[test]
    fn encodes_mounts_after_root() {
        let mut root = worker("");
        root.mounts.insert("m".to_string(), worker("m"));
        let frame = ConfigWriter::encode_tree(&root);
        let names = decode_service_names(&frame);
        assert_eq!(names, vec!["".to_string(), "m".to_string()]);
    }

    /// Pins the decoded service-name shape of a root-plus-mounts frame, so an
    /// accidental reordering in `encode_tree` shows up as a diff.
    #[test]
    fn wire_shape_matches_snapshot() {
        let mut root = worker("");
        root.mounts.insert("blog".to_string(), worker("blog"));
        root.mounts.insert("api".to_string(), worker("api"));
        let frame = ConfigWriter::encode_tree(&root);
        let names = decode_service_names(&frame);
        insta::assert_debug_snapshot!(names, @r###"
        [
            "",
            "api",
            "blog",
        ]
        "###);
    }
}
