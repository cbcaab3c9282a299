//! Host/pathname glob dispatcher with mount-prefix stripping (spec §4.6).
//!
//! Shaped the same way as a connection-pool router keyed by member id: an
//! `Arc<Inner>` around a plain mutex guarding materialised state, cloned
//! cheaply for every caller, rebuilt lazily rather than updated in place.

mod glob;

use std::sync::Mutex;

use miniflare_core::WorkerOptions;
use tokio::sync::broadcast;

/// Which worker a matched (or fallen-through) request should dispatch to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Root,
    Mount(String),
}

#[derive(Debug, Clone)]
pub struct Dispatch {
    pub target: Target,
    /// Pathname to forward, with any legacy mount-prefix already stripped.
    pub path: String,
}

/// Emitted whenever the route table is (or will be) re-materialised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadEvent {
    /// A mount's options changed; the table is marked dirty and will be
    /// rebuilt on the next dispatch.
    Invalidated,
    /// The supervisor has observed a post-mount steady state (spec §4.6
    /// "a second reload event is emitted after the initial attach").
    SteadyState,
}

struct Entry {
    pattern: String,
    target: Target,
}

struct State {
    root: WorkerOptions,
    table: Vec<Entry>,
    dirty: bool,
}

fn materialise(root: &WorkerOptions) -> Vec<Entry> {
    let mut table = Vec::new();
    for route in &root.routes {
        table.push(Entry {
            pattern: route.to_string(),
            target: Target::Root,
        });
    }
    for (name, mount) in &root.mounts {
        for route in &mount.routes {
            table.push(Entry {
                pattern: route.to_string(),
                target: Target::Mount(name.clone()),
            });
        }
    }
    table
}

/// Dispatches `(host, pathname)` pairs to a root worker or one of its mounts.
///
/// Cloning a `Router` shares the same underlying state (`Arc`-backed), so a
/// handle can be held per in-flight request without contention beyond the
/// table rebuild itself.
#[derive(Clone)]
pub struct Router {
    inner: std::sync::Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    reload_tx: broadcast::Sender<ReloadEvent>,
}

impl Router {
    pub fn new(root: WorkerOptions) -> Self {
        let table = materialise(&root);
        let (reload_tx, _) = broadcast::channel(16);
        Self {
            inner: std::sync::Arc::new(Inner {
                state: Mutex::new(State { root, table, dirty: false }),
                reload_tx,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReloadEvent> {
        self.inner.reload_tx.subscribe()
    }

    /// Replace the root worker tree. The table is not rebuilt here; it is
    /// marked dirty and rebuilt lazily on the next `dispatch` call, so a burst
    /// of `set_root` calls pays the rebuild cost once (spec §4.6 "re-materialised
    /// on the next dispatch").
    pub fn set_root(&self, root: WorkerOptions) {
        let mut state = self.inner.state.lock().unwrap();
        state.root = root;
        state.dirty = true;
        drop(state);
        let _ = self.inner.reload_tx.send(ReloadEvent::Invalidated);
    }

    /// Called once the caller considers the attach complete, to surface the
    /// post-mount steady state to observers (spec §4.6).
    pub fn notify_steady_state(&self) {
        let _ = self.inner.reload_tx.send(ReloadEvent::SteadyState);
    }

    fn mount_names(state: &State) -> Vec<String> {
        state.root.mounts.keys().cloned().collect()
    }

    /// Resolve `(host, pathname)` to a dispatch target.
    ///
    /// Precedence: most specific glob match across root and mount routes,
    /// then legacy `/<mount>/...` path-prefix dispatch, then the root as
    /// catch-all fallback (spec §4.6).
    pub fn dispatch(&self, host: &str, pathname: &str) -> Dispatch {
        let mut state = self.inner.state.lock().unwrap();
        if state.dirty {
            state.table = materialise(&state.root);
            state.dirty = false;
        }

        let haystack = format!("{host}{pathname}");
        let mut best: Option<(usize, &Entry)> = None;
        for entry in &state.table {
            if let Some(score) = glob::match_glob(&entry.pattern, &haystack) {
                if best.map(|(s, _)| score > s).unwrap_or(true) {
                    best = Some((score, entry));
                }
            }
        }

        if let Some((_, entry)) = best {
            return Dispatch {
                target: entry.target.clone(),
                path: pathname.to_string(),
            };
        }

        for name in Self::mount_names(&state) {
            let prefix = format!("/{name}/");
            if let Some(stripped) = pathname.strip_prefix(&prefix) {
                return Dispatch {
                    target: Target::Mount(name),
                    path: format!("/{stripped}"),
                };
            }
        }

        Dispatch {
            target: Target::Root,
            path: pathname.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use miniflare_core::{RoutePattern, Source, WorkerOptions};
    use std::collections::BTreeMap;

    fn worker(name: &str, routes: &[&str]) -> WorkerOptions {
        WorkerOptions {
            name: name.to_string(),
            source: Source::Script(name.to_string()),
            compatibility_date: "2024-01-01".to_string(),
            compatibility_flags: Vec::new(),
            bindings: BTreeMap::new(),
            routes: routes.iter().map(|r| RoutePattern(r.to_string())).collect(),
            durable_objects: Vec::new(),
            kv_namespaces: Vec::new(),
            r2_buckets: Vec::new(),
            queues: Vec::new(),
            service_bindings: Vec::new(),
            outbound_service: None,
            root_path: std::path::PathBuf::new(),
            upstream: None,
            persist: Default::default(),
            mounts: BTreeMap::new(),
        }
    }

    #[test]
    fn mount_route_beats_unmatched_root_fallback() {
        let mut root = worker("", &[]);
        root.mounts.insert("m".to_string(), worker("m", &["host/m*"]));
        let router = Router::new(root);

        assert_eq!(router.dispatch("host", "/m").target, Target::Mount("m".to_string()));
        assert_eq!(router.dispatch("host", "/other").target, Target::Root);
    }

    #[test]
    fn set_root_invalidates_lazily() {
        let mut root = worker("", &[]);
        root.mounts.insert("m".to_string(), worker("m", &["host/m*"]));
        let router = Router::new(root.clone());
        assert_eq!(router.dispatch("host", "/m").target, Target::Mount("m".to_string()));

        let mut updated = root.clone();
        updated.mounts.insert("m".to_string(), worker("m", &["host/new-m*"]));
        router.set_root(updated);

        assert_eq!(router.dispatch("host", "/m").target, Target::Root);
        assert_eq!(router.dispatch("host", "/new-m").target, Target::Mount("m".to_string()));
    }

    #[test]
    fn legacy_mount_prefix_strips_and_dispatches() {
        let mut root = worker("", &[]);
        root.mounts.insert("legacy".to_string(), worker("legacy", &[]));
        let router = Router::new(root);

        let dispatch = router.dispatch("host", "/legacy/deep/path");
        assert_eq!(dispatch.target, Target::Mount("legacy".to_string()));
        assert_eq!(dispatch.path, "/deep/path");
    }
}
