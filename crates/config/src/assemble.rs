//! Cross-worker validation and derived state (spec §4.7 "Assembly pipeline").

use std::collections::BTreeMap;

use miniflare_core::{BindingValue, OptionError, QueueConsumer, RoutePattern, WorkerOptions};

use crate::validate::validate_worker;

/// Builds the root worker tree from a flat input list: exactly one worker must
/// carry the empty (root) name; the rest become its mounts.
///
/// This is step 1 of the assembly pipeline: "reject empty worker list and
/// duplicate names" (spec §4.7), plus the mount-shape invariants (one-level
/// nesting, non-empty mount names) that only make sense once the tree is built.
pub fn from_workers(workers: Vec<WorkerOptions>) -> Result<WorkerOptions, OptionError> {
    if workers.is_empty() {
        return Err(OptionError::NoWorkers);
    }

    let mut seen = std::collections::HashSet::new();
    for worker in &workers {
        if !seen.insert(worker.name.clone()) {
            return Err(OptionError::DuplicateName(worker.name.clone()));
        }
    }

    let mut root = None;
    let mut mounts = Vec::new();
    for worker in workers {
        if worker.is_root() {
            root = Some(worker);
        } else {
            mounts.push(worker);
        }
    }

    let mut root = root.ok_or_else(|| OptionError::Validation {
        path: "workers".to_string(),
        message: "exactly one worker must have an empty name (the root)".to_string(),
    })?;

    for mount in mounts {
        if mount.name.is_empty() {
            return Err(OptionError::MountNoName(mount.name));
        }
        if mount.has_mounts() {
            return Err(OptionError::MountNested(mount.name));
        }
        let name = mount.name.clone();
        validate_worker(&mount, &format!("mounts[{name:?}]"))
            .map_err(|source| OptionError::Mount { name: name.clone(), source: Box::new(source) })?;
        root.mounts.insert(name, mount);
    }

    validate_worker(&root, "root")?;

    Ok(root)
}

/// Cross-worker derived state (spec §4.7 step 2): durable object class names,
/// queue consumer validation, and the flattened route list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssembledConfig {
    /// `(serviceName, className) -> unsafeUniqueKey`, deduplicated and checked
    /// for consistency across every declaring worker.
    pub durable_object_classes: BTreeMap<(String, String), Option<String>>,
    pub queue_consumers: Vec<QueueConsumer>,
    pub worker_routes: Vec<(String, RoutePattern)>,
}

fn all_workers(root: &WorkerOptions) -> Vec<&WorkerOptions> {
    let mut out = vec![root];
    out.extend(root.mounts.values());
    out
}

fn collect_durable_object_classes(
    workers: &[&WorkerOptions],
) -> Result<BTreeMap<(String, String), Option<String>>, OptionError> {
    let mut classes: BTreeMap<(String, String), Option<String>> = BTreeMap::new();

    let mut designators = Vec::new();
    for worker in workers {
        for binding in worker.bindings.values() {
            if let BindingValue::DurableObjectNamespace(designator) = binding {
                designators.push((worker.name.as_str(), designator));
            }
        }
        for (_, designator) in &worker.durable_objects {
            designators.push((worker.name.as_str(), designator));
        }
    }

    for (worker_name, designator) in designators {
        let service = designator.resolved_service(worker_name).to_string();
        let class_name = designator.class_name.clone();
        let key = (service.clone(), class_name.clone());

        match classes.get(&key) {
            Some(existing) if *existing != designator.unsafe_unique_key => {
                return Err(OptionError::DifferentUniqueKeys {
                    worker: worker_name.to_string(),
                    service_name: service,
                    class_name,
                });
            }
            _ => {
                classes.insert(key, designator.unsafe_unique_key.clone());
            }
        }
    }

    Ok(classes)
}

fn validate_queue_consumers(consumers: &[QueueConsumer]) -> Result<(), OptionError> {
    let mut seen = std::collections::HashSet::new();
    for consumer in consumers {
        if !seen.insert(consumer.queue_name.clone()) {
            return Err(OptionError::MultipleConsumers(consumer.queue_name.clone()));
        }
        if consumer.dead_letter_queue.as_deref() == Some(consumer.queue_name.as_str()) {
            return Err(OptionError::DeadLetterQueueCycle(consumer.queue_name.clone()));
        }
    }
    Ok(())
}

fn collect_routes(workers: &[&WorkerOptions]) -> Vec<(String, RoutePattern)> {
    workers
        .iter()
        .flat_map(|w| w.routes.iter().map(move |r| (w.name.clone(), r.clone())))
        .collect()
}

/// Run the full assembly pipeline over an already-built root tree (spec §4.7
/// steps 1-2; binding materialisation and runtime service dedup, steps 3-4,
/// are the runtime subprocess's job and out of scope here per §1).
pub fn assemble(root: &WorkerOptions, queue_consumers: Vec<QueueConsumer>) -> Result<AssembledConfig, OptionError> {
    validate_worker(root, "root")?;
    for (name, mount) in &root.mounts {
        validate_worker(mount, &format!("mounts[{name:?}]"))
            .map_err(|source| OptionError::Mount { name: name.clone(), source: Box::new(source) })?;
    }

    let workers = all_workers(root);
    let durable_object_classes = collect_durable_object_classes(&workers)?;
    validate_queue_consumers(&queue_consumers)?;
    let worker_routes = collect_routes(&workers);

    Ok(AssembledConfig {
        durable_object_classes,
        queue_consumers,
        worker_routes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use miniflare_core::{DurableObjectDesignator, PersistOptions, Source};
    use std::path::PathBuf;

    fn worker(name: &str) -> WorkerOptions {
        WorkerOptions {
            name: name.to_string(),
            source: Source::Script("x".to_string()),
            compatibility_date: "2024-01-01".to_string(),
            compatibility_flags: Vec::new(),
            bindings: BTreeMap::new(),
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
            mounts: BTreeMap::new(),
        }
    }

    #[test]
    fn empty_worker_list_is_rejected() {
        assert_eq!(from_workers(Vec::new()).unwrap_err(), OptionError::NoWorkers);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = from_workers(vec![worker(""), worker("a"), worker("a")]).unwrap_err();
        assert_eq!(err, OptionError::DuplicateName("a".to_string()));
    }

    #[test]
    fn nested_mount_is_rejected() {
        let mut inner_mount_root = worker("a");
        inner_mount_root.mounts.insert("b".to_string(), worker("b"));
        let err = from_workers(vec![worker(""), inner_mount_root]).unwrap_err();
        assert_eq!(err, OptionError::MountNested("a".to_string()));
    }

    #[test]
    fn mismatched_unique_keys_are_rejected() {
        let mut root = worker("");
        root.bindings.insert(
            "A".to_string(),
            BindingValue::DurableObjectNamespace(DurableObjectDesignator {
                class_name: "Counter".to_string(),
                service_name: None,
                unsafe_unique_key: Some("k1".to_string()),
            }),
        );
        root.bindings.insert(
            "B".to_string(),
            BindingValue::DurableObjectNamespace(DurableObjectDesignator {
                class_name: "Counter".to_string(),
                service_name: None,
                unsafe_unique_key: Some("k2".to_string()),
            }),
        );

        let err = assemble(&root, Vec::new()).unwrap_err();
        assert!(matches!(err, OptionError::DifferentUniqueKeys { .. }));
    }

    #[test]
    fn self_referential_dlq_is_rejected() {
        let root = worker("");
        let consumers = vec![QueueConsumer {
            queue_name: "q".to_string(),
            worker_name: "".to_string(),
            dead_letter_queue: Some("q".to_string()),
        }];
        let err = assemble(&root, consumers).unwrap_err();
        assert_eq!(err, OptionError::DeadLetterQueueCycle("q".to_string()));
    }

    #[test]
    fn cross_queue_dlq_cycle_is_accepted() {
        let root = worker("");
        let consumers = vec![
            QueueConsumer { queue_name: "q1".to_string(), worker_name: "".to_string(), dead_letter_queue: Some("q2".to_string()) },
            QueueConsumer { queue_name: "q2".to_string(), worker_name: "".to_string(), dead_letter_queue: Some("q1".to_string()) },
        ];
        assert!(assemble(&root, consumers).is_ok());
    }
}
