use serde::{Deserialize, Serialize};

/// `{className, serviceName?, unsafeUniqueKey?}` (spec §3 "Durable Object Designator").
///
/// `serviceName` defaults to the declaring worker when absent; resolution of that
/// default happens in `miniflare-config`, which is the only place that knows "the
/// current worker" while walking the option tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableObjectDesignator {
    pub class_name: String,
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default)]
    pub unsafe_unique_key: Option<String>,
}

impl DurableObjectDesignator {
    pub fn resolved_service<'a>(&'a self, current_worker: &'a str) -> &'a str {
        self.service_name.as_deref().unwrap_or(current_worker)
    }
}
