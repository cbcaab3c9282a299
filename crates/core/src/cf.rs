use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Request `cf` properties, carried over the `CF-Blob` loopback header (spec §6).
/// Fields the simulator does not model are preserved verbatim in `extra` so they
/// round-trip even though this crate does not interpret them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CfProperties {
    #[serde(default)]
    pub colo: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub as_organization: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CfProperties {
    /// Merge per-request overrides onto a global default, request fields winning.
    pub fn merged(global: &CfProperties, request: &CfProperties) -> CfProperties {
        let mut out = global.clone();
        if request.colo.is_some() {
            out.colo = request.colo.clone();
        }
        if request.country.is_some() {
            out.country = request.country.clone();
        }
        if request.city.is_some() {
            out.city = request.city.clone();
        }
        if request.timezone.is_some() {
            out.timezone = request.timezone.clone();
        }
        if request.as_organization.is_some() {
            out.as_organization = request.as_organization.clone();
        }
        for (k, v) in &request.extra {
            out.extra.insert(k.clone(), v.clone());
        }
        out
    }
}
