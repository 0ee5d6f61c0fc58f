//! Event mesh schema: versioned CRD cache keyed by lower-cased kind, plus the capability resolver.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use emesh_core::{MeshError, MeshResult};
use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

mod resolve;

pub use resolve::{CapabilityResolver, Classification, ResolvedKind};

/// Annotation on a CRD listing the event types its instances produce (JSON array).
pub const EVENT_TYPES_ANNOTATION: &str = "registry.knative.dev/eventTypes";

const CRD_KIND: &str = "CustomResourceDefinition";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrdMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrdNames {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub plural: String,
    #[serde(default)]
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrdVersion {
    pub name: String,
    #[serde(default)]
    pub served: bool,
    #[serde(default)]
    pub storage: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrdSpec {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub names: CrdNames,
    #[serde(default)]
    pub versions: Vec<CrdVersion>,
}

/// The slice of a CustomResourceDefinition the mesh needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Crd {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: CrdMeta,
    #[serde(default)]
    pub spec: CrdSpec,
}

#[derive(Debug, Deserialize)]
struct EventTypeEntry {
    #[serde(rename = "type")]
    event_type: String,
}

impl Crd {
    /// Version new objects are written with: storage version, else first served, else first listed.
    pub fn served_version(&self) -> Option<&str> {
        let vs = &self.spec.versions;
        vs.iter()
            .find(|v| v.storage)
            .or_else(|| vs.iter().find(|v| v.served))
            .or_else(|| vs.first())
            .map(|v| v.name.as_str())
    }

    /// Declared event types. Absence is not an error; callers that need types decide.
    pub fn event_types(&self) -> MeshResult<Vec<String>> {
        let raw = match self.metadata.annotations.get(EVENT_TYPES_ANNOTATION) {
            Some(raw) if !raw.trim().is_empty() => raw,
            _ => return Ok(Vec::new()),
        };
        let entries: Vec<EventTypeEntry> = serde_json::from_str(raw).map_err(|e| MeshError::InvalidSchema {
            kind: self.spec.names.kind.clone(),
            reason: format!("{}: {}", EVENT_TYPES_ANNOTATION, e),
        })?;
        Ok(entries.into_iter().map(|e| e.event_type).filter(|t| !t.is_empty()).collect())
    }
}

/// Parse a multi-document CRD bundle into a map keyed by lower-cased kind.
pub fn parse_crds(raw: &str) -> MeshResult<FxHashMap<String, Arc<Crd>>> {
    let mut out = FxHashMap::default();
    for doc in serde_yaml::Deserializer::from_str(raw) {
        let value = serde_yaml::Value::deserialize(doc)?;
        if value.is_null() {
            continue;
        }
        let crd: Crd = serde_yaml::from_value(value)?;
        if crd.kind != CRD_KIND || crd.spec.names.kind.is_empty() {
            continue;
        }
        out.insert(crd.spec.names.kind.to_lowercase(), Arc::new(crd));
    }
    Ok(out)
}

/// Source of schema metadata by kind.
pub trait SchemaProvider: Send + Sync {
    fn resolve(&self, kind: &str) -> MeshResult<Arc<Crd>>;
    /// All known kinds, lower-cased.
    fn kinds(&self) -> Vec<String>;
}

/// Read-only, versioned schema map. Fetching the bundle is someone else's job;
/// this only loads what is already cached on disk or handed in.
pub struct SchemaCache {
    version: String,
    crds: ArcSwap<FxHashMap<String, Arc<Crd>>>,
}

impl SchemaCache {
    pub fn new(version: impl Into<String>, crds: FxHashMap<String, Arc<Crd>>) -> Self {
        Self { version: version.into(), crds: ArcSwap::from_pointee(crds) }
    }

    pub fn from_yaml(version: impl Into<String>, raw: &str) -> MeshResult<Self> {
        Ok(Self::new(version, parse_crds(raw)?))
    }

    /// Load `<home>/crd/<version>/crd.yaml`. A missing file yields an empty cache.
    pub fn load(path: &Path, version: impl Into<String>) -> MeshResult<Self> {
        let version = version.into();
        match std::fs::read_to_string(path) {
            Ok(raw) => {
                let crds = parse_crds(&raw).map_err(|e| MeshError::corrupt(path, e))?;
                debug!(path = %path.display(), version = %version, kinds = crds.len(), "schema cache loaded");
                Ok(Self::new(version, crds))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no cached schema bundle");
                Ok(Self::new(version, FxHashMap::default()))
            }
            Err(e) => Err(MeshError::store_io(path, e)),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn len(&self) -> usize {
        self.crds.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Swap in a freshly fetched bundle; readers holding the old map keep it.
    pub fn replace(&self, crds: FxHashMap<String, Arc<Crd>>) {
        self.crds.store(Arc::new(crds));
    }

    /// Closest known kind for a typo, if any matches at all.
    pub fn suggest(&self, kind: &str) -> Option<String> {
        let matcher = SkimMatcherV2::default();
        let query = kind.to_lowercase();
        self.crds
            .load()
            .keys()
            .filter_map(|k| matcher.fuzzy_match(k, &query).map(|score| (score, k.clone())))
            .max_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.cmp(&a.1)))
            .map(|(_, k)| k)
    }
}

impl SchemaProvider for SchemaCache {
    fn resolve(&self, kind: &str) -> MeshResult<Arc<Crd>> {
        let key = kind.to_lowercase();
        match self.crds.load().get(&key) {
            Some(crd) => Ok(Arc::clone(crd)),
            None => Err(MeshError::UnknownKind { kind: kind.to_string(), suggestion: self.suggest(kind) }),
        }
    }

    fn kinds(&self) -> Vec<String> {
        let mut out: Vec<String> = self.crds.load().keys().cloned().collect();
        out.sort();
        out
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    pub const BUNDLE: &str = r#"
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: pingsources.sources.triggermesh.io
  annotations:
    registry.knative.dev/eventTypes: |
      [ { "type": "dev.knative.sources.ping" } ]
spec:
  group: sources.triggermesh.io
  scope: Namespaced
  names:
    kind: PingSource
    plural: pingsources
  versions:
  - name: v1alpha1
    served: true
    storage: true
---
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: webhooksources.sources.triggermesh.io
spec:
  group: sources.triggermesh.io
  names:
    kind: WebhookSource
  versions:
  - name: v1alpha1
    served: true
---
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: httptargets.targets.triggermesh.io
spec:
  group: targets.triggermesh.io
  names:
    kind: HTTPTarget
  versions:
  - name: v1alpha1
    served: true
    storage: true
---
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: transformations.flow.triggermesh.io
  annotations:
    registry.knative.dev/eventTypes: '[{"type":"io.triggermesh.transformation"}]'
spec:
  group: flow.triggermesh.io
  names:
    kind: Transformation
  versions:
  - name: v1alpha1
    storage: true
---
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: widgets.example.com
spec:
  group: example.com
  names:
    kind: Widget
  versions:
  - name: v1
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: not-a-crd
"#;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bundle_keyed_by_lowercase_kind() {
        let cache = SchemaCache::from_yaml("v1.0.0", fixtures::BUNDLE).unwrap();
        assert_eq!(cache.kinds(), vec!["httptarget", "pingsource", "transformation", "webhooksource", "widget"]);
        let ping = cache.resolve("PingSource").unwrap();
        assert_eq!(ping.spec.group, "sources.triggermesh.io");
        assert_eq!(ping.served_version(), Some("v1alpha1"));
        assert_eq!(ping.event_types().unwrap(), vec!["dev.knative.sources.ping"]);
        assert!(cache.resolve("webhooksource").unwrap().event_types().unwrap().is_empty());
    }

    #[test]
    fn unknown_kind_carries_suggestion() {
        let cache = SchemaCache::from_yaml("v1", fixtures::BUNDLE).unwrap();
        match cache.resolve("httptarg") {
            Err(MeshError::UnknownKind { suggestion, .. }) => assert_eq!(suggestion.as_deref(), Some("httptarget")),
            other => panic!("unexpected: {:?}", other.map(|c| c.spec.names.kind.clone())),
        }
    }

    #[test]
    fn malformed_event_types_annotation_is_schema_error() {
        let mut crd = Crd::default();
        crd.metadata.annotations.insert(EVENT_TYPES_ANNOTATION.into(), "{not json".into());
        assert!(matches!(crd.event_types(), Err(MeshError::InvalidSchema { .. })));
    }

    #[test]
    fn missing_cache_file_is_empty_and_replace_swaps() {
        let dir = std::env::temp_dir().join("emesh-schema-missing-cache");
        let cache = SchemaCache::load(&dir.join("crd.yaml"), "v9").unwrap();
        assert!(cache.is_empty());
        cache.replace(parse_crds(fixtures::BUNDLE).unwrap());
        assert_eq!(cache.len(), 5);
        assert_eq!(cache.version(), "v9");
    }
}
