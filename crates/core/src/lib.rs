//! Event mesh core types: resources, component categories, routing records and errors.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::OnceLock;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub mod config;
pub mod error;
pub mod trigger;

pub use config::MeshConfig;
pub use error::{MeshError, MeshResult, TaskFailure};
pub use trigger::{BackoffPolicy, DeliveryOptions, ExactFilter, Filter, Target, Trigger};

pub const SECRET_KIND: &str = "Secret";
pub const BROKER_KIND: &str = "Broker";
pub const TRIGGER_KIND: &str = "Trigger";

/// apiVersion shared by Broker and Trigger resources.
pub const EVENTING_API_VERSION: &str = "eventing.triggermesh.io/v1alpha1";

/// Label binding every resource to the broker (operating context) that owns it.
pub const CONTEXT_LABEL: &str = "triggermesh.io/context";

/// Annotation holding the content hash of the last resolved secret environment.
pub const SECRETS_HASH_ANNOTATION: &str = "triggermesh.io/secrets-hash";

/// A typed, named record of the object store.
///
/// Identity is `metadata.name` alone; `kind` is descriptive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Opaque spec; typed views are taken at the edges that need them.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub spec: serde_json::Value,
    /// Plain key/value payload, only used by `Secret` resources.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, String>,
}

impl Resource {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            metadata: ObjectMeta { name: Some(name.into()), ..Default::default() },
            spec: serde_json::Value::Null,
            data: BTreeMap::new(),
        }
    }

    pub fn with_spec(mut self, spec: serde_json::Value) -> Self {
        self.spec = spec;
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.metadata.labels.get_or_insert_with(BTreeMap::new).insert(key.to_string(), value.to_string());
        self
    }

    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("")
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.metadata.labels.as_ref()?.get(key).map(String::as_str)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata.annotations.as_ref()?.get(key).map(String::as_str)
    }

    /// Set or clear an annotation; an emptied map is dropped so it does not serialize.
    pub fn set_annotation(&mut self, key: &str, value: Option<&str>) {
        match value {
            Some(v) => {
                self.metadata.annotations.get_or_insert_with(BTreeMap::new).insert(key.to_string(), v.to_string());
            }
            None => {
                if let Some(annos) = self.metadata.annotations.as_mut() {
                    annos.remove(key);
                    if annos.is_empty() {
                        self.metadata.annotations = None;
                    }
                }
            }
        }
    }

    /// API group part of `apiVersion` (empty for the core group, e.g. `v1`).
    pub fn group(&self) -> &str {
        self.api_version.split_once('/').map(|(g, _)| g).unwrap_or("")
    }

    pub fn is_kind(&self, kind: &str) -> bool {
        self.kind.eq_ignore_ascii_case(kind)
    }

    pub fn is_secret(&self) -> bool {
        self.is_kind(SECRET_KIND)
    }
}

/// Closed set of structural categories a resource can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Source,
    Target,
    Transformation,
    Broker,
    Trigger,
}

/// What a category is able to do in the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    /// Emits events into the broker.
    pub producer: bool,
    /// Receives events through triggers.
    pub consumer: bool,
    /// Materialized as a runtime instance.
    pub runnable: bool,
}

impl Category {
    pub const fn capabilities(self) -> Capabilities {
        match self {
            Category::Source => Capabilities { producer: true, consumer: false, runnable: true },
            Category::Target => Capabilities { producer: false, consumer: true, runnable: true },
            Category::Transformation => Capabilities { producer: true, consumer: true, runnable: true },
            Category::Broker => Capabilities { producer: false, consumer: false, runnable: true },
            Category::Trigger => Capabilities { producer: false, consumer: false, runnable: false },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Source => "source",
            Category::Target => "target",
            Category::Transformation => "transformation",
            Category::Broker => "broker",
            Category::Trigger => "trigger",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("static regex"))
}

/// Validate a resource name (DNS-1123 label, max 63 chars).
pub fn validate_name(name: &str) -> MeshResult<()> {
    if name.is_empty() || name.len() > 63 || !name_re().is_match(name) {
        return Err(MeshError::InvalidResource(format!(
            "invalid name {:?}: expected lowercase alphanumerics and '-', at most 63 chars",
            name
        )));
    }
    Ok(())
}

/// Convention for the secret resource owned by a component.
pub fn secret_name_for(component: &str) -> String {
    format!("{}-secret", component)
}

/// Runtime instance name of a broker (the broker resource name is the context name).
pub fn broker_instance_name(broker: &str) -> String {
    format!("{}-broker", broker)
}

fn bad_path(dotted: &str) -> MeshError {
    MeshError::InvalidResource(format!("bad field path {:?}", dotted))
}

/// Set `value` at a dotted path inside `spec`, creating intermediate objects.
/// Non-object values on the way are replaced.
pub fn set_path(spec: &mut serde_json::Value, dotted: &str, value: serde_json::Value) -> MeshResult<()> {
    let segments: Vec<&str> = dotted.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(bad_path(dotted));
    }
    let (last, parents) = segments.split_last().ok_or_else(|| bad_path(dotted))?;
    let mut cur = spec;
    for seg in parents {
        if !cur.is_object() {
            *cur = serde_json::Value::Object(Default::default());
        }
        let map = cur.as_object_mut().ok_or_else(|| bad_path(dotted))?;
        cur = map.entry(seg.to_string()).or_insert(serde_json::Value::Null);
    }
    if !cur.is_object() {
        *cur = serde_json::Value::Object(Default::default());
    }
    let map = cur.as_object_mut().ok_or_else(|| bad_path(dotted))?;
    map.insert(last.to_string(), value);
    Ok(())
}

/// Ephemeral descriptor of a running component; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeInstance {
    pub component: String,
    pub host_port: u16,
}

pub mod prelude {
    pub use super::{
        Capabilities, Category, MeshConfig, MeshError, MeshResult, Resource, RuntimeInstance, TaskFailure, Trigger,
    };
}
