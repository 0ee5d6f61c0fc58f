//! Event mesh orchestration: reconcile declared components into running instances and routes,
//! and cascade deletions across the manifest, the routing table and the runtime.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use emesh_core::{
    broker_instance_name, Category, DeliveryOptions, MeshConfig, MeshResult, Resource, RuntimeInstance, TaskFailure,
    BROKER_KIND, TRIGGER_KIND,
};
use emesh_runtime::{ContainerRuntime, InstanceState};
use emesh_schema::{CapabilityResolver, SchemaProvider};
use emesh_store::{DiffSummary, Manifest};
use serde::{Deserialize, Serialize};

mod cascade;
mod finalize;
mod reconcile;
mod routes;

pub use cascade::DeleteReport;
pub use finalize::{transport_outcome, Finalized, Finalizer, FinalizerRegistry, ALREADY_UNSUBSCRIBED};

/// What an operation did to one component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Action {
    Created,
    Restarted,
    Unchanged,
    Stopped,
    Deleted,
    Skipped { reason: String },
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Created => f.write_str("created"),
            Action::Restarted => f.write_str("restarted"),
            Action::Unchanged => f.write_str("unchanged"),
            Action::Stopped => f.write_str("stopped"),
            Action::Deleted => f.write_str("deleted"),
            Action::Skipped { reason } => write!(f, "skipped ({})", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub component: String,
    pub action: Action,
}

/// A component as the caller wants it.
#[derive(Debug, Clone, Default)]
pub struct ComponentRequest {
    pub name: String,
    /// Full kind (`HTTPTarget`) or a short one combined with `category`.
    pub kind: String,
    pub category: Option<Category>,
    /// Resolved from the schema when absent.
    pub api_version: Option<String>,
    pub spec: serde_json::Value,
    /// Spec field path -> plain value; stored in `<name>-secret` and referenced from the spec.
    pub secrets: BTreeMap<String, String>,
    /// Producers whose event types this component subscribes to.
    pub consumes: Vec<String>,
    /// Extra event types to subscribe to.
    pub event_types: Vec<String>,
    pub delivery: DeliveryOptions,
}

impl ComponentRequest {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { name: name.into(), kind: kind.into(), ..Default::default() }
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_spec(mut self, spec: serde_json::Value) -> Self {
        self.spec = spec;
        self
    }

    pub fn with_secret(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(field.into(), value.into());
        self
    }

    pub fn consuming(mut self, producer: impl Into<String>) -> Self {
        self.consumes.push(producer.into());
        self
    }

    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_types.push(event_type.into());
        self
    }

    pub fn with_delivery(mut self, delivery: DeliveryOptions) -> Self {
        self.delivery = delivery;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub component: String,
    pub kind: String,
    pub action: Action,
    pub instance: Option<RuntimeInstance>,
    /// Spec change against the previously stored version.
    pub diff: DiffSummary,
    /// Triggers created or updated for this component.
    pub triggers: Vec<String>,
    pub warnings: Vec<String>,
}

/// Per-component results of a batch run, in manifest order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReport {
    pub reports: Vec<ReconcileReport>,
    pub failures: Vec<TaskFailure>,
}

impl BatchReport {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn into_result(self) -> MeshResult<Vec<ReconcileReport>> {
        if self.failures.is_empty() {
            Ok(self.reports)
        } else {
            Err(emesh_core::MeshError::AggregateTask { failures: self.failures })
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopReport {
    pub outcomes: Vec<Outcome>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentStatus {
    pub name: String,
    pub kind: String,
    pub category: Option<Category>,
    /// `None` for records that never run (triggers).
    pub state: Option<InstanceState>,
    pub instance: Option<RuntimeInstance>,
}

/// Owns one operating context (broker): its manifest, its routing table and the instances it started.
pub struct Reconciler {
    cfg: MeshConfig,
    runtime: Arc<dyn ContainerRuntime>,
    resolver: CapabilityResolver,
    finalizers: FinalizerRegistry,
    /// Serialises read-modify-write cycles on the context files within this process.
    write: tokio::sync::Mutex<()>,
}

impl Reconciler {
    pub fn new(cfg: MeshConfig, runtime: Arc<dyn ContainerRuntime>, schema: Arc<dyn SchemaProvider>) -> Self {
        let resolver = CapabilityResolver::new(schema, cfg.api_domain.clone());
        Self { cfg, runtime, resolver, finalizers: FinalizerRegistry::new(), write: tokio::sync::Mutex::new(()) }
    }

    pub fn with_finalizers(mut self, finalizers: FinalizerRegistry) -> Self {
        self.finalizers = finalizers;
        self
    }

    /// Same collaborators, another context.
    pub fn for_context(&self, context: &str) -> Self {
        Self {
            cfg: self.cfg.clone().with_context(context),
            runtime: Arc::clone(&self.runtime),
            resolver: self.resolver.clone(),
            finalizers: self.finalizers.clone(),
            write: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &MeshConfig {
        &self.cfg
    }

    pub fn resolver(&self) -> &CapabilityResolver {
        &self.resolver
    }

    pub fn manifest(&self) -> MeshResult<Manifest> {
        Manifest::open(self.cfg.manifest_path())
    }

    /// Runtime instance name of a stored resource.
    pub(crate) fn instance_name(resource: &Resource) -> String {
        if resource.is_kind(BROKER_KIND) {
            broker_instance_name(resource.name())
        } else {
            resource.name().to_string()
        }
    }

    /// Category of a stored record, tolerating kinds the schema does not know.
    pub(crate) fn category_of(&self, resource: &Resource) -> Option<Category> {
        if resource.is_kind(TRIGGER_KIND) {
            return Some(Category::Trigger);
        }
        if resource.is_kind(BROKER_KIND) {
            return Some(Category::Broker);
        }
        self.resolver.classify_resource(resource).ok().map(|c| c.category)
    }

    /// Every non-secret record with what the runtime reports about it.
    pub async fn status(&self) -> MeshResult<Vec<ComponentStatus>> {
        let manifest = self.manifest()?;
        let mut out = Vec::new();
        for r in manifest.objects().iter().filter(|r| !r.is_secret()) {
            let category = self.category_of(r);
            let runnable = category.map(|c| c.capabilities().runnable).unwrap_or(true);
            let (state, instance) = if runnable {
                let s = self.runtime.status(&Self::instance_name(r)).await?;
                let instance =
                    s.host_port.map(|p| RuntimeInstance { component: r.name().to_string(), host_port: p });
                (Some(s.state), instance)
            } else {
                (None, None)
            };
            out.push(ComponentStatus { name: r.name().to_string(), kind: r.kind.clone(), category, state, instance });
        }
        Ok(out)
    }

    /// Stop every instance of this context. Best-effort: failures become warnings.
    pub async fn stop_all(&self) -> MeshResult<StopReport> {
        let manifest = self.manifest()?;
        let mut report = StopReport::default();
        for r in manifest.objects().iter().filter(|r| !r.is_secret() && !r.is_kind(TRIGGER_KIND)) {
            let name = Self::instance_name(r);
            let action = match self.runtime.stop(&name).await {
                Ok(true) => Action::Stopped,
                Ok(false) => Action::Skipped { reason: "not running".into() },
                Err(e) => {
                    tracing::warn!(component = %name, error = %e, "stop failed");
                    report.warnings.push(e.to_string());
                    Action::Skipped { reason: "stop failed".into() }
                }
            };
            report.outcomes.push(Outcome { component: r.name().to_string(), action });
        }
        Ok(report)
    }
}

pub mod prelude {
    pub use super::{
        Action, BatchReport, ComponentRequest, ComponentStatus, DeleteReport, Outcome, ReconcileReport, Reconciler,
        StopReport,
    };
}
