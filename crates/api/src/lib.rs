//! Event mesh public API façade (in-process).
//!
//! Frontends depend on the `MeshApi` trait and the transport-friendly types here.
//! `InProcApi` drives the orchestrator directly; `MockApi` serves canned answers for tests.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use emesh_core::{DeliveryOptions, MeshError};

mod inproc;
mod mock;

pub use emesh_apply::{
    Action, BatchReport, ComponentRequest, ComponentStatus, DeleteReport, Outcome, ReconcileReport, StopReport,
};
pub use emesh_core::{Category, Resource, Trigger};
pub use inproc::InProcApi;
pub use mock::MockApi;

/// A broker and whether it is the context commands currently act on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BrokerInfo {
    pub name: String,
    pub active: bool,
}

/// Manual trigger edit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerRequest {
    pub name: String,
    /// Replaces the filter; `None` routes every event type.
    pub event_type: Option<String>,
    /// Running consumer to add to the fan-out.
    pub target: Option<String>,
    #[serde(default)]
    pub delivery: DeliveryOptions,
}

/// API errors suitable for transport.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum ApiError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("runtime: {0}")]
    Runtime(String),
    /// Some work was done; running the same command again converges.
    #[error("partial: {0}")]
    Partial(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::Partial(_) | ApiError::Conflict(_))
    }
}

impl From<MeshError> for ApiError {
    fn from(e: MeshError) -> Self {
        let msg = e.to_string();
        match e {
            MeshError::UnknownKind { .. }
            | MeshError::UnsupportedGroup { .. }
            | MeshError::InvalidSchema { .. }
            | MeshError::NoEventTypes { .. }
            | MeshError::NotAProducer { .. }
            | MeshError::InvalidResource(_)
            | MeshError::Config(_) => ApiError::Validation(msg),
            MeshError::ComponentNotFound(_) | MeshError::SecretNotFound { .. } | MeshError::TriggerNotFound(_) => {
                ApiError::NotFound(msg)
            }
            MeshError::LockTimeout { .. } => ApiError::Conflict(msg),
            MeshError::RuntimeStart { .. } | MeshError::RuntimeStop { .. } | MeshError::RuntimeQuery { .. } => {
                ApiError::Runtime(msg)
            }
            MeshError::PartialReconcile { .. } | MeshError::AggregateTask { .. } => ApiError::Partial(msg),
            MeshError::StoreIo { .. } | MeshError::StoreCorrupt { .. } | MeshError::Serialize(_) => {
                ApiError::Internal(msg)
            }
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Declarative event mesh API surface. Every call acts on the active broker unless it names one.
#[async_trait::async_trait]
pub trait MeshApi: Send + Sync {
    /// Store and start broker `name`, and make it the active context.
    async fn create_broker(&self, name: &str) -> ApiResult<ReconcileReport>;

    async fn list_brokers(&self) -> ApiResult<Vec<BrokerInfo>>;

    /// Make an existing broker the active context.
    async fn use_broker(&self, name: &str) -> ApiResult<()>;

    /// Remove a broker with everything in its context.
    async fn delete_broker(&self, name: &str) -> ApiResult<DeleteReport>;

    /// Create or update one component and route its subscriptions.
    async fn reconcile(&self, req: ComponentRequest) -> ApiResult<ReconcileReport>;

    /// Bring every stored component up; per-component failures are in the report.
    async fn start(&self) -> ApiResult<BatchReport>;

    async fn stop(&self) -> ApiResult<StopReport>;

    async fn delete(&self, names: &[String]) -> ApiResult<DeleteReport>;

    async fn upsert_trigger(&self, req: TriggerRequest) -> ApiResult<Trigger>;

    async fn remove_trigger(&self, name: &str) -> ApiResult<bool>;

    async fn lookup_trigger(&self, name: &str) -> ApiResult<Trigger>;

    async fn status(&self) -> ApiResult<Vec<ComponentStatus>>;

    /// Stored records of the active context, in manifest order.
    async fn manifest(&self) -> ApiResult<Vec<Resource>>;

    /// Short kind names available for a category.
    async fn list_kinds(&self, category: Category) -> ApiResult<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mesh_errors_map_to_transport_classes() {
        let e: ApiError = MeshError::ComponentNotFound("x".into()).into();
        assert!(matches!(e, ApiError::NotFound(_)));
        let e: ApiError = MeshError::UnknownKind { kind: "kafka".into(), suggestion: Some("ping".into()) }.into();
        assert_eq!(e, ApiError::Validation("unknown kind \"kafka\" (did you mean \"ping\"?)".into()));
        let e: ApiError =
            MeshError::PartialReconcile { component: "a".into(), source: Box::new(MeshError::Config("c".into())) }
                .into();
        assert!(e.is_retryable());
        let e: ApiError = MeshError::RuntimeStart { component: "a".into(), reason: "r".into() }.into();
        assert!(!e.is_retryable());
    }
}
