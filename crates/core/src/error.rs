//! Error taxonomy shared by every mesh crate.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub type MeshResult<T> = Result<T, MeshError>;

/// One failed task of a batch operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub component: String,
    pub error: String,
}

#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("store io at {}: {source}", .path.display())]
    StoreIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("store corrupt at {}: {reason}", .path.display())]
    StoreCorrupt { path: PathBuf, reason: String },

    #[error("unknown kind {kind:?}{}", .suggestion.as_ref().map(|s| format!(" (did you mean {:?}?)", s)).unwrap_or_default())]
    UnknownKind { kind: String, suggestion: Option<String> },

    #[error("unsupported API group in {api_version:?}")]
    UnsupportedGroup { api_version: String },

    #[error("invalid schema for {kind:?}: {reason}")]
    InvalidSchema { kind: String, reason: String },

    #[error("{component:?} does not expose its event types")]
    NoEventTypes { component: String },

    #[error("{component:?} is not an event producer")]
    NotAProducer { component: String },

    #[error("component {0:?} not found")]
    ComponentNotFound(String),

    #[error("secret {secret:?} (key {key:?}) not found")]
    SecretNotFound { secret: String, key: String },

    #[error("trigger {0:?} not found")]
    TriggerNotFound(String),

    #[error("starting {component:?}: {reason}")]
    RuntimeStart { component: String, reason: String },

    #[error("stopping {component:?}: {reason}")]
    RuntimeStop { component: String, reason: String },

    #[error("querying runtime for {component:?}: {reason}")]
    RuntimeQuery { component: String, reason: String },

    /// Runtime state and persisted state may disagree; re-running reconciliation is safe.
    #[error("partial reconcile of {component:?}, re-run to converge: {source}")]
    PartialReconcile {
        component: String,
        #[source]
        source: Box<MeshError>,
    },

    #[error("{} component(s) failed: {}", .failures.len(), .failures.iter().map(|f| format!("{} ({})", f.component, f.error)).collect::<Vec<_>>().join("; "))]
    AggregateTask { failures: Vec<TaskFailure> },

    #[error("invalid resource: {0}")]
    InvalidResource(String),

    #[error("lock {} held by another writer (waited {waited_ms}ms)", .path.display())]
    LockTimeout { path: PathBuf, waited_ms: u64 },

    #[error("serialization: {0}")]
    Serialize(String),

    #[error("config: {0}")]
    Config(String),
}

impl MeshError {
    pub fn store_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        MeshError::StoreIo { path: path.into(), source }
    }

    pub fn corrupt(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        MeshError::StoreCorrupt { path: path.into(), reason: reason.to_string() }
    }

    /// Whether re-running the whole operation is the expected recovery.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MeshError::PartialReconcile { .. }
                | MeshError::StoreIo { .. }
                | MeshError::LockTimeout { .. }
                | MeshError::AggregateTask { .. }
        )
    }

    /// Component names listed by an aggregate failure.
    pub fn failed_components(&self) -> Vec<&str> {
        match self {
            MeshError::AggregateTask { failures } => failures.iter().map(|f| f.component.as_str()).collect(),
            _ => Vec::new(),
        }
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(e: serde_json::Error) -> Self {
        MeshError::Serialize(e.to_string())
    }
}

impl From<serde_yaml::Error> for MeshError {
    fn from(e: serde_yaml::Error) -> Self {
        MeshError::Serialize(e.to_string())
    }
}
