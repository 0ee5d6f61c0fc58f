//! External cleanup hooks run before a component is removed.

use std::collections::BTreeMap;
use std::sync::Arc;

use emesh_core::{MeshError, MeshResult, Resource};
use rustc_hash::FxHashMap;

/// Prefix of the transport error some services return when the subscription is already gone.
pub const ALREADY_UNSUBSCRIBED: &str = "Unsubscribed from topic";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finalized {
    Done,
    /// Nothing left to clean up on the remote side.
    AlreadyGone,
}

/// Tears down whatever a component provisioned outside the host (subscriptions, webhooks...).
#[async_trait::async_trait]
pub trait Finalizer: Send + Sync {
    async fn finalize(&self, resource: &Resource, env: &BTreeMap<String, String>) -> MeshResult<Finalized>;
}

/// Map a raw transport error message to an outcome.
pub fn transport_outcome(message: &str, component: &str) -> MeshResult<Finalized> {
    if message.starts_with(ALREADY_UNSUBSCRIBED) {
        return Ok(Finalized::AlreadyGone);
    }
    Err(MeshError::RuntimeStop { component: component.to_string(), reason: message.to_string() })
}

/// Finalizers by lower-cased kind.
#[derive(Clone, Default)]
pub struct FinalizerRegistry {
    by_kind: FxHashMap<String, Arc<dyn Finalizer>>,
}

impl FinalizerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: &str, finalizer: Arc<dyn Finalizer>) {
        self.by_kind.insert(kind.to_lowercase(), finalizer);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn Finalizer>> {
        self.by_kind.get(&kind.to_lowercase()).cloned()
    }

    pub fn len(&self) -> usize {
        self.by_kind.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_kind.is_empty()
    }
}
