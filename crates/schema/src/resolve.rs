//! Capability resolver: apiVersion/kind -> category, capability flags and declared event types.

use std::sync::Arc;

use emesh_core::{Capabilities, Category, MeshError, MeshResult, Resource, BROKER_KIND, TRIGGER_KIND};
use kube::core::GroupVersionKind;
use tracing::debug;

use crate::SchemaProvider;

#[derive(Debug, Clone)]
pub struct Classification {
    pub gvk: GroupVersionKind,
    pub category: Category,
    pub capabilities: Capabilities,
    /// Only filled for producers; may be empty.
    pub event_types: Vec<String>,
}

/// A user-typed kind expanded to what goes into a new resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedKind {
    pub api_version: String,
    pub kind: String,
    pub category: Category,
}

#[derive(Clone)]
pub struct CapabilityResolver {
    provider: Arc<dyn SchemaProvider>,
    domain: String,
}

fn split_api_version(api_version: &str, kind: &str) -> GroupVersionKind {
    match api_version.split_once('/') {
        Some((group, version)) => {
            GroupVersionKind { group: group.to_string(), version: version.to_string(), kind: kind.to_string() }
        }
        None => GroupVersionKind { group: String::new(), version: api_version.to_string(), kind: kind.to_string() },
    }
}

impl CapabilityResolver {
    pub fn new(provider: Arc<dyn SchemaProvider>, domain: impl Into<String>) -> Self {
        Self { provider, domain: domain.into() }
    }

    pub fn provider(&self) -> &Arc<dyn SchemaProvider> {
        &self.provider
    }

    /// Category implied by an API group alone. Eventing resources are split by kind later.
    fn component_category(&self, group: &str) -> Option<Category> {
        let prefix = group.strip_suffix(&self.domain)?.strip_suffix('.')?;
        match prefix {
            "sources" => Some(Category::Source),
            "targets" => Some(Category::Target),
            "flow" | "extensions" => Some(Category::Transformation),
            _ => None,
        }
    }

    fn is_eventing(&self, group: &str) -> bool {
        group.strip_suffix(&self.domain).and_then(|p| p.strip_suffix('.')) == Some("eventing")
    }

    pub fn classify(&self, api_version: &str, kind: &str) -> MeshResult<Classification> {
        let gvk = split_api_version(api_version, kind);
        if self.is_eventing(&gvk.group) {
            let category = if kind.eq_ignore_ascii_case(BROKER_KIND) {
                Category::Broker
            } else if kind.eq_ignore_ascii_case(TRIGGER_KIND) {
                Category::Trigger
            } else {
                return Err(MeshError::UnknownKind { kind: kind.to_string(), suggestion: None });
            };
            return Ok(Classification { gvk, category, capabilities: category.capabilities(), event_types: Vec::new() });
        }
        let category = self
            .component_category(&gvk.group)
            .ok_or_else(|| MeshError::UnsupportedGroup { api_version: api_version.to_string() })?;
        let crd = self.provider.resolve(kind)?;
        if crd.spec.group != gvk.group {
            return Err(MeshError::InvalidSchema {
                kind: kind.to_string(),
                reason: format!("declared in group {:?}, not {:?}", crd.spec.group, gvk.group),
            });
        }
        let capabilities = category.capabilities();
        let event_types = if capabilities.producer { crd.event_types()? } else { Vec::new() };
        debug!(kind = %kind, category = %category, types = event_types.len(), "classified");
        Ok(Classification { gvk, category, capabilities, event_types })
    }

    pub fn classify_resource(&self, resource: &Resource) -> MeshResult<Classification> {
        self.classify(&resource.api_version, &resource.kind)
    }

    /// Event types a consumer can subscribe to. Zero types is an error here.
    pub fn producer_event_types(&self, resource: &Resource) -> MeshResult<Vec<String>> {
        let c = self.classify_resource(resource)?;
        if !c.capabilities.producer {
            return Err(MeshError::NotAProducer { component: resource.name().to_string() });
        }
        if c.event_types.is_empty() {
            return Err(MeshError::NoEventTypes { component: resource.name().to_string() });
        }
        Ok(c.event_types)
    }

    /// Expand a kind as typed on the command line (`http` + hint `target`, or `httptarget`).
    pub fn resolve_kind(&self, kind: &str, hint: Option<Category>) -> MeshResult<ResolvedKind> {
        let lower = kind.to_lowercase();
        let mut candidates = Vec::with_capacity(2);
        if let Some(h) = hint {
            if !lower.ends_with(h.as_str()) {
                candidates.push(format!("{}{}", lower, h.as_str()));
            }
        }
        candidates.push(lower);
        let mut first_err = None;
        for candidate in &candidates {
            match self.provider.resolve(candidate) {
                Ok(crd) => {
                    let category = self
                        .component_category(&crd.spec.group)
                        .ok_or_else(|| MeshError::UnsupportedGroup { api_version: crd.spec.group.clone() })?;
                    if let Some(h) = hint {
                        if h != category {
                            return Err(MeshError::InvalidResource(format!(
                                "{} is a {}, not a {}",
                                crd.spec.names.kind, category, h
                            )));
                        }
                    }
                    let version = crd.served_version().ok_or_else(|| MeshError::InvalidSchema {
                        kind: crd.spec.names.kind.clone(),
                        reason: "no versions declared".into(),
                    })?;
                    return Ok(ResolvedKind {
                        api_version: format!("{}/{}", crd.spec.group, version),
                        kind: crd.spec.names.kind.clone(),
                        category,
                    });
                }
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        Err(first_err.unwrap_or(MeshError::UnknownKind { kind: kind.to_string(), suggestion: None }))
    }

    /// Kinds available for a component category, lower-cased with the category suffix trimmed.
    pub fn list_kinds(&self, category: Category) -> Vec<String> {
        let suffix = category.as_str();
        let mut out: Vec<String> = self
            .provider
            .kinds()
            .into_iter()
            .filter(|k| {
                self.provider
                    .resolve(k)
                    .map(|crd| self.component_category(&crd.spec.group) == Some(category))
                    .unwrap_or(false)
            })
            .map(|k| match k.strip_suffix(suffix) {
                Some(short) if !short.is_empty() => short.to_string(),
                _ => k,
            })
            .collect();
        out.sort();
        out.dedup();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fixtures, SchemaCache};

    fn resolver() -> CapabilityResolver {
        let cache = SchemaCache::from_yaml("v1", fixtures::BUNDLE).unwrap();
        CapabilityResolver::new(Arc::new(cache), "triggermesh.io")
    }

    #[test]
    fn categories_follow_group() {
        let r = resolver();
        let c = r.classify("sources.triggermesh.io/v1alpha1", "PingSource").unwrap();
        assert_eq!(c.category, Category::Source);
        assert_eq!(c.gvk.version, "v1alpha1");
        assert_eq!(c.event_types, vec!["dev.knative.sources.ping"]);

        let c = r.classify("targets.triggermesh.io/v1alpha1", "HTTPTarget").unwrap();
        assert_eq!(c.category, Category::Target);
        assert!(c.capabilities.consumer && !c.capabilities.producer);

        let c = r.classify("flow.triggermesh.io/v1alpha1", "Transformation").unwrap();
        assert!(c.capabilities.producer && c.capabilities.consumer);

        let c = r.classify("eventing.triggermesh.io/v1alpha1", "Broker").unwrap();
        assert_eq!(c.category, Category::Broker);
        let c = r.classify("eventing.triggermesh.io/v1alpha1", "Trigger").unwrap();
        assert!(!c.capabilities.runnable);
    }

    #[test]
    fn unknown_group_and_kind() {
        let r = resolver();
        assert!(matches!(r.classify("example.com/v1", "Widget"), Err(MeshError::UnsupportedGroup { .. })));
        assert!(matches!(r.classify("v1", "ConfigMap"), Err(MeshError::UnsupportedGroup { .. })));
        assert!(matches!(
            r.classify("sources.triggermesh.io/v1alpha1", "KafkaSource"),
            Err(MeshError::UnknownKind { .. })
        ));
    }

    #[test]
    fn producer_types_required_when_asked() {
        let r = resolver();
        let webhook = Resource::new("sources.triggermesh.io/v1alpha1", "WebhookSource", "hook");
        assert!(matches!(r.producer_event_types(&webhook), Err(MeshError::NoEventTypes { .. })));
        let sink = Resource::new("targets.triggermesh.io/v1alpha1", "HTTPTarget", "sink");
        assert!(matches!(r.producer_event_types(&sink), Err(MeshError::NotAProducer { .. })));
        let ping = Resource::new("sources.triggermesh.io/v1alpha1", "PingSource", "ping");
        assert_eq!(r.producer_event_types(&ping).unwrap().len(), 1);
    }

    #[test]
    fn resolves_short_kind_with_hint() {
        let r = resolver();
        let k = r.resolve_kind("http", Some(Category::Target)).unwrap();
        assert_eq!(k.api_version, "targets.triggermesh.io/v1alpha1");
        assert_eq!(k.kind, "HTTPTarget");
        let k = r.resolve_kind("PingSource", None).unwrap();
        assert_eq!(k.category, Category::Source);
        assert!(matches!(r.resolve_kind("ping", Some(Category::Target)), Err(MeshError::UnknownKind { .. })));
        assert!(matches!(r.resolve_kind("pingsource", Some(Category::Target)), Err(MeshError::InvalidResource(_))));
    }

    #[test]
    fn lists_trimmed_kinds_per_category() {
        let r = resolver();
        assert_eq!(r.list_kinds(Category::Source), vec!["ping", "webhook"]);
        assert_eq!(r.list_kinds(Category::Target), vec!["http"]);
        assert_eq!(r.list_kinds(Category::Transformation), vec!["transformation"]);
    }
}
