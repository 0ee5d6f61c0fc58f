use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use emesh_broker::{broker_resource, target_url, trigger_name, trigger_resource, RoutingTable, CONFIG_MOUNT_PATH};
use emesh_core::{
    broker_instance_name, validate_name, Category, DeliveryOptions, Filter, MeshError, MeshResult, Resource,
    RuntimeInstance, Target, TaskFailure, Trigger, BROKER_KIND, CONTEXT_LABEL, SECRETS_HASH_ANNOTATION, TRIGGER_KIND,
};
use emesh_runtime::{adapter_image, ContainerSpec, InstanceState, INSTANCE_LABEL};
use emesh_secrets::REF_FIELD;
use emesh_store::diff_summary;
use futures::future::join_all;
use metrics::{counter, histogram};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{Action, BatchReport, ComponentRequest, ReconcileReport, Reconciler};

/// Environment variable pointing producers at the broker.
pub const SINK_ENV: &str = "K_SINK";

/// Everything decided before the first write.
struct Plan {
    desired: Resource,
    category: Category,
    /// `<name>-secret` to stage with the component.
    secret: Option<Resource>,
    consumes: Vec<String>,
    event_types: Vec<String>,
    delivery: DeliveryOptions,
}

impl Plan {
    fn stored(desired: Resource, category: Category) -> Self {
        Self {
            desired,
            category,
            secret: None,
            consumes: Vec::new(),
            event_types: Vec::new(),
            delivery: DeliveryOptions::default(),
        }
    }
}

fn push_unique(out: &mut Vec<String>, v: String) {
    if !out.contains(&v) {
        out.push(v);
    }
}

fn partial(component: &str, e: MeshError) -> MeshError {
    match e {
        MeshError::PartialReconcile { .. } => e,
        other => MeshError::PartialReconcile { component: component.to_string(), source: Box::new(other) },
    }
}

/// Scalar spec leaves as adapter environment; secret references are left to the secret resolver.
fn spec_env(spec: &Value) -> BTreeMap<String, String> {
    fn walk(v: &Value, path: &mut Vec<String>, out: &mut BTreeMap<String, String>) {
        match v {
            Value::Object(map) => {
                if map.contains_key(REF_FIELD) {
                    return;
                }
                for (k, child) in map {
                    path.push(k.clone());
                    walk(child, path, out);
                    path.pop();
                }
            }
            Value::Array(items) => {
                for (i, child) in items.iter().enumerate() {
                    path.push(i.to_string());
                    walk(child, path, out);
                    path.pop();
                }
            }
            Value::Null => {}
            Value::String(s) if !path.is_empty() => {
                out.insert(emesh_secrets::env_name(path), s.clone());
            }
            other if !path.is_empty() => {
                out.insert(emesh_secrets::env_name(path), other.to_string());
            }
            _ => {}
        }
    }
    let mut out = BTreeMap::new();
    walk(spec, &mut Vec::new(), &mut out);
    out
}

impl Reconciler {
    /// Make the runtime and the routing table match the declared component.
    pub async fn reconcile(&self, req: ComponentRequest) -> MeshResult<ReconcileReport> {
        let started = Instant::now();
        let name = req.name.clone();
        let res = match self.plan(req) {
            Ok(plan) => self.run_plan(plan).await,
            Err(e) => Err(e),
        };
        observe(&name, started, &res);
        res
    }

    /// Store and start this context's broker.
    pub async fn ensure_broker(&self) -> MeshResult<ReconcileReport> {
        let started = Instant::now();
        let res = self.run_plan(Plan::stored(broker_resource(&self.cfg.context), Category::Broker)).await;
        observe(&self.cfg.context, started, &res);
        res
    }

    /// Reconcile a record already in the store, as `start` does for each entry.
    pub async fn reconcile_stored(&self, resource: Resource) -> MeshResult<ReconcileReport> {
        let started = Instant::now();
        let name = resource.name().to_string();
        let res = match self.category_for_stored(&resource) {
            Ok(category) => self.run_plan(Plan::stored(resource, category)).await,
            Err(e) => Err(e),
        };
        observe(&name, started, &res);
        res
    }

    fn category_for_stored(&self, resource: &Resource) -> MeshResult<Category> {
        if resource.is_kind(BROKER_KIND) {
            return Ok(Category::Broker);
        }
        let c = self.resolver.classify_resource(resource)?;
        if c.category == Category::Trigger {
            return Err(MeshError::InvalidResource(format!("{} is a trigger record", resource.name())));
        }
        Ok(c.category)
    }

    /// Reconcile every stored component: brokers first, then the rest concurrently.
    /// One failure never stops the others; failures are returned alongside the successes.
    pub async fn reconcile_all(self: &Arc<Self>) -> MeshResult<BatchReport> {
        let manifest = self.manifest()?;
        let (brokers, rest): (Vec<Resource>, Vec<Resource>) = manifest
            .objects()
            .iter()
            .filter(|r| !r.is_secret() && !r.is_kind(TRIGGER_KIND))
            .cloned()
            .partition(|r| r.is_kind(BROKER_KIND));

        let mut report = BatchReport::default();
        for b in brokers {
            let name = b.name().to_string();
            match self.reconcile_stored(b).await {
                Ok(r) => report.reports.push(r),
                Err(e) => report.failures.push(TaskFailure { component: name, error: e.to_string() }),
            }
        }

        let handles: Vec<_> = rest
            .iter()
            .cloned()
            .map(|r| {
                let this = Arc::clone(self);
                tokio::spawn(async move { this.reconcile_stored(r).await })
            })
            .collect();
        let mut slots: Vec<Option<Result<ReconcileReport, TaskFailure>>> = (0..handles.len()).map(|_| None).collect();
        for (i, joined) in join_all(handles).await.into_iter().enumerate() {
            let component = rest[i].name().to_string();
            slots[i] = Some(match joined {
                Ok(Ok(r)) => Ok(r),
                Ok(Err(e)) => Err(TaskFailure { component, error: e.to_string() }),
                Err(e) => Err(TaskFailure { component, error: format!("task aborted: {}", e) }),
            });
        }
        for slot in slots.into_iter().flatten() {
            match slot {
                Ok(r) => report.reports.push(r),
                Err(f) => report.failures.push(f),
            }
        }
        info!(ok = report.reports.len(), failed = report.failures.len(), "reconcile all done");
        Ok(report)
    }

    fn plan(&self, req: ComponentRequest) -> MeshResult<Plan> {
        validate_name(&req.name)?;
        req.delivery.validate()?;
        let (api_version, kind) = match req.api_version {
            Some(v) => (v, req.kind.clone()),
            None => {
                let k = self.resolver.resolve_kind(&req.kind, req.category)?;
                (k.api_version, k.kind)
            }
        };
        let class = self.resolver.classify(&api_version, &kind)?;
        if matches!(class.category, Category::Broker | Category::Trigger) {
            return Err(MeshError::InvalidResource(format!("{} resources are not reconciled as components", kind)));
        }
        if (!req.consumes.is_empty() || !req.event_types.is_empty()) && !class.capabilities.consumer {
            return Err(MeshError::InvalidResource(format!(
                "{} is a {} and cannot consume events",
                req.name, class.category
            )));
        }
        let mut spec = if req.spec.is_null() { Value::Object(Default::default()) } else { req.spec };
        let secret = emesh_secrets::bind(&req.name, &self.cfg.context, &mut spec, &req.secrets)?;
        let desired =
            Resource::new(api_version, kind, &req.name).with_label(CONTEXT_LABEL, &self.cfg.context).with_spec(spec);
        Ok(Plan {
            desired,
            category: class.category,
            secret,
            consumes: req.consumes,
            event_types: req.event_types,
            delivery: req.delivery,
        })
    }

    async fn run_plan(&self, plan: Plan) -> MeshResult<ReconcileReport> {
        let Plan { mut desired, category, secret, consumes, event_types, delivery } = plan;
        let name = desired.name().to_string();

        // Phase 1: decide and persist the record. Nothing is written unless every lookup succeeds.
        let guard = self.write.lock().await;
        let mut manifest = self.manifest()?;
        let mut filters = Vec::new();
        for p in &consumes {
            let producer = manifest.get(p).ok_or_else(|| MeshError::ComponentNotFound(p.clone()))?;
            for t in self.resolver.producer_event_types(producer)? {
                push_unique(&mut filters, t);
            }
        }
        for t in event_types {
            push_unique(&mut filters, t);
        }

        let prev = manifest.get(&name).cloned();
        if let Some(p) = &prev {
            let protected = p.is_secret() || p.is_kind(BROKER_KIND) || p.is_kind(TRIGGER_KIND);
            if protected && !p.is_kind(&desired.kind) {
                return Err(MeshError::InvalidResource(format!("name {:?} is already used by a {}", name, p.kind)));
            }
        }
        let mut dirty = false;
        if let Some(s) = secret {
            dirty |= manifest.upsert(s)?;
        }
        let refs = emesh_secrets::extract_refs(&desired.spec);
        let env = emesh_secrets::resolve(&refs, manifest.objects())?;
        let prev_hash = prev.as_ref().and_then(|p| p.annotation(SECRETS_HASH_ANNOTATION));
        let secrets_changed = emesh_secrets::changed(prev_hash, &env);
        let hash = (!env.is_empty()).then(|| emesh_secrets::hash(&env));
        desired.set_annotation(SECRETS_HASH_ANNOTATION, hash.as_deref());

        let spec_changed = match &prev {
            None => true,
            Some(p) => p.spec != desired.spec || p.api_version != desired.api_version || !p.is_kind(&desired.kind),
        };
        let diff = diff_summary(&desired.spec, prev.as_ref().map(|p| &p.spec).unwrap_or(&Value::Null));
        dirty |= manifest.upsert(desired.clone())?;
        if dirty {
            manifest.write()?;
            debug!(component = %name, adds = diff.adds, updates = diff.updates, removes = diff.removes, "manifest updated");
        }
        if category == Category::Broker {
            let path = self.cfg.broker_config_path();
            if !path.exists() {
                RoutingTable::default().save(&path)?;
            }
        }
        drop(guard);

        // Phase 2: the instance. Replace in place: stop before start, never side by side.
        // What the instance reports it runs decides, so an interrupted replacement is redone on retry.
        let mut warnings = Vec::new();
        let instance_name = Self::instance_name(&desired);
        let spec = self.container_spec(&desired, category, env, &mut warnings).await?;
        let fingerprint = spec.fingerprint();
        let status = self.runtime.status(&instance_name).await?;
        let stale = status.fingerprint.as_deref() != Some(fingerprint.as_str());
        let (action, host_port) = match (status.is_running(), status.host_port) {
            (true, Some(port)) if !spec_changed && !secrets_changed && !stale => {
                debug!(component = %name, "instance up to date");
                (Action::Unchanged, port)
            }
            _ => {
                if status.state != InstanceState::Absent {
                    self.runtime.stop(&instance_name).await?;
                }
                let port = self.runtime.start(&spec).await?;
                counter!("reconcile_restart_total", 1u64);
                info!(
                    component = %name,
                    kind = %desired.kind,
                    port,
                    spec_changed,
                    secrets_changed,
                    stale,
                    "instance started"
                );
                (if prev.is_none() { Action::Created } else { Action::Restarted }, port)
            }
        };

        // Phase 3: routes. Failures here leave a running instance behind a stale table.
        let mut triggers = Vec::new();
        if category.capabilities().consumer {
            let url = target_url(&self.cfg.adapter_host, host_port);
            triggers = self.wire(&name, &url, &filters, &delivery).await.map_err(|e| partial(&name, e))?;
        }

        Ok(ReconcileReport {
            component: name.clone(),
            kind: desired.kind.clone(),
            action,
            instance: Some(RuntimeInstance { component: name, host_port }),
            diff,
            triggers,
            warnings,
        })
    }

    async fn container_spec(
        &self,
        desired: &Resource,
        category: Category,
        secrets_env: BTreeMap<String, String>,
        warnings: &mut Vec<String>,
    ) -> MeshResult<ContainerSpec> {
        let mut spec = match category {
            Category::Broker => ContainerSpec::new(
                broker_instance_name(desired.name()),
                &self.cfg.broker_image,
                self.cfg.adapter_port,
            )
            .with_mount(self.cfg.broker_config_path(), CONFIG_MOUNT_PATH, true),
            _ => ContainerSpec::new(
                desired.name(),
                adapter_image(&self.cfg.registry, &desired.kind, &self.cfg.version),
                self.cfg.adapter_port,
            )
            .with_env(spec_env(&desired.spec)),
        };
        spec = spec.with_env(secrets_env).with_label(INSTANCE_LABEL, &self.cfg.context);
        if category.capabilities().producer {
            let broker = broker_instance_name(&self.cfg.context);
            let status = self.runtime.status(&broker).await?;
            match status.host_port.filter(|_| status.is_running()) {
                Some(port) => {
                    spec.env.insert(SINK_ENV.to_string(), target_url(&self.cfg.adapter_host, port));
                }
                None => {
                    let msg = format!("broker {:?} is not running; events from {:?} are dropped", broker, desired.name());
                    warn!(component = %desired.name(), broker = %broker, "no running broker to sink into");
                    warnings.push(msg);
                }
            }
        }
        Ok(spec)
    }

    /// Subscribe `component` at `url` to `filters` and re-point its existing targets at `url`.
    /// The routing table is saved first; if mirroring it into the manifest fails the table is restored.
    async fn wire(
        &self,
        component: &str,
        url: &str,
        filters: &[String],
        delivery: &DeliveryOptions,
    ) -> MeshResult<Vec<String>> {
        let _guard = self.write.lock().await;
        let path = self.cfg.broker_config_path();
        let mut table = RoutingTable::load(&path)?;
        let before = table.clone();
        for t in filters {
            let name = trigger_name(&self.cfg.context, Some(t));
            let target = Target::new(url, component).with_delivery(delivery.clone());
            table.upsert_trigger(&name, Some(Filter::exact(t.clone())), Some(target));
        }
        let moved = table.retarget(component, url);
        let touched: Vec<Trigger> = table.list_for_target(component).into_iter().cloned().collect();
        let names: Vec<String> = touched.iter().map(|t| t.name.clone()).collect();
        if table == before {
            return Ok(names);
        }

        table.save(&path)?;
        if let Err(e) = self.mirror_triggers(&touched) {
            if let Err(rollback) = before.save(&path) {
                warn!(component = %component, error = %rollback, "routing table rollback failed");
            }
            return Err(e);
        }
        info!(component = %component, triggers = names.len(), retargeted = moved, "routes updated");
        Ok(names)
    }

    fn mirror_triggers(&self, triggers: &[Trigger]) -> MeshResult<()> {
        let mut manifest = self.manifest()?;
        for t in triggers {
            manifest.upsert(trigger_resource(t, &self.cfg.context)?)?;
        }
        manifest.write()
    }
}

fn observe(component: &str, started: Instant, res: &MeshResult<ReconcileReport>) {
    counter!("reconcile_total", 1u64);
    histogram!("reconcile_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
    if let Err(e) = res {
        counter!("reconcile_err_total", 1u64);
        warn!(component = %component, error = %e, "reconcile failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_env_flattens_scalars_and_skips_refs() {
        let spec = serde_json::json!({
            "endpoint": "http://x",
            "retries": 3,
            "auth": { "token": { "valueFromSecret": { "name": "s", "key": "k" } } },
            "hosts": ["a", "b"],
            "empty": null
        });
        let env = spec_env(&spec);
        assert_eq!(env["ENDPOINT"], "http://x");
        assert_eq!(env["RETRIES"], "3");
        assert_eq!(env["HOSTS_1"], "b");
        assert!(!env.keys().any(|k| k.starts_with("AUTH")));
        assert!(!env.contains_key("EMPTY"));
    }

    #[test]
    fn partial_wraps_once() {
        let e = partial("a", MeshError::Config("x".into()));
        let e = partial("a", e);
        match e {
            MeshError::PartialReconcile { source, .. } => assert!(matches!(*source, MeshError::Config(_))),
            other => panic!("unexpected {other:?}"),
        }
    }
}
