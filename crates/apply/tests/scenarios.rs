use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use emesh_apply::{transport_outcome, Action, ComponentRequest, Finalized, Finalizer, FinalizerRegistry, Reconciler};
use emesh_core::{Category, MeshConfig, MeshError, MeshResult, Resource, SECRETS_HASH_ANNOTATION, TRIGGER_KIND};
use emesh_runtime::{ContainerRuntime, ContainerSpec, InstanceState, InstanceStatus, MemoryRuntime};
use emesh_schema::SchemaCache;
use emesh_store::Manifest;
use tempfile::TempDir;

const BUNDLE: &str = r#"
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: pingsources.sources.triggermesh.io
  annotations:
    registry.knative.dev/eventTypes: '[{"type":"dev.knative.sources.ping"}]'
spec:
  group: sources.triggermesh.io
  names:
    kind: PingSource
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
    storage: true
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
"#;

const PING_TYPE: &str = "dev.knative.sources.ping";
const PING_TRIGGER: &str = "local-trigger-dev-knative-sources-ping";

struct Harness {
    _dir: TempDir,
    cfg: MeshConfig,
    rt: Arc<MemoryRuntime>,
    rec: Arc<Reconciler>,
}

fn build(
    finalizers: FinalizerRegistry,
    wrap: impl FnOnce(Arc<MemoryRuntime>) -> Arc<dyn ContainerRuntime>,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let cfg = MeshConfig::with_home(dir.path()).with_context("local");
    let rt = Arc::new(MemoryRuntime::new());
    let schema = Arc::new(SchemaCache::from_yaml("v1", BUNDLE).unwrap());
    let rec = Arc::new(Reconciler::new(cfg.clone(), wrap(rt.clone()), schema).with_finalizers(finalizers));
    Harness { _dir: dir, cfg, rt, rec }
}

fn harness_with(finalizers: FinalizerRegistry) -> Harness {
    build(finalizers, |rt| rt as Arc<dyn ContainerRuntime>)
}

fn harness() -> Harness {
    harness_with(FinalizerRegistry::new())
}

fn target(name: &str) -> ComponentRequest {
    ComponentRequest::new(name, "http")
        .with_category(Category::Target)
        .with_spec(serde_json::json!({ "endpoint": "https://example.com" }))
}

fn ping(name: &str) -> ComponentRequest {
    ComponentRequest::new(name, "PingSource").with_spec(serde_json::json!({ "schedule": "*/1 * * * *" }))
}

impl Harness {
    fn manifest(&self) -> Manifest {
        Manifest::open(self.cfg.manifest_path()).unwrap()
    }

    fn count(&self, name: &str) -> usize {
        self.manifest().objects().iter().filter(|o| o.name() == name).count()
    }

    async fn url_of(&self, name: &str) -> String {
        let port = self.rt.status(name).await.unwrap().host_port.unwrap();
        format!("http://{}:{}", self.cfg.adapter_host, port)
    }
}

#[tokio::test]
async fn unchanged_component_is_not_restarted() {
    let h = harness();
    let first = h.rec.reconcile(target("sink")).await.unwrap();
    assert_eq!(first.action, Action::Created);
    let second = h.rec.reconcile(target("sink")).await.unwrap();
    assert_eq!(second.action, Action::Unchanged);
    assert!(second.diff.is_empty());
    assert_eq!(second.instance, first.instance);
    assert_eq!(h.rt.starts("sink"), 1);
    assert_eq!(h.count("sink"), 1);
}

#[tokio::test]
async fn single_spec_change_restarts_exactly_once() {
    let h = harness();
    h.rec.reconcile(target("sink")).await.unwrap();
    let changed = target("sink").with_spec(serde_json::json!({ "endpoint": "https://example.org" }));
    let report = h.rec.reconcile(changed.clone()).await.unwrap();
    assert_eq!(report.action, Action::Restarted);
    assert_eq!(report.diff.updates, 1);
    assert_eq!((h.rt.starts("sink"), h.rt.stops("sink")), (2, 1));
    assert_eq!(h.rec.reconcile(changed).await.unwrap().action, Action::Unchanged);
    assert_eq!(h.rt.starts("sink"), 2);
}

#[tokio::test]
async fn single_secret_change_restarts_exactly_once() {
    let h = harness();
    let created = h.rec.reconcile(target("sink").with_secret("auth.token", "a")).await.unwrap();
    assert_eq!(created.action, Action::Created);
    let env = h.rt.spec_of("sink").unwrap().env;
    assert_eq!(env.get("AUTH_TOKEN").map(String::as_str), Some("a"));
    assert_eq!(env.get("ENDPOINT").map(String::as_str), Some("https://example.com"));

    let m = h.manifest();
    assert!(m.get("sink-secret").unwrap().is_secret());
    assert!(m.get("sink").unwrap().annotation(SECRETS_HASH_ANNOTATION).is_some());

    let same = h.rec.reconcile(target("sink").with_secret("auth.token", "a")).await.unwrap();
    assert_eq!(same.action, Action::Unchanged);
    let rotated = h.rec.reconcile(target("sink").with_secret("auth.token", "b")).await.unwrap();
    assert_eq!(rotated.action, Action::Restarted);
    assert_eq!(h.rt.starts("sink"), 2);
    assert_eq!(h.rt.spec_of("sink").unwrap().env["AUTH_TOKEN"], "b");
}

#[tokio::test]
async fn interrupted_replacement_is_redone_on_retry() {
    let h = harness();
    h.rec.reconcile(target("sink")).await.unwrap();
    let changed = target("sink").with_spec(serde_json::json!({ "endpoint": "https://example.org" }));

    h.rt.fail_stop_for("sink");
    let err = h.rec.reconcile(changed.clone()).await.unwrap_err();
    assert!(matches!(err, MeshError::RuntimeStop { .. }), "{err:?}");
    assert_eq!(h.rt.spec_of("sink").unwrap().env["ENDPOINT"], "https://example.com");

    h.rt.clear_failures();
    let retry = h.rec.reconcile(changed.clone()).await.unwrap();
    assert_eq!(retry.action, Action::Restarted);
    assert_eq!(h.rt.spec_of("sink").unwrap().env["ENDPOINT"], "https://example.org");
    assert_eq!(h.rec.reconcile(changed).await.unwrap().action, Action::Unchanged);
    assert_eq!(h.rt.starts("sink"), 2);
}

#[tokio::test]
async fn crashed_instance_is_started_again() {
    let h = harness();
    h.rec.reconcile(target("sink")).await.unwrap();
    h.rt.kill("sink");
    let report = h.rec.reconcile(target("sink")).await.unwrap();
    assert_eq!(report.action, Action::Restarted);
    assert!(h.rt.is_running("sink"));
}

#[tokio::test]
async fn missing_secret_aborts_before_any_write() {
    let h = harness();
    let req = target("sink").with_spec(serde_json::json!({
        "token": { "valueFromSecret": { "name": "nope", "key": "k" } }
    }));
    let err = h.rec.reconcile(req).await.unwrap_err();
    assert!(matches!(err, MeshError::SecretNotFound { .. }), "{err:?}");
    assert!(!h.cfg.manifest_path().exists());
    assert_eq!(h.rt.total_starts(), 0);
}

#[tokio::test]
async fn schema_failures_abort_before_any_write() {
    let h = harness();
    let err = h.rec.reconcile(ComponentRequest::new("x", "kafka").with_category(Category::Source)).await.unwrap_err();
    assert!(matches!(err, MeshError::UnknownKind { .. }));
    let mut bad = ComponentRequest::new("y", "Widget");
    bad.api_version = Some("example.com/v1".into());
    assert!(matches!(h.rec.reconcile(bad).await, Err(MeshError::UnsupportedGroup { .. })));
    assert!(!h.cfg.manifest_path().exists());
}

#[tokio::test]
async fn consumer_of_typeless_producer_is_rejected() {
    let h = harness();
    h.rec.reconcile(ComponentRequest::new("hook", "webhook").with_category(Category::Source)).await.unwrap();
    let err = h.rec.reconcile(target("sink").consuming("hook")).await.unwrap_err();
    assert!(matches!(err, MeshError::NoEventTypes { .. }));
    assert!(!h.manifest().contains("sink"));

    let err = h.rec.reconcile(target("sink").consuming("ghost")).await.unwrap_err();
    assert!(matches!(err, MeshError::ComponentNotFound(_)));

    let err = h.rec.reconcile(ping("p").with_event_type("x")).await.unwrap_err();
    assert!(matches!(err, MeshError::InvalidResource(_)));
}

#[tokio::test]
async fn consumer_gets_trigger_for_producer_types() {
    let h = harness();
    h.rec.ensure_broker().await.unwrap();
    let source = h.rec.reconcile(ping("source-a")).await.unwrap();
    assert!(source.warnings.is_empty(), "{:?}", source.warnings);
    let sink_env = h.rt.spec_of("source-a").unwrap().env;
    assert_eq!(sink_env["K_SINK"], h.url_of("local-broker").await);

    let report = h.rec.reconcile(target("target-b").consuming("source-a")).await.unwrap();
    assert_eq!(report.triggers, vec![PING_TRIGGER.to_string()]);

    let trigger = h.rec.lookup_trigger(PING_TRIGGER).unwrap();
    assert_eq!(trigger.event_type(), Some(PING_TYPE));
    assert_eq!(trigger.targets.len(), 1);
    assert_eq!(trigger.targets[0].url, h.url_of("target-b").await);
    assert_eq!(trigger.targets[0].component_ref, "target-b");

    assert_eq!(h.count("target-b"), 1);
    let mirror = h.manifest().get(PING_TRIGGER).cloned().unwrap();
    assert_eq!(mirror.kind, TRIGGER_KIND);

    // Re-running is idempotent: no second target for the same URL.
    h.rec.reconcile(target("target-b").consuming("source-a")).await.unwrap();
    assert_eq!(h.rec.lookup_trigger(PING_TRIGGER).unwrap().targets.len(), 1);
    assert_eq!(h.count("target-b"), 1);
    assert_eq!(h.count(PING_TRIGGER), 1);
}

#[tokio::test]
async fn producer_without_broker_warns() {
    let h = harness();
    let report = h.rec.reconcile(ping("lonely")).await.unwrap();
    assert_eq!(report.warnings.len(), 1);
    assert!(!h.rt.spec_of("lonely").unwrap().env.contains_key("K_SINK"));
}

#[tokio::test]
async fn fan_out_and_cascade_keep_empty_trigger() {
    let h = harness();
    h.rec.ensure_broker().await.unwrap();
    h.rec.reconcile(ping("source-a")).await.unwrap();
    h.rec.reconcile(target("target-b").consuming("source-a").with_secret("auth.token", "t")).await.unwrap();
    h.rec.reconcile(target("target-c").consuming("source-a")).await.unwrap();
    let b_url = h.url_of("target-b").await;
    assert_eq!(h.rec.lookup_trigger(PING_TRIGGER).unwrap().targets.len(), 2);

    let report = h.rec.delete(&["target-b".to_string()], false).await.unwrap();
    assert_eq!(report.deleted(), vec!["target-b"]);
    assert!(report.warnings.is_empty());
    let m = h.manifest();
    assert!(!m.contains("target-b"));
    assert!(!m.contains("target-b-secret"));
    assert!(!h.rt.is_running("target-b"));
    let trigger = h.rec.lookup_trigger(PING_TRIGGER).unwrap();
    assert!(trigger.targets.iter().all(|t| t.url != b_url));
    assert_eq!(trigger.targets.len(), 1);

    h.rec.delete(&["target-c".to_string()], false).await.unwrap();
    let trigger = h.rec.lookup_trigger(PING_TRIGGER).unwrap();
    assert!(trigger.targets.is_empty());
    assert_eq!(trigger.event_type(), Some(PING_TYPE));
    let mirror = h.manifest().get(PING_TRIGGER).cloned().unwrap();
    assert_eq!(mirror.spec["targets"], serde_json::json!([]));
    assert!(h.rec.triggers_for_target("target-c").unwrap().is_empty());
}

#[tokio::test]
async fn secret_with_another_referrer_survives_cascade() {
    let h = harness();
    h.rec.reconcile(target("a").with_secret("token", "x")).await.unwrap();
    let shared = target("b").with_spec(serde_json::json!({
        "token": { "valueFromSecret": { "name": "a-secret", "key": "token" } }
    }));
    h.rec.reconcile(shared).await.unwrap();
    h.rec.delete(&["a".to_string()], false).await.unwrap();
    assert!(h.manifest().contains("a-secret"));
    h.rec.delete(&["b".to_string()], false).await.unwrap();
    // The sweep only follows the naming convention of the deleted component.
    assert!(h.manifest().contains("a-secret"));
}

#[tokio::test]
async fn delete_skips_brokers_secrets_and_unknown_names() {
    let h = harness();
    h.rec.ensure_broker().await.unwrap();
    h.rec.reconcile(target("sink").with_secret("token", "x")).await.unwrap();
    let names: Vec<String> = ["local", "sink-secret", "ghost"].iter().map(|s| s.to_string()).collect();
    let report = h.rec.delete(&names, false).await.unwrap();
    assert!(report.deleted().is_empty());
    assert_eq!(report.outcomes.len(), 3);
    assert!(report.outcomes.iter().all(|o| matches!(o.action, Action::Skipped { .. })));
    let m = h.manifest();
    assert!(m.contains("local") && m.contains("sink-secret") && m.contains("sink"));
    assert!(h.rt.is_running("local-broker"));
}

#[tokio::test]
async fn deleting_a_trigger_record_removes_its_route() {
    let h = harness();
    h.rec.ensure_broker().await.unwrap();
    h.rec.reconcile(ping("source-a")).await.unwrap();
    h.rec.reconcile(target("target-b").consuming("source-a")).await.unwrap();
    h.rec.delete(&[PING_TRIGGER.to_string()], false).await.unwrap();
    assert!(matches!(h.rec.lookup_trigger(PING_TRIGGER), Err(MeshError::TriggerNotFound(_))));
    assert!(!h.manifest().contains(PING_TRIGGER));
    assert!(h.rt.is_running("target-b"));
}

#[tokio::test]
async fn batch_isolates_a_failing_component() {
    let h = harness();
    let mut m = Manifest::new(h.cfg.manifest_path());
    for i in 1..=5 {
        let r = Resource::new("targets.triggermesh.io/v1alpha1", "HTTPTarget", format!("c{}", i))
            .with_spec(serde_json::json!({ "endpoint": format!("https://{}.example.com", i) }));
        m.upsert(r).unwrap();
    }
    m.write().unwrap();
    h.rt.fail_start_for("c3");

    let batch = h.rec.reconcile_all().await.unwrap();
    assert_eq!(batch.reports.len(), 4);
    let done: Vec<_> = batch.reports.iter().map(|r| r.component.as_str()).collect();
    assert_eq!(done, vec!["c1", "c2", "c4", "c5"]);
    for name in ["c1", "c2", "c4", "c5"] {
        assert!(h.rt.is_running(name), "{name} should run");
    }
    assert!(!h.rt.is_running("c3"));

    let err = batch.into_result().unwrap_err();
    assert!(matches!(err, MeshError::AggregateTask { .. }));
    assert_eq!(err.failed_components(), vec!["c3"]);
    assert_eq!(h.manifest().len(), 5);
}

#[tokio::test]
async fn batch_restarts_crashed_consumers_and_retargets_routes() {
    let h = harness();
    h.rec.ensure_broker().await.unwrap();
    h.rec.reconcile(ping("source-a")).await.unwrap();
    h.rec.reconcile(target("target-b").consuming("source-a")).await.unwrap();
    let old_url = h.url_of("target-b").await;
    h.rt.kill("target-b");

    let batch = h.rec.reconcile_all().await.unwrap();
    assert!(batch.is_ok(), "{:?}", batch.failures);
    let b = batch.reports.iter().find(|r| r.component == "target-b").unwrap();
    assert_eq!(b.action, Action::Restarted);
    let new_url = h.url_of("target-b").await;
    assert_ne!(old_url, new_url);
    let trigger = h.rec.lookup_trigger(PING_TRIGGER).unwrap();
    assert_eq!(trigger.targets.len(), 1);
    assert_eq!(trigger.targets[0].url, new_url);
    assert_eq!(h.rt.starts("source-a"), 1);
}

#[tokio::test]
async fn broker_restart_repoints_producers() {
    let h = harness();
    h.rec.ensure_broker().await.unwrap();
    h.rec.reconcile(ping("source-a")).await.unwrap();
    let old_sink = h.rt.spec_of("source-a").unwrap().env["K_SINK"].clone();
    h.rt.kill("local-broker");

    let batch = h.rec.reconcile_all().await.unwrap();
    assert!(batch.is_ok(), "{:?}", batch.failures);
    let actions: Vec<_> = batch.reports.iter().map(|r| (r.component.as_str(), r.action.clone())).collect();
    assert_eq!(actions, vec![("local", Action::Restarted), ("source-a", Action::Restarted)]);
    let sink = h.rt.spec_of("source-a").unwrap().env["K_SINK"].clone();
    assert_ne!(sink, old_sink);
    assert_eq!(sink, h.url_of("local-broker").await);

    let again = h.rec.reconcile_all().await.unwrap();
    assert!(again.reports.iter().all(|r| r.action == Action::Unchanged));
}

#[tokio::test]
async fn status_and_stop_all() {
    let h = harness();
    h.rec.ensure_broker().await.unwrap();
    h.rec.reconcile(ping("source-a")).await.unwrap();
    h.rec.reconcile(target("target-b").consuming("source-a")).await.unwrap();

    let status = h.rec.status().await.unwrap();
    let names: Vec<_> = status.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["local", "source-a", "target-b", PING_TRIGGER]);
    assert!(status[..3].iter().all(|s| s.state == Some(InstanceState::Running) && s.instance.is_some()));
    assert_eq!(status[3].state, None);

    let stopped = h.rec.stop_all().await.unwrap();
    assert_eq!(stopped.outcomes.iter().filter(|o| o.action == Action::Stopped).count(), 3);
    assert!(h.rt.running().is_empty());
    let again = h.rec.stop_all().await.unwrap();
    assert!(again.outcomes.iter().all(|o| matches!(o.action, Action::Skipped { .. })));
}

#[tokio::test]
async fn manual_triggers_round_trip() {
    let h = harness();
    h.rec.reconcile(target("sink")).await.unwrap();
    let t = h.rec.upsert_trigger("all-events", None, Some("sink"), Default::default()).await.unwrap();
    assert_eq!(t.targets.len(), 1);
    let t = h.rec.upsert_trigger("all-events", Some("a.b"), None, Default::default()).await.unwrap();
    assert_eq!(t.event_type(), Some("a.b"));
    assert_eq!(t.targets.len(), 1);
    assert!(h.manifest().contains("all-events"));

    let err = h.rec.upsert_trigger("sink", None, None, Default::default()).await.unwrap_err();
    assert!(matches!(err, MeshError::InvalidResource(_)));

    assert!(h.rec.remove_trigger("all-events").await.unwrap());
    assert!(!h.rec.remove_trigger("all-events").await.unwrap());
    assert!(!h.manifest().contains("all-events"));
}

struct CountingFinalizer {
    calls: AtomicUsize,
    message: Option<&'static str>,
}

#[async_trait::async_trait]
impl Finalizer for CountingFinalizer {
    async fn finalize(&self, resource: &Resource, env: &BTreeMap<String, String>) -> MeshResult<Finalized> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(env.get("TOKEN").map(String::as_str), Some("x"));
        match self.message {
            None => Ok(Finalized::Done),
            Some(msg) => transport_outcome(msg, resource.name()),
        }
    }
}

#[tokio::test]
async fn finalizer_failures_are_warnings() {
    let broken = Arc::new(CountingFinalizer { calls: AtomicUsize::new(0), message: Some("permission denied") });
    let mut reg = FinalizerRegistry::new();
    reg.register("HTTPTarget", broken.clone());
    let h = harness_with(reg);
    h.rec.reconcile(target("sink").with_secret("token", "x")).await.unwrap();

    let report = h.rec.delete(&["sink".to_string()], false).await.unwrap();
    assert_eq!(broken.calls.load(Ordering::SeqCst), 1);
    assert_eq!(report.deleted(), vec!["sink"]);
    assert_eq!(report.warnings.len(), 1);
    assert!(!h.manifest().contains("sink-secret"));
}

#[tokio::test]
async fn already_unsubscribed_counts_as_finalized() {
    let gone = Arc::new(CountingFinalizer { calls: AtomicUsize::new(0), message: Some("Unsubscribed from topic t") });
    let mut reg = FinalizerRegistry::new();
    reg.register("httptarget", gone.clone());
    let h = harness_with(reg);
    h.rec.reconcile(target("sink").with_secret("token", "x")).await.unwrap();
    let report = h.rec.delete(&["sink".to_string()], false).await.unwrap();
    assert_eq!(gone.calls.load(Ordering::SeqCst), 1);
    assert!(report.warnings.is_empty());
}

#[tokio::test]
async fn stop_failures_do_not_block_the_cascade() {
    let h = harness();
    h.rec.reconcile(target("sink")).await.unwrap();
    h.rt.fail_stop_for("sink");
    let report = h.rec.delete(&["sink".to_string()], false).await.unwrap();
    assert_eq!(report.deleted(), vec!["sink"]);
    assert_eq!(report.warnings.len(), 1);
    assert!(!h.manifest().contains("sink"));
}

#[tokio::test]
async fn deleting_the_active_broker_switches_context() {
    let h = harness();
    let alpha = h.rec.for_context("alpha");
    let beta = h.rec.for_context("beta");
    alpha.ensure_broker().await.unwrap();
    beta.ensure_broker().await.unwrap();
    alpha.reconcile(target("sink")).await.unwrap();
    h.cfg.save_active_context(Some("alpha")).unwrap();

    let report = h.rec.delete_broker("alpha").await.unwrap();
    assert_eq!(report.active_context.as_deref(), Some("beta"));
    assert!(!h.cfg.home.join("alpha").exists());
    assert!(!h.rt.is_running("alpha-broker"));
    assert!(!h.rt.is_running("sink"));
    assert!(h.rt.is_running("beta-broker"));
    assert_eq!(h.cfg.load_active_context().unwrap().as_deref(), Some("beta"));

    h.rec.delete_broker("beta").await.unwrap();
    assert_eq!(h.cfg.load_active_context().unwrap(), None);
    assert!(matches!(h.rec.delete_broker("beta").await, Err(MeshError::ComponentNotFound(_))));
}

/// Replaces the manifest file with a directory the first time it fires after `arm`.
#[derive(Default)]
struct ManifestSwap {
    armed: Mutex<Option<PathBuf>>,
    saved: Mutex<Option<Vec<u8>>>,
}

impl ManifestSwap {
    fn arm(&self, path: PathBuf) {
        *self.armed.lock().unwrap() = Some(path);
    }

    fn fire(&self) {
        let Some(path) = self.armed.lock().unwrap().take() else { return };
        let bytes = std::fs::read(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        *self.saved.lock().unwrap() = Some(bytes);
    }

    fn restore(&self, path: &Path) {
        std::fs::remove_dir(path).unwrap();
        std::fs::write(path, self.saved.lock().unwrap().take().unwrap()).unwrap();
    }
}

#[async_trait::async_trait]
impl Finalizer for ManifestSwap {
    async fn finalize(&self, _resource: &Resource, _env: &BTreeMap<String, String>) -> MeshResult<Finalized> {
        self.fire();
        Ok(Finalized::Done)
    }
}

/// Fires a `ManifestSwap` right before starting `component`.
struct SwapOnStart {
    inner: Arc<MemoryRuntime>,
    component: &'static str,
    swap: Arc<ManifestSwap>,
}

#[async_trait::async_trait]
impl ContainerRuntime for SwapOnStart {
    async fn start(&self, spec: &ContainerSpec) -> MeshResult<u16> {
        if spec.name == self.component {
            self.swap.fire();
        }
        self.inner.start(spec).await
    }

    async fn stop(&self, name: &str) -> MeshResult<bool> {
        self.inner.stop(name).await
    }

    async fn status(&self, name: &str) -> MeshResult<InstanceStatus> {
        self.inner.status(name).await
    }
}

#[tokio::test]
async fn failed_cascade_write_restores_the_routing_table() {
    let swap = Arc::new(ManifestSwap::default());
    let mut reg = FinalizerRegistry::new();
    reg.register("HTTPTarget", swap.clone());
    let h = harness_with(reg);
    h.rec.ensure_broker().await.unwrap();
    h.rec.reconcile(ping("source-a")).await.unwrap();
    h.rec.reconcile(target("target-b").consuming("source-a")).await.unwrap();
    swap.arm(h.cfg.manifest_path());

    let err = h.rec.delete(&["target-b".to_string()], false).await.unwrap_err();
    assert!(matches!(err, MeshError::StoreIo { .. }), "{err:?}");
    assert_eq!(h.rec.lookup_trigger(PING_TRIGGER).unwrap().targets.len(), 1);

    swap.restore(&h.cfg.manifest_path());
    let m = h.manifest();
    assert!(m.contains("target-b"));
    assert_eq!(m.get(PING_TRIGGER).unwrap().spec["targets"].as_array().map(Vec::len), Some(1));

    let report = h.rec.delete(&["target-b".to_string()], false).await.unwrap();
    assert_eq!(report.deleted(), vec!["target-b"]);
    assert!(h.rec.lookup_trigger(PING_TRIGGER).unwrap().targets.is_empty());
    assert_eq!(h.manifest().get(PING_TRIGGER).unwrap().spec["targets"], serde_json::json!([]));
}

#[tokio::test]
async fn failed_route_mirror_is_partial_and_rolled_back() {
    let swap = Arc::new(ManifestSwap::default());
    let fires = swap.clone();
    let h = build(FinalizerRegistry::new(), move |rt| {
        Arc::new(SwapOnStart { inner: rt, component: "target-b", swap: fires }) as Arc<dyn ContainerRuntime>
    });
    h.rec.ensure_broker().await.unwrap();
    h.rec.reconcile(ping("source-a")).await.unwrap();
    swap.arm(h.cfg.manifest_path());

    let req = target("target-b").consuming("source-a");
    let err = h.rec.reconcile(req.clone()).await.unwrap_err();
    assert!(matches!(err, MeshError::PartialReconcile { .. }), "{err:?}");
    assert!(err.is_retryable());
    assert!(h.rt.is_running("target-b"));
    assert!(matches!(h.rec.lookup_trigger(PING_TRIGGER), Err(MeshError::TriggerNotFound(_))));

    swap.restore(&h.cfg.manifest_path());
    assert!(!h.manifest().contains(PING_TRIGGER));
    let report = h.rec.reconcile(req).await.unwrap();
    assert_eq!(report.action, Action::Unchanged);
    assert_eq!(report.triggers, vec![PING_TRIGGER.to_string()]);
    let trigger = h.rec.lookup_trigger(PING_TRIGGER).unwrap();
    assert_eq!(trigger.targets.len(), 1);
    assert_eq!(trigger.targets[0].url, h.url_of("target-b").await);
    assert!(h.manifest().contains(PING_TRIGGER));
}
