use std::sync::Arc;
use std::time::Instant;

use emesh_apply::{BatchReport, ComponentRequest, ComponentStatus, DeleteReport, FinalizerRegistry, ReconcileReport, Reconciler, StopReport};
use emesh_core::config::DEFAULT_CONTEXT;
use emesh_core::{validate_name, Category, MeshConfig, Resource, Trigger};
use emesh_runtime::ContainerRuntime;
use emesh_schema::SchemaProvider;
use emesh_store::StoreLock;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::info;

use crate::{ApiError, ApiResult, BrokerInfo, MeshApi, TriggerRequest};

/// In-process implementation that drives the orchestrator directly.
/// Mutating calls hold the context's `StoreLock` so other processes see whole operations only.
pub struct InProcApi {
    cfg: MeshConfig,
    base: Reconciler,
    active: RwLock<String>,
    contexts: Mutex<FxHashMap<String, Arc<Reconciler>>>,
}

impl InProcApi {
    pub fn new(cfg: MeshConfig, runtime: Arc<dyn ContainerRuntime>, schema: Arc<dyn SchemaProvider>) -> Self {
        Self::with_finalizers(cfg, runtime, schema, FinalizerRegistry::new())
    }

    pub fn with_finalizers(
        cfg: MeshConfig,
        runtime: Arc<dyn ContainerRuntime>,
        schema: Arc<dyn SchemaProvider>,
        finalizers: FinalizerRegistry,
    ) -> Self {
        let active = RwLock::new(cfg.context.clone());
        let base = Reconciler::new(cfg.clone(), runtime, schema).with_finalizers(finalizers);
        Self { cfg, base, active, contexts: Mutex::new(FxHashMap::default()) }
    }

    pub fn active_context(&self) -> String {
        self.active.read().clone()
    }

    fn reconciler(&self, context: &str) -> Arc<Reconciler> {
        self.contexts
            .lock()
            .entry(context.to_string())
            .or_insert_with(|| Arc::new(self.base.for_context(context)))
            .clone()
    }

    fn current(&self) -> Arc<Reconciler> {
        self.reconciler(&self.active_context())
    }

    async fn lock(&self, rec: &Reconciler) -> ApiResult<StoreLock> {
        let cfg = rec.config();
        Ok(StoreLock::acquire(&cfg.context_dir(), cfg.lock_timeout).await?)
    }

    fn set_active(&self, context: Option<&str>) -> ApiResult<()> {
        self.cfg.save_active_context(context)?;
        *self.active.write() = context.unwrap_or(DEFAULT_CONTEXT).to_string();
        Ok(())
    }
}

#[async_trait::async_trait]
impl MeshApi for InProcApi {
    async fn create_broker(&self, name: &str) -> ApiResult<ReconcileReport> {
        let t0 = Instant::now();
        info!(broker = %name, "api: create_broker start");
        validate_name(name)?;
        let rec = self.reconciler(name);
        let _lock = self.lock(&rec).await?;
        let report = rec.ensure_broker().await?;
        self.set_active(Some(name))?;
        info!(broker = %name, action = %report.action, took_ms = %t0.elapsed().as_millis(), "api: create_broker ok");
        Ok(report)
    }

    async fn list_brokers(&self) -> ApiResult<Vec<BrokerInfo>> {
        let active = self.active_context();
        let brokers = self.cfg.list_brokers()?;
        Ok(brokers.into_iter().map(|name| BrokerInfo { active: name == active, name }).collect())
    }

    async fn use_broker(&self, name: &str) -> ApiResult<()> {
        validate_name(name)?;
        if !self.cfg.list_brokers()?.iter().any(|b| b == name) {
            return Err(ApiError::NotFound(format!("broker {:?}", name)));
        }
        self.set_active(Some(name))?;
        info!(broker = %name, "api: active broker set");
        Ok(())
    }

    async fn delete_broker(&self, name: &str) -> ApiResult<DeleteReport> {
        let t0 = Instant::now();
        info!(broker = %name, "api: delete_broker start");
        validate_name(name)?;
        let rec = self.reconciler(name);
        // Checked before locking: taking the lock creates the context directory.
        if !rec.config().manifest_path().is_file() {
            return Err(ApiError::NotFound(format!("broker {:?}", name)));
        }
        let report = {
            let _lock = self.lock(&rec).await?;
            self.current().delete_broker(name).await?
        };
        self.contexts.lock().remove(name);
        if self.active_context() == name {
            *self.active.write() = report.active_context.clone().unwrap_or_else(|| DEFAULT_CONTEXT.to_string());
        }
        info!(
            broker = %name,
            deleted = report.deleted().len(),
            warnings = report.warnings.len(),
            took_ms = %t0.elapsed().as_millis(),
            "api: delete_broker ok"
        );
        Ok(report)
    }

    async fn reconcile(&self, req: ComponentRequest) -> ApiResult<ReconcileReport> {
        let t0 = Instant::now();
        info!(component = %req.name, kind = %req.kind, "api: reconcile start");
        let rec = self.current();
        let _lock = self.lock(&rec).await?;
        let report = rec.reconcile(req).await?;
        info!(component = %report.component, action = %report.action, took_ms = %t0.elapsed().as_millis(), "api: reconcile ok");
        Ok(report)
    }

    async fn start(&self) -> ApiResult<BatchReport> {
        let t0 = Instant::now();
        let rec = self.current();
        let _lock = self.lock(&rec).await?;
        let report = rec.reconcile_all().await?;
        info!(
            ok = report.reports.len(),
            failed = report.failures.len(),
            took_ms = %t0.elapsed().as_millis(),
            "api: start done"
        );
        Ok(report)
    }

    async fn stop(&self) -> ApiResult<StopReport> {
        let rec = self.current();
        let _lock = self.lock(&rec).await?;
        Ok(rec.stop_all().await?)
    }

    async fn delete(&self, names: &[String]) -> ApiResult<DeleteReport> {
        let t0 = Instant::now();
        info!(count = names.len(), "api: delete start");
        let rec = self.current();
        let _lock = self.lock(&rec).await?;
        let report = rec.delete(names, false).await?;
        info!(deleted = report.deleted().len(), took_ms = %t0.elapsed().as_millis(), "api: delete ok");
        Ok(report)
    }

    async fn upsert_trigger(&self, req: TriggerRequest) -> ApiResult<Trigger> {
        let rec = self.current();
        let _lock = self.lock(&rec).await?;
        let trigger = rec
            .upsert_trigger(&req.name, req.event_type.as_deref(), req.target.as_deref(), req.delivery)
            .await?;
        Ok(trigger)
    }

    async fn remove_trigger(&self, name: &str) -> ApiResult<bool> {
        let rec = self.current();
        let _lock = self.lock(&rec).await?;
        Ok(rec.remove_trigger(name).await?)
    }

    async fn lookup_trigger(&self, name: &str) -> ApiResult<Trigger> {
        Ok(self.current().lookup_trigger(name)?)
    }

    async fn status(&self) -> ApiResult<Vec<ComponentStatus>> {
        Ok(self.current().status().await?)
    }

    async fn manifest(&self) -> ApiResult<Vec<Resource>> {
        Ok(self.current().manifest()?.objects().to_vec())
    }

    async fn list_kinds(&self, category: Category) -> ApiResult<Vec<String>> {
        if !matches!(category, Category::Source | Category::Target | Category::Transformation) {
            return Err(ApiError::Validation(format!("{} has no kinds to list", category)));
        }
        Ok(self.base.resolver().list_kinds(category))
    }
}
