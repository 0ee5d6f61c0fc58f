use std::collections::BTreeMap;

use emesh_apply::{
    Action, BatchReport, ComponentRequest, ComponentStatus, DeleteReport, Outcome, ReconcileReport, StopReport,
};
use emesh_core::{Category, Filter, Resource, Target, Trigger};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::{ApiError, ApiResult, BrokerInfo, MeshApi, TriggerRequest};

/// Simple in-memory mock implementation for tests.
/// Canned data is served as is; every call is recorded by name.
#[derive(Default)]
pub struct MockApi {
    pub brokers: Vec<BrokerInfo>,
    pub kinds: FxHashMap<Category, Vec<String>>,
    pub status: Vec<ComponentStatus>,
    pub objects: Vec<Resource>,
    /// When set, mutating calls fail with this error.
    pub fail_with: Option<ApiError>,
    pub triggers: Mutex<BTreeMap<String, Trigger>>,
    pub calls: Mutex<Vec<String>>,
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of the calls made so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, call: &str) {
        self.calls.lock().push(call.to_string());
    }

    fn mutate(&self, call: &str) -> ApiResult<()> {
        self.record(call);
        match &self.fail_with {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl MeshApi for MockApi {
    async fn create_broker(&self, name: &str) -> ApiResult<ReconcileReport> {
        self.mutate("create_broker")?;
        Ok(ReconcileReport {
            component: name.to_string(),
            kind: emesh_core::BROKER_KIND.to_string(),
            action: Action::Created,
            instance: None,
            diff: Default::default(),
            triggers: Vec::new(),
            warnings: Vec::new(),
        })
    }

    async fn list_brokers(&self) -> ApiResult<Vec<BrokerInfo>> {
        self.record("list_brokers");
        Ok(self.brokers.clone())
    }

    async fn use_broker(&self, name: &str) -> ApiResult<()> {
        self.mutate("use_broker")?;
        if self.brokers.iter().any(|b| b.name == name) {
            Ok(())
        } else {
            Err(ApiError::NotFound(format!("broker {:?}", name)))
        }
    }

    async fn delete_broker(&self, name: &str) -> ApiResult<DeleteReport> {
        self.mutate("delete_broker")?;
        Ok(DeleteReport {
            outcomes: vec![Outcome { component: name.to_string(), action: Action::Deleted }],
            ..Default::default()
        })
    }

    async fn reconcile(&self, req: ComponentRequest) -> ApiResult<ReconcileReport> {
        self.mutate("reconcile")?;
        Ok(ReconcileReport {
            component: req.name,
            kind: req.kind,
            action: Action::Created,
            instance: None,
            diff: Default::default(),
            triggers: Vec::new(),
            warnings: Vec::new(),
        })
    }

    async fn start(&self) -> ApiResult<BatchReport> {
        self.mutate("start")?;
        Ok(BatchReport::default())
    }

    async fn stop(&self) -> ApiResult<StopReport> {
        self.mutate("stop")?;
        Ok(StopReport::default())
    }

    async fn delete(&self, names: &[String]) -> ApiResult<DeleteReport> {
        self.mutate("delete")?;
        let outcomes = names
            .iter()
            .map(|n| {
                let action = if self.objects.iter().any(|o| o.name() == n) {
                    Action::Deleted
                } else {
                    Action::Skipped { reason: "not found".into() }
                };
                Outcome { component: n.clone(), action }
            })
            .collect();
        Ok(DeleteReport { outcomes, ..Default::default() })
    }

    async fn upsert_trigger(&self, req: TriggerRequest) -> ApiResult<Trigger> {
        self.mutate("upsert_trigger")?;
        let mut triggers = self.triggers.lock();
        let t = triggers.entry(req.name.clone()).or_insert_with(|| Trigger::new(&req.name));
        t.set_filter(req.event_type.map(Filter::exact));
        if let Some(component) = req.target {
            t.add_target(Target::new(format!("http://mock/{}", component), component).with_delivery(req.delivery));
        }
        Ok(t.clone())
    }

    async fn remove_trigger(&self, name: &str) -> ApiResult<bool> {
        self.mutate("remove_trigger")?;
        Ok(self.triggers.lock().remove(name).is_some())
    }

    async fn lookup_trigger(&self, name: &str) -> ApiResult<Trigger> {
        self.record("lookup_trigger");
        self.triggers.lock().get(name).cloned().ok_or_else(|| ApiError::NotFound(format!("trigger {:?}", name)))
    }

    async fn status(&self) -> ApiResult<Vec<ComponentStatus>> {
        self.record("status");
        Ok(self.status.clone())
    }

    async fn manifest(&self) -> ApiResult<Vec<Resource>> {
        self.record("manifest");
        Ok(self.objects.clone())
    }

    async fn list_kinds(&self, category: Category) -> ApiResult<Vec<String>> {
        self.record("list_kinds");
        Ok(self.kinds.get(&category).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_records_calls_and_keeps_triggers() {
        let mut api = MockApi::new();
        api.kinds.insert(Category::Source, vec!["ping".into()]);
        api.objects.push(Resource::new("targets.triggermesh.io/v1alpha1", "HTTPTarget", "sink"));

        assert_eq!(api.list_kinds(Category::Source).await.unwrap(), vec!["ping"]);
        let t = api
            .upsert_trigger(TriggerRequest {
                name: "t".into(),
                event_type: Some("a.b".into()),
                target: Some("sink".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(t.matches("a.b"));
        assert_eq!(api.lookup_trigger("t").await.unwrap(), t);

        let report = api.delete(&["sink".to_string(), "ghost".to_string()]).await.unwrap();
        assert_eq!(report.deleted(), vec!["sink"]);
        assert_eq!(api.calls(), vec!["list_kinds", "upsert_trigger", "lookup_trigger", "delete"]);
    }

    #[tokio::test]
    async fn injected_error_fails_mutations_only() {
        let api = MockApi { fail_with: Some(ApiError::Conflict("locked".into())), ..Default::default() };
        assert_eq!(api.start().await.unwrap_err(), ApiError::Conflict("locked".into()));
        assert!(api.status().await.unwrap().is_empty());
    }
}
