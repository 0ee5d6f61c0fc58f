//! Direct trigger management. The routing table and its manifest mirror move together.

use emesh_broker::{target_url, trigger_resource, RoutingTable};
use emesh_core::{validate_name, DeliveryOptions, Filter, MeshError, MeshResult, Target, Trigger, TRIGGER_KIND};
use tracing::{info, warn};

use crate::Reconciler;

impl Reconciler {
    pub fn routing_table(&self) -> MeshResult<RoutingTable> {
        RoutingTable::load(&self.cfg.broker_config_path())
    }

    pub fn lookup_trigger(&self, name: &str) -> MeshResult<Trigger> {
        self.routing_table()?.lookup_trigger(name).cloned()
    }

    pub fn triggers_for_target(&self, component: &str) -> MeshResult<Vec<Trigger>> {
        Ok(self.routing_table()?.list_for_target(component).into_iter().cloned().collect())
    }

    /// Create or update trigger `name`. `target` names a running consumer that gets added to the
    /// fan-out; `event_type` replaces the filter (`None` routes every event).
    pub async fn upsert_trigger(
        &self,
        name: &str,
        event_type: Option<&str>,
        target: Option<&str>,
        delivery: DeliveryOptions,
    ) -> MeshResult<Trigger> {
        validate_name(name)?;
        delivery.validate()?;
        let target = match target {
            Some(component) => Some(self.consumer_target(component, delivery).await?),
            None => None,
        };

        let _guard = self.write.lock().await;
        let mut manifest = self.manifest()?;
        if let Some(existing) = manifest.get(name) {
            if !existing.is_kind(TRIGGER_KIND) {
                return Err(MeshError::InvalidResource(format!(
                    "name {:?} is already used by a {}",
                    name, existing.kind
                )));
            }
        }
        let path = self.cfg.broker_config_path();
        let mut table = RoutingTable::load(&path)?;
        let before = table.clone();
        table.upsert_trigger(name, event_type.map(Filter::exact), target);
        let trigger = table.lookup_trigger(name)?.clone();
        if table == before && manifest.contains(name) {
            return Ok(trigger);
        }
        manifest.upsert(trigger_resource(&trigger, &self.cfg.context)?)?;
        table.save(&path)?;
        if let Err(e) = manifest.write() {
            if let Err(rollback) = before.save(&path) {
                warn!(trigger = %name, error = %rollback, "routing table rollback failed");
            }
            return Err(e);
        }
        info!(trigger = %name, targets = trigger.targets.len(), "trigger saved");
        Ok(trigger)
    }

    /// Remove trigger `name` from both stores. Absent triggers are a no-op.
    pub async fn remove_trigger(&self, name: &str) -> MeshResult<bool> {
        let _guard = self.write.lock().await;
        let path = self.cfg.broker_config_path();
        let mut table = RoutingTable::load(&path)?;
        let before = table.clone();
        let mut manifest = self.manifest()?;
        let in_table = table.remove_trigger(name);
        let in_manifest = match manifest.get(name) {
            Some(r) if r.is_kind(TRIGGER_KIND) => manifest.remove(name, TRIGGER_KIND)?,
            _ => false,
        };
        if !in_table && !in_manifest {
            return Ok(false);
        }
        table.save(&path)?;
        if let Err(e) = manifest.write() {
            if let Err(rollback) = before.save(&path) {
                warn!(trigger = %name, error = %rollback, "routing table rollback failed");
            }
            return Err(e);
        }
        info!(trigger = %name, "trigger removed");
        Ok(true)
    }

    async fn consumer_target(&self, component: &str, delivery: DeliveryOptions) -> MeshResult<Target> {
        let manifest = self.manifest()?;
        let resource = manifest.get(component).ok_or_else(|| MeshError::ComponentNotFound(component.to_string()))?;
        let consumer = self.category_of(resource).map(|c| c.capabilities().consumer).unwrap_or(false);
        if !consumer {
            return Err(MeshError::InvalidResource(format!("{} does not consume events", component)));
        }
        let status = self.runtime.status(&Self::instance_name(resource)).await?;
        let port = status.host_port.filter(|_| status.is_running()).ok_or_else(|| MeshError::RuntimeQuery {
            component: component.to_string(),
            reason: "not running; start it before routing to it".into(),
        })?;
        Ok(Target::new(target_url(&self.cfg.adapter_host, port), component).with_delivery(delivery))
    }
}
