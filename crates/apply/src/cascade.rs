//! Deletion cascade: finalize, stop, unstore, unroute, sweep orphaned secrets.

use std::collections::BTreeSet;

use emesh_broker::{trigger_resource, RoutingTable};
use emesh_core::{secret_name_for, validate_name, MeshError, MeshResult, Resource, BROKER_KIND, TRIGGER_KIND};
use emesh_store::Manifest;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{Action, Finalized, Outcome, Reconciler};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteReport {
    pub outcomes: Vec<Outcome>,
    /// Best-effort steps that failed; the cascade went on regardless.
    pub warnings: Vec<String>,
    /// Context made active after a broker deletion, if one was switched to.
    pub active_context: Option<String>,
}

impl DeleteReport {
    fn warn(&mut self, component: &str, msg: String) {
        warn!(component = %component, "{}", msg);
        counter!("cascade_warning_total", 1u64);
        self.warnings.push(format!("{}: {}", component, msg));
    }

    pub fn deleted(&self) -> Vec<&str> {
        self.outcomes.iter().filter(|o| o.action == Action::Deleted).map(|o| o.component.as_str()).collect()
    }
}

impl Reconciler {
    /// Delete the named components, or every non-secret record when `cascade_all`.
    /// Brokers are only removed by `delete_broker`.
    pub async fn delete(&self, names: &[String], cascade_all: bool) -> MeshResult<DeleteReport> {
        let _guard = self.write.lock().await;
        let mut manifest = self.manifest()?;
        let path = self.cfg.broker_config_path();
        let mut table = RoutingTable::load(&path)?;
        let before = table.clone();
        let mut report = DeleteReport::default();

        let wanted: BTreeSet<&str> = names.iter().map(String::as_str).collect();
        let mut selected = Vec::new();
        for r in manifest.objects() {
            // Secrets may still be needed by finalizers; only the orphan sweep removes them.
            if r.is_secret() {
                continue;
            }
            if cascade_all {
                selected.push(r.clone());
                continue;
            }
            if !wanted.contains(r.name()) {
                continue;
            }
            if r.is_kind(BROKER_KIND) {
                report.outcomes.push(Outcome {
                    component: r.name().to_string(),
                    action: Action::Skipped { reason: "brokers are deleted with delete_broker".into() },
                });
                continue;
            }
            selected.push(r.clone());
        }
        if !cascade_all {
            for name in &wanted {
                match manifest.get(name) {
                    None => report.outcomes.push(Outcome {
                        component: name.to_string(),
                        action: Action::Skipped { reason: "not found".into() },
                    }),
                    Some(r) if r.is_secret() => report.outcomes.push(Outcome {
                        component: name.to_string(),
                        action: Action::Skipped { reason: "secrets are removed with their component".into() },
                    }),
                    Some(_) => {}
                }
            }
        }

        for r in &selected {
            self.delete_one(r, &mut manifest, &mut table, &mut report).await?;
        }

        // Both stores or neither: a failed manifest write puts the table back.
        table.save(&path)?;
        if let Err(e) = manifest.write() {
            if let Err(rollback) = before.save(&path) {
                warn!(error = %rollback, "routing table rollback failed");
            }
            return Err(e);
        }
        info!(deleted = report.deleted().len(), warnings = report.warnings.len(), "delete done");
        Ok(report)
    }

    async fn delete_one(
        &self,
        r: &Resource,
        manifest: &mut Manifest,
        table: &mut RoutingTable,
        report: &mut DeleteReport,
    ) -> MeshResult<()> {
        let name = r.name().to_string();
        info!(component = %name, kind = %r.kind, "deleting");

        // 1. External cleanup first, while secrets are still around.
        if let Some(finalizer) = self.finalizers.get(&r.kind) {
            let refs = emesh_secrets::extract_refs(&r.spec);
            match emesh_secrets::resolve(&refs, manifest.objects()) {
                Ok(env) => match finalizer.finalize(r, &env).await {
                    Ok(Finalized::Done) => debug!(component = %name, "finalized"),
                    Ok(Finalized::AlreadyGone) => debug!(component = %name, "nothing left to finalize"),
                    Err(e) => report.warn(&name, format!("external services are not deleted: {}", e)),
                },
                Err(e) => report.warn(&name, format!("secrets for finalization: {}", e)),
            }
        }

        // 2. Runtime instance; absence is fine.
        if !r.is_kind(TRIGGER_KIND) {
            let instance = Self::instance_name(r);
            match self.runtime.stop(&instance).await {
                Ok(true) => debug!(component = %name, "instance stopped"),
                Ok(false) => debug!(component = %name, "no instance to stop"),
                Err(e) => report.warn(&name, format!("stopping instance: {}", e)),
            }
        }

        // 3. The record itself; trigger records take their table entry with them.
        manifest.remove(&name, &r.kind)?;
        if r.is_kind(TRIGGER_KIND) {
            table.remove_trigger(&name);
        }

        // 4. Routes to it. Emptied triggers stay as filter-only records.
        let pruned: Vec<String> = table.list_for_target(&name).iter().map(|t| t.name.clone()).collect();
        if !pruned.is_empty() {
            table.prune_target(&name);
            for tname in &pruned {
                let trigger = table.lookup_trigger(tname)?;
                if manifest.get(tname).map(|m| m.is_kind(TRIGGER_KIND)).unwrap_or(false) {
                    manifest.upsert(trigger_resource(trigger, &self.cfg.context)?)?;
                }
            }
            debug!(component = %name, triggers = pruned.len(), "routes pruned");
        }

        // 5. Its secret, unless someone else still points at it.
        let secret = secret_name_for(&name);
        if manifest.get(&secret).map(Resource::is_secret).unwrap_or(false) {
            if emesh_secrets::is_referenced(&secret, manifest.objects(), &name) {
                debug!(secret = %secret, "secret still referenced; kept");
            } else {
                manifest.remove(&secret, emesh_core::SECRET_KIND)?;
                debug!(secret = %secret, "orphaned secret removed");
            }
        }

        counter!("cascade_deleted_total", 1u64);
        report.outcomes.push(Outcome { component: name, action: Action::Deleted });
        Ok(())
    }

    /// Tear a whole context down and pick another active broker if it was the active one.
    pub async fn delete_broker(&self, broker: &str) -> MeshResult<DeleteReport> {
        validate_name(broker)?;
        let ctx = self.for_context(broker);
        let dir = ctx.cfg.context_dir();
        if !ctx.cfg.manifest_path().is_file() {
            return Err(MeshError::ComponentNotFound(broker.to_string()));
        }
        let mut report = ctx.delete(&[], true).await?;
        tokio::fs::remove_dir_all(&dir).await.map_err(|e| MeshError::store_io(&dir, e))?;
        info!(broker = %broker, "broker context removed");

        let active = self.cfg.load_active_context()?.unwrap_or_else(|| self.cfg.context.clone());
        if active == broker {
            let next = self.cfg.list_brokers()?.into_iter().next();
            self.cfg.save_active_context(next.as_deref())?;
            match &next {
                Some(n) => info!(broker = %n, "active broker switched"),
                None => info!("no brokers left; active broker unset"),
            }
            report.active_context = next;
        }
        Ok(report)
    }
}
