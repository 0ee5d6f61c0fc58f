//! Event mesh routing table: the broker's trigger list, its file, and the matching store records.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use emesh_core::{
    Filter, MeshError, MeshResult, Resource, Target, Trigger, BROKER_KIND, CONTEXT_LABEL, EVENTING_API_VERSION,
    TRIGGER_KIND,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Where the broker instance expects its routing table.
pub const CONFIG_MOUNT_PATH: &str = "/etc/triggermesh/broker.conf";

const MAX_NAME: usize = 63;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTable {
    #[serde(default)]
    pub triggers: Vec<Trigger>,
}

impl RoutingTable {
    /// Missing or blank file is an empty table.
    pub fn load(path: &Path) -> MeshResult<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(MeshError::store_io(path, e)),
        };
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let table: Self = serde_yaml::from_str(&raw).map_err(|e| MeshError::corrupt(path, e))?;
        debug!(path = %path.display(), triggers = table.triggers.len(), "routing table read");
        Ok(table)
    }

    pub fn save(&self, path: &Path) -> MeshResult<()> {
        let body = serde_yaml::to_string(self)?;
        emesh_store::write_atomic(path, body.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.triggers.iter().position(|t| t.name == name)
    }

    /// Create or update `name`: the filter is replaced, the target is appended unless its URL
    /// is already present. Returns whether the table changed.
    pub fn upsert_trigger(&mut self, name: &str, filter: Option<Filter>, target: Option<Target>) -> bool {
        let (idx, created) = match self.position(name) {
            Some(idx) => (idx, false),
            None => {
                self.triggers.push(Trigger::new(name));
                (self.triggers.len() - 1, true)
            }
        };
        let before = self.triggers[idx].clone();
        let trigger = &mut self.triggers[idx];
        trigger.set_filter(filter);
        if let Some(t) = target {
            trigger.add_target(t);
        }
        let changed = created || *trigger != before;
        if changed {
            debug!(trigger = %name, targets = trigger.targets.len(), "trigger upserted");
        }
        changed
    }

    /// Removing an absent trigger is a no-op.
    pub fn remove_trigger(&mut self, name: &str) -> bool {
        let before = self.triggers.len();
        self.triggers.retain(|t| t.name != name);
        before != self.triggers.len()
    }

    pub fn lookup_trigger(&self, name: &str) -> MeshResult<&Trigger> {
        self.triggers
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| MeshError::TriggerNotFound(name.to_string()))
    }

    pub fn list_for_target(&self, component: &str) -> Vec<&Trigger> {
        self.triggers.iter().filter(|t| t.targets_component(component)).collect()
    }

    /// Drop `component` from every target list. Emptied triggers stay in the table.
    pub fn prune_target(&mut self, component: &str) -> usize {
        self.triggers.iter_mut().map(|t| t.remove_targets_for(component)).sum()
    }

    /// Point every target of `component` at `url` (after a restart moved its port).
    pub fn retarget(&mut self, component: &str, url: &str) -> usize {
        let mut n = 0;
        for trigger in &mut self.triggers {
            let mut moved = 0;
            for t in trigger.targets.iter_mut().filter(|t| t.component_ref == component && t.url != url) {
                t.url = url.to_string();
                moved += 1;
            }
            if moved > 0 {
                dedup_urls(trigger);
            }
            n += moved;
        }
        n
    }

    /// Targets that receive an event of `event_type`, each URL once.
    pub fn dispatch(&self, event_type: &str) -> Vec<&Target> {
        let mut out: Vec<&Target> = Vec::new();
        for trigger in self.triggers.iter().filter(|t| t.matches(event_type)) {
            for target in &trigger.targets {
                if !out.iter().any(|t| t.url == target.url) {
                    out.push(target);
                }
            }
        }
        out
    }
}

fn dedup_urls(trigger: &mut Trigger) {
    let mut seen: Vec<String> = Vec::with_capacity(trigger.targets.len());
    trigger.targets.retain(|t| {
        if seen.contains(&t.url) {
            return false;
        }
        seen.push(t.url.clone());
        true
    });
}

/// File-backed trigger engine: every call is one read-modify-write of the broker config.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    path: PathBuf,
}

impl BrokerConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> MeshResult<RoutingTable> {
        RoutingTable::load(&self.path)
    }

    pub fn write(&self, table: &RoutingTable) -> MeshResult<()> {
        table.save(&self.path)
    }

    pub fn upsert_trigger(&self, name: &str, filter: Option<Filter>, target: Option<Target>) -> MeshResult<Trigger> {
        let mut table = self.read()?;
        if table.upsert_trigger(name, filter, target) {
            self.write(&table)?;
            info!(trigger = %name, "trigger saved");
        }
        Ok(table.lookup_trigger(name)?.clone())
    }

    pub fn remove_trigger(&self, name: &str) -> MeshResult<bool> {
        let mut table = self.read()?;
        let removed = table.remove_trigger(name);
        if removed {
            self.write(&table)?;
            info!(trigger = %name, "trigger removed");
        }
        Ok(removed)
    }

    pub fn lookup_trigger(&self, name: &str) -> MeshResult<Trigger> {
        self.read()?.lookup_trigger(name).cloned()
    }

    pub fn list_triggers_for_target(&self, component: &str) -> MeshResult<Vec<Trigger>> {
        Ok(self.read()?.list_for_target(component).into_iter().cloned().collect())
    }
}

/// `<broker>-trigger-<event type>` with the type folded into a DNS label.
pub fn trigger_name(broker: &str, event_type: Option<&str>) -> String {
    let suffix = match event_type {
        Some(t) if !t.is_empty() => sanitize(t),
        _ => "all".to_string(),
    };
    let mut name = format!("{}-trigger-{}", broker, suffix);
    if name.len() > MAX_NAME {
        name.truncate(MAX_NAME);
    }
    name.trim_end_matches('-').to_string()
}

fn sanitize(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        let c = ch.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}

pub fn target_url(host: &str, port: u16) -> String {
    format!("http://{}:{}", host, port)
}

/// The store record of a broker; its name is also the context name.
pub fn broker_resource(name: &str) -> Resource {
    Resource::new(EVENTING_API_VERSION, BROKER_KIND, name)
        .with_label(CONTEXT_LABEL, name)
        .with_spec(serde_json::json!({ "storage": "inmemory" }))
}

#[derive(Debug, Serialize, Deserialize)]
struct TriggerSpec {
    broker: BrokerRef,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    filters: Vec<Filter>,
    #[serde(default)]
    targets: Vec<Target>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BrokerRef {
    name: String,
}

/// Mirror of a routing-table trigger kept in the manifest for listing and deletion.
pub fn trigger_resource(trigger: &Trigger, broker: &str) -> MeshResult<Resource> {
    let spec = TriggerSpec {
        broker: BrokerRef { name: broker.to_string() },
        filters: trigger.filters.iter().cloned().collect(),
        targets: trigger.targets.clone(),
    };
    Ok(Resource::new(EVENTING_API_VERSION, TRIGGER_KIND, &trigger.name)
        .with_label(CONTEXT_LABEL, broker)
        .with_spec(serde_json::to_value(spec)?))
}

pub fn trigger_from_resource(resource: &Resource) -> MeshResult<Trigger> {
    if !resource.is_kind(TRIGGER_KIND) {
        return Err(MeshError::InvalidResource(format!("{} is a {}, not a Trigger", resource.name(), resource.kind)));
    }
    let spec: TriggerSpec = serde_json::from_value(resource.spec.clone())
        .map_err(|e| MeshError::InvalidResource(format!("trigger {}: {}", resource.name(), e)))?;
    let mut trigger = Trigger::new(resource.name());
    trigger.filters = spec.filters.into_iter().collect();
    trigger.targets = spec.targets;
    Ok(trigger)
}
