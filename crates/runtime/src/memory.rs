//! In-process runtime with failure injection and call counters; no processes are spawned.

use std::collections::{BTreeMap, BTreeSet};

use emesh_core::{MeshError, MeshResult};
use parking_lot::Mutex;

use crate::{ContainerRuntime, ContainerSpec, InstanceState, InstanceStatus};

const FIRST_PORT: u16 = 32768;

#[derive(Debug)]
struct Instance {
    spec: ContainerSpec,
    host_port: u16,
    running: bool,
}

#[derive(Debug, Default)]
struct Inner {
    instances: BTreeMap<String, Instance>,
    next_port: u16,
    starts: BTreeMap<String, usize>,
    stops: BTreeMap<String, usize>,
    fail_start: BTreeSet<String>,
    fail_stop: BTreeSet<String>,
}

#[derive(Debug)]
pub struct MemoryRuntime {
    inner: Mutex<Inner>,
}

impl Default for MemoryRuntime {
    fn default() -> Self {
        Self { inner: Mutex::new(Inner { next_port: FIRST_PORT, ..Default::default() }) }
    }
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `start` of `name` fail until cleared.
    pub fn fail_start_for(&self, name: &str) {
        self.inner.lock().fail_start.insert(name.to_string());
    }

    pub fn fail_stop_for(&self, name: &str) {
        self.inner.lock().fail_stop.insert(name.to_string());
    }

    pub fn clear_failures(&self) {
        let mut g = self.inner.lock();
        g.fail_start.clear();
        g.fail_stop.clear();
    }

    pub fn starts(&self, name: &str) -> usize {
        self.inner.lock().starts.get(name).copied().unwrap_or(0)
    }

    pub fn stops(&self, name: &str) -> usize {
        self.inner.lock().stops.get(name).copied().unwrap_or(0)
    }

    pub fn total_starts(&self) -> usize {
        self.inner.lock().starts.values().sum()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.inner.lock().instances.get(name).map(|i| i.running).unwrap_or(false)
    }

    pub fn spec_of(&self, name: &str) -> Option<ContainerSpec> {
        self.inner.lock().instances.get(name).map(|i| i.spec.clone())
    }

    /// Simulate a crash: the instance stays known but stops running.
    pub fn kill(&self, name: &str) {
        if let Some(i) = self.inner.lock().instances.get_mut(name) {
            i.running = false;
        }
    }

    pub fn running(&self) -> Vec<String> {
        self.inner.lock().instances.iter().filter(|(_, i)| i.running).map(|(n, _)| n.clone()).collect()
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for MemoryRuntime {
    async fn start(&self, spec: &ContainerSpec) -> MeshResult<u16> {
        let mut g = self.inner.lock();
        if g.fail_start.contains(&spec.name) {
            return Err(MeshError::RuntimeStart { component: spec.name.clone(), reason: "injected failure".into() });
        }
        if g.instances.get(&spec.name).map(|i| i.running).unwrap_or(false) {
            return Err(MeshError::RuntimeStart {
                component: spec.name.clone(),
                reason: "an instance with this name is already running".into(),
            });
        }
        let host_port = g.next_port;
        g.next_port = g.next_port.wrapping_add(1).max(FIRST_PORT);
        g.instances.insert(spec.name.clone(), Instance { spec: spec.clone(), host_port, running: true });
        *g.starts.entry(spec.name.clone()).or_default() += 1;
        Ok(host_port)
    }

    async fn stop(&self, name: &str) -> MeshResult<bool> {
        let mut g = self.inner.lock();
        if g.fail_stop.contains(name) {
            return Err(MeshError::RuntimeStop { component: name.to_string(), reason: "injected failure".into() });
        }
        let existed = g.instances.remove(name).is_some();
        if existed {
            *g.stops.entry(name.to_string()).or_default() += 1;
        }
        Ok(existed)
    }

    async fn status(&self, name: &str) -> MeshResult<InstanceStatus> {
        let g = self.inner.lock();
        Ok(match g.instances.get(name) {
            Some(i) if i.running => InstanceStatus {
                state: InstanceState::Running,
                host_port: Some(i.host_port),
                fingerprint: Some(i.spec.fingerprint()),
            },
            Some(i) => InstanceStatus {
                state: InstanceState::Stopped,
                host_port: None,
                fingerprint: Some(i.spec.fingerprint()),
            },
            None => InstanceStatus::absent(),
        })
    }
}
