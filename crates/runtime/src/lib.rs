//! Container runtime seam: what the orchestrator needs from whatever runs adapter instances.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;

use emesh_core::MeshResult;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

mod docker;
mod memory;

pub use docker::DockerCli;
pub use memory::MemoryRuntime;

/// Label carried by every instance the mesh starts, valued with the owning context.
pub const INSTANCE_LABEL: &str = "triggermesh.io/context";
/// Label holding `ContainerSpec::fingerprint` of the configuration an instance was started with.
pub const FINGERPRINT_LABEL: &str = "triggermesh.io/config-hash";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

/// Desired instance. `port` is the port the adapter listens on inside the instance;
/// the runtime publishes it on a free host port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub port: u16,
    pub mounts: Vec<Mount>,
    pub labels: BTreeMap<String, String>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            env: BTreeMap::new(),
            port,
            mounts: Vec::new(),
            labels: BTreeMap::new(),
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_mount(mut self, host: impl Into<PathBuf>, container: impl Into<String>, read_only: bool) -> Self {
        self.mounts.push(Mount { host: host.into(), container: container.into(), read_only });
        self
    }

    /// Digest of what the adapter sees: image, port, environment and mounts. Labels are left out.
    /// Runtimes stamp it on the instance and report it back through `InstanceStatus`.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.image.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.port.to_string().as_bytes());
        hasher.update(b"\n");
        for (k, v) in &self.env {
            hasher.update(k.as_bytes());
            hasher.update(b"=");
            hasher.update(v.as_bytes());
            hasher.update(b"\n");
        }
        for m in &self.mounts {
            hasher.update(m.host.to_string_lossy().as_bytes());
            hasher.update(b":");
            hasher.update(m.container.as_bytes());
            hasher.update(if m.read_only { b":ro\n" } else { b":rw\n" });
        }
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Running,
    /// Exists but is not running (exited, created, paused...).
    Stopped,
    Absent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub state: InstanceState,
    pub host_port: Option<u16>,
    /// Fingerprint of the configuration the instance was started with, when it carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

impl InstanceStatus {
    pub fn absent() -> Self {
        Self { state: InstanceState::Absent, host_port: None, fingerprint: None }
    }

    pub fn is_running(&self) -> bool {
        self.state == InstanceState::Running
    }
}

#[async_trait::async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Start an instance and return its published host port.
    async fn start(&self, spec: &ContainerSpec) -> MeshResult<u16>;
    /// Stop and remove. `Ok(false)` when there was nothing to stop.
    async fn stop(&self, name: &str) -> MeshResult<bool>;
    async fn status(&self, name: &str) -> MeshResult<InstanceStatus>;
}

/// `<registry>/<kind>-adapter:<version>`, kind lower-cased.
pub fn adapter_image(registry: &str, kind: &str, version: &str) -> String {
    format!("{}/{}-adapter:{}", registry.trim_end_matches('/'), kind.to_lowercase(), version)
}
