//! Explicit runtime configuration, built once and handed to every constructor.
//!
//! Environment overrides:
//! - `EMESH_HOME` – config home (default `~/.triggermesh/cli`)
//! - `EMESH_CONTEXT` – active broker; falls back to `<home>/config.yaml`, then `default`
//! - `EMESH_VERSION` – adapter image tag (default `latest`)
//! - `EMESH_REGISTRY` – adapter image registry
//! - `EMESH_LOCK_TIMEOUT_SECS` – how long a writer waits for the context lock
//! - `EMESH_RUNTIME_TIMEOUT_SECS` – upper bound for one container runtime call

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{MeshError, MeshResult};

pub const MANIFEST_FILE: &str = "manifest.yaml";
pub const BROKER_CONFIG_FILE: &str = "broker.conf";
pub const ACTIVE_CONTEXT_FILE: &str = "config.yaml";
pub const DEFAULT_CONTEXT: &str = "default";

#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub home: PathBuf,
    /// Active broker name; also names the context directory under `home`.
    pub context: String,
    pub version: String,
    pub registry: String,
    pub broker_image: String,
    /// Host at which adapters reach each other's published ports.
    pub adapter_host: String,
    /// Port adapters listen on inside their instance.
    pub adapter_port: u16,
    pub lock_timeout: Duration,
    pub runtime_timeout: Duration,
    /// API domain; groups are `sources.<domain>`, `targets.<domain>`, ...
    pub api_domain: String,
}

impl Default for MeshConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".triggermesh").join("cli");
        Self::with_home(home)
    }
}

fn secs_from_env(var: &str) -> MeshResult<Option<Duration>> {
    match std::env::var(var) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(|s| Some(Duration::from_secs(s)))
            .map_err(|_| MeshError::Config(format!("{}={:?} is not a number", var, raw))),
        Err(_) => Ok(None),
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ContextFile {
    #[serde(default)]
    context: Option<String>,
}

impl MeshConfig {
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            context: DEFAULT_CONTEXT.to_string(),
            version: "latest".to_string(),
            registry: "gcr.io/triggermesh".to_string(),
            broker_image: "gcr.io/triggermesh/memory-broker:latest".to_string(),
            adapter_host: "host.docker.internal".to_string(),
            adapter_port: 8080,
            lock_timeout: Duration::from_secs(10),
            runtime_timeout: Duration::from_secs(120),
            api_domain: "triggermesh.io".to_string(),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    /// Build from defaults, environment and the persisted active context.
    pub fn from_env() -> MeshResult<Self> {
        let mut cfg = match std::env::var_os("EMESH_HOME") {
            Some(home) => Self::with_home(home),
            None => Self::default(),
        };
        if let Ok(v) = std::env::var("EMESH_VERSION") {
            cfg.version = v;
        }
        if let Ok(r) = std::env::var("EMESH_REGISTRY") {
            cfg.registry = r;
        }
        if let Some(t) = secs_from_env("EMESH_LOCK_TIMEOUT_SECS")? {
            cfg.lock_timeout = t;
        }
        if let Some(t) = secs_from_env("EMESH_RUNTIME_TIMEOUT_SECS")? {
            cfg.runtime_timeout = t;
        }
        cfg.context = match std::env::var("EMESH_CONTEXT") {
            Ok(ctx) => ctx,
            Err(_) => cfg.load_active_context()?.unwrap_or_else(|| DEFAULT_CONTEXT.to_string()),
        };
        // The context names a directory under `home`.
        crate::validate_name(&cfg.context)?;
        Ok(cfg)
    }

    pub fn context_dir(&self) -> PathBuf {
        self.home.join(&self.context)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.context_dir().join(MANIFEST_FILE)
    }

    pub fn broker_config_path(&self) -> PathBuf {
        self.context_dir().join(BROKER_CONFIG_FILE)
    }

    /// Versioned schema cache file.
    pub fn crd_path(&self) -> PathBuf {
        self.home.join("crd").join(&self.version).join("crd.yaml")
    }

    pub fn active_context_path(&self) -> PathBuf {
        self.home.join(ACTIVE_CONTEXT_FILE)
    }

    pub fn group(&self, prefix: &str) -> String {
        format!("{}.{}", prefix, self.api_domain)
    }

    pub fn load_active_context(&self) -> MeshResult<Option<String>> {
        let path = self.active_context_path();
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(MeshError::store_io(path, e)),
        };
        if raw.trim().is_empty() {
            return Ok(None);
        }
        let file: ContextFile = serde_yaml::from_str(&raw).map_err(|e| MeshError::corrupt(&path, e))?;
        Ok(file.context.filter(|c| !c.is_empty()))
    }

    pub fn save_active_context(&self, context: Option<&str>) -> MeshResult<()> {
        let path = self.active_context_path();
        std::fs::create_dir_all(&self.home).map_err(|e| MeshError::store_io(&self.home, e))?;
        let body = serde_yaml::to_string(&ContextFile { context: context.map(str::to_string) })?;
        std::fs::write(&path, body).map_err(|e| MeshError::store_io(path, e))
    }

    /// Brokers are context directories holding a manifest, sorted by name.
    pub fn list_brokers(&self) -> MeshResult<Vec<String>> {
        let entries = match std::fs::read_dir(&self.home) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(MeshError::store_io(&self.home, e)),
        };
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| MeshError::store_io(&self.home, e))?;
            let path = entry.path();
            if is_context_dir(&path) {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    out.push(name.to_string());
                }
            }
        }
        out.sort();
        Ok(out)
    }
}

fn is_context_dir(path: &Path) -> bool {
    path.is_dir() && path.join(MANIFEST_FILE).is_file()
}
