//! Event mesh object store: an ordered manifest of resources persisted as multi-document YAML.

#![forbid(unsafe_code)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use emesh_core::{MeshError, MeshResult, Resource};
use metrics::{counter, histogram};
use serde::Deserialize;
use tracing::debug;

mod diff;
mod lock;

pub use diff::{diff_summary, DiffSummary};
pub use lock::StoreLock;

/// Ordered collection of resources keyed by `metadata.name`.
///
/// Insertion order survives a read/write round-trip so diffs of the file stay small.
#[derive(Debug, Clone)]
pub struct Manifest {
    path: PathBuf,
    objects: Vec<Resource>,
}

impl Manifest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), objects: Vec::new() }
    }

    /// Shorthand for `new` + `read`.
    pub fn open(path: impl Into<PathBuf>) -> MeshResult<Self> {
        let mut m = Self::new(path);
        m.read()?;
        Ok(m)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn objects(&self) -> &[Resource] {
        &self.objects
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Resource> {
        self.objects.iter().find(|o| o.name() == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Load the persisted sequence. A missing or blank file is an empty store.
    pub fn read(&mut self) -> MeshResult<()> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.objects.clear();
                return Ok(());
            }
            Err(e) => return Err(MeshError::store_io(&self.path, e)),
        };
        self.objects = parse(&self.path, &raw)?;
        debug!(path = %self.path.display(), count = self.objects.len(), "manifest read");
        Ok(())
    }

    /// Replace by name in place, or append. Returns whether the store content changed.
    pub fn upsert(&mut self, resource: Resource) -> MeshResult<bool> {
        if resource.name().is_empty() {
            return Err(MeshError::InvalidResource(format!("{} without metadata.name", resource.kind)));
        }
        match self.objects.iter().position(|o| o.name() == resource.name()) {
            Some(idx) => {
                if self.objects[idx] == resource {
                    return Ok(false);
                }
                self.objects[idx] = resource;
                // An earlier writer may have left duplicates behind; identity is the name.
                let name = self.objects[idx].name().to_string();
                let mut seen = false;
                self.objects.retain(|o| {
                    if o.name() != name {
                        return true;
                    }
                    let keep = !seen;
                    seen = true;
                    keep
                });
                Ok(true)
            }
            None => {
                self.objects.push(resource);
                Ok(true)
            }
        }
    }

    /// Remove every entry named `name`. `kind` only adds log context. Missing names are a no-op.
    pub fn remove(&mut self, name: &str, kind: &str) -> MeshResult<bool> {
        let before = self.objects.len();
        self.objects.retain(|o| o.name() != name);
        let removed = before != self.objects.len();
        if removed {
            debug!(name, kind, "manifest entry removed");
        }
        Ok(removed)
    }

    pub fn render(&self) -> MeshResult<String> {
        let mut out = String::new();
        for (i, o) in self.objects.iter().enumerate() {
            if i > 0 {
                out.push_str("---\n");
            }
            out.push_str(&serde_yaml::to_string(o)?);
        }
        Ok(out)
    }

    /// Persist the full sequence atomically (temp file + rename).
    pub fn write(&self) -> MeshResult<()> {
        let body = self.render()?;
        write_atomic(&self.path, body.as_bytes())
    }
}

fn parse(path: &Path, raw: &str) -> MeshResult<Vec<Resource>> {
    let mut out = Vec::new();
    if raw.trim().is_empty() {
        return Ok(out);
    }
    for doc in serde_yaml::Deserializer::from_str(raw) {
        let value = serde_yaml::Value::deserialize(doc).map_err(|e| MeshError::corrupt(path, e))?;
        if value.is_null() {
            continue;
        }
        let resource: Resource = serde_yaml::from_value(value).map_err(|e| MeshError::corrupt(path, e))?;
        out.push(resource);
    }
    Ok(out)
}

/// Write `bytes` to `path` through a sibling temp file so readers never observe a torn file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> MeshResult<()> {
    let started = Instant::now();
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(|e| MeshError::store_io(dir, e))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| MeshError::store_io(dir, e))?;
    tmp.write_all(bytes).map_err(|e| MeshError::store_io(tmp.path(), e))?;
    tmp.as_file().sync_all().map_err(|e| MeshError::store_io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| MeshError::store_io(path, e.error))?;
    histogram!("store_write_ms", started.elapsed().as_secs_f64() * 1000.0);
    counter!("store_write_total", 1u64);
    Ok(())
}
