//! Runtime backed by the `docker` command line.

use std::collections::BTreeMap;
use std::process::Output;
use std::time::Duration;

use emesh_core::{MeshError, MeshResult};
use tokio::process::Command;
use tracing::{debug, info};

use crate::{ContainerRuntime, ContainerSpec, InstanceState, InstanceStatus, FINGERPRINT_LABEL};

#[derive(Debug, Clone)]
pub struct DockerCli {
    bin: String,
    /// Address published ports bind to.
    bind: String,
    /// Upper bound for one CLI call; a hung daemon fails the call instead of the whole batch.
    timeout: Duration,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self { bin: "docker".to_string(), bind: "127.0.0.1".to_string(), timeout: Duration::from_secs(120) }
    }
}

fn stderr_of(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).trim().to_string()
}

fn is_missing(stderr: &str) -> bool {
    stderr.contains("No such container") || stderr.contains("No such object")
}

/// `<state>|<fingerprint label>|<exposed ports>` for one container.
fn inspect_format() -> String {
    let label = format!("{{{{index .Config.Labels {:?}}}}}", FINGERPRINT_LABEL);
    ["{{.State.Status}}", label.as_str(), "{{range $p, $b := .NetworkSettings.Ports}}{{$p}} {{end}}"].join("|")
}

struct Inspected<'a> {
    state: &'a str,
    fingerprint: Option<&'a str>,
    /// First exposed container port; the adapter port.
    exposed: Option<u16>,
}

fn parse_inspect(stdout: &str) -> Inspected<'_> {
    let mut parts = stdout.trim().splitn(3, '|');
    let state = parts.next().unwrap_or("").trim();
    let fingerprint = parts.next().map(str::trim).filter(|f| !f.is_empty() && *f != "<no value>");
    // `8080/tcp` -> 8080
    let exposed = parts
        .next()
        .and_then(|p| p.split_whitespace().next())
        .and_then(|p| p.split('/').next())
        .and_then(|p| p.parse::<u16>().ok());
    Inspected { state, fingerprint, exposed }
}

/// `docker port` prints `127.0.0.1:49153` (one line per binding; IPv6 as `[::]:49153`).
fn parse_port(stdout: &str) -> Option<u16> {
    stdout.lines().filter_map(|l| l.trim().rsplit_once(':')).find_map(|(_, p)| p.trim().parse().ok())
}

impl DockerCli {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into(), ..Self::default() }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, args: &[String]) -> std::io::Result<Output> {
        self.run_with_env(args, &BTreeMap::new()).await
    }

    /// Values in `env` reach the CLI through its environment, never its arguments.
    async fn run_with_env(&self, args: &[String], env: &BTreeMap<String, String>) -> std::io::Result<Output> {
        debug!(bin = %self.bin, args = ?args, env = env.len(), "docker");
        let call = Command::new(&self.bin).args(args).envs(env).kill_on_drop(true).output();
        match tokio::time::timeout(self.timeout, call).await {
            Ok(out) => out,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("{} {} timed out after {:?}", self.bin, args.first().map(String::as_str).unwrap_or(""), self.timeout),
            )),
        }
    }

    fn run_args(&self, spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            spec.name.clone(),
            "-p".to_string(),
            format!("{}::{}", self.bind, spec.port),
        ];
        // `-e KEY` copies the value from the CLI's own environment.
        for k in spec.env.keys() {
            args.push("-e".to_string());
            args.push(k.clone());
        }
        for (k, v) in &spec.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", k, v));
        }
        args.push("--label".to_string());
        args.push(format!("{}={}", FINGERPRINT_LABEL, spec.fingerprint()));
        for m in &spec.mounts {
            args.push("-v".to_string());
            let ro = if m.read_only { ":ro" } else { "" };
            args.push(format!("{}:{}{}", m.host.display(), m.container, ro));
        }
        args.push(spec.image.clone());
        args
    }

    async fn host_port(&self, name: &str, port: u16) -> MeshResult<Option<u16>> {
        let out = self
            .run(&["port".to_string(), name.to_string(), format!("{}/tcp", port)])
            .await
            .map_err(|e| MeshError::RuntimeQuery { component: name.to_string(), reason: e.to_string() })?;
        if !out.status.success() {
            return Ok(None);
        }
        Ok(parse_port(&String::from_utf8_lossy(&out.stdout)))
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for DockerCli {
    async fn start(&self, spec: &ContainerSpec) -> MeshResult<u16> {
        let fail = |reason: String| MeshError::RuntimeStart { component: spec.name.clone(), reason };
        info!(component = %spec.name, image = %spec.image, "starting instance");
        let out = self.run_with_env(&self.run_args(spec), &spec.env).await.map_err(|e| fail(e.to_string()))?;
        if !out.status.success() {
            return Err(fail(stderr_of(&out)));
        }
        match self.host_port(&spec.name, spec.port).await? {
            Some(port) => Ok(port),
            None => Err(fail(format!("no host port published for {}/tcp", spec.port))),
        }
    }

    async fn stop(&self, name: &str) -> MeshResult<bool> {
        let out = self
            .run(&["rm".to_string(), "-f".to_string(), name.to_string()])
            .await
            .map_err(|e| MeshError::RuntimeStop { component: name.to_string(), reason: e.to_string() })?;
        if out.status.success() {
            info!(component = %name, "instance removed");
            return Ok(true);
        }
        let err = stderr_of(&out);
        if is_missing(&err) {
            return Ok(false);
        }
        Err(MeshError::RuntimeStop { component: name.to_string(), reason: err })
    }

    async fn status(&self, name: &str) -> MeshResult<InstanceStatus> {
        let query = |reason: String| MeshError::RuntimeQuery { component: name.to_string(), reason };
        let out = self
            .run(&["inspect".to_string(), "-f".to_string(), inspect_format(), name.to_string()])
            .await
            .map_err(|e| query(e.to_string()))?;
        if !out.status.success() {
            let err = stderr_of(&out);
            if is_missing(&err) {
                return Ok(InstanceStatus::absent());
            }
            return Err(query(err));
        }
        let stdout = String::from_utf8_lossy(&out.stdout).to_string();
        let inspected = parse_inspect(&stdout);
        let fingerprint = inspected.fingerprint.map(str::to_string);
        if inspected.state != "running" {
            return Ok(InstanceStatus { state: InstanceState::Stopped, host_port: None, fingerprint });
        }
        let host_port = match inspected.exposed {
            Some(port) => self.host_port(name, port).await?,
            None => None,
        };
        Ok(InstanceStatus { state: InstanceState::Running, host_port, fingerprint })
    }
}
