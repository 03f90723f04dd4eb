//! Node runtime spawning one local server process per node.
//!
//! Each version maps to a server binary. Nodes share one host and are told
//! apart by a port offset derived from their id, so the registry's contact
//! points and the gateway addresses line up with what the processes bind.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rollout_core::{NodeId, Version};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::NodeError;
use crate::node::{LaunchSpec, NodeInstance, NodePort, NodeRuntime, StopOutcome};

/// Configuration of the process runtime.
#[derive(Debug, Clone)]
pub struct ProcessRuntimeConfig {
    /// Server binary per version.
    pub binaries: BTreeMap<Version, PathBuf>,
    /// Host every node binds and advertises.
    pub host: String,
    /// Gateway port of node 0.
    pub gateway_base_port: u16,
    /// Internal port of node 0.
    pub internal_base_port: u16,
    /// Port distance between consecutive nodes.
    pub port_stride: u16,
    /// Environment variable receiving the node's port offset.
    pub port_offset_var: String,
    /// Whether server output is forwarded to the harness's stdout/stderr.
    pub inherit_output: bool,
}

impl Default for ProcessRuntimeConfig {
    fn default() -> Self {
        Self {
            binaries: BTreeMap::new(),
            host: "127.0.0.1".to_string(),
            gateway_base_port: 26500,
            internal_base_port: 26502,
            port_stride: 10,
            port_offset_var: "NODE_NETWORK_PORT_OFFSET".to_string(),
            inherit_output: false,
        }
    }
}

impl ProcessRuntimeConfig {
    /// Registers the server binary of `version`.
    #[must_use]
    pub fn with_binary(mut self, version: impl Into<Version>, path: impl Into<PathBuf>) -> Self {
        self.binaries.insert(version.into(), path.into());
        self
    }

    fn port_offset(&self, node: NodeId) -> u16 {
        u16::try_from(node.get())
            .unwrap_or(u16::MAX)
            .saturating_mul(self.port_stride)
    }

    fn port(&self, node: NodeId, port: NodePort) -> u16 {
        let base = match port {
            NodePort::Gateway => self.gateway_base_port,
            NodePort::Internal => self.internal_base_port,
        };
        base.saturating_add(self.port_offset(node))
    }

    fn address(&self, node: NodeId, port: NodePort) -> String {
        format!("{}:{}", self.host, self.port(node, port))
    }
}

/// Spawns server processes on the local host.
#[derive(Debug, Clone)]
pub struct ProcessRuntime {
    config: Arc<ProcessRuntimeConfig>,
}

impl ProcessRuntime {
    /// Creates a runtime.
    #[must_use]
    pub fn new(config: ProcessRuntimeConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl NodeRuntime for ProcessRuntime {
    fn address(&self, node: NodeId, port: NodePort) -> String {
        self.config.address(node, port)
    }

    fn advertised_host(&self, _node: NodeId) -> String {
        self.config.host.clone()
    }

    fn provision(&self, launch: LaunchSpec) -> Result<Box<dyn NodeInstance>, NodeError> {
        let binary = self
            .config
            .binaries
            .get(&launch.version)
            .cloned()
            .ok_or_else(|| NodeError::UnknownVersion {
                version: launch.version.clone(),
            })?;

        debug!(node = %launch.node, version = %launch.version, binary = %binary.display(), "provisioned");
        Ok(Box::new(ProcessInstance {
            launch,
            binary,
            config: Arc::clone(&self.config),
            child: None,
        }))
    }
}

/// One server process.
struct ProcessInstance {
    launch: LaunchSpec,
    binary: PathBuf,
    config: Arc<ProcessRuntimeConfig>,
    child: Option<Child>,
}

impl ProcessInstance {
    fn node(&self) -> NodeId {
        self.launch.node
    }

    fn stop_failed(&self, message: impl Into<String>) -> NodeError {
        NodeError::StopFailed {
            node: self.node(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl NodeInstance for ProcessInstance {
    async fn start(&mut self) -> Result<(), NodeError> {
        if self.child.is_some() {
            return Err(NodeError::AlreadyRunning { node: self.node() });
        }

        let (stdout, stderr) = if self.config.inherit_output {
            (Stdio::inherit(), Stdio::inherit())
        } else {
            (Stdio::null(), Stdio::null())
        };

        let child = Command::new(&self.binary)
            .envs(self.launch.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env(
                &self.config.port_offset_var,
                self.config.port_offset(self.node()).to_string(),
            )
            .current_dir(&self.launch.data_dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| NodeError::StartFailed {
                node: self.node(),
                message: format!("{}: {error}", self.binary.display()),
            })?;

        info!(node = %self.node(), pid = ?child.id(), binary = %self.binary.display(), "process spawned");
        self.child = Some(child);
        Ok(())
    }

    async fn graceful_stop(&mut self, timeout: Duration) -> Result<StopOutcome, NodeError> {
        let Some(mut child) = self.child.take() else {
            return Ok(StopOutcome::Graceful);
        };
        let Some(pid) = child.id() else {
            // Already exited and reaped.
            return Ok(StopOutcome::Graceful);
        };

        let signalled = Command::new("kill")
            .arg("-TERM")
            .arg(pid.to_string())
            .status()
            .await;
        match signalled {
            Ok(status) if status.success() => {}
            Ok(status) => warn!(node = %self.node(), pid, %status, "SIGTERM not delivered"),
            Err(error) => {
                self.child = Some(child);
                return Err(self.stop_failed(format!("cannot run kill: {error}")));
            }
        }

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(node = %self.node(), pid, %status, "process exited");
                Ok(StopOutcome::Graceful)
            }
            Ok(Err(error)) => Err(self.stop_failed(error.to_string())),
            Err(_) => {
                warn!(node = %self.node(), pid, ?timeout, "process ignored SIGTERM, killing");
                child
                    .kill()
                    .await
                    .map_err(|error| self.stop_failed(error.to_string()))?;
                Ok(StopOutcome::Forced)
            }
        }
    }

    async fn force_stop(&mut self) -> Result<(), NodeError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        if child.try_wait().ok().flatten().is_some() {
            return Ok(());
        }
        child
            .kill()
            .await
            .map_err(|error| self.stop_failed(error.to_string()))
    }

    fn external_address(&self, port: NodePort) -> String {
        self.config.address(self.node(), port)
    }
}
