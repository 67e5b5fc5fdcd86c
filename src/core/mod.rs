//! The control-plane operation surface.
//!
//! [`Core`] owns the three registries (hosts, nodes, trace pollers) and is
//! the value the outer tool-dispatch framework calls into. Operations run
//! concurrently on their own tasks; the registries take their own short
//! locks, and no lock is held across SSH I/O.
//!
//! # Main operations
//!
//! - [`Core::start_node`] / [`Core::stop_node`] / [`Core::restart_node`]
//! - [`Core::list_nodes`] / [`Core::inspect_node`]
//! - [`Core::deploy_module`]
//! - [`Core::start_genserver`] / [`Core::call_genserver`] / [`Core::stop_genserver`]
//! - [`Core::start_trace`] / [`Core::stop_trace`] / [`Core::poll_trace`]

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::Settings;
use crate::error::ControlError;
use crate::hosts::{HostEntry, HostRegistry, HostSession};
use crate::nodes::{NodeRegistry, NodeSnapshot};
use crate::trace::TraceSupervisor;

mod deploy;
mod genserver;
mod lifecycle;
mod trace_ops;

/// Cookie used when neither the caller nor the remote home directory
/// provides one.
const FALLBACK_COOKIE: &str = "beamctl_cookie";

/// Delay before the post-start reachability probe. Short-name registration is
/// not instant after process spawn; probing earlier yields spurious errors.
const PROBE_DELAY: Duration = Duration::from_secs(2);

/// The control-plane: host fleet, managed nodes, and trace pollers.
pub struct Core {
    settings: Settings,
    hosts: HostRegistry,
    nodes: Arc<NodeRegistry>,
    tracer: Arc<TraceSupervisor>,
}

impl Core {
    /// Build a core over an already-decoded configuration.
    pub fn new(settings: Settings) -> Core {
        let hosts = HostRegistry::new(settings.hosts.clone());
        Core {
            settings,
            hosts,
            nodes: Arc::new(NodeRegistry::new()),
            tracer: Arc::new(TraceSupervisor::new()),
        }
    }

    /// Build a core from the process environment.
    pub fn from_env() -> Core {
        Core::new(Settings::from_env())
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Configuration guard run by every operation before any other work: at
    /// least one host and a non-empty private key. Returns the key.
    fn guard_config(&self) -> Result<&str, ControlError> {
        if self.hosts.is_empty() {
            return Err(ControlError::ConfigMissing);
        }
        match self.settings.private_key.as_deref() {
            Some(key) if !key.is_empty() => Ok(key),
            _ => Err(ControlError::ConfigMissing),
        }
    }

    /// Resolve a host (explicit label or the configured default) and return
    /// its entry plus an authenticated session.
    async fn host_session(
        &self,
        label: Option<&str>,
    ) -> Result<(Arc<HostEntry>, HostSession), ControlError> {
        let key = self.guard_config()?;
        let entry = self.hosts.resolve(label)?.clone();
        let session = entry.session(key).await?;
        Ok((entry, session))
    }

    /// Session for the host a node snapshot lives on.
    async fn node_session(
        &self,
        snapshot: &NodeSnapshot,
    ) -> Result<(Arc<HostEntry>, HostSession), ControlError> {
        self.host_session(Some(&snapshot.host_label)).await
    }

    /// Graceful teardown: cancel the trace pollers, close every managed
    /// node's channel, then end every cached SSH client. Individual failures
    /// are ignored; nothing here fails the caller.
    ///
    /// Closing the streamed channels terminates the remote BEAMs through
    /// loss of their standard-input holder, which is the intended semantics
    /// for a control-plane restart. No stop RPCs are attempted.
    pub async fn shutdown(&self) {
        self.tracer.stop_all().await;

        for mut node in self.nodes.drain().await {
            if let Some(channel) = node.channel.as_mut() {
                channel.close();
            }
        }

        for entry in self.hosts.iter() {
            if let Some(client) = entry.take_connection().await {
                if let Err(err) = client.disconnect().await {
                    log::debug!("disconnect for host {} failed: {err}", entry.spec.label);
                }
            }
        }
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
