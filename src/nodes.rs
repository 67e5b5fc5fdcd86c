//! Managed-node registry and state machine.
//!
//! Each launched BEAM node is tracked here and driven through
//! `starting -> running | error -> stopped`. Probe results and channel-close
//! events arrive from background tasks, so every mutation is keyed on the
//! node's launch generation: a callback for a node that was stopped (or
//! stopped and relaunched under the same name) finds a missing entry or a
//! stale generation and is discarded.
//!
//! The registry lock guards point lookups and status updates only; no I/O
//! happens while it is held.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, oneshot};

use crate::error::ControlError;

/// Which launcher a managed node was started with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Erlang,
    Elixir,
}

impl NodeKind {
    /// Parse the wire form used by the operation surface.
    pub fn parse(s: &str) -> Option<NodeKind> {
        match s {
            "erlang" => Some(NodeKind::Erlang),
            "elixir" => Some(NodeKind::Elixir),
            _ => None,
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Erlang => f.write_str("erlang"),
            NodeKind::Elixir => f.write_str("elixir"),
        }
    }
}

/// Lifecycle state of a managed node.
///
/// `Starting` and `Running` imply the streamed channel has not been observed
/// closed. `Error` and `Stopped` are terminal; the entry leaves the registry
/// on explicit stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Starting,
    Running,
    Error,
    Stopped,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Starting => f.write_str("starting"),
            NodeStatus::Running => f.write_str("running"),
            NodeStatus::Error => f.write_str("error"),
            NodeStatus::Stopped => f.write_str("stopped"),
        }
    }
}

/// Handle to the long-running remote stream keeping a node alive.
///
/// The stream itself is owned by a reader task; this handle can only ask that
/// task to close the channel. Dropping the handle has the same effect as
/// closing it.
#[derive(Debug)]
pub struct NodeChannel {
    closer: Option<oneshot::Sender<()>>,
}

impl NodeChannel {
    pub fn new(closer: oneshot::Sender<()>) -> NodeChannel {
        NodeChannel { closer: Some(closer) }
    }

    /// Ask the owning task to close the remote channel. Idempotent.
    pub fn close(&mut self) {
        if let Some(closer) = self.closer.take() {
            let _ = closer.send(());
        }
    }

    #[cfg(test)]
    pub(crate) fn detached() -> NodeChannel {
        NodeChannel { closer: None }
    }
}

/// One tracked BEAM node.
#[derive(Debug)]
pub struct ManagedNode {
    pub name: String,
    pub host_label: String,
    /// Snapshot of the host's short hostname at launch time.
    pub remote_short_host: String,
    pub kind: NodeKind,
    pub cookie: String,
    /// Wall-clock launch time, epoch milliseconds.
    pub started_at: u64,
    pub status: NodeStatus,
    /// Distinguishes this launch from earlier launches under the same name.
    pub generation: u64,
    pub(crate) channel: Option<NodeChannel>,
}

impl ManagedNode {
    /// Fully-qualified distribution identifier, `name@shortHost`.
    pub fn target(&self) -> String {
        format!("{}@{}", self.name, self.remote_short_host)
    }

    fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            name: self.name.clone(),
            host_label: self.host_label.clone(),
            remote_short_host: self.remote_short_host.clone(),
            kind: self.kind,
            cookie: self.cookie.clone(),
            started_at: self.started_at,
            status: self.status,
            generation: self.generation,
        }
    }
}

/// Copyable view of one registry entry, taken under the lock and used by
/// operations after the lock is released.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub name: String,
    pub host_label: String,
    pub remote_short_host: String,
    pub kind: NodeKind,
    pub cookie: String,
    pub started_at: u64,
    pub status: NodeStatus,
    pub generation: u64,
}

impl NodeSnapshot {
    pub fn target(&self) -> String {
        format!("{}@{}", self.name, self.remote_short_host)
    }
}

/// Registry of managed nodes, shared across operations and callback tasks.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: Mutex<HashMap<String, ManagedNode>>,
    generation: AtomicU64,
}

impl NodeRegistry {
    pub fn new() -> NodeRegistry {
        NodeRegistry::default()
    }

    /// Atomically check the name and insert a `starting` entry for it.
    ///
    /// Returns the launch generation on success. The entry has no channel yet;
    /// [`commit`](Self::commit) fills it in once the remote stream is up, and
    /// [`abort`](Self::abort) removes it if the launch fails first.
    pub async fn reserve(
        &self,
        name: &str,
        host_label: &str,
        kind: NodeKind,
    ) -> Result<u64, ControlError> {
        let mut nodes = self.nodes.lock().await;
        if nodes.contains_key(name) {
            return Err(ControlError::NameTaken(name.to_string()));
        }
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        nodes.insert(
            name.to_string(),
            ManagedNode {
                name: name.to_string(),
                host_label: host_label.to_string(),
                remote_short_host: String::new(),
                kind,
                cookie: String::new(),
                started_at: 0,
                status: NodeStatus::Starting,
                generation,
                channel: None,
            },
        );
        Ok(generation)
    }

    /// Attach launch results to a reserved entry.
    ///
    /// Returns `false` when the entry was removed (or replaced) while the
    /// launch was in flight; the caller must then close the channel itself.
    pub async fn commit(
        &self,
        name: &str,
        generation: u64,
        remote_short_host: &str,
        cookie: &str,
        channel: NodeChannel,
    ) -> bool {
        let mut nodes = self.nodes.lock().await;
        match nodes.get_mut(name) {
            Some(node) if node.generation == generation && node.status == NodeStatus::Starting => {
                node.remote_short_host = remote_short_host.to_string();
                node.cookie = cookie.to_string();
                node.started_at = now_ms();
                node.channel = Some(channel);
                true
            }
            _ => false,
        }
    }

    /// Remove a reservation after a failed launch. Generation-guarded so a
    /// concurrent stop-and-restart under the same name is left alone.
    pub async fn abort(&self, name: &str, generation: u64) {
        let mut nodes = self.nodes.lock().await;
        if nodes.get(name).is_some_and(|n| n.generation == generation) {
            nodes.remove(name);
        }
    }

    /// Remove an entry, returning it so the caller can close its channel
    /// outside the lock.
    pub async fn remove(&self, name: &str) -> Result<ManagedNode, ControlError> {
        let mut nodes = self.nodes.lock().await;
        nodes
            .remove(name)
            .ok_or_else(|| ControlError::NodeUnknown(name.to_string()))
    }

    /// React to the remote channel closing. Flips the status to `stopped`
    /// exactly once; stale generations and repeated closes are no-ops.
    pub async fn mark_stopped(&self, name: &str, generation: u64) -> bool {
        let mut nodes = self.nodes.lock().await;
        match nodes.get_mut(name) {
            Some(node) if node.generation == generation && node.status != NodeStatus::Stopped => {
                debug!("node {name} channel closed, marking stopped");
                node.status = NodeStatus::Stopped;
                node.channel = None;
                true
            }
            _ => false,
        }
    }

    /// Apply the start-probe outcome. Only a still-`starting` entry of the
    /// same generation moves; anything else (stopped, restarted, removed)
    /// discards the result.
    pub async fn resolve_probe(&self, name: &str, generation: u64, reachable: bool) {
        let mut nodes = self.nodes.lock().await;
        if let Some(node) = nodes.get_mut(name)
            && node.generation == generation
            && node.status == NodeStatus::Starting
        {
            node.status = if reachable { NodeStatus::Running } else { NodeStatus::Error };
            debug!("node {name} probe resolved: {}", node.status);
        }
    }

    /// Snapshot an entry for an operation that requires `running` status.
    pub async fn require_running(&self, name: &str) -> Result<NodeSnapshot, ControlError> {
        let nodes = self.nodes.lock().await;
        let node = nodes
            .get(name)
            .ok_or_else(|| ControlError::NodeUnknown(name.to_string()))?;
        if node.status != NodeStatus::Running {
            return Err(ControlError::NodeBadState {
                name: name.to_string(),
                status: node.status,
            });
        }
        Ok(node.snapshot())
    }

    /// Snapshot an entry regardless of status (restart needs the original
    /// launch configuration).
    pub async fn get(&self, name: &str) -> Result<NodeSnapshot, ControlError> {
        let nodes = self.nodes.lock().await;
        nodes
            .get(name)
            .map(|n| n.snapshot())
            .ok_or_else(|| ControlError::NodeUnknown(name.to_string()))
    }

    /// Snapshot every entry, ordered by name for stable view payloads.
    pub async fn snapshot_all(&self) -> Vec<NodeSnapshot> {
        let nodes = self.nodes.lock().await;
        let mut all: Vec<NodeSnapshot> = nodes.values().map(ManagedNode::snapshot).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Remove and return every entry. Used by the shutdown coordinator.
    pub async fn drain(&self) -> Vec<ManagedNode> {
        let mut nodes = self.nodes.lock().await;
        nodes.drain().map(|(_, node)| node).collect()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn committed(registry: &NodeRegistry, name: &str) -> u64 {
        let generation = registry.reserve(name, "a", NodeKind::Erlang).await.unwrap();
        assert!(
            registry
                .commit(name, generation, "host1", "cookie", NodeChannel::detached())
                .await
        );
        generation
    }

    #[tokio::test]
    async fn duplicate_reservation_is_rejected() {
        let registry = NodeRegistry::new();
        registry.reserve("w1", "a", NodeKind::Erlang).await.unwrap();
        assert!(matches!(
            registry.reserve("w1", "a", NodeKind::Erlang).await,
            Err(ControlError::NameTaken(_))
        ));
    }

    #[tokio::test]
    async fn aborted_reservation_frees_the_name() {
        let registry = NodeRegistry::new();
        let generation = registry.reserve("w1", "a", NodeKind::Erlang).await.unwrap();
        registry.abort("w1", generation).await;
        assert!(registry.reserve("w1", "a", NodeKind::Erlang).await.is_ok());
    }

    #[tokio::test]
    async fn probe_moves_starting_to_running_or_error() {
        let registry = NodeRegistry::new();
        let g1 = committed(&registry, "w1").await;
        registry.resolve_probe("w1", g1, true).await;
        assert_eq!(registry.get("w1").await.unwrap().status, NodeStatus::Running);

        let g2 = committed(&registry, "w2").await;
        registry.resolve_probe("w2", g2, false).await;
        assert_eq!(registry.get("w2").await.unwrap().status, NodeStatus::Error);
    }

    #[tokio::test]
    async fn channel_close_flips_status_exactly_once() {
        let registry = NodeRegistry::new();
        let generation = committed(&registry, "w1").await;
        registry.resolve_probe("w1", generation, true).await;

        assert!(registry.mark_stopped("w1", generation).await);
        assert!(!registry.mark_stopped("w1", generation).await);
        assert_eq!(registry.get("w1").await.unwrap().status, NodeStatus::Stopped);
    }

    #[tokio::test]
    async fn probe_after_stop_is_discarded() {
        let registry = NodeRegistry::new();
        let generation = committed(&registry, "w1").await;
        registry.mark_stopped("w1", generation).await;
        registry.resolve_probe("w1", generation, true).await;
        assert_eq!(registry.get("w1").await.unwrap().status, NodeStatus::Stopped);
    }

    #[tokio::test]
    async fn stale_generation_callbacks_do_not_touch_a_relaunch() {
        let registry = NodeRegistry::new();
        let g1 = committed(&registry, "w1").await;
        registry.remove("w1").await.unwrap();
        let g2 = committed(&registry, "w1").await;

        // Callbacks from the first launch arrive late.
        registry.mark_stopped("w1", g1).await;
        registry.resolve_probe("w1", g1, false).await;

        let node = registry.get("w1").await.unwrap();
        assert_eq!(node.generation, g2);
        assert_eq!(node.status, NodeStatus::Starting);
    }

    #[tokio::test]
    async fn stop_frees_the_name_immediately() {
        let registry = NodeRegistry::new();
        committed(&registry, "w1").await;
        registry.remove("w1").await.unwrap();
        assert!(registry.reserve("w1", "a", NodeKind::Erlang).await.is_ok());
    }

    #[tokio::test]
    async fn second_remove_reports_unknown_node() {
        let registry = NodeRegistry::new();
        committed(&registry, "w1").await;
        registry.remove("w1").await.unwrap();
        assert!(matches!(
            registry.remove("w1").await,
            Err(ControlError::NodeUnknown(_))
        ));
    }

    #[tokio::test]
    async fn operations_on_non_running_nodes_see_bad_state() {
        let registry = NodeRegistry::new();
        committed(&registry, "w1").await;
        assert!(matches!(
            registry.require_running("w1").await,
            Err(ControlError::NodeBadState { status: NodeStatus::Starting, .. })
        ));
        assert!(matches!(
            registry.require_running("missing").await,
            Err(ControlError::NodeUnknown(_))
        ));
    }

    #[tokio::test]
    async fn commit_after_removal_reports_failure() {
        let registry = NodeRegistry::new();
        let generation = registry.reserve("w1", "a", NodeKind::Erlang).await.unwrap();
        registry.abort("w1", generation).await;
        assert!(
            !registry
                .commit("w1", generation, "host1", "cookie", NodeChannel::detached())
                .await
        );
    }

    #[tokio::test]
    async fn target_joins_name_and_short_host() {
        let registry = NodeRegistry::new();
        committed(&registry, "w1").await;
        assert_eq!(registry.get("w1").await.unwrap().target(), "w1@host1");
    }
}
