//! Error types for the control-plane operation surface.
//!
//! Every operation reports failures through [`ControlError`]. Nothing in this
//! taxonomy is fatal to the process; the outer framework renders the error as
//! a one-line `{err: reason}` value.

use thiserror::Error;

use crate::nodes::NodeStatus;

/// Errors surfaced by control-plane operations.
#[derive(Error, Debug)]
pub enum ControlError {
    /// No hosts or no private key configured; no operation can proceed.
    #[error("no SSH hosts or private key configured")]
    ConfigMissing,

    /// The requested host label is not in the configured host list.
    #[error("unknown host: {0}")]
    UnknownHost(String),

    /// Dialing or authenticating the SSH connection failed.
    #[error("ssh dial failed: {0}")]
    SshDial(String),

    /// A remote command did not finish within its deadline. Carries a prefix
    /// of the offending command.
    #[error("ssh command timed out: {0}")]
    SshTimeout(String),

    /// Opening a remote session or starting the remote command failed.
    #[error("ssh exec failed: {0}")]
    SshSpawn(String),

    /// The bootstrap node could not ping the target over BEAM distribution.
    #[error("node unreachable over distribution")]
    NodeUnreachable,

    /// No managed node with that name exists.
    #[error("unknown node: {0}")]
    NodeUnknown(String),

    /// The node exists but is in the wrong state for the requested operation.
    #[error("node {name} is {status}, operation requires a running node")]
    NodeBadState { name: String, status: NodeStatus },

    /// A managed node with that name already exists.
    #[error("node name already in use: {0}")]
    NameTaken(String),

    /// A caller-supplied atom name failed validation; nothing was sent to the
    /// remote.
    #[error("invalid atom name: {0:?}")]
    BadAtomName(String),

    /// The remote evaluation returned an error term. Carries the rendered
    /// term text.
    #[error("remote evaluation failed: {0}")]
    RemoteEval(String),
}

impl ControlError {
    /// Stable machine-readable token for each variant, used by the outer
    /// framework when shaping `{err: reason}` payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlError::ConfigMissing => "config_missing",
            ControlError::UnknownHost(_) => "unknown_host",
            ControlError::SshDial(_) => "ssh_dial",
            ControlError::SshTimeout(_) => "ssh_timeout",
            ControlError::SshSpawn(_) => "ssh_spawn",
            ControlError::NodeUnreachable => "node_unreachable",
            ControlError::NodeUnknown(_) => "node_unknown",
            ControlError::NodeBadState { .. } => "node_bad_state",
            ControlError::NameTaken(_) => "name_taken",
            ControlError::BadAtomName(_) => "bad_atom_name",
            ControlError::RemoteEval(_) => "remote_eval",
        }
    }
}

impl From<async_ssh2_tokio::Error> for ControlError {
    fn from(err: async_ssh2_tokio::Error) -> Self {
        ControlError::SshSpawn(err.to_string())
    }
}

impl From<russh::Error> for ControlError {
    fn from(err: russh::Error) -> Self {
        ControlError::SshSpawn(err.to_string())
    }
}
