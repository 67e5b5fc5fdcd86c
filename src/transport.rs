//! SSH command execution primitives.
//!
//! One authenticated [`Client`] per host is shared by every concurrent
//! operation targeting that host; each call here opens its own remote session
//! so callers never serialise behind one another. A client that is mid-close
//! simply fails the call, and the host registry redials on the next request.

use std::time::Duration;

use async_ssh2_tokio::client::Client;
use russh::Channel;
use russh::client::Msg;

use crate::error::ControlError;

/// Default deadline for short remote commands.
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(10);

/// How much of a timed-out command the error message carries.
const TIMEOUT_PREFIX_CHARS: usize = 80;

/// Run `cmd` on the host, collect stdout to EOF, and return it trimmed.
///
/// The deadline is enforced by abandoning the exec session; the remote side
/// sees the channel close. Timeouts report a prefix of the offending command.
pub async fn exec_simple(
    client: &Client,
    cmd: &str,
    deadline: Duration,
) -> Result<String, ControlError> {
    match tokio::time::timeout(deadline, client.execute(cmd)).await {
        Err(_) => Err(ControlError::SshTimeout(command_prefix(cmd))),
        Ok(Err(err)) => Err(err.into()),
        Ok(Ok(result)) => Ok(result.stdout.trim().to_string()),
    }
}

/// Start `cmd` on the host and hand the open channel to the caller, who owns
/// its lifetime and must consume its close event.
pub async fn exec_stream(client: &Client, cmd: &str) -> Result<Channel<Msg>, ControlError> {
    let channel = client.get_channel().await?;
    channel.exec(true, cmd).await?;
    Ok(channel)
}

fn command_prefix(cmd: &str) -> String {
    cmd.chars().take(TIMEOUT_PREFIX_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_prefix_is_bounded() {
        let long = "x".repeat(500);
        assert_eq!(command_prefix(&long).len(), 80);
        assert_eq!(command_prefix("short"), "short");
    }

    #[test]
    fn timeout_prefix_respects_char_boundaries() {
        let cmd = "é".repeat(100);
        assert_eq!(command_prefix(&cmd).chars().count(), 80);
    }
}
