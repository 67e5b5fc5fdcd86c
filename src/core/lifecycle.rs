use super::*;

use log::debug;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::sync::oneshot;

use crate::config::HostSpec;
use crate::nodes::{NodeChannel, NodeKind, NodeStatus};
use crate::rpc::{self, RpcTarget};
use crate::shell::{check_atom, quote};
use crate::transport::{self, DEFAULT_EXEC_TIMEOUT};
use crate::views::{InspectView, NodeSummary, ProcessView};

/// Registered-process listing evaluated on the target node. One pipe-delimited
/// row per process; rows that do not match the expected `process_info` shape
/// are simply not printed.
const INSPECT_EXPR: &str = "lists:foreach(fun(RegName) -> case whereis(RegName) of \
     undefined -> ok; \
     Pid -> case erlang:process_info(Pid, [status, message_queue_len, memory, current_function]) of \
     [{status, St}, {message_queue_len, QueueLen}, {memory, Mem}, {current_function, {M, F, A}}] -> \
     io:format(\"~s|~w|~w|~w|~w:~w/~w~n\", [atom_to_list(RegName), St, QueueLen, Mem, M, F, A]); \
     _ -> ok end end end, erlang:registered())";

impl Core {
    /// Launch a named BEAM node on a host and begin probing it.
    ///
    /// The returned text carries the fully-qualified `name@shortHost`
    /// identifier; the node's status settles to `running` or `error` once the
    /// reachability probe fires.
    pub async fn start_node(
        &self,
        name: &str,
        kind: NodeKind,
        cookie: Option<&str>,
        host: Option<&str>,
    ) -> Result<String, ControlError> {
        self.guard_config()?;
        check_atom(name)?;
        let entry = self.hosts.resolve(host)?.clone();

        // Atomic exist-check-and-insert: a concurrent start under the same
        // name fails here without any SSH I/O.
        let generation = self.nodes.reserve(name, &entry.spec.label, kind).await?;

        match self.launch(&entry, name, generation, kind, cookie).await {
            Ok(target) => Ok(format!(
                "node {target} launching ({kind}); status will update after the reachability probe"
            )),
            Err(err) => {
                self.nodes.abort(name, generation).await;
                Err(err)
            }
        }
    }

    /// Close the node's channel and remove it from the registry. Closing the
    /// streamed channel terminates the remote BEAM through loss of its
    /// standard-input holder.
    pub async fn stop_node(&self, name: &str) -> Result<String, ControlError> {
        self.guard_config()?;
        let mut node = self.nodes.remove(name).await?;
        if let Some(channel) = node.channel.as_mut() {
            channel.close();
        }
        Ok(format!("node {} stopped", node.target()))
    }

    /// Stop the node and start it again under the same name with the same
    /// host, launcher, and cookie.
    pub async fn restart_node(&self, name: &str) -> Result<String, ControlError> {
        self.guard_config()?;
        let previous = self.nodes.get(name).await?;
        self.stop_node(name).await?;
        self.start_node(
            name,
            previous.kind,
            Some(&previous.cookie),
            Some(&previous.host_label),
        )
        .await
    }

    /// One row per managed node. Running nodes are asked for their process
    /// count; a transient RPC failure leaves the count `null` and does not
    /// change the node's status.
    pub async fn list_nodes(&self) -> Result<Vec<NodeSummary>, ControlError> {
        self.guard_config()?;
        let mut rows = Vec::new();
        for snapshot in self.nodes.snapshot_all().await {
            let process_count = if snapshot.status == NodeStatus::Running {
                match self.query_process_count(&snapshot).await {
                    Ok(count) => count,
                    Err(err) => {
                        debug!("process count for {} unavailable: {err}", snapshot.name);
                        None
                    }
                }
            } else {
                None
            };
            rows.push(NodeSummary {
                name: snapshot.name,
                kind: snapshot.kind,
                status: snapshot.status,
                started_at: snapshot.started_at,
                process_count,
            });
        }
        Ok(rows)
    }

    /// Registered processes of a running node, one entry per parseable row.
    pub async fn inspect_node(&self, name: &str) -> Result<InspectView, ControlError> {
        self.guard_config()?;
        let snapshot = self.nodes.require_running(name).await?;
        let (entry, session) = self.node_session(&snapshot).await?;

        let target_id = snapshot.target();
        let target = RpcTarget {
            node: &target_id,
            cookie: &snapshot.cookie,
            erl_path: &entry.spec.erl_path,
        };
        let out = rpc::rpc_raw(&session.client, &target, INSPECT_EXPR, DEFAULT_EXEC_TIMEOUT).await?;

        Ok(InspectView {
            node_name: snapshot.name.clone(),
            node_type: snapshot.kind,
            uptime: now_ms().saturating_sub(snapshot.started_at),
            processes: parse_process_rows(&out),
        })
    }

    async fn launch(
        &self,
        entry: &Arc<HostEntry>,
        name: &str,
        generation: u64,
        kind: NodeKind,
        cookie: Option<&str>,
    ) -> Result<String, ControlError> {
        let key = self.guard_config()?;
        let session = entry.session(key).await?;

        let cookie = match cookie {
            Some(cookie) if !cookie.is_empty() => cookie.to_string(),
            _ => resolve_remote_cookie(&session.client).await,
        };

        let cmd = launch_command(&entry.spec, kind, name, &cookie);
        let channel = transport::exec_stream(&session.client, &cmd).await?;

        let (close_tx, close_rx) = oneshot::channel();
        let committed = self
            .nodes
            .commit(name, generation, &session.short_host, &cookie, NodeChannel::new(close_tx))
            .await;
        // The watcher owns the channel either way; an uncommitted launch sees
        // its closer dropped and tears the stream down immediately.
        spawn_channel_watcher(self.nodes.clone(), name.to_string(), generation, channel, close_rx);
        if !committed {
            return Err(ControlError::NodeUnknown(name.to_string()));
        }

        let target = format!("{name}@{}", session.short_host);
        self.spawn_probe(entry.clone(), key.to_string(), name.to_string(), generation, target.clone(), cookie);
        Ok(target)
    }

    fn spawn_probe(
        &self,
        entry: Arc<HostEntry>,
        key: String,
        name: String,
        generation: u64,
        target: String,
        cookie: String,
    ) {
        let nodes = self.nodes.clone();
        tokio::spawn(async move {
            tokio::time::sleep(PROBE_DELAY).await;
            let reachable = match entry.session(&key).await {
                Ok(session) => {
                    let rpc_target = RpcTarget {
                        node: &target,
                        cookie: &cookie,
                        erl_path: &entry.spec.erl_path,
                    };
                    rpc::rpc_probe(&session.client, &rpc_target, DEFAULT_EXEC_TIMEOUT)
                        .await
                        .is_ok()
                }
                Err(err) => {
                    debug!("probe dial for {name} failed: {err}");
                    false
                }
            };
            nodes.resolve_probe(&name, generation, reachable).await;
        });
    }

    async fn query_process_count(
        &self,
        snapshot: &NodeSnapshot,
    ) -> Result<Option<u64>, ControlError> {
        let (entry, session) = self.node_session(snapshot).await?;
        let target_id = snapshot.target();
        let target = RpcTarget {
            node: &target_id,
            cookie: &snapshot.cookie,
            erl_path: &entry.spec.erl_path,
        };
        let out = rpc::rpc_printed(
            &session.client,
            &target,
            "erlang:system_info(process_count)",
            DEFAULT_EXEC_TIMEOUT,
        )
        .await?;
        Ok(out.trim().parse().ok())
    }
}

/// The long-running command whose channel keeps the node alive.
fn launch_command(spec: &HostSpec, kind: NodeKind, name: &str, cookie: &str) -> String {
    match kind {
        NodeKind::Erlang => format!(
            "{path}{erl} -sname {name} -setcookie {cookie} -noshell",
            path = rpc::path_prefix(&spec.erl_path),
            erl = quote(&spec.erl_path),
            cookie = quote(cookie),
        ),
        // elixir resolves its own `erl` through $PATH, hence the erl-derived
        // prefix even for the elixir launcher.
        NodeKind::Elixir => format!(
            "{path}{elixir} --sname {name} --cookie {cookie} --no-halt",
            path = rpc::path_prefix(&spec.erl_path),
            elixir = quote(&spec.elixir_path),
            cookie = quote(cookie),
        ),
    }
}

/// Cookie precedence below an explicit argument: the remote user's cookie
/// file, then the process-wide fallback.
async fn resolve_remote_cookie(client: &async_ssh2_tokio::client::Client) -> String {
    match transport::exec_simple(client, "cat ~/.erlang.cookie 2>/dev/null", DEFAULT_EXEC_TIMEOUT)
        .await
    {
        Ok(cookie) if !cookie.is_empty() => cookie,
        _ => FALLBACK_COOKIE.to_string(),
    }
}

/// Own the node's streamed channel until it closes, then flip the registry
/// entry to `stopped`. A close request (or a dropped closer) closes the
/// channel from this side first.
fn spawn_channel_watcher(
    nodes: Arc<crate::nodes::NodeRegistry>,
    name: String,
    generation: u64,
    mut channel: Channel<Msg>,
    mut close_rx: oneshot::Receiver<()>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut close_rx => {
                    let _ = channel.close().await;
                    break;
                }
                msg = channel.wait() => match msg {
                    Some(ChannelMsg::Data { .. }) | Some(ChannelMsg::ExtendedData { .. }) => {}
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        debug!("node {name} remote process exited with status {exit_status}");
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                },
            }
        }
        nodes.mark_stopped(&name, generation).await;
    });
}

/// Parse `name|status|queueLen|memory|M:F/A` rows. Lines that do not split
/// into exactly five fields with numeric counters are silently dropped.
fn parse_process_rows(out: &str) -> Vec<ProcessView> {
    out.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split('|').collect();
            if fields.len() != 5 {
                return None;
            }
            Some(ProcessView {
                name: fields[0].trim().to_string(),
                status: fields[1].trim().to_string(),
                message_queue_len: fields[2].trim().parse().ok()?,
                memory: fields[3].trim().parse().ok()?,
                current_function: fields[4].trim().to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_hosts;

    #[test]
    fn erlang_launch_command_uses_short_name_flags() {
        let spec = &parse_hosts("a:u@h:/opt/otp/bin/erl")[0];
        let cmd = launch_command(spec, NodeKind::Erlang, "w1", "secret");
        assert_eq!(
            cmd,
            "PATH='/opt/otp/bin':$PATH '/opt/otp/bin/erl' -sname w1 -setcookie 'secret' -noshell"
        );
    }

    #[test]
    fn elixir_launch_command_keeps_erl_on_path() {
        let spec = &parse_hosts("a:u@h:/opt/otp/bin/erl:/opt/elixir/bin/elixir")[0];
        let cmd = launch_command(spec, NodeKind::Elixir, "w2", "c");
        assert_eq!(
            cmd,
            "PATH='/opt/otp/bin':$PATH '/opt/elixir/bin/elixir' --sname w2 --cookie 'c' --no-halt"
        );
    }

    #[test]
    fn default_launchers_have_no_path_prefix() {
        let spec = &parse_hosts("a:u@h")[0];
        let cmd = launch_command(spec, NodeKind::Erlang, "w1", "c");
        assert_eq!(cmd, "'erl' -sname w1 -setcookie 'c' -noshell");
    }

    #[test]
    fn process_rows_drop_malformed_lines() {
        let out = "kv_store|waiting|0|2832|gen_server:loop/7\n\
                   garbage without pipes\n\
                   logger|running|3|10112|logger_server:loop/1\n\
                   short|row\n";
        let rows = parse_process_rows(out);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].name, "kv_store");
        assert_eq!(rows[0].message_queue_len, 0);
        assert_eq!(rows[1].current_function, "logger_server:loop/1");
    }

    #[test]
    fn process_rows_require_numeric_counters() {
        let rows = parse_process_rows("p|waiting|zero|2832|m:f/1\n");
        assert!(rows.is_empty());
    }

    #[test]
    fn inspect_expression_queries_the_documented_keys() {
        assert!(INSPECT_EXPR.contains("[status, message_queue_len, memory, current_function]"));
        assert!(INSPECT_EXPR.contains("erlang:registered()"));
        assert!(INSPECT_EXPR.contains("~s|~w|~w|~w|~w:~w/~w~n"));
    }
}
