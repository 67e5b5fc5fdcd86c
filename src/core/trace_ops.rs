use super::*;

use log::warn;

use crate::nodes::NodeStatus;
use crate::rpc::{self, RpcTarget};
use crate::trace::parse_trace_window;
use crate::transport::DEFAULT_EXEC_TIMEOUT;
use crate::views::TraceView;

/// Registers the message-trace agent on the target node: a process named
/// `mcp_trace_agent` that traces `send` events and accumulates per-pair
/// counts until the next flush.
const TRACE_START_EXPR: &str = "case whereis(mcp_trace_agent) of \
     Existing when is_pid(Existing) -> already_started; \
     undefined -> Agent = spawn(fun() -> \
     register(mcp_trace_agent, self()), \
     erlang:trace(all, true, [send]), \
     Label = fun(P) -> case is_pid(P) andalso erlang:process_info(P, registered_name) of \
     {registered_name, RegName} -> atom_to_list(RegName); \
     _ -> lists:flatten(io_lib:format(\"~w\", [P])) end end, \
     Loop = fun Self(Acc) -> receive \
     {trace, From, send, _Msg, To} -> Self(maps:update_with({Label(From), Label(To)}, fun(N) -> N + 1 end, 1, Acc)); \
     {flush, Caller} -> Caller ! {trace_window, maps:to_list(Acc)}, Self(#{}); \
     stop -> erlang:trace(all, false, [send]), ok end end, \
     Loop(#{}) end), {ok, Agent} end";

/// Drains the agent's window since the previous flush and prints one
/// `from|to|count` row per edge.
const TRACE_POLL_EXPR: &str = "case whereis(mcp_trace_agent) of \
     undefined -> io:format(\"error:no_trace~n\"); \
     Agent -> Agent ! {flush, self()}, \
     receive {trace_window, Edges} -> \
     lists:foreach(fun({{From, To}, Count}) -> io:format(\"~s|~s|~w~n\", [From, To, Count]) end, Edges) \
     after 2000 -> io:format(\"error:trace_poll_timeout~n\") end end";

/// Unregisters the agent; tracing is switched off on its way out.
const TRACE_STOP_EXPR: &str =
    "case whereis(mcp_trace_agent) of undefined -> ok; Agent -> Agent ! stop, ok end";

impl Core {
    /// Register the trace agent on a running node and spawn its poller.
    pub async fn start_trace(&self, name: &str) -> Result<String, ControlError> {
        self.guard_config()?;
        let snapshot = self.nodes.require_running(name).await?;
        let (entry, session) = self.node_session(&snapshot).await?;

        let target_id = snapshot.target();
        let target = RpcTarget {
            node: &target_id,
            cookie: &snapshot.cookie,
            erl_path: &entry.spec.erl_path,
        };
        rpc::rpc_printed(&session.client, &target, TRACE_START_EXPR, DEFAULT_EXEC_TIMEOUT).await?;

        let key = self.guard_config()?.to_string();
        let cookie = snapshot.cookie.clone();
        let fetch = move || {
            let entry = entry.clone();
            let key = key.clone();
            let target_id = target_id.clone();
            let cookie = cookie.clone();
            async move {
                let session = entry.session(&key).await?;
                let target = RpcTarget {
                    node: &target_id,
                    cookie: &cookie,
                    erl_path: &entry.spec.erl_path,
                };
                let out =
                    rpc::rpc_raw(&session.client, &target, TRACE_POLL_EXPR, DEFAULT_EXEC_TIMEOUT)
                        .await?;
                Ok(parse_trace_window(&out))
            }
        };

        if self.tracer.start(name, fetch).await {
            Ok(format!("tracing started for {name}"))
        } else {
            Ok(format!("tracing already active for {name}"))
        }
    }

    /// Unregister the remote agent (best effort), cancel the poller, and drop
    /// its edge view.
    pub async fn stop_trace(&self, name: &str) -> Result<String, ControlError> {
        self.guard_config()?;
        let node = self.nodes.get(name).await;

        if let Ok(snapshot) = &node {
            if snapshot.status == NodeStatus::Running {
                match self.node_session(snapshot).await {
                    Ok((entry, session)) => {
                        let target_id = snapshot.target();
                        let target = RpcTarget {
                            node: &target_id,
                            cookie: &snapshot.cookie,
                            erl_path: &entry.spec.erl_path,
                        };
                        if let Err(err) = rpc::rpc_printed(
                            &session.client,
                            &target,
                            TRACE_STOP_EXPR,
                            DEFAULT_EXEC_TIMEOUT,
                        )
                        .await
                        {
                            warn!("remote trace unregister for {name} failed: {err}");
                        }
                    }
                    Err(err) => warn!("remote trace unregister for {name} skipped: {err}"),
                }
            }
        }

        let had_poller = self.tracer.stop(name).await;
        if !had_poller {
            node?;
        }
        Ok(format!("tracing stopped for {name}"))
    }

    /// The most recent poll window for the node, or an inactive view when
    /// tracing is off.
    pub async fn poll_trace(&self, name: &str) -> Result<TraceView, ControlError> {
        self.guard_config()?;
        match self.tracer.window(name).await {
            Some(edges) => Ok(TraceView { active: true, edges }),
            None => {
                self.nodes.get(name).await?;
                Ok(TraceView { active: false, edges: Vec::new() })
            }
        }
    }
}
