use super::*;

use crate::nodes::NodeSnapshot as Snapshot;
use crate::rpc::{self, RpcTarget};
use crate::shell::check_atom;
use crate::transport::DEFAULT_EXEC_TIMEOUT;

/// Bounds and default for the gen_server call timeout, milliseconds.
const CALL_TIMEOUT_MIN_MS: u64 = 1;
const CALL_TIMEOUT_MAX_MS: u64 = 60_000;
const CALL_TIMEOUT_DEFAULT_MS: u64 = 5_000;

impl Core {
    /// Start a generic server process on a running node, optionally under a
    /// `{local, Name}` registration.
    ///
    /// Uses `gen_server:start`, not `start_link`, so the ephemeral bootstrap's
    /// exit does not take the new server down with it. `args` is Erlang-term
    /// source, defaulting to `[]`.
    pub async fn start_genserver(
        &self,
        name: &str,
        module: &str,
        args: Option<&str>,
        register_as: Option<&str>,
    ) -> Result<String, ControlError> {
        self.guard_config()?;
        check_atom(module)?;
        if let Some(registered) = register_as {
            check_atom(registered)?;
        }
        let snapshot = self.nodes.require_running(name).await?;

        let args = match args {
            Some(args) if !args.trim().is_empty() => args,
            _ => "[]",
        };
        let expr = start_expr(module, args, register_as);
        self.eval_printed(&snapshot, &expr, DEFAULT_EXEC_TIMEOUT).await
    }

    /// Synchronous call against a registered server on a running node.
    ///
    /// `message` is Erlang-term source passed through verbatim. The SSH
    /// deadline always exceeds the callee's own timeout so the transport
    /// never terminates the call before `gen_server` does.
    pub async fn call_genserver(
        &self,
        name: &str,
        server: &str,
        message: &str,
        timeout_ms: Option<u64>,
    ) -> Result<String, ControlError> {
        self.guard_config()?;
        check_atom(server)?;
        let snapshot = self.nodes.require_running(name).await?;

        let call_timeout = timeout_ms
            .unwrap_or(CALL_TIMEOUT_DEFAULT_MS)
            .clamp(CALL_TIMEOUT_MIN_MS, CALL_TIMEOUT_MAX_MS);
        let expr = format!("gen_server:call({server}, {message}, {call_timeout})");
        self.eval_printed(&snapshot, &expr, ssh_deadline_for_call(call_timeout)).await
    }

    /// Stop a registered server with reason `normal` and a five second grace
    /// period.
    pub async fn stop_genserver(&self, name: &str, server: &str) -> Result<String, ControlError> {
        self.guard_config()?;
        check_atom(server)?;
        let snapshot = self.nodes.require_running(name).await?;

        let expr = format!("gen_server:stop({server}, normal, 5000)");
        self.eval_printed(&snapshot, &expr, DEFAULT_EXEC_TIMEOUT).await
    }

    async fn eval_printed(
        &self,
        snapshot: &Snapshot,
        expr: &str,
        deadline: Duration,
    ) -> Result<String, ControlError> {
        let (entry, session) = self.node_session(snapshot).await?;
        let target_id = snapshot.target();
        let target = RpcTarget {
            node: &target_id,
            cookie: &snapshot.cookie,
            erl_path: &entry.spec.erl_path,
        };
        rpc::rpc_printed(&session.client, &target, expr, deadline).await
    }
}

fn start_expr(module: &str, args: &str, register_as: Option<&str>) -> String {
    match register_as {
        Some(registered) => format!(
            "case gen_server:start({{local, {registered}}}, {module}, {args}, []) of \
             {{ok, Pid}} -> {{ok, Pid, {registered}}}; Other -> Other end"
        ),
        None => format!("gen_server:start({module}, {args}, [])"),
    }
}

/// `max(callTimeout + 5 s, 10 s)`, in milliseconds.
fn ssh_deadline_for_call(call_timeout_ms: u64) -> Duration {
    Duration::from_millis((call_timeout_ms + 5_000).max(10_000))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_start_is_a_plain_call() {
        assert_eq!(
            start_expr("kv_store", "[]", None),
            "gen_server:start(kv_store, [], [])"
        );
    }

    #[test]
    fn registered_start_reports_the_name() {
        let expr = start_expr("kv_store", "[{capacity, 10}]", Some("kv"));
        assert_eq!(
            expr,
            "case gen_server:start({local, kv}, kv_store, [{capacity, 10}], []) of \
             {ok, Pid} -> {ok, Pid, kv}; Other -> Other end"
        );
    }

    #[test]
    fn ssh_deadline_never_undercuts_the_call_timeout() {
        assert_eq!(ssh_deadline_for_call(1), Duration::from_millis(10_000));
        assert_eq!(ssh_deadline_for_call(5_000), Duration::from_millis(10_000));
        assert_eq!(ssh_deadline_for_call(8_000), Duration::from_millis(13_000));
        assert_eq!(ssh_deadline_for_call(60_000), Duration::from_millis(65_000));
    }
}
