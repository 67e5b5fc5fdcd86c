//! Remote evaluation against managed BEAM nodes.
//!
//! The control-plane has no BEAM runtime of its own, so every remote
//! evaluation synthesises an ephemeral bootstrap node on the target's host:
//! a freshly-named `erl -noshell` process that pings the target over
//! distribution, performs one `rpc:call`, prints the outcome, and exits.
//! Nothing is installed on the target, and a target crash cannot corrupt the
//! control-plane.
//!
//! Expression text is taken verbatim from the caller; atom names inside it
//! were validated at the operation layer before reaching this module.

use std::time::Duration;

use async_ssh2_tokio::client::Client;
use rand::Rng;

use crate::error::ControlError;
use crate::shell::quote;
use crate::transport;

/// Short-name prefix of evaluation bootstrap nodes.
const EVAL_PREFIX: &str = "mcptmp";
/// Short-name prefix of start-probe bootstrap nodes.
const PROBE_PREFIX: &str = "mcpchk";

/// Printed by the bootstrap when the target does not answer the ping.
const UNREACHABLE_SENTINEL: &str = "error:node_unreachable";
/// Printed by the raw bootstrap when `rpc:call` itself fails.
const BADRPC_SENTINEL: &str = "error:badrpc";

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Everything needed to address one managed node over distribution.
pub struct RpcTarget<'a> {
    /// Fully-qualified identifier, `name@shortHost`.
    pub node: &'a str,
    pub cookie: &'a str,
    /// The host's `erl` launcher; its directory is prepended to `$PATH`.
    pub erl_path: &'a str,
}

/// Evaluate `expr` on the target and return the pretty-printed result term.
pub async fn rpc_printed(
    client: &Client,
    target: &RpcTarget<'_>,
    expr: &str,
    deadline: Duration,
) -> Result<String, ControlError> {
    let eval = eval_printed(target.node, expr);
    let cmd = bootstrap_command(target, &boot_name(EVAL_PREFIX), &eval);
    classify(transport::exec_simple(client, &cmd, deadline).await?)
}

/// Fire `expr` on the target for its side effects and return whatever the
/// bootstrap printed; the expression controls its own output formatting.
pub async fn rpc_raw(
    client: &Client,
    target: &RpcTarget<'_>,
    expr: &str,
    deadline: Duration,
) -> Result<String, ControlError> {
    let eval = eval_raw(target.node, expr);
    let cmd = bootstrap_command(target, &boot_name(EVAL_PREFIX), &eval);
    classify(transport::exec_simple(client, &cmd, deadline).await?)
}

/// Reachability probe: ping the target and evaluate a constant. Used by the
/// post-start probe, under its own name prefix.
pub async fn rpc_probe(
    client: &Client,
    target: &RpcTarget<'_>,
    deadline: Duration,
) -> Result<(), ControlError> {
    let eval = eval_printed(target.node, "ok");
    let cmd = bootstrap_command(target, &boot_name(PROBE_PREFIX), &eval);
    classify(transport::exec_simple(client, &cmd, deadline).await?).map(|_| ())
}

/// Unique bootstrap short name: `<prefix>_<ms-epoch>_<6 base36 chars>`.
fn boot_name(prefix: &str) -> String {
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let mut rng = rand::thread_rng();
    let suffix: String = (0..6)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    format!("{prefix}_{ts}_{suffix}")
}

/// `PATH=<dirname(launcher)>:$PATH ` when the launcher path has a directory
/// component. `elixir` needs this to locate its own `erl`.
pub(crate) fn path_prefix(launcher: &str) -> String {
    match launcher.rsplit_once('/') {
        Some((dir, _)) if !dir.is_empty() => format!("PATH={}:$PATH ", quote(dir)),
        _ => String::new(),
    }
}

fn bootstrap_command(target: &RpcTarget<'_>, boot: &str, eval: &str) -> String {
    format!(
        "{path}{erl} -sname {boot} -setcookie {cookie} -noshell -eval {eval}",
        path = path_prefix(target.erl_path),
        erl = quote(target.erl_path),
        cookie = quote(target.cookie),
        eval = quote(eval),
    )
}

fn eval_printed(node: &str, expr: &str) -> String {
    format!(
        "Target = '{node}', case net_adm:ping(Target) of \
         pang -> io:format(\"{UNREACHABLE_SENTINEL}~n\"), halt(1); \
         pong -> Result = rpc:call(Target, erlang, apply, [fun() -> {expr} end, []]), \
         io:format(\"~p~n\", [Result]), halt(0) end."
    )
}

fn eval_raw(node: &str, expr: &str) -> String {
    format!(
        "Target = '{node}', case net_adm:ping(Target) of \
         pang -> io:format(\"{UNREACHABLE_SENTINEL}~n\"), halt(1); \
         pong -> case rpc:call(Target, erlang, apply, [fun() -> {expr} end, []]) of \
         {{badrpc, Reason}} -> io:format(\"{BADRPC_SENTINEL} ~p~n\", [Reason]), halt(1); \
         _ -> halt(0) end end."
    )
}

/// Map the bootstrap's stdout to the error surface. The unreachable sentinel
/// and `{badrpc, ...}` results become errors; everything else, including
/// `{error, ...}` result terms, is returned verbatim as result text.
fn classify(out: String) -> Result<String, ControlError> {
    if out.starts_with(UNREACHABLE_SENTINEL) {
        return Err(ControlError::NodeUnreachable);
    }
    if out.starts_with(BADRPC_SENTINEL) || out.starts_with("{badrpc,") {
        return Err(ControlError::RemoteEval(out));
    }
    Ok(out)
}
