use super::*;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use log::debug;

use crate::nodes::NodeKind;
use crate::rpc::{self, RpcTarget};
use crate::shell::quote;
use crate::transport::{self, DEFAULT_EXEC_TIMEOUT};

impl Core {
    /// Upload `code` to the node's host, compile and hot-load it, and report
    /// the rendered compile-and-load result. The temp file is deleted whether
    /// or not the compile succeeds.
    pub async fn deploy_module(
        &self,
        name: &str,
        code: &str,
        language: NodeKind,
    ) -> Result<String, ControlError> {
        self.guard_config()?;
        let snapshot = self.nodes.require_running(name).await?;
        let (entry, session) = self.node_session(&snapshot).await?;

        let path = deploy_path(language, now_ms());
        let upload = upload_command(code, &path);
        transport::exec_simple(&session.client, &upload, DEFAULT_EXEC_TIMEOUT).await?;

        let target_id = snapshot.target();
        let target = RpcTarget {
            node: &target_id,
            cookie: &snapshot.cookie,
            erl_path: &entry.spec.erl_path,
        };
        let expr = compile_expr(language, &path);
        let result = rpc::rpc_printed(&session.client, &target, &expr, DEFAULT_EXEC_TIMEOUT).await;

        let cleanup = format!("rm -f {}", quote(&path));
        if let Err(err) = transport::exec_simple(&session.client, &cleanup, DEFAULT_EXEC_TIMEOUT).await
        {
            debug!("deploy temp file cleanup failed for {path}: {err}");
        }

        result
    }
}

fn deploy_path(language: NodeKind, ts: u64) -> String {
    let ext = match language {
        NodeKind::Erlang => "erl",
        NodeKind::Elixir => "ex",
    };
    format!("/tmp/mcp_deploy_{ts}.{ext}")
}

/// Source travels as base64 so arbitrary code survives the shell round-trip.
fn upload_command(code: &str, path: &str) -> String {
    format!("printf %s {} | base64 -d > {}", quote(&BASE64.encode(code)), quote(path))
}

fn compile_expr(language: NodeKind, path: &str) -> String {
    match language {
        NodeKind::Erlang => format!(
            "case compile:file(\"{path}\", [binary, return_errors]) of \
             {{ok, Mod, Bin}} -> case code:load_binary(Mod, \"{path}\", Bin) of \
             {{module, Mod}} -> {{ok, Mod}}; LoadError -> LoadError end; \
             CompileError -> CompileError end"
        ),
        NodeKind::Elixir => format!(
            "try {{ok, 'Elixir.Code':compile_file(<<\"{path}\">>)}} \
             catch Kind:Reason -> {{error, {{Kind, Reason}}}} end"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deploy_paths_carry_timestamp_and_extension() {
        assert_eq!(deploy_path(NodeKind::Erlang, 1234), "/tmp/mcp_deploy_1234.erl");
        assert_eq!(deploy_path(NodeKind::Elixir, 1234), "/tmp/mcp_deploy_1234.ex");
    }

    #[test]
    fn upload_round_trips_through_base64() {
        let cmd = upload_command("-module(x).\n", "/tmp/mcp_deploy_1.erl");
        assert_eq!(
            cmd,
            "printf %s 'LW1vZHVsZSh4KS4K' | base64 -d > '/tmp/mcp_deploy_1.erl'"
        );
    }

    #[test]
    fn erlang_compile_loads_the_binary_on_success() {
        let expr = compile_expr(NodeKind::Erlang, "/tmp/mcp_deploy_1.erl");
        assert!(expr.contains("compile:file(\"/tmp/mcp_deploy_1.erl\", [binary, return_errors])"));
        assert!(expr.contains("code:load_binary(Mod, \"/tmp/mcp_deploy_1.erl\", Bin)"));
        assert!(expr.contains("CompileError -> CompileError end"));
    }

    #[test]
    fn elixir_compile_is_wrapped_in_try_catch() {
        let expr = compile_expr(NodeKind::Elixir, "/tmp/mcp_deploy_1.ex");
        assert!(expr.starts_with("try {ok, 'Elixir.Code':compile_file(<<\"/tmp/mcp_deploy_1.ex\">>)}"));
        assert!(expr.ends_with("catch Kind:Reason -> {error, {Kind, Reason}} end"));
    }
}
