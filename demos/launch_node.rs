use std::time::Duration;

use anyhow::{Context, bail};
use beamctl::core::Core;
use beamctl::error::ControlError;
use beamctl::nodes::NodeKind;
use beamctl::shutdown;
use beamctl::views::OpReport;

const KV_MODULE: &str = r#"-module(kv_demo).
-behaviour(gen_server).
-export([init/1, handle_call/3, handle_cast/2]).

init([]) -> {ok, #{}}.

handle_call({put, Key, Value}, _From, State) -> {reply, ok, State#{Key => Value}};
handle_call({get, Key}, _From, State) -> {reply, maps:get(Key, State, undefined), State};
handle_call(size, _From, State) -> {reply, maps:size(State), State}.

handle_cast(_Msg, State) -> {noreply, State}.
"#;

fn print_report(label: &str, result: Result<String, ControlError>) {
    match OpReport::from(result) {
        OpReport::Ok { ok } => println!("{label}: {ok}"),
        OpReport::Err { err, code } => println!("{label}: [{code}] {err}"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let core = Core::from_env();
    if !core.settings().is_operable() {
        bail!("set SSH_HOSTS and SSH_PRIVATE_KEY (or SSH_PRIVATE_KEY_B64) first");
    }

    let name = std::env::args().nth(1).unwrap_or_else(|| "demo1".to_string());

    let started = core
        .start_node(&name, NodeKind::Erlang, None, None)
        .await
        .context("launching node")?;
    println!("start: {started}");

    // Give the reachability probe time to settle the status.
    tokio::time::sleep(Duration::from_millis(2500)).await;

    for node in core.list_nodes().await.context("listing nodes")? {
        println!(
            "list: {} type={} status={} processes={}",
            node.name,
            node.kind,
            node.status,
            node.process_count.map_or("null".to_string(), |n| n.to_string()),
        );
    }

    print_report("deploy", core.deploy_module(&name, KV_MODULE, NodeKind::Erlang).await);
    print_report(
        "genserver start",
        core.start_genserver(&name, "kv_demo", Some("[]"), Some("kv_demo")).await,
    );
    print_report(
        "genserver call",
        core.call_genserver(&name, "kv_demo", "{put, color, blue}", None).await,
    );
    print_report(
        "genserver call",
        core.call_genserver(&name, "kv_demo", "{get, color}", None).await,
    );
    print_report("genserver stop", core.stop_genserver(&name, "kv_demo").await);

    let inspected = core.inspect_node(&name).await.context("inspecting node")?;
    println!("inspect: {} registered processes", inspected.processes.len());
    for process in inspected.processes.iter().take(5) {
        println!(
            "  {} status={} queue={} mem={} at {}",
            process.name,
            process.status,
            process.message_queue_len,
            process.memory,
            process.current_function
        );
    }

    println!("press Ctrl-C to stop the node and exit");
    shutdown::run_until_termination(&core).await?;
    Ok(())
}
