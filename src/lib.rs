//! # beamctl - BEAM Fleet Control-Plane over SSH
//!
//! `beamctl` is a Rust library for managing a fleet of BEAM (Erlang/Elixir
//! virtual machine) nodes running on SSH-accessible hosts. It launches named
//! nodes, tracks their lifecycle, hot-loads modules, drives generic server
//! processes, and polls message-trace data, all without installing a
//! persistent agent on the remote side: every remote evaluation runs through
//! an ephemeral bootstrap node that pings the target, performs one
//! `rpc:call`, and exits.
//!
//! ## Features
//!
//! - **Connection reuse**: one authenticated SSH client per host, shared by
//!   all concurrent operations and redialed transparently after close
//! - **Node state machine**: `starting -> running | error -> stopped`, driven
//!   by a reachability probe and by the node channel's close event
//! - **Agentless RPC**: short-lived bootstrap nodes speak BEAM distribution
//!   on the control-plane's behalf
//! - **Trace pollers**: per-node background workers accumulate message-flow
//!   edges for dashboard widgets
//! - **Async/Await**: built on Tokio; operations run concurrently and never
//!   hold a registry lock across I/O
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use beamctl::core::Core;
//! use beamctl::nodes::NodeKind;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Reads SSH_HOSTS and SSH_PRIVATE_KEY (or SSH_PRIVATE_KEY_B64).
//!     let core = Core::from_env();
//!
//!     let started = core.start_node("w1", NodeKind::Erlang, None, None).await?;
//!     println!("{started}");
//!
//!     // The reachability probe settles the status after ~2 seconds.
//!     tokio::time::sleep(std::time::Duration::from_millis(2500)).await;
//!     for node in core.list_nodes().await? {
//!         println!("{} is {} ({:?} processes)", node.name, node.status, node.process_count);
//!     }
//!
//!     core.stop_node("w1").await?;
//!     core.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Main Components
//!
//! - [`core::Core`] - The operation surface: node lifecycle, deploys,
//!   gen-server calls, tracing
//! - [`hosts::HostRegistry`] - Configured hosts and their cached SSH clients
//! - [`nodes::NodeRegistry`] - Managed nodes and their state machine
//! - [`rpc`] - Ephemeral-bootstrap remote evaluation
//! - [`config::Settings`] - Environment decoding (`SSH_HOSTS`, key material)
//! - [`views`] - JSON payload schemas consumed by dashboard widgets
//! - [`error::ControlError`] - The operation error taxonomy

pub mod config;
pub mod core;
pub mod error;
pub mod hosts;
pub mod nodes;
pub mod rpc;
pub mod shell;
pub mod shutdown;
pub mod trace;
pub mod transport;
pub mod views;
