//! Per-node message-trace pollers.
//!
//! While tracing is on for a node, a worker task polls it every three seconds
//! for the `(from, to, count)` edges observed since the previous poll and
//! replaces the node's window view with the result. Poll failures are logged
//! and the next tick proceeds; the worker only exits when `stop-trace`
//! cancels it, and cancellation awaits the worker before the supervisor entry
//! disappears.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;

use crate::error::ControlError;
use crate::views::TraceEdge;

/// Time between trace polls.
pub const POLL_INTERVAL: Duration = Duration::from_secs(3);

struct TraceEntry {
    stop: oneshot::Sender<()>,
    worker: JoinHandle<()>,
    window: Arc<Mutex<Vec<TraceEdge>>>,
}

/// Supervisor of the per-node pollers.
#[derive(Default)]
pub struct TraceSupervisor {
    entries: Mutex<HashMap<String, TraceEntry>>,
}

impl TraceSupervisor {
    pub fn new() -> TraceSupervisor {
        TraceSupervisor::default()
    }

    /// Spawn a poller for `name`, driven by `fetch` (one call per tick).
    /// Returns `false` when a poller for the node already exists.
    pub async fn start<F, Fut>(&self, name: &str, mut fetch: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Vec<TraceEdge>, ControlError>> + Send,
    {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(name) {
            return false;
        }

        let (stop, mut stop_rx) = oneshot::channel();
        let window = Arc::new(Mutex::new(Vec::new()));
        let worker_window = window.clone();
        let worker_name = name.to_string();

        let worker = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        // A stop request also cancels a poll already in
                        // flight, so stop-trace never waits out an SSH
                        // deadline.
                        tokio::select! {
                            _ = &mut stop_rx => break,
                            result = fetch() => match result {
                                Ok(edges) => *worker_window.lock().await = edges,
                                Err(err) => warn!("trace poll for {worker_name} failed: {err}"),
                            },
                        }
                    }
                }
            }
            debug!("trace poller for {worker_name} exited");
        });

        entries.insert(name.to_string(), TraceEntry { stop, worker, window });
        true
    }

    /// Whether a poller is active for the node.
    pub async fn is_active(&self, name: &str) -> bool {
        self.entries.lock().await.contains_key(name)
    }

    /// Snapshot of the most recent poll window, or `None` when tracing is off.
    pub async fn window(&self, name: &str) -> Option<Vec<TraceEdge>> {
        let entries = self.entries.lock().await;
        match entries.get(name) {
            Some(entry) => Some(entry.window.lock().await.clone()),
            None => None,
        }
    }

    /// Cancel the node's poller and wait for it to exit. Returns `false` when
    /// no poller was active. The edge view dies with the entry.
    pub async fn stop(&self, name: &str) -> bool {
        let entry = self.entries.lock().await.remove(name);
        match entry {
            Some(entry) => {
                let _ = entry.stop.send(());
                let _ = entry.worker.await;
                true
            }
            None => false,
        }
    }

    /// Cancel every poller. Used by the shutdown coordinator.
    pub async fn stop_all(&self) {
        let names: Vec<String> = self.entries.lock().await.keys().cloned().collect();
        for name in names {
            self.stop(&name).await;
        }
    }
}

/// Parse one poll's output: `from|to|count` per line. Malformed lines and
/// remote error markers are dropped.
pub fn parse_trace_window(out: &str) -> Vec<TraceEdge> {
    out.lines()
        .filter_map(|line| {
            let mut fields = line.split('|');
            let from = fields.next()?.trim();
            let to = fields.next()?.trim();
            let count: u64 = fields.next()?.trim().parse().ok()?;
            if fields.next().is_some() || from.is_empty() || to.is_empty() {
                return None;
            }
            Some(TraceEdge { from: from.to_string(), to: to.to_string(), count })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_parser_keeps_well_formed_edges_only() {
        let out = "kv_store|logger|3\nerror:no_trace\nbad|row\na|b|2|extra\nshell|kv_store|1\n";
        let edges = parse_trace_window(out);
        assert_eq!(
            edges,
            vec![
                TraceEdge { from: "kv_store".into(), to: "logger".into(), count: 3 },
                TraceEdge { from: "shell".into(), to: "kv_store".into(), count: 1 },
            ]
        );
    }

    #[test]
    fn window_parser_rejects_non_numeric_counts() {
        assert!(parse_trace_window("a|b|many\n").is_empty());
        assert!(parse_trace_window("").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn poller_replaces_the_window_each_tick() {
        let supervisor = TraceSupervisor::new();
        let mut tick = 0u64;
        assert!(
            supervisor
                .start("w1", move || {
                    tick += 1;
                    let edges = vec![TraceEdge { from: "a".into(), to: "b".into(), count: tick }];
                    async move { Ok(edges) }
                })
                .await
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        let first = supervisor.window("w1").await.unwrap();
        assert_eq!(first[0].count, 1);

        tokio::time::sleep(POLL_INTERVAL + Duration::from_millis(100)).await;
        let second = supervisor.window("w1").await.unwrap();
        assert_eq!(second[0].count, 2, "window holds the latest delta, not a sum");

        assert!(supervisor.stop("w1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_for_the_same_node_is_refused() {
        let supervisor = TraceSupervisor::new();
        assert!(supervisor.start("w1", || async { Ok(Vec::new()) }).await);
        assert!(!supervisor.start("w1", || async { Ok(Vec::new()) }).await);
        supervisor.stop("w1").await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_awaits_the_worker_and_clears_the_view() {
        let supervisor = TraceSupervisor::new();
        supervisor.start("w1", || async { Ok(Vec::new()) }).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(supervisor.stop("w1").await);
        assert!(!supervisor.is_active("w1").await);
        assert!(supervisor.window("w1").await.is_none());
        assert!(!supervisor.stop("w1").await, "second stop is a no-op");
    }

    #[tokio::test(start_paused = true)]
    async fn poll_failures_keep_the_previous_window() {
        let supervisor = TraceSupervisor::new();
        let mut tick = 0u64;
        supervisor
            .start("w1", move || {
                tick += 1;
                let result = if tick == 1 {
                    Ok(vec![TraceEdge { from: "a".into(), to: "b".into(), count: 9 }])
                } else {
                    Err(ControlError::SshTimeout("poll".into()))
                };
                async move { result }
            })
            .await;

        tokio::time::sleep(POLL_INTERVAL * 2).await;
        let window = supervisor.window("w1").await.unwrap();
        assert_eq!(window[0].count, 9);
        supervisor.stop("w1").await;
    }
}
