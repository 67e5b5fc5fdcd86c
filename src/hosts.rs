//! Host registry: the configured fleet and its cached SSH connections.
//!
//! Populated once at startup from [`Settings`](crate::config::Settings) and
//! never reloaded. Per host, the only mutable state is the cached connection
//! and the remote short hostname; both are owned by [`HostEntry::session`],
//! which serialises dialing so concurrent operations await one handshake
//! instead of racing their own.

use std::collections::HashMap;
use std::sync::Arc;

use async_ssh2_tokio::ServerCheckMethod;
use async_ssh2_tokio::client::{AuthMethod, Client};
use log::debug;
use tokio::sync::Mutex;

use crate::config::HostSpec;
use crate::error::ControlError;
use crate::transport::{self, DEFAULT_EXEC_TIMEOUT};

/// An authenticated client plus the short hostname nodes on it answer to.
pub struct HostSession {
    pub client: Arc<Client>,
    pub short_host: String,
}

/// One configured host and its connection slot.
pub struct HostEntry {
    pub spec: HostSpec,
    state: Mutex<HostState>,
}

#[derive(Default)]
struct HostState {
    connection: Option<Arc<Client>>,
    /// Remote `hostname -s`, resolved on first successful connect. Once set,
    /// constant until process exit.
    remote_short_host: Option<String>,
}

impl HostEntry {
    fn new(spec: HostSpec) -> HostEntry {
        HostEntry { spec, state: Mutex::new(HostState::default()) }
    }

    /// Return the cached client, dialing first if the slot is empty or the
    /// cached client has been observed closed.
    ///
    /// The state lock is held across the dial on purpose: one dial in flight
    /// per host, later callers reuse its result.
    pub async fn session(&self, private_key: &str) -> Result<HostSession, ControlError> {
        let mut state = self.state.lock().await;

        if let Some(client) = state.connection.as_ref() {
            if client.is_closed() {
                debug!("host {}: cached connection closed, redialing", self.spec.label);
                state.connection = None;
            } else {
                let short_host = state
                    .remote_short_host
                    .clone()
                    .unwrap_or_else(|| fallback_short_host(&self.spec.hostname));
                return Ok(HostSession { client: client.clone(), short_host });
            }
        }

        let auth = AuthMethod::with_key(private_key, None);
        let client = Client::connect(
            (self.spec.hostname.clone(), self.spec.port),
            &self.spec.user,
            auth,
            ServerCheckMethod::NoCheck,
        )
        .await
        .map_err(|err| {
            ControlError::SshDial(format!(
                "{}@{}:{}: {err}",
                self.spec.user, self.spec.hostname, self.spec.port
            ))
        })?;
        let client = Arc::new(client);
        debug!("host {}: connected", self.spec.label);

        if state.remote_short_host.is_none() {
            let short = match transport::exec_simple(&client, "hostname -s", DEFAULT_EXEC_TIMEOUT).await
            {
                Ok(out) if !out.is_empty() => out,
                _ => fallback_short_host(&self.spec.hostname),
            };
            debug!("host {}: remote short hostname is {short}", self.spec.label);
            state.remote_short_host = Some(short);
        }

        state.connection = Some(client.clone());
        let short_host = state.remote_short_host.clone().unwrap_or_default();
        Ok(HostSession { client, short_host })
    }

    /// Give up the cached connection, if any. Used by the shutdown
    /// coordinator to end clients.
    pub async fn take_connection(&self) -> Option<Arc<Client>> {
        self.state.lock().await.connection.take()
    }
}

/// Keyed, read-mostly mapping from host label to entry.
pub struct HostRegistry {
    entries: Vec<Arc<HostEntry>>,
    by_label: HashMap<String, usize>,
}

impl HostRegistry {
    /// Build the registry from the decoded host list. The first entry for a
    /// label wins; later duplicates are dropped.
    pub fn new(specs: Vec<HostSpec>) -> HostRegistry {
        let mut entries = Vec::with_capacity(specs.len());
        let mut by_label = HashMap::new();
        for spec in specs {
            if by_label.contains_key(&spec.label) {
                debug!("duplicate host label {}, keeping the first entry", spec.label);
                continue;
            }
            by_label.insert(spec.label.clone(), entries.len());
            entries.push(Arc::new(HostEntry::new(spec)));
        }
        HostRegistry { entries, by_label }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, label: &str) -> Result<&Arc<HostEntry>, ControlError> {
        self.by_label
            .get(label)
            .map(|&idx| &self.entries[idx])
            .ok_or_else(|| ControlError::UnknownHost(label.to_string()))
    }

    /// Resolve an optional caller-supplied label; absent means the first
    /// configured host.
    pub fn resolve(&self, label: Option<&str>) -> Result<&Arc<HostEntry>, ControlError> {
        match label {
            Some(label) => self.get(label),
            None => self.entries.first().ok_or(ControlError::ConfigMissing),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<HostEntry>> {
        self.entries.iter()
    }
}

/// Leftmost label of the configured hostname, used when the `hostname -s`
/// probe fails.
fn fallback_short_host(hostname: &str) -> String {
    hostname.split('.').next().unwrap_or(hostname).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_hosts;

    #[test]
    fn fallback_takes_leftmost_dns_label() {
        assert_eq!(fallback_short_host("build1.example.com"), "build1");
        assert_eq!(fallback_short_host("localhost"), "localhost");
    }

    #[test]
    fn lookup_by_label_and_default_to_first() {
        let registry = HostRegistry::new(parse_hosts("a:u@h1,b:u@h2"));
        assert_eq!(registry.get("b").unwrap().spec.hostname, "h2");
        assert_eq!(registry.resolve(None).unwrap().spec.label, "a");
        assert!(matches!(
            registry.get("missing"),
            Err(ControlError::UnknownHost(_))
        ));
    }

    #[test]
    fn empty_registry_has_no_default_host() {
        let registry = HostRegistry::new(Vec::new());
        assert!(registry.is_empty());
        assert!(matches!(registry.resolve(None), Err(ControlError::ConfigMissing)));
    }

    #[test]
    fn duplicate_labels_keep_the_first_spec() {
        let registry = HostRegistry::new(parse_hosts("a:u@h1,a:u@h2"));
        assert_eq!(registry.get("a").unwrap().spec.hostname, "h1");
    }
}
