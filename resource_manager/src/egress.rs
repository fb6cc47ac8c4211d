use crate::resource_pool::{Resource, ResourceKind};
use reqwest::{Client, Proxy};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// HTTP clients keyed by proxy identity.
///
/// reqwest binds a proxy to a client, so each proxy gets its own client,
/// built on first use and reused afterwards.
pub struct EgressClients {
    timeout: Duration,
    clients: Mutex<HashMap<String, Client>>,
}

impl EgressClients {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Client routed through `proxy`; the `direct` resource gets a plain client
    pub fn client_for(&self, proxy: &Resource) -> Result<Client, reqwest::Error> {
        let mut clients = self.clients.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(client) = clients.get(proxy.identity()) {
            return Ok(client.clone());
        }

        let mut builder = Client::builder().timeout(self.timeout);
        if proxy.kind() == ResourceKind::Proxy && !proxy.is_direct() {
            builder = builder.proxy(Proxy::all(proxy.identity())?);
        }
        let client = builder.build()?;

        debug!("Built HTTP client for egress {}", proxy);
        clients.insert(proxy.identity().to_string(), client.clone());
        Ok(client)
    }

    pub fn len(&self) -> usize {
        self.clients.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
