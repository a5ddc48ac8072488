//! The set of configured backends and round-robin selection across them.

use crate::backend::{Backend, BackendSettings, Pool};
use crate::config::Config;
use crate::connection::TlsPhase;
use crate::lock_order::{LockLevel, OrderedMutex};
use crate::metrics::{BackendStatus, Metrics};
use crate::tls;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::info;

/// Fallback when `max_pdus_per_cycle` is not configured.
pub const DEFAULT_MAX_PDUS_PER_CYCLE: usize = 10;

struct RegistryState {
    backends: Vec<Arc<Backend>>,
    /// Rotation position per pool.
    cursors: [usize; 2],
}

pub struct Registry {
    state: OrderedMutex<RegistryState>,
}

impl Registry {
    pub fn new(backends: Vec<Arc<Backend>>) -> Self {
        Self {
            state: OrderedMutex::new(
                LockLevel::Registry,
                RegistryState {
                    backends,
                    cursors: [0, 0],
                },
            ),
        }
    }

    /// Builds one backend per configured server. A TLS client context is
    /// created only when some backend needs one.
    pub fn from_config(config: &Config, metrics: &Arc<Metrics>) -> Result<Self> {
        let max_pdus = config
            .max_pdus_per_cycle
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAX_PDUS_PER_CYCLE);
        let mut all_settings = Vec::with_capacity(config.backend.servers.len());
        for server in &config.backend.servers {
            let mut settings = BackendSettings::from_config(server, &config.backend)
                .with_context(|| format!("Backend {}", server.uri))?;
            settings.proxy_authz = config.proxyauthz.unwrap_or(false);
            settings.max_pdus_per_cycle = max_pdus;
            all_settings.push(settings);
        }

        let needs_tls = all_settings.iter().any(|s| s.tls != TlsPhase::Cleartext);
        let connector = if needs_tls {
            Some(tls::connector(
                config.backend.tls_skip_verify.unwrap_or(false),
                config.backend.tls_ca_file.as_deref(),
            )?)
        } else {
            None
        };

        let backends = all_settings
            .into_iter()
            .map(|settings| Backend::new(settings, Arc::clone(metrics), connector.clone()))
            .collect();
        Ok(Self::new(backends))
    }

    /// Opens the initial connections of every backend.
    pub fn start(&self) {
        for backend in self.backends() {
            info!("Backend {} starting", backend.uri());
            backend.fill_pools();
        }
    }

    pub fn backends(&self) -> Vec<Arc<Backend>> {
        self.state.lock().backends.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Takes the backend for `uri` out of rotation and closes its connections.
    pub fn remove(&self, uri: &str) -> bool {
        let removed = {
            let mut st = self.state.lock();
            let Some(pos) = st.backends.iter().position(|b| b.uri() == uri) else {
                return false;
            };
            st.backends.remove(pos)
        };
        removed.shutdown();
        true
    }

    /// Next backend in rotation that can take an operation for `pool`.
    /// The rotation resumes after the backend returned.
    pub fn select_backend(&self, pool: Pool) -> Option<Arc<Backend>> {
        let mut st = self.state.lock();
        let n = st.backends.len();
        if n == 0 {
            return None;
        }
        let idx = match pool {
            Pool::Regular => 0,
            Pool::Bind => 1,
        };
        let now = Instant::now();
        let start = st.cursors[idx] % n;
        for i in 0..n {
            let pos = (start + i) % n;
            if st.backends[pos].is_eligible(pool, now) {
                st.cursors[idx] = (pos + 1) % n;
                return Some(Arc::clone(&st.backends[pos]));
            }
        }
        None
    }

    pub fn statuses(&self) -> Vec<BackendStatus> {
        self.backends().iter().map(|b| b.status()).collect()
    }

    pub fn shutdown(&self) {
        for backend in self.backends() {
            backend.shutdown();
        }
    }
}
