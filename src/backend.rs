//! One upstream server: its connection pools, pending dials, backoff and
//! the operations parked until a connection becomes available.

use crate::config::{BackendConfig, BackendServer};
use crate::connection::{ConnState, Connection, ConnectionInner, ConnectionOwner, ConnRole, TlsPhase};
use crate::connector::{self, Established};
use crate::dialer::{parse_ldap_uri, BackendAddress, UriScheme};
use crate::driver;
use crate::error::ConnectError;
use crate::ldap_protocol::result_code;
use crate::lock_order::{LockLevel, OrderedMutex};
use crate::metrics::{BackendStatus, Metrics};
use crate::operation::{Operation, Side};
use crate::upstream::UpstreamHandler;
use anyhow::Result;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

/// Failures past this count stop growing the backoff.
const MAX_BACKOFF_DOUBLINGS: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pool {
    /// Shared links multiplexing regular operations.
    Regular,
    /// Links that forward client binds, one bind at a time.
    Bind,
}

impl Pool {
    fn index(self) -> usize {
        match self {
            Pool::Regular => 0,
            Pool::Bind => 1,
        }
    }

    fn role(self) -> ConnRole {
        match self {
            Pool::Regular => ConnRole::Upstream,
            Pool::Bind => ConnRole::Bind,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub uri: String,
    pub address: BackendAddress,
    /// Cleartext, Ldaps, StartTlsOptional or StartTls.
    pub tls: TlsPhase,
    pub version: u8,
    pub retry: Duration,
    pub retry_max: Duration,
    pub max_pending_ops: u64,
    pub conn_max_pending: u64,
    pub numconns: usize,
    pub bindconns: usize,
    pub announce_credentials: bool,
    /// Limit for the socket connect alone.
    pub network_timeout: Duration,
    /// Limit for the whole handshake, dial included.
    pub handshake_timeout: Duration,
    pub bind_dn: Option<String>,
    pub bind_credentials: Option<String>,
    pub proxy_authz: bool,
    pub max_pdus_per_cycle: usize,
}

impl BackendSettings {
    /// Settings for `uri` with every tunable at its default.
    pub fn new(uri: &str) -> Result<Self> {
        let (scheme, address) = parse_ldap_uri(uri)?;
        Ok(Self {
            uri: uri.to_string(),
            address,
            tls: if scheme == UriScheme::Ldaps {
                TlsPhase::Ldaps
            } else {
                TlsPhase::Cleartext
            },
            version: 3,
            retry: Duration::from_millis(5000),
            retry_max: Duration::from_millis(60_000),
            max_pending_ops: 50,
            conn_max_pending: 10,
            numconns: 10,
            bindconns: 5,
            announce_credentials: false,
            network_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            bind_dn: None,
            bind_credentials: None,
            proxy_authz: false,
            max_pdus_per_cycle: 10,
        })
    }

    pub fn from_config(server: &BackendServer, backend: &BackendConfig) -> Result<Self> {
        let mut settings = Self::new(&server.uri)?;
        match server.starttls.as_deref() {
            None | Some("no") => {}
            Some(policy) if settings.tls == TlsPhase::Ldaps => {
                anyhow::bail!("starttls {:?} makes no sense on {}", policy, server.uri)
            }
            Some("yes") => settings.tls = TlsPhase::StartTlsOptional,
            Some("critical") => settings.tls = TlsPhase::StartTls,
            Some(other) => anyhow::bail!("Invalid starttls {:?} for {}", other, server.uri),
        }
        if let Some(version) = server.version {
            settings.version = version;
        }
        if let Some(retry) = server.retry {
            settings.retry = Duration::from_millis(retry);
        }
        if let Some(max) = backend.retry_max_ms {
            settings.retry_max = Duration::from_millis(max);
        }
        settings.retry_max = settings.retry_max.max(settings.retry);
        if let Some(n) = server.max_pending_ops {
            settings.max_pending_ops = n as u64;
        }
        if let Some(n) = server.conn_max_pending {
            settings.conn_max_pending = n as u64;
        }
        if let Some(n) = server.numconns {
            settings.numconns = n as usize;
        }
        if let Some(n) = server.bindconns {
            settings.bindconns = n as usize;
        }
        settings.announce_credentials = server.announce_credentials.unwrap_or(false);
        if let Some(secs) = backend.bind.network_timeout {
            settings.network_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = backend.bind.timeout {
            settings.handshake_timeout = Duration::from_secs(secs);
        }
        settings.bind_dn = backend.bind.binddn.clone();
        settings.bind_credentials = backend.bind.credentials.clone();
        Ok(settings)
    }

    fn ceiling(&self, pool: Pool) -> usize {
        match pool {
            Pool::Regular => self.numconns,
            Pool::Bind => self.bindconns,
        }
    }
}

/// Delay before the next connection attempt after `failed` consecutive
/// failures: doubles per failure from `base`, doubles once more when the
/// last failure was a timeout, never exceeds `max`.
pub fn backoff_delay(base: Duration, max: Duration, failed: u32, timed_out: bool) -> Duration {
    let doublings = failed.clamp(1, MAX_BACKOFF_DOUBLINGS) - 1;
    let mut delay = base.saturating_mul(1 << doublings);
    if timed_out {
        delay = delay.saturating_mul(2);
    }
    delay.min(max)
}

/// Result of asking a backend for a connection.
#[derive(Debug)]
pub enum Acquire {
    /// A usable connection, retained for the caller, with the operation
    /// counted against the backend.
    Ready(Arc<Connection>),
    /// None usable now, but one is being opened or may be.
    NeedsDial,
    /// At capacity.
    Exhausted,
}

struct PendingConnection {
    id: u64,
    pool: Pool,
    started: Instant,
    abort: Option<AbortHandle>,
}

struct BackendState {
    pools: [Vec<Arc<Connection>>; 2],
    cursors: [usize; 2],
    pending: Vec<PendingConnection>,
    next_pending_id: u64,
    failed: u32,
    retry_at: Option<Instant>,
    retry_scheduled: bool,
    n_ops_executing: u64,
    /// Operations admitted while no connection could take them.
    waiting: VecDeque<(Pool, Arc<Operation>)>,
    shutdown: bool,
}

impl BackendState {
    fn opening(&self, pool: Pool) -> usize {
        self.pending.iter().filter(|p| p.pool == pool).count()
    }

    fn has_waiters(&self, pool: Pool) -> bool {
        self.waiting.iter().any(|(p, _)| *p == pool)
    }

    /// Next usable connection of `pool` in rotation, retained. A bind link
    /// is reserved by moving it to `Binding`.
    fn pick(&mut self, pool: Pool, conn_max_pending: u64) -> Option<Arc<Connection>> {
        let conns = &self.pools[pool.index()];
        let cursor = &mut self.cursors[pool.index()];
        let n = conns.len();
        for i in 0..n {
            let idx = (*cursor + i) % n;
            let conn = &conns[idx];
            let mut guard = conn.lock();
            if usable(pool, &guard, conn_max_pending) {
                Connection::retain(&mut guard);
                if pool == Pool::Bind {
                    guard.state = ConnState::Binding;
                }
                *cursor = (idx + 1) % n;
                return Some(Arc::clone(conn));
            }
        }
        None
    }

    fn has_usable(&self, pool: Pool, conn_max_pending: u64) -> bool {
        self.pools[pool.index()]
            .iter()
            .any(|c| usable(pool, &c.lock(), conn_max_pending))
    }
}

fn usable(pool: Pool, conn: &ConnectionInner, conn_max_pending: u64) -> bool {
    conn.is_live()
        && conn.state == ConnState::Ready
        && match pool {
            Pool::Regular => conn.n_ops_executing < conn_max_pending,
            Pool::Bind => conn.n_ops_executing == 0,
        }
}

pub struct Backend {
    settings: BackendSettings,
    state: OrderedMutex<BackendState>,
    metrics: Arc<Metrics>,
    tls: Option<TlsConnector>,
    me: Weak<Backend>,
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("uri", &self.settings.uri)
            .finish_non_exhaustive()
    }
}

impl Backend {
    /// `tls` is required for ldaps:// and StartTLS backends; without it their
    /// dials fail.
    pub fn new(settings: BackendSettings, metrics: Arc<Metrics>, tls: Option<TlsConnector>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            settings,
            state: OrderedMutex::new(
                LockLevel::Backend,
                BackendState {
                    pools: [Vec::new(), Vec::new()],
                    cursors: [0, 0],
                    pending: Vec::new(),
                    next_pending_id: 1,
                    failed: 0,
                    retry_at: None,
                    retry_scheduled: false,
                    n_ops_executing: 0,
                    waiting: VecDeque::new(),
                    shutdown: false,
                },
            ),
            metrics,
            tls,
            me: me.clone(),
        })
    }

    pub fn uri(&self) -> &str {
        &self.settings.uri
    }

    pub fn settings(&self) -> &BackendSettings {
        &self.settings
    }

    pub(crate) fn tls_connector(&self) -> Option<&TlsConnector> {
        self.tls.as_ref()
    }

    /// Whether an operation for `pool` could be placed here now: not backing
    /// off, below the pending limit, and a connection is usable or on its way.
    pub fn is_eligible(&self, pool: Pool, now: Instant) -> bool {
        let st = self.state.lock();
        self.eligible_locked(&st, pool, now)
    }

    fn eligible_locked(&self, st: &BackendState, pool: Pool, now: Instant) -> bool {
        if st.shutdown || st.n_ops_executing >= self.settings.max_pending_ops {
            return false;
        }
        if st.retry_at.is_some_and(|at| now < at) {
            return false;
        }
        let opening = st.opening(pool);
        st.has_usable(pool, self.settings.conn_max_pending)
            || opening > 0
            || st.pools[pool.index()].len() + opening < self.settings.ceiling(pool)
    }

    pub fn acquire_connection(&self, pool: Pool) -> Acquire {
        let mut st = self.state.lock();
        if st.shutdown || st.n_ops_executing >= self.settings.max_pending_ops {
            return Acquire::Exhausted;
        }
        // Parked operations get freed capacity first
        let queued = st.has_waiters(pool);
        if !queued {
            if let Some(conn) = st.pick(pool, self.settings.conn_max_pending) {
                st.n_ops_executing += 1;
                return Acquire::Ready(conn);
            }
        }
        let opening = st.opening(pool);
        if queued || opening > 0 || st.pools[pool.index()].len() + opening < self.settings.ceiling(pool) {
            Acquire::NeedsDial
        } else {
            Acquire::Exhausted
        }
    }

    /// Parks `op` behind earlier parked operations until a connection of
    /// `pool` can take it, dialing one if none is on its way. False when the
    /// operation cannot be admitted.
    pub fn enqueue(&self, op: Arc<Operation>, pool: Pool) -> bool {
        let mut st = self.state.lock();
        if st.shutdown || st.waiting.len() as u64 >= self.settings.max_pending_ops {
            return false;
        }
        if st.opening(pool) == 0 && !st.has_waiters(pool) {
            let backing_off = st.retry_at.is_some_and(|at| Instant::now() < at);
            let room = st.pools[pool.index()].len() < self.settings.ceiling(pool);
            if backing_off || !room {
                return false;
            }
            self.start_dial(&mut st, pool);
        }
        debug!("{} connid={} msgid={} waiting for a {:?} connection",
            self.settings.uri, op.client_connid(), op.client_msgid(), pool);
        st.waiting.push_back((pool, op));
        st.n_ops_executing += 1;
        true
    }

    /// Counts an operation sent on a link obtained outside
    /// `acquire_connection`, such as a bind link pinned to its client.
    pub(crate) fn reserve(&self) {
        self.state.lock().n_ops_executing += 1;
    }

    /// An operation counted by `acquire_connection` or `enqueue` has left
    /// this backend. The freed capacity goes to parked operations first.
    pub fn operation_finished(&self) {
        {
            let mut st = self.state.lock();
            st.n_ops_executing = st.n_ops_executing.saturating_sub(1);
        }
        self.dispatch_waiting();
    }

    fn dispatch_waiting(&self) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let batch = {
            let mut st = self.state.lock();
            let mut batch = Vec::new();
            let mut blocked = [false; 2];
            let mut i = 0;
            while i < st.waiting.len() {
                let pool = st.waiting[i].0;
                if !blocked[pool.index()] {
                    if let Some(conn) = st.pick(pool, self.settings.conn_max_pending) {
                        if let Some((_, op)) = st.waiting.remove(i) {
                            batch.push((op, conn));
                        }
                        continue;
                    }
                    blocked[pool.index()] = true;
                }
                i += 1;
            }
            batch
        };
        for (op, conn) in batch {
            op.forward(&conn, &me, self.settings.proxy_authz);
        }
    }

    fn start_dial(&self, st: &mut BackendState, pool: Pool) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let id = st.next_pending_id;
        st.next_pending_id += 1;
        debug!("{} opening {:?} connection (attempt {})", self.settings.uri, pool, id);
        let task = tokio::spawn(connector::establish(me, id, pool));
        st.pending.push(PendingConnection {
            id,
            pool,
            started: Instant::now(),
            abort: Some(task.abort_handle()),
        });
    }

    /// Opens connections until both pools reach their configured size.
    /// While the backend is failing only one probe is kept in flight.
    pub fn fill_pools(&self) {
        let mut st = self.state.lock();
        if st.shutdown {
            return;
        }
        if let Some(at) = st.retry_at {
            if Instant::now() < at {
                self.schedule_retry(&mut st, at);
                return;
            }
        }
        for pool in [Pool::Regular, Pool::Bind] {
            let have = st.pools[pool.index()].len() + st.opening(pool);
            let target = self.settings.ceiling(pool);
            if st.failed > 0 {
                if st.pending.is_empty() && have < target {
                    self.start_dial(&mut st, pool);
                }
                continue;
            }
            for _ in have..target {
                self.start_dial(&mut st, pool);
            }
        }
    }

    fn schedule_retry(&self, st: &mut BackendState, at: Instant) {
        if st.retry_scheduled {
            return;
        }
        st.retry_scheduled = true;
        let weak = self.me.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            if let Some(backend) = weak.upgrade() {
                backend.state.lock().retry_scheduled = false;
                backend.fill_pools();
            }
        });
    }

    /// Records a failed connection attempt and backs off. Parked operations
    /// that no connection can serve any more are rejected.
    pub fn report_failure(&self, pending_id: u64, err: ConnectError) {
        let rejected = {
            let mut st = self.state.lock();
            let Some(pos) = st.pending.iter().position(|p| p.id == pending_id) else {
                return;
            };
            let attempt = st.pending.swap_remove(pos);
            st.failed += 1;
            let delay = backoff_delay(self.settings.retry, self.settings.retry_max, st.failed, err.is_timeout());
            let at = Instant::now() + delay;
            st.retry_at = Some(at);
            warn!(
                "{} connection attempt failed after {:?}: {} (failure {}, retrying in {:?})",
                self.settings.uri,
                attempt.started.elapsed(),
                err,
                st.failed,
                delay
            );

            let mut rejected = Vec::new();
            for pool in [Pool::Regular, Pool::Bind] {
                if st.opening(pool) > 0 || st.has_usable(pool, self.settings.conn_max_pending) {
                    continue;
                }
                let (gone, kept): (VecDeque<_>, VecDeque<_>) =
                    std::mem::take(&mut st.waiting).into_iter().partition(|(p, _)| *p == pool);
                st.waiting = kept;
                st.n_ops_executing = st.n_ops_executing.saturating_sub(gone.len() as u64);
                rejected.extend(gone.into_iter().map(|(_, op)| op));
            }
            if !st.shutdown {
                self.schedule_retry(&mut st, at);
            }
            rejected
        };
        self.metrics.inc_dial_failure(&self.settings.uri);
        for op in rejected {
            op.send_reject(result_code::UNAVAILABLE, "no connections available");
        }
    }

    /// Clears the failure state after a connection came up.
    pub fn report_success(&self) {
        let mut st = self.state.lock();
        if st.failed > 0 {
            info!("{} is reachable again after {} failed attempts", self.settings.uri, st.failed);
        }
        st.failed = 0;
        st.retry_at = None;
    }

    /// Adds a freshly established link to its pool, starts its I/O driver
    /// and hands it parked operations.
    pub(crate) fn promote(&self, pending_id: u64, pool: Pool, established: Established) {
        let owner: Weak<dyn ConnectionOwner> = self.me.clone();
        let tls = if established.tls {
            TlsPhase::Established
        } else {
            TlsPhase::Cleartext
        };
        let (conn, rx) = Connection::new(pool.role(), established.peer, tls, established.next_msgid, owner);
        {
            let mut st = self.state.lock();
            let Some(pos) = st.pending.iter().position(|p| p.id == pending_id) else {
                drop(st);
                // Superseded by shutdown
                conn.release(conn.lock());
                return;
            };
            st.pending.swap_remove(pos);
            st.pools[pool.index()].push(Arc::clone(&conn));
        }
        self.report_success();
        self.metrics.upstream_opened();
        info!(
            "{} {:?} connection connid={} established ({})",
            self.settings.uri,
            pool,
            conn.id(),
            conn.peer()
        );
        driver::spawn(
            conn,
            established.stream,
            rx,
            Arc::new(UpstreamHandler),
            self.settings.max_pdus_per_cycle,
            Arc::clone(&self.metrics),
        );
        self.dispatch_waiting();
        // A recovered backend was only probed; bring both pools back up
        self.fill_pools();
    }

    /// Point-in-time view for metrics and readiness.
    pub fn status(&self) -> BackendStatus {
        let st = self.state.lock();
        BackendStatus {
            uri: self.settings.uri.clone(),
            connections: st.pools[Pool::Regular.index()].len(),
            bind_connections: st.pools[Pool::Bind.index()].len(),
            pending_dials: st.pending.len(),
            ops_in_flight: st.n_ops_executing,
            failed_attempts: st.failed,
            eligible: self.eligible_locked(&st, Pool::Regular, Instant::now()),
        }
    }

    /// Stops dialing and closes every connection. Parked operations are
    /// answered with `unavailable`.
    pub fn shutdown(&self) {
        let (conns, waiting) = {
            let mut st = self.state.lock();
            st.shutdown = true;
            for pending in st.pending.drain(..) {
                if let Some(abort) = pending.abort {
                    abort.abort();
                }
            }
            let waiting: Vec<_> = st.waiting.drain(..).map(|(_, op)| op).collect();
            st.n_ops_executing = st.n_ops_executing.saturating_sub(waiting.len() as u64);
            let conns: Vec<_> = st.pools.iter().flatten().cloned().collect();
            (conns, waiting)
        };
        for op in waiting {
            op.send_reject(result_code::UNAVAILABLE, "server is shutting down");
        }
        for conn in conns {
            let mut guard = conn.lock();
            if guard.is_live() {
                Connection::retain(&mut guard);
                conn.mark_dead(guard);
            }
        }
        debug!("{} shut down", self.settings.uri);
    }
}

impl ConnectionOwner for Backend {
    fn connection_destroyed(&self, conn: &Arc<Connection>, orphans: Vec<Arc<Operation>>) {
        let (pooled, shutdown) = {
            let mut st = self.state.lock();
            let mut pooled = false;
            for pool in st.pools.iter_mut() {
                let before = pool.len();
                pool.retain(|c| !Arc::ptr_eq(c, conn));
                pooled |= pool.len() != before;
            }
            st.n_ops_executing = st.n_ops_executing.saturating_sub(orphans.len() as u64);
            (pooled, st.shutdown)
        };
        // Links dropped before promotion were never counted as opened
        if pooled {
            self.metrics.upstream_closed();
        }
        info!(
            "{} connection connid={} closed after {:?}, {} operations lost",
            self.settings.uri,
            conn.id(),
            conn.age(),
            orphans.len()
        );
        for op in orphans {
            op.lost_upstream();
            op.release_side(Side::Upstream);
        }
        if !shutdown {
            self.fill_pools();
        }
    }
}
