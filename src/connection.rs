//! Connections (client or upstream) and their reference protocol.
//!
//! A connection is shared as `Arc<Connection>`, but its lifetime as a routing
//! target is governed by an explicit count kept under its own lock:
//!
//! * `live` liveness tokens, held by whoever keeps the connection registered
//!   (the client list, a backend pool). One at creation.
//! * transient borrows, taken with [`Connection::retain`] by code that needs
//!   the connection to stay valid while it works on it (the I/O driver for its
//!   whole life, a request being forwarded).
//!
//! `refcnt` counts both. The holder whose release takes it to zero runs the
//! teardown, exactly once, after dropping the lock. [`Connection::mark_dead`]
//! forfeits all liveness tokens at once and releases the caller's borrow.

use crate::lock_order::{LockLevel, OrderedGuard, OrderedMutex};
use crate::operation::Operation;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

pub type ConnId = u64;

static NEXT_CONNID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnRole {
    Client,
    /// Shared upstream link carrying multiplexed client operations.
    Upstream,
    /// Upstream link reserved for forwarding client binds, one at a time.
    Bind,
}

impl ConnRole {
    pub fn is_upstream(self) -> bool {
        !matches!(self, ConnRole::Client)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Ready,
    /// Exclusively held, e.g. during a StartTLS handshake.
    Active,
    Binding,
    /// Accepts no new operations.
    Closing,
}

/// TLS status of a connection. Only ever moves forward to `Established`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsPhase {
    Cleartext,
    Ldaps,
    StartTlsOptional,
    StartTls,
    Established,
}

/// Receives a connection once its reference count reaches zero.
pub trait ConnectionOwner: Send + Sync {
    /// Called exactly once per connection, with no locks held, together
    /// with the operations that were still indexed on it.
    fn connection_destroyed(&self, conn: &Arc<Connection>, orphans: Vec<Arc<Operation>>);
}

pub struct ConnectionInner {
    pub(crate) state: ConnState,
    tls: TlsPhase,
    refcnt: u32,
    live: u32,
    destroyed: bool,
    /// Client: next message id expected. Upstream: next id to hand out.
    pub(crate) next_msgid: i32,
    msgid_wrapped: bool,
    pub(crate) ops: BTreeMap<i32, Arc<Operation>>,
    pub(crate) n_ops_executing: u64,
    pub(crate) n_ops_completed: u64,
    pub(crate) last_activity: Instant,
    /// Client: identity established by the last successful bind.
    pub(crate) auth_dn: Option<String>,
    /// Client: bind link pinned for a multi-step SASL exchange.
    pub(crate) pinned_bind: Option<PinnedBind>,
}

#[derive(Clone)]
pub(crate) struct PinnedBind {
    pub(crate) conn: Weak<Connection>,
    pub(crate) backend: Weak<crate::backend::Backend>,
}

pub type ConnGuard<'a> = OrderedGuard<'a, ConnectionInner>;

impl ConnectionInner {
    /// Whether the connection is still a valid routing target.
    pub fn is_live(&self) -> bool {
        self.live > 0 && !self.destroyed
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn refcnt(&self) -> u32 {
        self.refcnt
    }

    pub fn tls(&self) -> TlsPhase {
        self.tls
    }

    /// Records a TLS transition. Leaving `Established` is refused.
    pub fn set_tls(&mut self, phase: TlsPhase) -> bool {
        if self.tls == TlsPhase::Established && phase != TlsPhase::Established {
            return false;
        }
        self.tls = phase;
        true
    }

    /// Hands out the next upstream message id: starts at 1, wraps past
    /// `i32::MAX`, and skips ids still in flight.
    pub fn allocate_msgid(&mut self) -> i32 {
        loop {
            let id = self.next_msgid;
            if id == i32::MAX {
                self.next_msgid = 1;
                self.msgid_wrapped = true;
            } else {
                self.next_msgid = id + 1;
            }
            if !self.ops.contains_key(&id) {
                return id;
            }
        }
    }

    /// Whether `msgid` could have been assigned on this upstream link.
    pub fn was_issued(&self, msgid: i32) -> bool {
        msgid > 0 && (self.msgid_wrapped || msgid < self.next_msgid)
    }
}

pub struct Connection {
    id: ConnId,
    role: ConnRole,
    peer: String,
    started: Instant,
    inner: OrderedMutex<ConnectionInner>,
    outbound: mpsc::UnboundedSender<Bytes>,
    closing: Notify,
    owner: Weak<dyn ConnectionOwner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Creates a connection holding one liveness token. The receiver is the
    /// outbound queue, to be drained by the connection's I/O driver.
    pub fn new(
        role: ConnRole,
        peer: String,
        tls: TlsPhase,
        next_msgid: i32,
        owner: Weak<dyn ConnectionOwner>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            id: NEXT_CONNID.fetch_add(1, Ordering::Relaxed),
            role,
            peer,
            started: Instant::now(),
            inner: OrderedMutex::new(
                LockLevel::Connection,
                ConnectionInner {
                    state: ConnState::Ready,
                    tls,
                    refcnt: 1,
                    live: 1,
                    destroyed: false,
                    next_msgid: next_msgid.max(1),
                    msgid_wrapped: false,
                    ops: BTreeMap::new(),
                    n_ops_executing: 0,
                    n_ops_completed: 0,
                    last_activity: Instant::now(),
                    auth_dn: None,
                    pinned_bind: None,
                },
            ),
            outbound: tx,
            closing: Notify::new(),
            owner,
        });
        debug!("connid={} {:?} connection created for {}", conn.id, role, conn.peer);
        (conn, rx)
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn role(&self) -> ConnRole {
        self.role
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn age(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    pub fn lock(&self) -> ConnGuard<'_> {
        self.inner.lock()
    }

    /// Takes a transient borrow. The caller must have checked the
    /// connection is live under this same guard.
    pub fn retain(guard: &mut ConnGuard<'_>) {
        assert!(guard.refcnt > 0, "retain on a destroyed connection");
        guard.refcnt += 1;
    }

    /// Gives back one reference. Dropping the last one tears the connection down.
    pub fn release(self: &Arc<Self>, mut guard: ConnGuard<'_>) {
        assert!(guard.refcnt > 0, "connection reference count underflow");
        guard.refcnt -= 1;
        if guard.refcnt == 0 {
            self.destroy(guard);
        }
    }

    /// Withdraws the connection from service: forfeits every liveness token,
    /// wakes the I/O driver so it closes the socket, and releases the
    /// caller's own borrow.
    pub fn mark_dead(self: &Arc<Self>, mut guard: ConnGuard<'_>) {
        let live = guard.live;
        assert!(guard.refcnt > live, "mark_dead without a borrowed reference");
        guard.refcnt -= live;
        guard.live = 0;
        guard.state = ConnState::Closing;
        self.closing.notify_one();
        self.release(guard);
    }

    fn destroy(self: &Arc<Self>, mut guard: ConnGuard<'_>) {
        debug_assert!(!guard.destroyed);
        guard.destroyed = true;
        guard.live = 0;
        guard.state = ConnState::Closing;
        let orphans: Vec<Arc<Operation>> = std::mem::take(&mut guard.ops).into_values().collect();
        guard.n_ops_executing = 0;
        drop(guard);

        self.closing.notify_one();
        debug!(
            "connid={} {:?} connection destroyed after {:?} ({} operations orphaned)",
            self.id,
            self.role,
            self.started.elapsed(),
            orphans.len()
        );
        if let Some(owner) = self.owner.upgrade() {
            owner.connection_destroyed(self, orphans);
        }
    }

    /// Queues an encoded PDU for the I/O driver. Callers hold the lock so
    /// writes reach the socket in the order they were decided.
    pub fn send(&self, guard: &ConnGuard<'_>, pdu: Bytes) -> bool {
        if guard.destroyed {
            return false;
        }
        self.outbound.send(pdu).is_ok()
    }

    /// Resolves once the connection has been marked dead or destroyed.
    pub(crate) async fn closing(&self) {
        self.closing.notified().await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    pub(crate) struct CountingOwner {
        pub(crate) destroyed: AtomicUsize,
        pub(crate) orphans: AtomicUsize,
    }

    impl ConnectionOwner for CountingOwner {
        fn connection_destroyed(&self, _conn: &Arc<Connection>, orphans: Vec<Arc<Operation>>) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            self.orphans.fetch_add(orphans.len(), Ordering::SeqCst);
        }
    }

    pub(crate) fn test_connection(role: ConnRole, owner: &Arc<CountingOwner>) -> Arc<Connection> {
        let weak = Arc::downgrade(owner) as Weak<dyn ConnectionOwner>;
        let (conn, rx) = Connection::new(role, "test".into(), TlsPhase::Cleartext, 1, weak);
        // keep the queue open for the connection's lifetime
        std::mem::forget(rx);
        conn
    }

    #[test]
    fn test_retain_release_destroys_once() {
        let owner = Arc::new(CountingOwner::default());
        let conn = test_connection(ConnRole::Upstream, &owner);
        {
            let mut g = conn.lock();
            Connection::retain(&mut g);
            Connection::retain(&mut g);
            assert_eq!(g.refcnt(), 3);
        }
        conn.release(conn.lock());
        conn.release(conn.lock());
        assert_eq!(owner.destroyed.load(Ordering::SeqCst), 0);
        assert!(conn.lock().is_live());
        conn.release(conn.lock());
        assert_eq!(owner.destroyed.load(Ordering::SeqCst), 1);
        let g = conn.lock();
        assert!(g.is_destroyed());
        assert!(!g.is_live());
        assert_eq!(g.refcnt(), 0);
    }

    #[test]
    fn test_retain_release_sequences() {
        // Every interleaving of retain/release that starts at 1 destroys
        // exactly when the count first returns to zero.
        let patterns: [&[bool]; 4] = [
            &[true, false, false],
            &[true, true, false, false, false],
            &[true, false, true, false, false],
            &[false],
        ];
        for pattern in patterns {
            let owner = Arc::new(CountingOwner::default());
            let conn = test_connection(ConnRole::Client, &owner);
            let mut count = 1u32;
            for &is_retain in pattern {
                if is_retain {
                    Connection::retain(&mut conn.lock());
                    count += 1;
                } else {
                    conn.release(conn.lock());
                    count -= 1;
                }
                let expected = if count == 0 { 1 } else { 0 };
                assert_eq!(owner.destroyed.load(Ordering::SeqCst), expected);
                assert_eq!(conn.lock().refcnt(), count);
            }
        }
    }

    #[test]
    fn test_mark_dead_with_outstanding_borrow() {
        let owner = Arc::new(CountingOwner::default());
        let conn = test_connection(ConnRole::Upstream, &owner);
        // the I/O driver's borrow, and one held by a request in flight
        Connection::retain(&mut conn.lock());
        Connection::retain(&mut conn.lock());

        let g = conn.lock();
        conn.mark_dead(g);
        {
            let g = conn.lock();
            assert!(!g.is_live());
            assert_eq!(g.state, ConnState::Closing);
            assert_eq!(g.refcnt(), 1);
        }
        assert_eq!(owner.destroyed.load(Ordering::SeqCst), 0);
        // the remaining borrower finishes; marking dead again is harmless
        Connection::retain(&mut conn.lock());
        conn.mark_dead(conn.lock());
        assert_eq!(owner.destroyed.load(Ordering::SeqCst), 0);
        conn.release(conn.lock());
        assert_eq!(owner.destroyed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_send_after_destroy_is_refused() {
        let owner = Arc::new(CountingOwner::default());
        let weak = Arc::downgrade(&owner) as Weak<dyn ConnectionOwner>;
        let (conn, mut rx) = Connection::new(ConnRole::Client, "p".into(), TlsPhase::Cleartext, 1, weak);
        assert!(conn.send(&conn.lock(), Bytes::from_static(b"a")));
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"a"));
        conn.release(conn.lock());
        assert!(!conn.send(&conn.lock(), Bytes::from_static(b"b")));
    }

    #[test]
    fn test_allocate_msgid_skips_in_flight_and_wraps() {
        let owner = Arc::new(CountingOwner::default());
        let conn = test_connection(ConnRole::Upstream, &owner);
        let mut g = conn.lock();
        assert!(!g.was_issued(1));
        assert_eq!(g.allocate_msgid(), 1);
        assert_eq!(g.allocate_msgid(), 2);
        assert!(g.was_issued(2));
        assert!(!g.was_issued(3));
        g.next_msgid = i32::MAX;
        assert_eq!(g.allocate_msgid(), i32::MAX);
        assert_eq!(g.next_msgid, 1);
        assert!(g.was_issued(500));
        assert!(!g.was_issued(0));
    }

    #[test]
    fn test_tls_phase_is_monotonic() {
        let owner = Arc::new(CountingOwner::default());
        let conn = test_connection(ConnRole::Client, &owner);
        let mut g = conn.lock();
        assert!(g.set_tls(TlsPhase::StartTls));
        assert!(g.set_tls(TlsPhase::Established));
        assert!(!g.set_tls(TlsPhase::Cleartext));
        assert_eq!(g.tls(), TlsPhase::Established);
    }
}
