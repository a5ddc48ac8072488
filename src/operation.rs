//! One client request in flight, correlated across its client and upstream links.
//!
//! An operation is indexed under its client message id on the client
//! connection and, once forwarded, under a fresh message id on the upstream
//! connection. Each side detaches independently; the operation is retired
//! when the last side that ever referenced it lets go:
//!
//! * client detaches, upstream never attached: retired by the client side
//! * both sides detached: retired by whichever side detached second
//!
//! Back-references to connections are weak. Before touching a connection
//! found through them, the connection is upgraded, locked and checked live.

use crate::backend::Backend;
use crate::connection::{ConnGuard, ConnId, ConnRole, ConnState, Connection};
use crate::error::ProtocolError;
use crate::ldap_protocol::{
    encode_abandon, encode_result, op_name, response_tag_for_request, result_code, Pdu,
    LDAP_TAG_BIND_REQUEST,
};
use crate::lock_order::{LockLevel, OrderedMutex};
use crate::metrics::Metrics;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Upstream,
}

impl Side {
    fn bit(self) -> u8 {
        match self {
            Side::Client => 0b01,
            Side::Upstream => 0b10,
        }
    }
}

struct OperationLink {
    client: Weak<Connection>,
    upstream: Weak<Connection>,
    upstream_msgid: i32,
    backend: Weak<Backend>,
}

#[derive(Default)]
struct OperationState {
    /// Sides that have started detaching.
    freeing: u8,
    upstream_attached: bool,
    destroyed: bool,
}

/// Outcome of detaching one side under that side's connection lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detached {
    /// The operation was still in the connection's index and has been removed.
    pub removed: bool,
    /// This call retired the operation.
    pub retired: bool,
}

pub struct Operation {
    client_connid: ConnId,
    client_msgid: i32,
    tag: u8,
    request: Pdu,
    /// Authorization identity asserted upstream when proxy authorization is on.
    authz_id: String,
    bind_dn: Option<String>,
    started: Instant,
    metrics: Arc<Metrics>,
    link: OrderedMutex<OperationLink>,
    state: OrderedMutex<OperationState>,
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("client_connid", &self.client_connid)
            .field("client_msgid", &self.client_msgid)
            .field("op", &op_name(self.tag))
            .finish_non_exhaustive()
    }
}

impl Operation {
    /// Creates the operation for `request` and indexes it on the client.
    ///
    /// Requires the client's lock. Message id 0 and an id already in flight
    /// on this client are protocol errors.
    pub fn begin(
        client: &Arc<Connection>,
        guard: &mut ConnGuard<'_>,
        request: Pdu,
        metrics: &Arc<Metrics>,
    ) -> Result<Arc<Operation>, ProtocolError> {
        let msgid = request.msgid;
        if msgid == 0 {
            return Err(ProtocolError::InvalidMessageId(0));
        }
        if guard.ops.contains_key(&msgid) {
            return Err(ProtocolError::DuplicateMessageId(msgid));
        }
        let bind_dn = if request.tag == LDAP_TAG_BIND_REQUEST {
            Some(request.bind_dn()?)
        } else {
            None
        };
        let authz_id = guard
            .auth_dn
            .as_deref()
            .filter(|dn| !dn.is_empty())
            .map(|dn| format!("dn:{}", dn))
            .unwrap_or_default();
        let op = Arc::new(Operation {
            client_connid: client.id(),
            client_msgid: msgid,
            tag: request.tag,
            request,
            authz_id,
            bind_dn,
            started: Instant::now(),
            metrics: Arc::clone(metrics),
            link: OrderedMutex::new(
                LockLevel::OperationLink,
                OperationLink {
                    client: Arc::downgrade(client),
                    upstream: Weak::new(),
                    upstream_msgid: 0,
                    backend: Weak::new(),
                },
            ),
            state: OrderedMutex::new(LockLevel::OperationState, OperationState::default()),
        });
        guard.ops.insert(msgid, Arc::clone(&op));
        guard.n_ops_executing += 1;
        guard.next_msgid = msgid.wrapping_add(1).max(1);
        metrics.operation_started(op_name(op.tag));
        debug!(
            "connid={} msgid={} {} operation received",
            op.client_connid,
            msgid,
            op_name(op.tag)
        );
        Ok(op)
    }

    pub fn client_connid(&self) -> ConnId {
        self.client_connid
    }

    pub fn client_msgid(&self) -> i32 {
        self.client_msgid
    }

    pub fn tag(&self) -> u8 {
        self.tag
    }

    pub fn is_bind(&self) -> bool {
        self.tag == LDAP_TAG_BIND_REQUEST
    }

    pub fn bind_dn(&self) -> Option<&str> {
        self.bind_dn.as_deref()
    }

    pub fn name(&self) -> &'static str {
        op_name(self.tag)
    }

    /// Indexes the operation on `upstream` under a fresh message id.
    ///
    /// Requires the upstream's lock. Fails when the operation has already
    /// been retired or its upstream side released.
    pub fn attach_upstream(
        self: &Arc<Self>,
        upstream: &Arc<Connection>,
        guard: &mut ConnGuard<'_>,
        backend: &Arc<Backend>,
    ) -> Option<i32> {
        let mut link = self.link.lock();
        let mut state = self.state.lock();
        if state.destroyed || state.freeing & Side::Upstream.bit() != 0 {
            return None;
        }
        let msgid = guard.allocate_msgid();
        guard.ops.insert(msgid, Arc::clone(self));
        guard.n_ops_executing += 1;
        link.upstream = Arc::downgrade(upstream);
        link.upstream_msgid = msgid;
        link.backend = Arc::downgrade(backend);
        state.upstream_attached = true;
        Some(msgid)
    }

    /// Looks up an operation by the message id it carries on this connection.
    pub fn resolve(guard: &ConnGuard<'_>, msgid: i32) -> Option<Arc<Operation>> {
        guard.ops.get(&msgid).cloned()
    }

    fn index_key(&self, side: Side) -> i32 {
        match side {
            Side::Client => self.client_msgid,
            Side::Upstream => self.link.lock().upstream_msgid,
        }
    }

    /// Whether the operation is still indexed on the connection behind `guard`.
    pub fn is_indexed(self: &Arc<Self>, side: Side, guard: &ConnGuard<'_>) -> bool {
        let key = self.index_key(side);
        guard.ops.get(&key).is_some_and(|op| Arc::ptr_eq(op, self))
    }

    /// Detaches `side`, holding that side's connection lock.
    pub fn detach_locked(self: &Arc<Self>, side: Side, guard: &mut ConnGuard<'_>) -> Detached {
        let removed = self.is_indexed(side, guard);
        if removed {
            guard.ops.remove(&self.index_key(side));
            guard.n_ops_executing = guard.n_ops_executing.saturating_sub(1);
            guard.n_ops_completed += 1;
        }
        Detached {
            removed,
            retired: self.release_side(side),
        }
    }

    /// Marks `side` as let go. Idempotent per side; returns whether this
    /// call retired the operation.
    pub fn release_side(&self, side: Side) -> bool {
        let mut state = self.state.lock();
        if state.destroyed || state.freeing & side.bit() != 0 {
            return false;
        }
        state.freeing |= side.bit();
        let client_done = state.freeing & Side::Client.bit() != 0;
        let upstream_done = state.freeing & Side::Upstream.bit() != 0 || !state.upstream_attached;
        if client_done && upstream_done {
            state.destroyed = true;
            drop(state);
            self.retire();
            return true;
        }
        false
    }

    fn retire(&self) {
        let elapsed = self.started.elapsed();
        self.metrics.operation_finished(self.name(), elapsed);
        debug!(
            "connid={} msgid={} {} operation finished in {:?}",
            self.client_connid,
            self.client_msgid,
            self.name(),
            elapsed
        );
    }

    pub fn is_retired(&self) -> bool {
        self.state.lock().destroyed
    }

    pub(crate) fn client(&self) -> Option<Arc<Connection>> {
        self.link.lock().client.upgrade()
    }

    pub(crate) fn upstream(&self) -> Option<(Arc<Connection>, i32)> {
        let link = self.link.lock();
        link.upstream.upgrade().map(|c| (c, link.upstream_msgid))
    }

    pub(crate) fn backend(&self) -> Option<Arc<Backend>> {
        self.link.lock().backend.upgrade()
    }

    /// Sends the request on `upstream`.
    ///
    /// Consumes the caller's borrow on `upstream` and the backend's
    /// reservation for this operation. Returns false when the request could
    /// not be sent; the client has then been answered or is gone.
    pub fn forward(self: &Arc<Self>, upstream: &Arc<Connection>, backend: &Arc<Backend>, proxy_authz: bool) -> bool {
        let mut guard = upstream.lock();
        if !guard.is_live() {
            upstream.release(guard);
            backend.operation_finished();
            self.send_reject(result_code::UNAVAILABLE, "upstream connection is closing");
            return false;
        }
        let Some(msgid) = self.attach_upstream(upstream, &mut guard, backend) else {
            // The client left before the request could be sent
            if upstream.role() == ConnRole::Bind {
                guard.state = ConnState::Ready;
            }
            upstream.release(guard);
            backend.operation_finished();
            return false;
        };
        if upstream.role() == ConnRole::Bind {
            guard.state = ConnState::Binding;
        }
        let pdu = if proxy_authz && upstream.role() == ConnRole::Upstream {
            self.request.encode_with_proxy_authz(msgid, &self.authz_id)
        } else {
            self.request.encode(msgid)
        };
        upstream.send(&guard, pdu);
        trace!(
            "connid={} msgid={} forwarded to upstream connid={} as msgid={}",
            self.client_connid,
            self.client_msgid,
            upstream.id(),
            msgid
        );
        upstream.release(guard);
        self.metrics.inc_backend_request(backend.uri(), self.name());
        true
    }

    /// Answers the client with `code` and detaches the client side.
    ///
    /// Nothing is sent when the client is gone or no longer indexes this
    /// operation. A rejected bind returns the client to `Ready`.
    pub fn send_reject(self: &Arc<Self>, code: u32, message: &str) {
        let Some(client) = self.client() else {
            self.release_side(Side::Client);
            return;
        };
        let mut guard = client.lock();
        if guard.is_live() && self.is_indexed(Side::Client, &guard) {
            if let Some(tag) = response_tag_for_request(self.tag) {
                client.send(&guard, encode_result(self.client_msgid, tag, code, "", message));
            }
            if self.is_bind() && guard.state == ConnState::Binding {
                guard.state = ConnState::Ready;
                guard.pinned_bind = None;
            }
            self.metrics.inc_rejected(self.name());
            debug!(
                "connid={} msgid={} {} rejected: {} ({})",
                self.client_connid,
                self.client_msgid,
                self.name(),
                message,
                code
            );
        }
        self.detach_locked(Side::Client, &mut guard);
    }

    /// The upstream link carrying this operation died.
    pub fn lost_upstream(self: &Arc<Self>) {
        self.send_reject(
            result_code::UNAVAILABLE,
            "connection to the remote server has been severed",
        );
    }

    /// Client-requested abandon: withdraws the operation from its upstream
    /// (telling the server so) and from the client, without any reply.
    pub fn abandon(self: &Arc<Self>) {
        if let Some((upstream, upstream_msgid)) = self.upstream() {
            let mut guard = upstream.lock();
            let detached = self.detach_locked(Side::Upstream, &mut guard);
            if detached.removed && guard.is_live() {
                if upstream.role() == ConnRole::Bind {
                    // A bind cannot be abandoned; the link's identity is unknown now
                    Connection::retain(&mut guard);
                    upstream.mark_dead(guard);
                } else {
                    let id = guard.allocate_msgid();
                    upstream.send(&guard, encode_abandon(id, upstream_msgid));
                    drop(guard);
                }
            } else {
                drop(guard);
            }
            if detached.removed {
                if let Some(backend) = self.backend() {
                    backend.operation_finished();
                }
            }
        }
        match self.client() {
            Some(client) => {
                let mut guard = client.lock();
                if self.is_bind() && guard.state == ConnState::Binding {
                    guard.state = ConnState::Ready;
                    guard.pinned_bind = None;
                }
                self.detach_locked(Side::Client, &mut guard);
            }
            None => {
                self.release_side(Side::Client);
            }
        }
        self.metrics.inc_abandoned();
        debug!(
            "connid={} msgid={} {} operation abandoned",
            self.client_connid,
            self.client_msgid,
            self.name()
        );
    }
}
