//! Accepted client connections and the handling of their requests.

use crate::backend::Pool;
use crate::connection::{
    ConnGuard, ConnId, ConnRole, ConnState, Connection, ConnectionOwner, PinnedBind, TlsPhase,
};
use crate::driver::{Next, PduHandler};
use crate::error::ProtocolError;
use crate::framing::MAX_CLIENT_PDU;
use crate::ldap_protocol::{
    encode_notice_of_disconnection, encode_result, is_request_tag, response_tag_for_request,
    result_code, Pdu, LDAP_TAG_ABANDON_REQUEST, LDAP_TAG_BIND_REQUEST, LDAP_TAG_EXTENDED_REQUEST,
    LDAP_TAG_EXTENDED_RESPONSE, LDAP_TAG_UNBIND_REQUEST, START_TLS_OID,
};
use crate::metrics::Metrics;
use crate::operation::{Operation, Side};
use crate::proxy::Proxy;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info};

/// Every client connection still open. Owns their liveness tokens.
pub struct ClientList {
    clients: DashMap<ConnId, Arc<Connection>>,
    metrics: Arc<Metrics>,
    slot_freed: Notify,
    closing: AtomicBool,
    me: Weak<ClientList>,
}

impl ClientList {
    pub fn new(metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            clients: DashMap::new(),
            metrics,
            slot_freed: Notify::new(),
            closing: AtomicBool::new(false),
            me: me.clone(),
        })
    }

    /// Creates the connection for a freshly accepted socket. None once
    /// shutdown has begun.
    pub fn register(&self, peer: String, tls: TlsPhase) -> Option<(Arc<Connection>, mpsc::UnboundedReceiver<Bytes>)> {
        if self.closing.load(Ordering::SeqCst) {
            return None;
        }
        let owner: Weak<dyn ConnectionOwner> = self.me.clone();
        let (conn, rx) = Connection::new(ConnRole::Client, peer, tls, 1, owner);
        self.clients.insert(conn.id(), Arc::clone(&conn));
        self.metrics.client_connected();
        Some((conn, rx))
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Resolves after some client connection has been torn down.
    pub async fn slot_freed(&self) {
        self.slot_freed.notified().await
    }

    /// Tells every client the server is going away and closes them.
    pub fn shutdown(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let clients: Vec<Arc<Connection>> = self.clients.iter().map(|e| Arc::clone(e.value())).collect();
        info!("Disconnecting {} clients", clients.len());
        for conn in clients {
            let mut guard = conn.lock();
            if guard.is_live() {
                conn.send(
                    &guard,
                    encode_notice_of_disconnection(result_code::UNAVAILABLE, "server is shutting down"),
                );
                Connection::retain(&mut guard);
                conn.mark_dead(guard);
            }
        }
    }
}

impl ConnectionOwner for ClientList {
    fn connection_destroyed(&self, conn: &Arc<Connection>, orphans: Vec<Arc<Operation>>) {
        self.clients.remove(&conn.id());
        self.metrics.client_disconnected();
        let pinned = conn.lock().pinned_bind.take();
        if let Some(upstream) = pinned.and_then(|p| p.conn.upgrade()) {
            let mut guard = upstream.lock();
            if guard.is_live() && guard.state == ConnState::Binding {
                // half-finished SASL exchange
                Connection::retain(&mut guard);
                upstream.mark_dead(guard);
            }
        }
        info!(
            "connid={} client {} disconnected after {:?}, {} operations still upstream",
            conn.id(),
            conn.peer(),
            conn.age(),
            orphans.len()
        );
        // Upstream replies still due for these are discarded when they arrive
        for op in orphans {
            op.release_side(Side::Client);
        }
        self.slot_freed.notify_one();
    }
}

/// Request dispatch for one client connection.
pub struct ClientHandler {
    proxy: Arc<Proxy>,
    tls_required: bool,
}

impl ClientHandler {
    pub fn new(proxy: Arc<Proxy>, tls_required: bool) -> Self {
        Self { proxy, tls_required }
    }

    fn reply(conn: &Connection, guard: &ConnGuard<'_>, pdu: &Pdu, code: u32, message: &str) {
        if let Some(tag) = response_tag_for_request(pdu.tag) {
            conn.send(guard, encode_result(pdu.msgid, tag, code, "", message));
        }
        debug!("connid={} msgid={} answered locally: {} ({})", conn.id(), pdu.msgid, message, code);
    }

    fn needs_tls(&self, guard: &ConnGuard<'_>) -> bool {
        self.tls_required && guard.tls() != TlsPhase::Established
    }

    fn abandon(&self, conn: &Arc<Connection>, pdu: &Pdu) -> Result<Next, ProtocolError> {
        let target = pdu.abandon_target()?;
        let op = Operation::resolve(&conn.lock(), target);
        match op {
            Some(op) => op.abandon(),
            None => debug!("connid={} abandon of msgid={} not in flight", conn.id(), target),
        }
        Ok(Next::Continue)
    }

    fn start_tls(&self, conn: &Arc<Connection>, pdu: &Pdu) -> Result<Next, ProtocolError> {
        let mut guard = conn.lock();
        let refusal = match self.proxy.tls_acceptor() {
            None => Err((result_code::UNAVAILABLE, "StartTLS is not configured")),
            Some(_) if guard.tls() != TlsPhase::Cleartext => {
                Err((result_code::OPERATIONS_ERROR, "TLS is already established"))
            }
            Some(_) if !guard.ops.is_empty() || guard.state != ConnState::Ready => {
                Err((result_code::OPERATIONS_ERROR, "operations are still outstanding"))
            }
            Some(acceptor) => Ok(acceptor),
        };
        let acceptor = match refusal {
            Ok(acceptor) => acceptor,
            Err((code, message)) => {
                Self::reply(conn, &guard, pdu, code, message);
                return Ok(Next::Continue);
            }
        };
        // Nothing else is read until the handshake is over
        guard.state = ConnState::Active;
        guard.set_tls(TlsPhase::StartTls);
        debug!("connid={} StartTLS accepted", conn.id());
        Ok(Next::StartTls {
            response: encode_result(pdu.msgid, LDAP_TAG_EXTENDED_RESPONSE, result_code::SUCCESS, "", ""),
            acceptor,
        })
    }

    fn bind(&self, conn: &Arc<Connection>, pdu: Pdu) -> Result<Next, ProtocolError> {
        let (op, pinned, outstanding) = {
            let mut guard = conn.lock();
            if self.needs_tls(&guard) {
                Self::reply(conn, &guard, &pdu, result_code::CONFIDENTIALITY_REQUIRED, "TLS confidentiality required");
                return Ok(Next::Continue);
            }
            let pinned = guard.pinned_bind.take();
            if guard.state == ConnState::Binding && pinned.is_none() {
                Self::reply(conn, &guard, &pdu, result_code::OPERATIONS_ERROR, "bind already in progress");
                return Ok(Next::Continue);
            }
            // A bind supersedes everything still outstanding on the client
            let outstanding: Vec<Arc<Operation>> = guard.ops.values().cloned().collect();
            let op = Operation::begin(conn, &mut guard, pdu, self.proxy.metrics())?;
            guard.state = ConnState::Binding;
            (op, pinned, outstanding)
        };
        for stale in outstanding {
            stale.abandon();
        }
        match pinned {
            Some(pin) => {
                if !resume_sasl(&op, &pin) {
                    op.send_reject(result_code::UNAVAILABLE, "SASL bind connection lost");
                }
            }
            None => self.proxy.route(op, Pool::Bind),
        }
        Ok(Next::Continue)
    }

    fn request(&self, conn: &Arc<Connection>, pdu: Pdu) -> Result<Next, ProtocolError> {
        let op = {
            let mut guard = conn.lock();
            if guard.state == ConnState::Binding {
                Self::reply(conn, &guard, &pdu, result_code::OPERATIONS_ERROR, "bind in progress");
                return Ok(Next::Continue);
            }
            if self.needs_tls(&guard) {
                Self::reply(conn, &guard, &pdu, result_code::CONFIDENTIALITY_REQUIRED, "TLS confidentiality required");
                return Ok(Next::Continue);
            }
            Operation::begin(conn, &mut guard, pdu, self.proxy.metrics())?
        };
        self.proxy.route(op, Pool::Regular);
        Ok(Next::Continue)
    }
}

/// Sends the next step of a SASL exchange on the bind link that carried
/// the previous ones.
fn resume_sasl(op: &Arc<Operation>, pin: &PinnedBind) -> bool {
    let (Some(upstream), Some(backend)) = (pin.conn.upgrade(), pin.backend.upgrade()) else {
        return false;
    };
    {
        let mut guard = upstream.lock();
        if !guard.is_live() || guard.state != ConnState::Binding || !guard.ops.is_empty() {
            return false;
        }
        Connection::retain(&mut guard);
    }
    backend.reserve();
    op.forward(&upstream, &backend, false);
    true
}

impl PduHandler for ClientHandler {
    fn max_pdu_len(&self) -> usize {
        MAX_CLIENT_PDU
    }

    fn handle(&self, conn: &Arc<Connection>, pdu: Pdu) -> Result<Next, ProtocolError> {
        match pdu.tag {
            LDAP_TAG_UNBIND_REQUEST => {
                debug!("connid={} unbind", conn.id());
                Ok(Next::Close)
            }
            LDAP_TAG_ABANDON_REQUEST => self.abandon(conn, &pdu),
            LDAP_TAG_BIND_REQUEST => self.bind(conn, pdu),
            LDAP_TAG_EXTENDED_REQUEST if pdu.extended_oid().as_deref() == Some(START_TLS_OID) => {
                self.start_tls(conn, &pdu)
            }
            tag if is_request_tag(tag) => self.request(conn, pdu),
            tag => Err(ProtocolError::UnexpectedOp(tag)),
        }
    }

    fn protocol_error_notice(&self, err: &ProtocolError) -> Option<Bytes> {
        Some(encode_notice_of_disconnection(result_code::PROTOCOL_ERROR, &err.to_string()))
    }
}
