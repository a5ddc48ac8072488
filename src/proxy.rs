//! State shared by every client connection, and the routing of their operations.

use crate::backend::{Acquire, Pool};
use crate::client::{ClientHandler, ClientList};
use crate::connection::TlsPhase;
use crate::driver;
use crate::ldap_protocol::result_code;
use crate::metrics::Metrics;
use crate::operation::Operation;
use crate::registry::Registry;
use crate::stream::LinkStream;
use crate::tls::ReloadableAcceptor;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

pub struct Proxy {
    registry: Registry,
    clients: Arc<ClientList>,
    metrics: Arc<Metrics>,
    tls: Option<ReloadableAcceptor>,
    max_pdus_per_cycle: usize,
}

impl Proxy {
    pub fn new(
        registry: Registry,
        metrics: Arc<Metrics>,
        tls: Option<ReloadableAcceptor>,
        max_pdus_per_cycle: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            clients: ClientList::new(Arc::clone(&metrics)),
            metrics,
            tls,
            max_pdus_per_cycle,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn clients(&self) -> &Arc<ClientList> {
        &self.clients
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Current server TLS context, if one is configured.
    pub fn tls_acceptor(&self) -> Option<TlsAcceptor> {
        self.tls.as_ref().map(ReloadableAcceptor::acceptor)
    }

    pub fn reloadable_tls(&self) -> Option<&ReloadableAcceptor> {
        self.tls.as_ref()
    }

    /// Registers an accepted client and starts serving it. False once the
    /// proxy is shutting down.
    pub fn accept(self: &Arc<Self>, stream: LinkStream, peer: String, tls_required: bool) -> bool {
        let tls = if stream.is_tls() {
            TlsPhase::Established
        } else {
            TlsPhase::Cleartext
        };
        let Some((conn, rx)) = self.clients.register(peer, tls) else {
            return false;
        };
        info!("connid={} client connected from {} ({:?})", conn.id(), conn.peer(), tls);
        let handler = Arc::new(ClientHandler::new(Arc::clone(self), tls_required));
        driver::spawn(conn, stream, rx, handler, self.max_pdus_per_cycle, Arc::clone(&self.metrics));
        true
    }

    /// Places `op` on a backend: an idle connection if one is usable,
    /// otherwise parked until a dial completes. Backends are tried in
    /// rotation; when none can take it the client gets `unavailable`.
    pub fn route(&self, op: Arc<Operation>, pool: Pool) {
        let mut tried_any = false;
        for _ in 0..self.registry.len() {
            let Some(backend) = self.registry.select_backend(pool) else {
                break;
            };
            tried_any = true;
            match backend.acquire_connection(pool) {
                Acquire::Ready(conn) => {
                    op.forward(&conn, &backend, backend.settings().proxy_authz);
                    return;
                }
                Acquire::NeedsDial => {
                    if backend.enqueue(Arc::clone(&op), pool) {
                        return;
                    }
                }
                Acquire::Exhausted => {}
            }
            debug!(
                "connid={} msgid={} {} cannot take a {:?} operation",
                op.client_connid(),
                op.client_msgid(),
                backend.uri(),
                pool
            );
        }
        let message = if tried_any {
            "no connections available"
        } else {
            "no backends available"
        };
        op.send_reject(result_code::UNAVAILABLE, message);
    }

    /// Disconnects every client and closes every backend.
    pub fn shutdown(&self) {
        self.clients.shutdown();
        self.registry.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tests::test_backend;
    use crate::backend::{Backend, BackendSettings};
    use crate::connection::tests::CountingOwner;
    use crate::connection::{ConnRole, Connection, ConnectionOwner};
    use crate::ldap_protocol::Pdu;
    use crate::operation::tests::search;
    use std::sync::Weak;

    fn client(owner: &Arc<CountingOwner>) -> (Arc<Connection>, tokio::sync::mpsc::UnboundedReceiver<bytes::Bytes>) {
        let weak = Arc::downgrade(owner) as Weak<dyn ConnectionOwner>;
        Connection::new(ConnRole::Client, "c".into(), TlsPhase::Cleartext, 1, weak)
    }

    #[test]
    fn test_route_without_backends_rejects() {
        let metrics = Arc::new(Metrics::new());
        let proxy = Proxy::new(Registry::new(Vec::new()), Arc::clone(&metrics), None, 10);
        let owner = Arc::new(CountingOwner::default());
        let (conn, mut rx) = client(&owner);
        let op = Operation::begin(&conn, &mut conn.lock(), search(5), &metrics).unwrap();
        proxy.route(op, Pool::Regular);
        let reply = Pdu::decode(rx.try_recv().unwrap()).unwrap();
        assert_eq!(reply.msgid, 5);
        assert_eq!(reply.result_code().unwrap(), result_code::UNAVAILABLE);
        assert_eq!(reply.diagnostic_message().unwrap(), "no backends available");
        assert_eq!(metrics.rejected("search"), 1);
    }

    #[test]
    fn test_route_with_saturated_backends_rejects() {
        let metrics = Arc::new(Metrics::new());
        let mut settings = BackendSettings::new("ldap://a:389").unwrap();
        settings.max_pending_ops = 0;
        let full = Backend::new(settings, Arc::clone(&metrics), None);
        let proxy = Proxy::new(Registry::new(vec![full]), Arc::clone(&metrics), None, 10);
        let owner = Arc::new(CountingOwner::default());
        let (conn, mut rx) = client(&owner);
        let op = Operation::begin(&conn, &mut conn.lock(), search(6), &metrics).unwrap();
        proxy.route(Arc::clone(&op), Pool::Regular);
        let reply = Pdu::decode(rx.try_recv().unwrap()).unwrap();
        assert_eq!(reply.result_code().unwrap(), result_code::UNAVAILABLE);
        assert!(op.is_retired());
    }

    #[tokio::test]
    async fn test_route_parks_operation_while_dialing() {
        let metrics = Arc::new(Metrics::new());
        // the dial task does not get to run before the test yields
        let backend = test_backend("ldap://192.0.2.1:389", &metrics);
        let proxy = Proxy::new(Registry::new(vec![Arc::clone(&backend)]), Arc::clone(&metrics), None, 10);
        let owner = Arc::new(CountingOwner::default());
        let (conn, mut rx) = client(&owner);
        let op = Operation::begin(&conn, &mut conn.lock(), search(8), &metrics).unwrap();
        proxy.route(Arc::clone(&op), Pool::Regular);
        assert!(rx.try_recv().is_err());
        let status = backend.status();
        assert_eq!(status.ops_in_flight, 1);
        assert_eq!(status.pending_dials, 1);
        backend.shutdown();
        let reply = Pdu::decode(rx.try_recv().unwrap()).unwrap();
        assert_eq!(reply.msgid, 8);
        assert_eq!(reply.result_code().unwrap(), result_code::UNAVAILABLE);
    }
}
