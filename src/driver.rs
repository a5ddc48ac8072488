//! Per-connection I/O task: drains the outbound queue to the socket, splits
//! inbound bytes into PDUs and hands them to the connection's handler.
//!
//! The task holds one counted borrow on its connection for as long as it
//! runs and marks the connection dead when it exits, for whatever reason.

use crate::connection::{ConnState, Connection, TlsPhase};
use crate::error::ProtocolError;
use crate::framing::next_frame;
use crate::ldap_protocol::Pdu;
use crate::metrics::Metrics;
use crate::stream::LinkStream;
use bytes::{Bytes, BytesMut};
use std::io;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

/// What the driver does after a PDU was handled.
pub enum Next {
    Continue,
    Close,
    /// Send `response` in the clear, then run the server side of a TLS
    /// handshake on the socket.
    StartTls { response: Bytes, acceptor: TlsAcceptor },
}

pub trait PduHandler: Send + Sync + 'static {
    /// Largest PDU accepted from the peer.
    fn max_pdu_len(&self) -> usize;

    /// Handles one PDU read from `conn`. An error closes the connection.
    fn handle(&self, conn: &Arc<Connection>, pdu: Pdu) -> Result<Next, ProtocolError>;

    /// PDU written to the peer before a connection is closed for a protocol error.
    fn protocol_error_notice(&self, _err: &ProtocolError) -> Option<Bytes> {
        None
    }
}

enum Event {
    Closing,
    Outbound(Option<Bytes>),
    Read(io::Result<usize>),
}

/// Starts the I/O task for a connection that was just created.
pub fn spawn(
    conn: Arc<Connection>,
    stream: LinkStream,
    outbound: mpsc::UnboundedReceiver<Bytes>,
    handler: Arc<dyn PduHandler>,
    max_pdus_per_cycle: usize,
    metrics: Arc<Metrics>,
) -> JoinHandle<()> {
    Connection::retain(&mut conn.lock());
    tokio::spawn(run(conn, stream, outbound, handler, max_pdus_per_cycle.max(1), metrics))
}

async fn write_queued(
    stream: &mut LinkStream,
    first: Bytes,
    outbound: &mut mpsc::UnboundedReceiver<Bytes>,
) -> io::Result<()> {
    stream.write_all(&first).await?;
    while let Ok(pdu) = outbound.try_recv() {
        stream.write_all(&pdu).await?;
    }
    stream.flush().await
}

async fn run(
    conn: Arc<Connection>,
    mut stream: LinkStream,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    handler: Arc<dyn PduHandler>,
    max_pdus_per_cycle: usize,
    metrics: Arc<Metrics>,
) {
    let mut buffer = BytesMut::with_capacity(4096);
    let max_pdu = handler.max_pdu_len();

    let reason: String = 'io: loop {
        if !conn.lock().is_live() {
            break 'io "marked dead".into();
        }
        let event = tokio::select! {
            _ = conn.closing() => Event::Closing,
            pdu = outbound.recv() => Event::Outbound(pdu),
            n = stream.read_buf(&mut buffer) => Event::Read(n),
        };
        match event {
            Event::Closing => break 'io "marked dead".into(),
            Event::Outbound(None) => break 'io "outbound queue closed".into(),
            Event::Outbound(Some(pdu)) => {
                if let Err(e) = write_queued(&mut stream, pdu, &mut outbound).await {
                    break 'io format!("write failed: {}", e);
                }
            }
            Event::Read(Err(e)) => break 'io format!("read failed: {}", e),
            Event::Read(Ok(0)) => break 'io "closed by peer".into(),
            Event::Read(Ok(_)) => {
                conn.lock().last_activity = Instant::now();
                let mut handled = 0;
                loop {
                    let frame = match next_frame(&mut buffer, max_pdu) {
                        Ok(Some(frame)) => frame,
                        Ok(None) => break,
                        Err(e) => {
                            notify_protocol_error(&conn, &mut stream, &*handler, &metrics, &e).await;
                            break 'io format!("protocol error: {}", e);
                        }
                    };
                    let result = Pdu::decode(frame).and_then(|pdu| handler.handle(&conn, pdu));
                    match result {
                        Ok(Next::Continue) => {}
                        Ok(Next::Close) => break 'io "closed by request".into(),
                        Ok(Next::StartTls { response, acceptor }) => {
                            if let Err(e) = write_queued(&mut stream, response, &mut outbound).await {
                                break 'io format!("write failed: {}", e);
                            }
                            // Bytes sent ahead of the handshake are not trusted
                            buffer.clear();
                            stream = match stream.accept_tls(&acceptor).await {
                                Ok(tls) => tls,
                                Err(e) => {
                                    // The socket went down with the failed handshake
                                    debug!("connid={} StartTLS handshake with {} failed: {}", conn.id(), conn.peer(), e);
                                    let guard = conn.lock();
                                    conn.mark_dead(guard);
                                    return;
                                }
                            };
                            let mut guard = conn.lock();
                            guard.set_tls(TlsPhase::Established);
                            guard.state = ConnState::Ready;
                            drop(guard);
                            debug!("connid={} TLS established", conn.id());
                            break;
                        }
                        Err(e) => {
                            notify_protocol_error(&conn, &mut stream, &*handler, &metrics, &e).await;
                            break 'io format!("protocol error: {}", e);
                        }
                    }
                    handled += 1;
                    if handled >= max_pdus_per_cycle {
                        handled = 0;
                        tokio::task::yield_now().await;
                    }
                }
            }
        }
    };

    // Deliver what was queued before the connection went down
    while let Ok(pdu) = outbound.try_recv() {
        if stream.write_all(&pdu).await.is_err() {
            break;
        }
    }
    let _ = stream.shutdown().await;
    let guard = conn.lock();
    debug!(
        "connid={} {:?} connection to {} closing after {} operations, idle {:?}: {}",
        conn.id(),
        conn.role(),
        conn.peer(),
        guard.n_ops_completed,
        guard.last_activity.elapsed(),
        reason
    );
    conn.mark_dead(guard);
}

async fn notify_protocol_error(
    conn: &Connection,
    stream: &mut LinkStream,
    handler: &dyn PduHandler,
    metrics: &Metrics,
    err: &ProtocolError,
) {
    metrics.inc_protocol_error();
    warn!("connid={} protocol error from {}: {}", conn.id(), conn.peer(), err);
    if let Some(notice) = handler.protocol_error_notice(err) {
        let _ = stream.write_all(&notice).await;
        let _ = stream.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::CountingOwner;
    use crate::connection::{ConnRole, ConnectionOwner};
    use crate::ldap_protocol::encode_abandon;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Weak;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};

    /// Echoes every PDU back, closes on message id 99 and starts TLS on 77.
    #[derive(Default)]
    struct Echo {
        seen: AtomicUsize,
    }

    /// Server context without a certificate; every handshake fails.
    #[derive(Debug)]
    struct NoCertificate;

    impl rustls::server::ResolvesServerCert for NoCertificate {
        fn resolve(&self, _hello: rustls::server::ClientHello<'_>) -> Option<Arc<rustls::sign::CertifiedKey>> {
            None
        }
    }

    fn acceptor_without_certificate() -> TlsAcceptor {
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(NoCertificate));
        TlsAcceptor::from(Arc::new(config))
    }

    impl PduHandler for Echo {
        fn max_pdu_len(&self) -> usize {
            64
        }

        fn handle(&self, conn: &Arc<Connection>, pdu: Pdu) -> Result<Next, ProtocolError> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            if pdu.msgid == 99 {
                return Ok(Next::Close);
            }
            if pdu.msgid == 77 {
                return Ok(Next::StartTls {
                    response: pdu.encode(77),
                    acceptor: acceptor_without_certificate(),
                });
            }
            let guard = conn.lock();
            conn.send(&guard, pdu.encode(pdu.msgid));
            Ok(Next::Continue)
        }

        fn protocol_error_notice(&self, _err: &ProtocolError) -> Option<Bytes> {
            Some(Bytes::from_static(b"bye"))
        }
    }

    async fn pair() -> (TcpStream, LinkStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, LinkStream::Tcp(server))
    }

    fn conn(owner: &Arc<CountingOwner>) -> (Arc<Connection>, mpsc::UnboundedReceiver<Bytes>) {
        let weak = Arc::downgrade(owner) as Weak<dyn ConnectionOwner>;
        Connection::new(ConnRole::Client, "test".into(), TlsPhase::Cleartext, 1, weak)
    }

    #[tokio::test]
    async fn test_echo_then_peer_close_destroys() {
        let owner = Arc::new(CountingOwner::default());
        let (conn, rx) = conn(&owner);
        let (mut peer, stream) = pair().await;
        let handler = Arc::new(Echo::default());
        let task = spawn(Arc::clone(&conn), stream, rx, handler.clone(), 10, Arc::new(Metrics::new()));

        let request = encode_abandon(5, 1);
        peer.write_all(&request).await.unwrap();
        let mut reply = vec![0u8; request.len()];
        peer.read_exact(&mut reply).await.unwrap();
        let echoed = Pdu::decode(Bytes::from(reply)).unwrap();
        assert_eq!(echoed.msgid, 5);
        assert_eq!(echoed.abandon_target().unwrap(), 1);
        assert_eq!(owner.destroyed.load(Ordering::SeqCst), 0);

        // marking dead forfeits the liveness token, the driver's borrow was the last
        drop(peer);
        task.await.unwrap();
        assert!(conn.lock().is_destroyed());
        assert_eq!(owner.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_many_pdus_in_one_read() {
        let owner = Arc::new(CountingOwner::default());
        let (conn, rx) = conn(&owner);
        let (mut peer, stream) = pair().await;
        let handler = Arc::new(Echo::default());
        let task = spawn(Arc::clone(&conn), stream, rx, handler.clone(), 2, Arc::new(Metrics::new()));

        let mut burst = Vec::new();
        for id in 1..=5 {
            burst.extend_from_slice(&encode_abandon(id, 1));
        }
        burst.extend_from_slice(&encode_abandon(99, 1));
        peer.write_all(&burst).await.unwrap();
        task.await.unwrap();
        assert_eq!(handler.seen.load(Ordering::SeqCst), 6);
        // five echoes arrive before the close
        let mut echoed = Vec::new();
        peer.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed.len(), encode_abandon(1, 1).len() * 5);
    }

    #[tokio::test]
    async fn test_protocol_error_sends_notice_and_closes() {
        let owner = Arc::new(CountingOwner::default());
        let (conn, rx) = conn(&owner);
        let (mut peer, stream) = pair().await;
        let metrics = Arc::new(Metrics::new());
        let task = spawn(Arc::clone(&conn), stream, rx, Arc::new(Echo::default()), 10, Arc::clone(&metrics));
        peer.write_all(&[0x04, 0x01, 0x00]).await.unwrap();
        task.await.unwrap();
        let mut got = Vec::new();
        peer.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"bye");
        assert!(metrics.render(&[]).contains("ldap_lb_protocol_errors_total 1"));
    }

    #[tokio::test]
    async fn test_peer_aborting_starttls_handshake_closes() {
        let owner = Arc::new(CountingOwner::default());
        let (conn, rx) = conn(&owner);
        let (mut peer, stream) = pair().await;
        let task = spawn(Arc::clone(&conn), stream, rx, Arc::new(Echo::default()), 10, Arc::new(Metrics::new()));

        let request = encode_abandon(77, 1);
        peer.write_all(&request).await.unwrap();
        let mut reply = vec![0u8; request.len()];
        peer.read_exact(&mut reply).await.unwrap();
        assert_eq!(Pdu::decode(Bytes::from(reply)).unwrap().msgid, 77);

        // hang up instead of sending a ClientHello
        drop(peer);
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(owner.destroyed.load(Ordering::SeqCst), 1);
        assert!(conn.lock().is_destroyed());
        assert_ne!(conn.lock().tls(), TlsPhase::Established);
    }

    #[tokio::test]
    async fn test_mark_dead_stops_driver() {
        let owner = Arc::new(CountingOwner::default());
        let (conn, rx) = conn(&owner);
        let (_peer, stream) = pair().await;
        let task = spawn(Arc::clone(&conn), stream, rx, Arc::new(Echo::default()), 10, Arc::new(Metrics::new()));
        let mut guard = conn.lock();
        Connection::retain(&mut guard);
        conn.mark_dead(guard);
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        // liveness token and both borrows are gone
        assert_eq!(owner.destroyed.load(Ordering::SeqCst), 1);
    }
}
