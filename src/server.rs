//! Top-level runtime: builds the backends, binds the listeners and runs
//! until told to stop.

use crate::config::Config;
use crate::listener::Listener;
use crate::metrics::{run_metrics_server, BackendInfo, Metrics};
use crate::proxy::Proxy;
use crate::registry::{Registry, DEFAULT_MAX_PDUS_PER_CYCLE};
use crate::tls::{validate_tls_files, ReloadableAcceptor};
use anyhow::Result;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// How long listener tasks get to notice shutdown.
const LISTENER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct LdapLoadBalancer {
    proxy: Arc<Proxy>,
    listeners: Vec<Listener>,
    metrics_listen: Option<String>,
}

impl LdapLoadBalancer {
    /// Validates `config`, loads TLS material, creates the backends and
    /// binds every listener. No connection is opened yet.
    pub async fn bind(config: &Config) -> Result<Self> {
        config.validate()?;
        let metrics = Arc::new(Metrics::new());

        let tls = match config
            .tls
            .as_ref()
            .and_then(|t| Some((t.cert_file.as_ref()?, t.key_file.as_ref()?, t.ca_file.as_deref())))
        {
            Some((cert_file, key_file, ca_file)) => {
                validate_tls_files(cert_file, key_file, ca_file)?;
                info!("TLS enabled for listeners (LDAPS or StartTLS)");
                Some(ReloadableAcceptor::from_files(cert_file, key_file)?)
            }
            None => None,
        };

        let registry = Registry::from_config(config, &metrics)?;
        info!("Backend servers: {}", registry.len());
        for backend in registry.backends() {
            let s = backend.settings();
            info!(
                "  {} (numconns={}, bindconns={}, max_pending_ops={}, conn_max_pending={})",
                s.uri, s.numconns, s.bindconns, s.max_pending_ops, s.conn_max_pending
            );
        }

        let max_pdus = config
            .max_pdus_per_cycle
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAX_PDUS_PER_CYCLE);
        let proxy = Proxy::new(registry, metrics, tls, max_pdus);

        let mut listeners = Vec::with_capacity(config.listen.len());
        for listen in &config.listen {
            listeners.push(Listener::bind(listen).await?);
        }

        Ok(Self {
            proxy,
            listeners,
            metrics_listen: config.metrics_listen.clone(),
        })
    }

    pub fn proxy(&self) -> &Arc<Proxy> {
        &self.proxy
    }

    /// Addresses of the TCP listeners, in configuration order.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().filter_map(Listener::local_addr).collect()
    }

    /// Opens backend connections, serves clients until `shutdown`
    /// resolves, then disconnects everything.
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let (stop_tx, stop_rx) = watch::channel(false);

        if let Some(addr) = self.metrics_listen.clone() {
            let metrics = Arc::clone(self.proxy.metrics());
            let proxy = Arc::clone(&self.proxy);
            let backend_info: BackendInfo = Arc::new(move || proxy.registry().statuses());
            tokio::spawn(async move {
                if let Err(e) = run_metrics_server(&addr, metrics, backend_info).await {
                    error!("Metrics server error: {}", e);
                }
            });
        }

        self.proxy.registry().start();

        let tasks: Vec<_> = self
            .listeners
            .into_iter()
            .map(|listener| tokio::spawn(listener.run(Arc::clone(&self.proxy), stop_rx.clone())))
            .collect();
        info!("LDAP proxy ready");

        shutdown.await;
        info!("Shutting down");
        let _ = stop_tx.send(true);
        for task in tasks {
            if tokio::time::timeout(LISTENER_STOP_TIMEOUT, task).await.is_err() {
                warn!("Listener did not stop in time");
            }
        }
        self.proxy.shutdown();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendServer, ListenConfig, TlsConfig};
    use crate::framing::{read_frame, MAX_UPSTREAM_PDU};
    use crate::ldap_protocol::{
        encode_result, encode_simple_bind, result_code, Pdu, LDAP_TAG_BIND_REQUEST, LDAP_TAG_BIND_RESPONSE,
        LDAP_TAG_EXTENDED_RESPONSE, LDAP_TAG_SEARCH_REQUEST, LDAP_TAG_SEARCH_RESULT_DONE,
        LDAP_TAG_SEARCH_RESULT_ENTRY,
    };
    use bytes::{Bytes, BytesMut};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::{mpsc, oneshot};

    /// A request seen by the fake directory server and the channel that
    /// writes back on the link it arrived on.
    struct Received {
        pdu: Pdu,
        reply: mpsc::UnboundedSender<Bytes>,
    }

    /// Accepts any number of links and reports every request. Replies are
    /// up to the test.
    async fn fake_directory() -> (String, mpsc::UnboundedReceiver<Received>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let (mut read, mut write) = sock.into_split();
                    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Bytes>();
                    tokio::spawn(async move {
                        while let Some(bytes) = reply_rx.recv().await {
                            if write.write_all(&bytes).await.is_err() {
                                break;
                            }
                        }
                    });
                    let mut buf = BytesMut::new();
                    while let Ok(frame) = read_frame(&mut read, &mut buf, MAX_UPSTREAM_PDU).await {
                        let pdu = Pdu::decode(frame).unwrap();
                        let received = Received { pdu, reply: reply_tx.clone() };
                        if tx.send(received).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        (format!("ldap://127.0.0.1:{}", addr.port()), rx)
    }

    fn proxy_config(backend_uri: &str) -> Config {
        let mut config = Config::default();
        config.listen = vec![ListenConfig::new("ldap://127.0.0.1:0")];
        let mut server = BackendServer::new(backend_uri);
        server.numconns = Some(1);
        server.bindconns = Some(1);
        config.backend.servers = vec![server];
        config
    }

    fn search(msgid: i32) -> Bytes {
        encode_result(msgid, LDAP_TAG_SEARCH_REQUEST, 0, "", "")
    }

    async fn next_pdu(stream: &mut TcpStream, buf: &mut BytesMut) -> Pdu {
        let frame = tokio::time::timeout(Duration::from_secs(5), read_frame(stream, buf, MAX_UPSTREAM_PDU))
            .await
            .expect("timed out waiting for a PDU")
            .unwrap();
        Pdu::decode(frame).unwrap()
    }

    async fn next_request(rx: &mut mpsc::UnboundedReceiver<Received>) -> Received {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for the directory")
            .unwrap()
    }

    #[tokio::test]
    async fn test_search_is_relayed_under_upstream_msgid() {
        let (uri, mut directory) = fake_directory().await;
        let lb = LdapLoadBalancer::bind(&proxy_config(&uri)).await.unwrap();
        let addr = lb.local_addrs()[0];
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let client = async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let mut buf = BytesMut::new();
            stream.write_all(&search(7)).await.unwrap();

            let req = next_request(&mut directory).await;
            assert_eq!(req.pdu.tag, LDAP_TAG_SEARCH_REQUEST);
            assert_eq!(req.pdu.msgid, 1);
            req.reply
                .send(encode_result(req.pdu.msgid, LDAP_TAG_SEARCH_RESULT_ENTRY, 0, "", ""))
                .unwrap();
            req.reply
                .send(encode_result(req.pdu.msgid, LDAP_TAG_SEARCH_RESULT_DONE, 0, "", "done"))
                .unwrap();

            let entry = next_pdu(&mut stream, &mut buf).await;
            assert_eq!((entry.msgid, entry.tag), (7, LDAP_TAG_SEARCH_RESULT_ENTRY));
            let done = next_pdu(&mut stream, &mut buf).await;
            assert_eq!((done.msgid, done.tag), (7, LDAP_TAG_SEARCH_RESULT_DONE));
            assert_eq!(done.diagnostic_message().unwrap(), "done");
            let _ = stop_tx.send(());
        };
        let (served, ()) = tokio::join!(
            lb.serve(async {
                let _ = stop_rx.await;
            }),
            client
        );
        served.unwrap();
    }

    #[tokio::test]
    async fn test_reply_for_departed_client_is_dropped() {
        let (uri, mut directory) = fake_directory().await;
        let lb = LdapLoadBalancer::bind(&proxy_config(&uri)).await.unwrap();
        let addr = lb.local_addrs()[0];
        let clients = Arc::clone(lb.proxy().clients());
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let scenario = async move {
            let mut first = TcpStream::connect(addr).await.unwrap();
            first.write_all(&search(3)).await.unwrap();
            let orphaned = next_request(&mut directory).await;
            drop(first);
            for _ in 0..100 {
                if clients.is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert!(clients.is_empty());
            orphaned
                .reply
                .send(encode_result(orphaned.pdu.msgid, LDAP_TAG_SEARCH_RESULT_DONE, 0, "", "late"))
                .unwrap();

            // The shared link survives and serves the next client.
            let mut second = TcpStream::connect(addr).await.unwrap();
            let mut buf = BytesMut::new();
            second.write_all(&search(3)).await.unwrap();
            let req = next_request(&mut directory).await;
            assert_eq!(req.pdu.msgid, orphaned.pdu.msgid + 1);
            req.reply
                .send(encode_result(req.pdu.msgid, LDAP_TAG_SEARCH_RESULT_DONE, 0, "", "fresh"))
                .unwrap();
            let done = next_pdu(&mut second, &mut buf).await;
            assert_eq!(done.msgid, 3);
            assert_eq!(done.diagnostic_message().unwrap(), "fresh");
            let _ = stop_tx.send(());
        };
        let (served, ()) = tokio::join!(
            lb.serve(async {
                let _ = stop_rx.await;
            }),
            scenario
        );
        served.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_backend_answers_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = format!("ldap://127.0.0.1:{}", listener.local_addr().unwrap().port());
        drop(listener);
        let lb = LdapLoadBalancer::bind(&proxy_config(&dead)).await.unwrap();
        let addr = lb.local_addrs()[0];
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let client = async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let mut buf = BytesMut::new();
            stream.write_all(&search(2)).await.unwrap();
            let done = next_pdu(&mut stream, &mut buf).await;
            assert_eq!((done.msgid, done.tag), (2, LDAP_TAG_SEARCH_RESULT_DONE));
            assert_eq!(done.result_code().unwrap(), result_code::UNAVAILABLE);
            let _ = stop_tx.send(());
        };
        let (served, ()) = tokio::join!(
            lb.serve(async {
                let _ = stop_rx.await;
            }),
            client
        );
        served.unwrap();
    }

    #[tokio::test]
    async fn test_bind_goes_through_bind_pool() {
        let (uri, mut directory) = fake_directory().await;
        let lb = LdapLoadBalancer::bind(&proxy_config(&uri)).await.unwrap();
        let addr = lb.local_addrs()[0];
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let client = async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let mut buf = BytesMut::new();
            stream
                .write_all(&encode_simple_bind(1, 3, "cn=alice,dc=example", "secret"))
                .await
                .unwrap();
            let req = next_request(&mut directory).await;
            assert_eq!(req.pdu.tag, LDAP_TAG_BIND_REQUEST);
            assert_eq!(req.pdu.bind_dn().unwrap(), "cn=alice,dc=example");
            req.reply
                .send(encode_result(req.pdu.msgid, LDAP_TAG_BIND_RESPONSE, 0, "", ""))
                .unwrap();
            let response = next_pdu(&mut stream, &mut buf).await;
            assert_eq!((response.msgid, response.tag), (1, LDAP_TAG_BIND_RESPONSE));
            assert_eq!(response.result_code().unwrap(), result_code::SUCCESS);
            let _ = stop_tx.send(());
        };
        let (served, ()) = tokio::join!(
            lb.serve(async {
                let _ = stop_rx.await;
            }),
            client
        );
        served.unwrap();
    }

    #[tokio::test]
    async fn test_unbind_and_shutdown_close_clients() {
        let (uri, _directory) = fake_directory().await;
        let lb = LdapLoadBalancer::bind(&proxy_config(&uri)).await.unwrap();
        let addr = lb.local_addrs()[0];
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let client = async move {
            let mut leaving = TcpStream::connect(addr).await.unwrap();
            leaving.write_all(&[0x30, 0x05, 0x02, 0x01, 0x09, 0x42, 0x00]).await.unwrap();
            let mut rest = Vec::new();
            let n = tokio::time::timeout(Duration::from_secs(5), leaving.read_to_end(&mut rest))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(n, 0);

            let mut staying = TcpStream::connect(addr).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = stop_tx.send(());
            let mut buf = BytesMut::new();
            let notice = next_pdu(&mut staying, &mut buf).await;
            assert_eq!((notice.msgid, notice.tag), (0, LDAP_TAG_EXTENDED_RESPONSE));
            assert_eq!(notice.result_code().unwrap(), result_code::UNAVAILABLE);
        };
        let (served, ()) = tokio::join!(
            lb.serve(async {
                let _ = stop_rx.await;
            }),
            client
        );
        served.unwrap();
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.listen = vec![ListenConfig::new("ldap://127.0.0.1:0")];
        config.backend.servers = vec![BackendServer::new("ldap://127.0.0.1:1")];
        config
    }

    #[tokio::test]
    async fn test_bind_exposes_listener_addresses() {
        let lb = LdapLoadBalancer::bind(&config()).await.unwrap();
        let addrs = lb.local_addrs();
        assert_eq!(addrs.len(), 1);
        assert_ne!(addrs[0].port(), 0);
        assert_eq!(lb.proxy().registry().len(), 1);
        assert!(lb.proxy().tls_acceptor().is_none());
    }

    #[tokio::test]
    async fn test_bind_rejects_invalid_config() {
        let mut config = config();
        config.backend.servers.clear();
        assert!(LdapLoadBalancer::bind(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_fails_on_missing_tls_files() {
        let mut config = config();
        config.tls = Some(TlsConfig {
            cert_file: Some("/nonexistent/cert.pem".into()),
            key_file: Some("/nonexistent/key.pem".into()),
            ca_file: None,
        });
        assert!(LdapLoadBalancer::bind(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let lb = LdapLoadBalancer::bind(&config()).await.unwrap();
        let proxy = Arc::clone(lb.proxy());
        lb.serve(async {}).await.unwrap();
        assert!(proxy.clients().register("late".into(), crate::connection::TlsPhase::Cleartext).is_none());
    }
}
