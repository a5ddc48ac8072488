//! Turns a pending upstream connection into an established one.
//!
//! Dialing → AnnouncingCredentials → NegotiatingTls → Binding → Ready.
//! Each state is one method returning the next state; any error ends the
//! attempt and is reported against the backend.

use crate::backend::{Backend, BackendSettings, Pool};
use crate::connection::TlsPhase;
use crate::dialer::{self, BackendAddress};
use crate::error::ConnectError;
use crate::framing::{read_frame, MAX_UPSTREAM_PDU};
use crate::ldap_protocol::{
    encode_simple_bind, encode_start_tls, result_code, Pdu, LDAP_TAG_BIND_RESPONSE,
    LDAP_TAG_EXTENDED_RESPONSE,
};
use crate::stream::LinkStream;
use bytes::BytesMut;
use rustls_pki_types::ServerName;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Dialing,
    AnnouncingCredentials,
    NegotiatingTls,
    Binding,
    Ready,
}

/// A link that finished its handshake, ready to become a pool member.
pub struct Established {
    pub stream: LinkStream,
    pub tls: bool,
    /// First message id free for forwarded requests.
    pub next_msgid: i32,
    pub peer: String,
}

pub struct Handshake<'a> {
    settings: &'a BackendSettings,
    tls: Option<&'a TlsConnector>,
    pool: Pool,
    state: ConnectorState,
    stream: Option<LinkStream>,
    peer: String,
    buffer: BytesMut,
    next_msgid: i32,
    tls_established: bool,
}

impl<'a> Handshake<'a> {
    pub fn new(settings: &'a BackendSettings, tls: Option<&'a TlsConnector>, pool: Pool) -> Self {
        Self {
            settings,
            tls,
            pool,
            state: ConnectorState::Dialing,
            stream: None,
            peer: String::new(),
            buffer: BytesMut::new(),
            next_msgid: 1,
            tls_established: false,
        }
    }

    pub async fn run(mut self) -> Result<Established, ConnectError> {
        loop {
            let next = match self.state {
                ConnectorState::Dialing => self.dial().await?,
                ConnectorState::AnnouncingCredentials => self.announce().await,
                ConnectorState::NegotiatingTls => self.negotiate_tls().await?,
                ConnectorState::Binding => self.bind().await?,
                ConnectorState::Ready => return self.finish(),
            };
            trace!("{} connector {:?} -> {:?}", self.settings.uri, self.state, next);
            self.state = next;
        }
    }

    fn take_stream(&mut self) -> Result<LinkStream, ConnectError> {
        self.stream
            .take()
            .ok_or_else(|| ConnectError::UnexpectedResponse("no socket".into()))
    }

    async fn dial(&mut self) -> Result<ConnectorState, ConnectError> {
        let (stream, peer) = dialer::dial(&self.settings.address, self.settings.network_timeout).await?;
        let local = stream.is_local();
        self.stream = Some(stream);
        self.peer = peer;
        if local && self.settings.announce_credentials {
            Ok(ConnectorState::AnnouncingCredentials)
        } else {
            Ok(ConnectorState::NegotiatingTls)
        }
    }

    /// Best effort: the connection proceeds whatever the outcome.
    async fn announce(&mut self) -> ConnectorState {
        #[cfg(unix)]
        {
            if let Some(LinkStream::Unix(stream)) = &self.stream {
                if let Err(e) = dialer::announce_credentials(stream).await {
                    debug!("{} credential announce failed: {}", self.settings.uri, e);
                }
            }
        }
        ConnectorState::NegotiatingTls
    }

    fn server_name(&self) -> Result<ServerName<'static>, ConnectError> {
        match &self.settings.address {
            BackendAddress::Tcp { host, .. } => ServerName::try_from(host.clone())
                .map_err(|_| ConnectError::InvalidServerName(host.clone())),
            BackendAddress::Unix(path) => Err(ConnectError::InvalidServerName(path.display().to_string())),
        }
    }

    async fn start_tls(&mut self) -> Result<(), ConnectError> {
        let connector = self.tls.ok_or(ConnectError::NoTlsContext)?;
        let name = self.server_name()?;
        let stream = self.take_stream()?;
        let stream = stream.connect_tls(connector, name).await.map_err(ConnectError::Tls)?;
        self.stream = Some(stream);
        self.tls_established = true;
        Ok(())
    }

    async fn negotiate_tls(&mut self) -> Result<ConnectorState, ConnectError> {
        let policy = self.settings.tls;
        match policy {
            TlsPhase::Cleartext | TlsPhase::Established => {}
            TlsPhase::Ldaps => self.start_tls().await?,
            TlsPhase::StartTlsOptional | TlsPhase::StartTls => {
                if self.tls.is_none() && policy == TlsPhase::StartTlsOptional {
                    warn!("{} StartTLS requested but no client TLS context, staying in cleartext", self.settings.uri);
                    return Ok(ConnectorState::Binding);
                }
                let msgid = self.next_id();
                let response = self.exchange(encode_start_tls(msgid), msgid, LDAP_TAG_EXTENDED_RESPONSE).await?;
                let code = response.result_code()?;
                if code == result_code::SUCCESS {
                    self.start_tls().await?;
                } else if policy == TlsPhase::StartTls {
                    return Err(ConnectError::StartTlsRefused(code));
                } else {
                    info!("{} refused StartTLS ({}), continuing in cleartext", self.settings.uri, code);
                }
            }
        }
        Ok(ConnectorState::Binding)
    }

    /// Authenticates regular links with the configured identity. Bind links
    /// stay anonymous; client binds set their identity.
    async fn bind(&mut self) -> Result<ConnectorState, ConnectError> {
        let settings = self.settings;
        let Some(dn) = settings.bind_dn.as_deref() else {
            return Ok(ConnectorState::Ready);
        };
        if self.pool != Pool::Regular {
            return Ok(ConnectorState::Ready);
        }
        let password = settings.bind_credentials.as_deref().unwrap_or("");
        let msgid = self.next_id();
        let pdu = encode_simple_bind(msgid, settings.version, dn, password);
        let response = self.exchange(pdu, msgid, LDAP_TAG_BIND_RESPONSE).await?;
        let code = response.result_code()?;
        if code != result_code::SUCCESS {
            return Err(ConnectError::Bind {
                code,
                message: response.diagnostic_message().unwrap_or_default(),
            });
        }
        Ok(ConnectorState::Ready)
    }

    fn finish(self) -> Result<Established, ConnectError> {
        let stream = self
            .stream
            .ok_or_else(|| ConnectError::UnexpectedResponse("no socket".into()))?;
        Ok(Established {
            stream,
            tls: self.tls_established,
            next_msgid: self.next_msgid,
            peer: self.peer,
        })
    }

    fn next_id(&mut self) -> i32 {
        let id = self.next_msgid;
        self.next_msgid += 1;
        id
    }

    /// Sends one request and reads its response.
    async fn exchange(&mut self, request: bytes::Bytes, msgid: i32, expected_tag: u8) -> Result<Pdu, ConnectError> {
        let stream = self.stream.as_mut().ok_or_else(|| ConnectError::UnexpectedResponse("no socket".into()))?;
        stream.write_all(&request).await?;
        stream.flush().await?;
        let frame = read_frame(stream, &mut self.buffer, MAX_UPSTREAM_PDU).await?;
        let response = Pdu::decode(frame)?;
        if response.msgid != msgid || response.tag != expected_tag {
            return Err(ConnectError::UnexpectedResponse(format!(
                "message id {} tag 0x{:02X}",
                response.msgid, response.tag
            )));
        }
        Ok(response)
    }
}

/// Runs one connection attempt for `pool` under the handshake timeout and
/// hands the result to the backend.
pub async fn establish(backend: Arc<Backend>, pending_id: u64, pool: Pool) {
    let result = {
        let handshake = Handshake::new(backend.settings(), backend.tls_connector(), pool);
        match tokio::time::timeout(backend.settings().handshake_timeout, handshake.run()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectError::HandshakeTimeout),
        }
    };
    match result {
        Ok(established) => backend.promote(pending_id, pool, established),
        Err(e) => backend.report_failure(pending_id, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ldap_protocol::{encode_result, LDAP_TAG_BIND_REQUEST, LDAP_TAG_EXTENDED_REQUEST};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    /// Accepts one connection and answers each request with `code`.
    async fn fake_server(code: u32) -> (String, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = BytesMut::new();
            let mut tags = Vec::new();
            while let Ok(frame) = read_frame(&mut sock, &mut buf, MAX_UPSTREAM_PDU).await {
                let req = Pdu::decode(frame).unwrap();
                tags.push(req.tag);
                let response_tag = match req.tag {
                    LDAP_TAG_BIND_REQUEST => LDAP_TAG_BIND_RESPONSE,
                    LDAP_TAG_EXTENDED_REQUEST => LDAP_TAG_EXTENDED_RESPONSE,
                    _ => break,
                };
                let reply = encode_result(req.msgid, response_tag, code, "", "nope");
                sock.write_all(&reply).await.unwrap();
            }
            tags
        });
        (format!("ldap://127.0.0.1:{}", addr.port()), task)
    }

    #[tokio::test]
    async fn test_plain_connect_reaches_ready() {
        let (uri, _server) = fake_server(0).await;
        let settings = BackendSettings::new(&uri).unwrap();
        let established = Handshake::new(&settings, None, Pool::Regular).run().await.unwrap();
        assert!(!established.tls);
        assert_eq!(established.next_msgid, 1);
        assert!(established.peer.starts_with("IP=127.0.0.1:"));
    }

    #[tokio::test]
    async fn test_bind_with_configured_identity() {
        let (uri, server) = fake_server(0).await;
        let mut settings = BackendSettings::new(&uri).unwrap();
        settings.bind_dn = Some("cn=proxy,dc=example".into());
        settings.bind_credentials = Some("secret".into());
        let established = Handshake::new(&settings, None, Pool::Regular).run().await.unwrap();
        assert_eq!(established.next_msgid, 2);
        drop(established);
        assert_eq!(server.await.unwrap(), vec![LDAP_TAG_BIND_REQUEST]);
    }

    #[tokio::test]
    async fn test_bind_pool_skips_bind() {
        let (uri, _server) = fake_server(49).await;
        let mut settings = BackendSettings::new(&uri).unwrap();
        settings.bind_dn = Some("cn=proxy".into());
        let established = Handshake::new(&settings, None, Pool::Bind).run().await.unwrap();
        assert_eq!(established.next_msgid, 1);
    }

    #[tokio::test]
    async fn test_rejected_bind_fails() {
        let (uri, _server) = fake_server(49).await;
        let mut settings = BackendSettings::new(&uri).unwrap();
        settings.bind_dn = Some("cn=proxy".into());
        match Handshake::new(&settings, None, Pool::Regular).run().await {
            Err(ConnectError::Bind { code, message }) => {
                assert_eq!(code, 49);
                assert_eq!(message, "nope");
            }
            other => panic!("unexpected {:?}", other.map(|e| e.peer)),
        }
    }

    #[tokio::test]
    async fn test_starttls_refusal() {
        let connector = crate::tls::connector(true, None).unwrap();
        let (uri, _server) = fake_server(53).await;
        let mut settings = BackendSettings::new(&uri).unwrap();
        settings.tls = TlsPhase::StartTls;
        let err = Handshake::new(&settings, Some(&connector), Pool::Regular).run().await.err().unwrap();
        assert!(matches!(err, ConnectError::StartTlsRefused(53)));

        // optional StartTLS falls back to cleartext
        let (uri, _server) = fake_server(53).await;
        let mut settings = BackendSettings::new(&uri).unwrap();
        settings.tls = TlsPhase::StartTlsOptional;
        let established = Handshake::new(&settings, Some(&connector), Pool::Regular).run().await.unwrap();
        assert!(!established.tls);
        assert_eq!(established.next_msgid, 2);
    }

    #[tokio::test]
    async fn test_refused_dial() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let settings = BackendSettings::new(&format!("ldap://127.0.0.1:{}", port)).unwrap();
        let err = Handshake::new(&settings, None, Pool::Regular).run().await.err().unwrap();
        assert!(matches!(err, ConnectError::Dial(_)));
        assert!(!err.is_timeout());
    }

    #[tokio::test]
    async fn test_ldaps_without_context() {
        let (uri, _server) = fake_server(0).await;
        let mut settings = BackendSettings::new(&uri).unwrap();
        settings.tls = TlsPhase::Ldaps;
        let err = Handshake::new(&settings, None, Pool::Regular).run().await.err().unwrap();
        assert!(matches!(err, ConnectError::NoTlsContext));
    }
}
