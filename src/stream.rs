//! Socket under a connection: plain TCP, local socket, or TLS in either direction.

use std::io;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use rustls_pki_types::ServerName;

pub enum LinkStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
    /// Accepted client connection after LDAPS or StartTLS.
    ServerTls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
    /// Upstream connection after LDAPS or StartTLS.
    ClientTls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl LinkStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, LinkStream::ServerTls(_) | LinkStream::ClientTls(_))
    }

    pub fn is_local(&self) -> bool {
        #[cfg(unix)]
        {
            matches!(self, LinkStream::Unix(_))
        }
        #[cfg(not(unix))]
        {
            false
        }
    }

    /// Server side of a TLS handshake over a plain TCP stream.
    pub async fn accept_tls(self, acceptor: &TlsAcceptor) -> io::Result<Self> {
        match self {
            LinkStream::Tcp(tcp) => Ok(LinkStream::ServerTls(Box::new(acceptor.accept(tcp).await?))),
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "TLS is only negotiated over plain TCP",
            )),
        }
    }

    /// Client side of a TLS handshake over a plain TCP stream.
    pub async fn connect_tls(
        self,
        connector: &TlsConnector,
        server_name: ServerName<'static>,
    ) -> io::Result<Self> {
        match self {
            LinkStream::Tcp(tcp) => Ok(LinkStream::ClientTls(Box::new(
                connector.connect(server_name, tcp).await?,
            ))),
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "TLS is only negotiated over plain TCP",
            )),
        }
    }
}

impl AsyncRead for LinkStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            LinkStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            LinkStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
            LinkStream::ServerTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            LinkStream::ClientTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for LinkStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            LinkStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            LinkStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
            LinkStream::ServerTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            LinkStream::ClientTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            LinkStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            LinkStream::Unix(s) => Pin::new(s).poll_flush(cx),
            LinkStream::ServerTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            LinkStream::ClientTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            LinkStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            LinkStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
            LinkStream::ServerTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            LinkStream::ClientTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
