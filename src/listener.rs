//! Listening sockets: accept clients and hand them to the proxy.

use crate::config::ListenConfig;
use crate::dialer::{percent_decode, DEFAULT_LDAPI_PATH};
use crate::proxy::Proxy;
use crate::stream::LinkStream;
use anyhow::{Context, Result};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// How long a listener stays muted after running out of descriptors when
/// no client disconnects in the meantime.
const FD_EXHAUSTED_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddress {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenSpec {
    pub address: ListenAddress,
    /// TLS handshake right after accept.
    pub ldaps: bool,
}

/// Parse ldap://host:port, ldaps://host:port or ldapi://<percent-encoded path>.
pub fn parse_listen_url(url: &str) -> Result<ListenSpec> {
    if let Some(rest) = url.strip_prefix("ldapi://") {
        let rest = rest.trim_end_matches('/');
        let path = if rest.is_empty() {
            PathBuf::from(DEFAULT_LDAPI_PATH)
        } else {
            PathBuf::from(percent_decode(rest)?)
        };
        return Ok(ListenSpec {
            address: ListenAddress::Unix(path),
            ldaps: false,
        });
    }

    let (ldaps, rest) = if let Some(rest) = url.strip_prefix("ldap://") {
        (false, rest)
    } else if let Some(rest) = url.strip_prefix("ldaps://") {
        (true, rest)
    } else {
        anyhow::bail!("Invalid URL scheme, expected ldap://, ldaps:// or ldapi://");
    };
    let default_port = if ldaps { 636 } else { 389 };

    // Remove leading slashes if present
    let rest = rest.trim_start_matches('/').trim_end_matches('/');

    let addr = if rest.is_empty() {
        SocketAddr::from(([0, 0, 0, 0], default_port))
    } else if let Some(port) = rest.strip_prefix(':') {
        // Just port specified, bind to all interfaces
        let port: u16 = port.parse().context("Invalid port number")?;
        SocketAddr::from(([0, 0, 0, 0], port))
    } else if let Ok(addr) = rest.parse::<SocketAddr>() {
        addr
    } else {
        let ip: IpAddr = rest
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse()
            .with_context(|| format!("Failed to parse address: {}", rest))?;
        SocketAddr::new(ip, default_port)
    };
    Ok(ListenSpec {
        address: ListenAddress::Tcp(addr),
        ldaps,
    })
}

enum BoundSocket {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, PathBuf),
}

pub struct Listener {
    url: String,
    ldaps: bool,
    tls_required: bool,
    socket: BoundSocket,
}

fn is_fd_exhaustion(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
}

impl Listener {
    pub async fn bind(config: &ListenConfig) -> Result<Self> {
        let spec = parse_listen_url(&config.url).with_context(|| format!("Invalid listen URL {}", config.url))?;
        let socket = match spec.address {
            ListenAddress::Tcp(addr) => BoundSocket::Tcp(
                TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("Failed to bind to {}", addr))?,
            ),
            #[cfg(unix)]
            ListenAddress::Unix(path) => {
                use std::os::unix::fs::{FileTypeExt, PermissionsExt};
                // A socket left behind by a previous run
                if std::fs::symlink_metadata(&path).is_ok_and(|m| m.file_type().is_socket()) {
                    std::fs::remove_file(&path)
                        .with_context(|| format!("Remove stale socket {}", path.display()))?;
                }
                let listener = UnixListener::bind(&path)
                    .with_context(|| format!("Failed to bind to {}", path.display()))?;
                if let Some(mode) = config.mode_bits()? {
                    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
                        .with_context(|| format!("Set mode {:o} on {}", mode, path.display()))?;
                }
                BoundSocket::Unix(listener, path)
            }
            #[cfg(not(unix))]
            ListenAddress::Unix(path) => {
                anyhow::bail!("Local sockets are not supported on this platform: {}", path.display())
            }
        };
        info!("Listening on {}", config.url);
        Ok(Self {
            url: config.url.clone(),
            ldaps: spec.ldaps,
            tls_required: config.tls_required.unwrap_or(false),
            socket,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Bound address of a TCP listener.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.socket {
            BoundSocket::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            BoundSocket::Unix(..) => None,
        }
    }

    async fn accept(&self) -> io::Result<(LinkStream, String)> {
        match &self.socket {
            BoundSocket::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                let _ = stream.set_nodelay(true);
                Ok((LinkStream::Tcp(stream), peer.to_string()))
            }
            #[cfg(unix)]
            BoundSocket::Unix(listener, path) => {
                let (stream, _) = listener.accept().await?;
                Ok((LinkStream::Unix(stream), format!("ldapi://{}", path.display())))
            }
        }
    }

    /// Accepts clients until `shutdown` flips to true.
    pub async fn run(self, proxy: Arc<Proxy>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.changed() => break,
                accepted = self.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    debug!("New connection from {} on {}", peer, self.url);
                    if self.ldaps {
                        let proxy = Arc::clone(&proxy);
                        let tls_required = self.tls_required;
                        tokio::spawn(async move {
                            let Some(acceptor) = proxy.tls_acceptor() else {
                                error!("No TLS context for LDAPS client {}", peer);
                                return;
                            };
                            match stream.accept_tls(&acceptor).await {
                                Ok(tls) => {
                                    proxy.accept(tls, peer, tls_required);
                                }
                                Err(e) => warn!("TLS handshake failed for {}: {}", peer, e),
                            }
                        });
                    } else if !proxy.accept(stream, peer, self.tls_required) {
                        break;
                    }
                }
                Err(e) if is_fd_exhaustion(&e) => {
                    warn!("{}: out of file descriptors, pausing accepts: {}", self.url, e);
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = proxy.clients().slot_freed() => {}
                        _ = tokio::time::sleep(FD_EXHAUSTED_BACKOFF) => {}
                    }
                }
                Err(e) => {
                    error!("Failed to accept connection on {}: {}", self.url, e);
                }
            }
        }
        info!("Stopped listening on {}", self.url);
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            if let BoundSocket::Unix(_, path) = &self.socket {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}
