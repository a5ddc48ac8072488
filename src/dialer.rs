//! Non-blocking upstream dials over TCP or a local socket.

use crate::error::DialError;
use crate::stream::LinkStream;
use anyhow::{Context, Result};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tracing::debug;

/// Socket used for `ldapi://` without a path.
pub const DEFAULT_LDAPI_PATH: &str = "/var/run/ldapi";
/// Longest path that fits `sockaddr_un.sun_path` with its terminator.
pub const MAX_SOCKET_PATH: usize = 107;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendAddress {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl fmt::Display for BackendAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendAddress::Tcp { host, port } if host.contains(':') => write!(f, "[{}]:{}", host, port),
            BackendAddress::Tcp { host, port } => write!(f, "{}:{}", host, port),
            BackendAddress::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UriScheme {
    Ldap,
    Ldaps,
    Ldapi,
}

/// Parse "ldap://host[:port]", "ldaps://host[:port]" or "ldapi://[%2Fpath]".
pub fn parse_ldap_uri(uri: &str) -> Result<(UriScheme, BackendAddress)> {
    let (scheme, rest) = if let Some(rest) = uri.strip_prefix("ldap://") {
        (UriScheme::Ldap, rest)
    } else if let Some(rest) = uri.strip_prefix("ldaps://") {
        (UriScheme::Ldaps, rest)
    } else if let Some(rest) = uri.strip_prefix("ldapi://") {
        (UriScheme::Ldapi, rest)
    } else {
        anyhow::bail!("Invalid LDAP URI scheme: {}", uri);
    };
    let rest = rest.trim_end_matches('/');

    if scheme == UriScheme::Ldapi {
        let path = if rest.is_empty() {
            PathBuf::from(DEFAULT_LDAPI_PATH)
        } else {
            PathBuf::from(percent_decode(rest).with_context(|| format!("Invalid ldapi path: {}", uri))?)
        };
        return Ok((scheme, BackendAddress::Unix(path)));
    }

    let default_port = if scheme == UriScheme::Ldaps { 636 } else { 389 };
    let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
        let (host, after) = bracketed
            .split_once(']')
            .ok_or_else(|| anyhow::anyhow!("Unterminated IPv6 literal in URI: {}", uri))?;
        let port = match after.strip_prefix(':') {
            Some(p) => p.parse().with_context(|| format!("Invalid port in URI: {}", uri))?,
            None => default_port,
        };
        (host.to_string(), port)
    } else if let Some((host, port_str)) = rest.rsplit_once(':') {
        let port: u16 = port_str
            .parse()
            .with_context(|| format!("Invalid port in URI: {}", uri))?;
        (host.to_string(), port)
    } else {
        (rest.to_string(), default_port)
    };
    if host.is_empty() {
        anyhow::bail!("No host in URI: {}", uri);
    }
    Ok((scheme, BackendAddress::Tcp { host, port }))
}

pub(crate) fn percent_decode(s: &str) -> Result<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = s
                .get(i + 1..i + 3)
                .ok_or_else(|| anyhow::anyhow!("Truncated percent escape"))?;
            out.push(u8::from_str_radix(hex, 16).context("Invalid percent escape")?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).context("Percent-decoded value is not UTF-8")
}

fn classify(err: io::Error, addr: &BackendAddress) -> DialError {
    match err.kind() {
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => DialError::Refused(addr.to_string()),
        io::ErrorKind::TimedOut => DialError::Timeout(addr.to_string()),
        _ => DialError::Other {
            addr: addr.to_string(),
            source: err,
        },
    }
}

/// Dials `address`, waiting at most `timeout` for the connection to complete.
///
/// Once the socket reports writable the pending socket error is checked and
/// the peer name is queried, so a half-failed connect surfaces here rather
/// than on the first write. Returns the stream and a printable peer name.
pub async fn dial(address: &BackendAddress, timeout: Duration) -> Result<(LinkStream, String), DialError> {
    match address {
        BackendAddress::Tcp { host, port } => {
            let stream = tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), *port)))
                .await
                .map_err(|_| DialError::Timeout(address.to_string()))?
                .map_err(|e| classify(e, address))?;
            if let Some(e) = stream.take_error().map_err(|e| classify(e, address))? {
                return Err(classify(e, address));
            }
            let peer = stream.peer_addr().map_err(|e| classify(e, address))?;
            // Latency matters more than coalescing for request/response traffic
            let _ = stream.set_nodelay(true);
            debug!("Dialed upstream {} ({})", address, peer);
            Ok((LinkStream::Tcp(stream), format!("IP={}", peer)))
        }
        #[cfg(unix)]
        BackendAddress::Unix(path) => {
            if path.as_os_str().len() > MAX_SOCKET_PATH {
                return Err(DialError::NameTooLong(path.display().to_string()));
            }
            let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
                .await
                .map_err(|_| DialError::Timeout(address.to_string()))?
                .map_err(|e| classify(e, address))?;
            if let Some(e) = stream.take_error().map_err(|e| classify(e, address))? {
                return Err(classify(e, address));
            }
            stream.peer_addr().map_err(|e| classify(e, address))?;
            debug!("Dialed upstream socket {}", path.display());
            Ok((LinkStream::Unix(stream), format!("PATH={}", path.display())))
        }
        #[cfg(not(unix))]
        BackendAddress::Unix(_) => Err(DialError::Other {
            addr: address.to_string(),
            source: io::Error::new(io::ErrorKind::Unsupported, "local sockets are not supported"),
        }),
    }
}

/// Abandon of message id 0; servers ignore it, it only carries the ancillary data.
#[cfg(unix)]
const ANNOUNCE_PDU: [u8; 8] = [0x30, 0x06, 0x02, 0x01, 0x00, 0x50, 0x01, 0x00];

/// Sends a no-op PDU with an SCM_RIGHTS message attached so the server can
/// read this process's credentials off the local socket.
#[cfg(unix)]
pub async fn announce_credentials(stream: &UnixStream) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    use tokio::io::Interest;

    let mut pipe = [0 as libc::c_int; 2];
    // SAFETY: `pipe` has room for the two descriptors libc writes.
    if unsafe { libc::pipe(pipe.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    stream.writable().await?;
    let fd = stream.as_raw_fd();
    let result = stream.try_io(Interest::WRITABLE, || send_with_rights(fd, &ANNOUNCE_PDU, pipe[0]));
    // SAFETY: both descriptors came from the pipe() call above and are closed once.
    unsafe {
        libc::close(pipe[0]);
        libc::close(pipe[1]);
    }
    result
}

#[cfg(unix)]
fn send_with_rights(sock: libc::c_int, payload: &[u8], passed_fd: libc::c_int) -> io::Result<()> {
    let fd_len = std::mem::size_of::<libc::c_int>() as u32;
    // SAFETY: CMSG_SPACE is a pure size computation.
    let space = unsafe { libc::CMSG_SPACE(fd_len) } as usize;
    let mut control = vec![0u8; space];
    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };
    // SAFETY: msghdr is plain data; every pointer set below outlives the sendmsg call.
    unsafe {
        let mut msg: libc::msghdr = std::mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1 as _;
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = space as _;
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null() {
            return Err(io::Error::new(io::ErrorKind::Other, "no room for control message"));
        }
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(fd_len) as _;
        std::ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut libc::c_int, passed_fd);
        if libc::sendmsg(sock, &msg, 0) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
