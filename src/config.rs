use crate::dialer::parse_ldap_uri;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub listen: Vec<ListenConfig>,
    pub backend: BackendConfig,
    pub tls: Option<TlsConfig>,
    pub io_threads: Option<u32>,
    /// Assert each client's bound identity upstream with the Proxied Authorization control.
    pub proxyauthz: Option<bool>,
    /// Optional HTTP listen address for metrics and health (e.g. "0.0.0.0:9090"). Endpoints: GET /metrics (Prometheus), GET /health (liveness), GET /ready (readiness).
    pub metrics_listen: Option<String>,
    /// PDUs handled per connection before yielding to other connections (default 10).
    pub max_pdus_per_cycle: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    /// ldap://host:port, ldaps://host:port or ldapi://<percent-encoded path>
    pub url: String,
    /// Octal permission bits for ldapi sockets, e.g. "0666".
    pub mode: Option<String>,
    /// Refuse operations other than StartTLS until TLS is established.
    pub tls_required: Option<bool>,
}

impl ListenConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            mode: None,
            tls_required: None,
        }
    }

    pub fn mode_bits(&self) -> Result<Option<u32>> {
        self.mode
            .as_deref()
            .map(|m| {
                let digits = m.trim_start_matches("0o");
                u32::from_str_radix(digits, 8)
                    .with_context(|| format!("Invalid socket mode {:?} for {}", m, self.url))
            })
            .transpose()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub bind: BindConfig,
    pub servers: Vec<BackendServer>,
    /// Upper bound for the reconnect backoff in milliseconds (default 60000).
    pub retry_max_ms: Option<u64>,
    /// For ldaps:// and StartTLS backends: do not verify the server certificate (tests/internal networks only).
    pub tls_skip_verify: Option<bool>,
    /// PEM CA (single cert or bundle) trusted for backend TLS in addition to system roots.
    pub tls_ca_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindConfig {
    pub method: String,
    pub binddn: Option<String>,
    pub credentials: Option<String>,
    /// Dial timeout in seconds (default 5).
    pub network_timeout: Option<u64>,
    /// Whole connection handshake timeout in seconds (default 10).
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendServer {
    pub uri: String,
    /// LDAP protocol version used for upstream binds (default 3).
    pub version: Option<u8>,
    /// "yes" tries StartTLS and falls back to cleartext, "critical" requires it.
    pub starttls: Option<String>,
    pub retry: Option<u64>,
    pub max_pending_ops: Option<u32>,
    pub conn_max_pending: Option<u32>,
    pub numconns: Option<u32>,
    pub bindconns: Option<u32>,
    /// Send process credentials on ldapi:// connections right after connecting.
    pub announce_credentials: Option<bool>,
}

impl BackendServer {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            version: None,
            starttls: None,
            retry: None,
            max_pending_ops: None,
            conn_max_pending: None,
            numconns: None,
            bindconns: None,
            announce_credentials: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    pub ca_file: Option<String>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Read config file {}", path.display()))?;
        Self::from_str(&content)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content).context("Parse YAML config")?;
        Ok(config)
    }

    /// Checks what serde cannot: URLs, TLS policies and limits.
    pub fn validate(&self) -> Result<()> {
        if self.listen.is_empty() {
            anyhow::bail!("No listen URLs configured");
        }
        let tls_files = self
            .tls
            .as_ref()
            .is_some_and(|t| t.cert_file.is_some() && t.key_file.is_some());
        for listener in &self.listen {
            crate::listener::parse_listen_url(&listener.url)
                .with_context(|| format!("Invalid listen URL {}", listener.url))?;
            listener.mode_bits()?;
            let needs_tls = listener.url.starts_with("ldaps://")
                || listener.tls_required.unwrap_or(false);
            if needs_tls && !tls_files {
                anyhow::bail!("Listener {} needs tls.cert_file and tls.key_file", listener.url);
            }
        }
        if self.backend.bind.method != "simple" {
            anyhow::bail!(
                "Unsupported backend bind method {:?} (only \"simple\")",
                self.backend.bind.method
            );
        }
        if self.backend.servers.is_empty() {
            anyhow::bail!("No backend servers configured");
        }
        for server in &self.backend.servers {
            parse_ldap_uri(&server.uri)?;
            match server.starttls.as_deref() {
                None | Some("no") | Some("yes") | Some("critical") => {}
                Some(other) => anyhow::bail!(
                    "Invalid starttls {:?} for {} (expected yes or critical)",
                    other,
                    server.uri
                ),
            }
            if server.numconns == Some(0) {
                anyhow::bail!("numconns must be at least 1 for {}", server.uri);
            }
            if server.conn_max_pending == Some(0) || server.max_pending_ops == Some(0) {
                anyhow::bail!("Pending operation limits must be positive for {}", server.uri);
            }
            if let Some(v) = server.version {
                if v != 2 && v != 3 {
                    anyhow::bail!("Unsupported LDAP version {} for {}", v, server.uri);
                }
            }
        }
        if self.io_threads == Some(0) {
            anyhow::bail!("io_threads must be at least 1");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: vec![ListenConfig::new("ldap://127.0.0.1:1389")],
            backend: BackendConfig {
                bind: BindConfig {
                    method: "simple".to_string(),
                    binddn: None,
                    credentials: None,
                    network_timeout: Some(5),
                    timeout: Some(10),
                },
                servers: vec![],
                retry_max_ms: None,
                tls_skip_verify: None,
                tls_ca_file: None,
            },
            tls: None,
            io_threads: Some(1),
            proxyauthz: Some(false),
            metrics_listen: None,
            max_pdus_per_cycle: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.listen[0].url, "ldap://127.0.0.1:1389");
        assert_eq!(config.backend.servers.len(), 0);
        assert_eq!(config.backend.bind.method, "simple");
        assert_eq!(config.io_threads, Some(1));
        assert_eq!(config.proxyauthz, Some(false));
        // no backends yet
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_from_str() {
        let yaml = r#"
listen:
  - url: "ldap://0.0.0.0:389"
  - url: "ldapi://%2Frun%2Fldap-proxy.sock"
    mode: "0666"
backend:
  bind:
    method: "simple"
    binddn: "cn=admin,dc=example,dc=com"
    credentials: "password"
    network_timeout: 10
    timeout: 20
  retry_max_ms: 30000
  servers:
    - uri: "ldap://ldap1.example.com:389"
      numconns: 20
      bindconns: 10
      starttls: "critical"
    - uri: "ldap://ldap2.example.com:389"
      numconns: 15
tls:
  cert_file: "/path/to/cert.pem"
  key_file: "/path/to/key.pem"
io_threads: 4
proxyauthz: true
max_pdus_per_cycle: 32
"#;
        let config = Config::from_str(yaml).unwrap();
        assert_eq!(config.listen.len(), 2);
        assert_eq!(config.listen[0].url, "ldap://0.0.0.0:389");
        assert_eq!(config.listen[1].mode_bits().unwrap(), Some(0o666));
        assert_eq!(config.backend.servers.len(), 2);
        assert_eq!(config.backend.servers[0].uri, "ldap://ldap1.example.com:389");
        assert_eq!(config.backend.servers[0].numconns, Some(20));
        assert_eq!(config.backend.servers[0].bindconns, Some(10));
        assert_eq!(config.backend.servers[0].starttls.as_deref(), Some("critical"));
        assert_eq!(config.backend.servers[1].numconns, Some(15));
        assert_eq!(config.backend.bind.binddn, Some("cn=admin,dc=example,dc=com".to_string()));
        assert_eq!(config.backend.bind.network_timeout, Some(10));
        assert_eq!(config.backend.bind.timeout, Some(20));
        assert_eq!(config.backend.retry_max_ms, Some(30000));
        assert_eq!(config.tls.as_ref().unwrap().cert_file, Some("/path/to/cert.pem".to_string()));
        assert_eq!(config.io_threads, Some(4));
        assert_eq!(config.proxyauthz, Some(true));
        assert_eq!(config.max_pdus_per_cycle, Some(32));
        config.validate().unwrap();
    }

    #[test]
    fn test_config_from_str_minimal() {
        let yaml = r#"
listen:
  - url: "ldap://:1389"
backend:
  bind:
    method: "simple"
  servers:
    - uri: "ldap://localhost:389"
"#;
        let config = Config::from_str(yaml).unwrap();
        assert_eq!(config.listen[0].url, "ldap://:1389");
        assert_eq!(config.listen[0].tls_required, None);
        assert_eq!(config.backend.servers.len(), 1);
        assert_eq!(config.backend.servers[0].numconns, None);
        config.validate().unwrap();
    }

    #[test]
    fn test_config_from_file() {
        let yaml = r#"
listen:
  - url: "ldap://127.0.0.1:1389"
backend:
  bind:
    method: "simple"
  servers:
    - uri: "ldap://localhost:389"
      retry: 5000
      max_pending_ops: 100
"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        file.flush().unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.listen[0].url, "ldap://127.0.0.1:1389");
        assert_eq!(config.backend.servers[0].retry, Some(5000));
        assert_eq!(config.backend.servers[0].max_pending_ops, Some(100));
    }

    #[test]
    fn test_config_from_str_invalid_yaml() {
        let yaml = "invalid: yaml: content: [";
        assert!(Config::from_str(yaml).is_err());
    }

    #[test]
    fn test_config_from_file_nonexistent() {
        assert!(Config::from_file("/nonexistent/path/config.yaml").is_err());
    }

    fn valid() -> Config {
        let mut config = Config::default();
        config.backend.servers.push(BackendServer::new("ldap://localhost:389"));
        config
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        valid().validate().unwrap();

        let mut c = valid();
        c.backend.servers[0].starttls = Some("demand".into());
        assert!(c.validate().is_err());

        let mut c = valid();
        c.backend.servers[0].numconns = Some(0);
        assert!(c.validate().is_err());

        let mut c = valid();
        c.backend.servers[0].uri = "http://localhost".into();
        assert!(c.validate().is_err());

        let mut c = valid();
        c.backend.bind.method = "sasl".into();
        assert!(c.validate().is_err());

        let mut c = valid();
        c.listen = vec![ListenConfig::new("ldaps://0.0.0.0:636")];
        assert!(c.validate().is_err());

        let mut c = valid();
        c.listen[0].mode = Some("rw".into());
        assert!(c.validate().is_err());
    }
}
