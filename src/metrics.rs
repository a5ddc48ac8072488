//! Prometheus text metrics and the /metrics, /health, /ready HTTP endpoint.

use anyhow::{Context, Result};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{error, info};

/// Upper bucket bounds of the duration histogram, in seconds. +Inf is the count.
const DURATION_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Operation labels, matching `ldap_protocol::op_name`.
const OPS: [&str; 11] = [
    "bind", "unbind", "search", "modify", "add", "delete", "modify_dn", "compare", "abandon",
    "extended", "other",
];

fn op_index(op: &str) -> usize {
    OPS.iter().position(|&o| o == op).unwrap_or(OPS.len() - 1)
}

/// Histogram for one operation type. Buckets are stored non-cumulatively.
#[derive(Debug, Default)]
struct DurationHistogram {
    buckets: [AtomicU64; 11],
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl DurationHistogram {
    fn observe(&self, duration: Duration) {
        let micros = duration.as_micros().min(u64::MAX as u128) as u64;
        let secs = duration.as_secs_f64();
        if let Some(i) = DURATION_BUCKETS.iter().position(|&le| secs <= le) {
            self.buckets[i].fetch_add(1, Ordering::Relaxed);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct PerOp {
    started: AtomicU64,
    completed: AtomicU64,
    rejected: AtomicU64,
    duration: DurationHistogram,
}

/// Point-in-time view of one backend, for /metrics and /ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendStatus {
    pub uri: String,
    pub connections: usize,
    pub bind_connections: usize,
    pub pending_dials: usize,
    pub ops_in_flight: u64,
    pub failed_attempts: u32,
    pub eligible: bool,
}

/// Counters (thread-safe, lock-free).
#[derive(Debug, Default)]
pub struct Metrics {
    client_connections_total: AtomicU64,
    client_connections_active: AtomicU64,
    upstream_opened: AtomicU64,
    upstream_closed: AtomicU64,
    abandoned: AtomicU64,
    /// Malformed PDUs, unknown message ids and other peer protocol violations.
    protocol_errors: AtomicU64,
    per_op: [PerOp; 11],
    /// (uri, op) -> requests forwarded.
    backend_requests: dashmap::DashMap<(String, String), AtomicU64>,
    dial_failures: dashmap::DashMap<String, AtomicU64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn client_connected(&self) {
        self.client_connections_total.fetch_add(1, Ordering::Relaxed);
        self.client_connections_active.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn client_disconnected(&self) {
        let _ = self
            .client_connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn client_connections_active(&self) -> u64 {
        self.client_connections_active.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn upstream_opened(&self) {
        self.upstream_opened.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn upstream_closed(&self) {
        self.upstream_closed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn operation_started(&self, op: &str) {
        self.per_op[op_index(op)].started.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a retired operation and how long it lived.
    #[inline]
    pub fn operation_finished(&self, op: &str, duration: Duration) {
        let per_op = &self.per_op[op_index(op)];
        per_op.completed.fetch_add(1, Ordering::Relaxed);
        per_op.duration.observe(duration);
    }

    #[inline]
    pub fn inc_rejected(&self, op: &str) {
        self.per_op[op_index(op)].rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_abandoned(&self) {
        self.abandoned.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_backend_request(&self, uri: &str, op: &str) {
        let key = (uri.to_string(), op.to_string());
        self.backend_requests
            .entry(key)
            .or_insert_with(AtomicU64::default)
            .fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_dial_failure(&self, uri: &str) {
        self.dial_failures
            .entry(uri.to_string())
            .or_insert_with(AtomicU64::default)
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn rejected(&self, op: &str) -> u64 {
        self.per_op[op_index(op)].rejected.load(Ordering::Relaxed)
    }

    pub fn completed(&self, op: &str) -> u64 {
        self.per_op[op_index(op)].completed.load(Ordering::Relaxed)
    }

    /// Renders all metrics in the Prometheus text exposition format.
    pub fn render(&self, backends: &[BackendStatus]) -> String {
        let mut out = String::new();
        counter(
            &mut out,
            "ldap_lb_connections_total",
            "Total number of client connections accepted.",
            self.client_connections_total.load(Ordering::Relaxed),
        );
        out.push_str("# HELP ldap_lb_connections_active Client connections currently open.\n");
        out.push_str("# TYPE ldap_lb_connections_active gauge\n");
        out.push_str(&format!(
            "ldap_lb_connections_active {}\n",
            self.client_connections_active.load(Ordering::Relaxed)
        ));
        counter(
            &mut out,
            "ldap_lb_upstream_connections_opened_total",
            "Upstream connections that completed their handshake.",
            self.upstream_opened.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "ldap_lb_upstream_connections_closed_total",
            "Upstream connections torn down.",
            self.upstream_closed.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "ldap_lb_protocol_errors_total",
            "Peer protocol violations (invalid BER, unknown message id, oversized PDU).",
            self.protocol_errors.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "ldap_lb_operations_abandoned_total",
            "Operations abandoned by clients.",
            self.abandoned.load(Ordering::Relaxed),
        );

        self.per_op_family(
            &mut out,
            "ldap_lb_operations_started_total",
            "Operations received from clients by type.",
            |p| &p.started,
        );
        self.per_op_family(
            &mut out,
            "ldap_lb_operations_completed_total",
            "Operations retired by type.",
            |p| &p.completed,
        );
        self.per_op_family(
            &mut out,
            "ldap_lb_operations_rejected_total",
            "Operations answered by the proxy itself with an error.",
            |p| &p.rejected,
        );

        out.push_str("# HELP ldap_lb_backend_servers Number of configured backend servers.\n");
        out.push_str("# TYPE ldap_lb_backend_servers gauge\n");
        out.push_str(&format!("ldap_lb_backend_servers {}\n", backends.len()));

        out.push_str("# HELP ldap_lb_backend_connections Open upstream connections by pool.\n");
        out.push_str("# TYPE ldap_lb_backend_connections gauge\n");
        for b in backends {
            let uri = escape(&b.uri);
            out.push_str(&format!(
                "ldap_lb_backend_connections{{uri=\"{}\",pool=\"regular\"}} {}\n",
                uri, b.connections
            ));
            out.push_str(&format!(
                "ldap_lb_backend_connections{{uri=\"{}\",pool=\"bind\"}} {}\n",
                uri, b.bind_connections
            ));
        }
        out.push_str("# HELP ldap_lb_backend_operations Operations in flight per backend.\n");
        out.push_str("# TYPE ldap_lb_backend_operations gauge\n");
        for b in backends {
            out.push_str(&format!(
                "ldap_lb_backend_operations{{uri=\"{}\"}} {}\n",
                escape(&b.uri),
                b.ops_in_flight
            ));
        }
        out.push_str("# HELP ldap_lb_backend_up Backend accepts new operations: 1 = yes, 0 = no (backing off or saturated).\n");
        out.push_str("# TYPE ldap_lb_backend_up gauge\n");
        for b in backends {
            out.push_str(&format!(
                "ldap_lb_backend_up{{uri=\"{}\"}} {}\n",
                escape(&b.uri),
                u8::from(b.eligible)
            ));
        }

        out.push_str("# HELP ldap_lb_backend_requests_total Total requests forwarded to each backend by operation.\n");
        out.push_str("# TYPE ldap_lb_backend_requests_total counter\n");
        for entry in self.backend_requests.iter() {
            let ((uri, op), count) = (entry.key(), entry.value().load(Ordering::Relaxed));
            out.push_str(&format!(
                "ldap_lb_backend_requests_total{{uri=\"{}\",op=\"{}\"}} {}\n",
                escape(uri),
                op,
                count
            ));
        }
        out.push_str("# HELP ldap_lb_backend_dial_failures_total Failed upstream connection attempts.\n");
        out.push_str("# TYPE ldap_lb_backend_dial_failures_total counter\n");
        for entry in self.dial_failures.iter() {
            out.push_str(&format!(
                "ldap_lb_backend_dial_failures_total{{uri=\"{}\"}} {}\n",
                escape(entry.key()),
                entry.value().load(Ordering::Relaxed)
            ));
        }

        out.push_str("# HELP ldap_lb_request_duration_seconds Operation lifetime in seconds by operation.\n");
        out.push_str("# TYPE ldap_lb_request_duration_seconds histogram\n");
        for (op, per_op) in OPS.iter().zip(self.per_op.iter()) {
            let hist = &per_op.duration;
            let count = hist.count.load(Ordering::Relaxed);
            let mut cum = 0u64;
            for (i, &le) in DURATION_BUCKETS.iter().enumerate() {
                cum += hist.buckets[i].load(Ordering::Relaxed);
                out.push_str(&format!(
                    "ldap_lb_request_duration_seconds_bucket{{op=\"{}\",le=\"{}\"}} {}\n",
                    op, le, cum
                ));
            }
            out.push_str(&format!(
                "ldap_lb_request_duration_seconds_bucket{{op=\"{}\",le=\"+Inf\"}} {}\n",
                op, count
            ));
            let sum_secs = hist.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
            out.push_str(&format!(
                "ldap_lb_request_duration_seconds_sum{{op=\"{}\"}} {}\n",
                op, sum_secs
            ));
            out.push_str(&format!(
                "ldap_lb_request_duration_seconds_count{{op=\"{}\"}} {}\n",
                op, count
            ));
        }

        out
    }
}

impl Metrics {
    fn per_op_family(&self, out: &mut String, name: &str, help: &str, pick: impl Fn(&PerOp) -> &AtomicU64) {
        out.push_str(&format!("# HELP {} {}\n# TYPE {} counter\n", name, help, name));
        for (op, per_op) in OPS.iter().zip(self.per_op.iter()) {
            out.push_str(&format!("{}{{op=\"{}\"}} {}\n", name, op, pick(per_op).load(Ordering::Relaxed)));
        }
    }
}

fn counter(out: &mut String, name: &str, help: &str, value: u64) {
    out.push_str(&format!("# HELP {} {}\n# TYPE {} counter\n{} {}\n", name, help, name, name, value));
}

fn escape(label: &str) -> String {
    label.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Body of GET /ready.
#[derive(Serialize)]
struct ReadyBody {
    ready: bool,
    backends: Vec<BackendStatus>,
}

/// Path of the first HTTP request line ("GET /health HTTP/1.1" -> "/health").
fn request_path(first_line: &str) -> &str {
    let line = first_line.trim();
    let mut parts = line.split_ascii_whitespace();
    let _method = parts.next();
    let path = parts.next().unwrap_or("");
    if path.starts_with('/') {
        path
    } else {
        ""
    }
}

/// Ready when some backend has an open connection or could take work now.
fn is_ready(backends: &[BackendStatus]) -> bool {
    backends.iter().any(|b| b.connections > 0 || b.eligible)
}

pub type BackendInfo = Arc<dyn Fn() -> Vec<BackendStatus> + Send + Sync>;

/// Serves GET /metrics, GET /health and GET /ready.
/// - /health (liveness): 200 while the process runs.
/// - /ready (readiness): 200 if at least one backend can take operations, else 503.
pub async fn run_metrics_server(addr: &str, metrics: Arc<Metrics>, backend_info: BackendInfo) -> Result<()> {
    let socket_addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid metrics listen address: {}", addr))?;

    let listener = TcpListener::bind(&socket_addr)
        .await
        .with_context(|| format!("Failed to bind metrics server to {}", socket_addr))?;

    info!("Metrics server listening on http://{} (GET /metrics, /health, /ready)", socket_addr);

    loop {
        let (mut stream, _peer) = match listener.accept().await {
            Ok(accept) => accept,
            Err(e) => {
                error!("Metrics accept error: {}", e);
                continue;
            }
        };

        let metrics = Arc::clone(&metrics);
        let backend_info = Arc::clone(&backend_info);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let mut total = 0usize;
            loop {
                match stream.read(&mut buf[total..]).await {
                    Ok(0) => break,
                    Ok(n) => {
                        total += n;
                        if buf[..total].windows(4).any(|w| w == b"\r\n\r\n") || total >= buf.len() {
                            break;
                        }
                    }
                    Err(_) => return,
                }
            }

            let request = String::from_utf8_lossy(&buf[..total]);
            let path = request.lines().next().map(request_path).unwrap_or("");

            let (status, body, content_type) = match path {
                "/health" => ("200 OK", "ok".to_string(), "text/plain; charset=utf-8"),
                "/ready" => {
                    let backends = backend_info();
                    let ready = is_ready(&backends);
                    let body_json = serde_json::to_string(&ReadyBody { ready, backends })
                        .unwrap_or_else(|_| r#"{"ready":false,"backends":[],"error":"serialize"}"#.to_string());
                    let status = if ready { "200 OK" } else { "503 Service Unavailable" };
                    (status, body_json, "application/json")
                }
                "/metrics" => ("200 OK", metrics.render(&backend_info()), "text/plain; charset=utf-8"),
                _ => (
                    "404 Not Found",
                    "Not found. Supported: GET /metrics, GET /health, GET /ready.\n".to_string(),
                    "text/plain; charset=utf-8",
                ),
            };
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: {}\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{}",
                status,
                content_type,
                body.len(),
                body
            );

            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(uri: &str, connections: usize, eligible: bool) -> BackendStatus {
        BackendStatus {
            uri: uri.to_string(),
            connections,
            bind_connections: 0,
            pending_dials: 0,
            ops_in_flight: 0,
            failed_attempts: 0,
            eligible,
        }
    }

    #[test]
    fn test_request_path() {
        assert_eq!(request_path("GET /health HTTP/1.1"), "/health");
        assert_eq!(request_path("GET /ready HTTP/1.0"), "/ready");
        assert_eq!(request_path("GET /metrics HTTP/1.1"), "/metrics");
        assert_eq!(request_path(""), "");
        assert_eq!(request_path("GET  HTTP/1.1"), "");
    }

    #[test]
    fn test_backend_requests_metric() {
        let m = Metrics::default();
        m.inc_backend_request("ldap://ldap1:389", "search");
        m.inc_backend_request("ldap://ldap1:389", "search");
        m.inc_backend_request("ldap://ldap2:389", "bind");
        m.inc_dial_failure("ldap://ldap2:389");
        let out = m.render(&[status("ldap://ldap1:389", 1, true), status("ldap://ldap2:389", 0, false)]);
        assert!(out.contains("ldap_lb_backend_requests_total{uri=\"ldap://ldap1:389\",op=\"search\"} 2"));
        assert!(out.contains("ldap_lb_backend_requests_total{uri=\"ldap://ldap2:389\",op=\"bind\"} 1"));
        assert!(out.contains("ldap_lb_backend_dial_failures_total{uri=\"ldap://ldap2:389\"} 1"));
        assert!(out.contains("ldap_lb_backend_up{uri=\"ldap://ldap2:389\"} 0"));
        assert!(out.contains("ldap_lb_backend_servers 2"));
    }

    #[test]
    fn test_operation_counters() {
        let m = Metrics::new();
        m.operation_started("search");
        m.operation_finished("search", Duration::from_millis(3));
        m.inc_rejected("search");
        m.operation_started("whoami");
        assert_eq!(m.completed("search"), 1);
        assert_eq!(m.rejected("search"), 1);
        let out = m.render(&[]);
        assert!(out.contains("ldap_lb_operations_started_total{op=\"other\"} 1"));
        assert!(out.contains("ldap_lb_request_duration_seconds_bucket{op=\"search\",le=\"0.005\"} 1"));
        assert!(out.contains("ldap_lb_request_duration_seconds_count{op=\"search\"} 1"));
    }

    #[test]
    fn test_client_gauge_never_underflows() {
        let m = Metrics::new();
        m.client_connected();
        m.client_disconnected();
        m.client_disconnected();
        assert_eq!(m.client_connections_active(), 0);
    }

    #[test]
    fn test_ready() {
        assert!(!is_ready(&[]));
        assert!(!is_ready(&[status("a", 0, false)]));
        assert!(is_ready(&[status("a", 0, false), status("b", 2, false)]));
        assert!(is_ready(&[status("a", 0, true)]));
    }
}
