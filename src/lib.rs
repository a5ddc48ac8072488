pub mod backend;
pub mod client;
pub mod config;
pub mod connection;
pub mod connector;
pub mod dialer;
pub mod driver;
pub mod error;
pub mod framing;
pub mod ldap_protocol;
pub mod listener;
pub mod lock_order;
pub mod metrics;
pub mod operation;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod stream;
pub mod tls;
pub mod upstream;

pub use config::Config;
pub use metrics::{run_metrics_server, Metrics};
pub use server::LdapLoadBalancer;
