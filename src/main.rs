use anyhow::{Context, Result};
use clap::Parser;
use ldap_proxy::config::ListenConfig;
use ldap_proxy::{Config, LdapLoadBalancer};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "ldap-proxy")]
#[command(about = "LDAP v3 load balancer - multiplexes client operations over pooled backend connections")]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Listen URL, repeatable (overrides config; e.g. ldap://:1389)
    #[arg(short = 'l', long, value_name = "URL")]
    listen: Vec<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("ldap_proxy={},info", log_level))
        .init();

    info!("Starting LDAP proxy");
    let mut config = Config::from_file(&args.config)?;
    if !args.listen.is_empty() {
        config.listen = args.listen.iter().map(ListenConfig::new).collect();
    }
    config.validate()?;

    let io_threads = config.io_threads.unwrap_or(1) as usize;
    info!("Configuration loaded from {:?}:", args.config);
    for listen in &config.listen {
        info!("  Listen URL: {}", listen.url);
    }
    info!("  Backend servers: {}", config.backend.servers.len());
    info!("  Proxy AuthZ: {}", config.proxyauthz.unwrap_or(false));
    info!("  IO Threads: {}", io_threads);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(io_threads)
        .enable_all()
        .build()
        .context("Build tokio runtime")?;
    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<()> {
    let load_balancer = LdapLoadBalancer::bind(&config).await?;

    #[cfg(unix)]
    {
        if let Some(tls) = load_balancer.proxy().reloadable_tls().cloned() {
            use tokio::signal::unix::{signal, SignalKind};
            let mut hangup = signal(SignalKind::hangup()).context("Install SIGHUP handler")?;
            tokio::spawn(async move {
                while hangup.recv().await.is_some() {
                    match tls.reload() {
                        Ok(()) => info!("TLS certificate reloaded"),
                        Err(e) => warn!("TLS reload failed, keeping the current certificate: {:#}", e),
                    }
                }
            });
        }
    }

    load_balancer
        .serve(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Cannot wait for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
}
