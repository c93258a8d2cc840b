//! adslproxy-server binary: CLI parsing, logging, TLS bootstrap, run loop.

use adslproxy_server::{api, tls, Server, ServerConfig};
use clap::Parser;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::{error, info};

/// adslproxy rendezvous server
#[derive(Parser, Debug)]
#[command(name = "adslproxy-server", version, about = "Reverse tunnel rendezvous server")]
struct Cli {
    /// Port agents register to
    #[arg(short, long)]
    port: Option<u16>,

    /// Port of the JSON admin API
    #[arg(long)]
    http_port: Option<u16>,

    /// Shared token agents must present
    #[arg(short, long)]
    token: Option<String>,

    /// TLS certificate (PEM)
    #[arg(long)]
    cert: Option<String>,

    /// TLS private key (PEM)
    #[arg(long)]
    key: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.adslproxy/server.toml")]
    config: String,

    /// Generate a self-signed host certificate if none is configured
    #[arg(long)]
    generate_cert: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config = match ServerConfig::load(
        Some(&PathBuf::from(&cli.config)),
        cli.port,
        cli.http_port,
        cli.token.as_deref(),
        cli.cert.as_deref(),
        cli.key.as_deref(),
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    if config.token.is_empty() {
        error!("no token configured; pass --token or set it in the config file");
        std::process::exit(1);
    }

    let (cert_path, key_path) = if cli.generate_cert || !config.cert_path.exists() {
        let dir = config
            .cert_path
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        match tls::generate_self_signed(&dir) {
            Ok(paths) => paths,
            Err(e) => {
                error!(error = %e, "failed to generate self-signed certificate");
                std::process::exit(1);
            }
        }
    } else {
        (config.cert_path.clone(), config.key_path.clone())
    };

    let tls_config = match tls::load_tls_config(&cert_path, &key_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load TLS config");
            std::process::exit(1);
        }
    };

    let tunnel_listener = match TcpListener::bind(("::", config.tunnel_port)).await {
        Ok(l) => l,
        Err(e) => {
            error!(port = config.tunnel_port, error = %e, "cannot bind tunnel port");
            std::process::exit(1);
        }
    };
    let http_listener = match TcpListener::bind(("::", config.http_port)).await {
        Ok(l) => l,
        Err(e) => {
            error!(port = config.http_port, error = %e, "cannot bind http port");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        tunnel_port = config.tunnel_port,
        http_port = config.http_port,
        "starting adslproxy-server"
    );

    let server = Server::new(config.token.clone(), tls_config);
    let registry = server.registry().clone();
    let acceptor = server.clone();

    tokio::select! {
        result = acceptor.run(tunnel_listener) => {
            if let Err(e) = result {
                error!(error = %e, "server error");
            }
        }
        result = api::serve(http_listener, registry) => {
            if let Err(e) = result {
                error!(error = %e, "admin api error");
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    server.stop();
    info!("adslproxy-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
