//! adslproxy-agent binary: CLI parsing, proxy bootstrap, run loop.

use adslproxy_agent::{platform_redialer, proxy, AdslConfig, Agent, AgentConfig, ProxyCredential};
use adslproxy_core::ForwardSpec;
use anyhow::{bail, Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// adslproxy edge agent
#[derive(Parser, Debug)]
#[command(name = "adslproxy-agent", version, about = "Reverse tunnel edge agent")]
struct Cli {
    /// Server address (host:port)
    #[arg(short, long)]
    server: String,

    /// Shared token
    #[arg(short, long)]
    token: String,

    /// Username advertised to the server
    #[arg(short, long, default_value = "demo")]
    user: String,

    /// Forward spec, repeatable: name,bind,target[,options]
    /// e.g. --forward echo,[::]:0,127.0.0.1:9000
    #[arg(short, long = "forward")]
    forwards: Vec<String>,

    /// Host a local HTTP proxy and forward it as "http"
    #[arg(long)]
    http_proxy: bool,

    /// Host a local SOCKS5 proxy and forward it as "socks5"
    #[arg(long)]
    socks5_proxy: bool,

    /// Username required by the local proxies
    #[arg(long)]
    proxy_user: Option<String>,

    /// Password required by the local proxies
    #[arg(long)]
    proxy_pass: Option<String>,

    /// Seconds between redial attempts
    #[arg(long, default_value_t = 1)]
    redial_interval: u64,

    /// Name of the adsl interface (used on windows)
    #[arg(long, default_value = "")]
    adsl_name: String,

    /// adsl username (used on windows)
    #[arg(long, default_value = "")]
    adsl_username: String,

    /// adsl password (used on windows)
    #[arg(long, default_value = "")]
    adsl_password: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let mut forwards = cli
        .forwards
        .iter()
        .map(|arg| parse_forward_arg(arg))
        .collect::<Result<Vec<_>>>()?;

    let credential = match (cli.proxy_user, cli.proxy_pass) {
        (Some(username), Some(password)) => Some(ProxyCredential { username, password }),
        (None, None) => None,
        _ => bail!("--proxy-user and --proxy-pass must be given together"),
    };

    if cli.http_proxy {
        let addr = proxy::http::spawn(credential.clone())
            .await
            .context("failed to start http proxy")?;
        forwards.push(ForwardSpec::new(
            "http",
            "[::]:0",
            &format!("127.0.0.1:{}", addr.port()),
        ));
    }
    if cli.socks5_proxy {
        let addr = proxy::socks5::spawn(credential)
            .await
            .context("failed to start socks5 proxy")?;
        forwards.push(ForwardSpec::new(
            "socks5",
            "[::]:0",
            &format!("127.0.0.1:{}", addr.port()),
        ));
    }

    if forwards.is_empty() {
        bail!("nothing to forward; pass --forward, --http-proxy or --socks5-proxy");
    }

    let mut agent = Agent::new(AgentConfig {
        server_addr: cli.server,
        user: cli.user,
        token: cli.token,
        accept_any_host_cert: true,
    });
    for forward in forwards {
        agent.add_forward(forward);
    }

    let adsl = AdslConfig {
        interface: cli.adsl_name,
        username: cli.adsl_username,
        password: cli.adsl_password,
    };
    match platform_redialer(&adsl) {
        Ok(redialer) => {
            agent.set_redialer(Arc::from(redialer), Duration::from_secs(cli.redial_interval))
        }
        Err(e) => warn!("no redialer available: {}", e),
    }

    let agent = Arc::new(agent);
    let signal_agent = agent.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received shutdown signal");
            signal_agent.stop();
        }
    });

    agent.run().await;
    info!("adslproxy-agent stopped");
    Ok(())
}

/// Parse `name,bind,target[,options]`.
fn parse_forward_arg(arg: &str) -> Result<ForwardSpec> {
    let parts: Vec<&str> = arg.splitn(4, ',').collect();
    if parts.len() < 3 || parts[..3].iter().any(|p| p.is_empty()) {
        bail!("bad forward spec {arg:?}; expected name,bind,target[,options]");
    }

    let mut spec = ForwardSpec::new(parts[0], parts[1], parts[2]);
    if let Some(options) = parts.get(3) {
        spec.options = options.to_string();
    }
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_arg_parses() {
        let spec = parse_forward_arg("echo,[::]:0,127.0.0.1:9000").unwrap();
        assert_eq!(spec.name, "echo");
        assert_eq!(spec.bind_addr, "[::]:0");
        assert_eq!(spec.target, "127.0.0.1:9000");
        assert!(spec.options.is_empty());
    }

    #[test]
    fn forward_arg_with_options() {
        let spec = parse_forward_arg("http,0.0.0.0:8080,127.0.0.1:3128,tagged").unwrap();
        assert_eq!(spec.options, "tagged");
    }

    #[test]
    fn forward_arg_rejects_garbage() {
        assert!(parse_forward_arg("just-a-name").is_err());
        assert!(parse_forward_arg("a,,c").is_err());
    }
}
