//! WAN-link redialing.
//!
//! The agent only sees the [`Redialer`] capability; the concrete command
//! sequence is picked by a platform probe at construction time. Redial
//! failures are never fatal — the session manager retries forever at its
//! redial interval.

use std::io;
use std::path::PathBuf;
use std::process::Command;
use tracing::{info, warn};

/// Brings the WAN link down and back up. Implementations block; the agent
/// calls them from a blocking task.
pub trait Redialer: Send + Sync {
    fn redial(&self) -> io::Result<()>;
}

/// Settings for the platform redialer. The credential fields are only used
/// by the Windows RAS dialer; PPPoE setups configure credentials in the OS.
#[derive(Debug, Clone, Default)]
pub struct AdslConfig {
    pub interface: String,
    pub username: String,
    pub password: String,
}

/// Pick the redialer for the running OS.
pub fn platform_redialer(config: &AdslConfig) -> io::Result<Box<dyn Redialer>> {
    match std::env::consts::OS {
        "windows" => Ok(Box::new(RasRedialer {
            interface: config.interface.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        })),
        "linux" => Ok(Box::new(PppoeRedialer::default())),
        other => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("no redialer for {other}"),
        )),
    }
}

const DEFAULT_PPPOE_START: &str = "/usr/sbin/pppoe-start";
const DEFAULT_PPPOE_STOP: &str = "/usr/sbin/pppoe-stop";

/// PPPoE redialer: stop, start, then make sure the default route points at
/// the ppp device again.
pub struct PppoeRedialer {
    pub start_script: PathBuf,
    pub stop_script: PathBuf,
}

impl Default for PppoeRedialer {
    fn default() -> Self {
        Self {
            start_script: PathBuf::from(DEFAULT_PPPOE_START),
            stop_script: PathBuf::from(DEFAULT_PPPOE_STOP),
        }
    }
}

impl Redialer for PppoeRedialer {
    fn redial(&self) -> io::Result<()> {
        // A failed stop is fine: the link may already be down.
        if let Err(e) = run_script(&self.stop_script) {
            warn!("pppoe stop failed: {}", e);
        }

        run_script(&self.start_script)?;
        check_route()
    }
}

fn run_script(script: &PathBuf) -> io::Result<()> {
    let output = Command::new("/bin/bash").arg(script).output()?;
    if output.status.success() {
        Ok(())
    } else {
        Err(io::Error::other(format!(
            "{} exited with {}",
            script.display(),
            output.status
        )))
    }
}

/// After `pppoe-start` the kernel sometimes comes up without a default
/// route. If `ip route` shows no ppp device, find one in `ip link` and add
/// the route by hand.
fn check_route() -> io::Result<()> {
    let routes = Command::new("/usr/sbin/ip").arg("route").output()?;
    if find_ppp_dev(&String::from_utf8_lossy(&routes.stdout)).is_some() {
        return Ok(());
    }

    let links = Command::new("/usr/sbin/ip").arg("link").output()?;
    let Some(dev) = find_ppp_dev(&String::from_utf8_lossy(&links.stdout)) else {
        return Err(io::Error::other("no ppp dev found"));
    };

    info!(dev = %dev, "repairing default route");
    let status = Command::new("/usr/sbin/route")
        .args(["add", "default", "dev", &dev])
        .output()?;
    if status.status.success() {
        Ok(())
    } else {
        Err(io::Error::other(format!(
            "route add failed with {}",
            status.status
        )))
    }
}

/// Find the first `ppp<N>` device name in command output.
fn find_ppp_dev(text: &str) -> Option<String> {
    for token in text.split(|c: char| !c.is_ascii_alphanumeric()) {
        if let Some(digits) = token.strip_prefix("ppp") {
            if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                return Some(token.to_string());
            }
        }
    }
    None
}

/// Windows RAS redialer: hang up the named connection, dial it again.
pub struct RasRedialer {
    pub interface: String,
    pub username: String,
    pub password: String,
}

impl Redialer for RasRedialer {
    fn redial(&self) -> io::Result<()> {
        // Disconnect failures are expected when the line already dropped.
        if let Err(e) = Command::new("rasdial")
            .args([&self.interface, "/DISCONNECT"])
            .output()
        {
            warn!("rasdial disconnect failed: {}", e);
        }

        let output = Command::new("rasdial")
            .args([&self.interface, &self.username, &self.password])
            .output()?;
        if output.status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!(
                "rasdial exited with {}",
                output.status
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_ppp_device_in_link_output() {
        let out = "1: lo: <LOOPBACK,UP> mtu 65536\n\
                   2: eth0: <BROADCAST> mtu 1500\n\
                   3: ppp0: <POINTOPOINT,UP> mtu 1492\n";
        assert_eq!(find_ppp_dev(out).as_deref(), Some("ppp0"));
    }

    #[test]
    fn finds_ppp_device_in_route_output() {
        let out = "default dev ppp12 scope link\n10.0.0.0/8 via 10.0.0.1 dev eth0\n";
        assert_eq!(find_ppp_dev(out).as_deref(), Some("ppp12"));
    }

    #[test]
    fn ignores_non_ppp_tokens() {
        let out = "default via 192.168.1.1 dev eth0\npppx: not a dev\npppoe-wan\n";
        assert_eq!(find_ppp_dev(out), None);
    }
}
