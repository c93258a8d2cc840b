//! Server configuration: TOML file + CLI overrides.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    /// Port agents register to.
    #[serde(default = "default_tunnel_port")]
    pub tunnel_port: u16,
    /// Port of the JSON admin API.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Shared secret agents authenticate with.
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_cert_path")]
    pub cert: String,
    #[serde(default = "default_key_path")]
    pub key: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            tunnel_port: default_tunnel_port(),
            http_port: default_http_port(),
            token: String::new(),
            cert: default_cert_path(),
            key: default_key_path(),
        }
    }
}

fn default_tunnel_port() -> u16 {
    11222
}
fn default_http_port() -> u16 {
    11280
}
fn default_cert_path() -> String {
    "~/.adslproxy/cert.pem".to_string()
}
fn default_key_path() -> String {
    "~/.adslproxy/key.pem".to_string()
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub tunnel_port: u16,
    pub http_port: u16,
    pub token: String,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl ServerConfig {
    /// Load from a TOML file, then apply CLI overrides. A missing file is
    /// not an error; defaults apply.
    pub fn load(
        config_path: Option<&Path>,
        cli_tunnel_port: Option<u16>,
        cli_http_port: Option<u16>,
        cli_token: Option<&str>,
        cli_cert: Option<&str>,
        cli_key: Option<&str>,
    ) -> Result<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .with_context(|| format!("config parse error in {}", expanded.display()))?
                } else {
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let server = file_config.server;
        let cert = cli_cert.map(str::to_string).unwrap_or(server.cert);
        let key = cli_key.map(str::to_string).unwrap_or(server.key);

        Ok(Self {
            tunnel_port: cli_tunnel_port.unwrap_or(server.tunnel_port),
            http_port: cli_http_port.unwrap_or(server.http_port),
            token: cli_token.map(str::to_string).unwrap_or(server.token),
            cert_path: expand_tilde_str(&cert),
            key_path: expand_tilde_str(&key),
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    expand_tilde_str(&path.to_string_lossy())
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        let cfg = ServerConfig::load(None, None, None, None, None, None).unwrap();
        assert_eq!(cfg.tunnel_port, 11222);
        assert_eq!(cfg.http_port, 11280);
        assert!(cfg.token.is_empty());
    }

    #[test]
    fn cli_overrides_win() {
        let cfg =
            ServerConfig::load(None, Some(4000), None, Some("secret"), None, None).unwrap();
        assert_eq!(cfg.tunnel_port, 4000);
        assert_eq!(cfg.http_port, 11280);
        assert_eq!(cfg.token, "secret");
    }

    #[test]
    fn file_values_parse() {
        let toml = r#"
            [server]
            tunnel_port = 1234
            token = "t"
        "#;
        let file: ConfigFile = toml::from_str(toml).unwrap();
        assert_eq!(file.server.tunnel_port, 1234);
        assert_eq!(file.server.token, "t");
        assert_eq!(file.server.http_port, 11280);
    }
}
