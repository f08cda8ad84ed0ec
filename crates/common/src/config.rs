// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 netstack Contributors

// Configuration structures for netstack

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Complete console settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub local_forward: LocalForwardSettings,
    #[serde(default)]
    pub system_tunnel: SystemTunnelSettings,
    #[serde(default)]
    pub session: SessionSettings,
    /// Log level written into generated engine configs
    #[serde(default = "default_engine_log_level")]
    pub engine_log_level: String,
}

/// Filesystem locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory holding `{profile}-socks.json` / `{profile}-tun.json`
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,
    /// Directory receiving engine log files
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Path to the proxy engine binary
    #[serde(default = "default_engine_bin")]
    pub engine_bin: PathBuf,
}

/// Local SOCKS listener settings (local-forward mode)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalForwardSettings {
    /// Listen address (default: 127.0.0.1)
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    /// Listen port (default: 1080)
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Enable protocol sniffing on the inbound
    #[serde(default = "default_true")]
    pub sniff: bool,
}

/// Virtual interface settings (system-tunnel mode)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemTunnelSettings {
    #[serde(default = "default_interface_name")]
    pub interface_name: String,
    /// Address pool assigned to the interface
    #[serde(default = "default_tun_address")]
    pub address: Vec<String>,
    #[serde(default = "default_mtu")]
    pub mtu: u32,
    #[serde(default = "default_true")]
    pub auto_route: bool,
    #[serde(default = "default_true")]
    pub auto_redirect: bool,
    #[serde(default = "default_true")]
    pub strict_route: bool,
    /// Network stack used by the engine for the interface
    #[serde(default = "default_stack")]
    pub stack: String,
    /// Ranges that bypass the tunnel (LAN stays local)
    #[serde(default = "default_route_exclude_address")]
    pub route_exclude_address: Vec<String>,
    /// Remote resolver, reached through the proxy outbound
    #[serde(default = "default_dns_server")]
    pub dns_server: String,
    #[serde(default = "default_dns_strategy")]
    pub dns_strategy: String,
    #[serde(default = "default_true")]
    pub sniff: bool,
}

/// Supervised session behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Shell spawned for local-forward sessions
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Seconds to wait after SIGTERM before killing the engine
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

// Default value functions
fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("netstack")
}

fn default_config_dir() -> PathBuf {
    data_dir().join("configs")
}

fn default_log_dir() -> PathBuf {
    data_dir().join("logs")
}

fn default_engine_bin() -> PathBuf {
    data_dir().join("sing-box")
}

fn default_listen_host() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    1080
}

fn default_true() -> bool {
    true
}

fn default_interface_name() -> String {
    "tun0".to_string()
}

fn default_tun_address() -> Vec<String> {
    vec!["172.19.0.1/30".to_string()]
}

fn default_mtu() -> u32 {
    9000
}

fn default_stack() -> String {
    "system".to_string()
}

fn default_route_exclude_address() -> Vec<String> {
    vec![
        "192.168.0.0/16".to_string(),
        "10.0.0.0/8".to_string(),
        "172.16.0.0/12".to_string(),
    ]
}

fn default_dns_server() -> String {
    "https://1.1.1.1/dns-query".to_string()
}

fn default_dns_strategy() -> String {
    "ipv4_only".to_string()
}

fn default_shell() -> String {
    "bash".to_string()
}

fn default_stop_timeout() -> u64 {
    5
}

fn default_engine_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            local_forward: LocalForwardSettings::default(),
            system_tunnel: SystemTunnelSettings::default(),
            session: SessionSettings::default(),
            engine_log_level: default_engine_log_level(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            log_dir: default_log_dir(),
            engine_bin: default_engine_bin(),
        }
    }
}

impl Default for LocalForwardSettings {
    fn default() -> Self {
        Self {
            listen_host: default_listen_host(),
            listen_port: default_listen_port(),
            sniff: true,
        }
    }
}

impl Default for SystemTunnelSettings {
    fn default() -> Self {
        Self {
            interface_name: default_interface_name(),
            address: default_tun_address(),
            mtu: default_mtu(),
            auto_route: true,
            auto_redirect: true,
            strict_route: true,
            stack: default_stack(),
            route_exclude_address: default_route_exclude_address(),
            dns_server: default_dns_server(),
            dns_strategy: default_dns_strategy(),
            sniff: true,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

impl SessionSettings {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

impl Settings {
    /// Parse settings from TOML text; missing keys take their defaults
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let settings: Self = toml::from_str(contents)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        if self.local_forward.listen_host.is_empty() {
            return Err(Error::Config("local_forward.listen_host cannot be empty".to_string()));
        }
        if self.local_forward.listen_port == 0 {
            return Err(Error::Config(
                "local_forward.listen_port must be greater than 0".to_string(),
            ));
        }
        if self.system_tunnel.interface_name.is_empty() {
            return Err(Error::Config(
                "system_tunnel.interface_name cannot be empty".to_string(),
            ));
        }
        if self.system_tunnel.mtu == 0 {
            return Err(Error::Config("system_tunnel.mtu must be greater than 0".to_string()));
        }
        if self.system_tunnel.address.is_empty() {
            return Err(Error::Config(
                "system_tunnel.address needs at least one entry".to_string(),
            ));
        }
        if self.session.shell.trim().is_empty() {
            return Err(Error::Config("session.shell cannot be empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.local_forward.listen_host, "127.0.0.1");
        assert_eq!(settings.local_forward.listen_port, 1080);
        assert_eq!(settings.system_tunnel.interface_name, "tun0");
        assert_eq!(settings.system_tunnel.mtu, 9000);
        assert_eq!(settings.system_tunnel.route_exclude_address.len(), 3);
        assert_eq!(settings.session.stop_timeout(), Duration::from_secs(5));
        assert!(settings.paths.engine_bin.ends_with("sing-box"));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let settings = Settings::from_toml_str(
            r#"
            engine_log_level = "warn"

            [local_forward]
            listen_port = 2080

            [system_tunnel]
            interface_name = "utun9"
            "#,
        )
        .unwrap();

        assert_eq!(settings.engine_log_level, "warn");
        assert_eq!(settings.local_forward.listen_port, 2080);
        assert_eq!(settings.local_forward.listen_host, "127.0.0.1");
        assert_eq!(settings.system_tunnel.interface_name, "utun9");
        assert_eq!(settings.system_tunnel.mtu, 9000);
        assert_eq!(settings.session.shell, "bash");
    }

    #[test]
    fn test_empty_toml_is_default() {
        let settings = Settings::from_toml_str("").unwrap();
        assert_eq!(settings.engine_log_level, "info");
        assert_eq!(settings.local_forward.listen_port, 1080);
    }

    #[test]
    fn test_invalid_settings() {
        assert!(matches!(
            Settings::from_toml_str("[local_forward]\nlisten_port = 0").unwrap_err(),
            Error::Config(_)
        ));
        assert!(matches!(
            Settings::from_toml_str("[system_tunnel]\nmtu = 0").unwrap_err(),
            Error::Config(_)
        ));
        assert!(matches!(
            Settings::from_toml_str("[session]\nshell = \"\"").unwrap_err(),
            Error::Config(_)
        ));
        assert!(matches!(
            Settings::from_toml_str("[local_forward\n").unwrap_err(),
            Error::Toml(_)
        ));
    }
}
