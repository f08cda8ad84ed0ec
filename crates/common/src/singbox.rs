// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 netstack Contributors

// netstack - Engine config synthesizer
// Pure mapping from connection parameters to the two engine config documents

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::warn;

use crate::config::{LocalForwardSettings, Settings, SystemTunnelSettings};
use crate::error::Result;
use crate::vless::{ConnectionParameters, Security};

/// Tag of the outbound that reaches the remote endpoint
pub const PROXY_TAG: &str = "proxy";
/// Tag of the outbound used for excluded traffic in tunnel mode
pub const DIRECT_TAG: &str = "direct";
const SOCKS_INBOUND_TAG: &str = "socks-in";
const TUN_INBOUND_TAG: &str = "tun-in";
const DNS_REMOTE_TAG: &str = "dns-remote";

/// A complete engine configuration document
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineConfig {
    pub log: LogConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<DnsConfig>,
    pub inbounds: Vec<Inbound>,
    pub outbounds: Vec<Outbound>,
    pub route: RouteConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogConfig {
    pub level: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DnsConfig {
    pub servers: Vec<DnsServer>,
    #[serde(rename = "final")]
    pub final_server: String,
    pub strategy: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DnsServer {
    pub tag: String,
    pub address: String,
    pub strategy: String,
    pub detour: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Inbound {
    Socks(SocksInbound),
    Tun(TunInbound),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SocksInbound {
    pub tag: String,
    pub listen: String,
    pub listen_port: u16,
    pub sniff: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TunInbound {
    pub tag: String,
    pub interface_name: String,
    pub address: Vec<String>,
    pub mtu: u32,
    pub auto_route: bool,
    pub auto_redirect: bool,
    pub strict_route: bool,
    pub route_exclude_address: Vec<String>,
    pub stack: String,
    pub sniff: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Outbound {
    Vless(VlessOutbound),
    Direct { tag: String },
}

/// The outbound descriptor shared by both documents
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VlessOutbound {
    pub tag: String,
    pub server: String,
    pub server_port: u16,
    pub uuid: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub flow: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TlsConfig {
    pub enabled: bool,
    pub server_name: String,
    pub utls: UtlsConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reality: Option<RealityConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UtlsConfig {
    pub enabled: bool,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RealityConfig {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    Ws {
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
    },
    HttpUpgrade {
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        host: Option<String>,
    },
    Grpc {
        #[serde(skip_serializing_if = "Option::is_none")]
        service_name: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_detect_interface: Option<bool>,
    #[serde(rename = "final")]
    pub final_outbound: String,
}

impl EngineConfig {
    /// The proxy outbound embedded in this document
    pub fn proxy_outbound(&self) -> Option<&VlessOutbound> {
        self.outbounds.iter().find_map(|outbound| match outbound {
            Outbound::Vless(vless) if vless.tag == PROXY_TAG => Some(vless),
            _ => None,
        })
    }

    /// Pretty-printed JSON with a trailing newline, as written to disk
    pub fn to_json_pretty(&self) -> Result<String> {
        let mut rendered = serde_json::to_string_pretty(self)?;
        rendered.push('\n');
        Ok(rendered)
    }
}

/// Build the outbound descriptor for the remote endpoint
pub fn build_outbound(params: &ConnectionParameters) -> VlessOutbound {
    let tls = params.security.uses_tls().then(|| TlsConfig {
        enabled: true,
        server_name: params.sni.clone(),
        utls: UtlsConfig {
            enabled: true,
            fingerprint: params.fingerprint.clone(),
        },
        reality: (params.security == Security::Reality).then(|| RealityConfig {
            enabled: true,
            public_key: params.public_key.clone(),
            short_id: params.short_id.clone(),
        }),
    });

    VlessOutbound {
        tag: PROXY_TAG.to_string(),
        server: params.server.clone(),
        server_port: params.server_port,
        uuid: params.uuid.clone(),
        flow: params.flow.clone(),
        tls,
        transport: build_transport(params),
    }
}

fn build_transport(params: &ConnectionParameters) -> Option<TransportConfig> {
    match params.transport.to_ascii_lowercase().as_str() {
        "tcp" | "raw" | "" => None,
        "ws" => {
            let mut headers = BTreeMap::new();
            if let Some(host) = &params.host_header {
                headers.insert("Host".to_string(), host.clone());
            }
            Some(TransportConfig::Ws {
                path: params.path.clone(),
                headers,
            })
        }
        "httpupgrade" => Some(TransportConfig::HttpUpgrade {
            path: params.path.clone(),
            host: params.host_header.clone(),
        }),
        "grpc" => Some(TransportConfig::Grpc {
            service_name: params.service_name.clone(),
        }),
        other => {
            warn!("Unsupported transport '{}', falling back to plain TCP", other);
            None
        }
    }
}

/// Local SOCKS listener forwarding everything through the proxy outbound
pub fn synthesize_local_forward(
    params: &ConnectionParameters,
    settings: &LocalForwardSettings,
    log_level: &str,
) -> EngineConfig {
    EngineConfig {
        log: LogConfig {
            level: log_level.to_string(),
        },
        dns: None,
        inbounds: vec![Inbound::Socks(SocksInbound {
            tag: SOCKS_INBOUND_TAG.to_string(),
            listen: settings.listen_host.clone(),
            listen_port: settings.listen_port,
            sniff: settings.sniff,
        })],
        outbounds: vec![Outbound::Vless(build_outbound(params))],
        route: RouteConfig {
            auto_detect_interface: None,
            final_outbound: PROXY_TAG.to_string(),
        },
    }
}

/// Virtual interface capturing system traffic; excluded ranges leave directly
pub fn synthesize_system_tunnel(
    params: &ConnectionParameters,
    settings: &SystemTunnelSettings,
    log_level: &str,
) -> EngineConfig {
    EngineConfig {
        log: LogConfig {
            level: log_level.to_string(),
        },
        dns: Some(DnsConfig {
            servers: vec![DnsServer {
                tag: DNS_REMOTE_TAG.to_string(),
                address: settings.dns_server.clone(),
                strategy: settings.dns_strategy.clone(),
                detour: PROXY_TAG.to_string(),
            }],
            final_server: DNS_REMOTE_TAG.to_string(),
            strategy: settings.dns_strategy.clone(),
        }),
        inbounds: vec![Inbound::Tun(TunInbound {
            tag: TUN_INBOUND_TAG.to_string(),
            interface_name: settings.interface_name.clone(),
            address: settings.address.clone(),
            mtu: settings.mtu,
            auto_route: settings.auto_route,
            auto_redirect: settings.auto_redirect,
            strict_route: settings.strict_route,
            route_exclude_address: settings.route_exclude_address.clone(),
            stack: settings.stack.clone(),
            sniff: settings.sniff,
        })],
        outbounds: vec![
            Outbound::Vless(build_outbound(params)),
            Outbound::Direct {
                tag: DIRECT_TAG.to_string(),
            },
        ],
        route: RouteConfig {
            auto_detect_interface: Some(true),
            final_outbound: PROXY_TAG.to_string(),
        },
    }
}

/// Static per-mode defaults bundled for repeated synthesis
#[derive(Debug, Clone)]
pub struct ConfigSynthesizer {
    local_forward: LocalForwardSettings,
    system_tunnel: SystemTunnelSettings,
    log_level: String,
}

impl ConfigSynthesizer {
    pub fn new(
        local_forward: LocalForwardSettings,
        system_tunnel: SystemTunnelSettings,
        log_level: impl Into<String>,
    ) -> Self {
        Self {
            local_forward,
            system_tunnel,
            log_level: log_level.into(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.local_forward.clone(),
            settings.system_tunnel.clone(),
            settings.engine_log_level.clone(),
        )
    }

    pub fn local_forward(&self, params: &ConnectionParameters) -> EngineConfig {
        synthesize_local_forward(params, &self.local_forward, &self.log_level)
    }

    pub fn system_tunnel(&self, params: &ConnectionParameters) -> EngineConfig {
        synthesize_system_tunnel(params, &self.system_tunnel, &self.log_level)
    }
}

impl Default for ConfigSynthesizer {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}
