// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 netstack Contributors

// netstack - Common Library
// Credential parsing, engine config synthesis, profile storage and process supervision

pub mod config;
pub mod error;
pub mod network;
pub mod privilege;
pub mod profile_manager;
pub mod singbox;
pub mod supervisor;
pub mod vless;

pub use config::{LocalForwardSettings, PathsConfig, SessionSettings, Settings, SystemTunnelSettings};
pub use error::{Error, Result};
pub use network::{is_loopback_address, proxy_env, socks_proxy_url};
pub use privilege::is_elevated;
pub use profile_manager::{sanitize_name, Profile, ProfileMode, ProfilePaths, ProfileStore};
pub use singbox::{
    build_outbound, synthesize_local_forward, synthesize_system_tunnel, ConfigSynthesizer,
    EngineConfig,
};
pub use supervisor::{ProcessHandle, ProcessSupervisor, SessionObserver, SilentObserver};
pub use vless::{parse_vless_url, ConnectionParameters, Security};

// Re-export the cancellation token used by supervised sessions
pub use tokio_util::sync::CancellationToken;
