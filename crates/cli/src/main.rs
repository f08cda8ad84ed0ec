// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 netstack Contributors

// netstack - CLI
// Profile console for VLESS links driven through the sing-box engine

mod commands;
mod config;
mod input;
mod shutdown;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::{debug, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use netstack_common::{ConfigSynthesizer, ProcessSupervisor, ProfileStore};

use crate::commands::AppContext;
use crate::config::{CliConfig, PathOverrides};
use crate::shutdown::Shutdown;

#[derive(Parser)]
#[command(name = "netstack")]
#[command(about = "VLESS profile console for the sing-box engine", long_about = None)]
#[command(version)]
struct Cli {
    /// Settings file (default: <config dir>/netstack/netstack.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Path to the sing-box binary
    #[arg(long, global = true)]
    engine: Option<PathBuf>,

    /// Directory holding generated profile configs
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Directory receiving engine log files
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive menu (default)
    Menu,

    /// Create a profile from a vless:// URL
    Create {
        /// The vless:// URL
        url: String,

        /// Profile name (default: the URL fragment, or the server host)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// List profiles
    List {
        /// Output names as JSON for scripting
        #[arg(short, long)]
        json: bool,
    },

    /// Run a local SOCKS proxy and open a proxied shell
    Socks {
        /// Profile name
        profile: String,
    },

    /// Run a system tunnel (TUN mode, requires root)
    Tun {
        /// Profile name
        profile: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = CliConfig::load(cli.config.as_deref())?;
    config.apply_overrides(&PathOverrides {
        engine_bin: cli.engine,
        config_dir: cli.config_dir,
        log_dir: cli.log_dir,
    });
    if let Some(source) = &config.source {
        debug!("Loaded settings from {}", source.display());
    }
    let settings = config.into_settings();

    // No mode works without the engine, so check it before anything else
    let supervisor = ProcessSupervisor::from_settings(&settings).with_context(|| {
        format!(
            "sing-box is required; set paths.engine_bin or pass --engine (looked for {})",
            settings.paths.engine_bin.display()
        )
    })?;
    info!("Using engine {}", supervisor.engine_bin().display());

    let profiles = ProfileStore::new(
        settings.paths.config_dir.clone(),
        ConfigSynthesizer::from_settings(&settings),
    );

    let mut ctx = AppContext {
        settings,
        profiles,
        supervisor,
        shutdown: Shutdown::install(),
        running: true,
    };

    let result = match cli.command.unwrap_or(Commands::Menu) {
        Commands::Menu => commands::run_menu(&mut ctx).await,
        Commands::Create { url, name } => commands::create_profile(&mut ctx, &url, name.as_deref()),
        Commands::List { json } => commands::list_profiles(&ctx, json),
        Commands::Socks { profile } => commands::run_local_forward(&mut ctx, Some(profile)).await,
        Commands::Tun { profile } => commands::run_system_tunnel(&mut ctx, Some(profile)).await,
    };

    // Sessions stop their engine themselves; this covers every other exit path
    ctx.supervisor.stop().await;

    match result {
        Err(err) if commands::is_interrupted(&err) => {
            println!();
            println!("{}", "Interrupted, engine stopped.".yellow());
            Ok(())
        }
        other => other,
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "netstack=debug,netstack_common=debug"
    } else {
        "netstack=warn,netstack_common=warn"
    };

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}
