// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 netstack Contributors

// netstack - Commands
// Menu registry and the handlers shared by the menu and the subcommands

use std::io::{self, Write};
use std::path::Path;
use std::process::ExitStatus;

use anyhow::{Context, Result};
use colored::Colorize;
use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table};
use dialoguer::{Input, Select};
use tracing::debug;

use netstack_common::{
    is_loopback_address, parse_vless_url, Error, ProcessHandle, ProcessSupervisor, Profile,
    ProfileMode, ProfileStore, SessionObserver, Settings,
};

use crate::input;
use crate::shutdown::Shutdown;

/// State shared by every command for the lifetime of the process
pub struct AppContext {
    pub settings: Settings,
    pub profiles: ProfileStore,
    pub supervisor: ProcessSupervisor,
    pub shutdown: Shutdown,
    pub running: bool,
}

/// Entries of the interactive menu, in display order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuCommand {
    CreateProfile,
    ListProfiles,
    RunLocalForward,
    RunSystemTunnel,
    Quit,
}

impl MenuCommand {
    pub const ALL: [MenuCommand; 5] = [
        MenuCommand::CreateProfile,
        MenuCommand::ListProfiles,
        MenuCommand::RunLocalForward,
        MenuCommand::RunSystemTunnel,
        MenuCommand::Quit,
    ];

    pub fn label(self) -> &'static str {
        match self {
            MenuCommand::CreateProfile => "Create new profile from VLESS URL",
            MenuCommand::ListProfiles => "List profiles",
            MenuCommand::RunLocalForward => "Run local SOCKS proxy and open proxied shell",
            MenuCommand::RunSystemTunnel => "Run system tunnel (TUN mode, requires root)",
            MenuCommand::Quit => "Quit",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            MenuCommand::CreateProfile => {
                "Parse a vless:// URL and write its SOCKS and TUN configs"
            }
            MenuCommand::ListProfiles => "Show every profile found in the config directory",
            MenuCommand::RunLocalForward => {
                "Start sing-box with a local SOCKS5 listener and open a shell that uses it"
            }
            MenuCommand::RunSystemTunnel => {
                "Start sing-box with a TUN interface that routes all system traffic"
            }
            MenuCommand::Quit => "Stop any running engine and exit",
        }
    }

    pub async fn execute(self, ctx: &mut AppContext) -> Result<()> {
        debug!("Menu command: {:?}", self);
        match self {
            MenuCommand::CreateProfile => create_profile_interactive(ctx),
            MenuCommand::ListProfiles => list_profiles(ctx, false),
            MenuCommand::RunLocalForward => run_local_forward(ctx, None).await,
            MenuCommand::RunSystemTunnel => run_system_tunnel(ctx, None).await,
            MenuCommand::Quit => {
                ctx.running = false;
                Ok(())
            }
        }
    }
}

/// Run the interactive menu until Quit, Esc or a shutdown signal
///
/// Recoverable errors are reported and the menu is shown again.
pub async fn run_menu(ctx: &mut AppContext) -> Result<()> {
    let labels: Vec<&str> = MenuCommand::ALL.iter().map(|c| c.label()).collect();

    while ctx.running && !ctx.shutdown.is_triggered() {
        println!();
        let choice = Select::new()
            .with_prompt("netstack")
            .items(&labels)
            .default(0)
            .interact_opt()
            .map_err(prompt_error)?;

        let command = match choice {
            Some(index) => MenuCommand::ALL[index],
            None => MenuCommand::Quit,
        };

        if let Err(err) = command.execute(ctx).await {
            if !is_recoverable(&err) {
                return Err(err);
            }
            println!("{} {:#}", "✗".red(), err);
        }
    }

    if ctx.shutdown.is_triggered() {
        return Err(Error::Interrupted.into());
    }

    println!("{}", "Bye.".dimmed());
    Ok(())
}

/// Library errors the operator can fix by trying again
pub fn is_recoverable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<Error>()
        .map_or(false, Error::is_recoverable)
}

pub fn is_interrupted(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<Error>(), Some(Error::Interrupted))
}

/// Ctrl+C inside a prompt becomes `Error::Interrupted`
fn prompt_error(err: dialoguer::Error) -> anyhow::Error {
    match err {
        dialoguer::Error::IO(e) if e.kind() == io::ErrorKind::Interrupted => {
            Error::Interrupted.into()
        }
        other => anyhow::Error::new(other).context("Prompt failed"),
    }
}

fn create_profile_interactive(ctx: &mut AppContext) -> Result<()> {
    println!();
    println!("{}", "Create new profile from VLESS URL".bold().green());

    let url: String = Input::new()
        .with_prompt("Paste VLESS URL")
        .allow_empty(true)
        .interact_text()
        .map_err(prompt_error)?;

    if url.trim().is_empty() {
        println!("{}", "Empty URL, nothing created".dimmed());
        return Ok(());
    }

    let params = parse_vless_url(&url).context("Failed to parse VLESS URL")?;
    let suggested = ctx.profiles.generate_unique_name(&params.name);

    let name: String = Input::new()
        .with_prompt("Profile name")
        .default(suggested)
        .interact_text()
        .map_err(prompt_error)?;

    let profile = ctx.profiles.create_profile(&params, Some(&name))?;
    announce_created(&ctx.profiles, &profile);
    Ok(())
}

/// Parse `url` and persist a profile without prompting
pub fn create_profile(ctx: &mut AppContext, url: &str, name: Option<&str>) -> Result<()> {
    let params = parse_vless_url(url).context("Failed to parse VLESS URL")?;
    let profile = ctx.profiles.create_profile(&params, name)?;
    announce_created(&ctx.profiles, &profile);
    Ok(())
}

fn announce_created(profiles: &ProfileStore, profile: &Profile) {
    let paths = profiles.resolve_profile(&profile.name);
    let params = &profile.params;

    println!();
    println!(
        "{}",
        format!("✓ Profile '{}' created", profile.name).green().bold()
    );
    println!(
        "  Server:   {}:{}",
        params.server.cyan(),
        params.server_port.to_string().cyan()
    );
    println!("  Security: {} (sni {})", params.security, params.sni);
    println!("  Network:  {}", params.transport);
    println!(
        "  SOCKS:    {}",
        paths.local_forward.display().to_string().dimmed()
    );
    println!(
        "  TUN:      {}",
        paths.system_tunnel.display().to_string().dimmed()
    );
}

pub fn list_profiles(ctx: &AppContext, json: bool) -> Result<()> {
    let names = ctx.profiles.list_profiles()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&names)?);
        return Ok(());
    }

    if names.is_empty() {
        println!("{}", "No profiles found.".yellow());
        println!("Create one with: {}", "netstack create <vless-url>".cyan());
        return Ok(());
    }

    print_profiles_table(&ctx.profiles, &names);
    Ok(())
}

fn print_profiles_table(profiles: &ProfileStore, names: &[String]) {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec![
        Cell::new("Name")
            .add_attribute(Attribute::Bold)
            .fg(Color::Cyan),
        Cell::new("SOCKS")
            .add_attribute(Attribute::Bold)
            .fg(Color::Cyan),
        Cell::new("TUN")
            .add_attribute(Attribute::Bold)
            .fg(Color::Cyan),
    ]);

    for name in names {
        let paths = profiles.resolve_profile(name);
        table.add_row(vec![
            Cell::new(name).fg(Color::Green),
            document_cell(&paths.local_forward),
            document_cell(&paths.system_tunnel),
        ]);
    }

    println!();
    println!("{}", table);
    println!();
    println!("{} profile(s) found", names.len().to_string().cyan());
    println!(
        "Config directory: {}",
        profiles.config_dir().display().to_string().dimmed()
    );
}

fn document_cell(path: &Path) -> Cell {
    if path.is_file() {
        Cell::new("✓").fg(Color::Green)
    } else {
        Cell::new("missing").fg(Color::Red)
    }
}

/// Use `requested`, or let the operator pick from the stored profiles
///
/// Returns `None` when there is nothing to pick or the pick was cancelled.
fn select_profile(ctx: &AppContext, requested: Option<String>) -> Result<Option<String>> {
    if let Some(name) = requested {
        return Ok(Some(name));
    }

    let names = ctx.profiles.list_profiles()?;
    if names.is_empty() {
        println!("{}", "No profiles found. Create one first.".yellow());
        return Ok(None);
    }

    let choice = Select::new()
        .with_prompt("Select profile")
        .items(&names)
        .default(0)
        .interact_opt()
        .map_err(prompt_error)?;

    Ok(choice.map(|index| names[index].clone()))
}

/// Start the engine with the SOCKS config of a profile and open a proxied shell
pub async fn run_local_forward(ctx: &mut AppContext, profile: Option<String>) -> Result<()> {
    let Some(name) = select_profile(ctx, profile)? else {
        return Ok(());
    };
    let config = ctx.profiles.config_for(&name, ProfileMode::LocalForward)?;

    let host = ctx.settings.local_forward.listen_host.clone();
    let port = ctx.settings.local_forward.listen_port;
    if !is_loopback_address(&host) {
        println!(
            "{}",
            format!(
                "⚠ SOCKS listener on {} is reachable from the network without authentication",
                host
            )
            .yellow()
        );
    }

    let mut observer = ConsoleObserver::new(&name, ProfileMode::LocalForward, &ctx.settings);
    let token = ctx.shutdown.token().clone();
    let _deferral = ctx.shutdown.defer_interrupts();

    ctx.supervisor
        .run_local_forward_session(&config, &name, &host, port, &token, &mut observer)
        .await?;

    println!("{}", "✓ Proxied shell closed, sing-box stopped".green());
    Ok(())
}

/// Start the engine with the TUN config of a profile and wait for `q`
pub async fn run_system_tunnel(ctx: &mut AppContext, profile: Option<String>) -> Result<()> {
    let Some(name) = select_profile(ctx, profile)? else {
        return Ok(());
    };
    let config = ctx.profiles.config_for(&name, ProfileMode::SystemTunnel)?;

    let mut observer = ConsoleObserver::new(&name, ProfileMode::SystemTunnel, &ctx.settings);
    let token = ctx.shutdown.token().clone();
    let mut input = input::stdin_lines();

    ctx.supervisor
        .run_system_tunnel_session(&config, &name, &mut input, &token, &mut observer)
        .await?;

    println!("{}", "✓ Tunnel stopped".green());
    Ok(())
}

/// Prints session progress to the terminal
struct ConsoleObserver {
    profile: String,
    mode: ProfileMode,
    listen: String,
    interface: String,
}

impl ConsoleObserver {
    fn new(profile: &str, mode: ProfileMode, settings: &Settings) -> Self {
        Self {
            profile: profile.to_string(),
            mode,
            listen: netstack_common::network::format_host_port(
                &settings.local_forward.listen_host,
                settings.local_forward.listen_port,
            ),
            interface: settings.system_tunnel.interface_name.clone(),
        }
    }
}

impl SessionObserver for ConsoleObserver {
    fn on_engine_started(&mut self, handle: &ProcessHandle) {
        println!();
        println!(
            "{}",
            format!(
                "✓ sing-box started for '{}' ({} mode, PID {})",
                self.profile,
                self.mode,
                handle.pid()
            )
            .green()
        );
        println!(
            "  Log file: {}",
            handle.log_file().display().to_string().dimmed()
        );
    }

    fn on_shell_ready(&mut self, proxy_url: &str) {
        println!("  Local SOCKS5 proxy: {}", self.listen.cyan());
        println!();
        println!("You are now in a subshell with {} set.", proxy_url.cyan());
        println!("Try: {}", "curl ifconfig.me".cyan());
        println!(
            "{}",
            "Exit the subshell (Ctrl+D or 'exit') to stop sing-box and return.".dimmed()
        );
        println!();
    }

    fn on_tunnel_ready(&mut self) {
        println!("  TUN interface: {}", self.interface.cyan());
        println!();
        println!("System traffic now goes through the tunnel (local LAN stays direct).");
        println!("{}", "Type 'q' and press Enter to stop.".dimmed());
    }

    fn on_prompt(&mut self) {
        print!("{} ", "[netstack tun] >".cyan());
        let _ = io::stdout().flush();
    }

    fn on_unknown_command(&mut self, command: &str) {
        println!(
            "{}",
            format!("Unknown command '{}'. Type 'q' to stop.", command).yellow()
        );
    }

    fn on_engine_exited(&mut self, status: Option<ExitStatus>, log_file: &Path) {
        let status = status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown status".to_string());
        println!();
        println!(
            "{}",
            format!("✗ sing-box exited unexpectedly ({})", status).red()
        );
        println!("  See log: {}", log_file.display().to_string().dimmed());
    }

    fn on_stopping(&mut self) {
        println!("{}", "Stopping sing-box...".yellow());
    }
}
