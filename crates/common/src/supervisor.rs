// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 netstack Contributors

// netstack - Process Supervisor
// Owns the single engine child process: launch, log redirection, stop, sessions

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use chrono::Local;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::network::{proxy_env, socks_proxy_url};
use crate::privilege;
use crate::profile_manager::ProfileMode;

/// Grace period between SIGTERM and SIGKILL
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

const QUIT_COMMANDS: [&str; 3] = ["q", "quit", "exit"];

/// The live engine process
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pid: u32,
    log_file: PathBuf,
    config_path: PathBuf,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Log file receiving the engine's stdout and stderr
    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}

/// Callbacks for operator-facing session progress
pub trait SessionObserver {
    /// Called once the engine child has been spawned
    fn on_engine_started(&mut self, _handle: &ProcessHandle) {}

    /// Called right before the proxied shell takes over the terminal
    fn on_shell_ready(&mut self, _proxy_url: &str) {}

    /// Called when the tunnel session starts waiting for operator commands
    fn on_tunnel_ready(&mut self) {}

    /// Called before each operator command is read
    fn on_prompt(&mut self) {}

    /// Called for non-empty input that is not a quit command
    fn on_unknown_command(&mut self, _command: &str) {}

    /// Called when the engine exits without being asked to
    fn on_engine_exited(&mut self, _status: Option<ExitStatus>, _log_file: &Path) {}

    /// Called before the engine is stopped at the end of a session
    fn on_stopping(&mut self) {}
}

/// Observer that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentObserver;

impl SessionObserver for SilentObserver {}

/// Supervises at most one engine process: Idle -> Running -> Idle
#[derive(Debug)]
pub struct ProcessSupervisor {
    engine_bin: PathBuf,
    log_dir: PathBuf,
    shell: String,
    stop_timeout: Duration,
    privilege_check: fn() -> bool,
    current: Option<ProcessHandle>,
}

impl ProcessSupervisor {
    /// Create a supervisor; fails with `EngineLaunch` if the engine binary is missing
    pub fn new(engine_bin: impl Into<PathBuf>, log_dir: impl Into<PathBuf>) -> Result<Self> {
        let engine_bin = engine_bin.into();
        if !engine_bin.is_file() {
            return Err(Error::EngineLaunch(format!(
                "engine binary not found: {}",
                engine_bin.display()
            )));
        }

        Ok(Self {
            engine_bin,
            log_dir: log_dir.into(),
            shell: "bash".to_string(),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            privilege_check: privilege::is_elevated,
            current: None,
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Ok(
            Self::new(&settings.paths.engine_bin, &settings.paths.log_dir)?
                .with_shell(settings.session.shell.clone())
                .with_stop_timeout(settings.session.stop_timeout()),
        )
    }

    /// Shell command line used for local-forward sessions
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Replace the elevation check used by system-tunnel sessions
    pub fn with_privilege_check(mut self, check: fn() -> bool) -> Self {
        self.privilege_check = check;
        self
    }

    pub fn engine_bin(&self) -> &Path {
        &self.engine_bin
    }

    pub fn current(&self) -> Option<&ProcessHandle> {
        self.current.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.current.is_some()
    }

    /// Start the engine against `config_path`, logging to `{prefix}-{timestamp}.log`
    ///
    /// A run that lands on an existing log name gets a `-2`, `-3`, ... suffix.
    pub fn launch(&mut self, config_path: &Path, log_prefix: &str) -> Result<&ProcessHandle> {
        if let Some(current) = self.current.as_mut() {
            let pid = current.pid;
            match current.child.try_wait() {
                Ok(Some(status)) => debug!("Previous engine (PID {}) already exited: {}", pid, status),
                _ => return Err(Error::AlreadyRunning { pid }),
            }
            self.current = None;
        }

        fs::create_dir_all(&self.log_dir)?;
        let stem = format!("{}-{}", log_prefix, Local::now().format("%Y%m%d-%H%M%S"));
        let (log_file, stdout) = create_log_file(&self.log_dir, &stem)?;
        let stderr = stdout.try_clone()?;

        let child = Command::new(&self.engine_bin)
            .arg("run")
            .arg("-c")
            .arg(config_path)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::EngineLaunch(format!(
                    "failed to start {}: {}",
                    self.engine_bin.display(),
                    e
                ))
            })?;

        let pid = child.id().unwrap_or_default();
        info!(
            "Started engine (PID {}) with {}, logging to {}",
            pid,
            config_path.display(),
            log_file.display()
        );

        Ok(&*self.current.insert(ProcessHandle {
            child,
            pid,
            log_file,
            config_path: config_path.to_path_buf(),
        }))
    }

    /// Terminate the engine if one is running; never fails
    ///
    /// Sends SIGTERM, waits up to the stop timeout, then kills. The slot is
    /// always cleared afterwards.
    pub async fn stop(&mut self) {
        let Some(mut handle) = self.current.take() else {
            return;
        };

        info!("Stopping engine (PID {})", handle.pid);
        terminate(&mut handle.child);

        match tokio::time::timeout(self.stop_timeout, handle.child.wait()).await {
            Ok(Ok(status)) => debug!("Engine (PID {}) exited: {}", handle.pid, status),
            Ok(Err(e)) => {
                warn!("Failed to wait for engine (PID {}): {}", handle.pid, e);
                force_stop(&mut handle, self.stop_timeout).await;
            }
            Err(_) => {
                warn!(
                    "Engine (PID {}) still running after {:?}, killing it",
                    handle.pid, self.stop_timeout
                );
                force_stop(&mut handle, self.stop_timeout).await;
            }
        }
    }

    /// Run the engine in local-forward mode and hand the terminal to a proxied shell
    ///
    /// Blocks until the shell exits (or `shutdown` fires), then stops the engine.
    pub async fn run_local_forward_session(
        &mut self,
        config_path: &Path,
        profile_name: &str,
        listen_host: &str,
        listen_port: u16,
        shutdown: &CancellationToken,
        observer: &mut dyn SessionObserver,
    ) -> Result<()> {
        let handle = self.launch(
            config_path,
            &ProfileMode::LocalForward.log_prefix(profile_name),
        )?;
        observer.on_engine_started(handle);

        let result = self
            .run_proxied_shell(listen_host, listen_port, shutdown, observer)
            .await;

        observer.on_stopping();
        self.stop().await;
        result
    }

    async fn run_proxied_shell(
        &self,
        listen_host: &str,
        listen_port: u16,
        shutdown: &CancellationToken,
        observer: &mut dyn SessionObserver,
    ) -> Result<()> {
        let mut words = self.shell.split_whitespace();
        let program = words
            .next()
            .ok_or_else(|| Error::Shell("no shell configured".to_string()))?;

        let mut command = Command::new(program);
        command
            .args(words)
            .envs(proxy_env(listen_host, listen_port))
            .kill_on_drop(true);

        observer.on_shell_ready(&socks_proxy_url(listen_host, listen_port));

        let mut shell = command
            .spawn()
            .map_err(|e| Error::Shell(format!("failed to start '{}': {}", program, e)))?;

        tokio::select! {
            status = shell.wait() => {
                let status = status?;
                debug!("Proxied shell exited: {}", status);
                Ok(())
            }
            _ = shutdown.cancelled() => {
                warn!("Session cancelled, closing proxied shell");
                let _ = shell.kill().await;
                Err(Error::Interrupted)
            }
        }
    }

    /// Run the engine in system-tunnel mode until the operator quits
    ///
    /// Requires an elevated process; without it nothing is started. Takes
    /// operator lines from `input` until `q`, `quit`, `exit` or until every
    /// sender is gone.
    pub async fn run_system_tunnel_session(
        &mut self,
        config_path: &Path,
        profile_name: &str,
        input: &mut mpsc::Receiver<String>,
        shutdown: &CancellationToken,
        observer: &mut dyn SessionObserver,
    ) -> Result<()> {
        if !(self.privilege_check)() {
            return Err(Error::InsufficientPrivilege(
                "system tunnel mode requires root, run with sudo".to_string(),
            ));
        }

        let handle = self.launch(
            config_path,
            &ProfileMode::SystemTunnel.log_prefix(profile_name),
        )?;
        observer.on_engine_started(handle);
        observer.on_tunnel_ready();

        let result = self.wait_for_quit(input, shutdown, observer).await;

        observer.on_stopping();
        self.stop().await;
        result
    }

    async fn wait_for_quit(
        &mut self,
        input: &mut mpsc::Receiver<String>,
        shutdown: &CancellationToken,
        observer: &mut dyn SessionObserver,
    ) -> Result<()> {
        loop {
            observer.on_prompt();

            tokio::select! {
                line = input.recv() => match line {
                    Some(line) if is_quit_command(&line) => return Ok(()),
                    Some(line) => {
                        let command = line.trim();
                        if !command.is_empty() {
                            observer.on_unknown_command(command);
                        }
                    }
                    None => {
                        debug!("Operator input closed, ending session");
                        return Ok(());
                    }
                },
                (status, log_file) = wait_for_exit(&mut self.current) => {
                    warn!("Engine exited on its own: {:?}", status);
                    observer.on_engine_exited(status, &log_file);
                    return Ok(());
                }
                _ = shutdown.cancelled() => return Err(Error::Interrupted),
            }
        }
    }
}

/// Open `{stem}.log`, or the first free `{stem}-N.log`, without reusing a file
fn create_log_file(log_dir: &Path, stem: &str) -> Result<(PathBuf, File)> {
    let mut suffix = 1;
    loop {
        let name = if suffix == 1 {
            format!("{}.log", stem)
        } else {
            format!("{}-{}.log", stem, suffix)
        };
        let path = log_dir.join(name);

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => suffix += 1,
            Err(e) => return Err(e.into()),
        }
    }
}

/// SIGKILL the engine and reap it, waiting at most `timeout`
async fn force_stop(handle: &mut ProcessHandle, timeout: Duration) {
    if let Err(e) = handle.child.start_kill() {
        debug!("Kill of PID {} failed: {}", handle.pid, e);
    }
    match tokio::time::timeout(timeout, handle.child.wait()).await {
        Ok(Ok(status)) => debug!("Engine (PID {}) killed: {}", handle.pid, status),
        Ok(Err(e)) => warn!("Failed to reap engine (PID {}): {}", handle.pid, e),
        Err(_) => warn!("Engine (PID {}) was not reaped after kill", handle.pid),
    }
}

fn is_quit_command(line: &str) -> bool {
    let command = line.trim().to_ascii_lowercase();
    QUIT_COMMANDS.contains(&command.as_str())
}

/// Resolves when the engine in `slot` exits; pending forever when idle
async fn wait_for_exit(slot: &mut Option<ProcessHandle>) -> (Option<ExitStatus>, PathBuf) {
    match slot {
        Some(handle) => {
            let status = handle.child.wait().await.ok();
            (status, handle.log_file.clone())
        }
        None => std::future::pending().await,
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    match child.id() {
        Some(pid) => {
            // SAFETY: kill() only delivers a signal to the given pid
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                debug!(
                    "SIGTERM to PID {} failed: {}",
                    pid,
                    std::io::Error::last_os_error()
                );
            }
        }
        None => debug!("Engine already reaped, nothing to signal"),
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!("Failed to terminate engine: {}", e);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::{Mutex, MutexGuard};
    use std::time::Instant;
    use tempfile::TempDir;

    // Writing a script while another test forks can make exec fail with ETXTBSY
    static SPAWN_LOCK: Mutex<()> = Mutex::new(());

    fn spawn_lock() -> MutexGuard<'static, ()> {
        SPAWN_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn supervisor_with(dir: &TempDir, engine_body: &str) -> ProcessSupervisor {
        let engine = write_script(dir.path(), "engine", engine_body);
        ProcessSupervisor::new(engine, dir.path().join("logs")).unwrap()
    }

    /// Queued operator lines; input ends once they are consumed
    fn operator_lines(lines: &[&str]) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(lines.len().max(1));
        for line in lines {
            tx.try_send(line.to_string()).unwrap();
        }
        rx
    }

    async fn wait_for_log(path: &Path, needle: &str) -> String {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let contents = fs::read_to_string(path).unwrap_or_default();
            if contents.contains(needle) || Instant::now() > deadline {
                return contents;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[derive(Default)]
    struct Recorder {
        started: Vec<u32>,
        unknown: Vec<String>,
        exited: Option<Option<ExitStatus>>,
        shell_proxy: Option<String>,
        stopping: bool,
    }

    impl SessionObserver for Recorder {
        fn on_engine_started(&mut self, handle: &ProcessHandle) {
            self.started.push(handle.pid());
        }

        fn on_shell_ready(&mut self, proxy_url: &str) {
            self.shell_proxy = Some(proxy_url.to_string());
        }

        fn on_unknown_command(&mut self, command: &str) {
            self.unknown.push(command.to_string());
        }

        fn on_engine_exited(&mut self, status: Option<ExitStatus>, _log_file: &Path) {
            self.exited = Some(status);
        }

        fn on_stopping(&mut self) {
            self.stopping = true;
        }
    }

    #[test]
    fn test_missing_engine_binary() {
        let dir = TempDir::new().unwrap();
        let result = ProcessSupervisor::new(dir.path().join("sing-box"), dir.path().join("logs"));

        assert!(matches!(result, Err(Error::EngineLaunch(_))));
        assert!(!dir.path().join("logs").exists());
    }

    #[test]
    fn test_quit_commands() {
        assert!(is_quit_command("q"));
        assert!(is_quit_command("  QUIT \r"));
        assert!(is_quit_command("exit"));
        assert!(!is_quit_command("quit now"));
        assert!(!is_quit_command(""));
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_noop() {
        let dir = TempDir::new().unwrap();
        let engine = dir.path().join("engine");
        fs::write(&engine, "").unwrap();

        let mut supervisor = ProcessSupervisor::new(engine, dir.path().join("logs")).unwrap();
        supervisor.stop().await;
        supervisor.stop().await;
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_launch_logs_and_stop() {
        let _guard = spawn_lock();
        let dir = TempDir::new().unwrap();
        let mut supervisor = supervisor_with(&dir, "echo \"engine $*\"\necho oops >&2\nexec sleep 30");
        let config = dir.path().join("foo-socks.json");

        let handle = supervisor.launch(&config, "foo-socks").unwrap();
        let log_file = handle.log_file().to_path_buf();
        assert!(handle.pid() > 0);
        assert_eq!(handle.config_path(), config.as_path());

        let name = log_file.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("foo-socks-"));
        assert!(name.ends_with(".log"));
        // foo-socks-YYYYMMDD-HHMMSS.log
        assert_eq!(name.len(), "foo-socks-".len() + 15 + ".log".len());

        let contents = wait_for_log(&log_file, "oops").await;
        assert!(contents.contains(&format!("engine run -c {}", config.display())));
        assert!(contents.contains("oops"));

        supervisor.stop().await;
        assert!(!supervisor.is_running());
    }

    #[test]
    fn test_log_file_names_are_never_reused() {
        let dir = TempDir::new().unwrap();
        let stem = "foo-socks-20250101-120000";

        let (first, mut file) = create_log_file(dir.path(), stem).unwrap();
        std::io::Write::write_all(&mut file, b"first run\n").unwrap();
        let (second, _) = create_log_file(dir.path(), stem).unwrap();
        let (third, _) = create_log_file(dir.path(), stem).unwrap();

        assert_eq!(first, dir.path().join("foo-socks-20250101-120000.log"));
        assert_eq!(second, dir.path().join("foo-socks-20250101-120000-2.log"));
        assert_eq!(third, dir.path().join("foo-socks-20250101-120000-3.log"));
        assert_eq!(fs::read_to_string(&first).unwrap(), "first run\n");
    }

    #[tokio::test]
    async fn test_second_launch_is_rejected() {
        let _guard = spawn_lock();
        let dir = TempDir::new().unwrap();
        let mut supervisor = supervisor_with(&dir, "exec sleep 30");
        let config = dir.path().join("foo-tun.json");

        let pid = supervisor.launch(&config, "foo-tun").unwrap().pid();
        match supervisor.launch(&config, "foo-tun") {
            Err(Error::AlreadyRunning { pid: running }) => assert_eq!(running, pid),
            other => panic!("expected AlreadyRunning, got {:?}", other.map(|h| h.pid())),
        }
        assert_eq!(supervisor.current().map(|h| h.pid()), Some(pid));

        supervisor.stop().await;
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_exited_engine_does_not_block_launch() {
        let _guard = spawn_lock();
        let dir = TempDir::new().unwrap();
        let mut supervisor = supervisor_with(&dir, "exit 0");
        let config = dir.path().join("foo-socks.json");

        let first_log = supervisor
            .launch(&config, "foo-socks")
            .unwrap()
            .log_file()
            .to_path_buf();

        let mut relaunched = false;
        for _ in 0..50 {
            match supervisor.launch(&config, "foo-socks") {
                Ok(handle) => {
                    assert_ne!(handle.log_file(), first_log.as_path());
                    relaunched = true;
                    break;
                }
                Err(Error::AlreadyRunning { .. }) => {
                    tokio::time::sleep(Duration::from_millis(100)).await
                }
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert!(relaunched);
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_stop_escalates_to_kill() {
        let _guard = spawn_lock();
        let dir = TempDir::new().unwrap();
        let mut supervisor = supervisor_with(&dir, "trap '' TERM\necho ready\nexec sleep 30")
            .with_stop_timeout(Duration::from_millis(300));
        let config = dir.path().join("foo-socks.json");

        let log_file = supervisor
            .launch(&config, "foo-socks")
            .unwrap()
            .log_file()
            .to_path_buf();
        wait_for_log(&log_file, "ready").await;

        let pid = supervisor.current().map(|h| h.pid()).unwrap();

        let started = Instant::now();
        supervisor.stop().await;
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(!supervisor.is_running());

        // Reaped, not left as a zombie: the pid no longer exists
        let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
        assert_eq!(rc, -1);
        assert_eq!(
            std::io::Error::last_os_error().raw_os_error(),
            Some(libc::ESRCH)
        );
    }

    #[tokio::test]
    async fn test_tunnel_requires_privilege() {
        let dir = TempDir::new().unwrap();
        let mut supervisor = supervisor_with(&dir, "exec sleep 30").with_privilege_check(|| false);
        let mut recorder = Recorder::default();

        let result = supervisor
            .run_system_tunnel_session(
                &dir.path().join("foo-tun.json"),
                "foo",
                &mut operator_lines(&["q"]),
                &CancellationToken::new(),
                &mut recorder,
            )
            .await;

        assert!(matches!(result, Err(Error::InsufficientPrivilege(_))));
        assert!(recorder.started.is_empty());
        assert!(!supervisor.is_running());
        assert!(!dir.path().join("logs").exists());
    }

    #[tokio::test]
    async fn test_tunnel_session_until_quit() {
        let _guard = spawn_lock();
        let dir = TempDir::new().unwrap();
        let mut supervisor = supervisor_with(&dir, "exec sleep 30").with_privilege_check(|| true);
        let mut recorder = Recorder::default();

        supervisor
            .run_system_tunnel_session(
                &dir.path().join("foo-tun.json"),
                "foo",
                &mut operator_lines(&["status", "", "  Q  ", "never read"]),
                &CancellationToken::new(),
                &mut recorder,
            )
            .await
            .unwrap();

        assert_eq!(recorder.started.len(), 1);
        assert_eq!(recorder.unknown, vec!["status".to_string()]);
        assert!(recorder.stopping);
        assert!(!supervisor.is_running());

        let logs: Vec<_> = fs::read_dir(dir.path().join("logs"))
            .unwrap()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].starts_with("foo-tun-"));
    }

    #[tokio::test]
    async fn test_tunnel_session_ends_on_eof() {
        let _guard = spawn_lock();
        let dir = TempDir::new().unwrap();
        let mut supervisor = supervisor_with(&dir, "exec sleep 30").with_privilege_check(|| true);

        supervisor
            .run_system_tunnel_session(
                &dir.path().join("foo-tun.json"),
                "foo",
                &mut operator_lines(&[]),
                &CancellationToken::new(),
                &mut SilentObserver,
            )
            .await
            .unwrap();

        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_tunnel_session_interrupted() {
        let _guard = spawn_lock();
        let dir = TempDir::new().unwrap();
        let mut supervisor = supervisor_with(&dir, "exec sleep 30").with_privilege_check(|| true);
        let (_operator, mut input) = mpsc::channel(1);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let result = supervisor
            .run_system_tunnel_session(
                &dir.path().join("foo-tun.json"),
                "foo",
                &mut input,
                &shutdown,
                &mut SilentObserver,
            )
            .await;

        assert!(matches!(result, Err(Error::Interrupted)));
        assert!(!supervisor.is_running());
    }

    #[test]
    fn test_cancelled_tunnel_session_lets_runtime_shut_down() {
        let _guard = spawn_lock();
        let dir = TempDir::new().unwrap();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap();
        // Operator input stays open for the whole session
        let (_operator, mut input) = mpsc::channel::<String>(1);

        let (result, running) = runtime.block_on(async {
            let mut supervisor =
                supervisor_with(&dir, "exec sleep 30").with_privilege_check(|| true);
            let shutdown = CancellationToken::new();
            let canceller = shutdown.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                canceller.cancel();
            });

            let result = supervisor
                .run_system_tunnel_session(
                    &dir.path().join("foo-tun.json"),
                    "foo",
                    &mut input,
                    &shutdown,
                    &mut SilentObserver,
                )
                .await;
            (result, supervisor.is_running())
        });

        assert!(matches!(result, Err(Error::Interrupted)));
        assert!(!running);

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            drop(runtime);
            let _ = done_tx.send(());
        });
        assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[tokio::test]
    async fn test_local_forward_session_interrupted_while_shell_runs() {
        let _guard = spawn_lock();
        let dir = TempDir::new().unwrap();
        let shell = write_script(dir.path(), "shell", "exec sleep 30");
        let mut supervisor = supervisor_with(&dir, "exec sleep 30")
            .with_shell(shell.display().to_string());
        let mut recorder = Recorder::default();
        let shutdown = CancellationToken::new();
        let canceller = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let result = supervisor
            .run_local_forward_session(
                &dir.path().join("foo-socks.json"),
                "foo",
                "127.0.0.1",
                1080,
                &shutdown,
                &mut recorder,
            )
            .await;

        assert!(matches!(result, Err(Error::Interrupted)));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(recorder.started.len(), 1);
        assert!(recorder.stopping);
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_tunnel_session_reports_engine_exit() {
        let _guard = spawn_lock();
        let dir = TempDir::new().unwrap();
        let mut supervisor = supervisor_with(&dir, "exit 3").with_privilege_check(|| true);
        let (_operator, mut input) = mpsc::channel(1);
        let mut recorder = Recorder::default();

        supervisor
            .run_system_tunnel_session(
                &dir.path().join("foo-tun.json"),
                "foo",
                &mut input,
                &CancellationToken::new(),
                &mut recorder,
            )
            .await
            .unwrap();

        let status = recorder.exited.expect("engine exit reported");
        assert_eq!(status.and_then(|s| s.code()), Some(3));
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_local_forward_session_sets_proxy_env() {
        let _guard = spawn_lock();
        let dir = TempDir::new().unwrap();
        let captured = dir.path().join("env.txt");
        let shell = write_script(
            dir.path(),
            "shell",
            &format!(
                "echo \"$ALL_PROXY $all_proxy $http_proxy $https_proxy\" > '{}'",
                captured.display()
            ),
        );
        let mut supervisor = supervisor_with(&dir, "exec sleep 30")
            .with_shell(shell.display().to_string());
        let mut recorder = Recorder::default();

        supervisor
            .run_local_forward_session(
                &dir.path().join("foo-socks.json"),
                "foo",
                "127.0.0.1",
                1081,
                &CancellationToken::new(),
                &mut recorder,
            )
            .await
            .unwrap();

        let url = "socks5h://127.0.0.1:1081";
        assert_eq!(
            fs::read_to_string(&captured).unwrap().trim(),
            [url, url, url, url].join(" ")
        );
        assert_eq!(recorder.shell_proxy.as_deref(), Some(url));
        assert!(recorder.stopping);
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_local_forward_missing_shell_still_stops_engine() {
        let _guard = spawn_lock();
        let dir = TempDir::new().unwrap();
        let mut supervisor =
            supervisor_with(&dir, "exec sleep 30").with_shell("/nonexistent/netstack-shell");

        let result = supervisor
            .run_local_forward_session(
                &dir.path().join("foo-socks.json"),
                "foo",
                "127.0.0.1",
                1080,
                &CancellationToken::new(),
                &mut SilentObserver,
            )
            .await;

        assert!(matches!(result, Err(Error::Shell(_))));
        assert!(!supervisor.is_running());
    }
}
