// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 netstack Contributors

// netstack - Shutdown Signals
// Turns Ctrl+C, SIGTERM and SIGHUP into a cancellation token for running sessions

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Process-wide shutdown state shared by the menu and supervised sessions
#[derive(Debug, Clone)]
pub struct Shutdown {
    token: CancellationToken,
    defer_interrupts: Arc<AtomicBool>,
}

/// While alive, Ctrl+C belongs to the foreground shell instead of netstack
#[derive(Debug)]
pub struct InterruptDeferral {
    flag: Arc<AtomicBool>,
}

impl Drop for InterruptDeferral {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

impl Shutdown {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            defer_interrupts: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create the shutdown state and start listening for signals
    ///
    /// Must be called from within the tokio runtime.
    pub fn install() -> Self {
        let shutdown = Self::new();
        tokio::spawn(wait_for_shutdown(shutdown.clone()));
        shutdown
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Ignore Ctrl+C until the returned guard is dropped
    ///
    /// SIGTERM and SIGHUP still cancel.
    pub fn defer_interrupts(&self) -> InterruptDeferral {
        self.defer_interrupts.store(true, Ordering::SeqCst);
        InterruptDeferral {
            flag: self.defer_interrupts.clone(),
        }
    }

    fn interrupts_deferred(&self) -> bool {
        self.defer_interrupts.load(Ordering::SeqCst)
    }
}

/// Wait for Ctrl+C, SIGTERM or SIGHUP, then cancel the shared token
async fn wait_for_shutdown(shutdown: Shutdown) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sighup) =
            match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
                (Ok(sigterm), Ok(sighup)) => (sigterm, sighup),
                (Err(e), _) | (_, Err(e)) => {
                    warn!("Failed to install signal handlers: {}", e);
                    return;
                }
            };

        loop {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        warn!("Failed to listen for Ctrl+C: {}", e);
                        return;
                    }
                    if shutdown.interrupts_deferred() {
                        debug!("Ctrl+C left to the foreground shell");
                        continue;
                    }
                    info!("Received Ctrl+C, shutting down");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, shutting down");
                    break;
                }
            }
        }
    }

    #[cfg(not(unix))]
    loop {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        if shutdown.interrupts_deferred() {
            debug!("Ctrl+C left to the foreground shell");
            continue;
        }
        info!("Received Ctrl+C, shutting down");
        break;
    }

    shutdown.token.cancel();
}
