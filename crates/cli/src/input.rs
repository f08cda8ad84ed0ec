// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 netstack Contributors

// netstack - Operator Input
// Reads terminal lines on a plain thread and hands them to the async session

use std::io::{BufRead, BufReader, Read};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

/// How often the reader checks whether the session still wants input
const POLL_INTERVAL: Duration = Duration::from_millis(100);

const LINE_BUFFER: usize = 16;

/// Lines typed on stdin, until the receiver is dropped
///
/// The reader thread only reads when a line is ready, so dropping the
/// receiver leaves no read pending on the terminal.
pub fn stdin_lines() -> mpsc::Receiver<String> {
    let (lines, _reader) = spawn_line_reader(std::io::stdin());
    lines
}

/// Forward lines from `source` over a channel from a dedicated thread
///
/// The thread ends at end of input, on a read error, or within one poll
/// interval of the receiver being dropped.
pub fn spawn_line_reader<R>(source: R) -> (mpsc::Receiver<String>, JoinHandle<()>)
where
    R: Read + LineSource + Send + 'static,
{
    let (tx, rx) = mpsc::channel(LINE_BUFFER);
    let reader = thread::spawn(move || forward_lines(source, tx));
    (rx, reader)
}

fn forward_lines<R: Read + LineSource>(source: R, tx: mpsc::Sender<String>) {
    let ready = source.readiness();
    let mut reader = BufReader::new(source);
    let mut line = String::new();

    while !tx.is_closed() {
        if reader.buffer().is_empty() {
            match ready.wait(POLL_INTERVAL) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    debug!("Polling operator input failed: {}", e);
                    break;
                }
            }
        }

        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {
                let text = line.trim_end_matches(&['\r', '\n'][..]).to_string();
                if tx.blocking_send(text).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("Reading operator input failed: {}", e);
                break;
            }
        }
    }

    debug!("Operator input reader finished");
}

/// A byte source whose readiness can be waited on with a timeout
pub trait LineSource {
    fn readiness(&self) -> Readiness;
}

/// Waits until a source has data, end of input, or an error to report
pub struct Readiness {
    #[cfg(unix)]
    fd: std::os::unix::io::RawFd,
}

impl Readiness {
    #[cfg(unix)]
    fn wait(&self, timeout: Duration) -> std::io::Result<bool> {
        let mut pollfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);

        // SAFETY: pollfd is a valid, exclusively borrowed array of length 1
        let rc = unsafe { libc::poll(&mut pollfd, 1, millis) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err);
        }
        Ok(rc > 0)
    }

    // Without poll() the read blocks; the thread is detached and ends with the process
    #[cfg(not(unix))]
    fn wait(&self, _timeout: Duration) -> std::io::Result<bool> {
        Ok(true)
    }
}

#[cfg(unix)]
impl<T: std::os::unix::io::AsRawFd> LineSource for T {
    fn readiness(&self) -> Readiness {
        Readiness {
            fd: self.as_raw_fd(),
        }
    }
}

#[cfg(not(unix))]
impl<T> LineSource for T {
    fn readiness(&self) -> Readiness {
        Readiness {}
    }
}
