// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 netstack Contributors

// Privilege probe for system-tunnel mode

/// Check if the current process runs with an effective uid of 0
#[cfg(unix)]
pub fn is_elevated() -> bool {
    // SAFETY: geteuid() has no side effects and always succeeds
    unsafe { libc::geteuid() == 0 }
}

/// Non-Unix platforms have no root user; elevation is never assumed
#[cfg(not(unix))]
pub fn is_elevated() -> bool {
    false
}
