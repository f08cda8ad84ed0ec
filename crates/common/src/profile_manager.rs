// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 netstack Contributors

// netstack - Profile Manager Module
// Naming, persistence and enumeration of profile config pairs

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::singbox::ConfigSynthesizer;
use crate::vless::ConnectionParameters;

/// Name used when sanitizing leaves nothing behind
pub const FALLBACK_NAME: &str = "profile";

/// Fresh names tried when another writer takes the probed one first
const CREATE_ATTEMPTS: usize = 8;

/// Which of the two documents of a profile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileMode {
    /// Local SOCKS listener (`{name}-socks.json`)
    LocalForward,
    /// System-wide virtual interface (`{name}-tun.json`)
    SystemTunnel,
}

impl ProfileMode {
    /// Short suffix used in file and log names
    pub fn suffix(self) -> &'static str {
        match self {
            ProfileMode::LocalForward => "socks",
            ProfileMode::SystemTunnel => "tun",
        }
    }

    fn file_suffix(self) -> &'static str {
        match self {
            ProfileMode::LocalForward => "-socks.json",
            ProfileMode::SystemTunnel => "-tun.json",
        }
    }

    /// Log file prefix for an engine run of this mode
    pub fn log_prefix(self, profile_name: &str) -> String {
        format!("{}-{}", profile_name, self.suffix())
    }
}

impl fmt::Display for ProfileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProfileMode::LocalForward => f.write_str("SOCKS"),
            ProfileMode::SystemTunnel => f.write_str("TUN"),
        }
    }
}

/// On-disk locations of a profile's two documents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfilePaths {
    pub local_forward: PathBuf,
    pub system_tunnel: PathBuf,
}

impl ProfilePaths {
    pub fn get(&self, mode: ProfileMode) -> &Path {
        match mode {
            ProfileMode::LocalForward => &self.local_forward,
            ProfileMode::SystemTunnel => &self.system_tunnel,
        }
    }

    fn any_exists(&self) -> bool {
        self.local_forward.exists() || self.system_tunnel.exists()
    }
}

/// A named profile and the parameters it was generated from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub name: String,
    pub params: ConnectionParameters,
}

/// Replace every character outside `[alphanumeric - _]` with '_'
pub fn sanitize_name(raw: &str) -> String {
    let clean: String = raw
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();

    if clean.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        clean
    }
}

/// Profile store backed by a config directory; the files are the source of truth
#[derive(Debug, Clone)]
pub struct ProfileStore {
    config_dir: PathBuf,
    synthesizer: ConfigSynthesizer,
}

impl ProfileStore {
    pub fn new(config_dir: impl Into<PathBuf>, synthesizer: ConfigSynthesizer) -> Self {
        Self {
            config_dir: config_dir.into(),
            synthesizer,
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn synthesizer(&self) -> &ConfigSynthesizer {
        &self.synthesizer
    }

    /// Paths of both documents for `name` (existence is not checked)
    pub fn resolve_profile(&self, name: &str) -> ProfilePaths {
        ProfilePaths {
            local_forward: self
                .config_dir
                .join(format!("{}{}", name, ProfileMode::LocalForward.file_suffix())),
            system_tunnel: self
                .config_dir
                .join(format!("{}{}", name, ProfileMode::SystemTunnel.file_suffix())),
        }
    }

    /// First of `base`, `base-2`, `base-3`, ... with neither document on disk
    pub fn generate_unique_name(&self, base: &str) -> String {
        let base = sanitize_name(base);
        let mut name = base.clone();
        let mut suffix = 1;

        while self.resolve_profile(&name).any_exists() {
            suffix += 1;
            name = format!("{}-{}", base, suffix);
        }

        name
    }

    /// Name, synthesize and persist both documents for `params`
    pub fn create_profile(
        &self,
        params: &ConnectionParameters,
        custom_name: Option<&str>,
    ) -> Result<Profile> {
        let base = match custom_name.map(str::trim) {
            Some(custom) if !custom.is_empty() => custom,
            _ => params.name.as_str(),
        };

        let local_forward = self.synthesizer.local_forward(params).to_json_pretty()?;
        let system_tunnel = self.synthesizer.system_tunnel(params).to_json_pretty()?;

        fs::create_dir_all(&self.config_dir)?;

        let mut attempt = 1;
        loop {
            let name = self.generate_unique_name(base);
            let paths = self.resolve_profile(&name);

            match write_pair([
                (paths.local_forward.as_path(), local_forward.as_str()),
                (paths.system_tunnel.as_path(), system_tunnel.as_str()),
            ]) {
                Ok(()) => {
                    debug!("Created profile '{}' in {}", name, self.config_dir.display());
                    return Ok(Profile {
                        name,
                        params: params.clone(),
                    });
                }
                Err(Error::Io(e))
                    if e.kind() == io::ErrorKind::AlreadyExists && attempt < CREATE_ATTEMPTS =>
                {
                    warn!("Profile name '{}' was taken while writing, retrying", name);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Sorted, de-duplicated names of every profile with at least one document
    pub fn list_profiles(&self) -> Result<Vec<String>> {
        if !self.config_dir.exists() {
            debug!(
                "Config directory does not exist: {}",
                self.config_dir.display()
            );
            return Ok(Vec::new());
        }

        let mut names = BTreeSet::new();

        for entry in fs::read_dir(&self.config_dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                warn!("Skipping non UTF-8 file name: {:?}", entry.path());
                continue;
            };

            let stem = file_name
                .strip_suffix(ProfileMode::LocalForward.file_suffix())
                .or_else(|| file_name.strip_suffix(ProfileMode::SystemTunnel.file_suffix()));

            if let Some(stem) = stem.filter(|stem| !stem.is_empty()) {
                names.insert(stem.to_string());
            }
        }

        Ok(names.into_iter().collect())
    }

    /// Path of one document, failing with `ConfigNotFound` if it is missing
    pub fn config_for(&self, name: &str, mode: ProfileMode) -> Result<PathBuf> {
        let path = self.resolve_profile(name).get(mode).to_path_buf();
        if !path.is_file() {
            return Err(Error::ConfigNotFound {
                profile: name.to_string(),
                path,
            });
        }
        Ok(path)
    }
}

/// Stage every document in a hidden temp file, then link them into place
///
/// Linking fails on an existing target instead of replacing it. On any
/// error the staged files and already published targets are removed.
fn write_pair(documents: [(&Path, &str); 2]) -> Result<()> {
    let mut staged: Vec<PathBuf> = Vec::with_capacity(documents.len());
    let mut published: Vec<&Path> = Vec::with_capacity(documents.len());

    let result = (|| -> io::Result<()> {
        for (target, contents) in documents {
            let staging = staging_path(target);
            fs::write(&staging, contents)?;
            staged.push(staging);
        }
        for (staging, (target, _)) in staged.iter().zip(documents) {
            fs::hard_link(staging, target)?;
            published.push(target);
        }
        Ok(())
    })();

    discard(&staged);
    if let Err(e) = result {
        discard(&published);
        return Err(e.into());
    }
    Ok(())
}

fn staging_path(target: &Path) -> PathBuf {
    let file_name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{}.tmp", file_name))
}

fn discard<P: AsRef<Path>>(paths: &[P]) {
    for path in paths {
        if let Err(e) = fs::remove_file(path) {
            debug!("Could not remove {}: {}", path.as_ref().display(), e);
        }
    }
}
