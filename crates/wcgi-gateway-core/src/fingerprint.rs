//! Cache-busting fingerprints for scripts and sessions.
//!
//! A [`ModuleKey`] captures everything that must match for compiled code to
//! be reused: the script path and its modification time. A [`SessionKey`]
//! additionally captures the sandbox configuration a persistent instance was
//! launched with; two requests share a session only if every field matches.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Identity of a compiled module: script path plus modification time.
///
/// Any modification to the script file changes the key and invalidates the
/// compiled-module entry built from the old one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleKey {
    path: PathBuf,
    modified: SystemTime,
}

impl ModuleKey {
    /// Build a key from a script path and its observed modification time.
    pub fn new(path: impl Into<PathBuf>, modified: SystemTime) -> Self {
        Self {
            path: path.into(),
            modified,
        }
    }

    /// The script path this key was derived from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The modification time this key was derived from.
    pub fn modified(&self) -> SystemTime {
        self.modified
    }

    fn modified_unix(&self) -> u64 {
        self.modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

impl fmt::Display for ModuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file-{}-{}", self.path.display(), self.modified_unix())
    }
}

/// Identity of a tunnel session: module fingerprint plus the sandbox
/// configuration the instance was launched with.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    /// The compiled module the session's instance was built from.
    pub module: ModuleKey,
    /// Whether the instance's error stream is surfaced.
    pub debug: bool,
    /// The directory mounted into the instance, if any.
    pub workdir: Option<PathBuf>,
    /// The network policy rule string the instance was granted.
    pub net_rule: String,
}

impl SessionKey {
    /// Build a session key.
    pub fn new(
        module: ModuleKey,
        debug: bool,
        workdir: Option<PathBuf>,
        net_rule: impl Into<String>,
    ) -> Self {
        Self {
            module,
            debug,
            workdir,
            net_rule: net_rule.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.module,
            self.debug,
            self.workdir
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            self.net_rule
        )
    }
}
