//! Configuration schema definitions for labrun.
//!
//! This module defines the configuration types deserialized from TOML. The
//! schema has two sections: how jobs are built and watched (`[runner]`) and
//! how the `bkr` tool is invoked (`[bkr]`).
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── RunnerConfig   - Job templates, blacklist, polling and retry policy
//! └── BkrConfig      - External tool command and query retries
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration structure.
///
/// # TOML Structure
///
/// ```toml
/// [runner]
/// jobtemplate = "~/beaker/job.xml"
/// soak_jobtemplate = "~/beaker/soak.xml"
/// blacklist = "/etc/labrun/blacklist"
/// watchdelay_secs = 60
/// max_aborted = 3
///
/// [bkr]
/// command = "bkr"
/// ```
///
/// # Example
///
/// ```
/// use labrun::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [runner]
///     jobtemplate = "job.xml"
/// "#).unwrap();
/// assert_eq!(config.runner.max_aborted, 3);
/// assert_eq!(config.bkr.command, "bkr");
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Job construction and watching.
    pub runner: RunnerConfig,

    /// External tool settings (optional, has defaults).
    #[serde(default)]
    pub bkr: BkrConfig,
}

/// Job construction and watch-loop settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `soak_jobtemplate` | None |
/// | `jobowner` | None (submitting user) |
/// | `blacklist` | None (empty blacklist) |
/// | `watchdelay_secs` | 60 |
/// | `max_aborted` | 3 |
/// | `samehost` | false |
/// | `soak` | true |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunnerConfig {
    /// Path to the Beaker job template. `~` is expanded.
    pub jobtemplate: PathBuf,

    /// Optional template for soak-only tests. Recipe sets of this job are
    /// tracked but never affect the verdict.
    pub soak_jobtemplate: Option<PathBuf>,

    /// Beaker user to submit jobs on behalf of.
    pub jobowner: Option<String>,

    /// File with hosts to exclude, one hostname per line.
    pub blacklist: Option<PathBuf>,

    /// Delay between two polls of outstanding recipe sets.
    ///
    /// Default: 60
    #[serde(default = "default_watchdelay")]
    pub watchdelay_secs: u64,

    /// Number of aborted or cancelled recipe sets tolerated per run.
    ///
    /// Default: 3
    #[serde(default = "default_max_aborted")]
    pub max_aborted: u32,

    /// Retry failed recipe sets on the host they failed on instead of
    /// excluding it.
    ///
    /// Default: false
    #[serde(default)]
    pub samehost: bool,

    /// Submit the soak job when `soak_jobtemplate` is set.
    ///
    /// Default: true
    #[serde(default = "default_true")]
    pub soak: bool,
}

impl RunnerConfig {
    /// Creates a configuration with defaults for everything but the template.
    pub fn new(jobtemplate: impl Into<PathBuf>) -> Self {
        Self {
            jobtemplate: jobtemplate.into(),
            soak_jobtemplate: None,
            jobowner: None,
            blacklist: None,
            watchdelay_secs: default_watchdelay(),
            max_aborted: default_max_aborted(),
            samehost: false,
            soak: true,
        }
    }

    pub fn watchdelay(&self) -> Duration {
        Duration::from_secs(self.watchdelay_secs)
    }

    /// Job template path with `~` expanded.
    pub fn jobtemplate_path(&self) -> PathBuf {
        expand(&self.jobtemplate)
    }

    /// Soak template path with `~` expanded, if soak testing is enabled.
    pub fn soak_jobtemplate_path(&self) -> Option<PathBuf> {
        self.soak_jobtemplate
            .as_deref()
            .filter(|_| self.soak)
            .map(expand)
    }

    pub fn blacklist_path(&self) -> Option<PathBuf> {
        self.blacklist.as_deref().map(expand)
    }
}

fn expand(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(&raw).into_owned())
}

fn default_watchdelay() -> u64 {
    60
}

fn default_max_aborted() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

/// Settings for the `bkr` command-line tool.
///
/// # Example
///
/// ```toml
/// [bkr]
/// command = "bkr --hub=https://beaker.example.com"
/// retries = 3
/// retry_delay_secs = 3
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BkrConfig {
    /// Base command, split with shell quoting rules.
    ///
    /// Default: `"bkr"`
    #[serde(default = "default_command")]
    pub command: String,

    /// Attempts for a result query that fails at the tool level.
    ///
    /// Default: 3
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Base delay between query attempts; the n-th retry waits n times this.
    ///
    /// Default: 3
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

impl Default for BkrConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            retries: default_retries(),
            retry_delay_secs: default_retry_delay(),
        }
    }
}

fn default_command() -> String {
    "bkr".to_string()
}

fn default_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    3
}
