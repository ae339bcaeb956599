//! Tracer configuration
//!
//! Loaded from TOML; every field has a default so a partial file is valid.
//! Command-line flags override whatever the file sets.
//!
//! ```toml
//! tracer = "/usr/bin/strace"
//! string_limit = 4096
//! exclude_argv = "^(grep|sed)$"
//! timeout_secs = 600
//! ```

use crate::error::{ProvError, Result};
use crate::filter::{ArgvMatcher, SyscallFilter};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Settings for one tracing run
///
/// # Example
/// ```
/// use procprov::config::TracerConfig;
///
/// let config = TracerConfig::default();
/// assert_eq!(config.tracer, "strace");
/// assert!(config.track_cwd);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TracerConfig {
    /// Tracer program, looked up on `PATH` unless absolute
    pub tracer: String,

    /// Maximum string length the tracer prints (`-s`)
    ///
    /// Paths longer than this come out truncated and are recorded as such.
    pub string_limit: u32,

    /// Syscall selection expression, `trace=...`
    ///
    /// Default: every syscall the parser understands
    pub syscalls: Option<String>,

    /// Extra arguments passed to the tracer before the command
    pub extra_args: Vec<String>,

    /// Keep processes whose `argv[0]` matches this regex
    pub match_argv: Option<String>,

    /// Drop processes whose `argv[0]` matches this regex
    pub exclude_argv: Option<String>,

    /// Terminate the tracer after this many seconds
    pub timeout_secs: Option<u64>,

    /// Follow `chdir`/`fchdir` when resolving relative paths
    pub track_cwd: bool,

    /// Directory recorded paths are relative to (default: current directory)
    pub root_dir: Option<PathBuf>,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            tracer: "strace".to_string(),
            string_limit: 1024,
            syscalls: None,
            extra_args: Vec::new(),
            match_argv: None,
            exclude_argv: None,
            timeout_secs: None,
            track_cwd: true,
            root_dir: None,
        }
    }
}

impl TracerConfig {
    /// Read and validate a TOML configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ProvError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config: TracerConfig = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.tracer.trim().is_empty() {
            return Err(ProvError::Config("tracer must not be empty".to_string()));
        }

        if self.string_limit < 32 {
            return Err(ProvError::Config(format!(
                "string_limit must be >= 32 to keep paths intact, got {}",
                self.string_limit
            )));
        }

        if self.timeout_secs == Some(0) {
            return Err(ProvError::Config(
                "timeout_secs must be positive".to_string(),
            ));
        }

        if self.match_argv.is_some() && self.exclude_argv.is_some() {
            return Err(ProvError::Config(
                "match_argv and exclude_argv are mutually exclusive".to_string(),
            ));
        }

        if let Some(dir) = &self.root_dir {
            if !dir.is_absolute() {
                return Err(ProvError::Config(format!(
                    "root_dir must be absolute, got {}",
                    dir.display()
                )));
            }
        }

        self.syscall_filter()?;
        self.argv_matcher()?;
        Ok(())
    }

    /// Predicate deciding which processes survive reduction
    pub fn argv_matcher(&self) -> Result<ArgvMatcher> {
        match (&self.match_argv, &self.exclude_argv) {
            (Some(pattern), _) => ArgvMatcher::including(pattern),
            (None, Some(pattern)) => ArgvMatcher::excluding(pattern),
            (None, None) => Ok(ArgvMatcher::all()),
        }
    }

    pub fn syscall_filter(&self) -> Result<SyscallFilter> {
        match &self.syscalls {
            Some(expr) => SyscallFilter::from_expr(expr),
            None => Ok(SyscallFilter::provenance()),
        }
    }

    /// Trace root, falling back to the current directory
    ///
    /// Symlinks are resolved, since the tracer reports canonical paths for
    /// descriptors. A root that does not exist on this machine (a trace
    /// captured elsewhere) is used as given.
    pub fn resolve_root_dir(&self) -> Result<PathBuf> {
        let dir = match &self.root_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        };
        match std::fs::canonicalize(&dir) {
            Ok(real) => Ok(real),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(root = %dir.display(), "trace root does not exist, using it verbatim");
                Ok(dir)
            }
            Err(err) => Err(err.into()),
        }
    }
}
