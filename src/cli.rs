//! CLI argument parsing for procprov

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Output format for the provenance map
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Indented process tree (default)
    Text,
    /// JSON format for machine parsing
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "procprov")]
#[command(version)]
#[command(
    about = "Reconstruct which processes a command spawns and which files each one reads and writes",
    long_about = None
)]
pub struct Cli {
    /// Parse a trace captured earlier with `strace -f -o FILE` instead of running a command
    #[arg(long = "replay", value_name = "FILE", conflicts_with = "command")]
    pub replay: Option<PathBuf>,

    /// Keep only processes whose argv[0] matches REGEX (prefix with '!' to exclude)
    #[arg(short = 'm', long = "match-argv", value_name = "REGEX")]
    pub match_argv: Option<String>,

    /// Drop processes whose argv[0] matches REGEX
    #[arg(short = 'x', long = "exclude-argv", value_name = "REGEX", conflicts_with = "match_argv")]
    pub exclude_argv: Option<String>,

    /// Syscalls to request from the tracer (e.g., -e trace=process,openat)
    #[arg(short = 'e', long = "expr", value_name = "EXPR")]
    pub filter: Option<String>,

    /// Output format (text or json)
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Replace pids with small sequential integers, root = 0
    #[arg(long = "renumber")]
    pub renumber: bool,

    /// TOML configuration file
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Directory recorded paths are relative to (default: current directory)
    #[arg(long = "cwd", value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    /// Terminate the tracer after SECS seconds and report what was captured
    #[arg(short = 't', long = "timeout", value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Tracer program to run
    #[arg(long = "tracer", value_name = "PROGRAM")]
    pub tracer: Option<String>,

    /// Resolve relative paths against the root directory only, ignoring chdir
    #[arg(long = "no-track-cwd")]
    pub no_track_cwd: bool,

    /// Enable debug logging to stderr
    #[arg(long = "debug")]
    pub debug: bool,

    /// Command to trace (everything after --)
    #[arg(last = true)]
    pub command: Option<Vec<String>>,
}
