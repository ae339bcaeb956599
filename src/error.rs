//! Error taxonomy for provenance reconstruction
//!
//! Protocol desynchronization and malformed trace records are fatal: a desync
//! corrupts every later file attribution for the affected pid. A non-zero exit
//! of the traced command is *not* an error; it travels through the exit-code
//! channel of [`crate::tracer::Provenance`].

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while tracing, parsing or reducing
#[derive(Error, Debug)]
pub enum ProvError {
    #[error("line {line_no}: resumed {syscall}() for pid {pid} has no unfinished start: {line}")]
    Desync {
        line_no: usize,
        pid: String,
        syscall: String,
        line: String,
    },

    #[error("line {line_no}: unparseable trace record ({reason}): {line}")]
    Malformed {
        line_no: usize,
        reason: String,
        line: String,
    },

    #[error("line {line_no}: root pid already resolved to {known}, found second root {found}: {line}")]
    SecondRoot {
        line_no: usize,
        known: u32,
        found: u32,
        line: String,
    },

    #[error("process {pid} names parent {parent} which is not in the process map")]
    DanglingParent { pid: String, parent: String },

    #[error("process {pid} is part of a started_by cycle")]
    CyclicAncestry { pid: String },

    #[error("tracer '{program}' could not be started: {source}")]
    TracerUnavailable {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("tracer terminated by signal {signal}")]
    TracerSignaled { signal: String },

    #[error("tracer wrote no trace records (exit status {code})")]
    EmptyTrace { code: i32 },

    #[error("Command array is empty")]
    EmptyCommand,

    #[error("invalid argv pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to read configuration {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration TOML: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ProvError>;
