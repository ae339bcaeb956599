//! Syscall selection and argv predicates
//!
//! [`SyscallFilter`] decides which syscalls the tracer is asked to report and
//! renders the `-e trace=` expression. [`ArgvPredicate`] decides which
//! processes survive tree reduction.
//!
//! Supported trace specs:
//! - Individual syscalls: `trace=open,openat,execve`
//! - Classes: `trace=process`, `trace=file`, `trace=provenance`

use crate::error::{ProvError, Result};
use crate::syscalls::Syscall;
use regex::Regex;
use std::collections::BTreeSet;

/// Syscall filter that determines which syscalls to trace
#[derive(Debug, Clone)]
pub struct SyscallFilter {
    include: BTreeSet<String>,
}

impl SyscallFilter {
    /// Every syscall the parser turns into provenance
    pub fn provenance() -> Self {
        Self {
            include: Syscall::HANDLED
                .iter()
                .map(|s| s.name().to_string())
                .collect(),
        }
    }

    /// Parse a filter expression like "trace=execve,clone,open" or "trace=file"
    pub fn from_expr(expr: &str) -> Result<Self> {
        match expr.strip_prefix("trace=") {
            Some(spec) => Self::from_trace_spec(spec),
            None => Err(ProvError::Config(format!(
                "Invalid filter expression: {}. Expected format: trace=SPEC",
                expr
            ))),
        }
    }

    fn from_trace_spec(spec: &str) -> Result<Self> {
        let mut include = BTreeSet::new();

        for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let class: Vec<Syscall> = match part {
                "process" => Syscall::HANDLED
                    .into_iter()
                    .filter(|s| s.is_spawn() || s.is_exec())
                    .collect(),
                "file" => Syscall::HANDLED
                    .into_iter()
                    .filter(Syscall::is_file)
                    .collect(),
                "provenance" => Syscall::HANDLED.to_vec(),
                _ => {
                    if !part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                        return Err(ProvError::Config(format!(
                            "Invalid syscall name in trace spec: {}",
                            part
                        )));
                    }
                    include.insert(part.to_string());
                    continue;
                }
            };
            include.extend(class.iter().map(|s| s.name().to_string()));
        }

        Ok(Self { include })
    }

    /// Check if a syscall should be traced
    pub fn should_trace(&self, syscall_name: &str) -> bool {
        self.include.contains(syscall_name)
    }

    /// Handled syscalls that this filter leaves out
    pub fn missing_handled(&self) -> Vec<&'static str> {
        Syscall::HANDLED
            .iter()
            .map(Syscall::name)
            .filter(|name| !self.should_trace(name))
            .collect()
    }

    /// Render as the tracer's `-e` argument
    pub fn to_expr(&self) -> String {
        let names: Vec<&str> = self.include.iter().map(String::as_str).collect();
        format!("trace={}", names.join(","))
    }
}

impl Default for SyscallFilter {
    fn default() -> Self {
        Self::provenance()
    }
}

/// Decides whether a process is interesting enough to keep after reduction
///
/// Receives the first element of the process's argument vector.
pub trait ArgvPredicate {
    fn matches(&self, argv0: &str) -> bool;
}

impl<F> ArgvPredicate for F
where
    F: Fn(&str) -> bool,
{
    fn matches(&self, argv0: &str) -> bool {
        self(argv0)
    }
}

/// Regex-backed [`ArgvPredicate`]
///
/// The pattern is searched anywhere in `argv[0]`; anchor it with `^`/`$` for
/// exact matches. An excluding matcher keeps every process the pattern does
/// *not* match.
#[derive(Debug, Clone)]
pub struct ArgvMatcher {
    pattern: Regex,
    exclude: bool,
}

impl ArgvMatcher {
    /// Matcher that keeps every process
    pub fn all() -> Self {
        Self {
            pattern: Regex::new(".*").expect("static pattern is valid"),
            exclude: false,
        }
    }

    pub fn including(pattern: &str) -> Result<Self> {
        Ok(Self {
            pattern: compile(pattern)?,
            exclude: false,
        })
    }

    pub fn excluding(pattern: &str) -> Result<Self> {
        Ok(Self {
            pattern: compile(pattern)?,
            exclude: true,
        })
    }

    /// Parse `PATTERN` or `!PATTERN` (exclusion)
    pub fn from_expr(expr: &str) -> Result<Self> {
        match expr.strip_prefix('!') {
            Some(pattern) => Self::excluding(pattern),
            None => Self::including(expr),
        }
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn is_exclusion(&self) -> bool {
        self.exclude
    }
}

impl Default for ArgvMatcher {
    fn default() -> Self {
        Self::all()
    }
}

impl ArgvPredicate for ArgvMatcher {
    fn matches(&self, argv0: &str) -> bool {
        self.pattern.is_match(argv0) != self.exclude
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|source| ProvError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}
