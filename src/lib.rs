//! procprov - process provenance from multi-process syscall traces
//!
//! Runs a command under `strace -f`, reconstructs the tree of processes it
//! spawned together with the files each one read, wrote and deleted, and
//! reduces that tree to the processes a caller cares about.
//!
//! ```
//! use procprov::filter::ArgvMatcher;
//! use procprov::parser::TraceParser;
//! use procprov::reduce::reduce;
//!
//! let mut parser = TraceParser::new("/work");
//! parser.feed_line(r#"execve("/bin/sh", ["sh", "-c", "cat a > b"], 0x1) = 0"#).unwrap();
//! parser.feed_line(r#"open("a", O_RDONLY) = 3"#).unwrap();
//! parser.feed_line(r#"open("b", O_WRONLY|O_CREAT) = 4"#).unwrap();
//!
//! let reduced = reduce(parser.finish(), &ArgvMatcher::all()).unwrap();
//! let root = reduced.roots().next().unwrap();
//! assert!(root.uses.contains("a"));
//! assert!(root.generates.contains("b"));
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod filter;
pub mod json_output;
pub mod parser;
pub mod process;
pub mod reduce;
pub mod syscalls;
pub mod text_output;
pub mod tracer;

pub use error::{ProvError, Result};
pub use filter::{ArgvMatcher, ArgvPredicate};
pub use process::{ProcessId, ProcessKey, ProcessMap, ProcessRecord};
pub use tracer::{replay_trace, trace_command, Provenance};
