//! Invocation wrapper around the external syscall tracer
//!
//! Runs a command under `strace -f`, captures the trace into a temporary
//! file, then parses and reduces it. A captured trace can also be replayed
//! from disk without running anything.

use crate::config::TracerConfig;
use crate::error::{ProvError, Result};
use crate::filter::{ArgvPredicate, SyscallFilter};
use crate::parser::{parse_reader, RawTrace};
use crate::process::ProcessMap;
use crate::reduce::reduce;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs::File;
use std::io::BufReader;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{Child, Command, ExitStatus};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Exit code reported when the timeout terminated the trace
pub const TIMEOUT_EXIT_CODE: i32 = 124;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Result of tracing one command
#[derive(Debug, Clone)]
pub struct Provenance {
    /// Reduced process map
    pub processes: ProcessMap,
    /// Exit code of the traced command
    pub exit_code: i32,
    /// The trace was cut short by the timeout
    pub timed_out: bool,
}

/// Trace `command` and reduce the result with `predicate`
///
/// The command runs in the configured root directory. A non-zero exit of the
/// command is reported through [`Provenance::exit_code`], not as an error.
pub fn trace_command<P>(command: &[String], predicate: &P, config: &TracerConfig) -> Result<Provenance>
where
    P: ArgvPredicate + ?Sized,
{
    if command.is_empty() {
        return Err(ProvError::EmptyCommand);
    }

    let root_dir = config.resolve_root_dir()?;
    let filter = config.syscall_filter()?;
    let missing = filter.missing_handled();
    if !missing.is_empty() {
        warn!(?missing, "syscall filter omits calls that carry provenance");
    }

    let capture = tempfile::Builder::new()
        .prefix("procprov-")
        .suffix(".trace")
        .tempfile()?;

    let mut tracer = Command::new(&config.tracer);
    tracer
        .args(tracer_args(config, &filter, capture.path()))
        .arg("--")
        .args(command)
        .current_dir(&root_dir);
    debug!(tracer = %config.tracer, ?command, root = %root_dir.display(), "starting tracer");

    let mut child = tracer.spawn().map_err(|source| ProvError::TracerUnavailable {
        program: config.tracer.clone(),
        source,
    })?;
    let timeout = config.timeout_secs.map(Duration::from_secs);
    let (status, timed_out) = wait_with_timeout(&mut child, timeout)?;

    let raw = parse_reader(BufReader::new(File::open(capture.path())?), &root_dir, config.track_cwd)?;
    let exit_code = if timed_out {
        TIMEOUT_EXIT_CODE
    } else {
        exit_code(status, &raw)?
    };
    if raw.processes.is_empty() && !timed_out {
        return Err(ProvError::EmptyTrace { code: exit_code });
    }

    let processes = reduce(raw, predicate)?;
    info!(processes = processes.len(), exit_code, timed_out, "trace reduced");
    Ok(Provenance {
        processes,
        exit_code,
        timed_out,
    })
}

/// Parse and reduce a trace previously captured with `strace -f -o FILE`
///
/// The exit code comes from the root's `+++ exited with N +++` notice, or 0
/// if the trace does not contain one.
pub fn replay_trace<P>(path: &Path, root_dir: &Path, predicate: &P, track_cwd: bool) -> Result<Provenance>
where
    P: ArgvPredicate + ?Sized,
{
    let file = File::open(path)?;
    let raw = parse_reader(BufReader::new(file), root_dir, track_cwd)?;
    let exit_code = raw.root_exit.unwrap_or(0);
    let processes = reduce(raw, predicate)?;
    debug!(path = %path.display(), processes = processes.len(), "replayed trace");
    Ok(Provenance {
        processes,
        exit_code,
        timed_out: false,
    })
}

/// Arguments placed before `--` on the tracer's command line
pub fn tracer_args(config: &TracerConfig, filter: &SyscallFilter, output: &Path) -> Vec<String> {
    let mut args = vec![
        "-q".to_string(),
        "-f".to_string(),
        "-y".to_string(),
        "-s".to_string(),
        config.string_limit.to_string(),
        "-e".to_string(),
        filter.to_expr(),
        "-o".to_string(),
        output.to_string_lossy().into_owned(),
    ];
    args.extend(config.extra_args.iter().cloned());
    args
}

fn wait_with_timeout(child: &mut Child, timeout: Option<Duration>) -> Result<(ExitStatus, bool)> {
    let Some(timeout) = timeout else {
        return Ok((child.wait()?, false));
    };
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok((status, false));
        }
        if Instant::now() >= deadline {
            warn!(pid = child.id(), ?timeout, "timeout expired, terminating tracer");
            let pid = Pid::from_raw(child.id() as i32);
            if let Err(errno) = kill(pid, Signal::SIGTERM) {
                debug!(%errno, "tracer already gone");
            }
            return Ok((child.wait()?, true));
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Exit code of the traced command
///
/// strace exits with its tracee's status, and re-raises a fatal signal the
/// tracee died from. A signal is only accepted when the trace shows the root
/// was killed by it.
fn exit_code(status: ExitStatus, raw: &RawTrace) -> Result<i32> {
    if let Some(code) = status.code() {
        return Ok(code);
    }
    if let Some(code) = raw.root_exit {
        return Ok(code);
    }
    Err(ProvError::TracerSignaled {
        signal: status
            .signal()
            .and_then(|s| Signal::try_from(s).ok())
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|| "unknown".to_string()),
    })
}
