//! Trace parser for multi-process syscall traces
//!
//! Consumes the line-oriented output of `strace -f` and builds the raw
//! pid-keyed [`ProcessMap`]. Three record shapes are understood:
//!
//! ```text
//! [pid 101] openat(AT_FDCWD, "in.txt", O_RDONLY) = 3          complete
//! [pid 101] read(3, <unfinished ...>                          unfinished
//! [pid 101] <... read resumed>"data", 4096) = 4               resumed
//! ```
//!
//! On stderr the `[pid N]` tag is absent for the tracer's direct child until a
//! second process exists. Written to a file with `-o`, every line instead
//! starts with the bare pid (`101   openat(...)`), so the root's pid is known
//! from the first line. Tracer notices (`+++ exited with 0 +++`, `--- SIGCHLD ---`,
//! `strace: ...`) are recognized and do not change the process map except
//! for recording the root's exit status.

use crate::error::{ProvError, Result};
use crate::process::{ProcessId, ProcessKey, ProcessMap};
use crate::syscalls::{parse_int, OpenMode, Syscall};
use std::collections::{BTreeSet, HashMap};
use std::io::BufRead;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, trace, warn};

const UNFINISHED: &str = "<unfinished ...>";

/// One classified line of tracer output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceLine<'a> {
    /// `name(args) = ret`
    Call { pid: Option<u32>, text: &'a str },
    /// Head of a call interrupted by another process's events
    Unfinished {
        pid: Option<u32>,
        syscall: &'a str,
        head: &'a str,
    },
    /// Tail of a previously interrupted call
    Resumed {
        pid: Option<u32>,
        syscall: &'a str,
        tail: &'a str,
    },
    /// `+++ ... +++`, `--- ... ---` or a message from the tracer itself
    Notice { pid: Option<u32>, text: &'a str },
    Blank,
}

/// Outcome reported after ` = `
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Return {
    Value(i64),
    /// `= ?`, the result never became visible to the tracer
    Unknown,
}

impl Return {
    pub fn is_failure(&self) -> bool {
        matches!(self, Return::Value(v) if *v < 0)
    }
}

/// A complete syscall split into name, top-level arguments and return value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyscallRecord<'a> {
    pub name: &'a str,
    pub args: Vec<&'a str>,
    pub ret: Return,
}

/// Classify one line of tracer output
pub fn parse_line(line: &str) -> std::result::Result<TraceLine<'_>, String> {
    let line = line.trim_end_matches(['\n', '\r']);
    let (pid, body) = split_pid_tag(line)?;
    let body = body.trim_start();

    if body.is_empty() {
        return Ok(TraceLine::Blank);
    }
    if body.starts_with("+++") || body.starts_with("---") || body.starts_with("strace:") {
        return Ok(TraceLine::Notice { pid, text: body });
    }

    if let Some(rest) = body.strip_prefix("<...") {
        let rest = rest.trim_start();
        let (syscall, tail) = rest
            .split_once(" resumed>")
            .ok_or_else(|| "resume marker without 'resumed>'".to_string())?;
        if !is_syscall_name(syscall) {
            return Err(format!("invalid syscall name '{}' in resume", syscall));
        }
        let tail = tail.strip_prefix(' ').unwrap_or(tail);
        return Ok(TraceLine::Resumed { pid, syscall, tail });
    }

    let open = body
        .find('(')
        .ok_or_else(|| "missing '(' after syscall name".to_string())?;
    let syscall = &body[..open];
    if !is_syscall_name(syscall) {
        return Err(format!("invalid syscall name '{}'", syscall));
    }
    if let Some(head) = body.strip_suffix(UNFINISHED) {
        return Ok(TraceLine::Unfinished {
            pid,
            syscall,
            head: head.trim_end(),
        });
    }
    Ok(TraceLine::Call { pid, text: body })
}

fn split_pid_tag(line: &str) -> std::result::Result<(Option<u32>, &str), String> {
    let digits = line.len() - line.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    if digits > 0 && line[digits..].starts_with([' ', '\t']) {
        let pid = line[..digits]
            .parse::<u32>()
            .map_err(|_| format!("invalid pid '{}' in prefix", &line[..digits]))?;
        return Ok((Some(pid), &line[digits..]));
    }
    let Some(rest) = line.strip_prefix("[pid") else {
        return Ok((None, line));
    };
    let (number, body) = rest
        .split_once(']')
        .ok_or_else(|| "unterminated [pid N] tag".to_string())?;
    let pid = number
        .trim()
        .parse::<u32>()
        .map_err(|_| format!("invalid pid '{}' in tag", number.trim()))?;
    Ok((Some(pid), body))
}

fn is_syscall_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Split `name(args) = ret` into its parts
pub fn parse_call(text: &str) -> std::result::Result<SyscallRecord<'_>, String> {
    let open = text
        .find('(')
        .ok_or_else(|| "missing '(' after syscall name".to_string())?;
    let name = &text[..open];
    if !is_syscall_name(name) {
        return Err(format!("invalid syscall name '{}'", name));
    }
    let close = find_closing(text, open)?;
    let args = split_args(&text[open + 1..close])?;
    let rest = text[close + 1..].trim_start();
    let ret_text = rest
        .strip_prefix('=')
        .ok_or_else(|| "missing '= RETVAL' after arguments".to_string())?
        .trim_start();
    let token = ret_text
        .split(|c: char| c.is_whitespace() || c == '<')
        .next()
        .unwrap_or_default();
    let ret = if token == "?" {
        Return::Unknown
    } else {
        Return::Value(parse_int(token).ok_or_else(|| format!("invalid return value '{}'", token))?)
    };
    Ok(SyscallRecord { name, args, ret })
}

/// Byte index of the `)` closing the `(` at `open`
fn find_closing(text: &str, open: usize) -> std::result::Result<usize, String> {
    let mut depth = 0usize;
    let mut in_quote = false;
    let mut escaped = false;
    for (i, c) in text.char_indices().skip_while(|(i, _)| *i < open) {
        if in_quote {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_quote = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_quote = true,
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| format!("unbalanced '{}'", c))?;
                if depth == 0 {
                    return if c == ')' {
                        Ok(i)
                    } else {
                        Err(format!("argument list closed by '{}'", c))
                    };
                }
            }
            _ => {}
        }
    }
    Err("unterminated argument list".to_string())
}

/// Split an argument list at top-level commas
///
/// Quoted strings and bracketed sub-lists (`[...]`, `{...}`, `(...)`) are
/// atomic. Returned arguments are trimmed; an empty list yields no arguments.
pub fn split_args(text: &str) -> std::result::Result<Vec<&str>, String> {
    let mut args = Vec::new();
    let mut depth = 0usize;
    let mut in_quote = false;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        if in_quote {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_quote = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_quote = true,
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| format!("unbalanced '{}' in arguments", c))?;
            }
            ',' if depth == 0 => {
                args.push(text[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    if in_quote || depth != 0 {
        return Err("unterminated quote or bracket in arguments".to_string());
    }
    let last = text[start..].trim();
    if !last.is_empty() || !args.is_empty() {
        args.push(last);
    }
    Ok(args)
}

/// Decode a quoted tracer string, ignoring a trailing truncation marker
///
/// Escapes denote raw bytes, so multi-byte characters printed as octal
/// (`"\303\251"`) come back as UTF-8 (`"é"`).
pub fn unquote(arg: &str) -> Option<String> {
    let mut chars = arg.trim().strip_prefix('"')?.chars();
    let mut out: Vec<u8> = Vec::new();
    let mut utf8 = [0u8; 4];
    while let Some(c) = chars.next() {
        let byte = match c {
            '"' => return Some(String::from_utf8_lossy(&out).into_owned()),
            '\\' => match chars.next()? {
                'n' => b'\n',
                't' => b'\t',
                'r' => b'\r',
                'v' => 0x0b,
                'f' => 0x0c,
                'x' => {
                    let hex: String = chars.by_ref().take(2).collect();
                    u8::from_str_radix(&hex, 16).ok()?
                }
                d @ '0'..='7' => {
                    let mut value = d.to_digit(8)?;
                    for _ in 0..2 {
                        match chars.clone().next().and_then(|n| n.to_digit(8)) {
                            Some(n) => {
                                value = value * 8 + n;
                                chars.next();
                            }
                            None => break,
                        }
                    }
                    u8::try_from(value).ok()?
                }
                other => {
                    out.extend_from_slice(other.encode_utf8(&mut utf8).as_bytes());
                    continue;
                }
            },
            other => {
                out.extend_from_slice(other.encode_utf8(&mut utf8).as_bytes());
                continue;
            }
        };
        out.push(byte);
    }
    None
}

/// Decode a bracketed list of quoted strings, e.g. an `execve` argv
///
/// Elided entries (`...`) are dropped; a non-list argument such as `NULL`
/// yields an empty vector.
pub fn parse_string_list(arg: &str) -> std::result::Result<Vec<String>, String> {
    let Some(inner) = arg
        .trim()
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
    else {
        return Ok(Vec::new());
    };
    split_args(inner)?
        .into_iter()
        .filter(|item| *item != "...")
        .map(|item| unquote(item).ok_or_else(|| format!("unquoted list element '{}'", item)))
        .collect()
}

/// Lexically normalize an absolute path, resolving `.` and `..`
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Directory an `*at` dirfd argument refers to
fn dirfd_base<'p>(dirfd: &str, cwd: &'p Path) -> Option<std::borrow::Cow<'p, Path>> {
    let dirfd = dirfd.trim();
    // Newer tracers decorate it as `AT_FDCWD</cwd>`; the tracked cwd wins.
    if dirfd.starts_with("AT_FDCWD") {
        return Some(std::borrow::Cow::Borrowed(cwd));
    }
    // `-y` decorates descriptors as `3</path/to/dir>`
    let start = dirfd.find('<')?;
    let path = dirfd[start + 1..].strip_suffix('>')?;
    Some(std::borrow::Cow::Owned(PathBuf::from(path)))
}

/// Everything parsed from one trace, before reduction
#[derive(Debug, Clone, Default)]
pub struct RawTrace {
    pub processes: ProcessMap,
    /// Real pid of the root process, if the trace revealed it
    pub root_pid: Option<u32>,
    /// Exit status the tracer reported for the root process
    pub root_exit: Option<i32>,
}

/// Incremental trace parser
///
/// Feed lines in the order the tracer emitted them, then call
/// [`TraceParser::finish`].
#[derive(Debug)]
pub struct TraceParser {
    root_dir: PathBuf,
    track_cwd: bool,
    processes: ProcessMap,
    in_flight: HashMap<(ProcessId, String), String>,
    cwds: HashMap<ProcessKey, PathBuf>,
    root_pid: Option<u32>,
    root_exit: Option<i32>,
    provisional: BTreeSet<u32>,
    line_no: usize,
}

impl TraceParser {
    /// Parser whose recorded paths are relative to `root_dir`
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: normalize(&root_dir.into()),
            track_cwd: true,
            processes: ProcessMap::new(),
            in_flight: HashMap::new(),
            cwds: HashMap::new(),
            root_pid: None,
            root_exit: None,
            provisional: BTreeSet::new(),
            line_no: 0,
        }
    }

    /// Follow `chdir`/`fchdir` when resolving relative paths (default on)
    pub fn track_cwd(mut self, enabled: bool) -> Self {
        self.track_cwd = enabled;
        self
    }

    /// Apply one line of tracer output
    pub fn feed_line(&mut self, line: &str) -> Result<()> {
        self.line_no += 1;
        let line = line.trim_end_matches(['\n', '\r']);
        let parsed = parse_line(line).map_err(|reason| self.malformed(reason, line))?;
        match parsed {
            TraceLine::Blank => Ok(()),
            TraceLine::Notice { pid, text } => {
                self.handle_notice(pid, text);
                Ok(())
            }
            TraceLine::Unfinished { pid, syscall, head } => {
                let id = self.resolve(pid, None, line)?;
                trace!(pid = %id, syscall, "unfinished");
                self.in_flight
                    .insert((id, syscall.to_string()), head.to_string());
                Ok(())
            }
            TraceLine::Resumed { pid, syscall, tail } => {
                let id = self.resolve(pid, Some(syscall), line)?;
                let head = self
                    .in_flight
                    .remove(&(id, syscall.to_string()))
                    .ok_or_else(|| ProvError::Desync {
                        line_no: self.line_no,
                        pid: id.to_string(),
                        syscall: syscall.to_string(),
                        line: line.to_string(),
                    })?;
                let full = format!("{}{}", head, tail);
                self.apply_call(id, &full, line)
            }
            TraceLine::Call { pid, text } => {
                let id = self.resolve(pid, None, line)?;
                self.apply_call(id, text, line)
            }
        }
    }

    /// Finish parsing and hand out the raw process map
    ///
    /// Calls still unfinished are dropped: a trace cut short by the caller
    /// yields whatever was complete.
    pub fn finish(mut self) -> RawTrace {
        if !self.in_flight.is_empty() {
            debug!(
                count = self.in_flight.len(),
                "dropping syscalls that never resumed"
            );
        }
        for pid in std::mem::take(&mut self.provisional) {
            if let Some(record) = self.processes.get_mut(&ProcessKey::pid(pid)) {
                warn!(pid, "no clone created this process, attaching it to the root");
                record.started_by = Some(ProcessKey::ROOT);
            }
        }
        RawTrace {
            processes: self.processes,
            root_pid: self.root_pid,
            root_exit: self.root_exit,
        }
    }

    fn malformed(&self, reason: String, line: &str) -> ProvError {
        ProvError::Malformed {
            line_no: self.line_no,
            reason,
            line: line.trim_end().to_string(),
        }
    }

    /// Map a line's pid tag onto a process id, discovering the root's pid
    fn resolve(&mut self, tag: Option<u32>, resumes: Option<&str>, line: &str) -> Result<ProcessId> {
        let Some(pid) = tag else {
            self.ensure_root();
            return Ok(ProcessId::Unresolved);
        };
        if self.root_pid == Some(pid) {
            return Ok(ProcessId::Unresolved);
        }
        if self.processes.contains(&ProcessKey::pid(pid)) {
            return Ok(ProcessId::Pid(pid));
        }

        // An unknown pid finishing a call the untagged root started is the root.
        // While any clone is in flight an unknown pid may be its child instead.
        let resumes_root = resumes.is_some_and(|syscall| {
            self.in_flight
                .contains_key(&(ProcessId::Unresolved, syscall.to_string()))
        });
        match self.root_pid {
            None if resumes_root || !self.spawn_in_flight() => {
                debug!(pid, "resolved root process pid");
                self.root_pid = Some(pid);
                self.ensure_root();
                Ok(ProcessId::Unresolved)
            }
            Some(known) if resumes_root => Err(ProvError::SecondRoot {
                line_no: self.line_no,
                known,
                found: pid,
                line: line.to_string(),
            }),
            _ => {
                debug!(pid, "process seen before its clone returned");
                self.processes.spawn(ProcessKey::pid(pid), None);
                self.provisional.insert(pid);
                Ok(ProcessId::Pid(pid))
            }
        }
    }

    /// Some process is blocked in a process-creating call
    fn spawn_in_flight(&self) -> bool {
        self.in_flight
            .keys()
            .any(|(_, syscall)| Syscall::from_name(syscall).is_spawn())
    }

    fn ensure_root(&mut self) {
        if !self.processes.contains(&ProcessKey::ROOT) {
            self.processes.spawn(ProcessKey::ROOT, None);
        }
    }

    fn handle_notice(&mut self, tag: Option<u32>, text: &str) {
        let id = match tag {
            None => ProcessId::Unresolved,
            Some(pid) if self.root_pid == Some(pid) => ProcessId::Unresolved,
            Some(pid)
                if self.root_pid.is_none()
                    && !self.processes.contains(&ProcessKey::pid(pid))
                    && !self.spawn_in_flight() =>
            {
                debug!(pid, "resolved root process pid from notice");
                self.root_pid = Some(pid);
                self.ensure_root();
                ProcessId::Unresolved
            }
            Some(pid) => ProcessId::Pid(pid),
        };
        let inner = text.trim_matches(|c| c == '+' || c == ' ');

        if id == ProcessId::Unresolved {
            if let Some(code) = inner.strip_prefix("exited with ") {
                self.root_exit = code.trim().parse().ok();
            } else if let Some(signal) = inner.strip_prefix("killed by ") {
                let name = signal.split_whitespace().next().unwrap_or_default();
                self.root_exit = name
                    .parse::<nix::sys::signal::Signal>()
                    .ok()
                    .map(|sig| 128 + sig as i32);
            }
        }

        // A non-leader thread's execve completes under the leader's pid.
        if let Some(from) = inner
            .strip_prefix("superseded by execve in pid ")
            .and_then(|p| p.trim().parse::<u32>().ok())
        {
            let from = if self.root_pid == Some(from) {
                ProcessId::Unresolved
            } else {
                ProcessId::Pid(from)
            };
            let moved: Vec<String> = self
                .in_flight
                .keys()
                .filter(|(owner, _)| *owner == from)
                .map(|(_, syscall)| syscall.clone())
                .collect();
            for syscall in moved {
                if let Some(head) = self.in_flight.remove(&(from, syscall.clone())) {
                    self.in_flight.insert((id, syscall), head);
                }
            }
        }
        trace!(pid = %id, notice = text, "tracer notice");
    }

    fn apply_call(&mut self, id: ProcessId, text: &str, line: &str) -> Result<()> {
        let name = text.split('(').next().unwrap_or_default();
        let syscall = Syscall::from_name(name);
        if syscall == Syscall::Other {
            return Ok(());
        }
        let call = parse_call(text).map_err(|reason| self.malformed(reason, line))?;
        let ret = match call.ret {
            Return::Value(value) if value >= 0 => value,
            _ => {
                trace!(pid = %id, syscall = call.name, "discarding failed syscall");
                return Ok(());
            }
        };

        let current = ProcessKey::live(id);
        if !self.processes.contains(&current) {
            self.processes.spawn(current, None);
        }
        let line_no = self.line_no;
        let arg = |index: usize| nth_arg(&call, index, line_no, line);

        match syscall {
            Syscall::Clone | Syscall::Clone3 | Syscall::Fork | Syscall::Vfork => {
                let child = u32::try_from(ret).map_err(|_| {
                    self.malformed(format!("child pid {} out of range", ret), line)
                })?;
                self.spawn_child(current, child, line)
            }
            Syscall::Execve | Syscall::Execveat => {
                let offset = usize::from(syscall == Syscall::Execveat);
                let executable = unquote(arg(offset)?)
                    .ok_or_else(|| self.malformed("executable is not a string".into(), line))?;
                let argv = parse_string_list(arg(offset + 1)?)
                    .map_err(|reason| self.malformed(reason, line))?;
                self.exec(current, executable, argv);
                Ok(())
            }
            Syscall::Open | Syscall::Creat => {
                let path = arg(0)?;
                let mode = if syscall == Syscall::Creat {
                    OpenMode::CREAT
                } else {
                    OpenMode::parse(arg(1)?)
                        .ok_or_else(|| self.malformed("unreadable open flags".into(), line))?
                };
                self.record_open(current, "AT_FDCWD", path, mode, line)
            }
            Syscall::Openat => {
                let mode = OpenMode::parse(arg(2)?)
                    .ok_or_else(|| self.malformed("unreadable open flags".into(), line))?;
                self.record_open(current, arg(0)?, arg(1)?, mode, line)
            }
            Syscall::Unlink => self.record_unlink(current, "AT_FDCWD", arg(0)?, line),
            Syscall::Unlinkat => {
                if call.args.get(2).is_some_and(|flags| flags.contains("AT_REMOVEDIR")) {
                    return Ok(());
                }
                self.record_unlink(current, arg(0)?, arg(1)?, line)
            }
            Syscall::Chdir => {
                let path = unquote(arg(0)?)
                    .ok_or_else(|| self.malformed("chdir path is not a string".into(), line))?;
                if self.track_cwd {
                    let cwd = normalize(&self.cwd(&current).join(path));
                    self.cwds.insert(current, cwd);
                }
                Ok(())
            }
            Syscall::Fchdir => {
                if self.track_cwd {
                    match dirfd_base(arg(0)?, Path::new("/")) {
                        Some(dir) => {
                            let dir = normalize(&dir);
                            self.cwds.insert(current, dir);
                        }
                        None => debug!(pid = %id, "fchdir target unknown, keeping cwd"),
                    }
                }
                Ok(())
            }
            Syscall::Other => Ok(()),
        }
    }

    fn spawn_child(&mut self, parent: ProcessKey, child: u32, line: &str) -> Result<()> {
        if self.root_pid == Some(child) {
            return Err(self.malformed(
                format!("process creation returned the root pid {}", child),
                line,
            ));
        }
        let key = ProcessKey::pid(child);
        let parent_cwd = self.cwd(&parent);
        if self.provisional.remove(&child) {
            if let Some(record) = self.processes.get_mut(&key) {
                record.started_by = Some(parent);
            }
            self.cwds.entry(key).or_insert(parent_cwd);
        } else {
            let (_, archived) = self.processes.spawn(key, Some(parent));
            if let Some(archived) = archived {
                debug!(pid = child, archived = %archived, "pid reused, archived previous record");
                if let Some(cwd) = self.cwds.remove(&key) {
                    self.cwds.insert(archived, cwd);
                }
            }
            self.cwds.insert(key, parent_cwd);
        }
        Ok(())
    }

    fn exec(&mut self, current: ProcessKey, executable: String, argv: Vec<String>) {
        let has_argv = self
            .processes
            .get(&current)
            .is_some_and(|record| record.argv.is_some());
        let cwd = self.cwds.get(&current).cloned();
        if has_argv {
            let (_, archived) = self.processes.spawn(current, Some(current));
            debug!(pid = %current, archived = ?archived, "re-exec, archived previous image");
            if let (Some(archived), Some(cwd)) = (archived, cwd) {
                self.cwds.insert(archived, cwd);
            }
        }
        if let Some(record) = self.processes.get_mut(&current) {
            record.executable = Some(executable);
            record.argv = Some(argv);
        }
    }

    fn cwd(&self, key: &ProcessKey) -> PathBuf {
        self.cwds
            .get(key)
            .cloned()
            .unwrap_or_else(|| self.root_dir.clone())
    }

    /// Path relative to the trace root, `None` if it lies outside
    fn relativize(&self, current: &ProcessKey, dirfd: &str, path: &str) -> Option<String> {
        let path = Path::new(path);
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            let cwd = self.cwd(current);
            dirfd_base(dirfd, &cwd)?.join(path)
        };
        let relative = normalize(&absolute)
            .strip_prefix(&self.root_dir)
            .ok()?
            .to_path_buf();
        if relative.as_os_str().is_empty() {
            return None;
        }
        Some(relative.to_string_lossy().into_owned())
    }

    fn record_open(
        &mut self,
        current: ProcessKey,
        dirfd: &str,
        path: &str,
        mode: OpenMode,
        line: &str,
    ) -> Result<()> {
        if mode.directory {
            return Ok(());
        }
        let raw = unquote(path).ok_or_else(|| self.malformed("path is not a string".into(), line))?;
        let Some(relative) = self.relativize(&current, dirfd, &raw) else {
            trace!(path = %raw, "ignoring path outside the trace root");
            return Ok(());
        };
        if let Some(record) = self.processes.get_mut(&current) {
            if mode.write {
                record.generates.insert(relative.clone());
            }
            if mode.read {
                record.uses.insert(relative);
            }
        }
        Ok(())
    }

    fn record_unlink(&mut self, current: ProcessKey, dirfd: &str, path: &str, line: &str) -> Result<()> {
        let raw = unquote(path).ok_or_else(|| self.malformed("path is not a string".into(), line))?;
        if let Some(relative) = self.relativize(&current, dirfd, &raw) {
            if let Some(record) = self.processes.get_mut(&current) {
                record.removes.insert(relative);
            }
        }
        Ok(())
    }
}

fn nth_arg<'a>(call: &SyscallRecord<'a>, index: usize, line_no: usize, line: &str) -> Result<&'a str> {
    call.args
        .get(index)
        .copied()
        .ok_or_else(|| ProvError::Malformed {
            line_no,
            reason: format!("{}() is missing argument {}", call.name, index + 1),
            line: line.to_string(),
        })
}

/// Parse a complete trace read from `reader`
pub fn parse_reader<R: BufRead>(mut reader: R, root_dir: &Path, track_cwd: bool) -> Result<RawTrace> {
    let mut parser = TraceParser::new(root_dir).track_cwd(track_cwd);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        parser.feed_line(&String::from_utf8_lossy(&buf))?;
    }
    Ok(parser.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(lines: &[&str]) -> RawTrace {
        let mut parser = TraceParser::new("/work");
        for line in lines {
            parser.feed_line(line).unwrap();
        }
        parser.finish()
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_classify_complete_call() {
        let line = parse_line("[pid  42] open(\"a\", O_RDONLY) = 3\n").unwrap();
        assert_eq!(
            line,
            TraceLine::Call {
                pid: Some(42),
                text: "open(\"a\", O_RDONLY) = 3"
            }
        );
    }

    #[test]
    fn test_classify_unfinished_and_resumed() {
        assert_eq!(
            parse_line("wait4(-1,  <unfinished ...>").unwrap(),
            TraceLine::Unfinished {
                pid: None,
                syscall: "wait4",
                head: "wait4(-1,"
            }
        );
        assert_eq!(
            parse_line("[pid 7] <... wait4 resumed>[{WIFEXITED(s)}], 0, NULL) = 8").unwrap(),
            TraceLine::Resumed {
                pid: Some(7),
                syscall: "wait4",
                tail: "[{WIFEXITED(s)}], 0, NULL) = 8"
            }
        );
    }

    #[test]
    fn test_classify_notices() {
        assert!(matches!(
            parse_line("+++ exited with 0 +++").unwrap(),
            TraceLine::Notice { pid: None, .. }
        ));
        assert!(matches!(
            parse_line("[pid 9] --- SIGCHLD {si_signo=SIGCHLD} ---").unwrap(),
            TraceLine::Notice { pid: Some(9), .. }
        ));
        assert_eq!(parse_line("").unwrap(), TraceLine::Blank);
    }

    #[test]
    fn test_classify_rejects_garbage() {
        assert!(parse_line("hello world").is_err());
        assert!(parse_line("[pid abc] open(\"a\", O_RDONLY) = 3").is_err());
        assert!(parse_line("<... open").is_err());
    }

    #[test]
    fn test_parse_call_respects_quotes_and_brackets() {
        let call = parse_call(
            r#"execve("/bin/sh", ["sh", "-c", "cat a, b > c"], 0x7ffd /* 20 vars */) = 0"#,
        )
        .unwrap();
        assert_eq!(call.name, "execve");
        assert_eq!(call.args.len(), 3);
        assert_eq!(call.args[1], r#"["sh", "-c", "cat a, b > c"]"#);
        assert_eq!(call.ret, Return::Value(0));
    }

    #[test]
    fn test_parse_call_paren_inside_string() {
        let call = parse_call(r#"open("odd) = 4", O_RDONLY) = 3"#).unwrap();
        assert_eq!(call.args, vec![r#""odd) = 4""#, "O_RDONLY"]);
        assert_eq!(call.ret, Return::Value(3));
    }

    #[test]
    fn test_parse_call_return_forms() {
        let failed = parse_call(r#"open("x", O_RDONLY) = -1 ENOENT (No such file or directory)"#).unwrap();
        assert!(failed.ret.is_failure());
        let decorated = parse_call(r#"openat(AT_FDCWD, "x", O_RDONLY) = 3</work/x>"#).unwrap();
        assert_eq!(decorated.ret, Return::Value(3));
        let unknown = parse_call("execve(\"/bin/x\", [\"x\"], 0x1) = ?").unwrap();
        assert_eq!(unknown.ret, Return::Unknown);
        assert!(parse_call("open(\"x\", O_RDONLY)").is_err());
        assert!(parse_call("open(\"x, O_RDONLY) = 3").is_err());
    }

    #[test]
    fn test_unquote_escapes() {
        assert_eq!(unquote(r#""plain""#).unwrap(), "plain");
        assert_eq!(unquote(r#""a\"b\\c""#).unwrap(), "a\"b\\c");
        assert_eq!(unquote(r#""tab\there\n""#).unwrap(), "tab\there\n");
        assert_eq!(unquote(r#""\33[0m""#).unwrap(), "\x1b[0m");
        assert_eq!(unquote(r#""\x41""#).unwrap(), "A");
        assert_eq!(unquote(r#""truncat"..."#).unwrap(), "truncat");
        assert!(unquote("AT_FDCWD").is_none());
        assert!(unquote(r#""open"#).is_none());
    }

    #[test]
    fn test_string_list() {
        assert_eq!(
            parse_string_list(r#"["ls", "-l", ...]"#).unwrap(),
            vec!["ls".to_string(), "-l".to_string()]
        );
        assert!(parse_string_list("NULL").unwrap().is_empty());
        assert!(parse_string_list("[]").unwrap().is_empty());
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
        assert_eq!(normalize(Path::new("/../x")), PathBuf::from("/x"));
    }

    #[test]
    fn test_single_process_read_and_write() {
        let raw = parse(&[
            r#"execve("/bin/sh", ["sh", "-c", "cat a > b"], 0x7ffc /* 5 vars */) = 0"#,
            r#"open("a", O_RDONLY) = 3"#,
            r#"open("b", O_WRONLY|O_CREAT) = 4"#,
        ]);
        assert_eq!(raw.processes.len(), 1);
        let record = raw.processes.get(&ProcessKey::ROOT).unwrap();
        assert_eq!(record.uses, set(&["a"]));
        assert_eq!(record.generates, set(&["b"]));
        assert_eq!(record.started_by, None);
        assert_eq!(record.executable.as_deref(), Some("/bin/sh"));
        assert_eq!(record.command_name(), Some("sh"));
    }

    #[test]
    fn test_duplicate_opens_recorded_once() {
        let raw = parse(&[
            r#"open("a", O_RDONLY) = 3"#,
            r#"open("a", O_RDONLY|O_CLOEXEC) = 3"#,
            r#"open("./a", O_RDONLY) = 3"#,
            r#"open("/work/b", O_RDONLY) = 3"#,
        ]);
        let record = raw.processes.get(&ProcessKey::ROOT).unwrap();
        assert_eq!(record.uses, set(&["a", "b"]));
    }

    #[test]
    fn test_read_write_counts_as_both() {
        let raw = parse(&[r#"openat(AT_FDCWD, "db.sqlite", O_RDWR|O_CREAT, 0644) = 3"#]);
        let record = raw.processes.get(&ProcessKey::ROOT).unwrap();
        assert_eq!(record.uses, set(&["db.sqlite"]));
        assert_eq!(record.generates, set(&["db.sqlite"]));
    }

    #[test]
    fn test_paths_outside_root_and_directories_ignored() {
        let raw = parse(&[
            r#"open("/etc/passwd", O_RDONLY) = 3"#,
            r#"open("../sibling", O_RDONLY) = 3"#,
            r#"openat(AT_FDCWD, ".", O_RDONLY|O_NONBLOCK|O_CLOEXEC|O_DIRECTORY) = 3"#,
            r#"openat(AT_FDCWD, "data", O_RDONLY|O_DIRECTORY) = 4"#,
            r#"open("sub/../kept", O_RDONLY) = 5"#,
        ]);
        let record = raw.processes.get(&ProcessKey::ROOT).unwrap();
        assert_eq!(record.uses, set(&["kept"]));
    }

    #[test]
    fn test_failed_syscalls_discarded() {
        let raw = parse(&[
            r#"execve("/usr/local/bin/tool", ["tool"], 0x1) = -1 ENOENT (No such file or directory)"#,
            r#"execve("/usr/bin/tool", ["tool"], 0x1) = 0"#,
            r#"open("missing", O_RDONLY) = -1 ENOENT (No such file or directory)"#,
        ]);
        assert_eq!(raw.processes.len(), 1);
        let record = raw.processes.get(&ProcessKey::ROOT).unwrap();
        assert_eq!(record.executable.as_deref(), Some("/usr/bin/tool"));
        assert!(record.uses.is_empty());
    }

    #[test]
    fn test_unfinished_resumed_stitching() {
        let raw = parse(&[
            r#"[pid 100] open("x", O_RDONL<unfinished ...>"#,
            r#"[pid 100] <... open resumed> Y) = 5"#,
        ]);
        assert_eq!(raw.root_pid, Some(100));
        let record = raw.processes.get(&ProcessKey::ROOT).unwrap();
        assert_eq!(record.uses, set(&["x"]));
    }

    #[test]
    fn test_interleaved_resume_across_processes() {
        let raw = parse(&[
            r#"execve("/bin/sh", ["sh"], 0x1) = 0"#,
            r#"clone(child_stack=NULL, flags=CLONE_CHILD_SETTID|SIGCHLD, child_tidptr=0x7f) = 200"#,
            r#"[pid 200] openat(AT_FDCWD, "out", O_WRONLY|O_CREAT|O_TRUNC, 0666 <unfinished ...>"#,
            r#"[pid 100] open("in", O_RDONLY) = 3"#,
            r#"[pid 200] <... openat resumed>) = 3"#,
        ]);
        assert_eq!(raw.root_pid, Some(100));
        let child = raw.processes.get(&ProcessKey::pid(200)).unwrap();
        assert_eq!(child.started_by, Some(ProcessKey::ROOT));
        assert_eq!(child.generates, set(&["out"]));
        assert_eq!(raw.processes.get(&ProcessKey::ROOT).unwrap().uses, set(&["in"]));
    }

    #[test]
    fn test_unmatched_resume_is_desync() {
        let mut parser = TraceParser::new("/work");
        parser.feed_line(r#"execve("/bin/sh", ["sh"], 0x1) = 0"#).unwrap();
        let err = parser
            .feed_line(r#"<... open resumed>) = 3"#)
            .unwrap_err();
        assert!(matches!(err, ProvError::Desync { line_no: 2, ref syscall, .. } if syscall == "open"));
    }

    #[test]
    fn test_malformed_line_is_fatal() {
        let mut parser = TraceParser::new("/work");
        let err = parser.feed_line("this is not strace output").unwrap_err();
        assert!(matches!(err, ProvError::Malformed { line_no: 1, .. }));
        let err = parser.feed_line(r#"open("a") = 3"#).unwrap_err();
        assert!(err.to_string().contains("missing argument"));
    }

    #[test]
    fn test_reexec_keeps_both_identities() {
        let raw = parse(&[
            r#"execve("/bin/sh", ["sh", "-c", "exec python run.py"], 0x1) = 0"#,
            r#"open("script.sh", O_RDONLY) = 3"#,
            r#"execve("/usr/bin/python", ["python", "run.py"], 0x1) = 0"#,
            r#"open("run.py", O_RDONLY) = 3"#,
        ]);
        assert_eq!(raw.processes.len(), 2);
        let shell_key: ProcessKey = "mother.0".parse().unwrap();
        let shell = raw.processes.get(&shell_key).unwrap();
        let python = raw.processes.get(&ProcessKey::ROOT).unwrap();
        assert_eq!(shell.command_name(), Some("sh"));
        assert_eq!(shell.uses, set(&["script.sh"]));
        assert_eq!(python.command_name(), Some("python"));
        assert_eq!(python.started_by, Some(shell_key));
        assert_eq!(python.uses, set(&["run.py"]));
    }

    #[test]
    fn test_reexec_repoints_earlier_children() {
        let raw = parse(&[
            r#"execve("/bin/sh", ["sh"], 0x1) = 0"#,
            r#"clone(child_stack=NULL, flags=SIGCHLD) = 300"#,
            r#"[pid 100] execve("/bin/python", ["python"], 0x1) = 0"#,
        ]);
        let child = raw.processes.get(&ProcessKey::pid(300)).unwrap();
        assert_eq!(child.started_by, Some("mother.0".parse().unwrap()));
    }

    #[test]
    fn test_pid_reuse_archives() {
        let raw = parse(&[
            r#"execve("/bin/sh", ["sh"], 0x1) = 0"#,
            r#"clone(child_stack=NULL, flags=SIGCHLD) = 300"#,
            r#"[pid 300] execve("/bin/ls", ["ls"], 0x1) = 0"#,
            r#"[pid 300] +++ exited with 0 +++"#,
            r#"[pid 100] vfork() = 300"#,
            r#"[pid 300] execve("/bin/cat", ["cat"], 0x1) = 0"#,
        ]);
        let first: ProcessKey = "300.0".parse().unwrap();
        assert_eq!(raw.processes.get(&first).unwrap().command_name(), Some("ls"));
        assert_eq!(
            raw.processes.get(&ProcessKey::pid(300)).unwrap().command_name(),
            Some("cat")
        );
    }

    #[test]
    fn test_child_seen_before_clone_returns() {
        let raw = parse(&[
            r#"execve("/bin/sh", ["sh"], 0x1) = 0"#,
            r#"clone(child_stack=NULL, flags=SIGCHLD <unfinished ...>"#,
            r#"[pid 201] execve("/bin/grep", ["grep", "x"], 0x1) = 0"#,
            r#"[pid 100] <... clone resumed>, child_tidptr=0x7f) = 201"#,
        ]);
        assert_eq!(raw.root_pid, Some(100));
        let child = raw.processes.get(&ProcessKey::pid(201)).unwrap();
        assert_eq!(child.started_by, Some(ProcessKey::ROOT));
        assert_eq!(child.command_name(), Some("grep"));
        assert_eq!(raw.processes.len(), 2);
    }

    #[test]
    fn test_unadopted_process_attaches_to_root() {
        let raw = parse(&[
            r#"execve("/bin/sh", ["sh"], 0x1) = 0"#,
            r#"clone(child_stack=NULL, flags=SIGCHLD) = 200"#,
            r#"[pid 100] open("a", O_RDONLY) = 3"#,
            r#"[pid 999] open("b", O_RDONLY) = 3"#,
        ]);
        let orphan = raw.processes.get(&ProcessKey::pid(999)).unwrap();
        assert_eq!(orphan.started_by, Some(ProcessKey::ROOT));
    }

    #[test]
    fn test_chdir_changes_resolution() {
        let raw = parse(&[
            r#"chdir("sub") = 0"#,
            r#"open("a", O_RDONLY) = 3"#,
            r#"clone(child_stack=NULL, flags=SIGCHLD) = 200"#,
            r#"[pid 200] open("../b", O_WRONLY|O_CREAT) = 3"#,
            r#"[pid 200] fchdir(3</tmp>) = 0"#,
            r#"[pid 200] open("c", O_WRONLY|O_CREAT) = 4"#,
        ]);
        let root = raw.processes.get(&ProcessKey::ROOT).unwrap();
        assert_eq!(root.uses, set(&["sub/a"]));
        let child = raw.processes.get(&ProcessKey::pid(200)).unwrap();
        assert_eq!(child.generates, set(&["b"]));
    }

    #[test]
    fn test_chdir_ignored_when_disabled() {
        let mut parser = TraceParser::new("/work").track_cwd(false);
        parser.feed_line(r#"chdir("sub") = 0"#).unwrap();
        parser.feed_line(r#"open("a", O_RDONLY) = 3"#).unwrap();
        let raw = parser.finish();
        assert_eq!(raw.processes.get(&ProcessKey::ROOT).unwrap().uses, set(&["a"]));
    }

    #[test]
    fn test_openat_with_decorated_dirfd() {
        let raw = parse(&[
            r#"openat(3</work/data>, "x.csv", O_RDONLY) = 4</work/data/x.csv>"#,
            r#"openat(5, "unknown", O_RDONLY) = 6"#,
        ]);
        let record = raw.processes.get(&ProcessKey::ROOT).unwrap();
        assert_eq!(record.uses, set(&["data/x.csv"]));
    }

    #[test]
    fn test_creat_and_unlink() {
        let raw = parse(&[
            r#"creat("tmp.out", 0644) = 3"#,
            r#"unlink("tmp.out") = 0"#,
            r#"unlinkat(AT_FDCWD, "old.log", 0) = 0"#,
            r#"unlinkat(AT_FDCWD, "scratch", AT_REMOVEDIR) = 0"#,
            r#"unlink("/tmp/elsewhere") = 0"#,
        ]);
        let record = raw.processes.get(&ProcessKey::ROOT).unwrap();
        assert_eq!(record.generates, set(&["tmp.out"]));
        assert_eq!(record.removes, set(&["old.log", "tmp.out"]));
    }

    #[test]
    fn test_root_exit_from_notices() {
        let raw = parse(&[r#"execve("/bin/false", ["false"], 0x1) = 0"#, "+++ exited with 1 +++"]);
        assert_eq!(raw.root_exit, Some(1));

        let raw = parse(&[
            r#"execve("/bin/sleep", ["sleep", "9"], 0x1) = 0"#,
            "+++ killed by SIGKILL +++",
        ]);
        assert_eq!(raw.root_exit, Some(137));
    }

    #[test]
    fn test_superseded_thread_exec() {
        let raw = parse(&[
            r#"execve("/bin/app", ["app"], 0x1) = 0"#,
            r#"clone(child_stack=0x7f, flags=CLONE_VM|CLONE_THREAD) = 101"#,
            r#"[pid 101] execve("/bin/next", ["next"], 0x1 <unfinished ...>"#,
            r#"[pid 100] +++ superseded by execve in pid 101 +++"#,
            r#"[pid 100] <... execve resumed>) = 0"#,
        ]);
        let root = raw.processes.get(&ProcessKey::ROOT).unwrap();
        assert_eq!(root.command_name(), Some("next"));
    }

    #[test]
    fn test_truncated_trace_is_best_effort() {
        let raw = parse(&[
            r#"execve("/bin/sh", ["sh"], 0x1) = 0"#,
            r#"open("a", O_RDONLY) = 3"#,
            r#"open("b", O_RDONLY <unfinished ...>"#,
        ]);
        assert_eq!(raw.processes.get(&ProcessKey::ROOT).unwrap().uses, set(&["a"]));
    }

    #[test]
    fn test_parse_reader_handles_non_utf8() {
        let mut input = b"execve(\"/bin/sh\", [\"sh\"], 0x1) = 0\n".to_vec();
        input.extend_from_slice(b"write(1, \"\xff\", 1) = 1\n");
        input.extend_from_slice(b"open(\"a\", O_RDONLY) = 3\n");
        let raw = parse_reader(&input[..], Path::new("/work"), true).unwrap();
        assert_eq!(raw.processes.get(&ProcessKey::ROOT).unwrap().uses, set(&["a"]));
    }

    #[test]
    fn test_classify_bare_pid_prefix() {
        assert_eq!(
            parse_line(r#"4242  open("a", O_RDONLY) = 3"#).unwrap(),
            TraceLine::Call {
                pid: Some(4242),
                text: r#"open("a", O_RDONLY) = 3"#
            }
        );
        assert!(matches!(
            parse_line("4243  <... wait4 resumed>, 0, NULL) = 4244").unwrap(),
            TraceLine::Resumed { pid: Some(4243), syscall: "wait4", .. }
        ));
        assert!(matches!(
            parse_line("4242  +++ exited with 0 +++").unwrap(),
            TraceLine::Notice { pid: Some(4242), .. }
        ));
        assert!(parse_line("99999999999  open(\"a\", O_RDONLY) = 3").is_err());
    }

    #[test]
    fn test_file_output_names_root_from_first_line() {
        let raw = parse(&[
            r#"4242  execve("/bin/sh", ["sh", "-c", "cat a > b"], 0x7ffc /* 5 vars */) = 0"#,
            r#"4242  clone(child_stack=NULL, flags=CLONE_CHILD_SETTID|SIGCHLD <unfinished ...>"#,
            r#"4243  openat(AT_FDCWD, "a", O_RDONLY) = 3</work/a>"#,
            r#"4242  <... clone resumed>, child_tidptr=0x7f) = 4243"#,
            r#"4243  openat(AT_FDCWD, "b", O_WRONLY|O_CREAT|O_TRUNC, 0666) = 4</work/b>"#,
            "4243  +++ exited with 0 +++",
            "4242  +++ exited with 0 +++",
        ]);
        assert_eq!(raw.root_pid, Some(4242));
        assert_eq!(raw.root_exit, Some(0));
        let root = raw.processes.get(&ProcessKey::ROOT).unwrap();
        assert_eq!(root.command_name(), Some("sh"));
        let child = raw.processes.get(&ProcessKey::pid(4243)).unwrap();
        assert_eq!(child.started_by, Some(ProcessKey::ROOT));
        assert_eq!(child.uses, set(&["a"]));
        assert_eq!(child.generates, set(&["b"]));
    }

    #[test]
    fn test_grandchild_seen_while_child_clones() {
        let raw = parse(&[
            r#"execve("/bin/sh", ["sh", "-c", "(grep x in)"], 0x1) = 0"#,
            r#"clone(child_stack=NULL, flags=SIGCHLD) = 200"#,
            r#"[pid 200] clone(child_stack=NULL, flags=SIGCHLD <unfinished ...>"#,
            r#"[pid 201] execve("/bin/grep", ["grep", "x", "in"], 0x1) = 0"#,
            r#"[pid 200] <... clone resumed>) = 201"#,
            r#"[pid 201] open("in", O_RDONLY) = 3"#,
        ]);
        assert_eq!(raw.root_pid, None);
        let grandchild = raw.processes.get(&ProcessKey::pid(201)).unwrap();
        assert_eq!(grandchild.started_by, Some(ProcessKey::pid(200)));
        assert_eq!(grandchild.command_name(), Some("grep"));
        assert_eq!(grandchild.uses, set(&["in"]));
        assert_eq!(
            raw.processes.get(&ProcessKey::pid(200)).unwrap().started_by,
            Some(ProcessKey::ROOT)
        );
    }

    #[test]
    fn test_octal_escapes_decode_as_utf8() {
        assert_eq!(unquote(r#""\303\251t\303\251.txt""#).unwrap(), "été.txt");
        assert_eq!(unquote(r#""\xc3\xa9""#).unwrap(), "é");
        let raw = parse(&[r#"open("\303\251t\303\251.txt", O_RDONLY) = 3"#]);
        assert_eq!(
            raw.processes.get(&ProcessKey::ROOT).unwrap().uses,
            set(&["été.txt"])
        );
    }

    #[test]
    fn test_decorated_cwd_dirfd_uses_tracked_cwd() {
        let raw = parse(&[
            r#"chdir("src") = 0"#,
            r#"openat(AT_FDCWD</work/src>, "main.c", O_RDONLY) = 3</work/src/main.c>"#,
        ]);
        assert_eq!(
            raw.processes.get(&ProcessKey::ROOT).unwrap().uses,
            set(&["src/main.c"])
        );
    }
}
