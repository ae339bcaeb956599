//! Syscalls that carry provenance information
//!
//! Dispatch is a closed enum over the handled set. Every other name decodes
//! to [`Syscall::Other`] and is ignored by the parser.

/// A syscall the trace parser understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Syscall {
    Clone,
    Clone3,
    Fork,
    Vfork,
    Execve,
    Execveat,
    Open,
    Openat,
    Creat,
    Chdir,
    Fchdir,
    Unlink,
    Unlinkat,
    /// Any syscall without provenance meaning
    Other,
}

impl Syscall {
    /// Every handled syscall, in the order they are requested from the tracer
    pub const HANDLED: [Syscall; 13] = [
        Syscall::Clone,
        Syscall::Clone3,
        Syscall::Fork,
        Syscall::Vfork,
        Syscall::Execve,
        Syscall::Execveat,
        Syscall::Open,
        Syscall::Openat,
        Syscall::Creat,
        Syscall::Chdir,
        Syscall::Fchdir,
        Syscall::Unlink,
        Syscall::Unlinkat,
    ];

    pub fn from_name(name: &str) -> Self {
        match name {
            "clone" => Syscall::Clone,
            "clone3" => Syscall::Clone3,
            "fork" => Syscall::Fork,
            "vfork" => Syscall::Vfork,
            "execve" => Syscall::Execve,
            "execveat" => Syscall::Execveat,
            "open" => Syscall::Open,
            "openat" => Syscall::Openat,
            "creat" => Syscall::Creat,
            "chdir" => Syscall::Chdir,
            "fchdir" => Syscall::Fchdir,
            "unlink" => Syscall::Unlink,
            "unlinkat" => Syscall::Unlinkat,
            _ => Syscall::Other,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Syscall::Clone => "clone",
            Syscall::Clone3 => "clone3",
            Syscall::Fork => "fork",
            Syscall::Vfork => "vfork",
            Syscall::Execve => "execve",
            Syscall::Execveat => "execveat",
            Syscall::Open => "open",
            Syscall::Openat => "openat",
            Syscall::Creat => "creat",
            Syscall::Chdir => "chdir",
            Syscall::Fchdir => "fchdir",
            Syscall::Unlink => "unlink",
            Syscall::Unlinkat => "unlinkat",
            Syscall::Other => "other",
        }
    }

    /// Creates a new process; the return value is the child's pid
    pub fn is_spawn(&self) -> bool {
        matches!(
            self,
            Syscall::Clone | Syscall::Clone3 | Syscall::Fork | Syscall::Vfork
        )
    }

    pub fn is_exec(&self) -> bool {
        matches!(self, Syscall::Execve | Syscall::Execveat)
    }

    pub fn is_file(&self) -> bool {
        matches!(
            self,
            Syscall::Open
                | Syscall::Openat
                | Syscall::Creat
                | Syscall::Chdir
                | Syscall::Fchdir
                | Syscall::Unlink
                | Syscall::Unlinkat
        )
    }
}

const O_ACCMODE: i64 = 0o3;
const O_WRONLY: i64 = 0o1;
const O_RDWR: i64 = 0o2;

/// Access intent decoded from an `open` flags argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenMode {
    pub read: bool,
    pub write: bool,
    pub directory: bool,
}

impl OpenMode {
    /// Mode of `creat(2)`, equivalent to `O_CREAT|O_WRONLY|O_TRUNC`
    pub const CREAT: OpenMode = OpenMode {
        read: false,
        write: true,
        directory: false,
    };

    /// Decode symbolic (`O_RDWR|O_CREAT`) or numeric (`0x42`, `0102`) flags
    pub fn parse(flags: &str) -> Option<Self> {
        let flags = flags.trim();
        if flags.starts_with("O_") {
            let mut mode = OpenMode {
                read: true,
                ..OpenMode::default()
            };
            for flag in flags.split('|').map(str::trim) {
                match flag {
                    "O_WRONLY" => {
                        mode.read = false;
                        mode.write = true;
                    }
                    "O_RDWR" => mode.write = true,
                    "O_DIRECTORY" => mode.directory = true,
                    _ => {}
                }
            }
            return Some(mode);
        }

        let bits = parse_int(flags)?;
        Some(match bits & O_ACCMODE {
            O_WRONLY => OpenMode {
                write: true,
                ..OpenMode::default()
            },
            O_RDWR => OpenMode {
                read: true,
                write: true,
                directory: false,
            },
            _ => OpenMode {
                read: true,
                ..OpenMode::default()
            },
        })
    }
}

/// Parse a tracer integer in decimal, `0x` hex or leading-zero octal
pub fn parse_int(text: &str) -> Option<i64> {
    let text = text.trim();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let value = if let Some(hex) = digits.strip_prefix("0x") {
        i64::from_str_radix(hex, 16).ok()?
    } else if digits.len() > 1 && digits.starts_with('0') {
        i64::from_str_radix(&digits[1..], 8).ok()?
    } else {
        digits.parse::<i64>().ok()?
    };
    Some(if negative { -value } else { value })
}
