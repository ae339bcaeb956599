//! Process records and the pid-keyed process map
//!
//! A traced command is described as a map from [`ProcessKey`] to
//! [`ProcessRecord`]. The root process is keyed by [`ProcessId::Unresolved`]
//! until its real pid is learned. When an OS pid is reused, or a process
//! replaces its image a second time, the stale record is archived under the
//! same id with a numeric generation suffix (`1234.0`, `1234.1`, ...).

use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

/// Identity of an observed OS process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProcessId {
    /// The tracer's direct child before its pid is known
    Unresolved,
    /// A real OS pid
    Pid(u32),
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessId::Unresolved => write!(f, "mother"),
            ProcessId::Pid(pid) => write!(f, "{}", pid),
        }
    }
}

/// Key of a record in a [`ProcessMap`]
///
/// `generation` is `None` for the live record of a process id and
/// `Some(n)` for records archived by pid reuse or re-exec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessKey {
    pub id: ProcessId,
    pub generation: Option<u32>,
}

impl ProcessKey {
    /// Live key of the not yet resolved root process
    pub const ROOT: ProcessKey = ProcessKey {
        id: ProcessId::Unresolved,
        generation: None,
    };

    pub fn live(id: ProcessId) -> Self {
        Self {
            id,
            generation: None,
        }
    }

    pub fn pid(pid: u32) -> Self {
        Self::live(ProcessId::Pid(pid))
    }

    pub fn archived(id: ProcessId, generation: u32) -> Self {
        Self {
            id,
            generation: Some(generation),
        }
    }

    pub fn is_archived(&self) -> bool {
        self.generation.is_some()
    }
}

impl fmt::Display for ProcessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.generation {
            None => write!(f, "{}", self.id),
            Some(generation) => write!(f, "{}.{}", self.id, generation),
        }
    }
}

impl FromStr for ProcessKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, generation) = match s.split_once('.') {
            Some((id, generation)) => {
                let generation = generation
                    .parse::<u32>()
                    .map_err(|_| format!("invalid generation in process key '{}'", s))?;
                (id, Some(generation))
            }
            None => (s, None),
        };
        let id = if id == "mother" {
            ProcessId::Unresolved
        } else {
            ProcessId::Pid(
                id.parse::<u32>()
                    .map_err(|_| format!("invalid pid in process key '{}'", s))?,
            )
        };
        Ok(Self { id, generation })
    }
}

impl Serialize for ProcessKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Everything observed about one logical process
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessRecord {
    /// Current key of this record
    pub pid: ProcessKey,
    /// Key of the parent process, `None` for the root
    pub started_by: Option<ProcessKey>,
    /// Program path from `execve`
    pub executable: Option<String>,
    /// Argument vector from `execve`, `None` if the process never exec'd
    pub argv: Option<Vec<String>>,
    /// Paths under the trace root opened for reading
    pub uses: BTreeSet<String>,
    /// Paths under the trace root opened for writing
    pub generates: BTreeSet<String>,
    /// Paths under the trace root that were unlinked
    pub removes: BTreeSet<String>,
}

impl ProcessRecord {
    pub fn new(pid: ProcessKey, started_by: Option<ProcessKey>) -> Self {
        Self {
            pid,
            started_by,
            executable: None,
            argv: None,
            uses: BTreeSet::new(),
            generates: BTreeSet::new(),
            removes: BTreeSet::new(),
        }
    }

    /// First element of `argv`, if the process exec'd with a non-empty vector
    pub fn command_name(&self) -> Option<&str> {
        self.argv.as_ref()?.first().map(String::as_str)
    }

    /// Union another record's file accesses into this one
    pub fn absorb_files(&mut self, other: &ProcessRecord) {
        self.uses.extend(other.uses.iter().cloned());
        self.generates.extend(other.generates.iter().cloned());
        self.removes.extend(other.removes.iter().cloned());
    }
}

/// Ordered map of process records
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessMap {
    records: BTreeMap<ProcessKey, ProcessRecord>,
}

impl ProcessMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, key: &ProcessKey) -> bool {
        self.records.contains_key(key)
    }

    pub fn get(&self, key: &ProcessKey) -> Option<&ProcessRecord> {
        self.records.get(key)
    }

    pub fn get_mut(&mut self, key: &ProcessKey) -> Option<&mut ProcessRecord> {
        self.records.get_mut(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &ProcessKey> {
        self.records.keys()
    }

    pub fn values(&self) -> impl Iterator<Item = &ProcessRecord> {
        self.records.values()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ProcessKey, &ProcessRecord)> {
        self.records.iter()
    }

    /// Insert a record under its own `pid`, replacing any previous one
    pub fn insert(&mut self, record: ProcessRecord) -> Option<ProcessRecord> {
        self.records.insert(record.pid, record)
    }

    pub fn remove(&mut self, key: &ProcessKey) -> Option<ProcessRecord> {
        self.records.remove(key)
    }

    /// Records whose `started_by` is `None`
    pub fn roots(&self) -> impl Iterator<Item = &ProcessRecord> {
        self.records.values().filter(|r| r.started_by.is_none())
    }

    /// Smallest archive key for `id` not yet present in the map
    pub fn next_archive_key(&self, id: ProcessId) -> ProcessKey {
        let mut generation = 0;
        while self.contains(&ProcessKey::archived(id, generation)) {
            generation += 1;
        }
        ProcessKey::archived(id, generation)
    }

    /// Move the record at `key` to a fresh archive key
    ///
    /// Parent links pointing at `key` follow the record. Returns the archive
    /// key, or `None` if nothing was stored at `key`.
    pub fn archive(&mut self, key: &ProcessKey) -> Option<ProcessKey> {
        let mut record = self.records.remove(key)?;
        let archived = self.next_archive_key(key.id);
        record.pid = archived;
        self.records.insert(archived, record);
        for other in self.records.values_mut() {
            if other.started_by == Some(*key) {
                other.started_by = Some(archived);
            }
        }
        Some(archived)
    }

    /// Start a new record at `key`, archiving whatever lived there before
    pub fn spawn(
        &mut self,
        key: ProcessKey,
        started_by: Option<ProcessKey>,
    ) -> (&mut ProcessRecord, Option<ProcessKey>) {
        let archived = self.archive(&key);
        // A parent archived in the same step must be referenced by its new key.
        let started_by = match (started_by, archived) {
            (Some(parent), Some(old)) if parent == key => Some(old),
            (parent, _) => parent,
        };
        let record = self
            .records
            .entry(key)
            .or_insert_with(|| ProcessRecord::new(key, started_by));
        (record, archived)
    }

    /// Rename keys according to `renames`, rewriting `pid` and `started_by`
    pub fn rekey(&mut self, renames: &HashMap<ProcessKey, ProcessKey>) {
        let records = std::mem::take(&mut self.records);
        for (key, mut record) in records {
            let key = renames.get(&key).copied().unwrap_or(key);
            record.pid = key;
            if let Some(parent) = record.started_by {
                record.started_by = Some(renames.get(&parent).copied().unwrap_or(parent));
            }
            self.records.insert(key, record);
        }
    }

    /// Union of `uses`, `generates` and `removes` across all records
    pub fn file_accesses(&self) -> (BTreeSet<String>, BTreeSet<String>, BTreeSet<String>) {
        let mut uses = BTreeSet::new();
        let mut generates = BTreeSet::new();
        let mut removes = BTreeSet::new();
        for record in self.records.values() {
            uses.extend(record.uses.iter().cloned());
            generates.extend(record.generates.iter().cloned());
            removes.extend(record.removes.iter().cloned());
        }
        (uses, generates, removes)
    }
}

impl FromIterator<ProcessRecord> for ProcessMap {
    fn from_iter<I: IntoIterator<Item = ProcessRecord>>(iter: I) -> Self {
        let mut map = ProcessMap::new();
        for record in iter {
            map.insert(record);
        }
        map
    }
}
