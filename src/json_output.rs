//! JSON output format for provenance maps
//!
//! `--format json` implementation. Process keys are emitted as strings
//! (`"4711"`, `"4711.0"`) or, with renumbering, as small integers where the
//! root is 0.

use crate::process::{ProcessKey, ProcessMap};
use crate::tracer::Provenance;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Process identifier as written to JSON
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonPid {
    Number(usize),
    Key(String),
}

/// One kept process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonProcess {
    pub pid: JsonPid,
    pub started_by: Option<JsonPid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executable: Option<String>,
    /// `null` if the process never replaced its image
    pub argv: Option<Vec<String>>,
    pub uses: Vec<String>,
    pub generates: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removes: Vec<String>,
}

/// Summary information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonSummary {
    pub total_processes: usize,
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub timed_out: bool,
}

/// Complete JSON document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonProvenance {
    /// Format version identifier
    pub version: String,
    /// Format name
    pub format: String,
    pub processes: Vec<JsonProcess>,
    pub summary: JsonSummary,
}

impl JsonProvenance {
    /// Build the document, optionally renumbering pids
    pub fn from_provenance(provenance: &Provenance, renumber: bool) -> Self {
        let numbers = renumber.then(|| sequential_ids(&provenance.processes));
        let pid = |key: &ProcessKey| match &numbers {
            Some(numbers) => numbers
                .get(key)
                .map(|n| JsonPid::Number(*n))
                .unwrap_or_else(|| JsonPid::Key(key.to_string())),
            None => JsonPid::Key(key.to_string()),
        };

        let processes = ordered_keys(&provenance.processes)
            .into_iter()
            .filter_map(|key| provenance.processes.get(&key))
            .map(|record| JsonProcess {
                pid: pid(&record.pid),
                started_by: record.started_by.as_ref().map(&pid),
                executable: record.executable.clone(),
                argv: record.argv.clone(),
                uses: record.uses.iter().cloned().collect(),
                generates: record.generates.iter().cloned().collect(),
                removes: record.removes.iter().cloned().collect(),
            })
            .collect();

        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            format: "procprov-json-v1".to_string(),
            processes,
            summary: JsonSummary {
                total_processes: provenance.processes.len(),
                exit_code: provenance.exit_code,
                timed_out: provenance.timed_out,
            },
        }
    }

    /// Serialize to JSON string
    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Parentless records first, then the rest, each group in key order
pub fn ordered_keys(processes: &ProcessMap) -> Vec<ProcessKey> {
    let (mut roots, rest): (Vec<_>, Vec<_>) = processes
        .values()
        .partition(|record| record.started_by.is_none());
    roots.extend(rest);
    roots.into_iter().map(|record| record.pid).collect()
}

/// Small sequential ids in [`ordered_keys`] order, the root being 0
pub fn sequential_ids(processes: &ProcessMap) -> BTreeMap<ProcessKey, usize> {
    ordered_keys(processes)
        .into_iter()
        .enumerate()
        .map(|(n, key)| (key, n))
        .collect()
}
