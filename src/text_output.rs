//! Human-readable process tree

use crate::json_output::{ordered_keys, sequential_ids};
use crate::process::{ProcessKey, ProcessMap, ProcessRecord};
use crate::tracer::Provenance;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;

/// Render the reduced tree, children indented under their parent
///
/// ```text
/// [4711] sh -c make
///     uses: Makefile
///   [4800] cc -c main.c
///       uses: main.c
///       generates: main.o
/// ```
pub fn render_text(provenance: &Provenance, renumber: bool) -> String {
    let processes = &provenance.processes;
    let numbers = renumber.then(|| sequential_ids(processes));
    let label = |key: &ProcessKey| match numbers.as_ref().and_then(|n| n.get(key)) {
        Some(n) => n.to_string(),
        None => key.to_string(),
    };

    let mut children: HashMap<ProcessKey, Vec<ProcessKey>> = HashMap::new();
    for record in processes.values() {
        if let Some(parent) = record.started_by {
            children.entry(parent).or_default().push(record.pid);
        }
    }

    let mut out = String::new();
    let mut stack: Vec<(ProcessKey, usize)> = ordered_keys(processes)
        .into_iter()
        .filter(|key| processes.get(key).is_some_and(|r| r.started_by.is_none()))
        .rev()
        .map(|key| (key, 0))
        .collect();
    while let Some((key, depth)) = stack.pop() {
        let Some(record) = processes.get(&key) else {
            continue;
        };
        write_record(&mut out, record, &label(&key), depth);
        if let Some(kids) = children.get(&key) {
            stack.extend(kids.iter().rev().map(|kid| (*kid, depth + 1)));
        }
    }

    if provenance.timed_out {
        let _ = writeln!(out, "exit code: {} (timed out)", provenance.exit_code);
    } else {
        let _ = writeln!(out, "exit code: {}", provenance.exit_code);
    }
    out
}

fn write_record(out: &mut String, record: &ProcessRecord, label: &str, depth: usize) {
    let indent = "  ".repeat(depth);
    let command = match &record.argv {
        Some(argv) => argv.join(" "),
        None => record
            .executable
            .clone()
            .unwrap_or_else(|| "<no exec>".to_string()),
    };
    let _ = writeln!(out, "{}[{}] {}", indent, label, command);
    for (name, paths) in [
        ("uses", &record.uses),
        ("generates", &record.generates),
        ("removes", &record.removes),
    ] {
        if !paths.is_empty() {
            let joined: Vec<&str> = paths.iter().map(String::as_str).collect();
            let _ = writeln!(out, "{}    {}: {}", indent, name, joined.join(", "));
        }
    }
}

/// Per-process file counts, used for the one-line summary
pub fn summary_counts(processes: &ProcessMap) -> BTreeMap<&'static str, usize> {
    let (uses, generates, removes) = processes.file_accesses();
    BTreeMap::from([
        ("processes", processes.len()),
        ("uses", uses.len()),
        ("generates", generates.len()),
        ("removes", removes.len()),
    ])
}
