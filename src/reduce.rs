//! Process-tree reduction
//!
//! Turns the raw map produced by [`crate::parser`] into a provenance map:
//!
//! 1. the root's sentinel id is replaced by its real pid ([`resolve_root`]);
//! 2. file sets are already de-duplicated, since records hold `BTreeSet`s;
//! 3. processes rejected by an [`ArgvPredicate`] are dropped and their file
//!    accesses are merged into the nearest kept ancestor ([`filter_tree`]).

use crate::error::{ProvError, Result};
use crate::filter::ArgvPredicate;
use crate::parser::RawTrace;
use crate::process::{ProcessId, ProcessKey, ProcessMap, ProcessRecord};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Resolve and reduce a parsed trace in one step
pub fn reduce<P>(raw: RawTrace, predicate: &P) -> Result<ProcessMap>
where
    P: ArgvPredicate + ?Sized,
{
    let mut processes = raw.processes;
    resolve_root(&mut processes, raw.root_pid);
    filter_tree(processes, predicate)
}

/// Rename the sentinel-keyed root records to the root's real pid
///
/// Uses `known` when the parser learned the pid. Otherwise the first
/// parentless record with a real pid is taken to be the root under a second
/// name: its contents are merged into the sentinel record, which then takes
/// its pid. Returns the pid the root ended up with, or `None` if the sentinel
/// stays the root's identity.
pub fn resolve_root(processes: &mut ProcessMap, known: Option<u32>) -> Option<u32> {
    if !processes.contains(&ProcessKey::ROOT) {
        return None;
    }

    let pid = match known {
        Some(pid) => pid,
        None => {
            let alias = processes
                .roots()
                .map(|record| record.pid)
                .find(|key| key.id != ProcessId::Unresolved && !key.is_archived())?;
            let ProcessId::Pid(pid) = alias.id else {
                return None;
            };
            if let Some(found) = processes.remove(&alias) {
                merge_alias(processes, found);
            }
            let children: Vec<ProcessKey> = processes
                .values()
                .filter(|record| record.started_by == Some(alias))
                .map(|record| record.pid)
                .collect();
            for child in children {
                if let Some(record) = processes.get_mut(&child) {
                    record.started_by = Some(ProcessKey::ROOT);
                }
            }
            pid
        }
    };

    let renames = sentinel_renames(processes, pid);
    debug!(pid, renamed = renames.len(), "resolved root identity");
    processes.rekey(&renames);
    Some(pid)
}

/// Fold the root's alias record into the sentinel record
fn merge_alias(processes: &mut ProcessMap, alias: ProcessRecord) {
    if let Some(root) = processes.get_mut(&ProcessKey::ROOT) {
        root.absorb_files(&alias);
        if root.argv.is_none() {
            root.executable = alias.executable;
            root.argv = alias.argv;
        }
    }
}

/// Rename table from every sentinel key to a free key under `pid`
fn sentinel_renames(processes: &ProcessMap, pid: u32) -> HashMap<ProcessKey, ProcessKey> {
    let id = ProcessId::Pid(pid);
    let mut taken: BTreeSet<ProcessKey> = processes
        .keys()
        .filter(|key| key.id == id)
        .copied()
        .collect();
    let mut renames = HashMap::new();

    let sentinels: Vec<ProcessKey> = processes
        .keys()
        .filter(|key| key.id == ProcessId::Unresolved)
        .copied()
        .collect();
    for key in sentinels {
        let mut target = ProcessKey {
            id,
            generation: key.generation,
        };
        if taken.contains(&target) {
            let mut generation = 0;
            while taken.contains(&ProcessKey::archived(id, generation)) {
                generation += 1;
            }
            target = ProcessKey::archived(id, generation);
        }
        taken.insert(target);
        renames.insert(key, target);
    }
    renames
}

/// Keep the root plus every process whose `argv[0]` satisfies `predicate`
///
/// Dropped processes hand their file sets to their effective parent, the
/// nearest kept ancestor. Kept processes are re-parented onto their effective
/// parent. Records are visited root first so each effective parent is
/// resolved exactly once.
pub fn filter_tree<P>(processes: ProcessMap, predicate: &P) -> Result<ProcessMap>
where
    P: ArgvPredicate + ?Sized,
{
    let order = topological_order(&processes)?;
    let mut survivor: HashMap<ProcessKey, ProcessKey> = HashMap::with_capacity(order.len());
    let mut reduced = ProcessMap::new();
    let mut dropped = 0usize;

    for key in order {
        let Some(record) = processes.get(&key) else {
            continue;
        };
        let effective_parent = match record.started_by {
            None => None,
            Some(parent) => Some(survivor.get(&parent).copied().ok_or_else(|| {
                ProvError::DanglingParent {
                    pid: key.to_string(),
                    parent: parent.to_string(),
                }
            })?),
        };

        let keep = effective_parent.is_none()
            || record
                .command_name()
                .is_some_and(|argv0| predicate.matches(argv0));

        match effective_parent {
            Some(target) if !keep => {
                if let Some(ancestor) = reduced.get_mut(&target) {
                    ancestor.absorb_files(record);
                }
                survivor.insert(key, target);
                dropped += 1;
            }
            _ => {
                let mut kept = record.clone();
                kept.started_by = effective_parent;
                reduced.insert(kept);
                survivor.insert(key, key);
            }
        }
    }

    debug!(kept = reduced.len(), dropped, "filtered process tree");
    Ok(reduced)
}

/// Keys ordered by depth below their root, ties broken by key
fn topological_order(processes: &ProcessMap) -> Result<Vec<ProcessKey>> {
    let mut depth: HashMap<ProcessKey, usize> = HashMap::with_capacity(processes.len());

    for start in processes.keys() {
        let mut chain = Vec::new();
        let mut on_chain = BTreeSet::new();
        let mut cursor = *start;
        let base = loop {
            if let Some(known) = depth.get(&cursor) {
                break *known;
            }
            if !on_chain.insert(cursor) {
                return Err(ProvError::CyclicAncestry {
                    pid: cursor.to_string(),
                });
            }
            chain.push(cursor);
            let record = processes
                .get(&cursor)
                .ok_or_else(|| ProvError::DanglingParent {
                    pid: chain
                        .iter()
                        .rev()
                        .nth(1)
                        .map(ProcessKey::to_string)
                        .unwrap_or_default(),
                    parent: cursor.to_string(),
                })?;
            match record.started_by {
                Some(parent) => cursor = parent,
                None => {
                    chain.pop();
                    depth.insert(cursor, 0);
                    break 0;
                }
            }
        };
        for (offset, key) in chain.iter().rev().enumerate() {
            depth.insert(*key, base + offset + 1);
        }
    }

    let mut order: Vec<ProcessKey> = processes.keys().copied().collect();
    order.sort_by_key(|key| (depth.get(key).copied().unwrap_or_default(), *key));
    Ok(order)
}
