//! Reconciling a desired array against a live CRDT sequence.
//!
//! Both algorithms keep a JSON mirror of the live sequence and apply every
//! operation to the mirror and to the target, so positions computed from the
//! mirror always address the same element in the target.

use std::cmp::Ordering;
use std::collections::HashSet;

use loro::{LoroList, LoroMovableList};
use serde_json::Value;

use crate::document::convert::to_loro;
use crate::error::{SyncError, SyncResult};

/// Positional operations shared by plain and movable lists.
pub trait ListOps {
    fn insert(&mut self, pos: usize, value: &Value) -> SyncResult<()>;
    fn delete(&mut self, pos: usize) -> SyncResult<()>;
    fn push(&mut self, value: &Value) -> SyncResult<()>;
}

/// Identity-preserving operations of a movable list.
pub trait MovableOps: ListOps {
    /// Replace the element at `pos` in place.
    fn set(&mut self, pos: usize, value: &Value) -> SyncResult<()>;
    /// Move the element at `from` so that it ends up at index `to`.
    fn mov(&mut self, from: usize, to: usize) -> SyncResult<()>;
}

impl ListOps for LoroList {
    fn insert(&mut self, pos: usize, value: &Value) -> SyncResult<()> {
        LoroList::insert(self, pos, to_loro(value)).map_err(SyncError::crdt)
    }

    fn delete(&mut self, pos: usize) -> SyncResult<()> {
        LoroList::delete(self, pos, 1).map_err(SyncError::crdt)
    }

    fn push(&mut self, value: &Value) -> SyncResult<()> {
        LoroList::push(self, to_loro(value)).map_err(SyncError::crdt)
    }
}

impl ListOps for LoroMovableList {
    fn insert(&mut self, pos: usize, value: &Value) -> SyncResult<()> {
        LoroMovableList::insert(self, pos, to_loro(value)).map_err(SyncError::crdt)
    }

    fn delete(&mut self, pos: usize) -> SyncResult<()> {
        LoroMovableList::delete(self, pos, 1).map_err(SyncError::crdt)
    }

    fn push(&mut self, value: &Value) -> SyncResult<()> {
        LoroMovableList::push(self, to_loro(value)).map_err(SyncError::crdt)
    }
}

impl MovableOps for LoroMovableList {
    fn set(&mut self, pos: usize, value: &Value) -> SyncResult<()> {
        LoroMovableList::set(self, pos, to_loro(value)).map_err(SyncError::crdt)
    }

    fn mov(&mut self, from: usize, to: usize) -> SyncResult<()> {
        LoroMovableList::mov(self, from, to).map_err(SyncError::crdt)
    }
}

/// Operation counts of one reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub inserted: usize,
    pub deleted: usize,
    pub replaced: usize,
    pub moved: usize,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

/// Position-matched diff of a plain list: differing positions are replaced
/// by delete+insert, extra desired items are pushed, extra live items are
/// deleted from the tail.
pub fn reconcile_list<L: ListOps>(
    live: &[Value],
    desired: &[Value],
    target: &mut L,
) -> SyncResult<ReconcileReport> {
    let mut report = ReconcileReport::default();
    let common = live.len().min(desired.len());

    for i in 0..common {
        if live[i] != desired[i] {
            target.delete(i)?;
            target.insert(i, &desired[i])?;
            report.replaced += 1;
        }
    }
    for item in &desired[common..] {
        target.push(item)?;
        report.inserted += 1;
    }
    for i in (desired.len()..live.len()).rev() {
        target.delete(i)?;
        report.deleted += 1;
    }

    Ok(report)
}

/// Ordering key of an element: the designated field when it is a string,
/// otherwise the field's JSON text. Elements without the field have no key.
///
/// Keys compare by UTF-8 bytes, not by locale collation: `"B"` sorts before
/// `"a"`, and `"é"` after `"z"`. Every replica orders the same way.
pub fn sort_key(item: &Value, field: &str) -> Option<String> {
    match item.get(field)? {
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Reconcile a movable list that must hold one element per distinct key
/// in ascending key order.
///
/// Out-of-order elements are relocated with a single move each so their
/// identity survives concurrent remote edits. Duplicates and keyless
/// elements are deleted. Elements whose key is also desired but whose
/// content differs are replaced in place. Desired keys missing from the
/// list are inserted at their sorted position. Keys absent from `desired`
/// are left alone.
pub fn reconcile_sorted<L: MovableOps>(
    live: Vec<Value>,
    desired: &[Value],
    field: &str,
    target: &mut L,
) -> SyncResult<ReconcileReport> {
    let mut report = ReconcileReport::default();
    let mut mirror = live;

    // Pass 1: dedupe and order the live sequence.
    let mut i = 0;
    while i < mirror.len() {
        let Some(key) = sort_key(&mirror[i], field) else {
            log::warn!("Removing element without {field:?} from sorted list");
            target.delete(i)?;
            mirror.remove(i);
            report.deleted += 1;
            continue;
        };

        let mut furthest_smaller = None;
        let mut j = i + 1;
        while j < mirror.len() {
            match sort_key(&mirror[j], field).map(|other| key.cmp(&other)) {
                Some(Ordering::Equal) => {
                    target.delete(j)?;
                    mirror.remove(j);
                    report.deleted += 1;
                    continue;
                }
                Some(Ordering::Greater) => furthest_smaller = Some(j),
                _ => {}
            }
            j += 1;
        }

        match furthest_smaller {
            Some(to) => {
                target.mov(i, to)?;
                let item = mirror.remove(i);
                mirror.insert(to, item);
                report.moved += 1;
                // Whatever shifted into `i` has not been examined yet.
            }
            None => i += 1,
        }
    }

    // Pass 2: refresh content of keys present on both sides.
    let live_keys: Vec<Option<String>> = mirror.iter().map(|item| sort_key(item, field)).collect();
    let mut seen = HashSet::new();
    for item in desired {
        let Some(key) = sort_key(item, field) else {
            log::warn!("Skipping desired element without {field:?}");
            continue;
        };
        if !seen.insert(key.clone()) {
            continue;
        }
        if let Some(pos) = live_keys.iter().position(|k| k.as_deref() == Some(key.as_str())) {
            if mirror[pos] != *item {
                target.set(pos, item)?;
                mirror[pos] = item.clone();
                report.replaced += 1;
            }
        }
    }

    // Pass 3: insert missing keys at their sorted position.
    let mut present: HashSet<String> = live_keys.into_iter().flatten().collect();
    for item in desired {
        let Some(key) = sort_key(item, field) else {
            continue;
        };
        if present.contains(&key) {
            continue;
        }
        let pos = mirror.partition_point(|existing| {
            sort_key(existing, field).is_some_and(|k| k < key)
        });
        target.insert(pos, item)?;
        mirror.insert(pos, item.clone());
        present.insert(key);
        report.inserted += 1;
    }

    Ok(report)
}
