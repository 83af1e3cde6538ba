//! Structural diff/patch over JSON values.
//!
//! The engine produces [`Delta`]s that describe the difference between two
//! `serde_json::Value` trees and can be applied to a third tree that has
//! drifted from the diff base — the situation differential synchronization
//! is built around.
//!
//! ```text
//! diff(shadow, server_copy) ──► Delta ──► patch(client shadow)
//!                                   └───► patch(diverged server copy)
//! ```
//!
//! Array elements are matched by identity rather than index: an
//! `object_hash` hook keys each element (its `"id"` member if present, else
//! `"_id"`, else a canonical serialization), and array deltas are expressed
//! as remove/patch/move/insert operations against those keys. Patching a
//! target that gained elements concurrently leaves the extra elements in
//! place instead of clobbering the whole array.
//!
//! Reference: Fraser — Differential Synchronization, §7 (guaranteed delta)

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Hook mapping an array element to a stable identity key.
pub type ObjectHash = Arc<dyn Fn(&Value) -> String + Send + Sync>;

/// Engine configuration, supplied at construction.
#[derive(Clone)]
pub struct DiffOptions {
    /// Identity hook for array elements.
    pub object_hash: ObjectHash,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            object_hash: Arc::new(default_object_hash),
        }
    }
}

impl fmt::Debug for DiffOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiffOptions").finish_non_exhaustive()
    }
}

/// Default identity: `"id"` member, else `"_id"`, else the serialized value.
///
/// The prefixes keep id-derived keys from colliding with
/// serialization-derived keys of primitive elements.
fn default_object_hash(value: &Value) -> String {
    if let Value::Object(map) = value {
        if let Some(id) = map.get("id") {
            return format!("id:{id}");
        }
        if let Some(id) = map.get("_id") {
            return format!("id:{id}");
        }
    }
    format!("json:{value}")
}

/// Difference between two JSON values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Delta {
    /// The values are structurally equal.
    Unchanged,
    /// Set the target to the carried value (covers additions, replacements
    /// and type changes).
    Replace(Value),
    /// Delete the target; only meaningful inside an object delta.
    Remove,
    /// Per-key changes to an object. Keys absent from the map are untouched.
    Object(BTreeMap<String, Delta>),
    /// Keyed operations against an array.
    Array(ArrayDelta),
}

impl Delta {
    /// An empty delta means the compared values were equal.
    pub fn is_empty(&self) -> bool {
        matches!(self, Delta::Unchanged)
    }
}

/// Ordered operations transforming one array into another.
///
/// Operations are applied in sequence: removals, then element patches, then
/// moves, then insertions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArrayDelta {
    pub ops: Vec<ArrayOp>,
}

/// One array operation, keyed by element identity where possible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ArrayOp {
    /// Remove the first element matching `key`.
    Remove { key: String },
    /// Apply a nested delta to the first element matching `key`.
    Patch { key: String, delta: Delta },
    /// Move the element matching `key` to `index`.
    Move { key: String, index: usize },
    /// Insert `value` at `index` (clamped to the array length).
    Insert { index: usize, value: Value },
}

/// Diff/patch engine over JSON values.
pub struct DiffEngine {
    options: DiffOptions,
}

impl Default for DiffEngine {
    fn default() -> Self {
        Self::new(DiffOptions::default())
    }
}

impl DiffEngine {
    pub fn new(options: DiffOptions) -> Self {
        Self { options }
    }

    fn hash(&self, value: &Value) -> String {
        (self.options.object_hash)(value)
    }

    /// Compute the delta turning `a` into `b`.
    ///
    /// Guarantees `diff(a, a).is_empty()` and
    /// `patch(a.clone(), diff(a, b)) == b`.
    pub fn diff(&self, a: &Value, b: &Value) -> Delta {
        if a == b {
            return Delta::Unchanged;
        }
        match (a, b) {
            (Value::Object(ma), Value::Object(mb)) => {
                let mut changes = BTreeMap::new();
                for (key, va) in ma {
                    match mb.get(key) {
                        None => {
                            changes.insert(key.clone(), Delta::Remove);
                        }
                        Some(vb) => {
                            let nested = self.diff(va, vb);
                            if !nested.is_empty() {
                                changes.insert(key.clone(), nested);
                            }
                        }
                    }
                }
                for (key, vb) in mb {
                    if !ma.contains_key(key) {
                        changes.insert(key.clone(), Delta::Replace(vb.clone()));
                    }
                }
                Delta::Object(changes)
            }
            (Value::Array(xa), Value::Array(xb)) => self.diff_arrays(xa, xb),
            _ => Delta::Replace(b.clone()),
        }
    }

    fn diff_arrays(&self, a: &[Value], b: &[Value]) -> Delta {
        let keys_a: Vec<String> = a.iter().map(|v| self.hash(v)).collect();
        let keys_b: Vec<String> = b.iter().map(|v| self.hash(v)).collect();

        // Occurrence lists per key; duplicates are paired positionally.
        let mut occ_a: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (i, k) in keys_a.iter().enumerate() {
            occ_a.entry(k).or_default().push(i);
        }
        let mut occ_b: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (i, k) in keys_b.iter().enumerate() {
            occ_b.entry(k).or_default().push(i);
        }

        let mut removes = Vec::new();
        let mut patches = Vec::new();
        let mut inserts = Vec::new();
        // Paired elements surviving the diff, as (a_index, b_index).
        let mut paired: Vec<(usize, usize)> = Vec::new();

        for (key, a_idx) in &occ_a {
            let b_idx = occ_b.get(key).map(Vec::as_slice).unwrap_or(&[]);
            if a_idx.len() == 1 && b_idx.len() == 1 {
                let (ia, ib) = (a_idx[0], b_idx[0]);
                if a[ia] != b[ib] {
                    patches.push(ArrayOp::Patch {
                        key: key.to_string(),
                        delta: self.diff(&a[ia], &b[ib]),
                    });
                }
                paired.push((ia, ib));
                continue;
            }
            // Duplicated identity. Keep the occurrences only when they line
            // up exactly; a first-match Remove cannot tell diverging
            // duplicates apart, so anything else is replaced wholesale.
            let aligned = a_idx.len() == b_idx.len()
                && a_idx.iter().zip(b_idx).all(|(&ia, &ib)| a[ia] == b[ib]);
            if aligned {
                paired.extend(a_idx.iter().copied().zip(b_idx.iter().copied()));
            } else {
                for _ in a_idx {
                    removes.push(ArrayOp::Remove {
                        key: key.to_string(),
                    });
                }
                for &ib in b_idx {
                    inserts.push((ib, b[ib].clone()));
                }
            }
        }
        for (key, b_idx) in &occ_b {
            if !occ_a.contains_key(key) {
                for &ib in b_idx.iter() {
                    inserts.push((ib, b[ib].clone()));
                }
            }
        }

        // Reorder surviving elements to match b with selection-style moves.
        paired.sort_by_key(|&(ia, _)| ia);
        let mut current: Vec<usize> = paired.iter().map(|&(_, ib)| ib).collect();
        let mut target: Vec<usize> = current.clone();
        target.sort_unstable();
        let mut moves = Vec::new();
        for (pos, &ib) in target.iter().enumerate() {
            let at = current
                .iter()
                .position(|&x| x == ib)
                .expect("paired index present");
            if at != pos {
                current.remove(at);
                current.insert(pos, ib);
                moves.push(ArrayOp::Move {
                    key: keys_b[ib].clone(),
                    index: pos,
                });
            }
        }

        inserts.sort_by_key(|&(ib, _)| ib);
        let mut ops = removes;
        ops.extend(patches);
        ops.extend(moves);
        ops.extend(
            inserts
                .into_iter()
                .map(|(index, value)| ArrayOp::Insert { index, value }),
        );
        Delta::Array(ArrayDelta { ops })
    }

    /// Apply `delta` to `target` in place.
    ///
    /// The delta is never mutated; inserted values are cloned out of it, so
    /// one delta can safely be applied to several targets. On a target that
    /// has diverged from the diff base, operations whose anchor no longer
    /// exists are skipped rather than applied blindly.
    pub fn patch(&self, target: &mut Value, delta: &Delta) {
        match delta {
            Delta::Unchanged => {}
            Delta::Replace(value) => *target = value.clone(),
            // Removal context belongs to the enclosing object; at the root
            // there is nothing to detach from.
            Delta::Remove => {}
            Delta::Object(changes) => {
                let Value::Object(map) = target else { return };
                for (key, nested) in changes {
                    match nested {
                        Delta::Remove => {
                            map.remove(key);
                        }
                        Delta::Replace(value) => {
                            map.insert(key.clone(), value.clone());
                        }
                        other => {
                            if let Some(slot) = map.get_mut(key) {
                                self.patch(slot, other);
                            }
                        }
                    }
                }
            }
            Delta::Array(array_delta) => self.patch_array(target, array_delta),
        }
    }

    fn patch_array(&self, target: &mut Value, delta: &ArrayDelta) {
        let Value::Array(items) = target else { return };
        for op in &delta.ops {
            match op {
                ArrayOp::Remove { key } => {
                    if let Some(pos) = items.iter().position(|v| self.hash(v) == *key) {
                        items.remove(pos);
                    }
                }
                ArrayOp::Patch { key, delta } => {
                    if let Some(item) = items.iter_mut().find(|v| self.hash(v) == *key) {
                        self.patch(item, delta);
                    }
                }
                ArrayOp::Move { key, index } => {
                    if let Some(pos) = items.iter().position(|v| self.hash(v) == *key) {
                        let value = items.remove(pos);
                        let index = (*index).min(items.len());
                        items.insert(index, value);
                    }
                }
                ArrayOp::Insert { index, value } => {
                    let index = (*index).min(items.len());
                    items.insert(index, value.clone());
                }
            }
        }
    }
}
