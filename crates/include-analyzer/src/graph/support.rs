//! Support records: which macro symbols a memoized node depends on.
//!
//! Every summary-graph node carries a support record, the set of symbols
//! whose redefinition would change the meaning of some computed include in
//! the node's dependency cone. Records merge at every graph edge, so sets
//! are interned into integer ids and pairwise unions are memoized; after the
//! first time, merging is a table lookup.

use std::collections::{HashMap, HashSet};

/// Id of an interned symbol set.
pub type SetId = u32;
/// Id of a support record in the per-generation arena.
pub type SupportRecordId = u32;

/// Interned symbol sets with memoized pairwise unions.
#[derive(Debug, Default)]
pub struct UnionCache {
    symbol_index: HashMap<String, u32>,
    symbol_names: Vec<String>,
    // sets[set_id] is a sorted, deduplicated member list.
    sets: Vec<Vec<u32>>,
    id_map: HashMap<Vec<u32>, SetId>,
    unions: HashMap<(SetId, SetId), SetId>,
}

impl UnionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn symbol_id(&mut self, symbol: &str) -> u32 {
        if let Some(&id) = self.symbol_index.get(symbol) {
            return id;
        }
        let id = self.symbol_names.len() as u32;
        self.symbol_index.insert(symbol.to_owned(), id);
        self.symbol_names.push(symbol.to_owned());
        id
    }

    pub fn lookup_symbol(&self, symbol: &str) -> Option<u32> {
        self.symbol_index.get(symbol).copied()
    }

    /// Memoize a member list and return its set id.
    pub fn set_id(&mut self, mut members: Vec<u32>) -> SetId {
        members.sort_unstable();
        members.dedup();
        if let Some(&id) = self.id_map.get(&members) {
            return id;
        }
        let id = self.sets.len() as SetId;
        self.id_map.insert(members.clone(), id);
        self.sets.push(members);
        id
    }

    pub fn empty_set(&mut self) -> SetId {
        self.set_id(Vec::new())
    }

    pub fn elements(&self, set_id: SetId) -> &[u32] {
        &self.sets[set_id as usize]
    }

    pub fn union(&mut self, a: SetId, b: SetId) -> SetId {
        if let Some(&id) = self.unions.get(&(a, b)) {
            return id;
        }
        let mut members = self.sets[a as usize].clone();
        members.extend_from_slice(&self.sets[b as usize]);
        let id = self.set_id(members);
        self.unions.insert((a, b), id);
        id
    }
}

#[derive(Debug)]
struct SupportRecordData {
    support_id: SetId,
    valid: bool,
}

/// The record arena plus the inverse mapping from symbols to the records
/// containing them. When a symbol is (re)defined, every record containing it
/// flips to invalid, which invalidates the memoized nodes downstream.
#[derive(Debug, Default)]
pub struct Support {
    pub union_cache: UnionCache,
    records: Vec<SupportRecordData>,
    symbol_to_records: HashMap<u32, HashSet<SupportRecordId>>,
}

impl Support {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh, valid record with empty support.
    pub fn new_record(&mut self) -> SupportRecordId {
        let support_id = self.union_cache.empty_set();
        let id = self.records.len() as SupportRecordId;
        self.records.push(SupportRecordData {
            support_id,
            valid: true,
        });
        id
    }

    pub fn is_valid(&self, record: SupportRecordId) -> bool {
        self.records[record as usize].valid
    }

    pub fn set_valid(&mut self, record: SupportRecordId, valid: bool) {
        self.records[record as usize].valid = valid;
    }

    pub fn support_id(&self, record: SupportRecordId) -> SetId {
        self.records[record as usize].support_id
    }

    /// Augment `record` with the set `set_id`; reverse dependencies are
    /// registered for the delta set only when the union actually grows.
    pub fn update(&mut self, record: SupportRecordId, set_id: SetId) {
        let current = self.records[record as usize].support_id;
        let union_id = self.union_cache.union(current, set_id);
        if union_id != current {
            for &symbol in self.union_cache.elements(set_id) {
                self.symbol_to_records.entry(symbol).or_default().insert(record);
            }
            self.records[record as usize].support_id = union_id;
        }
    }

    /// Augment `record` with a set of symbol names.
    pub fn update_with_symbols<I, S>(&mut self, record: SupportRecordId, symbols: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let members: Vec<u32> = symbols
            .into_iter()
            .map(|s| self.union_cache.symbol_id(s.as_ref()))
            .collect();
        let set_id = self.union_cache.set_id(members);
        self.update(record, set_id);
    }

    /// Mark as invalid every record whose support set contains `symbol`.
    pub fn invalidate(&mut self, symbol: &str) {
        let Some(id) = self.union_cache.lookup_symbol(symbol) else {
            return;
        };
        if let Some(records) = self.symbol_to_records.get(&id) {
            for &record in records {
                self.records[record as usize].valid = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_is_memoized_and_order_insensitive() {
        let mut cache = UnionCache::new();
        let a = cache.symbol_id("A");
        let b = cache.symbol_id("B");
        let sa = cache.set_id(vec![a]);
        let sb = cache.set_id(vec![b]);
        let sab = cache.union(sa, sb);
        let sab2 = cache.union(sa, sb);
        assert_eq!(sab, sab2);
        // {A} ∪ {B} and {B, A} intern to the same set.
        assert_eq!(cache.set_id(vec![b, a]), sab);
        assert_eq!(cache.elements(sab), &[a, b]);
    }

    #[test]
    fn empty_union_is_identity() {
        let mut cache = UnionCache::new();
        let a = cache.symbol_id("A");
        let sa = cache.set_id(vec![a]);
        let empty = cache.empty_set();
        assert_eq!(cache.union(sa, empty), sa);
    }

    #[test]
    fn define_invalidates_containing_records() {
        let mut support = Support::new();
        let with_hdr = support.new_record();
        let without = support.new_record();
        support.update_with_symbols(with_hdr, ["HDR"]);
        support.update_with_symbols(without, ["OTHER"]);

        support.invalidate("HDR");
        assert!(!support.is_valid(with_hdr));
        assert!(support.is_valid(without));

        // Unknown symbols invalidate nothing.
        support.invalidate("NEVER_SEEN");
        assert!(support.is_valid(without));
    }

    #[test]
    fn update_propagates_through_unions() {
        let mut support = Support::new();
        let child = support.new_record();
        support.update_with_symbols(child, ["X"]);
        let parent = support.new_record();
        let child_set = support.support_id(child);
        support.update(parent, child_set);

        support.invalidate("X");
        assert!(!support.is_valid(child));
        assert!(!support.is_valid(parent));

        // Revalidated records become invalid again on the next redefinition.
        support.set_valid(parent, true);
        support.invalidate("X");
        assert!(!support.is_valid(parent));
    }
}
