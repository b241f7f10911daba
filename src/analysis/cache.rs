use crate::analysis::block::Location;
use crate::analysis::graph::NodeId;
use crate::analysis::reached_set::ReachedSetId;
use log::{debug, trace};
use std::collections::{HashMap, HashSet};
use std::hash::Hash;

/// A key is the reduced entry state, the reduced precision and the block (given by its call node)
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct CacheKey<S, P> {
    pub state: S,
    pub precision: P,
    pub block: Location,
}

impl<S, P> CacheKey<S, P> {
    pub fn new(state: S, precision: P, block: Location) -> Self {
        Self {
            state,
            precision,
            block,
        }
    }
}

/// Store the block analyses that have been computed.
/// Given a `CacheKey`, it returns the reached-set that explores the block from that entry.
///
/// Besides the memo itself, two derived lookups are kept per key: the "block entry"
/// (the first node of the reached-set) and the "block return" (the reduced exit nodes
/// found so far). The cache never touches graph nodes.
pub struct BlockCache<S, P> {
    aggressive_caching: bool,
    reached: HashMap<CacheKey<S, P>, ReachedSetId>,
    // Associations made by aggressive caching: key -> reached-set computed for another precision
    imprecise: HashMap<CacheKey<S, P>, ReachedSetId>,
    precise_keys: HashSet<CacheKey<S, P>>,
    block_entries: HashMap<CacheKey<S, P>, NodeId>,
    return_entries: HashMap<CacheKey<S, P>, Vec<NodeId>>,
}

impl<S, P> BlockCache<S, P>
where
    S: Clone + Eq + Hash,
    P: Clone + Eq + Hash,
{
    pub fn new(aggressive_caching: bool) -> Self {
        Self {
            aggressive_caching,
            reached: HashMap::new(),
            imprecise: HashMap::new(),
            precise_keys: HashSet::new(),
            block_entries: HashMap::new(),
            return_entries: HashMap::new(),
        }
    }

    pub fn does_aggressive_caching(&self) -> bool {
        self.aggressive_caching
    }

    /// Exact lookup, no subsumption
    pub fn lookup(&self, key: &CacheKey<S, P>) -> Option<ReachedSetId> {
        self.reached.get(key).copied()
    }

    /// Look for a reached-set computed for the same reduced state and block, but another precision.
    /// Only used with aggressive caching; precise keys are never substituted.
    pub fn lookup_similar(&mut self, key: &CacheKey<S, P>) -> Option<ReachedSetId> {
        if !self.aggressive_caching || self.precise_keys.contains(key) {
            return None;
        }
        if let Some(reached_set) = self.imprecise.get(key) {
            return Some(*reached_set);
        }
        // The oldest matching entry wins, so that the choice is deterministic
        let similar = self
            .reached
            .iter()
            .filter(|(other, _)| other.block == key.block && other.state == key.state)
            .map(|(_, reached_set)| *reached_set)
            .min()?;
        trace!("Using {:?} as imprecise entry for block {}", similar, key.block);
        self.imprecise.insert(key.clone(), similar);
        Some(similar)
    }

    pub fn insert(&mut self, key: CacheKey<S, P>, reached_set: ReachedSetId) {
        self.imprecise.remove(&key);
        if let Some(old) = self.reached.insert(key, reached_set) {
            if old != reached_set {
                debug!("Replacing cached {:?} with {:?}", old, reached_set);
            }
        }
    }

    /// Mark `key` as exact: aggressive caching will never substitute another entry for it
    pub fn mark_precise(&mut self, key: CacheKey<S, P>) {
        self.imprecise.remove(&key);
        self.precise_keys.insert(key);
    }

    pub fn contains_precise(&self, key: &CacheKey<S, P>) -> bool {
        self.precise_keys.contains(key)
    }

    /// Drop everything stored for `key`. The reached-set itself is left alone.
    pub fn remove_entry(&mut self, key: &CacheKey<S, P>) -> Option<ReachedSetId> {
        self.imprecise.remove(key);
        self.precise_keys.remove(key);
        self.block_entries.remove(key);
        self.return_entries.remove(key);
        self.reached.remove(key)
    }

    pub fn set_block_entry(&mut self, key: CacheKey<S, P>, first: NodeId) {
        self.block_entries.insert(key, first);
    }

    pub fn block_entry(&self, key: &CacheKey<S, P>) -> Option<NodeId> {
        self.block_entries.get(key).copied()
    }

    pub fn remove_block_entry(&mut self, key: &CacheKey<S, P>) -> Option<NodeId> {
        self.block_entries.remove(key)
    }

    pub fn set_return_entry(&mut self, key: CacheKey<S, P>, exits: Vec<NodeId>) {
        self.return_entries.insert(key, exits);
    }

    pub fn return_entry(&self, key: &CacheKey<S, P>) -> Option<&[NodeId]> {
        self.return_entries.get(key).map(|exits| exits.as_slice())
    }

    pub fn remove_return_entry(&mut self, key: &CacheKey<S, P>) -> Option<Vec<NodeId>> {
        self.return_entries.remove(key)
    }

    /// Move the reached-set stored under `old_key` to the key built from `new_precision`.
    /// Both the lookup and the precise marker move at once. Returns the new key, or `None`
    /// if `old_key` does not store `reached_set`.
    pub fn update_precision(
        &mut self,
        old_key: &CacheKey<S, P>,
        reached_set: ReachedSetId,
        new_precision: P,
    ) -> Option<CacheKey<S, P>> {
        if self.reached.get(old_key) != Some(&reached_set) {
            return None;
        }
        let was_precise = self.precise_keys.contains(old_key);
        let block_entry = self.block_entries.get(old_key).copied();
        self.remove_entry(old_key);

        let new_key = CacheKey::new(old_key.state.clone(), new_precision, old_key.block);
        self.insert(new_key.clone(), reached_set);
        if was_precise {
            self.mark_precise(new_key.clone());
        }
        if let Some(first) = block_entry {
            self.set_block_entry(new_key.clone(), first);
        }
        Some(new_key)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&CacheKey<S, P>, ReachedSetId)> {
        self.reached.iter().map(|(key, reached_set)| (key, *reached_set))
    }

    pub fn return_entries(&self) -> impl Iterator<Item = (&CacheKey<S, P>, &[NodeId])> {
        self.return_entries
            .iter()
            .map(|(key, exits)| (key, exits.as_slice()))
    }

    pub fn block_entries(&self) -> impl Iterator<Item = (&CacheKey<S, P>, NodeId)> {
        self.block_entries.iter().map(|(key, first)| (key, *first))
    }

    pub fn len(&self) -> usize {
        self.reached.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reached.is_empty()
    }
}
