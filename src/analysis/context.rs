use crate::analysis::block::BlockPartitioning;
use crate::analysis::cache::{BlockCache, CacheKey};
use crate::analysis::error::{BamError, Result};
use crate::analysis::graph::{ExplorationGraph, NodeId};
use crate::analysis::option::AnalysisOption;
use crate::analysis::reached_set::{ReachedSet, ReachedSetId};
use crate::analysis::reducer::{AbstractState, Reducer};
use crate::analysis::shutdown::ShutdownFlag;
use crate::analysis::statistics::BlockCacheStatistics;
use log::{debug, trace};
use std::collections::{BTreeSet, HashMap};

/// The cache key type of a reducer
pub type Key<R> = CacheKey<<R as Reducer>::State, <R as Reducer>::Precision>;

/// Links graph nodes across block boundaries
#[derive(Clone, Debug, Default)]
pub struct ContextManager {
    // Caller-view node at a block return -> the reduced exit node it was expanded from
    expanded_to_reduced: HashMap<NodeId, NodeId>,
    // Caller-view call node -> the reached-set that explores the block from there.
    // Several call nodes may share one reached-set.
    entry_to_reached_set: HashMap<NodeId, ReachedSetId>,
}

impl ContextManager {
    pub fn link_expanded(&mut self, expanded: NodeId, reduced: NodeId) {
        self.expanded_to_reduced.insert(expanded, reduced);
    }

    pub fn link_entry(&mut self, entry: NodeId, reached_set: ReachedSetId) {
        self.entry_to_reached_set.insert(entry, reached_set);
    }

    pub fn reduced_of(&self, expanded: NodeId) -> Option<NodeId> {
        self.expanded_to_reduced.get(&expanded).copied()
    }

    pub fn reached_set_of_entry(&self, entry: NodeId) -> Option<ReachedSetId> {
        self.entry_to_reached_set.get(&entry).copied()
    }

    pub fn is_block_entry(&self, node: NodeId) -> bool {
        self.entry_to_reached_set.contains_key(&node)
    }

    /// Follow the expanded-to-reduced links from `node` down to the innermost block-local node
    pub fn most_inner_state(&self, node: NodeId) -> NodeId {
        let mut current = node;
        // Each link points to an older node, the bound only guards against corrupted maps
        for _ in 0..=self.expanded_to_reduced.len() {
            match self.expanded_to_reduced.get(&current) {
                Some(reduced) => current = *reduced,
                None => break,
            }
        }
        current
    }

    /// All call nodes that use `reached_set`
    pub fn entries_for(&self, reached_set: ReachedSetId) -> BTreeSet<NodeId> {
        self.entry_to_reached_set
            .iter()
            .filter(|(_, id)| **id == reached_set)
            .map(|(entry, _)| *entry)
            .collect()
    }

    /// `(expanded, reduced)` pairs
    pub fn expanded_links(&self) -> impl Iterator<Item = (NodeId, NodeId)> + '_ {
        self.expanded_to_reduced
            .iter()
            .map(|(expanded, reduced)| (*expanded, *reduced))
    }

    /// Forget the links that start or end at a destroyed node
    pub fn prune<F: Fn(NodeId) -> bool>(&mut self, is_destroyed: F) {
        self.expanded_to_reduced
            .retain(|expanded, reduced| !is_destroyed(*expanded) && !is_destroyed(*reduced));
        self.entry_to_reached_set
            .retain(|entry, _| !is_destroyed(*entry));
    }
}

/// The outcome of `GlobalContext::get_cached_or_compute`
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CacheLookup {
    /// The block was already explored from an equal entry
    Hit(ReachedSetId),
    /// A fresh reached-set was created, the caller has to explore it
    Miss(ReachedSetId),
}

impl CacheLookup {
    pub fn reached_set(&self) -> ReachedSetId {
        match self {
            CacheLookup::Hit(id) | CacheLookup::Miss(id) => *id,
        }
    }

    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit(_))
    }
}

// Stores everything one analysis run needs, it is discarded when the run ends
pub struct GlobalContext<R: Reducer> {
    // The blocks of the program
    pub partitioning: BlockPartitioning,
    // Supplied by the wrapped analysis
    pub reducer: R,
    // All nodes of all reached-sets
    pub graph: ExplorationGraph<R::State, R::Precision>,
    // Indexed by `ReachedSetId`, the top-level reached-set comes first
    pub reached_sets: Vec<ReachedSet>,
    // Stores the block results to avoid re-computation
    pub cache: BlockCache<R::State, R::Precision>,
    pub links: ContextManager,
    // Stores analysis options read from command line arguments
    pub analysis_option: AnalysisOption,
    pub statistics: BlockCacheStatistics,
    pub shutdown: ShutdownFlag,
}

impl<R: Reducer> GlobalContext<R> {
    pub fn new(
        partitioning: BlockPartitioning,
        reducer: R,
        init_state: R::State,
        init_precision: R::Precision,
        options: AnalysisOption,
    ) -> Self {
        let mut res = Self {
            partitioning,
            reducer,
            graph: ExplorationGraph::new(),
            reached_sets: Vec::new(),
            cache: BlockCache::new(options.aggressive_caching),
            links: ContextManager::default(),
            analysis_option: options,
            statistics: BlockCacheStatistics::default(),
            shutdown: ShutdownFlag::new(),
        };
        res.new_reached_set(init_state, init_precision);
        res
    }

    pub fn is_aggressive_caching(&self) -> bool {
        self.cache.does_aggressive_caching()
    }

    pub fn top_level(&self) -> &ReachedSet {
        &self.reached_sets[ReachedSetId::TOP_LEVEL.0]
    }

    pub fn reached_set(&self, id: ReachedSetId) -> Result<&ReachedSet> {
        self.reached_sets
            .get(id.0)
            .ok_or(BamError::UnknownReachedSet(id))
    }

    pub fn reached_set_mut(&mut self, id: ReachedSetId) -> Result<&mut ReachedSet> {
        self.reached_sets
            .get_mut(id.0)
            .ok_or(BamError::UnknownReachedSet(id))
    }

    /// Create a reached-set whose first node carries `state` and `precision`
    pub fn new_reached_set(&mut self, state: R::State, precision: R::Precision) -> ReachedSetId {
        let id = ReachedSetId(self.reached_sets.len());
        let first = self.graph.add_node(state, precision, id);
        self.reached_sets
            .push(ReachedSet::new(id, first, self.analysis_option.waitlist_order));
        id
    }

    /// Add a child of `parent` to the reached-set of `parent`, with the precision of `parent`
    pub fn add_successor(&mut self, parent: NodeId, state: R::State) -> Result<NodeId> {
        let node = self.add_child(parent, state)?;
        let id = self.graph.live_node(node)?.reached_set();
        self.reached_set_mut(id)?.add(node);
        Ok(node)
    }

    /// Add a child of `parent` that is covered by `cover` and therefore never explored
    pub fn add_covered_successor(
        &mut self,
        parent: NodeId,
        state: R::State,
        cover: NodeId,
    ) -> Result<NodeId> {
        let node = self.add_child(parent, state)?;
        self.graph.set_covered_by(node, cover)?;
        let id = self.graph.live_node(node)?.reached_set();
        self.reached_set_mut(id)?.add_without_waiting(node);
        Ok(node)
    }

    fn add_child(&mut self, parent: NodeId, state: R::State) -> Result<NodeId> {
        let parent_node = self.graph.live_node(parent)?;
        let precision = parent_node.precision().clone();
        let reached_set = parent_node.reached_set();
        let node = self.graph.add_node(state, precision, reached_set);
        self.graph.add_edge(parent, node)?;
        Ok(node)
    }

    /// The cache key of the block invocation at `node`, which must be at a call node.
    /// Destroyed nodes are allowed, a repair needs the keys of nodes it already removed.
    pub fn reduced_for(&self, node: NodeId) -> Result<Key<R>> {
        let graph_node = self.graph.node(node)?;
        let location = graph_node.state().location();
        let block = self.partitioning.block_for_call_node(location)?;
        let (state, precision) = self
            .reducer
            .reduce(graph_node.state(), graph_node.precision(), block);
        Ok(CacheKey::new(state, precision, location))
    }

    pub fn most_inner_state(&self, node: NodeId) -> NodeId {
        self.links.most_inner_state(node)
    }

    pub fn owner_reached_set(&self, entry: NodeId) -> Result<ReachedSetId> {
        self.links
            .reached_set_of_entry(entry)
            .ok_or(BamError::MissingReachedSet(entry))
    }

    /// The reached-set explored below `node`: the set owned by a call node, or the
    /// top-level reached-set for its first node
    pub fn reached_set_for(&self, node: NodeId) -> Result<ReachedSetId> {
        if node == self.top_level().first_node() {
            Ok(ReachedSetId::TOP_LEVEL)
        } else {
            self.owner_reached_set(node)
        }
    }

    /// Look up the block result for the call node `call_node`, or create a fresh
    /// reached-set for it. Either way the call node is linked to the result.
    pub fn get_cached_or_compute(&mut self, call_node: NodeId) -> Result<CacheLookup> {
        let key = self.reduced_for(call_node)?;

        if let Some(reached_set) = self.cache.lookup(&key) {
            debug!("Block result for {} is already in the cache", key.block);
            self.statistics.hits += 1;
            self.links.link_entry(call_node, reached_set);
            return Ok(CacheLookup::Hit(reached_set));
        }

        if let Some(reached_set) = self.cache.lookup_similar(&key) {
            debug!(
                "Block result for {} is in the cache with another precision",
                key.block
            );
            self.statistics.similar_hits += 1;
            self.links.link_entry(call_node, reached_set);
            return Ok(CacheLookup::Hit(reached_set));
        }

        self.statistics.misses += 1;
        let reached_set = self.new_reached_set(key.state.clone(), key.precision.clone());
        let first = self.reached_set(reached_set)?.first_node();
        trace!(
            "New {:?} for block {} with first node {:?}",
            reached_set,
            key.block,
            first
        );
        self.cache.insert(key.clone(), reached_set);
        self.cache.mark_precise(key.clone());
        self.cache.set_block_entry(key, first);
        self.links.link_entry(call_node, reached_set);
        Ok(CacheLookup::Miss(reached_set))
    }

    /// The key a reached-set was really explored for, built from its first node
    pub fn key_of(&self, reached_set: ReachedSetId) -> Result<Key<R>> {
        let first = self.graph.live_node(self.reached_set(reached_set)?.first_node())?;
        Ok(CacheKey::new(
            first.state().clone(),
            first.precision().clone(),
            first.state().location(),
        ))
    }

    /// The nodes of a block reached-set that leave the block: nodes at a return node
    /// of the block, and targets
    pub fn block_exits(&self, reached_set: ReachedSetId) -> Result<Vec<NodeId>> {
        let set = self.reached_set(reached_set)?;
        let first = set.first_node();
        let location = self.graph.live_node(first)?.state().location();
        let block = self.partitioning.block_for_call_node(location)?;

        let mut exits = vec![];
        for node in set.nodes() {
            if node == first {
                continue;
            }
            let state = self.graph.live_node(node)?.state();
            if block.is_return_node(state.location()) || state.is_target() {
                exits.push(node);
            }
        }
        Ok(exits)
    }

    /// Create the caller-view successors of `call_node` for every exit of `reached_set`
    /// that has not been expanded yet. Returns the new nodes.
    pub fn expand_block_exits(
        &mut self,
        call_node: NodeId,
        reached_set: ReachedSetId,
    ) -> Result<Vec<NodeId>> {
        let exits = self.block_exits(reached_set)?;
        let key = self.key_of(reached_set)?;

        let mut already_expanded = BTreeSet::new();
        for child in self.graph.live_node(call_node)?.children() {
            if let Some(reduced) = self.links.reduced_of(*child) {
                already_expanded.insert(reduced);
            }
        }

        let mut expanded = vec![];
        for exit in &exits {
            if already_expanded.contains(exit) {
                continue;
            }
            let caller = self.graph.live_node(call_node)?;
            let block = self.partitioning.block_for_call_node(caller.state().location())?;
            let state =
                self.reducer
                    .expand(caller.state(), block, self.graph.live_node(*exit)?.state());
            let node = self.add_successor(call_node, state)?;
            self.links.link_expanded(node, *exit);
            expanded.push(node);
        }
        trace!(
            "Expanded {} of {} exits of {:?} at {:?}",
            expanded.len(),
            exits.len(),
            reached_set,
            call_node
        );
        self.cache.set_return_entry(key, exits);
        Ok(expanded)
    }

    /// Verify that every cache entry agrees with the reached-set it stores
    pub fn check_consistency(&self) -> Result<()> {
        for (key, reached_set) in self.cache.entries() {
            let set = self.reached_set(reached_set)?;
            let first = self.graph.live_node(set.first_node())?;
            if *first.state() != key.state || *first.precision() != key.precision {
                return Err(BamError::KeyMismatch { block: key.block });
            }
            for node in set.nodes() {
                self.graph.live_node(node)?;
            }
            if let Some(exits) = self.cache.return_entry(key) {
                for exit in exits {
                    self.graph.live_node(*exit)?;
                    if !set.contains(*exit) {
                        return Err(BamError::NotInReachedSet {
                            node: *exit,
                            reached_set,
                        });
                    }
                }
            }
        }
        for (_, first) in self.cache.block_entries() {
            self.graph.live_node(first)?;
        }
        for id in self.top_level().nodes() {
            self.graph.live_node(id)?;
        }

        // A live expanded node comes from a live exit of the block its call node uses
        for (expanded, reduced) in self.links.expanded_links() {
            if self.graph.is_destroyed(expanded) {
                continue;
            }
            self.graph.live_node(reduced)?;
            let call = match self.graph.live_node(expanded)?.parents().iter().next() {
                Some(call) => *call,
                None => return Err(BamError::MissingReachedSet(expanded)),
            };
            let reached_set = self.owner_reached_set(call)?;
            if !self.reached_set(reached_set)?.contains(reduced) {
                return Err(BamError::NotInReachedSet {
                    node: reduced,
                    reached_set,
                });
            }
        }
        Ok(())
    }
}
