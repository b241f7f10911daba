use crate::analysis::cache::CacheKey;
use crate::analysis::context::{GlobalContext, Key};
use crate::analysis::error::{BamError, Result};
use crate::analysis::graph::NodeId;
use crate::analysis::reached_set::{remove_subtree, PrecisionAdjustment, ReachedSetId};
use crate::analysis::reducer::{AbstractState, PrecisionIncrement, Reducer};
use log::{debug, info, trace};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Instant;

/// An element of a counterexample path. Several elements may stand for the same graph
/// node, e.g., when a block result is used at two call sites on the path.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PathElement(pub usize);

impl fmt::Debug for PathElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// A path from the top-level root to a target, with the graph node behind every element
#[derive(Clone, Debug)]
pub struct CounterexamplePath {
    states: Vec<PathElement>,
    reached: HashMap<PathElement, NodeId>,
}

impl CounterexamplePath {
    /// Element `i` stands for `nodes[i]`
    pub fn new(nodes: Vec<NodeId>) -> Self {
        let states = (0..nodes.len()).map(PathElement).collect::<Vec<_>>();
        let reached = states.iter().copied().zip(nodes).collect();
        Self { states, reached }
    }

    /// Build the path that leads to `target` through the graph of `context`.
    ///
    /// Inside a reached-set the path follows the first parent of each node. A node that
    /// was expanded from a block exit is preceded by the path through the block, without
    /// the block's first node (the call node stands for it) and without the exit itself.
    pub fn from_target<R: Reducer>(context: &GlobalContext<R>, target: NodeId) -> Result<Self> {
        Ok(Self::new(Self::flatten(context, target)?))
    }

    fn flatten<R: Reducer>(context: &GlobalContext<R>, node: NodeId) -> Result<Vec<NodeId>> {
        let mut chain = vec![node];
        let mut current = node;
        while let Some(parent) = context.graph.live_node(current)?.parents().iter().next() {
            current = *parent;
            chain.push(current);
            if chain.len() > context.graph.live_count() {
                return Err(BamError::MalformedPath(format!(
                    "parents of {:?} form a cycle",
                    node
                )));
            }
        }
        chain.reverse();

        let mut res = vec![];
        for node in chain {
            if let Some(reduced) = context.links.reduced_of(node) {
                let inner = Self::flatten(context, reduced)?;
                if inner.len() > 2 {
                    res.extend_from_slice(&inner[1..inner.len() - 1]);
                }
            }
            res.push(node);
        }
        Ok(res)
    }

    pub fn elements(&self) -> &[PathElement] {
        &self.states
    }

    pub fn first(&self) -> Result<PathElement> {
        self.states
            .first()
            .copied()
            .ok_or_else(|| BamError::MalformedPath("empty path".to_string()))
    }

    pub fn last(&self) -> Result<PathElement> {
        self.states
            .last()
            .copied()
            .ok_or_else(|| BamError::MalformedPath("empty path".to_string()))
    }

    pub fn position(&self, element: PathElement) -> Option<usize> {
        self.states.iter().position(|state| *state == element)
    }

    pub fn reached_node(&self, element: PathElement) -> Result<NodeId> {
        self.reached.get(&element).copied().ok_or_else(|| {
            BamError::MalformedPath(format!("{:?} has no reached node", element))
        })
    }
}

/// What a repair did, mainly for tests and logging
#[derive(Clone, Debug)]
pub struct RepairReport<S, P> {
    // Reached nodes of the block entries that are open at the target, outermost first
    pub relevant_calls: Vec<NodeId>,
    // Every subtree removal that was performed, in order
    pub removals: Vec<(ReachedSetId, NodeId)>,
    // Removals skipped because an earlier one destroyed the node
    pub skipped: usize,
    pub invalidated: Vec<CacheKey<S, P>>,
    // New keys of reached-sets whose first node got a new precision
    pub rekeyed: Vec<CacheKey<S, P>>,
    // Fresh precise entries created by aggressive caching
    pub exact_entries: Vec<CacheKey<S, P>>,
    // Caller-side nodes that were expanded from a removed block exit
    pub stale_expansions: Vec<(ReachedSetId, NodeId)>,
}

impl<S, P> Default for RepairReport<S, P> {
    fn default() -> Self {
        Self {
            relevant_calls: Vec::new(),
            removals: Vec::new(),
            skipped: 0,
            invalidated: Vec::new(),
            rekeyed: Vec::new(),
            exact_entries: Vec::new(),
            stale_expansions: Vec::new(),
        }
    }
}

pub type Report<R> = RepairReport<<R as Reducer>::State, <R as Reducer>::Precision>;

// One call on the path whose block is checked for exact cache hits
struct ExactHitFrame {
    root: PathElement,
    // The block result of the call already uses the new precision
    is_new_precision_entry: bool,
    found_inner_unprecise: bool,
    // The call is also a return of the enclosing block
    closes_parent: bool,
}

/// Removes the part of the exploration below a refined node, together with every
/// block result that led there
pub struct SubtreeRemover<'a, R: Reducer> {
    context: &'a mut GlobalContext<R>,
}

impl<'a, R: Reducer> SubtreeRemover<'a, R> {
    pub fn new(context: &'a mut GlobalContext<R>) -> Self {
        Self { context }
    }

    /// Remove `target` (an element of `path`) and everything explored after it.
    ///
    /// All block reached-sets that are open at `target` lose the subtree that leads to
    /// it, their cache entries are invalidated, and the innermost one is re-explored
    /// with `increments` applied. A target that was already removed is ignored.
    pub fn repair_path(
        &mut self,
        path: &CounterexamplePath,
        target: PathElement,
        increments: &[PrecisionIncrement<R::Precision>],
    ) -> Result<Report<R>> {
        let start = Instant::now();
        let res = self.repair(path, target, increments);
        self.context.statistics.repair_time += start.elapsed();
        self.context.statistics.repairs += 1;
        // Links of destroyed nodes are only needed while repairing
        let graph = &self.context.graph;
        self.context.links.prune(|node| graph.is_destroyed(node));
        res
    }

    fn repair(
        &mut self,
        path: &CounterexamplePath,
        target: PathElement,
        increments: &[PrecisionIncrement<R::Precision>],
    ) -> Result<Report<R>> {
        let mut report = Report::<R>::default();
        let target_node = self.reached_state(path, target)?;
        if self.context.graph.is_destroyed(target_node) {
            info!("{:?} was already removed, nothing to repair", target_node);
            return Ok(report);
        }

        let relevant_calls = self.relevant_calls(path, target)?;
        let mut pairs: Vec<(NodeId, NodeId)> = vec![];
        for window in relevant_calls.windows(2) {
            let pair = (
                self.call_state(path, window[0])?,
                self.call_state(path, window[1])?,
            );
            schedule(&mut pairs, pair);
        }
        for call in &relevant_calls {
            report.relevant_calls.push(self.call_state(path, *call)?);
        }

        if self.context.is_aggressive_caching() {
            self.ensure_exact_cache_hits(path, target, increments, &mut pairs, &mut report)?;
        }

        let last_relevant = match report.relevant_calls.last() {
            Some(node) => *node,
            None => return Err(BamError::MalformedPath("no open block".to_string())),
        };
        let target_parents = self.context.graph.node(target_node)?.parents().clone();
        for (outer, inner) in pairs {
            self.context.shutdown.check()?;
            // The new precision is only needed where the target hangs below the block entry
            let refines_here = inner == last_relevant
                || match self.context.links.reached_set_of_entry(inner) {
                    Some(id) => target_parents.contains(&self.context.reached_set(id)?.first_node()),
                    None => false,
                };
            let pair_increments: &[_] = if refines_here { increments } else { &[] };
            self.remove_cached_subtree(outer, inner, pair_increments, &mut report)?;
        }

        self.context.shutdown.check()?;
        self.remove_cached_subtree(last_relevant, target_node, increments, &mut report)?;

        // The top-level reached-set only keeps what is not below the target
        let last = path.reached_node(path.last()?)?;
        if !self.context.graph.is_destroyed(last) {
            let context = &mut *self.context;
            let top = context
                .reached_sets
                .get_mut(ReachedSetId::TOP_LEVEL.0)
                .ok_or(BamError::UnknownReachedSet(ReachedSetId::TOP_LEVEL))?;
            remove_subtree(&mut context.graph, top, last, &PrecisionAdjustment::Keep)?;
            report.removals.push((ReachedSetId::TOP_LEVEL, last));
        }

        debug!(
            "Repair removed {} subtrees and invalidated {} cache entries",
            report.removals.len(),
            report.invalidated.len()
        );
        Ok(report)
    }

    /// The path elements of the block entries that are open at `target`, outermost
    /// first. The root of the path is always open.
    pub fn relevant_calls(
        &self,
        path: &CounterexamplePath,
        target: PathElement,
    ) -> Result<Vec<PathElement>> {
        let mut open_calls = vec![path.first()?];
        for element in path.elements() {
            let state = path.reached_node(*element)?;

            if *element == target {
                // The target is neither left nor entered
                break;
            }

            // Several blocks can be left at once, only the number of exits matters here
            let mut current = state;
            while let Some(reduced) = self.context.links.reduced_of(current) {
                current = reduced;
                if open_calls.len() <= 1 {
                    return Err(BamError::MalformedPath(format!(
                        "{:?} leaves a block that was never entered",
                        element
                    )));
                }
                open_calls.pop();
            }

            if self.context.links.is_block_entry(state) {
                open_calls.push(*element);
            }
        }
        Ok(open_calls)
    }

    fn reached_state(&self, path: &CounterexamplePath, element: PathElement) -> Result<NodeId> {
        Ok(self.context.most_inner_state(path.reached_node(element)?))
    }

    // A call right after a block return is an expanded node and a block entry at once
    fn call_state(&self, path: &CounterexamplePath, element: PathElement) -> Result<NodeId> {
        let node = path.reached_node(element)?;
        if self.context.links.is_block_entry(node) {
            Ok(node)
        } else {
            Ok(self.context.most_inner_state(node))
        }
    }

    /// Follow the expanded-to-reduced links from `node` to the node that belongs to
    /// `reached_set`, or return `node` if there is none
    fn node_in(&self, reached_set: ReachedSetId, node: NodeId) -> Result<NodeId> {
        let mut current = node;
        while self.context.graph.node(current)?.reached_set() != reached_set {
            match self.context.links.reduced_of(current) {
                Some(reduced) => current = reduced,
                None => return Ok(node),
            }
        }
        Ok(current)
    }

    /// Remove `remove` from the reached-set below `outer` and drop the cache entries of that set
    fn remove_cached_subtree(
        &mut self,
        outer: NodeId,
        remove: NodeId,
        increments: &[PrecisionIncrement<R::Precision>],
        report: &mut Report<R>,
    ) -> Result<()> {
        let reached_set = self.context.reached_set_for(outer)?;
        let remove = self.node_in(reached_set, remove)?;
        if self.context.graph.is_destroyed(remove) {
            trace!("{:?} was destroyed by an earlier removal", remove);
            report.skipped += 1;
            return Ok(());
        }

        let first = self.context.reached_set(reached_set)?.first_node();
        // The key the reached-set is stored under. The top-level reached-set has none.
        let key = if reached_set == ReachedSetId::TOP_LEVEL {
            None
        } else {
            let mut key = self.context.reduced_for(outer)?;
            key.precision = self.context.graph.live_node(first)?.precision().clone();
            Some(key)
        };
        debug!(
            "Removing {:?} from {:?} below {:?} with {} new precisions",
            remove,
            reached_set,
            outer,
            increments.len()
        );

        let adjustment = if increments.is_empty() {
            PrecisionAdjustment::Keep
        } else {
            let refined = PrecisionIncrement::apply_all(
                self.context.graph.live_node(remove)?.precision(),
                increments,
            );
            match &key {
                Some(key) => {
                    let block = self.context.partitioning.block_for_call_node(key.block)?;
                    PrecisionAdjustment::Replace(self.context.reducer.reduce_precision(&refined, block))
                }
                None => PrecisionAdjustment::Replace(refined),
            }
        };

        if let Some(key) = &key {
            self.context.cache.remove_return_entry(key);
            self.context.cache.remove_block_entry(key);
            self.context.statistics.recomputes += 1;
            report.invalidated.push(key.clone());
        }

        let context = &mut *self.context;
        let set = context
            .reached_sets
            .get_mut(reached_set.0)
            .ok_or(BamError::UnknownReachedSet(reached_set))?;
        let first_changed = remove_subtree(&mut context.graph, set, remove, &adjustment)?;
        report.removals.push((reached_set, remove));
        context.statistics.pair_removals += 1;

        if let (true, Some(key)) = (first_changed, key) {
            let new_precision = context.graph.live_node(first)?.precision().clone();
            let new_key = CacheKey::new(key.state.clone(), new_precision.clone(), key.block);
            match context.cache.lookup(&new_key) {
                // An exact entry for the new precision exists already and is kept
                Some(other) if other != reached_set => {
                    debug!(
                        "{:?} holds block {} with the new precision, {:?} leaves the cache",
                        other, key.block, reached_set
                    );
                    if context.cache.lookup(&key) == Some(reached_set) {
                        context.cache.remove_entry(&key);
                    }
                }
                _ => match context.cache.update_precision(&key, reached_set, new_precision) {
                    Some(new_key) => {
                        debug!("Cache entry for block {} has a new precision", key.block);
                        context.cache.set_block_entry(new_key.clone(), first);
                        report.rekeyed.push(new_key);
                    }
                    None => {
                        debug!("{:?} is not cached under its own key", reached_set);
                    }
                },
            }
        }

        self.remove_stale_expansions(reached_set, report)
    }

    /// Remove the caller-side nodes that were expanded from block exits destroyed in
    /// `reached_set`. Their call nodes go back on the waitlist, so the block result is
    /// expanded again after it was re-explored. Callers inside other blocks lose exits
    /// of their own, so those blocks are checked in turn.
    fn remove_stale_expansions(
        &mut self,
        reached_set: ReachedSetId,
        report: &mut Report<R>,
    ) -> Result<()> {
        let mut worklist = vec![reached_set];
        while let Some(inner) = worklist.pop() {
            for entry in self.context.links.entries_for(inner) {
                if self.context.graph.is_destroyed(entry) {
                    continue;
                }
                let links = &self.context.links;
                let graph = &self.context.graph;
                let stale = graph
                    .live_node(entry)?
                    .children()
                    .iter()
                    .copied()
                    .filter(|child| links.reduced_of(*child).map_or(false, |exit| graph.is_destroyed(exit)))
                    .collect::<Vec<_>>();

                for expanded in stale {
                    if self.context.graph.is_destroyed(expanded) {
                        continue;
                    }
                    let owner = self.context.graph.live_node(expanded)?.reached_set();
                    debug!(
                        "{:?} in {:?} was expanded from a removed exit of {:?}",
                        expanded, owner, inner
                    );
                    if owner != ReachedSetId::TOP_LEVEL {
                        // The exits of the owner change as well
                        let key = self.context.key_of(owner)?;
                        self.context.cache.remove_return_entry(&key);
                    }
                    let context = &mut *self.context;
                    let set = context
                        .reached_sets
                        .get_mut(owner.0)
                        .ok_or(BamError::UnknownReachedSet(owner))?;
                    remove_subtree(&mut context.graph, set, expanded, &PrecisionAdjustment::Keep)?;
                    report.stale_expansions.push((owner, expanded));
                    if !worklist.contains(&owner) {
                        worklist.push(owner);
                    }
                }
            }
        }
        Ok(())
    }

    /// With aggressive caching, a block result may have been computed for another
    /// precision. Schedule the removal of every call on the rest of the path whose
    /// result does not match the precision the refinement induces.
    fn ensure_exact_cache_hits(
        &mut self,
        path: &CounterexamplePath,
        target: PathElement,
        increments: &[PrecisionIncrement<R::Precision>],
        pairs: &mut Vec<(NodeId, NodeId)>,
        report: &mut Report<R>,
    ) -> Result<()> {
        let (call_nodes, return_nodes) = self.call_and_return_nodes(path)?;
        let start = path.position(target).ok_or_else(|| {
            BamError::MalformedPath(format!("{:?} is not on the path", target))
        })?;

        let mut frames: Vec<ExactHitFrame> = vec![];
        for element in &path.elements()[start..] {
            self.context.shutdown.check()?;
            if call_nodes.contains(element) {
                let is_new_precision_entry = self.enter_exact_hit_frame(path, *element, increments, report)?;
                frames.push(ExactHitFrame {
                    root: *element,
                    is_new_precision_entry,
                    found_inner_unprecise: false,
                    closes_parent: !frames.is_empty() && return_nodes.contains(element),
                });
            } else if return_nodes.contains(element) && !frames.is_empty() {
                self.leave_exact_hit_frames(path, &mut frames, pairs, true)?;
            }
        }
        while !frames.is_empty() {
            self.leave_exact_hit_frames(path, &mut frames, pairs, false)?;
        }
        Ok(())
    }

    /// Classify the path elements into block calls and block returns
    fn call_and_return_nodes(
        &self,
        path: &CounterexamplePath,
    ) -> Result<(HashSet<PathElement>, HashSet<PathElement>)> {
        let mut call_nodes = HashSet::new();
        let mut return_nodes = HashSet::new();
        let mut open_blocks = vec![];

        for element in path.elements() {
            let node = self.reached_state(path, *element)?;
            let location = self.context.graph.node(node)?.state().location();

            // Returns first, a node can be a return and a call at once
            while let Some(block) = open_blocks.last() {
                if !self
                    .context
                    .partitioning
                    .block_for_call_node(*block)?
                    .is_return_node(location)
                {
                    break;
                }
                open_blocks.pop();
                return_nodes.insert(*element);
            }

            // The same block again is a loop block that is still open
            if self.context.partitioning.is_call_node(location)
                && open_blocks.last() != Some(&location)
            {
                open_blocks.push(location);
                call_nodes.insert(*element);
            }
        }
        Ok((call_nodes, return_nodes))
    }

    /// Make sure the cache has an exact entry for the call at `element` under the new
    /// precision. Returns whether the result used at `element` already has that precision.
    fn enter_exact_hit_frame(
        &mut self,
        path: &CounterexamplePath,
        element: PathElement,
        increments: &[PrecisionIncrement<R::Precision>],
        report: &mut Report<R>,
    ) -> Result<bool> {
        let node = self.call_state(path, element)?;
        let key = self.context.reduced_for(node)?;
        let refined =
            PrecisionIncrement::apply_all(self.context.graph.node(node)?.precision(), increments);
        let block = self.context.partitioning.block_for_call_node(key.block)?;
        let new_precision = self.context.reducer.reduce_precision(&refined, block);

        let inner = self.context.owner_reached_set(node)?;
        let inner_first = self.context.reached_set(inner)?.first_node();
        let used_precision = self.context.graph.live_node(inner_first)?.precision().clone();

        let new_key: Key<R> = CacheKey::new(key.state, new_precision, key.block);
        if !self.context.cache.contains_precise(&new_key) {
            let reached_set = self
                .context
                .new_reached_set(new_key.state.clone(), new_key.precision.clone());
            let first = self.context.reached_set(reached_set)?.first_node();
            trace!("New precise {:?} for block {}", reached_set, new_key.block);
            self.context.cache.insert(new_key.clone(), reached_set);
            self.context.cache.mark_precise(new_key.clone());
            self.context.cache.set_block_entry(new_key.clone(), first);
            self.context.statistics.recomputes += 1;
            report.exact_entries.push(new_key.clone());
        }

        Ok(used_precision == new_key.precision)
    }

    /// Leave the innermost frame; with `at_return`, also leave every enclosing frame
    /// that ends at the same element
    fn leave_exact_hit_frames(
        &self,
        path: &CounterexamplePath,
        frames: &mut Vec<ExactHitFrame>,
        pairs: &mut Vec<(NodeId, NodeId)>,
        at_return: bool,
    ) -> Result<()> {
        while let Some(frame) = frames.pop() {
            let unprecise = frame.found_inner_unprecise || !frame.is_new_precision_entry;
            if let Some(parent) = frames.last_mut() {
                // Only the first unprecise inner block of an exact block is removed,
                // the removal covers everything after it
                if unprecise && parent.is_new_precision_entry && !parent.found_inner_unprecise {
                    let pair = (
                        self.call_state(path, parent.root)?,
                        self.call_state(path, frame.root)?,
                    );
                    trace!("Scheduling removal of unprecise block entry {:?}", pair.1);
                    schedule(pairs, pair);
                    parent.found_inner_unprecise = true;
                }
            }
            if !(at_return && frame.closes_parent) {
                break;
            }
        }
        Ok(())
    }
}

fn schedule(pairs: &mut Vec<(NodeId, NodeId)>, pair: (NodeId, NodeId)) {
    if !pairs.contains(&pair) {
        pairs.push(pair);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::block::{Block, BlockPartitioning, Location};
    use crate::analysis::option::AnalysisOption;
    use crate::analysis::value_domain::{ValuePrecision, ValueReducer, ValueState};
    use proptest::prelude::*;

    fn new_context(
        blocks: Vec<Block>,
        variables: Vec<(Location, Vec<&'static str>)>,
        aggressive_caching: bool,
    ) -> GlobalContext<ValueReducer> {
        let options = AnalysisOption {
            aggressive_caching,
            ..Default::default()
        };
        GlobalContext::new(
            BlockPartitioning::new(blocks),
            ValueReducer::new(variables),
            ValueState::new(Location(0)).with_value("x", 0),
            ValuePrecision::tracking(&["x"]),
            options,
        )
    }

    fn block(call: u32, ret: u32) -> Block {
        Block::new(Location(call), vec![], vec![Location(ret)])
    }

    fn root(context: &GlobalContext<ValueReducer>) -> NodeId {
        context.top_level().first_node()
    }

    fn step(context: &mut GlobalContext<ValueReducer>, parent: NodeId, location: u32) -> NodeId {
        let state = context.graph.live_node(parent).unwrap().state().moved_to(Location(location));
        context.add_successor(parent, state).unwrap()
    }

    fn target(context: &mut GlobalContext<ValueReducer>, parent: NodeId, location: u32) -> NodeId {
        let state = context
            .graph
            .live_node(parent)
            .unwrap()
            .state()
            .moved_to(Location(location))
            .as_target();
        context.add_successor(parent, state).unwrap()
    }

    // Add a call node below `parent` and return it with the first node of its reached-set
    fn call(
        context: &mut GlobalContext<ValueReducer>,
        parent: NodeId,
        location: u32,
    ) -> (NodeId, NodeId) {
        let node = step(context, parent, location);
        let reached_set = context.get_cached_or_compute(node).unwrap().reached_set();
        (node, context.reached_set(reached_set).unwrap().first_node())
    }

    fn refine(vars: &[&str]) -> Vec<PrecisionIncrement<ValuePrecision>> {
        vec![PrecisionIncrement::new(ValuePrecision::tracking(vars), ())]
    }

    fn assert_removed_everywhere(context: &GlobalContext<ValueReducer>, node: NodeId) {
        assert!(context.graph.is_destroyed(node));
        for set in &context.reached_sets {
            assert!(!set.contains(node));
        }
    }

    #[test]
    fn test_flat_program_is_one_removal() {
        let mut context = new_context(vec![], vec![], false);
        let root = root(&context);
        let a = step(&mut context, root, 1);
        let b = step(&mut context, a, 2);
        let t = target(&mut context, b, 3);

        let path = CounterexamplePath::from_target(&context, t).unwrap();
        assert_eq!(path.elements().len(), 4);
        let report = SubtreeRemover::new(&mut context)
            .repair_path(&path, PathElement(2), &[])
            .unwrap();

        assert_eq!(report.relevant_calls, vec![root]);
        assert_eq!(report.removals, vec![(ReachedSetId::TOP_LEVEL, b)]);
        assert!(report.invalidated.is_empty());
        assert!(context.cache.is_empty());
        assert_removed_everywhere(&context, b);
        assert_removed_everywhere(&context, t);
        assert_eq!(context.top_level().waitlist().collect::<Vec<_>>(), vec![root, a]);
        assert_eq!(context.statistics.repairs, 1);
        assert_eq!(context.check_consistency(), Ok(()));
    }

    // main -> f -> g -> target, the target leaves both blocks
    fn nested_target(
        context: &mut GlobalContext<ValueReducer>,
    ) -> (Vec<NodeId>, NodeId, NodeId) {
        let root = root(context);
        let (call_f, f_first) = call(context, root, 10);
        let (call_g, g_first) = call(context, f_first, 20);
        let g1 = step(context, g_first, 21);
        let t = target(context, g1, 25);
        let f_set = context.owner_reached_set(call_f).unwrap();
        let g_set = context.owner_reached_set(call_g).unwrap();
        let expanded_in_f = context.expand_block_exits(call_g, g_set).unwrap();
        let expanded_in_main = context.expand_block_exits(call_f, f_set).unwrap();
        assert_eq!(expanded_in_f.len(), 1);
        assert_eq!(expanded_in_main.len(), 1);
        (vec![root, call_f, call_g, g1, t], expanded_in_f[0], expanded_in_main[0])
    }

    #[test]
    fn test_nested_target_invalidates_both_blocks() {
        let mut context = new_context(
            vec![block(10, 12), block(20, 22)],
            vec![(Location(10), vec!["x"]), (Location(20), vec!["x"])],
            false,
        );
        let (nodes, in_f, in_main) = nested_target(&mut context);
        let (root, call_f, call_g, g1, t) = (nodes[0], nodes[1], nodes[2], nodes[3], nodes[4]);
        let f_key = context.reduced_for(call_f).unwrap();
        let g_key = context.reduced_for(call_g).unwrap();

        let path = CounterexamplePath::from_target(&context, in_main).unwrap();
        let reached = path
            .elements()
            .iter()
            .map(|element| path.reached_node(*element).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(reached, vec![root, call_f, call_g, g1, in_main]);

        let report = SubtreeRemover::new(&mut context)
            .repair_path(&path, path.last().unwrap(), &refine(&["x", "y"]))
            .unwrap();

        assert_eq!(report.relevant_calls, vec![root, call_f, call_g]);
        let f_set = ReachedSetId(1);
        let g_set = ReachedSetId(2);
        assert_eq!(
            report.removals,
            vec![
                (ReachedSetId::TOP_LEVEL, call_f),
                (f_set, call_g),
                (g_set, t),
            ]
        );
        assert_eq!(report.invalidated, vec![f_key.clone(), g_key.clone()]);
        assert_eq!(report.skipped, 0);
        assert!(report.rekeyed.is_empty());

        for node in [call_f, call_g, t, in_f, in_main] {
            assert_removed_everywhere(&context, node);
        }
        assert_eq!(context.top_level().nodes().collect::<Vec<_>>(), vec![root]);
        // the results stay cached, only their exits are forgotten
        assert_eq!(context.cache.lookup(&f_key), Some(f_set));
        assert_eq!(context.cache.return_entry(&f_key), None);
        assert_eq!(context.cache.return_entry(&g_key), None);
        assert_eq!(context.statistics.recomputes, 2);
        assert_eq!(context.check_consistency(), Ok(()));
        assert!(!context.links.is_block_entry(call_f));
    }

    #[test]
    fn test_second_repair_is_a_no_op() {
        let mut context = new_context(
            vec![block(10, 12), block(20, 22)],
            vec![(Location(10), vec!["x"]), (Location(20), vec!["x"])],
            false,
        );
        let (_, _, in_main) = nested_target(&mut context);
        let path = CounterexamplePath::from_target(&context, in_main).unwrap();
        let target = path.last().unwrap();

        SubtreeRemover::new(&mut context)
            .repair_path(&path, target, &[])
            .unwrap();
        let live = context.graph.live_count();
        let report = SubtreeRemover::new(&mut context)
            .repair_path(&path, target, &[])
            .unwrap();

        assert!(report.removals.is_empty());
        assert!(report.invalidated.is_empty());
        assert_eq!(context.graph.live_count(), live);
        assert_eq!(context.statistics.repairs, 2);
        assert_eq!(context.check_consistency(), Ok(()));
    }

    #[test]
    fn test_new_precision_rekeys_the_block() {
        let mut context = new_context(
            vec![block(10, 12)],
            vec![(Location(10), vec!["x", "y"])],
            false,
        );
        let root = root(&context);
        let (call_f, f_first) = call(&mut context, root, 10);
        let t = target(&mut context, f_first, 13);
        let f_set = context.owner_reached_set(call_f).unwrap();
        let expanded = context.expand_block_exits(call_f, f_set).unwrap();
        let old_key = context.reduced_for(call_f).unwrap();

        let path = CounterexamplePath::from_target(&context, expanded[0]).unwrap();
        let report = SubtreeRemover::new(&mut context)
            .repair_path(&path, path.last().unwrap(), &refine(&["x", "y"]))
            .unwrap();

        assert_eq!(report.removals.last(), Some(&(f_set, t)));
        let new_key = CacheKey::new(
            old_key.state.clone(),
            ValuePrecision::tracking(&["x", "y"]),
            Location(10),
        );
        assert_ne!(new_key, old_key);
        assert_eq!(report.rekeyed, vec![new_key.clone()]);
        assert_eq!(context.cache.lookup(&old_key), None);
        assert_eq!(context.cache.lookup(&new_key), Some(f_set));
        assert!(context.cache.contains_precise(&new_key));
        assert_eq!(context.cache.block_entry(&new_key), Some(f_first));
        // the first node is explored again with the new precision
        let f = context.reached_set(f_set).unwrap();
        assert_eq!(f.waitlist().collect::<Vec<_>>(), vec![f_first]);
        assert_eq!(
            context.graph.live_node(f_first).unwrap().precision(),
            &ValuePrecision::tracking(&["x", "y"])
        );
        // main continues from the root with the refined precision
        assert_eq!(
            context.graph.live_node(root).unwrap().precision(),
            &ValuePrecision::tracking(&["x", "y"])
        );
        assert_eq!(context.check_consistency(), Ok(()));
    }

    #[test]
    fn test_rekey_keeps_existing_precise_entry() {
        let mut context = new_context(
            vec![block(10, 12)],
            vec![(Location(10), vec!["x", "y"])],
            false,
        );
        let root = root(&context);
        let (call_f, f_first) = call(&mut context, root, 10);
        target(&mut context, f_first, 13);
        let f_set = context.owner_reached_set(call_f).unwrap();
        let expanded = context.expand_block_exits(call_f, f_set).unwrap();
        let old_key = context.reduced_for(call_f).unwrap();
        let new_key = CacheKey::new(
            old_key.state.clone(),
            ValuePrecision::tracking(&["x", "y"]),
            Location(10),
        );
        // another caller already explored f with the refined precision
        let fresh = context.new_reached_set(new_key.state.clone(), new_key.precision.clone());
        context.cache.insert(new_key.clone(), fresh);
        context.cache.mark_precise(new_key.clone());

        let path = CounterexamplePath::from_target(&context, expanded[0]).unwrap();
        let report = SubtreeRemover::new(&mut context)
            .repair_path(&path, path.last().unwrap(), &refine(&["x", "y"]))
            .unwrap();

        assert!(report.rekeyed.is_empty());
        assert_eq!(context.cache.lookup(&new_key), Some(fresh));
        assert!(context.cache.contains_precise(&new_key));
        assert_eq!(context.cache.lookup(&old_key), None);
        assert_eq!(context.check_consistency(), Ok(()));
    }

    // main calls f at two sites that share one result, the target follows the first call
    #[test]
    fn test_shared_block_callers_are_expanded_again() {
        let mut context = new_context(vec![block(10, 12)], vec![(Location(10), vec!["x"])], false);
        let root = root(&context);
        let (c1, first) = call(&mut context, root, 10);
        let (c2, first_again) = call(&mut context, root, 10);
        assert_eq!(first, first_again);
        let shared = context.owner_reached_set(c1).unwrap();
        let m = step(&mut context, first, 11);
        let exit = step(&mut context, m, 12);
        let e1 = context.expand_block_exits(c1, shared).unwrap()[0];
        let e2 = context.expand_block_exits(c2, shared).unwrap()[0];
        let t = target(&mut context, e1, 13);

        let path = CounterexamplePath::from_target(&context, t).unwrap();
        let reached = path
            .elements()
            .iter()
            .map(|element| path.reached_node(*element).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(reached, vec![root, c1, m, e1, t]);
        let report = SubtreeRemover::new(&mut context)
            .repair_path(&path, PathElement(2), &refine(&["x", "y"]))
            .unwrap();

        assert_eq!(
            report.removals,
            vec![(ReachedSetId::TOP_LEVEL, c1), (shared, m)]
        );
        assert_eq!(report.stale_expansions, vec![(ReachedSetId::TOP_LEVEL, e2)]);
        assert_removed_everywhere(&context, exit);
        assert_removed_everywhere(&context, e2);
        assert_eq!(context.links.reduced_of(e2), None);
        assert!(!context.graph.is_destroyed(c2));
        assert!(context.top_level().waitlist().any(|node| node == c2));
        assert_eq!(context.check_consistency(), Ok(()));

        // the second caller picks up the re-explored block
        let m2 = step(&mut context, first, 11);
        step(&mut context, m2, 12);
        let again = context.expand_block_exits(c2, shared).unwrap();
        assert_eq!(again.len(), 1);
        let t2 = target(&mut context, again[0], 13);
        let path = CounterexamplePath::from_target(&context, t2).unwrap();
        let reached = path
            .elements()
            .iter()
            .map(|element| path.reached_node(*element).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(reached, vec![root, c2, m2, again[0], t2]);
        assert_eq!(context.check_consistency(), Ok(()));
    }

    #[test]
    fn test_recursive_block_skips_destroyed_node() {
        let mut context = new_context(vec![block(10, 12)], vec![(Location(10), vec!["x"])], false);
        let root = root(&context);
        let (c1, b0) = call(&mut context, root, 10);
        let b1 = step(&mut context, b0, 11);
        let (c2, b0_again) = call(&mut context, b1, 10);
        assert_eq!(b0, b0_again);
        let exit = step(&mut context, b0, 12);
        let b_set = context.owner_reached_set(c1).unwrap();
        let e2 = context.expand_block_exits(c2, b_set).unwrap()[0];
        let t = target(&mut context, e2, 13);
        assert_eq!(context.links.reduced_of(e2), Some(exit));
        assert_eq!(context.reduced_for(c1), context.reduced_for(c2));

        // the path runs through the block twice
        let path = CounterexamplePath::new(vec![root, c1, b1, c2, b1, c2, e2, t]);
        let report = SubtreeRemover::new(&mut context)
            .repair_path(&path, path.last().unwrap(), &[])
            .unwrap();

        assert_eq!(report.relevant_calls, vec![root, c1, c2]);
        assert_eq!(
            report.removals,
            vec![(ReachedSetId::TOP_LEVEL, c1), (b_set, c2)]
        );
        // the final removal found the target destroyed already
        assert_eq!(report.skipped, 1);
        assert_eq!(report.invalidated.len(), 1);
        assert_removed_everywhere(&context, t);
        assert!(!context.graph.is_destroyed(exit));
        assert_eq!(context.check_consistency(), Ok(()));
    }

    #[test]
    fn test_interrupted_repair_keeps_cache_consistent() {
        let mut context = new_context(
            vec![block(10, 12), block(20, 22)],
            vec![(Location(10), vec!["x"]), (Location(20), vec!["x"])],
            false,
        );
        let (_, _, in_main) = nested_target(&mut context);
        let path = CounterexamplePath::from_target(&context, in_main).unwrap();
        let live = context.graph.live_count();

        context.shutdown.request();
        let res = SubtreeRemover::new(&mut context).repair_path(&path, path.last().unwrap(), &[]);
        let err = res.map(|_| ()).unwrap_err();
        assert_eq!(err, BamError::Interrupted);
        assert!(!err.is_inconsistency());
        assert_eq!(context.graph.live_count(), live);
        assert_eq!(context.check_consistency(), Ok(()));
    }

    #[test]
    fn test_malformed_path() {
        let mut context = new_context(vec![], vec![], false);
        let path = CounterexamplePath::new(vec![]);
        let res = SubtreeRemover::new(&mut context).repair_path(&path, PathElement(0), &[]);
        assert!(matches!(res, Err(BamError::MalformedPath(_))));
    }

    // main calls f (uses x), f calls g (uses x and y); the refinement happens in main
    fn aggressive_setup(aggressive_caching: bool) -> (GlobalContext<ValueReducer>, Vec<NodeId>) {
        let mut context = new_context(
            vec![block(10, 12), block(20, 22)],
            vec![(Location(10), vec!["x"]), (Location(20), vec!["x", "y"])],
            aggressive_caching,
        );
        let root = root(&context);
        let a = step(&mut context, root, 1);
        let (call_f, f_first) = call(&mut context, a, 10);
        let (call_g, g_first) = call(&mut context, f_first, 20);
        let g1 = step(&mut context, g_first, 21);
        target(&mut context, g1, 23);
        let f_set = context.owner_reached_set(call_f).unwrap();
        let g_set = context.owner_reached_set(call_g).unwrap();
        context.expand_block_exits(call_g, g_set).unwrap();
        let in_main = context.expand_block_exits(call_f, f_set).unwrap()[0];
        (context, vec![root, a, call_f, call_g, in_main])
    }

    #[test]
    fn test_aggressive_caching_enforces_exact_entries() {
        let (mut context, nodes) = aggressive_setup(true);
        let (a, call_f, call_g, in_main) = (nodes[1], nodes[2], nodes[3], nodes[4]);
        let path = CounterexamplePath::from_target(&context, in_main).unwrap();
        let g_state = context.reduced_for(call_g).unwrap().state;
        let old_g_key = context.reduced_for(call_g).unwrap();
        let f_set = context.owner_reached_set(call_f).unwrap();

        let report = SubtreeRemover::new(&mut context)
            .repair_path(&path, PathElement(1), &refine(&["x", "y"]))
            .unwrap();

        // f already uses the new precision, g does not and must be recomputed
        let exact_g = CacheKey::new(g_state, ValuePrecision::tracking(&["x", "y"]), Location(20));
        assert_eq!(report.exact_entries, vec![exact_g.clone()]);
        assert!(context.cache.contains_precise(&exact_g));
        let fresh = context.cache.lookup(&exact_g).unwrap();
        assert_eq!(context.reached_set(fresh).unwrap().len(), 1);
        assert_eq!(
            report.removals,
            vec![(f_set, call_g), (ReachedSetId::TOP_LEVEL, a)]
        );
        // main had expanded the exit of f that came out of g
        assert_eq!(report.stale_expansions, vec![(ReachedSetId::TOP_LEVEL, in_main)]);
        // the old result of g stays valid for its own key
        assert!(context.cache.lookup(&old_g_key).is_some());
        assert_removed_everywhere(&context, in_main);
        assert_eq!(context.check_consistency(), Ok(()));
    }

    #[test]
    fn test_without_aggressive_caching_only_the_target_is_removed() {
        let (mut context, nodes) = aggressive_setup(false);
        let (a, in_main) = (nodes[1], nodes[4]);
        let path = CounterexamplePath::from_target(&context, in_main).unwrap();
        let entries = context.cache.len();

        let report = SubtreeRemover::new(&mut context)
            .repair_path(&path, PathElement(1), &refine(&["x", "y"]))
            .unwrap();

        assert!(report.exact_entries.is_empty());
        assert_eq!(report.removals, vec![(ReachedSetId::TOP_LEVEL, a)]);
        assert_eq!(context.cache.len(), entries);
        assert_eq!(context.check_consistency(), Ok(()));
    }

    // main calls a (10 to 30), then b right at the return of a (30 to 32)
    fn return_into_call(
        a_uses_y: bool,
        b_uses_y: bool,
    ) -> (GlobalContext<ValueReducer>, Vec<NodeId>) {
        let vars = |uses_y| if uses_y { vec!["x", "y"] } else { vec!["x"] };
        let mut context = new_context(
            vec![block(10, 30), block(30, 32)],
            vec![(Location(10), vars(a_uses_y)), (Location(30), vars(b_uses_y))],
            true,
        );
        let root = root(&context);
        let (call_a, a_first) = call(&mut context, root, 10);
        let a1 = step(&mut context, a_first, 20);
        let a_exit = step(&mut context, a1, 30);
        let a_set = context.owner_reached_set(call_a).unwrap();
        let call_b = context.expand_block_exits(call_a, a_set).unwrap()[0];
        let b_set = context.get_cached_or_compute(call_b).unwrap().reached_set();
        let b_first = context.reached_set(b_set).unwrap().first_node();
        let b1 = step(&mut context, b_first, 31);
        step(&mut context, b1, 32);
        let returned = context.expand_block_exits(call_b, b_set).unwrap()[0];
        let t = target(&mut context, returned, 33);
        (context, vec![root, call_a, a1, a_exit, call_b, b1, returned, t])
    }

    // `depth` nested calls, then a node that leaves `exits` blocks at once, then a target
    fn nested_exits(depth: usize, exits: usize) -> (GlobalContext<ValueReducer>, CounterexamplePath) {
        let blocks = (1..=depth as u32).map(|i| block(10 * i, 99)).collect();
        let mut context = new_context(blocks, vec![], false);
        let mut nodes = vec![root(&context)];
        let mut parent = nodes[0];
        for i in 1..=depth as u32 {
            let (call_node, first) = call(&mut context, parent, 10 * i);
            nodes.push(call_node);
            parent = first;
        }
        // a chain of reduced exits, one per block left
        let mut reduced = step(&mut context, parent, 99);
        for _ in 1..exits {
            let expanded = step(&mut context, reduced, 99);
            context.links.link_expanded(expanded, reduced);
            reduced = expanded;
        }
        let returned = step(&mut context, reduced, 99);
        if exits > 0 {
            context.links.link_expanded(returned, reduced);
        }
        nodes.push(returned);
        nodes.push(target(&mut context, returned, 100));
        (context, CounterexamplePath::new(nodes))
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Leaving several blocks at one location pops one open call per link hop,
        /// whichever block the hop belongs to
        #[test]
        fn open_calls_count_exits_at_one_location(
            (depth, exits) in (0usize..6).prop_flat_map(|depth| (Just(depth), 0..=depth))
        ) {
            let (mut context, path) = nested_exits(depth, exits);
            let remover = SubtreeRemover::new(&mut context);

            let after_return = remover.relevant_calls(&path, path.last().unwrap()).unwrap();
            prop_assert_eq!(after_return.len(), 1 + depth - exits);
            prop_assert_eq!(after_return[0], PathElement(0));
            // the open calls are the outermost ones
            for (i, element) in after_return.iter().enumerate() {
                prop_assert_eq!(*element, PathElement(i));
            }

            // at the returning node itself nothing is left yet
            let at_return = PathElement(depth + 1);
            let before = remover.relevant_calls(&path, at_return).unwrap();
            prop_assert_eq!(before.len(), 1 + depth);
        }

        /// Leaving more blocks than were entered would close the root
        #[test]
        fn exits_without_open_call_are_malformed(depth in 0usize..5, extra in 1usize..4) {
            let (mut context, path) = nested_exits(depth, depth + extra);
            let remover = SubtreeRemover::new(&mut context);

            let res = remover.relevant_calls(&path, path.last().unwrap());
            prop_assert!(matches!(res, Err(BamError::MalformedPath(_))));
            let res = SubtreeRemover::new(&mut context)
                .repair_path(&path, path.last().unwrap(), &[]);
            prop_assert!(matches!(res, Err(BamError::MalformedPath(_))));
        }

        /// A call at the return of another block closes both frames at the same element.
        /// Only an exact outer block with an unprecise inner block needs a removal, and
        /// that removal lands on the exit the inner call was expanded from.
        #[test]
        fn exact_hits_at_a_return_into_a_call(a_uses_y in any::<bool>(), b_uses_y in any::<bool>()) {
            let (mut context, nodes) = return_into_call(a_uses_y, b_uses_y);
            let (call_a, a_exit, call_b, t) = (nodes[1], nodes[3], nodes[4], nodes[7]);
            let a_key = context.reduced_for(call_a).unwrap();
            let b_key = context.reduced_for(call_b).unwrap();
            let a_set = context.owner_reached_set(call_a).unwrap();
            let path = CounterexamplePath::from_target(&context, t).unwrap();
            let reached = path
                .elements()
                .iter()
                .map(|element| path.reached_node(*element).unwrap())
                .collect::<Vec<_>>();
            prop_assert_eq!(reached, vec![nodes[0], call_a, nodes[2], call_b, nodes[5], nodes[6], t]);

            let report = SubtreeRemover::new(&mut context)
                .repair_path(&path, PathElement(1), &refine(&["x", "y"]))
                .unwrap();

            let refined = ValuePrecision::tracking(&["x", "y"]);
            let mut exact = vec![];
            if a_uses_y {
                exact.push(CacheKey::new(a_key.state.clone(), refined.clone(), Location(10)));
            }
            if b_uses_y {
                exact.push(CacheKey::new(b_key.state.clone(), refined.clone(), Location(30)));
            }
            prop_assert_eq!(&report.exact_entries, &exact);

            if !a_uses_y && b_uses_y {
                prop_assert_eq!(
                    &report.removals,
                    &vec![(a_set, a_exit), (ReachedSetId::TOP_LEVEL, call_a)]
                );
                prop_assert_eq!(&report.stale_expansions, &vec![(ReachedSetId::TOP_LEVEL, call_b)]);
                prop_assert!(context.graph.is_destroyed(a_exit));
            } else {
                prop_assert_eq!(&report.removals, &vec![(ReachedSetId::TOP_LEVEL, call_a)]);
                prop_assert!(report.stale_expansions.is_empty());
                prop_assert!(!context.graph.is_destroyed(a_exit));
            }
            prop_assert!(context.graph.is_destroyed(call_b));
            prop_assert_eq!(context.check_consistency(), Ok(()));
        }
    }
}
