use crate::analysis::error::{BamError, Result};
use crate::analysis::graph::{ExplorationGraph, NodeId};
use crate::analysis::reducer::{Precision, PrecisionIncrement};
use log::{debug, trace};
use std::collections::{BTreeSet, VecDeque};

/// Index of a reached-set in the `GlobalContext`
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ReachedSetId(pub usize);

impl ReachedSetId {
    /// The reached-set of the whole program, which is not owned by any block entry
    pub const TOP_LEVEL: ReachedSetId = ReachedSetId(0);
}

/// In which order nodes are taken from the waitlist
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WaitlistOrder {
    Fifo,
    Lifo,
}

/// The nodes explored in one exploration context (the whole program or one block
/// invocation), plus the nodes still waiting to be processed.
/// A reached-set always contains its first node.
#[derive(Clone, Debug)]
pub struct ReachedSet {
    id: ReachedSetId,
    first: NodeId,
    last: NodeId,
    nodes: BTreeSet<NodeId>,
    waitlist: VecDeque<NodeId>,
    order: WaitlistOrder,
}

impl ReachedSet {
    pub fn new(id: ReachedSetId, first: NodeId, order: WaitlistOrder) -> Self {
        Self {
            id,
            first,
            last: first,
            nodes: BTreeSet::from([first]),
            waitlist: VecDeque::from([first]),
            order,
        }
    }

    pub fn id(&self) -> ReachedSetId {
        self.id
    }

    pub fn first_node(&self) -> NodeId {
        self.first
    }

    /// The node added most recently that is still part of the set
    pub fn last_node(&self) -> NodeId {
        self.last
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains(&node)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.iter().copied()
    }

    /// Add a node and schedule it for exploration
    pub fn add(&mut self, node: NodeId) {
        self.nodes.insert(node);
        self.waitlist.push_back(node);
        self.last = node;
    }

    /// Add a node that needs no exploration, e.g., because it is covered
    pub fn add_without_waiting(&mut self, node: NodeId) {
        self.nodes.insert(node);
        self.last = node;
    }

    pub fn has_waiting(&self) -> bool {
        self.waitlist.iter().any(|node| self.nodes.contains(node))
    }

    pub fn waitlist(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.waitlist.iter().copied()
    }

    pub fn pop_from_waitlist(&mut self) -> Option<NodeId> {
        loop {
            let node = match self.order {
                WaitlistOrder::Fifo => self.waitlist.pop_front(),
                WaitlistOrder::Lifo => self.waitlist.pop_back(),
            }?;
            // Skip nodes that were removed while waiting
            if self.nodes.contains(&node) {
                return Some(node);
            }
        }
    }

    pub fn re_add_to_waitlist(&mut self, node: NodeId) {
        if self.nodes.contains(&node) && !self.waitlist.contains(&node) {
            self.waitlist.push_back(node);
        }
    }

    fn remove_all(&mut self, nodes: &BTreeSet<NodeId>) {
        for node in nodes {
            self.nodes.remove(node);
        }
        self.waitlist.retain(|node| !nodes.contains(node));
        if nodes.contains(&self.last) {
            // The first node is never removed, so there is always a candidate
            self.last = self.nodes.iter().next_back().copied().unwrap_or(self.first);
        }
    }
}

/// What happens to the precision of the nodes from which a removed subtree is re-explored
#[derive(Clone, Debug)]
pub enum PrecisionAdjustment<P: Precision> {
    /// Re-explore with the old precision
    Keep,
    /// Replace the given components of the old precision
    Refine(Vec<PrecisionIncrement<P>>),
    /// Re-explore with this precision
    Replace(P),
}

impl<P: Precision> PrecisionAdjustment<P> {
    pub fn from_increments(increments: &[PrecisionIncrement<P>]) -> Self {
        if increments.is_empty() {
            PrecisionAdjustment::Keep
        } else {
            PrecisionAdjustment::Refine(increments.to_vec())
        }
    }

    pub fn is_keep(&self) -> bool {
        matches!(self, PrecisionAdjustment::Keep)
    }

    /// The adjusted precision, or `None` if the precision is kept
    pub fn apply(&self, precision: &P) -> Option<P> {
        match self {
            PrecisionAdjustment::Keep => None,
            PrecisionAdjustment::Refine(increments) => {
                Some(PrecisionIncrement::apply_all(precision, increments))
            }
            PrecisionAdjustment::Replace(new_precision) => Some(new_precision.clone()),
        }
    }
}

/// Remove `node` and everything below it from `reached`.
///
/// The removed part consists of `node`, all nodes reachable from it via child edges and
/// all nodes covered by one of those. Removed nodes are destroyed in the graph. The
/// surviving parents of removed nodes are put back on the waitlist, with their precision
/// adjusted according to `adjustment`.
///
/// Removing the first node of `reached` removes its last node instead, since the
/// first node must stay.
///
/// Returns whether the precision of the first node of `reached` changed.
pub fn remove_subtree<S, P: Precision>(
    graph: &mut ExplorationGraph<S, P>,
    reached: &mut ReachedSet,
    node: NodeId,
    adjustment: &PrecisionAdjustment<P>,
) -> Result<bool> {
    graph.live_node(node)?;
    if !reached.contains(node) {
        return Err(BamError::NotInReachedSet {
            node,
            reached_set: reached.id(),
        });
    }

    let first = reached.first_node();
    let node = if node == first {
        if reached.last_node() == first {
            debug!("{:?} only contains its first node, nothing to remove", reached.id());
            return Ok(false);
        }
        reached.last_node()
    } else {
        node
    };

    // Collect the subtree, plus everything covered by it
    let mut to_remove = BTreeSet::new();
    let mut worklist = vec![node];
    while let Some(root) = worklist.pop() {
        if to_remove.contains(&root) {
            continue;
        }
        for id in graph.subgraph(root)? {
            if !reached.contains(id) {
                return Err(BamError::NotInReachedSet {
                    node: id,
                    reached_set: reached.id(),
                });
            }
            worklist.extend(graph.live_node(id)?.covered_nodes().iter().copied());
            to_remove.insert(id);
        }
    }

    let mut frontier = BTreeSet::new();
    for id in &to_remove {
        for parent in graph.live_node(*id)?.parents() {
            if !to_remove.contains(parent) {
                frontier.insert(*parent);
            }
        }
    }
    trace!(
        "Removing {} nodes below {:?} from {:?}, frontier: {:?}",
        to_remove.len(),
        node,
        reached.id(),
        frontier
    );

    let first_precision = graph.live_node(first)?.precision().clone();

    reached.remove_all(&to_remove);
    for id in &to_remove {
        graph.destroy(*id)?;
    }

    for id in frontier {
        let new_precision = adjustment.apply(graph.live_node(id)?.precision());
        if let Some(precision) = new_precision {
            graph.set_precision(id, precision)?;
        }
        reached.re_add_to_waitlist(id);
    }

    Ok(*graph.live_node(first)?.precision() != first_precision)
}
