use crate::analysis::error::{BamError, Result};
use crate::analysis::reached_set::ReachedSetId;
use bit_set::BitSet;
use std::collections::BTreeSet;
use std::fmt;

/// Index of a node in the exploration graph. Ids are never reused.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub usize);

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A vertex of the exploration graph: an abstract state, its precision and its edges
#[derive(Clone, Debug)]
pub struct GraphNode<S, P> {
    id: NodeId,
    state: S,
    precision: P,
    // The reached-set this node was explored in
    reached_set: ReachedSetId,
    parents: BTreeSet<NodeId>,
    children: BTreeSet<NodeId>,
    covered_by: Option<NodeId>,
    // Inverse of `covered_by`
    covering: BTreeSet<NodeId>,
    destroyed: bool,
}

impl<S, P> GraphNode<S, P> {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn precision(&self) -> &P {
        &self.precision
    }

    pub fn reached_set(&self) -> ReachedSetId {
        self.reached_set
    }

    pub fn parents(&self) -> &BTreeSet<NodeId> {
        &self.parents
    }

    pub fn children(&self) -> &BTreeSet<NodeId> {
        &self.children
    }

    pub fn covered_by(&self) -> Option<NodeId> {
        self.covered_by
    }

    /// The nodes that are covered by this node
    pub fn covered_nodes(&self) -> &BTreeSet<NodeId> {
        &self.covering
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}

/// The global graph of all states produced by the exploration, across all reached-sets.
///
/// Nodes live in an arena and refer to each other by `NodeId`. Destroying a node
/// detaches it from all of its neighbours and leaves a tombstone behind.
#[derive(Clone, Debug)]
pub struct ExplorationGraph<S, P> {
    nodes: Vec<GraphNode<S, P>>,
    live: BitSet,
}

impl<S, P> Default for ExplorationGraph<S, P> {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            live: BitSet::new(),
        }
    }
}

impl<S, P> ExplorationGraph<S, P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, state: S, precision: P, reached_set: ReachedSetId) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(GraphNode {
            id,
            state,
            precision,
            reached_set,
            parents: BTreeSet::new(),
            children: BTreeSet::new(),
            covered_by: None,
            covering: BTreeSet::new(),
            destroyed: false,
        });
        self.live.insert(id.0);
        id
    }

    /// Get a node, destroyed or not
    pub fn node(&self, id: NodeId) -> Result<&GraphNode<S, P>> {
        self.nodes.get(id.0).ok_or(BamError::UnknownNode(id))
    }

    /// Get a node that must not have been destroyed
    pub fn live_node(&self, id: NodeId) -> Result<&GraphNode<S, P>> {
        let node = self.node(id)?;
        if node.destroyed {
            Err(BamError::DestroyedNode(id))
        } else {
            Ok(node)
        }
    }

    fn live_node_mut(&mut self, id: NodeId) -> Result<&mut GraphNode<S, P>> {
        match self.nodes.get_mut(id.0) {
            Some(node) if node.destroyed => Err(BamError::DestroyedNode(id)),
            Some(node) => Ok(node),
            None => Err(BamError::UnknownNode(id)),
        }
    }

    /// Unknown ids count as destroyed
    pub fn is_destroyed(&self, id: NodeId) -> bool {
        !self.live.contains(id.0)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn live_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.live.iter().map(NodeId)
    }

    pub fn add_edge(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        self.live_node(child)?;
        self.live_node_mut(parent)?.children.insert(child);
        self.live_node_mut(child)?.parents.insert(parent);
        Ok(())
    }

    pub fn set_precision(&mut self, id: NodeId, precision: P) -> Result<()> {
        self.live_node_mut(id)?.precision = precision;
        Ok(())
    }

    /// Mark `node` as covered by `cover`, replacing any previous cover
    pub fn set_covered_by(&mut self, node: NodeId, cover: NodeId) -> Result<()> {
        self.live_node(cover)?;
        if let Some(old) = self.live_node_mut(node)?.covered_by.replace(cover) {
            if let Some(old_cover) = self.nodes.get_mut(old.0) {
                old_cover.covering.remove(&node);
            }
        }
        self.live_node_mut(cover)?.covering.insert(node);
        Ok(())
    }

    /// All nodes reachable from `root` via child edges, `root` included
    pub fn subgraph(&self, root: NodeId) -> Result<BTreeSet<NodeId>> {
        self.live_node(root)?;
        let mut result = BTreeSet::new();
        let mut worklist = vec![root];
        while let Some(id) = worklist.pop() {
            if result.insert(id) {
                worklist.extend(self.live_node(id)?.children.iter().copied());
            }
        }
        Ok(result)
    }

    /// Detach `id` from its parents, children and cover relation and mark it destroyed.
    /// Destroying a node twice is a no-op.
    pub fn destroy(&mut self, id: NodeId) -> Result<()> {
        let node = match self.nodes.get_mut(id.0) {
            Some(node) => node,
            None => return Err(BamError::UnknownNode(id)),
        };
        if node.destroyed {
            return Ok(());
        }
        node.destroyed = true;
        let parents = std::mem::take(&mut node.parents);
        let children = std::mem::take(&mut node.children);
        let covering = std::mem::take(&mut node.covering);
        let covered_by = node.covered_by.take();

        for parent in parents {
            self.nodes[parent.0].children.remove(&id);
        }
        for child in children {
            self.nodes[child.0].parents.remove(&id);
        }
        for covered in covering {
            self.nodes[covered.0].covered_by = None;
        }
        if let Some(cover) = covered_by {
            self.nodes[cover.0].covering.remove(&id);
        }
        self.live.remove(id.0);
        Ok(())
    }
}
