use crate::analysis::error::{BamError, Result};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

/// A program location, i.e. a node of the control-flow automaton
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Location(pub u32);

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N{}", self.0)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N{}", self.0)
    }
}

/// A program region that is analyzed as a reusable unit, e.g., a function or a loop body.
/// A block is identified by its call node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    call_node: Location,
    return_nodes: BTreeSet<Location>,
    nodes: BTreeSet<Location>,
}

impl Block {
    /// The call node and the return nodes always belong to the block, even if `nodes` omits them
    pub fn new<I, J>(call_node: Location, nodes: I, return_nodes: J) -> Self
    where
        I: IntoIterator<Item = Location>,
        J: IntoIterator<Item = Location>,
    {
        let return_nodes: BTreeSet<_> = return_nodes.into_iter().collect();
        let mut nodes: BTreeSet<_> = nodes.into_iter().collect();
        nodes.insert(call_node);
        nodes.extend(return_nodes.iter().copied());
        Self {
            call_node,
            return_nodes,
            nodes,
        }
    }

    pub fn call_node(&self) -> Location {
        self.call_node
    }

    pub fn return_nodes(&self) -> &BTreeSet<Location> {
        &self.return_nodes
    }

    pub fn is_return_node(&self, location: Location) -> bool {
        self.return_nodes.contains(&location)
    }

    pub fn contains(&self, location: Location) -> bool {
        self.nodes.contains(&location)
    }
}

/// The immutable partition of the program into (possibly nested) blocks
#[derive(Clone, Debug, Default)]
pub struct BlockPartitioning {
    blocks: HashMap<Location, Block>,
    return_nodes: HashSet<Location>,
}

impl BlockPartitioning {
    pub fn new(blocks: Vec<Block>) -> Self {
        let mut res = Self::default();
        for block in blocks {
            res.return_nodes.extend(block.return_nodes.iter().copied());
            res.blocks.insert(block.call_node, block);
        }
        res
    }

    pub fn is_call_node(&self, location: Location) -> bool {
        self.blocks.contains_key(&location)
    }

    /// Whether `location` is a return node of any block
    pub fn is_return_node(&self, location: Location) -> bool {
        self.return_nodes.contains(&location)
    }

    pub fn block_for_call_node(&self, location: Location) -> Result<&Block> {
        self.blocks
            .get(&location)
            .ok_or(BamError::NoBlockAt(location))
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.values()
    }
}
