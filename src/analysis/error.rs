use crate::analysis::block::Location;
use crate::analysis::graph::NodeId;
use crate::analysis::reached_set::ReachedSetId;
use thiserror::Error;

/// Result type alias for the cache and repair operations
pub type Result<T> = std::result::Result<T, BamError>;

/// Errors raised by the block cache, the exploration graph and the subtree repair.
///
/// Everything except `Interrupted` and `DepthLimit` is an inconsistency: the
/// current analysis run cannot continue soundly and must be aborted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BamError {
    #[error("unknown graph node {0:?}")]
    UnknownNode(NodeId),

    #[error("graph node {0:?} was already destroyed")]
    DestroyedNode(NodeId),

    #[error("node {node:?} is not part of reached-set {reached_set:?}")]
    NotInReachedSet {
        node: NodeId,
        reached_set: ReachedSetId,
    },

    #[error("unknown reached-set {0:?}")]
    UnknownReachedSet(ReachedSetId),

    #[error("no block starts at location {0}")]
    NoBlockAt(Location),

    #[error("no reached-set is registered for block entry {0:?}")]
    MissingReachedSet(NodeId),

    #[error("cache entry for block {block} does not match the entry of its reached-set")]
    KeyMismatch { block: Location },

    #[error("malformed counterexample path: {0}")]
    MalformedPath(String),

    #[error("block nesting exceeds the maximum depth of {0}")]
    DepthLimit(u32),

    #[error("analysis interrupted, results are incomplete")]
    Interrupted,
}

impl BamError {
    /// Whether this error reports a broken invariant rather than an aborted run
    pub fn is_inconsistency(&self) -> bool {
        !matches!(self, BamError::Interrupted | BamError::DepthLimit(_))
    }
}
