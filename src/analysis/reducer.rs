use crate::analysis::block::{Block, Location};
use std::fmt::Debug;
use std::hash::Hash;

/// The abstract states of the wrapped analysis.
/// Equality and hashing are used for building cache keys, so two states that
/// are equal must describe exactly the same block-local abstraction.
pub trait AbstractState: Clone + Eq + Hash + Debug {
    fn location(&self) -> Location;

    /// Whether this state violates the property being checked
    fn is_target(&self) -> bool {
        false
    }
}

/// The precisions of the wrapped analysis
pub trait Precision: Clone + Eq + Hash + Debug {
    /// Selects the part of a (composite) precision that an increment refines
    type Component: Clone + Debug;

    /// Returns a copy of `self` whose part selected by `component` is taken from `increment`
    fn replace_component(&self, increment: &Self, component: &Self::Component) -> Self;
}

/// A new precision produced by refinement, together with the component it refines
#[derive(Clone, Debug)]
pub struct PrecisionIncrement<P: Precision> {
    pub precision: P,
    pub component: P::Component,
}

impl<P: Precision> PrecisionIncrement<P> {
    pub fn new(precision: P, component: P::Component) -> Self {
        Self {
            precision,
            component,
        }
    }

    /// Apply all the increments to `precision`, in order
    pub fn apply_all(precision: &P, increments: &[Self]) -> P {
        increments.iter().fold(precision.clone(), |acc, increment| {
            acc.replace_component(&increment.precision, &increment.component)
        })
    }
}

/// Converts between the caller's view and the block-local view of states and precisions.
/// Supplied by the wrapped analysis.
pub trait Reducer {
    type State: AbstractState;
    type Precision: Precision;

    /// Project a state onto the part that is relevant inside `block`.
    /// The reduced state stays at the call node of `block`.
    fn reduce_state(&self, state: &Self::State, block: &Block) -> Self::State;

    /// Project a precision onto the part that is relevant inside `block`
    fn reduce_precision(&self, precision: &Self::Precision, block: &Block) -> Self::Precision;

    /// Rebuild the caller's view of `reduced_exit`, a state at a return node of `block`.
    /// `root` is the caller's state at the call node of `block`.
    fn expand(&self, root: &Self::State, block: &Block, reduced_exit: &Self::State) -> Self::State;

    fn reduce(
        &self,
        state: &Self::State,
        precision: &Self::Precision,
        block: &Block,
    ) -> (Self::State, Self::Precision) {
        (
            self.reduce_state(state, block),
            self.reduce_precision(precision, block),
        )
    }
}
