use crate::analysis::context::GlobalContext;
use crate::analysis::error::{BamError, Result};
use crate::analysis::graph::NodeId;
use crate::analysis::reached_set::ReachedSetId;
use crate::analysis::reducer::{AbstractState, Precision, Reducer};
use log::{debug, info, trace};
use std::cell::RefCell;
use std::rc::Rc;

/// The successor computation of the wrapped analysis
pub trait TransferRelation {
    type State: AbstractState;
    type Precision: Precision;

    fn successors(&self, state: &Self::State, precision: &Self::Precision) -> Vec<Self::State>;
}

/// Explores the top-level reached-set, and every block reached-set it needs, until
/// all waitlists are empty.
///
/// At a call node the block result is taken from the cache or explored first, then the
/// exits of the block are expanded into the caller. Targets and block exits are not
/// explored any further.
pub struct BlockExplorer<R: Reducer, T> {
    pub context: Rc<RefCell<GlobalContext<R>>>,
    transfer: T,
    // Reached-sets being explored, innermost last
    active: Vec<ReachedSetId>,
}

impl<R, T> BlockExplorer<R, T>
where
    R: Reducer,
    T: TransferRelation<State = R::State, Precision = R::Precision>,
{
    pub fn new(context: Rc<RefCell<GlobalContext<R>>>, transfer: T) -> Self {
        Self {
            context,
            transfer,
            active: Vec::new(),
        }
    }

    /// Explore until a fixed point is reached, returns the target nodes of the top-level reached-set
    pub fn run(&mut self) -> Result<Vec<NodeId>> {
        self.explore(ReachedSetId::TOP_LEVEL, 0)?;

        let context = self.context.borrow();
        let mut targets = vec![];
        for node in context.top_level().nodes() {
            if context.graph.live_node(node)?.state().is_target() {
                targets.push(node);
            }
        }
        info!(
            "Exploration finished with {} reached-sets and {} target states",
            context.reached_sets.len(),
            targets.len()
        );
        Ok(targets)
    }

    fn explore(&mut self, reached_set: ReachedSetId, depth: u32) -> Result<()> {
        self.active.push(reached_set);
        let res = self.explore_waitlist(reached_set, depth);
        self.active.pop();
        res
    }

    fn explore_waitlist(&mut self, reached_set: ReachedSetId, depth: u32) -> Result<()> {
        loop {
            self.context.borrow().shutdown.check()?;
            let node = match self
                .context
                .borrow_mut()
                .reached_set_mut(reached_set)?
                .pop_from_waitlist()
            {
                Some(node) => node,
                None => break,
            };

            let context = self.context.borrow();
            let graph_node = context.graph.live_node(node)?;
            let state = graph_node.state().clone();
            let precision = graph_node.precision().clone();
            if state.is_target() {
                continue;
            }

            let first = context.reached_set(reached_set)?.first_node();
            if node != first && reached_set != ReachedSetId::TOP_LEVEL {
                let entry = context.graph.live_node(first)?.state().location();
                let block = context.partitioning.block_for_call_node(entry)?;
                if block.is_return_node(state.location()) {
                    // The caller continues from here
                    continue;
                }
            }
            let is_call = node != first && context.partitioning.is_call_node(state.location());
            drop(context);

            if is_call {
                self.handle_call(node, depth)?;
                continue;
            }

            let successors = self.transfer.successors(&state, &precision);
            trace!("{:?} at {} has {} successors", node, state.location(), successors.len());
            for successor in successors {
                self.add_successor(node, reached_set, successor)?;
            }
        }
        Ok(())
    }

    fn handle_call(&mut self, call: NodeId, depth: u32) -> Result<()> {
        let max_depth = self.context.borrow().analysis_option.max_depth;
        if depth >= max_depth {
            return Err(BamError::DepthLimit(max_depth));
        }

        let lookup = self.context.borrow_mut().get_cached_or_compute(call)?;
        let inner = lookup.reached_set();
        if self.active.contains(&inner) {
            // Only the exits found so far are expanded, the call is not re-evaluated later
            debug!("Recursive call at {:?} into {:?}", call, inner);
        } else if self.context.borrow().reached_set(inner)?.has_waiting() {
            self.explore(inner, depth + 1)?;
        }

        self.context.borrow_mut().expand_block_exits(call, inner)?;
        Ok(())
    }

    fn add_successor(
        &mut self,
        parent: NodeId,
        reached_set: ReachedSetId,
        state: R::State,
    ) -> Result<()> {
        let mut context = self.context.borrow_mut();

        // An equal state that was already reached covers the new one
        let mut cover = None;
        for other in context.reached_set(reached_set)?.nodes() {
            let other_node = context.graph.live_node(other)?;
            if other_node.covered_by().is_none() && *other_node.state() == state {
                cover = Some(other);
                break;
            }
        }

        match cover {
            Some(cover) => {
                trace!("New successor of {:?} is covered by {:?}", parent, cover);
                context.add_covered_successor(parent, state, cover)?;
            }
            None => {
                context.add_successor(parent, state)?;
            }
        }
        Ok(())
    }
}
