use crate::analysis::block::{Block, Location};
use crate::analysis::explorer::TransferRelation;
use crate::analysis::reducer::{AbstractState, Precision, Reducer};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// An explicit-value state: the known integer values of the tracked variables
/// at one location, plus the return locations of the open calls
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ValueState {
    location: Location,
    values: BTreeMap<String, i64>,
    stack: Vec<Location>,
    target: bool,
}

impl ValueState {
    pub fn new(location: Location) -> Self {
        Self {
            location,
            values: BTreeMap::new(),
            stack: Vec::new(),
            target: false,
        }
    }

    pub fn with_value(mut self, var: &str, value: i64) -> Self {
        self.values.insert(var.to_string(), value);
        self
    }

    pub fn as_target(mut self) -> Self {
        self.target = true;
        self
    }

    pub fn moved_to(&self, location: Location) -> Self {
        let mut res = self.clone();
        res.location = location;
        res
    }

    pub fn value(&self, var: &str) -> Option<i64> {
        self.values.get(var).copied()
    }

    pub fn values(&self) -> &BTreeMap<String, i64> {
        &self.values
    }

    pub fn stack(&self) -> &[Location] {
        &self.stack
    }
}

impl fmt::Debug for ValueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:?}", self.location, self.values)?;
        if self.target {
            write!(f, " (target)")?;
        }
        Ok(())
    }
}

impl AbstractState for ValueState {
    fn location(&self) -> Location {
        self.location
    }

    fn is_target(&self) -> bool {
        self.target
    }
}

/// The set of variables whose values are tracked
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct ValuePrecision {
    tracked: BTreeSet<String>,
}

impl ValuePrecision {
    pub fn tracking(vars: &[&str]) -> Self {
        Self {
            tracked: vars.iter().map(|var| var.to_string()).collect(),
        }
    }

    pub fn tracks(&self, var: &str) -> bool {
        self.tracked.contains(var)
    }
}

impl fmt::Debug for ValuePrecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "track{:?}", self.tracked)
    }
}

impl Precision for ValuePrecision {
    // There is only one component
    type Component = ();

    fn replace_component(&self, increment: &Self, _component: &()) -> Self {
        increment.clone()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    Assign(String, i64),
    Assume { var: String, value: i64, equal: bool },
    /// Enter a block, `return_to` is where the matching return continues
    Call { return_to: Location },
    /// Only feasible if the innermost open call returns to the edge's successor
    Return,
    /// Reach a violation of the property
    Error,
    Skip,
}

#[derive(Clone, Debug)]
pub struct Edge {
    pub from: Location,
    pub to: Location,
    pub op: Operation,
}

/// A control-flow automaton given by its edges
#[derive(Clone, Debug, Default)]
pub struct Program {
    edges: Vec<Edge>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn edge(mut self, from: u32, op: Operation, to: u32) -> Self {
        self.edges.push(Edge {
            from: Location(from),
            to: Location(to),
            op,
        });
        self
    }

    pub fn edges_from(&self, location: Location) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |edge| edge.from == location)
    }
}

/// The transfer relation of the explicit-value analysis over a `Program`
pub struct ValueTransfer {
    program: Program,
}

impl ValueTransfer {
    pub fn new(program: Program) -> Self {
        Self { program }
    }
}

impl TransferRelation for ValueTransfer {
    type State = ValueState;
    type Precision = ValuePrecision;

    fn successors(&self, state: &ValueState, precision: &ValuePrecision) -> Vec<ValueState> {
        let mut res = vec![];
        for edge in self.program.edges_from(state.location) {
            let mut next = state.moved_to(edge.to);
            match &edge.op {
                Operation::Assign(var, value) => {
                    if precision.tracks(var) {
                        next.values.insert(var.clone(), *value);
                    } else {
                        next.values.remove(var);
                    }
                }
                Operation::Assume { var, value, equal } => {
                    // An unknown value satisfies every assumption
                    if let Some(current) = state.value(var) {
                        if (current == *value) != *equal {
                            continue;
                        }
                    }
                }
                Operation::Call { return_to } => {
                    next.stack.push(*return_to);
                }
                Operation::Return => {
                    if next.stack.last() != Some(&edge.to) {
                        continue;
                    }
                    next.stack.pop();
                }
                Operation::Error => {
                    next.target = true;
                }
                Operation::Skip => {}
            }
            res.push(next);
        }
        res
    }
}

/// Reduces value states to the variables a block uses
#[derive(Clone, Debug, Default)]
pub struct ValueReducer {
    // Call node of a block -> the variables used inside the block
    block_variables: HashMap<Location, BTreeSet<String>>,
}

impl ValueReducer {
    pub fn new<'a, I, V>(blocks: I) -> Self
    where
        I: IntoIterator<Item = (Location, V)>,
        V: IntoIterator<Item = &'a str>,
    {
        let block_variables = blocks
            .into_iter()
            .map(|(location, vars)| {
                (
                    location,
                    vars.into_iter().map(|var| var.to_string()).collect(),
                )
            })
            .collect();
        Self { block_variables }
    }

    fn uses(&self, block: &Block, var: &str) -> bool {
        self.block_variables
            .get(&block.call_node())
            .map_or(false, |vars| vars.contains(var))
    }
}

impl Reducer for ValueReducer {
    type State = ValueState;
    type Precision = ValuePrecision;

    fn reduce_state(&self, state: &ValueState, block: &Block) -> ValueState {
        ValueState {
            location: state.location,
            values: state
                .values
                .iter()
                .filter(|(var, _)| self.uses(block, var))
                .map(|(var, value)| (var.clone(), *value))
                .collect(),
            stack: Vec::new(),
            target: state.target,
        }
    }

    fn reduce_precision(&self, precision: &ValuePrecision, block: &Block) -> ValuePrecision {
        ValuePrecision {
            tracked: precision
                .tracked
                .iter()
                .filter(|var| self.uses(block, var))
                .cloned()
                .collect(),
        }
    }

    fn expand(&self, root: &ValueState, block: &Block, reduced_exit: &ValueState) -> ValueState {
        let mut values: BTreeMap<_, _> = root
            .values
            .iter()
            .filter(|(var, _)| !self.uses(block, var))
            .map(|(var, value)| (var.clone(), *value))
            .collect();
        values.extend(
            reduced_exit
                .values
                .iter()
                .map(|(var, value)| (var.clone(), *value)),
        );
        ValueState {
            location: reduced_exit.location,
            values,
            stack: root.stack.clone(),
            target: reduced_exit.target,
        }
    }
}
