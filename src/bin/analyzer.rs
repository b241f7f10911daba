/// Runs the block cache on a small program that calls one function twice,
/// refines once after the first (spurious) target and prints the cache statistics
use bam_cache::analysis::block::{Block, BlockPartitioning, Location};
use bam_cache::analysis::context::GlobalContext;
use bam_cache::analysis::explorer::BlockExplorer;
use bam_cache::analysis::option::AnalysisOption;
use bam_cache::analysis::reached_set::ReachedSetId;
use bam_cache::analysis::reducer::PrecisionIncrement;
use bam_cache::analysis::subtree_remover::{CounterexamplePath, PathElement, SubtreeRemover};
use bam_cache::analysis::value_domain::{
    Operation, Program, ValuePrecision, ValueReducer, ValueState, ValueTransfer,
};
use bam_cache::Result;
use log::info;
use std::cell::RefCell;
use std::env;
use std::process;
use std::rc::Rc;

// main calls f twice and fails if f leaves y == 1, which it never does
fn program() -> Program {
    Program::new()
        .edge(0, Operation::Assign("x".to_string(), 0), 1)
        .edge(1, Operation::Call { return_to: Location(2) }, 10)
        .edge(2, Operation::Call { return_to: Location(3) }, 10)
        .edge(
            3,
            Operation::Assume {
                var: "y".to_string(),
                value: 1,
                equal: true,
            },
            4,
        )
        .edge(4, Operation::Error, 5)
        .edge(10, Operation::Assign("y".to_string(), 0), 11)
        .edge(11, Operation::Skip, 12)
        .edge(12, Operation::Return, 2)
        .edge(12, Operation::Return, 3)
}

// Refine at the first path element inside a block, or at the target if there is none
fn refinement_point(
    context: &GlobalContext<ValueReducer>,
    path: &CounterexamplePath,
) -> Result<PathElement> {
    for element in path.elements() {
        let node = path.reached_node(*element)?;
        if context.graph.node(node)?.reached_set() != ReachedSetId::TOP_LEVEL {
            return Ok(*element);
        }
    }
    path.last()
}

fn run(options: AnalysisOption) -> Result<()> {
    let stats_json = options.stats_json;
    let f = Block::new(Location(10), vec![Location(11)], vec![Location(12)]);
    let context = Rc::new(RefCell::new(GlobalContext::new(
        BlockPartitioning::new(vec![f]),
        ValueReducer::new(vec![(Location(10), vec!["y"])]),
        ValueState::new(Location(0)),
        ValuePrecision::default(),
        options,
    )));

    let mut explorer = BlockExplorer::new(context.clone(), ValueTransfer::new(program()));
    let targets = explorer.run()?;

    if let Some(target) = targets.first() {
        let path = CounterexamplePath::from_target(&*context.borrow(), *target)?;
        let pivot = refinement_point(&context.borrow(), &path)?;
        info!("Refining at {:?} of a path with {} elements", pivot, path.elements().len());
        let increments = vec![PrecisionIncrement::new(
            ValuePrecision::tracking(&["x", "y"]),
            (),
        )];
        {
            let mut context = context.borrow_mut();
            let report = SubtreeRemover::new(&mut *context).repair_path(&path, pivot, &increments)?;
            info!(
                "Repair removed {} subtrees, invalidated {} cache entries",
                report.removals.len(),
                report.invalidated.len()
            );
        }

        let targets = explorer.run()?;
        if targets.is_empty() {
            println!("The program is safe");
        } else {
            println!("Found {} target states", targets.len());
        }
    } else {
        println!("The program is safe");
    }

    context.borrow().check_consistency()?;
    let finished = context.borrow();
    if stats_json {
        println!("{}", finished.statistics.to_json());
    } else {
        println!("{}", finished.statistics);
    }
    Ok(())
}

fn main() {
    // Initialize logger
    pretty_env_logger::init();

    // Get analysis options from command line arguments
    // E.g., --aggressive-caching, --waitlist lifo
    let options = AnalysisOption::from_args(env::args());

    if let Err(err) = run(options) {
        eprintln!("Analysis failed: {}", err);
        process::exit(1);
    }
}
