use anyhow::Result;
use chimera::engine::Executor;
use chimera::exploration_strategy::DepthFirstStrategy;
use chimera::solver::native::NativeSolver;
use chimera::testcase::CollectingHandler;
use clap::ArgMatches;
use log::info;

mod cli;
mod demo;

fn main() -> Result<()> {
    env_logger::init();

    let matches = cli::args().get_matches();
    match matches.subcommand() {
        Some(("run", matches)) => run(matches),
        _ => unreachable!("a subcommand is required"),
    }
}

fn run(matches: &ArgMatches) -> Result<()> {
    let options = cli::options_from_matches(matches)?;
    let demo_name = matches.value_of("demo").expect("demo is required");
    let (module, entry) = demo::build(demo_name)?;

    let mut handler = CollectingHandler::new();
    let stats = {
        let solver = NativeSolver::new(options.rng_seed);
        let strategy = DepthFirstStrategy::new();
        let mut executor = Executor::new(&module, options, strategy, solver, &mut handler);
        executor.run(entry)?;
        executor.stats
    };

    info!(
        "done: {} instructions, {} forks, {} queries, {} paths",
        stats.instructions, stats.forks, stats.solver_queries, stats.paths_completed
    );

    for (index, test) in handler.tests.iter().enumerate() {
        println!("=== test {:06} ===", index + 1);
        println!("{}", test);
    }
    let errors = handler.errors().count();
    if errors > 0 {
        println!("{} error(s) found", errors);
    }
    Ok(())
}
