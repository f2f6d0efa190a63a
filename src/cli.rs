use anyhow::{Context, Result};
use chimera::engine::{DebugPrintMode, EngineOptions, ExternalCallPolicy};
use chimera::error::TerminateReason;
use clap::{Arg, ArgMatches, Command};
use std::str::FromStr;
use std::time::Duration;

const ERROR_KINDS: &[&str] = &[
    "Abort",
    "Assert",
    "BadVectorAccess",
    "Exec",
    "External",
    "Free",
    "Leak",
    "Model",
    "Overflow",
    "Ptr",
    "ReadOnly",
    "ReportError",
    "User",
    "Unhandled",
];

pub fn args() -> Command<'static> {
    Command::new("chimera")
        .version(env!("CARGO_PKG_VERSION"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("run")
                .about("Symbolically execute one of the bundled demo programs")
                .arg(
                    Arg::new("demo")
                        .long("demo")
                        .value_name("NAME")
                        .takes_value(true)
                        .required(true)
                        .possible_values(crate::demo::NAMES.iter().copied())
                        .help("Demo program to execute"),
                )
                .arg(
                    Arg::new("max-time")
                        .long("max-time")
                        .value_name("SECONDS")
                        .takes_value(true)
                        .help("Halt execution after this much wall time"),
                )
                .arg(
                    Arg::new("max-instructions")
                        .long("max-instructions")
                        .value_name("N")
                        .takes_value(true)
                        .help("Halt execution after this many instructions"),
                )
                .arg(
                    Arg::new("max-forks")
                        .long("max-forks")
                        .value_name("N")
                        .takes_value(true)
                        .help("Suppress forking after this many forks"),
                )
                .arg(
                    Arg::new("max-depth")
                        .long("max-depth")
                        .value_name("N")
                        .takes_value(true)
                        .help("Terminate states beyond this fork depth"),
                )
                .arg(
                    Arg::new("max-memory")
                        .long("max-memory")
                        .value_name("SIZE")
                        .takes_value(true)
                        .help("Memory cap, e.g. 2GiB"),
                )
                .arg(
                    Arg::new("max-memory-inhibit")
                        .long("max-memory-inhibit")
                        .value_name("BOOL")
                        .takes_value(true)
                        .possible_values(["true", "false"])
                        .default_value("true")
                        .help("Inhibit forking while at the memory cap"),
                )
                .arg(
                    Arg::new("max-stack-frames")
                        .long("max-stack-frames")
                        .value_name("N")
                        .takes_value(true)
                        .help("Terminate states beyond this call depth"),
                )
                .arg(
                    Arg::new("timer-interval")
                        .long("timer-interval")
                        .value_name("SECONDS")
                        .takes_value(true)
                        .help("Granularity of the wall-clock timers"),
                )
                .arg(
                    Arg::new("exit-on-error-type")
                        .long("exit-on-error-type")
                        .value_name("KIND")
                        .takes_value(true)
                        .multiple_occurrences(true)
                        .possible_values(ERROR_KINDS.iter().copied())
                        .help("Stop the whole run when this error kind is found"),
                )
                .arg(
                    Arg::new("external-calls")
                        .long("external-calls")
                        .value_name("POLICY")
                        .takes_value(true)
                        .possible_values(["none", "pure", "concrete", "all"])
                        .default_value("concrete")
                        .help("Policy for calls into the host environment"),
                )
                .arg(
                    Arg::new("seed-time")
                        .long("seed-time")
                        .value_name("SECONDS")
                        .takes_value(true)
                        .help("Time budget of the seeding phase"),
                )
                .arg(
                    Arg::new("only-replay-seeds")
                        .long("only-replay-seeds")
                        .help("Kill states that run out of seeds"),
                )
                .arg(
                    Arg::new("only-seed")
                        .long("only-seed")
                        .help("Stop after the seeding phase"),
                )
                .arg(
                    Arg::new("allow-seed-extension")
                        .long("allow-seed-extension")
                        .help("Let inputs grow past the bytes a seed provides"),
                )
                .arg(
                    Arg::new("zero-seed-extension")
                        .long("zero-seed-extension")
                        .help("Pad short seed inputs with zero bytes"),
                )
                .arg(
                    Arg::new("allow-seed-truncation")
                        .long("allow-seed-truncation")
                        .help("Allow seeds longer than the requested input"),
                )
                .arg(
                    Arg::new("named-seed-matching")
                        .long("named-seed-matching")
                        .help("Match seed inputs by name instead of position"),
                )
                .arg(
                    Arg::new("dump-states-on-halt")
                        .long("dump-states-on-halt")
                        .value_name("BOOL")
                        .takes_value(true)
                        .possible_values(["true", "false"])
                        .default_value("true")
                        .help("Emit test cases for unfinished states on halt"),
                )
                .arg(
                    Arg::new("only-output-states-covering-new")
                        .long("only-output-states-covering-new")
                        .help("Only emit test cases for states that covered new code"),
                )
                .arg(
                    Arg::new("emit-all-errors")
                        .long("emit-all-errors")
                        .help("Emit every error instead of one per location"),
                )
                .arg(
                    Arg::new("check-leaks")
                        .long("check-leaks")
                        .help("Report unreachable heap memory on exit"),
                )
                .arg(
                    Arg::new("check-memcleanup")
                        .long("check-memcleanup")
                        .help("Report any heap memory left on exit"),
                )
                .arg(
                    Arg::new("max-sym-array-size")
                        .long("max-sym-array-size")
                        .value_name("N")
                        .takes_value(true)
                        .help("Concretize accesses into objects at least this large"),
                )
                .arg(
                    Arg::new("simplify-sym-indices")
                        .long("simplify-sym-indices")
                        .help("Simplify addresses against the path constraints"),
                )
                .arg(
                    Arg::new("equality-substitution")
                        .long("equality-substitution")
                        .value_name("BOOL")
                        .takes_value(true)
                        .possible_values(["true", "false"])
                        .default_value("true")
                        .help("Rewrite terms pinned to constants before solving"),
                )
                .arg(
                    Arg::new("core-solver-timeout")
                        .long("core-solver-timeout")
                        .value_name("SECONDS")
                        .takes_value(true)
                        .help("Per-query solver timeout"),
                )
                .arg(
                    Arg::new("debug-print-instructions")
                        .long("debug-print-instructions")
                        .value_name("MODE")
                        .takes_value(true)
                        .possible_values([
                            "off",
                            "compact",
                            "all",
                            "compact:stderr",
                            "all:stderr",
                        ])
                        .default_value("off")
                        .help("Print every executed instruction"),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .value_name("N")
                        .takes_value(true)
                        .help("RNG seed, fixed per run for reproducibility"),
                ),
        )
}

fn parse_seconds(matches: &ArgMatches, name: &str) -> Result<Option<Duration>> {
    match matches.value_of(name) {
        None => Ok(None),
        Some(raw) => {
            let seconds: u64 = raw
                .parse()
                .with_context(|| format!("invalid value for --{}", name))?;
            Ok(Some(Duration::from_secs(seconds)))
        }
    }
}

fn parse_number<T: FromStr>(matches: &ArgMatches, name: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match matches.value_of(name) {
        None => Ok(None),
        Some(raw) => {
            let value = raw
                .parse()
                .with_context(|| format!("invalid value for --{}", name))?;
            Ok(Some(value))
        }
    }
}

pub fn options_from_matches(matches: &ArgMatches) -> Result<EngineOptions> {
    let mut options = EngineOptions::default();

    options.max_time = parse_seconds(matches, "max-time")?;
    options.max_instructions = parse_number(matches, "max-instructions")?;
    options.max_forks = parse_number(matches, "max-forks")?;
    options.max_depth = parse_number(matches, "max-depth")?;
    if let Some(size) = matches.value_of("max-memory") {
        options.max_memory = size
            .parse()
            .map_err(|e: String| anyhow::anyhow!("invalid value for --max-memory: {}", e))?;
    }
    options.max_memory_inhibit = matches.value_of("max-memory-inhibit") == Some("true");
    if let Some(frames) = parse_number(matches, "max-stack-frames")? {
        options.max_stack_frames = frames;
    }
    if let Some(interval) = parse_seconds(matches, "timer-interval")? {
        options.timer_interval = interval;
    }
    if let Some(kinds) = matches.values_of("exit-on-error-type") {
        for kind in kinds {
            let kind = TerminateReason::from_str(kind)
                .map_err(|_| anyhow::anyhow!("unknown error kind {}", kind))?;
            options.exit_on_error_kind.push(kind);
        }
    }

    let policy = matches.value_of("external-calls").unwrap_or("concrete");
    options.external_calls = ExternalCallPolicy::from_str(policy)
        .map_err(|_| anyhow::anyhow!("unknown external call policy {}", policy))?;

    options.seed_time = parse_seconds(matches, "seed-time")?;
    options.only_replay_seeds = matches.is_present("only-replay-seeds");
    options.only_seed = matches.is_present("only-seed");
    options.allow_seed_extension = matches.is_present("allow-seed-extension");
    options.zero_seed_extension = matches.is_present("zero-seed-extension");
    options.allow_seed_truncation = matches.is_present("allow-seed-truncation");
    options.named_seed_matching = matches.is_present("named-seed-matching");

    options.dump_states_on_halt = matches.value_of("dump-states-on-halt") == Some("true");
    options.only_output_states_covering_new =
        matches.is_present("only-output-states-covering-new");
    options.emit_all_errors = matches.is_present("emit-all-errors");
    options.check_leaks = matches.is_present("check-leaks");
    options.check_memcleanup = matches.is_present("check-memcleanup");

    if let Some(size) = parse_number(matches, "max-sym-array-size")? {
        options.max_sym_array_size = size;
    }
    options.simplify_sym_indices = matches.is_present("simplify-sym-indices");
    options.equality_substitution = matches.value_of("equality-substitution") == Some("true");
    if let Some(timeout) = parse_seconds(matches, "core-solver-timeout")? {
        options.core_solver_timeout = Some(timeout);
    }

    if let Some(mode) = matches.value_of("debug-print-instructions") {
        let (mode, stderr) = match mode.split_once(':') {
            Some((mode, "stderr")) => (mode, true),
            _ => (mode, false),
        };
        options.debug_print_instructions = DebugPrintMode::from_str(mode)
            .map_err(|_| anyhow::anyhow!("unknown debug print mode {}", mode))?;
        options.debug_print_to_stderr = stderr;
    }

    if let Some(seed) = parse_number(matches, "seed")? {
        options.rng_seed = seed;
    }

    Ok(options)
}
