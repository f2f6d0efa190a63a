//! The engine: scheduler loop, fork machinery, instruction dispatcher, and
//! the external-call bridge.

pub mod dispatch;
pub mod executor;
pub mod external;

pub use executor::{Executor, Stats};
pub use external::{ExternalCallPolicy, HostFunction};

use crate::error::TerminateReason;
use bytesize::ByteSize;
use std::time::Duration;
use strum::{Display, EnumString};

pub mod defaults {
    use super::*;

    pub const MAX_MEMORY: ByteSize = ByteSize(2 * bytesize::GIB);
    pub const MAX_STACK_FRAMES: usize = 8192;
    pub const TIMER_INTERVAL: Duration = Duration::from_secs(1);
    pub const CORE_SOLVER_TIMEOUT: Duration = Duration::from_secs(30);
    pub const MAX_STATIC_FORK_PERCENT: f64 = 1.0;
    pub const RNG_SEED: u64 = 0x1234_5678;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum DebugPrintMode {
    Off,
    Compact,
    All,
}

/// Everything the host layer can configure, gathered into one value the
/// interpreter carries. Command-line parsing lives in the binary.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    // termination
    pub max_time: Option<Duration>,
    pub max_instructions: Option<u64>,
    pub max_forks: Option<u64>,
    pub max_depth: Option<u64>,
    pub max_memory: ByteSize,
    pub max_memory_inhibit: bool,
    pub max_stack_frames: usize,
    pub timer_interval: Duration,
    pub exit_on_error_kind: Vec<TerminateReason>,

    // external calls
    pub external_calls: ExternalCallPolicy,

    // seeding
    pub seed_time: Option<Duration>,
    pub only_replay_seeds: bool,
    pub only_seed: bool,
    pub allow_seed_extension: bool,
    pub zero_seed_extension: bool,
    pub allow_seed_truncation: bool,
    pub named_seed_matching: bool,

    // test generation
    pub dump_states_on_halt: bool,
    pub only_output_states_covering_new: bool,
    pub emit_all_errors: bool,
    pub check_leaks: bool,
    pub check_memcleanup: bool,

    // solving
    pub max_sym_array_size: u64,
    pub simplify_sym_indices: bool,
    pub equality_substitution: bool,
    pub core_solver_timeout: Option<Duration>,
    pub max_static_fork_percent: f64,

    // replay
    pub replay_path: Option<Vec<bool>>,

    // debug
    pub debug_print_instructions: DebugPrintMode,
    pub debug_print_to_stderr: bool,

    pub rng_seed: u64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_time: None,
            max_instructions: None,
            max_forks: None,
            max_depth: None,
            max_memory: defaults::MAX_MEMORY,
            max_memory_inhibit: true,
            max_stack_frames: defaults::MAX_STACK_FRAMES,
            timer_interval: defaults::TIMER_INTERVAL,
            exit_on_error_kind: Vec::new(),
            external_calls: ExternalCallPolicy::Concrete,
            seed_time: None,
            only_replay_seeds: false,
            only_seed: false,
            allow_seed_extension: false,
            zero_seed_extension: false,
            allow_seed_truncation: false,
            named_seed_matching: false,
            dump_states_on_halt: true,
            only_output_states_covering_new: false,
            emit_all_errors: false,
            check_leaks: false,
            check_memcleanup: false,
            max_sym_array_size: 0,
            simplify_sym_indices: false,
            equality_substitution: true,
            core_solver_timeout: Some(defaults::CORE_SOLVER_TIMEOUT),
            max_static_fork_percent: defaults::MAX_STATIC_FORK_PERCENT,
            replay_path: None,
            debug_print_instructions: DebugPrintMode::Off,
            debug_print_to_stderr: false,
            rng_seed: defaults::RNG_SEED,
        }
    }
}
