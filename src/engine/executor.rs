//! The scheduler and fork machinery: owns all live states, steps one
//! instruction at a time, and drains state updates into the searcher.

use crate::engine::external::ExternalDispatcher;
use crate::engine::{DebugPrintMode, EngineOptions};
use crate::error::{ExecutionError, TerminateReason};
use crate::exploration_strategy::ExplorationStrategy;
use crate::expr::{Array, Expr, Value, PTR_WIDTH};
use crate::ir::{CodePtr, FunctionId, Instruction, Module, Type};
use crate::memory::{AllocSite, MemoryManager, MemoryObject, ObjectState, ERRNO_SEGMENT,
                    FIRST_ORDINARY_SEGMENT};
use crate::ptree::ProcessTree;
use crate::seed::SeedInfo;
use crate::solver::{eval_bool, Solver, SolverError, Validity};
use crate::state::{ExecutionState, StateId};
use crate::testcase::{InterpreterHandler, NondetEntry, TestCase, TestObject};
use bytesize::ByteSize;
use log::{debug, info, trace, warn};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::time::Instant;

#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub instructions: u64,
    pub forks: u64,
    pub solver_queries: u64,
    pub paths_completed: u64,
}

pub struct Executor<'a, E, S>
where
    E: ExplorationStrategy,
    S: Solver,
{
    module: &'a Module,
    pub options: EngineOptions,
    strategy: E,
    pub(crate) solver: S,
    handler: &'a mut dyn InterpreterHandler,

    pub(crate) memory: MemoryManager,
    pub(crate) states: HashMap<StateId, ExecutionState>,
    added_states: Vec<StateId>,
    removed_states: Vec<StateId>,
    paused_states: Vec<StateId>,
    continued_states: Vec<StateId>,
    seed_map: HashMap<StateId, Vec<SeedInfo>>,
    using_seeds: Vec<Rc<TestCase>>,
    ptree: ProcessTree,
    pub(crate) rng: StdRng,
    pub stats: Stats,
    fork_counts: HashMap<CodePtr, u64>,
    halt_execution: bool,
    at_memory_limit: bool,
    inhibit_forking: bool,
    emitted_errors: HashSet<(CodePtr, String)>,
    repr_addresses: HashMap<u64, Expr>,
    pub(crate) externals: ExternalDispatcher,
    pub(crate) global_objects: Vec<Rc<MemoryObject>>,
    pub(crate) errno_object: Option<Rc<MemoryObject>>,
    next_state_id: u64,
    start_time: Instant,
    replay_position: usize,
}

impl<'a, E, S> Executor<'a, E, S>
where
    E: ExplorationStrategy,
    S: Solver,
{
    pub fn new(
        module: &'a Module,
        options: EngineOptions,
        strategy: E,
        solver: S,
        handler: &'a mut dyn InterpreterHandler,
    ) -> Self {
        let rng = StdRng::seed_from_u64(options.rng_seed);
        let memory = MemoryManager::new(PTR_WIDTH);
        Self {
            module,
            options,
            strategy,
            solver,
            handler,
            memory,
            states: HashMap::new(),
            added_states: Vec::new(),
            removed_states: Vec::new(),
            paused_states: Vec::new(),
            continued_states: Vec::new(),
            seed_map: HashMap::new(),
            using_seeds: Vec::new(),
            ptree: ProcessTree::new(),
            rng,
            stats: Stats::default(),
            fork_counts: HashMap::new(),
            halt_execution: false,
            at_memory_limit: false,
            inhibit_forking: false,
            emitted_errors: HashSet::new(),
            repr_addresses: HashMap::new(),
            externals: ExternalDispatcher::new(),
            global_objects: Vec::new(),
            errno_object: None,
            next_state_id: 0,
            start_time: Instant::now(),
            replay_position: 0,
        }
    }

    pub fn with_seeds(mut self, seeds: Vec<TestCase>) -> Self {
        self.using_seeds = seeds.into_iter().map(Rc::new).collect();
        self
    }

    pub fn externals_mut(&mut self) -> &mut ExternalDispatcher {
        &mut self.externals
    }

    pub fn module(&self) -> &Module {
        self.module
    }

    pub fn halt(&mut self) {
        self.halt_execution = true;
    }

    /// Globally suppress forking; Unknown branch conditions collapse to a
    /// random side until cleared.
    pub fn set_inhibit_forking(&mut self, inhibit: bool) {
        self.inhibit_forking = inhibit;
    }

    pub(crate) fn state(&self, id: StateId) -> &ExecutionState {
        self.states.get(&id).expect("reference to unknown state")
    }

    pub(crate) fn state_mut(&mut self, id: StateId) -> &mut ExecutionState {
        self.states.get_mut(&id).expect("reference to unknown state")
    }

    fn fresh_state_id(&mut self) -> StateId {
        let id = StateId(self.next_state_id);
        self.next_state_id += 1;
        id
    }

    /// Run `entry` to completion of all states (or a halt condition).
    pub fn run(&mut self, entry: FunctionId) -> Result<(), ExecutionError> {
        self.initialize(entry)?;
        self.start_time = Instant::now();

        if !self.using_seeds.is_empty() {
            time_info!("finished seeding phase", { self.run_seeding() })?;
            if self.options.only_seed {
                self.do_dump_states();
                return Ok(());
            }
        }

        time_info!("finished path exploration", {
            while !self.states.is_empty() && !self.halt_execution {
                let id = self.strategy.select();
                let instruction = self.fetch(id);
                self.step_instruction(id, &instruction);
                self.execute_instruction(id, &instruction)?;
                self.timers_tick();
                self.check_memory_usage();
                self.update_states(Some(id));
            }
        });

        self.do_dump_states();
        Ok(())
    }

    fn initialize(&mut self, entry: FunctionId) -> Result<(), ExecutionError> {
        let function = self.module.function(entry);
        if function.is_declaration() {
            return Err(ExecutionError::InvalidModule(format!(
                "entry function {} has no body",
                function.name
            )));
        }
        if !function.params.is_empty() {
            return Err(ExecutionError::InvalidModule(
                "entry function must not take parameters".to_string(),
            ));
        }

        let id = self.fresh_state_id();
        let mut state = ExecutionState::new(id, CodePtr::entry(entry), function.num_locals);

        for global in &self.module.globals {
            let size = global.ty.store_size().max(1);
            let site = AllocSite::new(format!("global {}", global.name))
                .with_type(global.ty.clone());
            let mo = self
                .memory
                .allocate(
                    Expr::pointer(size),
                    size,
                    false,
                    true,
                    site,
                    global.ty.alignment(),
                )
                .ok_or_else(|| {
                    ExecutionError::InvalidModule("out of segments for globals".to_string())
                })?;
            let mut os = ObjectState::new(&mo);
            if let Some(bytes) = &global.initializer {
                os.write_concrete_bytes(0, bytes);
            }
            os.read_only = global.read_only;
            state.address_space.bind(Rc::clone(&mo), os);
            self.global_objects.push(mo);
        }

        // the errno mirror, pinned at its host-side cell
        let errno = self.memory.allocate_fixed(
            self.externals.errno_address(),
            4,
            AllocSite::new("errno"),
            Some(ERRNO_SEGMENT),
            false,
        );
        state.address_space.bind(Rc::clone(&errno), ObjectState::new(&errno));
        self.errno_object = Some(errno);

        state.ptree_node = self.ptree.root(id);

        debug!(
            "initial state {} at {} ({} globals)",
            id,
            state.pc,
            self.module.globals.len()
        );

        if !self.using_seeds.is_empty() {
            let infos: Vec<SeedInfo> = self
                .using_seeds
                .iter()
                .map(|seed| SeedInfo::new(Rc::clone(seed)))
                .collect();
            self.seed_map.insert(id, infos);
        }

        self.states.insert(id, state);
        self.added_states.push(id);
        self.update_states(None);
        Ok(())
    }

    /// Round-robin over states that still carry seeds, biasing execution
    /// toward the recorded inputs before free search begins.
    fn run_seeding(&mut self) -> Result<(), ExecutionError> {
        let start = Instant::now();
        let mut last_state: Option<StateId> = None;

        while !self.seed_map.is_empty() && !self.halt_execution {
            let mut keys: Vec<StateId> = self.seed_map.keys().copied().collect();
            keys.sort();
            let id = last_state
                .and_then(|last| keys.iter().copied().find(|k| *k > last))
                .unwrap_or(keys[0]);
            last_state = Some(id);

            let instruction = self.fetch(id);
            self.step_instruction(id, &instruction);
            self.execute_instruction(id, &instruction)?;
            self.timers_tick();
            self.update_states(Some(id));

            if self.stats.instructions % 1000 == 0 {
                if let Some(seed_time) = self.options.seed_time {
                    if start.elapsed() > seed_time {
                        let seeds: usize = self.seed_map.values().map(Vec::len).sum();
                        warn!(
                            "seed time expired, {} seeds remain over {} states",
                            seeds,
                            self.seed_map.len()
                        );
                        break;
                    }
                }
            }
        }

        info!("seeding done ({} states remain)", self.states.len());
        for state in self.states.values_mut() {
            state.weight = 1.0;
        }
        Ok(())
    }

    fn fetch(&self, id: StateId) -> Instruction {
        let pc = self.state(id).pc;
        let function = self.module.function(pc.function);
        function.blocks[pc.block].instructions[pc.index].clone()
    }

    fn step_instruction(&mut self, id: StateId, instruction: &Instruction) {
        self.print_debug_instruction(id, instruction);

        let state = self.state_mut(id);
        state.prev_pc = state.pc;
        if !instruction.is_terminator() {
            state.pc = state.pc.next();
        }
        state.stepped_instructions += 1;
        let line = state.prev_pc;
        if state.covered_lines.insert(line) {
            state.covered_new = true;
        }
        self.stats.instructions += 1;
    }

    fn print_debug_instruction(&self, id: StateId, instruction: &Instruction) {
        let mode = self.options.debug_print_instructions;
        if mode == DebugPrintMode::Off {
            return;
        }
        let state = self.state(id);
        let line = match mode {
            DebugPrintMode::Compact => format!("{} [{}]", state.pc, id),
            _ => format!("{} [{}] {:?}", state.pc, id, instruction),
        };
        if self.options.debug_print_to_stderr {
            eprintln!("{}", line);
        } else {
            debug!("{}", line);
        }
    }

    fn timers_tick(&mut self) {
        if let Some(max_time) = self.options.max_time {
            if self.start_time.elapsed() > max_time {
                info!("max-time reached, halting");
                self.halt_execution = true;
            }
        }
        if let Some(max_instructions) = self.options.max_instructions {
            if self.stats.instructions >= max_instructions {
                info!("max-instructions reached, halting");
                self.halt_execution = true;
            }
        }
    }

    /// Rough footprint of all live states, for the memory cap.
    fn memory_usage(&self) -> ByteSize {
        let tracked: u64 = self
            .states
            .values()
            .map(|s| s.address_space.tracked_bytes() + 4096)
            .sum();
        ByteSize(tracked)
    }

    /// Checked every 64K instructions: over the cap, a random fraction of
    /// states is terminated early, biased away from states that recently
    /// covered new code.
    fn check_memory_usage(&mut self) {
        if self.stats.instructions & 0xFFFF != 0 {
            return;
        }
        let usage = self.memory_usage();
        if usage <= self.options.max_memory {
            self.at_memory_limit = false;
            return;
        }

        if usage.as_u64() > self.options.max_memory.as_u64() + (ByteSize::mib(100)).as_u64() {
            let mut live: Vec<StateId> = self
                .states
                .keys()
                .copied()
                .filter(|id| !self.removed_states.contains(id))
                .collect();
            live.sort();
            let count = live.len();
            let keep = (count as u64 * self.options.max_memory.as_u64() / usage.as_u64()) as usize;
            let to_kill = count.saturating_sub(keep).max(1);
            warn!("killing {} states (over memory cap {})", to_kill, usage);

            let mut remaining = live.len();
            for _ in 0..to_kill.min(count) {
                if remaining == 0 {
                    break;
                }
                let mut index = self.rng.gen_range(0..remaining);
                // two pulls to spare states that covered new code
                if self.state(live[index]).covered_new {
                    index = self.rng.gen_range(0..remaining);
                }
                live.swap(index, remaining - 1);
                remaining -= 1;
                self.terminate_state_early(live[remaining], "Memory limit exceeded.");
            }
        }
        self.at_memory_limit = true;
    }

    fn do_dump_states(&mut self) {
        if !self.options.dump_states_on_halt || self.states.is_empty() {
            return;
        }
        info!("halting execution, dumping remaining states");
        let live: Vec<StateId> = {
            let mut live: Vec<StateId> = self.states.keys().copied().collect();
            live.sort();
            live
        };
        for id in live {
            if !self.removed_states.contains(&id) {
                self.terminate_state_early(id, "Execution halting.");
            }
        }
        self.update_states(None);
    }

    /// Drain added/removed/paused/continued into the searcher and the
    /// state set.
    pub(crate) fn update_states(&mut self, current: Option<StateId>) {
        let mut added = std::mem::take(&mut self.added_states);
        let removed = std::mem::take(&mut self.removed_states);
        // a state forked and terminated within one step never reaches the
        // searcher at all
        added.retain(|id| !removed.contains(id));
        self.strategy.update(current, &added, &removed);

        for id in removed {
            self.seed_map.remove(&id);
            let state = self
                .states
                .remove(&id)
                .expect("removed state must be live");
            self.ptree.remove(state.ptree_node);
            trace!("state {} removed", id);
        }

        if !self.paused_states.is_empty() || !self.continued_states.is_empty() {
            let paused = std::mem::take(&mut self.paused_states);
            let continued = std::mem::take(&mut self.continued_states);
            self.strategy.update(None, &continued, &paused);
        }
    }

    pub fn pause_state(&mut self, id: StateId) {
        self.paused_states.push(id);
    }

    pub fn continue_state(&mut self, id: StateId) {
        self.continued_states.push(id);
    }

    // ------------------------------------------------------------------
    // constraints & solver plumbing

    pub(crate) fn add_constraint_with_seeds(
        &mut self,
        id: StateId,
        condition: Expr,
    ) -> Result<(), ExecutionError> {
        self.state_mut(id).add_constraint(condition.clone());

        if self.seed_map.contains_key(&id) {
            let (constraints, arrays) = {
                let state = self.state(id);
                (state.constraints.clone(), state.arrays())
            };
            let solver = &mut self.solver;
            let seeds = self.seed_map.get_mut(&id).unwrap();
            for seed in seeds.iter_mut() {
                if !eval_bool(&condition, &seed.assignment) {
                    debug!("patching a seed that violates a new constraint");
                    if let Ok(assignment) = solver.get_initial_values(&constraints, &arrays) {
                        seed.assignment = assignment;
                    }
                }
            }
        }
        Ok(())
    }

    /// Concretize `expr` in `id`, constraining the state to the chosen
    /// value.
    pub(crate) fn to_constant(
        &mut self,
        id: StateId,
        expr: &Expr,
        reason: &str,
    ) -> Result<Expr, ExecutionError> {
        if expr.is_constant() {
            return Ok(expr.clone());
        }
        self.stats.solver_queries += 1;
        let bits = self
            .solver
            .get_value(&self.states[&id].constraints, expr)?;
        let constant = Expr::constant(expr.width(), bits);
        warn!(
            "silently concretizing expression to {:#x} ({})",
            bits, reason
        );
        self.add_constraint_with_seeds(id, Expr::eq(constant.clone(), expr.clone()))?;
        Ok(constant)
    }

    /// The unique concrete value of `expr` if it has one, else `expr`.
    pub(crate) fn to_unique(&mut self, id: StateId, expr: &Expr) -> Result<Expr, ExecutionError> {
        if expr.is_constant() {
            return Ok(expr.clone());
        }
        self.stats.solver_queries += 2;
        let bits = self
            .solver
            .get_value(&self.states[&id].constraints, expr)?;
        let constant = Expr::constant(expr.width(), bits);
        let is_unique = self.solver.must_be_true(
            &self.states[&id].constraints,
            &Expr::eq(constant.clone(), expr.clone()),
        )?;
        Ok(if is_unique { constant } else { expr.clone() })
    }

    /// The per-object symbolic representative address used to compare
    /// pointers into distinct objects.
    pub(crate) fn repr_address(&mut self, segment: u64) -> Expr {
        if let Some(expr) = self.repr_addresses.get(&segment) {
            return expr.clone();
        }
        let array = Array::symbolic(format!("addr_of_segment_{}", segment), 8);
        let expr = Expr::read_le(
            &crate::expr::UpdateList::new(array),
            &Expr::zero(PTR_WIDTH),
            8,
        );
        self.repr_addresses.insert(segment, expr.clone());
        expr
    }

    // ------------------------------------------------------------------
    // fork & branch

    /// Binary fork on `condition`. Returns the (true, false) states; the
    /// input state survives on whichever side stays feasible.
    pub(crate) fn fork(
        &mut self,
        id: StateId,
        condition: Expr,
        is_internal: bool,
    ) -> Result<(Option<StateId>, Option<StateId>), ExecutionError> {
        let is_seeding = self.seed_map.contains_key(&id);
        let mut condition = condition;
        if self.options.equality_substitution {
            condition = self.state(id).constraints.simplify_expr(&condition);
        }

        // a branch instruction responsible for too large a share of all
        // forks gets its condition pinned to one value instead of forking
        if !is_seeding
            && !condition.is_constant()
            && self.options.max_static_fork_percent < 1.0
            && self.stats.forks > 32
        {
            let site = self.state(id).prev_pc;
            let here = self.fork_counts.get(&site).copied().unwrap_or(0);
            if here as f64 > self.stats.forks as f64 * self.options.max_static_fork_percent {
                debug!("suppressing fork at busy instruction {}", site);
                let pinned = match self.query_value(id, &condition) {
                    Ok(bits) => bits,
                    Err(SolverError::Timeout) => {
                        return self.timeout_in_fork(id);
                    }
                    Err(e) => return Err(e.into()),
                };
                let constant = Expr::constant(condition.width(), pinned);
                self.add_constraint_with_seeds(
                    id,
                    Expr::eq(constant.clone(), condition.clone()),
                )?;
                condition = constant;
            }
        }

        let timeout = self.options.core_solver_timeout.map(|t| {
            if is_seeding {
                let seeds = self.seed_map.get(&id).map(Vec::len).unwrap_or(1).max(1);
                t * seeds as u32
            } else {
                t
            }
        });
        self.solver.set_timeout(timeout);
        self.stats.solver_queries += 1;
        let (evaluated, duration) = time!({
            self.solver
                .evaluate(&self.states[&id].constraints, &condition)
        });
        self.solver.set_timeout(None);
        trace!("fork feasibility decided in {:?}", duration);

        let mut result = match evaluated {
            Ok(result) => result,
            Err(SolverError::Timeout) => return self.timeout_in_fork(id),
            Err(e) => return Err(e.into()),
        };

        if !is_seeding {
            if self.options.replay_path.is_some() && !is_internal {
                let replay = self.options.replay_path.as_ref().unwrap();
                assert!(
                    self.replay_position < replay.len(),
                    "ran out of branches in replay path mode"
                );
                let bit = replay[self.replay_position];
                self.replay_position += 1;
                match result {
                    Validity::True => assert!(bit, "hit invalid branch in replay path mode"),
                    Validity::False => assert!(!bit, "hit invalid branch in replay path mode"),
                    Validity::Unknown => {
                        result = if bit {
                            self.add_constraint_with_seeds(id, condition.clone())?;
                            Validity::True
                        } else {
                            self.add_constraint_with_seeds(id, Expr::is_zero(&condition))?;
                            Validity::False
                        };
                    }
                }
            } else if result == Validity::Unknown {
                let inhibited = (self.options.max_memory_inhibit && self.at_memory_limit)
                    || self.state(id).fork_disabled
                    || self.inhibit_forking
                    || self
                        .options
                        .max_forks
                        .map_or(false, |max| self.stats.forks >= max);
                if inhibited {
                    debug!("skipping fork (inhibited) at {}", self.state(id).prev_pc);
                    result = if self.rng.gen() {
                        self.add_constraint_with_seeds(id, condition.clone())?;
                        Validity::True
                    } else {
                        self.add_constraint_with_seeds(id, Expr::is_zero(&condition))?;
                        Validity::False
                    };
                }
            }
        }

        // in seed-only modes an Unknown must collapse to the side the
        // seeds actually take
        if is_seeding
            && (self.state(id).fork_disabled || self.options.only_replay_seeds)
            && result == Validity::Unknown
        {
            let (true_seed, false_seed) = {
                let seeds = &self.seed_map[&id];
                let mut true_seed = false;
                let mut false_seed = false;
                for seed in seeds {
                    if eval_bool(&condition, &seed.assignment) {
                        true_seed = true;
                    } else {
                        false_seed = true;
                    }
                    if true_seed && false_seed {
                        break;
                    }
                }
                (true_seed, false_seed)
            };
            if !(true_seed && false_seed) {
                assert!(true_seed || false_seed);
                result = if true_seed {
                    self.add_constraint_with_seeds(id, condition.clone())?;
                    Validity::True
                } else {
                    self.add_constraint_with_seeds(id, Expr::is_zero(&condition))?;
                    Validity::False
                };
            }
        }

        match result {
            Validity::True => {
                if !is_internal {
                    self.state_mut(id).path.push(true);
                }
                Ok((Some(id), None))
            }
            Validity::False => {
                if !is_internal {
                    self.state_mut(id).path.push(false);
                }
                Ok((None, Some(id)))
            }
            Validity::Unknown => {
                self.stats.forks += 1;
                let site = self.state(id).prev_pc;
                *self.fork_counts.entry(site).or_insert(0) += 1;

                let new_id = self.fresh_state_id();
                let mut false_state = self.state_mut(id).branch(new_id);

                let node = self.state(id).ptree_node;
                let (true_leaf, false_leaf) = self.ptree.attach(node, id, new_id);
                self.state_mut(id).ptree_node = true_leaf;
                false_state.ptree_node = false_leaf;

                if !is_internal {
                    self.state_mut(id).path.push(true);
                    false_state.path.push(false);
                }

                trace!("fork: {} -> ({}, {})", id, id, new_id);
                self.states.insert(new_id, false_state);
                self.added_states.push(new_id);

                // redistribute seeds by which side they satisfy
                if let Some(seeds) = self.seed_map.remove(&id) {
                    let mut true_seeds = Vec::new();
                    let mut false_seeds = Vec::new();
                    for seed in seeds {
                        if eval_bool(&condition, &seed.assignment) {
                            true_seeds.push(seed);
                        } else {
                            false_seeds.push(seed);
                        }
                    }
                    let swap_info = true_seeds.is_empty();
                    if !true_seeds.is_empty() {
                        self.seed_map.insert(id, true_seeds);
                    }
                    if !false_seeds.is_empty() {
                        self.seed_map.insert(new_id, false_seeds);
                    }
                    if swap_info {
                        // the coverage identity follows the seeds
                        let covered_new_a = self.state(id).covered_new;
                        let covered_lines_a = self.state(id).covered_lines.clone();
                        let covered_new_b = self.state(new_id).covered_new;
                        let covered_lines_b = self.state(new_id).covered_lines.clone();
                        self.state_mut(id).covered_new = covered_new_b;
                        self.state_mut(id).covered_lines = covered_lines_b;
                        self.state_mut(new_id).covered_new = covered_new_a;
                        self.state_mut(new_id).covered_lines = covered_lines_a;
                    }
                }

                self.add_constraint_with_seeds(id, condition.clone())?;
                self.add_constraint_with_seeds(new_id, Expr::is_zero(&condition))?;

                if let Some(max_depth) = self.options.max_depth {
                    if self.state(id).depth >= max_depth {
                        self.terminate_state_early(id, "max-depth exceeded.");
                        self.terminate_state_early(new_id, "max-depth exceeded.");
                        return Ok((None, None));
                    }
                }

                Ok((Some(id), Some(new_id)))
            }
        }
    }

    fn timeout_in_fork(
        &mut self,
        id: StateId,
    ) -> Result<(Option<StateId>, Option<StateId>), ExecutionError> {
        let state = self.state_mut(id);
        state.pc = state.prev_pc;
        self.terminate_state_early(id, "Query timed out (fork).");
        Ok((None, None))
    }

    fn query_value(&mut self, id: StateId, expr: &Expr) -> Result<u128, SolverError> {
        self.stats.solver_queries += 1;
        self.solver.get_value(&self.states[&id].constraints, expr)
    }

    /// N-way branch: one output slot per condition, in order, each
    /// constrained by its condition. Logically N-1 forks.
    pub(crate) fn branch(
        &mut self,
        id: StateId,
        conditions: &[Expr],
    ) -> Result<Vec<Option<StateId>>, ExecutionError> {
        let n = conditions.len();
        assert!(n > 0, "branch needs at least one condition");

        let mut result: Vec<Option<StateId>> = Vec::with_capacity(n);
        let max_forks_hit = self
            .options
            .max_forks
            .map_or(false, |max| self.stats.forks >= max);

        if max_forks_hit {
            let survivor = self.rng.gen_range(0..n);
            for i in 0..n {
                result.push(if i == survivor { Some(id) } else { None });
            }
        } else {
            self.stats.forks += (n - 1) as u64;
            result.push(Some(id));
            for _ in 1..n {
                // branch from a random earlier result to avoid bias
                let pick = self.rng.gen_range(0..result.len());
                let base = result[pick].expect("earlier results are live here");
                let new_id = self.fresh_state_id();
                let mut sibling = self.state_mut(base).branch(new_id);

                let node = self.state(base).ptree_node;
                let (base_leaf, new_leaf) = self.ptree.attach(node, base, new_id);
                self.state_mut(base).ptree_node = base_leaf;
                sibling.ptree_node = new_leaf;

                self.states.insert(new_id, sibling);
                self.added_states.push(new_id);
                result.push(Some(new_id));
            }
        }

        // each seed goes to the (single) condition it satisfies
        if let Some(seeds) = self.seed_map.remove(&id) {
            for seed in seeds {
                let index = conditions
                    .iter()
                    .position(|c| eval_bool(c, &seed.assignment))
                    .unwrap_or_else(|| self.rng.gen_range(0..n));
                if let Some(target) = result[index] {
                    self.seed_map.entry(target).or_insert_with(Vec::new).push(seed);
                }
            }
            if self.options.only_replay_seeds {
                for slot in result.iter_mut() {
                    if let Some(sid) = *slot {
                        if !self.seed_map.contains_key(&sid) {
                            self.terminate_state(sid);
                            *slot = None;
                        }
                    }
                }
            }
        }

        for (index, condition) in conditions.iter().enumerate() {
            if let Some(sid) = result[index] {
                self.add_constraint_with_seeds(sid, condition.clone())?;
            }
        }

        Ok(result)
    }

    // ------------------------------------------------------------------
    // termination

    pub(crate) fn terminate_state(&mut self, id: StateId) {
        if self.removed_states.contains(&id) {
            return;
        }
        self.handler.inc_paths_explored();
        self.stats.paths_completed += 1;
        let state = self.state_mut(id);
        state.pc = state.prev_pc;
        self.removed_states.push(id);
    }

    fn build_test_case(
        &mut self,
        id: StateId,
        kind: Option<TerminateReason>,
        message: Option<String>,
    ) -> TestCase {
        let (arrays, symbolics, nondets, path, instruction) = {
            let state = self.state(id);
            (
                state.arrays(),
                state.symbolics.clone(),
                state.nondet_values.clone(),
                state.path.clone(),
                state.prev_pc,
            )
        };
        let assignment = self
            .solver
            .get_initial_values(&self.states[&id].constraints, &arrays)
            .unwrap_or_default();

        let objects = symbolics
            .iter()
            .map(|(_, array)| TestObject {
                name: array.name.clone(),
                bytes: assignment
                    .get(&array.name)
                    .cloned()
                    .unwrap_or_else(|| vec![0; array.size as usize]),
            })
            .collect();

        let nondets = nondets
            .iter()
            .map(|nondet| NondetEntry {
                name: nondet.name.clone(),
                width: nondet.width,
                is_signed: nondet.is_signed,
                bytes: assignment
                    .get(&nondet.array.name)
                    .cloned()
                    .unwrap_or_else(|| vec![0; nondet.array.size as usize]),
            })
            .collect();

        TestCase {
            objects,
            nondets,
            kind,
            message,
            instruction: Some(instruction),
            path,
        }
    }

    /// Non-error termination before the path finished (timeouts, memory
    /// cap, halt).
    pub(crate) fn terminate_state_early(&mut self, id: StateId, message: &str) {
        if self.removed_states.contains(&id) {
            return;
        }
        let emit = self.options.exit_on_error_kind.is_empty()
            && (!self.options.only_output_states_covering_new
                || self.state(id).covered_new
                || self.seed_map.contains_key(&id));
        if emit {
            let test = self.build_test_case(id, None, Some(message.to_string()));
            self.handler.process_test_case(test);
        }
        self.terminate_state(id);
    }

    /// Clean exit of the program; runs the leak checks when enabled.
    pub(crate) fn terminate_state_on_exit(&mut self, id: StateId) {
        if self.removed_states.contains(&id) {
            return;
        }
        if self.options.check_leaks || self.options.check_memcleanup {
            let leaks = self.memory_leaks(id);
            if !leaks.is_empty() {
                if self.options.check_memcleanup {
                    let info = leaks
                        .iter()
                        .map(|mo| format!("\t{} of size {}", mo.alloc_site, mo.allocated_size))
                        .collect::<Vec<_>>()
                        .join("\n");
                    self.terminate_state_on_error(
                        id,
                        TerminateReason::Leak,
                        "memory error: memory not cleaned up",
                        Some(info),
                    );
                    return;
                }

                debug!("found unfreed memory, checking whether it is still reachable");
                let reachable = self.reachable_memory_objects(id);
                for leak in &leaks {
                    if !reachable.contains(&leak.segment) {
                        let info = format!("\t{} of size {}", leak.alloc_site, leak.allocated_size);
                        self.terminate_state_on_error(
                            id,
                            TerminateReason::Leak,
                            "memory error: memory leak detected",
                            Some(info),
                        );
                        return;
                    }
                }
                // everything unfreed is still reachable
                self.terminate_state(id);
                return;
            }
        }

        let emit = self.options.exit_on_error_kind.is_empty()
            && (!self.options.only_output_states_covering_new
                || self.state(id).covered_new
                || self.seed_map.contains_key(&id));
        if emit {
            let test = self.build_test_case(id, None, None);
            self.handler.process_test_case(test);
        }
        self.terminate_state(id);
    }

    /// Error termination: dedup, emit the artifact, honour
    /// exit-on-error-type.
    pub(crate) fn terminate_state_on_error(
        &mut self,
        id: StateId,
        kind: TerminateReason,
        message: &str,
        info: Option<String>,
    ) {
        if self.removed_states.contains(&id) {
            return;
        }
        let site = self.state(id).prev_pc;

        if self.options.exit_on_error_kind.contains(&kind) {
            self.halt_execution = true;
        }

        let not_emitted = self.emitted_errors.insert((site, message.to_string()));
        if self.options.emit_all_errors || not_emitted {
            warn!("ERROR: {}: {}", site, message);
            if !self.options.emit_all_errors {
                debug!("NOTE: now ignoring this error at this location");
            }
        }

        if self.options.emit_all_errors
            || self.halt_execution
            || (self.options.exit_on_error_kind.is_empty() && not_emitted)
        {
            let message = match info {
                Some(info) => format!("{}\n{}", message, info),
                None => message.to_string(),
            };
            let test = self.build_test_case(id, Some(kind), Some(message));
            self.handler.process_test_case(test);
        }

        self.terminate_state(id);
    }

    // ------------------------------------------------------------------
    // leak detection

    fn memory_leaks(&self, id: StateId) -> Vec<Rc<MemoryObject>> {
        self.state(id)
            .address_space
            .iter()
            .filter(|(mo, _)| mo.is_heap())
            .map(|(mo, _)| Rc::clone(mo))
            .collect()
    }

    /// Segments reachable from globals and the remaining frame's locals,
    /// following stored pointers through the segment plane.
    fn reachable_memory_objects(&mut self, id: StateId) -> HashSet<u64> {
        let mut reachable: HashSet<u64> = HashSet::new();
        let mut queue: Vec<u64> = Vec::new();

        for (mo, _) in self.state(id).address_space.iter() {
            if mo.is_local || mo.is_global {
                if reachable.insert(mo.segment) {
                    queue.push(mo.segment);
                }
            }
        }
        for frame in &self.state(id).stack {
            for local in frame.locals.iter().flatten() {
                if let Some(segment) = local.constant_segment() {
                    if segment >= FIRST_ORDINARY_SEGMENT && reachable.insert(segment) {
                        queue.push(segment);
                    }
                }
            }
        }

        while let Some(segment) = queue.pop() {
            let (mo, os) = match self.state(id).address_space.find_by_segment(segment) {
                Some(pair) => (Rc::clone(&pair.0), ObjectState::clone(&pair.1)),
                None => continue,
            };
            let offsets = pointer_offsets(&mo);
            let mut os = os;
            for offset in offsets {
                let value = os.read(&Expr::pointer(offset), PTR_WIDTH);
                let target = match value.segment.as_u64() {
                    Some(segment) => segment,
                    None => match self.to_unique(id, &value.segment) {
                        Ok(expr) => match expr.as_u64() {
                            Some(segment) => segment,
                            None => {
                                warn!("cannot resolve non-constant segment in leak check");
                                continue;
                            }
                        },
                        Err(_) => continue,
                    },
                };
                if target >= FIRST_ORDINARY_SEGMENT && reachable.insert(target) {
                    queue.push(target);
                }
            }
        }

        reachable
    }

    // ------------------------------------------------------------------
    // error info

    /// Human-readable description of a pointer, attached to memory error
    /// artifacts.
    pub(crate) fn describe_address(&mut self, id: StateId, address: &Value) -> String {
        let mut out = format!("\taddress: {}\n", address);
        let segment = if address.is_constant() {
            address.constant_segment().unwrap()
        } else {
            let segment = self
                .solver
                .get_value(&self.states[&id].constraints, &address.segment)
                .unwrap_or(0) as u64;
            let offset = self
                .solver
                .get_value(&self.states[&id].constraints, &address.offset)
                .unwrap_or(0) as u64;
            out.push_str(&format!("\texample: {}:{:#x}\n", segment, offset));
            segment
        };
        match self.state(id).address_space.find_by_segment(segment) {
            Some((mo, _)) => out.push_str(&format!(
                "\tpointing to: object of size {} from {}",
                mo.allocated_size, mo.alloc_site
            )),
            None => {
                if self.memory.was_freed(segment) {
                    out.push_str("\tpointing to: a freed allocation");
                } else {
                    out.push_str("\tpointing to: none");
                }
            }
        }
        out
    }

    pub(crate) fn seed_infos(&mut self, id: StateId) -> Option<&mut Vec<SeedInfo>> {
        self.seed_map.get_mut(&id)
    }

    pub(crate) fn is_seeding(&self, id: StateId) -> bool {
        self.seed_map.contains_key(&id)
    }
}

/// Byte offsets inside `mo` that may hold pointers: the allocation-site
/// type's pointer fields when known, else every aligned slot.
fn pointer_offsets(mo: &MemoryObject) -> Vec<u64> {
    fn walk(ty: &Type, base: u64, out: &mut Vec<u64>) {
        match ty {
            Type::Pointer => out.push(base),
            Type::Struct(fields) => {
                let mut offset = base;
                for field in fields {
                    walk(field, offset, out);
                    offset += field.store_size();
                }
            }
            Type::Array(element, count) | Type::Vector(element, count) => {
                let size = element.store_size();
                for index in 0..*count {
                    walk(element, base + index * size, out);
                }
            }
            _ => {}
        }
    }

    let mut offsets = Vec::new();
    match &mo.alloc_site.ty {
        Some(ty) => walk(ty, 0, &mut offsets),
        None => {
            let mut offset = 0;
            while offset + 8 <= mo.allocated_size {
                offsets.push(offset);
                offset += 8;
            }
        }
    }
    offsets
}
