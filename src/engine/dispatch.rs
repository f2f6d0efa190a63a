//! Per-opcode semantics of the IR, plus the memory-operation protocol and
//! the modelled runtime functions (allocation, harness primitives, and the
//! external-call bridge policy).

use crate::address_space::SegmentAddressMap;
use crate::engine::executor::Executor;
use crate::engine::external::ExternalCallPolicy;
use crate::error::{ExecutionError, TerminateReason};
use crate::exploration_strategy::ExplorationStrategy;
use crate::expr::{Array, BinOp, CmpOp, Expr, UpdateList, Value, Width, PTR_WIDTH};
use crate::ir::{
    BlockId, CastOp, CmpPred, CodePtr, FloatCastOp, FloatCmpPred, FloatOp, FunctionId,
    Instruction, LocalId, Operand, Type,
};
use crate::memory::{AllocSite, MemoryObject, ObjectState, FUNCTIONS_SEGMENT};
use crate::solver::{eval_expr, Solver, SolverError};
use crate::state::{NondetValue, StateId};
use itertools::Itertools;
use lazy_static::lazy_static;
use log::{trace, warn};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

/// Allocation bound used when a symbolic size has no reasonable upper
/// estimate.
const MAX_ALLOC_BOUND: u64 = 1 << 31;

lazy_static! {
    /// Declared functions the engine models itself instead of treating as
    /// external calls.
    static ref MODELLED_FUNCTIONS: HashSet<&'static str> = [
        "malloc",
        "calloc",
        "realloc",
        "free",
        "abort",
        "exit",
        "_exit",
        "assert_fail",
        "__assert_fail",
        "report_error",
        "make_symbolic",
        "define_fixed_object",
        "make_concrete",
        "get_value",
        "errno_location",
        "__errno_location",
        "fabs",
        "va_start",
        "va_end",
        "lifetime_start",
        "lifetime_end",
    ]
    .iter()
    .copied()
    .collect();
}

macro_rules! eval_op {
    ($self:ident, $id:ident, $op:expr) => {
        match $self.eval_operand($id, $op) {
            Ok(value) => value,
            Err(message) => {
                $self.terminate_state_on_error($id, TerminateReason::Exec, &message, None);
                return Ok(());
            }
        }
    };
}

fn coerce_width(value: Value, to: Width, signed: bool) -> Value {
    let from = value.width();
    if from == to {
        value
    } else if to < from {
        value.extract(0, to)
    } else if signed {
        value.sext(to)
    } else {
        value.zext(to)
    }
}

fn bool_condition(value: &Value) -> Expr {
    if value.width() == 1 {
        value.offset.clone()
    } else {
        Expr::not(Expr::is_zero(&value.offset))
    }
}

impl<'a, E, S> Executor<'a, E, S>
where
    E: ExplorationStrategy,
    S: Solver,
{
    fn eval_operand(&self, id: StateId, operand: &Operand) -> Result<Value, String> {
        match operand {
            Operand::Local(local) => self
                .state(id)
                .local(*local)
                .cloned()
                .ok_or_else(|| format!("use of uninitialized register r{}", local)),
            Operand::ConstInt { width, bits } => Ok(Value::constant(*width, *bits)),
            Operand::ConstNull => Ok(Value::null_pointer()),
            Operand::Function(function) => Ok(Value::pointer(
                FUNCTIONS_SEGMENT,
                Expr::pointer(*function as u64),
            )),
            Operand::Global(global) => Ok(self.global_objects[*global].pointer()),
        }
    }

    fn transfer_to_block(&mut self, id: StateId, dest: BlockId, src: BlockId) {
        let state = self.state_mut(id);
        state.incoming_bb_index = src;
        let function = state.pc.function;
        state.pc = CodePtr::block_entry(function, dest);
        trace!("[{}] transfer to b{} (from b{})", id, dest, src);
    }

    fn may_be_true(&mut self, id: StateId, expr: &Expr) -> Result<bool, SolverError> {
        self.stats.solver_queries += 1;
        self.solver.may_be_true(&self.states[&id].constraints, expr)
    }

    fn must_be_true(&mut self, id: StateId, expr: &Expr) -> Result<bool, SolverError> {
        self.stats.solver_queries += 1;
        self.solver.must_be_true(&self.states[&id].constraints, expr)
    }

    /// Bind `value` into the destination of the call instruction the state
    /// is currently returning from (its `prev_pc`).
    fn bind_call_result(&mut self, id: StateId, value: Value) {
        let caller = self.state(id).prev_pc;
        let function = self.module().function(caller.function);
        if let Instruction::Call {
            dest: Some(dest),
            return_type,
            sext_return,
            ..
        } = &function.blocks[caller.block].instructions[caller.index]
        {
            let to = return_type.width();
            if to == 0 {
                return;
            }
            let (dest, sext) = (*dest, *sext_return);
            let value = coerce_width(value, to, sext);
            self.state_mut(id).bind_local(dest, value);
        }
    }

    pub(crate) fn execute_instruction(
        &mut self,
        id: StateId,
        instruction: &Instruction,
    ) -> Result<(), ExecutionError> {
        match instruction {
            Instruction::Ret { value } => self.execute_ret(id, value),
            Instruction::Br { dest } => {
                let src = self.state(id).pc.block;
                self.transfer_to_block(id, *dest, src);
                Ok(())
            }
            Instruction::CondBr {
                cond,
                then_dest,
                else_dest,
            } => {
                let src = self.state(id).pc.block;
                let cond_value = eval_op!(self, id, cond);
                let condition = bool_condition(&cond_value);
                let (true_state, false_state) = self.fork(id, condition, false)?;
                if let Some(sid) = true_state {
                    self.transfer_to_block(sid, *then_dest, src);
                }
                if let Some(sid) = false_state {
                    self.transfer_to_block(sid, *else_dest, src);
                }
                Ok(())
            }
            Instruction::Switch {
                cond,
                default_dest,
                cases,
            } => self.execute_switch(id, cond, *default_dest, cases),
            Instruction::IndirectBr {
                address,
                destinations,
            } => self.execute_indirect_br(id, address, destinations),
            Instruction::Call { callee, args, .. } => {
                let mut arg_values = Vec::with_capacity(args.len());
                for arg in args {
                    arg_values.push(eval_op!(self, id, arg));
                }
                let callee_value = eval_op!(self, id, callee);
                self.execute_call_value(id, callee_value, arg_values)
            }
            Instruction::Phi { dest, incoming } => {
                let pred = self.state(id).incoming_bb_index;
                let entry = incoming.iter().find(|(block, _)| *block == pred);
                match entry {
                    Some((_, operand)) => {
                        let value = eval_op!(self, id, operand);
                        self.state_mut(id).bind_local(*dest, value);
                        Ok(())
                    }
                    None => {
                        self.terminate_state_on_error(
                            id,
                            TerminateReason::Exec,
                            "phi node without an entry for the predecessor block",
                            None,
                        );
                        Ok(())
                    }
                }
            }
            Instruction::Select {
                dest,
                cond,
                then_value,
                else_value,
            } => {
                let cond_value = eval_op!(self, id, cond);
                let then_v = eval_op!(self, id, then_value);
                let else_v = eval_op!(self, id, else_value);
                let condition = bool_condition(&cond_value);
                let result = Value {
                    segment: Expr::select(
                        condition.clone(),
                        then_v.segment.clone(),
                        else_v.segment.clone(),
                    ),
                    offset: Expr::select(condition, then_v.offset, else_v.offset),
                };
                self.state_mut(id).bind_local(*dest, result);
                Ok(())
            }
            Instruction::Alloca {
                dest,
                element_type,
                count,
                alignment,
            } => self.execute_alloca(id, *dest, element_type, count, *alignment),
            Instruction::Load { dest, address, ty } => {
                let address = eval_op!(self, id, address);
                self.execute_memory_operation(id, None, address, Some((*dest, ty.width())))
            }
            Instruction::Store { address, value } => {
                let value = eval_op!(self, id, value);
                let address = eval_op!(self, id, address);
                self.execute_memory_operation(id, Some(value), address, None)
            }
            Instruction::GetElementPtr {
                dest,
                base,
                offset,
                indices,
            } => {
                let mut pointer = eval_op!(self, id, base);
                for (operand, element_size) in indices {
                    let index = eval_op!(self, id, operand);
                    let index = coerce_width(index, PTR_WIDTH, true);
                    let scaled =
                        Expr::mul(Expr::pointer(*element_size), index.offset);
                    pointer = pointer.add(&Value::scalar(scaled));
                }
                if *offset != 0 {
                    pointer = pointer.add(&Value::from_u64(*offset));
                }
                self.state_mut(id).bind_local(*dest, pointer);
                Ok(())
            }
            Instruction::Cast {
                dest,
                op,
                value,
                ty,
            } => {
                let value = eval_op!(self, id, value);
                let width = ty.width();
                let result = match op {
                    CastOp::Trunc => value.extract(0, width),
                    CastOp::SExt => coerce_width(value, width, true),
                    // provenance survives all pointer/integer casts
                    CastOp::ZExt | CastOp::PtrToInt | CastOp::IntToPtr => {
                        coerce_width(value, width, false)
                    }
                    CastOp::BitCast => value,
                };
                self.state_mut(id).bind_local(*dest, result);
                Ok(())
            }
            Instruction::Binary { dest, op, lhs, rhs } => {
                let lhs = eval_op!(self, id, lhs);
                let rhs = eval_op!(self, id, rhs);
                self.execute_binary(id, *dest, *op, lhs, rhs)
            }
            Instruction::ICmp {
                dest,
                pred,
                lhs,
                rhs,
            } => {
                let lhs = eval_op!(self, id, lhs);
                let rhs = eval_op!(self, id, rhs);
                let result = self.integer_compare(*pred, &lhs, &rhs);
                self.state_mut(id).bind_local(*dest, Value::scalar(result));
                Ok(())
            }
            Instruction::FBinary {
                dest,
                op,
                lhs,
                rhs,
                ty,
            } => self.execute_float_binary(id, *dest, *op, lhs, rhs, ty),
            Instruction::FCmp {
                dest,
                pred,
                lhs,
                rhs,
                ty,
            } => self.execute_float_compare(id, *dest, *pred, lhs, rhs, ty),
            Instruction::FCast {
                dest,
                op,
                value,
                from,
                to,
            } => self.execute_float_cast(id, *dest, *op, value, from, to),
            Instruction::InsertElement {
                dest,
                vector,
                element,
                index,
                element_width,
                count,
            } => {
                let vector = eval_op!(self, id, vector);
                let element = eval_op!(self, id, element);
                let index = eval_op!(self, id, index);
                self.execute_insert_element(
                    id,
                    *dest,
                    vector,
                    element,
                    index,
                    *element_width,
                    *count,
                )
            }
            Instruction::ExtractElement {
                dest,
                vector,
                index,
                element_width,
                count,
            } => {
                let vector = eval_op!(self, id, vector);
                let index = eval_op!(self, id, index);
                let index = match index.offset.as_u64() {
                    Some(index) => index,
                    None => {
                        self.terminate_state_on_error(
                            id,
                            TerminateReason::BadVectorAccess,
                            "symbolic index on a vector extract",
                            None,
                        );
                        return Ok(());
                    }
                };
                if index >= *count {
                    self.terminate_state_on_error(
                        id,
                        TerminateReason::BadVectorAccess,
                        "out of bounds read when extracting an element",
                        None,
                    );
                    return Ok(());
                }
                let result = Expr::extract(
                    vector.offset,
                    index as Width * element_width,
                    *element_width,
                );
                self.state_mut(id).bind_local(*dest, Value::scalar(result));
                Ok(())
            }
            Instruction::VaArg { .. } => {
                self.terminate_state_on_error(
                    id,
                    TerminateReason::Exec,
                    "va_arg must be lowered before execution",
                    None,
                );
                Ok(())
            }
            Instruction::Unreachable => {
                self.terminate_state_on_error(
                    id,
                    TerminateReason::Exec,
                    "reached an unreachable instruction",
                    None,
                );
                Ok(())
            }
            Instruction::AtomicRmw | Instruction::AtomicCmpXchg => {
                self.terminate_state_on_error(
                    id,
                    TerminateReason::Exec,
                    "atomic operations must be lowered before execution",
                    None,
                );
                Ok(())
            }
            Instruction::ShuffleVector => {
                self.terminate_state_on_error(
                    id,
                    TerminateReason::Exec,
                    "shufflevector must be lowered before execution",
                    None,
                );
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // control flow

    fn execute_ret(&mut self, id: StateId, value: &Option<Operand>) -> Result<(), ExecutionError> {
        let result = match value {
            Some(operand) => Some(eval_op!(self, id, operand)),
            None => None,
        };

        if self.state(id).stack.len() <= 1 {
            self.terminate_state_on_exit(id);
            return Ok(());
        }

        let frame = self.state_mut(id).pop_frame();
        for mo in &frame.allocas {
            self.state_mut(id).address_space.unbind(mo);
        }
        if let Some(varargs) = &frame.varargs {
            self.state_mut(id).address_space.unbind(varargs);
        }

        let caller = frame.caller.expect("non-entry frame has a caller");
        self.state_mut(id).pc = caller.next();

        let function = self.module().function(caller.function);
        let call = function.blocks[caller.block].instructions[caller.index].clone();
        if let Instruction::Call {
            dest,
            return_type,
            sext_return,
            ..
        } = call
        {
            match (dest, result) {
                (Some(dest), Some(result)) => {
                    let coerced = coerce_width(result, return_type.width(), sext_return);
                    self.state_mut(id).bind_local(dest, coerced);
                }
                (Some(_), None) => {
                    self.terminate_state_on_error(
                        id,
                        TerminateReason::Exec,
                        "return void when caller expected a result",
                        None,
                    );
                }
                _ => {}
            }
        } else {
            panic!("return site is not a call instruction");
        }
        Ok(())
    }

    fn execute_switch(
        &mut self,
        id: StateId,
        cond: &Operand,
        default_dest: BlockId,
        cases: &[(u128, BlockId)],
    ) -> Result<(), ExecutionError> {
        let src = self.state(id).pc.block;
        let cond_value = eval_op!(self, id, cond);
        let cond_expr = self.to_unique(id, &cond_value.offset)?;

        if let Some(bits) = cond_expr.as_constant() {
            let dest = cases
                .iter()
                .find(|(value, _)| *value == bits)
                .map(|(_, dest)| *dest)
                .unwrap_or(default_dest);
            self.transfer_to_block(id, dest, src);
            return Ok(());
        }

        // order the cases by value so exploration is deterministic
        let sorted: Vec<(u128, BlockId)> = cases
            .iter()
            .copied()
            .sorted_by_key(|(value, _)| *value)
            .collect();
        let width = cond_expr.width();

        let mut default_condition = Expr::bool_true();
        let mut order: Vec<BlockId> = Vec::new();
        let mut target_conditions: HashMap<BlockId, Expr> = HashMap::new();

        for (value, dest) in sorted {
            let matches = Expr::eq(Expr::constant(width, value), cond_expr.clone());
            if dest == default_dest {
                continue;
            }
            default_condition =
                Expr::and_bool(default_condition, Expr::is_zero(&matches));
            if self.may_be_true(id, &matches)? {
                // one disjunction per destination: cases sharing a target
                // share a branch instead of forking per case value
                match target_conditions.get_mut(&dest) {
                    Some(existing) => {
                        *existing = Expr::or_bool(existing.clone(), matches);
                    }
                    None => {
                        order.push(dest);
                        target_conditions.insert(dest, matches);
                    }
                }
            }
        }

        let mut targets = order.clone();
        let mut conditions: Vec<Expr> = order
            .iter()
            .map(|dest| target_conditions[dest].clone())
            .collect();
        if self.may_be_true(id, &default_condition)? {
            targets.push(default_dest);
            conditions.push(default_condition);
        }

        if conditions.is_empty() {
            self.terminate_state_early(id, "infeasible switch condition");
            return Ok(());
        }

        let results = self.branch(id, &conditions)?;
        for (index, slot) in results.iter().enumerate() {
            if let Some(sid) = *slot {
                self.transfer_to_block(sid, targets[index], src);
            }
        }
        Ok(())
    }

    fn execute_indirect_br(
        &mut self,
        id: StateId,
        address: &Operand,
        destinations: &[BlockId],
    ) -> Result<(), ExecutionError> {
        let src = self.state(id).pc.block;
        let address = eval_op!(self, id, address);
        let unique = self.to_unique(id, &address.offset)?;

        if let Some(bits) = unique.as_constant() {
            let dest = bits as usize;
            if !destinations.contains(&dest) {
                self.terminate_state_on_error(
                    id,
                    TerminateReason::Exec,
                    "indirect branch to an illegal label address",
                    None,
                );
                return Ok(());
            }
            self.transfer_to_block(id, dest, src);
            return Ok(());
        }

        let width = unique.width();
        let mut error_condition = Expr::bool_true();
        let mut targets: Vec<BlockId> = Vec::new();
        let mut conditions: Vec<Expr> = Vec::new();
        let mut seen: HashSet<BlockId> = HashSet::new();

        for dest in destinations {
            if !seen.insert(*dest) {
                continue;
            }
            let matches = Expr::eq(Expr::constant(width, *dest as u128), unique.clone());
            error_condition = Expr::and_bool(error_condition, Expr::is_zero(&matches));
            if self.may_be_true(id, &matches)? {
                targets.push(*dest);
                conditions.push(matches);
            }
        }

        let error_feasible = self.may_be_true(id, &error_condition)?;
        if error_feasible {
            conditions.push(error_condition);
        }

        let mut results = self.branch(id, &conditions)?;
        if error_feasible {
            if let Some(Some(sid)) = results.pop() {
                self.terminate_state_on_error(
                    sid,
                    TerminateReason::Exec,
                    "indirect branch to an illegal label address",
                    None,
                );
            }
        }
        for (index, slot) in results.iter().enumerate() {
            if let Some(sid) = *slot {
                self.transfer_to_block(sid, targets[index], src);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // calls

    fn execute_call_value(
        &mut self,
        id: StateId,
        callee: Value,
        args: Vec<Value>,
    ) -> Result<(), ExecutionError> {
        if let (Some(segment), Some(offset)) =
            (callee.constant_segment(), callee.offset.as_u64())
        {
            if segment != FUNCTIONS_SEGMENT {
                self.terminate_state_on_error(
                    id,
                    TerminateReason::Exec,
                    "call to an invalid function pointer",
                    None,
                );
                return Ok(());
            }
            if offset as usize >= self.module().functions.len() {
                self.terminate_state_on_error(
                    id,
                    TerminateReason::Exec,
                    "call to an unknown function",
                    None,
                );
                return Ok(());
            }
            return self.execute_call(id, offset as usize, args);
        }

        // symbolic function pointer: provenance must name the functions
        // segment, then feasible targets are enumerated one by one
        let segment_ok = Expr::eq(Expr::pointer(FUNCTIONS_SEGMENT), callee.segment.clone());
        match self.must_be_true(id, &segment_ok) {
            Ok(true) => {}
            Ok(false) => {
                self.terminate_state_on_error(
                    id,
                    TerminateReason::Exec,
                    "symbolic call target without function provenance",
                    None,
                );
                return Ok(());
            }
            Err(SolverError::Timeout) => {
                self.terminate_state_early(id, "Query timed out (call).");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let offset = callee.offset;
        let mut current = id;
        loop {
            let target = {
                self.stats.solver_queries += 1;
                match self
                    .solver
                    .get_value(&self.states[&current].constraints, &offset)
                {
                    Ok(bits) => bits as u64,
                    Err(SolverError::Timeout) => {
                        self.terminate_state_early(current, "Query timed out (call).");
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                }
            };
            let matches = Expr::eq(Expr::pointer(target), offset.clone());
            let (matched, rest) = self.fork(current, matches, true)?;
            if let Some(sid) = matched {
                if (target as usize) < self.module().functions.len() {
                    self.execute_call(sid, target as usize, args.clone())?;
                } else {
                    self.terminate_state_on_error(
                        sid,
                        TerminateReason::Exec,
                        "call to an unknown function",
                        None,
                    );
                }
            }
            match rest {
                Some(sid) => current = sid,
                None => break,
            }
        }
        Ok(())
    }

    fn execute_call(
        &mut self,
        id: StateId,
        function: FunctionId,
        args: Vec<Value>,
    ) -> Result<(), ExecutionError> {
        let (is_declaration, params, num_locals, is_variadic) = {
            let f = self.module().function(function);
            (
                f.is_declaration(),
                f.params.clone(),
                f.num_locals,
                f.is_variadic,
            )
        };

        if is_declaration {
            return self.call_declared_function(id, function, args);
        }

        if self.state(id).stack.len() >= self.options.max_stack_frames {
            self.terminate_state_early(id, "max stack frames exceeded");
            return Ok(());
        }
        if args.len() < params.len() {
            self.terminate_state_on_error(
                id,
                TerminateReason::Exec,
                "calling function with too few arguments",
                None,
            );
            return Ok(());
        }

        let caller = self.state(id).prev_pc;
        self.state_mut(id).push_frame(function, caller, num_locals);
        for (index, param) in params.iter().enumerate() {
            let arg = coerce_width(args[index].clone(), param.width(), false);
            self.state_mut(id).bind_local(index, arg);
        }

        if is_variadic {
            self.setup_varargs(id, &args[params.len()..])?;
        }

        self.state_mut(id).pc = CodePtr::entry(function);
        Ok(())
    }

    /// Lay the extra arguments of a variadic call out in an overflow area:
    /// eight-byte slots, sixteen-byte alignment for anything wider than 64
    /// bits.
    fn setup_varargs(&mut self, id: StateId, extra: &[Value]) -> Result<(), ExecutionError> {
        let mut offsets = Vec::with_capacity(extra.len());
        let mut size: u64 = 0;
        for value in extra {
            let bytes = u64::from((value.width() + 7) / 8);
            if value.width() > 64 {
                size = (size + 15) & !15;
            }
            offsets.push(size);
            size += bytes.max(8);
        }
        let size = size.max(8);

        let site = AllocSite::at("varargs area", self.state(id).prev_pc);
        let mo = match self
            .memory
            .allocate(Expr::pointer(size), size, true, false, site, 16)
        {
            Some(mo) => mo,
            None => {
                self.terminate_state_early(id, "out of segments for varargs");
                return Ok(());
            }
        };
        let mut os = ObjectState::new(&mo);
        for (value, offset) in extra.iter().zip(&offsets) {
            os.write(&Expr::pointer(*offset), value);
        }
        self.state_mut(id).address_space.bind(Rc::clone(&mo), os);
        self.state_mut(id).frame_mut().varargs = Some(mo);
        Ok(())
    }

    // ------------------------------------------------------------------
    // integer & float computation

    fn execute_binary(
        &mut self,
        id: StateId,
        dest: LocalId,
        op: BinOp,
        lhs: Value,
        rhs: Value,
    ) -> Result<(), ExecutionError> {
        // feasible division by zero and oversized shifts become error
        // states of their own; the surviving state carries the guard
        let guard = match op {
            BinOp::UDiv | BinOp::SDiv | BinOp::URem | BinOp::SRem => {
                Some((Expr::not(Expr::is_zero(&rhs.offset)), "division by zero"))
            }
            BinOp::Shl | BinOp::LShr | BinOp::AShr => Some((
                Expr::ult(
                    rhs.offset.clone(),
                    Expr::constant(rhs.width(), u128::from(rhs.width())),
                ),
                "shift amount exceeds the bit width",
            )),
            _ => None,
        };

        let target = match guard {
            Some((condition, message)) => {
                if condition.is_false() {
                    self.terminate_state_on_error(
                        id,
                        TerminateReason::Overflow,
                        message,
                        None,
                    );
                    return Ok(());
                }
                if condition.is_true() {
                    Some(id)
                } else {
                    let (ok, bad) = self.fork(id, condition, true)?;
                    if let Some(sid) = bad {
                        self.terminate_state_on_error(
                            sid,
                            TerminateReason::Overflow,
                            message,
                            None,
                        );
                    }
                    ok
                }
            }
            None => Some(id),
        };

        if let Some(sid) = target {
            let result = Value::binary(op, &lhs, &rhs);
            self.state_mut(sid).bind_local(dest, result);
        }
        Ok(())
    }

    fn integer_compare(&mut self, pred: CmpPred, lhs: &Value, rhs: &Value) -> Expr {
        let (pred, lhs, rhs) = match pred {
            CmpPred::Ugt => (CmpPred::Ult, rhs, lhs),
            CmpPred::Uge => (CmpPred::Ule, rhs, lhs),
            CmpPred::Sgt => (CmpPred::Slt, rhs, lhs),
            CmpPred::Sge => (CmpPred::Sle, rhs, lhs),
            pred => (pred, lhs, rhs),
        };

        match pred {
            CmpPred::Eq | CmpPred::Ne => {
                let eq = self.pointer_aware_eq(lhs, rhs);
                if pred == CmpPred::Ne {
                    Expr::not(eq)
                } else {
                    eq
                }
            }
            _ => {
                let (left, right) = self.comparable_offsets(lhs, rhs);
                let op = match pred {
                    CmpPred::Ult => CmpOp::Ult,
                    CmpPred::Ule => CmpOp::Ule,
                    CmpPred::Slt => CmpOp::Slt,
                    CmpPred::Sle => CmpOp::Sle,
                    _ => unreachable!("equality handled above"),
                };
                Expr::cmp(op, left, right)
            }
        }
    }

    fn distinct_object_segments(lhs: &Value, rhs: &Value) -> Option<(u64, u64)> {
        match (lhs.constant_segment(), rhs.constant_segment()) {
            (Some(a), Some(b)) if a != 0 && b != 0 && a != b => Some((a, b)),
            _ => None,
        }
    }

    fn pointer_aware_eq(&mut self, lhs: &Value, rhs: &Value) -> Expr {
        if lhs.segment == rhs.segment {
            return Expr::eq(lhs.offset.clone(), rhs.offset.clone());
        }
        if let Some((a, b)) = Self::distinct_object_segments(lhs, rhs) {
            // pointers into different objects compare through symbolic
            // representative addresses
            let left = Expr::add(self.repr_address(a), lhs.offset.clone());
            let right = Expr::add(self.repr_address(b), rhs.offset.clone());
            return Expr::eq(left, right);
        }
        lhs.eq_value(rhs)
    }

    fn comparable_offsets(&mut self, lhs: &Value, rhs: &Value) -> (Expr, Expr) {
        if let Some((a, b)) = Self::distinct_object_segments(lhs, rhs) {
            let left = Expr::add(self.repr_address(a), lhs.offset.clone());
            let right = Expr::add(self.repr_address(b), rhs.offset.clone());
            return (left, right);
        }
        (lhs.offset.clone(), rhs.offset.clone())
    }

    fn float_operand(
        &mut self,
        id: StateId,
        operand: &Operand,
        ty: &Type,
    ) -> Result<Result<u128, ()>, ExecutionError> {
        let value = match self.eval_operand(id, operand) {
            Ok(value) => value,
            Err(message) => {
                self.terminate_state_on_error(id, TerminateReason::Exec, &message, None);
                return Ok(Err(()));
            }
        };
        if !matches!(ty, Type::Float | Type::Double) {
            self.terminate_state_on_error(
                id,
                TerminateReason::Exec,
                "unsupported floating point width",
                None,
            );
            return Ok(Err(()));
        }
        let constant = self.to_constant(id, &value.offset, "floating point")?;
        Ok(Ok(constant.as_constant().expect("to_constant yields a constant")))
    }

    fn execute_float_binary(
        &mut self,
        id: StateId,
        dest: LocalId,
        op: FloatOp,
        lhs: &Operand,
        rhs: &Operand,
        ty: &Type,
    ) -> Result<(), ExecutionError> {
        let left = match self.float_operand(id, lhs, ty)? {
            Ok(bits) => bits,
            Err(()) => return Ok(()),
        };
        let right = match self.float_operand(id, rhs, ty)? {
            Ok(bits) => bits,
            Err(()) => return Ok(()),
        };

        let bits = match ty {
            Type::Float => {
                let a = f32::from_bits(left as u32);
                let b = f32::from_bits(right as u32);
                let r = match op {
                    FloatOp::FAdd => a + b,
                    FloatOp::FSub => a - b,
                    FloatOp::FMul => a * b,
                    FloatOp::FDiv => a / b,
                    FloatOp::FRem => a % b,
                };
                r.to_bits() as u128
            }
            _ => {
                let a = f64::from_bits(left as u64);
                let b = f64::from_bits(right as u64);
                let r = match op {
                    FloatOp::FAdd => a + b,
                    FloatOp::FSub => a - b,
                    FloatOp::FMul => a * b,
                    FloatOp::FDiv => a / b,
                    FloatOp::FRem => a % b,
                };
                r.to_bits() as u128
            }
        };
        self.state_mut(id)
            .bind_local(dest, Value::constant(ty.width(), bits));
        Ok(())
    }

    fn execute_float_compare(
        &mut self,
        id: StateId,
        dest: LocalId,
        pred: FloatCmpPred,
        lhs: &Operand,
        rhs: &Operand,
        ty: &Type,
    ) -> Result<(), ExecutionError> {
        let left = match self.float_operand(id, lhs, ty)? {
            Ok(bits) => bits,
            Err(()) => return Ok(()),
        };
        let right = match self.float_operand(id, rhs, ty)? {
            Ok(bits) => bits,
            Err(()) => return Ok(()),
        };

        let (a, b) = match ty {
            Type::Float => (
                f32::from_bits(left as u32) as f64,
                f32::from_bits(right as u32) as f64,
            ),
            _ => (f64::from_bits(left as u64), f64::from_bits(right as u64)),
        };
        let result = match pred {
            FloatCmpPred::Oeq => a == b,
            FloatCmpPred::One => a < b || a > b,
            FloatCmpPred::Olt => a < b,
            FloatCmpPred::Ole => a <= b,
            FloatCmpPred::Ogt => a > b,
            FloatCmpPred::Oge => a >= b,
        };
        self.state_mut(id)
            .bind_local(dest, Value::constant(1, result as u128));
        Ok(())
    }

    fn execute_float_cast(
        &mut self,
        id: StateId,
        dest: LocalId,
        op: FloatCastOp,
        value: &Operand,
        from: &Type,
        to: &Type,
    ) -> Result<(), ExecutionError> {
        let source_ty = match op {
            FloatCastOp::UiToFp | FloatCastOp::SiToFp => to,
            _ => from,
        };
        let bits = match op {
            FloatCastOp::UiToFp | FloatCastOp::SiToFp => {
                let value = match self.eval_operand(id, value) {
                    Ok(value) => value,
                    Err(message) => {
                        self.terminate_state_on_error(id, TerminateReason::Exec, &message, None);
                        return Ok(());
                    }
                };
                let constant = self.to_constant(id, &value.offset, "floating point")?;
                constant.as_constant().expect("to_constant yields a constant")
            }
            _ => match self.float_operand(id, value, source_ty)? {
                Ok(bits) => bits,
                Err(()) => return Ok(()),
            },
        };

        let from_width = from.width();
        let result: u128 = match op {
            FloatCastOp::FpTrunc => {
                (f64::from_bits(bits as u64) as f32).to_bits() as u128
            }
            FloatCastOp::FpExt => {
                (f32::from_bits(bits as u32) as f64).to_bits() as u128
            }
            FloatCastOp::FpToUi => {
                let f = if from_width == 32 {
                    f32::from_bits(bits as u32) as f64
                } else {
                    f64::from_bits(bits as u64)
                };
                f as u64 as u128
            }
            FloatCastOp::FpToSi => {
                let f = if from_width == 32 {
                    f32::from_bits(bits as u32) as f64
                } else {
                    f64::from_bits(bits as u64)
                };
                f as i64 as u64 as u128
            }
            FloatCastOp::UiToFp => {
                let v = bits as u64 as f64;
                if to.width() == 32 {
                    (v as f32).to_bits() as u128
                } else {
                    v.to_bits() as u128
                }
            }
            FloatCastOp::SiToFp => {
                let shift = 128 - from_width;
                let v = (((bits << shift) as i128) >> shift) as i64 as f64;
                if to.width() == 32 {
                    (v as f32).to_bits() as u128
                } else {
                    v.to_bits() as u128
                }
            }
        };
        self.state_mut(id)
            .bind_local(dest, Value::constant(to.width(), result));
        Ok(())
    }

    fn execute_insert_element(
        &mut self,
        id: StateId,
        dest: LocalId,
        vector: Value,
        element: Value,
        index: Value,
        element_width: Width,
        count: u64,
    ) -> Result<(), ExecutionError> {
        let index = match index.offset.as_u64() {
            Some(index) => index,
            None => {
                self.terminate_state_on_error(
                    id,
                    TerminateReason::BadVectorAccess,
                    "symbolic index on a vector insert",
                    None,
                );
                return Ok(());
            }
        };
        if index >= count {
            self.terminate_state_on_error(
                id,
                TerminateReason::BadVectorAccess,
                "out of bounds write when inserting an element",
                None,
            );
            return Ok(());
        }

        let total = element_width * count as Width;
        let low_width = index as Width * element_width;
        let element = coerce_width(element, element_width, false);

        let mut result = element.offset;
        if low_width > 0 {
            result = Expr::concat(result, Expr::extract(vector.offset.clone(), 0, low_width));
        }
        let high_offset = low_width + element_width;
        if high_offset < total {
            result = Expr::concat(
                Expr::extract(vector.offset, high_offset, total - high_offset),
                result,
            );
        }
        self.state_mut(id).bind_local(dest, Value::scalar(result));
        Ok(())
    }

    // ------------------------------------------------------------------
    // memory operations

    /// The Load/Store protocol: fast-path single resolution with proved
    /// bounds, else enumerate and fork per candidate object.
    pub(crate) fn execute_memory_operation(
        &mut self,
        id: StateId,
        write: Option<Value>,
        address: Value,
        target: Option<(LocalId, Width)>,
    ) -> Result<(), ExecutionError> {
        let width = match (&write, &target) {
            (Some(value), _) => value.width(),
            (None, Some((_, width))) => *width,
            _ => unreachable!("memory operation is neither read nor write"),
        };
        let bytes = u64::from((width + 7) / 8);

        let mut address = address;
        let mut write = write;
        if self.options.simplify_sym_indices {
            let constraints = &self.states[&id].constraints;
            address = Value {
                segment: constraints.simplify_expr(&address.segment),
                offset: constraints.simplify_expr(&address.offset),
            };
            if let Some(value) = write {
                write = Some(Value {
                    segment: constraints.simplify_expr(&value.segment),
                    offset: constraints.simplify_expr(&value.offset),
                });
            }
        }

        self.solver.set_timeout(self.options.core_solver_timeout);
        let resolution = {
            let state = &self.states[&id];
            state
                .address_space
                .resolve_one(&state.constraints, &mut self.solver, &address)
        };
        self.solver.set_timeout(None);

        let resolution = match resolution {
            Ok(resolution) => resolution,
            Err(SolverError::Timeout) => {
                let segment = self.to_constant(id, &address.segment, "resolve failure")?;
                let offset = self.to_constant(id, &address.offset, "resolve failure")?;
                address = Value {
                    segment,
                    offset,
                };
                let state = &self.states[&id];
                state
                    .address_space
                    .resolve_one(&state.constraints, &mut self.solver, &address)
                    .unwrap_or(None)
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(resolution) = resolution {
            let mo = Rc::clone(&resolution.pair.0);

            if self.options.max_sym_array_size > 0 {
                let too_large = mo
                    .concrete_size()
                    .map_or(true, |size| size >= self.options.max_sym_array_size);
                if too_large {
                    let segment =
                        self.to_constant(id, &address.segment, "max-sym-array-size")?;
                    let offset =
                        self.to_constant(id, &address.offset, "max-sym-array-size")?;
                    address = Value { segment, offset };
                }
            }

            let (segment_expr, offset_expr) = match resolution.adjusted {
                Some((segment, offset)) => (Expr::pointer(segment), Expr::pointer(offset)),
                None => (address.segment.clone(), address.offset.clone()),
            };
            let segment_matches = Expr::eq(mo.segment_expr(), segment_expr);
            let offset_in_bounds = mo.bounds_check_offset(&offset_expr, bytes);

            self.solver.set_timeout(self.options.core_solver_timeout);
            let segment_proved = self.must_be_true(id, &segment_matches);
            let offset_proved = self.must_be_true(id, &offset_in_bounds);
            self.solver.set_timeout(None);

            let (segment_proved, offset_proved) = match (segment_proved, offset_proved) {
                (Ok(a), Ok(b)) => (a, b),
                (Err(SolverError::Timeout), _) | (_, Err(SolverError::Timeout)) => {
                    let state = self.state_mut(id);
                    state.pc = state.prev_pc;
                    self.terminate_state_early(id, "Query timed out (bounds check).");
                    return Ok(());
                }
                (Err(e), _) | (_, Err(e)) => return Err(e.into()),
            };

            if segment_proved && offset_proved {
                self.perform_access(id, &mo, &offset_expr, width, write, target);
                return Ok(());
            }
        }

        // error path: no resolution, several candidates, or an offset that
        // can leave the object
        self.solver.set_timeout(self.options.core_solver_timeout);
        let resolved = {
            let state = &self.states[&id];
            state.address_space.resolve(
                &state.constraints,
                &mut self.solver,
                &address,
                0,
                self.options.core_solver_timeout,
            )
        };
        self.solver.set_timeout(None);

        let (list, incomplete) = match resolved {
            Ok(result) => result,
            Err(SolverError::Timeout) => (Vec::new(), true),
            Err(e) => return Err(e.into()),
        };

        let mut unbound = Some(id);
        for pair in list {
            let mo = Rc::clone(&pair.0);
            let in_bounds = mo.bounds_check_pointer(&address, bytes);
            let current = unbound.take().expect("loop holds a live remainder");
            let (bound, rest) = self.fork(current, in_bounds, true)?;
            if let Some(sid) = bound {
                self.perform_access(sid, &mo, &address.offset, width, write.clone(), target);
            }
            unbound = rest;
            if unbound.is_none() {
                break;
            }
        }

        if let Some(sid) = unbound {
            if incomplete {
                self.terminate_state_early(sid, "Query timed out (resolve).");
            } else {
                let info = self.describe_address(sid, &address);
                self.terminate_state_on_error(
                    sid,
                    TerminateReason::Ptr,
                    "memory error: out of bound pointer",
                    Some(info),
                );
            }
        }
        Ok(())
    }

    fn perform_access(
        &mut self,
        id: StateId,
        mo: &Rc<MemoryObject>,
        offset: &Expr,
        width: Width,
        write: Option<Value>,
        target: Option<(LocalId, Width)>,
    ) {
        let read_only = self
            .state(id)
            .address_space
            .find(mo)
            .map(|pair| pair.1.read_only)
            .unwrap_or(false);
        match write {
            Some(value) => {
                if read_only {
                    self.terminate_state_on_error(
                        id,
                        TerminateReason::ReadOnly,
                        "memory error: object read only",
                        None,
                    );
                } else {
                    trace!("[{}] store {} bytes at {}:{}", id, (width + 7) / 8, mo.segment, offset);
                    self.state_mut(id)
                        .address_space
                        .writeable(mo)
                        .write(offset, &value);
                }
            }
            None => {
                let value = self
                    .state_mut(id)
                    .address_space
                    .writeable(mo)
                    .read(offset, width);
                trace!("[{}] load {} bytes at {}:{}", id, (width + 7) / 8, mo.segment, offset);
                if let Some((dest, _)) = target {
                    self.state_mut(id).bind_local(dest, value);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // allocation

    fn execute_alloca(
        &mut self,
        id: StateId,
        dest: LocalId,
        element_type: &Type,
        count: &Operand,
        alignment: u64,
    ) -> Result<(), ExecutionError> {
        let count = eval_op!(self, id, count);
        let count = coerce_width(count, PTR_WIDTH, false);
        let size = Expr::mul(Expr::pointer(element_type.store_size()), count.offset);

        let site_ty = match size.as_u64() {
            Some(total) if total == element_type.store_size() => Some(element_type.clone()),
            Some(_) => size.as_u64().map(|total| {
                let per = element_type.store_size().max(1);
                Type::Array(Box::new(element_type.clone()), total / per)
            }),
            None => None,
        };
        let mut site = AllocSite::at("alloca", self.state(id).prev_pc);
        if let Some(ty) = site_ty {
            site = site.with_type(ty);
        }

        let alignment = alignment.max(element_type.alignment());
        match self.execute_alloc(id, size, true, false, site, alignment, None)? {
            Some(mo) => {
                self.state_mut(id).bind_local(dest, mo.pointer());
                self.state_mut(id).frame_mut().allocas.push(mo);
            }
            None => {
                self.state_mut(id).bind_local(dest, Value::null_pointer());
            }
        }
        Ok(())
    }

    /// Allocate and bind a fresh object. Returns `None` (with no binding)
    /// when the allocator is out of segments.
    fn execute_alloc(
        &mut self,
        id: StateId,
        size: Expr,
        is_local: bool,
        zero_memory: bool,
        site: AllocSite,
        alignment: u64,
        realloc_from: Option<Rc<MemoryObject>>,
    ) -> Result<Option<Rc<MemoryObject>>, ExecutionError> {
        let allocated = match size.as_u64() {
            Some(size) => size,
            None => {
                self.stats.solver_queries += 1;
                let (_, hi) = self
                    .solver
                    .get_range(&self.states[&id].constraints, &size)?;
                let hi = hi as u64;
                if hi > MAX_ALLOC_BOUND {
                    self.stats.solver_queries += 1;
                    let bound = self
                        .solver
                        .get_value(&self.states[&id].constraints, &size)?
                        as u64;
                    self.add_constraint_with_seeds(
                        id,
                        Expr::ule(size.clone(), Expr::pointer(bound)),
                    )?;
                    bound
                } else {
                    hi
                }
            }
        };

        let mo = match self
            .memory
            .allocate(size, allocated, is_local, false, site, alignment)
        {
            Some(mo) => mo,
            None => return Ok(None),
        };
        trace!(
            "[{}] allocate segment {} ({} bytes, local={})",
            id,
            mo.segment,
            allocated,
            is_local
        );

        match realloc_from {
            Some(old_mo) => {
                let old_os = match self.state(id).address_space.find(&old_mo) {
                    Some(pair) => ObjectState::clone(&pair.1),
                    None => {
                        let info = self.describe_address(id, &old_mo.pointer());
                        self.terminate_state_on_error(
                            id,
                            TerminateReason::Ptr,
                            "memory error: invalid pointer: realloc",
                            Some(info),
                        );
                        return Ok(None);
                    }
                };
                let os = ObjectState::resized_from(&old_os, &mo);
                self.state_mut(id).address_space.unbind(&old_mo);
                self.memory.mark_freed(old_mo.segment);
                self.state_mut(id).address_space.bind(Rc::clone(&mo), os);
            }
            None => {
                let mut os = ObjectState::new(&mo);
                if zero_memory {
                    os.initialize_to_zero();
                } else {
                    os.initialize_to_random(&mut self.rng);
                }
                self.state_mut(id).address_space.bind(Rc::clone(&mo), os);
            }
        }
        Ok(Some(mo))
    }

    fn execute_free(&mut self, id: StateId, address: Value) -> Result<(), ExecutionError> {
        let (zero_side, nonzero_side) = self.fork(id, address.create_is_zero(), true)?;
        if let Some(sid) = zero_side {
            self.bind_call_result(sid, Value::null_pointer());
        }
        let id = match nonzero_side {
            Some(sid) => sid,
            None => return Ok(()),
        };

        // a constant segment that is already gone is a double free
        if let Some(segment) = address.constant_segment() {
            if segment != 0
                && self.state(id).address_space.find_by_segment(segment).is_none()
                && self.memory.was_freed(segment)
            {
                let info = self.describe_address(id, &address);
                self.terminate_state_on_error(
                    id,
                    TerminateReason::Ptr,
                    "memory error: double free",
                    Some(info),
                );
                return Ok(());
            }
        }

        let resolutions = self.resolve_exact(id, &address, "free")?;
        for (mo, sid) in resolutions {
            if mo.is_local {
                let info = self.describe_address(sid, &address);
                self.terminate_state_on_error(
                    sid,
                    TerminateReason::Free,
                    "memory error: free of alloca",
                    Some(info),
                );
            } else if mo.is_global {
                let info = self.describe_address(sid, &address);
                self.terminate_state_on_error(
                    sid,
                    TerminateReason::Free,
                    "memory error: free of global",
                    Some(info),
                );
            } else {
                self.state_mut(sid).address_space.unbind(&mo);
                self.memory.mark_freed(mo.segment);
                self.bind_call_result(sid, Value::null_pointer());
            }
        }
        Ok(())
    }

    /// Resolve `address` to the objects it may point at exactly (offset
    /// zero), forking per candidate; the infeasible remainder dies with an
    /// invalid-pointer error.
    fn resolve_exact(
        &mut self,
        id: StateId,
        address: &Value,
        name: &str,
    ) -> Result<Vec<(Rc<MemoryObject>, StateId)>, ExecutionError> {
        self.solver.set_timeout(self.options.core_solver_timeout);
        let resolved = {
            let state = &self.states[&id];
            state.address_space.resolve(
                &state.constraints,
                &mut self.solver,
                address,
                0,
                self.options.core_solver_timeout,
            )
        };
        self.solver.set_timeout(None);

        let (list, _incomplete) = match resolved {
            Ok(result) => result,
            Err(SolverError::Timeout) => (Vec::new(), true),
            Err(e) => return Err(e.into()),
        };

        let mut results = Vec::new();
        let mut unbound = Some(id);
        for pair in list {
            let mo = Rc::clone(&pair.0);
            let exact = address.eq_value(&mo.pointer());
            let current = unbound.take().expect("loop holds a live remainder");
            let (bound, rest) = self.fork(current, exact, true)?;
            if let Some(sid) = bound {
                results.push((mo, sid));
            }
            unbound = rest;
            if unbound.is_none() {
                break;
            }
        }

        if let Some(sid) = unbound {
            let info = self.describe_address(sid, address);
            self.terminate_state_on_error(
                sid,
                TerminateReason::Ptr,
                &format!("memory error: invalid pointer: {}", name),
                Some(info),
            );
        }
        Ok(results)
    }

    // ------------------------------------------------------------------
    // modelled & external functions

    fn call_declared_function(
        &mut self,
        id: StateId,
        function: FunctionId,
        args: Vec<Value>,
    ) -> Result<(), ExecutionError> {
        let name = self.module().function(function).name.clone();
        if !MODELLED_FUNCTIONS.contains(name.as_str()) && !name.starts_with("nondet_") {
            return self.call_external_function(id, &name, args);
        }

        match name.as_str() {
            "malloc" => {
                let size = coerce_width(args[0].clone(), PTR_WIDTH, false).offset;
                let site = AllocSite::at("malloc", self.state(id).prev_pc);
                match self.execute_alloc(id, size, false, false, site, 16, None)? {
                    Some(mo) => self.bind_call_result(id, mo.pointer()),
                    None => self.bind_call_result(id, Value::null_pointer()),
                }
            }
            "calloc" => {
                let count = coerce_width(args[0].clone(), PTR_WIDTH, false).offset;
                let size = coerce_width(args[1].clone(), PTR_WIDTH, false).offset;
                let total = Expr::mul(count, size);
                let site = AllocSite::at("calloc", self.state(id).prev_pc);
                match self.execute_alloc(id, total, false, true, site, 16, None)? {
                    Some(mo) => self.bind_call_result(id, mo.pointer()),
                    None => self.bind_call_result(id, Value::null_pointer()),
                }
            }
            "realloc" => {
                let pointer = args[0].clone();
                let size = coerce_width(args[1].clone(), PTR_WIDTH, false).offset;
                if pointer.is_null() {
                    let site = AllocSite::at("realloc", self.state(id).prev_pc);
                    match self.execute_alloc(id, size, false, false, site, 16, None)? {
                        Some(mo) => self.bind_call_result(id, mo.pointer()),
                        None => self.bind_call_result(id, Value::null_pointer()),
                    }
                    return Ok(());
                }
                let resolution = {
                    let state = &self.states[&id];
                    state
                        .address_space
                        .resolve_one(&state.constraints, &mut self.solver, &pointer)
                };
                match resolution {
                    Ok(Some(resolution)) => {
                        let old = Rc::clone(&resolution.pair.0);
                        let site = AllocSite::at("realloc", self.state(id).prev_pc);
                        match self.execute_alloc(id, size, false, false, site, 16, Some(old))? {
                            Some(mo) => self.bind_call_result(id, mo.pointer()),
                            None => self.bind_call_result(id, Value::null_pointer()),
                        }
                    }
                    _ => {
                        let info = self.describe_address(id, &pointer);
                        self.terminate_state_on_error(
                            id,
                            TerminateReason::Ptr,
                            "memory error: invalid pointer: realloc",
                            Some(info),
                        );
                    }
                }
            }
            "free" => {
                self.execute_free(id, args[0].clone())?;
            }
            "abort" => {
                self.terminate_state_on_error(id, TerminateReason::Abort, "abort failure", None);
            }
            "exit" | "_exit" => {
                self.terminate_state_on_exit(id);
            }
            "assert_fail" | "__assert_fail" => {
                let message = match args.first() {
                    Some(pointer) => self
                        .read_string(id, pointer)
                        .unwrap_or_else(|| "assertion failed".to_string()),
                    None => "assertion failed".to_string(),
                };
                self.terminate_state_on_error(
                    id,
                    TerminateReason::Assert,
                    &format!("ASSERTION FAIL: {}", message),
                    None,
                );
            }
            "report_error" => {
                let message = match args.first() {
                    Some(pointer) => self
                        .read_string(id, pointer)
                        .unwrap_or_else(|| "reported error".to_string()),
                    None => "reported error".to_string(),
                };
                self.terminate_state_on_error(id, TerminateReason::ReportError, &message, None);
            }
            "make_symbolic" => self.execute_make_symbolic(id, &args)?,
            "define_fixed_object" => self.execute_define_fixed_object(id, &args),
            "make_concrete" => self.execute_make_concrete(id, &args)?,
            "get_value" => self.execute_get_value(id, &args)?,
            "errno_location" | "__errno_location" => {
                let errno = self
                    .errno_object
                    .as_ref()
                    .expect("errno object exists")
                    .pointer();
                self.bind_call_result(id, errno);
            }
            "fabs" => {
                let constant = self.to_constant(id, &args[0].offset, "floating point")?;
                let bits = constant.as_constant().expect("constant");
                let result = match args[0].width() {
                    32 => f32::from_bits(bits as u32).abs().to_bits() as u128,
                    _ => f64::from_bits(bits as u64).abs().to_bits() as u128,
                };
                self.bind_call_result(id, Value::constant(args[0].width(), result));
            }
            "va_start" => {
                let varargs = self.state(id).frame().varargs.clone();
                match varargs {
                    Some(mo) => {
                        // the va_list header holds the overflow-area pointer
                        self.execute_memory_operation(
                            id,
                            Some(mo.pointer()),
                            args[0].clone(),
                            None,
                        )?;
                    }
                    None => {
                        self.terminate_state_on_error(
                            id,
                            TerminateReason::User,
                            "va_start called in a function without varargs",
                            None,
                        );
                    }
                }
            }
            "va_end" => {}
            "lifetime_start" => {
                let pointer = args.get(1).cloned().unwrap_or_else(Value::null_pointer);
                let resolution = {
                    let state = &self.states[&id];
                    state
                        .address_space
                        .resolve_one(&state.constraints, &mut self.solver, &pointer)
                };
                if !matches!(resolution, Ok(Some(_))) {
                    warn!("lifetime_start on a dead object is not re-allocated");
                }
            }
            "lifetime_end" => {
                let pointer = args.get(1).cloned().unwrap_or_else(Value::null_pointer);
                let resolution = {
                    let state = &self.states[&id];
                    state
                        .address_space
                        .resolve_one(&state.constraints, &mut self.solver, &pointer)
                };
                if let Ok(Some(resolution)) = resolution {
                    let mo = Rc::clone(&resolution.pair.0);
                    if mo.is_local {
                        self.state_mut(id).address_space.unbind(&mo);
                    }
                }
            }
            nondet if nondet.starts_with("nondet_") => {
                self.execute_nondet(id, nondet.to_string())?;
            }
            _ => unreachable!("modelled function {} has no handler", name),
        }
        Ok(())
    }

    fn execute_nondet(&mut self, id: StateId, name: String) -> Result<(), ExecutionError> {
        let suffix = name.trim_start_matches("nondet_");
        let (width, is_signed, is_pointer): (Width, bool, bool) = match suffix {
            "ptr" => (PTR_WIDTH, false, true),
            "u8" => (8, false, false),
            "u16" => (16, false, false),
            "u32" => (32, false, false),
            "u64" => (64, false, false),
            "i8" => (8, true, false),
            "i16" => (16, true, false),
            "i32" => (32, true, false),
            "i64" => (64, true, false),
            _ => {
                self.terminate_state_on_error(
                    id,
                    TerminateReason::Unhandled,
                    &format!("unknown nondet draw: {}", name),
                    None,
                );
                return Ok(());
            }
        };
        let value = self.create_nondet_value(id, &name, width, is_signed, is_pointer);
        self.bind_call_result(id, value);
        Ok(())
    }

    /// A fresh named symbolic draw, logged for replay.
    pub(crate) fn create_nondet_value(
        &mut self,
        id: StateId,
        name: &str,
        width: Width,
        is_signed: bool,
        is_pointer: bool,
    ) -> Value {
        let bytes = u64::from((width + 7) / 8);
        let unique = self.state_mut(id).unique_array_name(name);
        let array = Array::symbolic(unique, bytes);
        let expr = Expr::read_le(
            &UpdateList::new(Rc::clone(&array)),
            &Expr::zero(PTR_WIDTH),
            bytes as u32,
        );
        let expr = if expr.width() == width {
            expr
        } else {
            Expr::extract(expr, 0, width)
        };

        let value = if is_pointer {
            let off_name = self.state_mut(id).unique_array_name(&format!("{}_off", name));
            let off_array = Array::symbolic(off_name, 8);
            let offset = Expr::read_le(
                &UpdateList::new(Rc::clone(&off_array)),
                &Expr::zero(PTR_WIDTH),
                8,
            );
            self.state_mut(id).add_nondet_value(NondetValue {
                name: format!("{}_off", name),
                array: off_array,
                width: PTR_WIDTH,
                is_signed: false,
                is_pointer: false,
            });
            Value {
                segment: Expr::zext(expr, PTR_WIDTH),
                offset,
            }
        } else {
            Value::scalar(expr)
        };

        self.state_mut(id).add_nondet_value(NondetValue {
            name: name.to_string(),
            array,
            width,
            is_signed,
            is_pointer,
        });
        value
    }

    fn execute_make_symbolic(
        &mut self,
        id: StateId,
        args: &[Value],
    ) -> Result<(), ExecutionError> {
        let pointer = args[0].clone();
        let size = match args.get(1).and_then(|v| v.offset.as_u64()) {
            Some(size) => size,
            None => {
                self.terminate_state_on_error(
                    id,
                    TerminateReason::User,
                    "make_symbolic requires a concrete size",
                    None,
                );
                return Ok(());
            }
        };
        let name = args
            .get(2)
            .and_then(|pointer| self.read_string(id, pointer))
            .unwrap_or_else(|| "unnamed".to_string());

        let resolution = {
            let state = &self.states[&id];
            state
                .address_space
                .resolve_one(&state.constraints, &mut self.solver, &pointer)
        };
        let resolution = match resolution {
            Ok(Some(resolution)) => resolution,
            _ => {
                let info = self.describe_address(id, &pointer);
                self.terminate_state_on_error(
                    id,
                    TerminateReason::Ptr,
                    "memory error: invalid pointer: make_symbolic",
                    Some(info),
                );
                return Ok(());
            }
        };
        let mo = Rc::clone(&resolution.pair.0);

        let offset_is_zero = match resolution.adjusted {
            Some((_, offset)) => offset == 0,
            None => pointer.offset.is_zero_constant(),
        };
        if !offset_is_zero {
            self.terminate_state_on_error(
                id,
                TerminateReason::User,
                "make_symbolic requires the start of an object",
                None,
            );
            return Ok(());
        }
        if mo.concrete_size() != Some(size) {
            self.terminate_state_on_error(
                id,
                TerminateReason::User,
                &format!(
                    "wrong size given to make_symbolic ({} vs {})",
                    size, mo.allocated_size
                ),
                None,
            );
            return Ok(());
        }

        let unique = self.state_mut(id).unique_array_name(&name);
        let array = Array::symbolic(unique, size);
        trace!("[{}] make_symbolic {} over segment {}", id, array.name, mo.segment);

        self.state_mut(id).address_space.unbind(&mo);
        let os = ObjectState::symbolic(&mo, Rc::clone(&array));
        self.state_mut(id).address_space.bind(Rc::clone(&mo), os);
        self.state_mut(id)
            .add_symbolic(Rc::clone(&mo), Rc::clone(&array));

        // in seed mode the new array has to be bound to seed bytes
        let mut failure: Option<String> = None;
        let named_matching = self.options.named_seed_matching;
        let allow_extension = self.options.allow_seed_extension;
        let zero_extension = self.options.zero_seed_extension;
        let allow_truncation = self.options.allow_seed_truncation;
        if let Some(seeds) = self.seed_infos(id) {
            for seed in seeds.iter_mut() {
                match seed.next_input(&name, named_matching) {
                    None => {
                        if zero_extension {
                            seed.assignment
                                .insert(array.name.clone(), vec![0; size as usize]);
                        } else if !allow_extension {
                            failure =
                                Some("ran out of inputs during seeding".to_string());
                            break;
                        }
                    }
                    Some(object) => {
                        let given = object.bytes.len() as u64;
                        let too_short =
                            given < size && !(allow_extension || zero_extension);
                        let too_long = given > size && !allow_truncation;
                        if given != size && (too_short || too_long) {
                            failure = Some(format!(
                                "replace size mismatch: {}[{}] vs {}[{}] in test",
                                name, size, object.name, given
                            ));
                            break;
                        }
                        let mut bytes = object.bytes.clone();
                        bytes.truncate(size as usize);
                        bytes.resize(size as usize, 0);
                        seed.assignment.insert(array.name.clone(), bytes);
                    }
                }
            }
        }
        if let Some(message) = failure {
            self.terminate_state_on_error(id, TerminateReason::User, &message, None);
        }
        Ok(())
    }

    fn execute_define_fixed_object(&mut self, id: StateId, args: &[Value]) {
        let address = match args.get(0).and_then(|v| v.offset.as_u64()) {
            Some(address) if args[0].has_zero_segment() => address,
            _ => {
                self.terminate_state_on_error(
                    id,
                    TerminateReason::User,
                    "define_fixed_object requires a concrete address",
                    None,
                );
                return;
            }
        };
        let size = match args.get(1).and_then(|v| v.offset.as_u64()) {
            Some(size) => size,
            None => {
                self.terminate_state_on_error(
                    id,
                    TerminateReason::User,
                    "define_fixed_object requires a concrete size",
                    None,
                );
                return;
            }
        };
        let site = AllocSite::at("fixed object", self.state(id).prev_pc);
        let mo = self.memory.allocate_fixed(address, size, site, None, true);
        let os = ObjectState::new(&mo);
        self.state_mut(id).address_space.bind(Rc::clone(&mo), os);
        trace!(
            "[{}] defined fixed object at {:#x} ({} bytes, segment {})",
            id,
            address,
            size,
            mo.segment
        );
    }

    fn execute_make_concrete(
        &mut self,
        id: StateId,
        args: &[Value],
    ) -> Result<(), ExecutionError> {
        let pointer = args[0].clone();
        let size = match args.get(1).and_then(|v| v.offset.as_u64()) {
            Some(size) => size,
            None => {
                self.terminate_state_on_error(
                    id,
                    TerminateReason::User,
                    "make_concrete requires a concrete size",
                    None,
                );
                return Ok(());
            }
        };
        let resolution = {
            let state = &self.states[&id];
            state
                .address_space
                .resolve_one(&state.constraints, &mut self.solver, &pointer)
        };
        let resolution = match resolution {
            Ok(Some(resolution)) => resolution,
            _ => {
                let info = self.describe_address(id, &pointer);
                self.terminate_state_on_error(
                    id,
                    TerminateReason::Ptr,
                    "memory error: invalid pointer: make_concrete",
                    Some(info),
                );
                return Ok(());
            }
        };
        let mo = Rc::clone(&resolution.pair.0);

        let assignment = {
            let state = &self.states[&id];
            let arrays = state.arrays();
            self.solver
                .get_initial_values(&state.constraints, &arrays)
                .unwrap_or_default()
        };
        let start = match resolution.adjusted {
            Some((_, offset)) => offset,
            None => pointer.offset.as_u64().unwrap_or(0),
        };

        let limit = (start + size).min(mo.allocated_size);
        let mut bytes = Vec::with_capacity((limit - start) as usize);
        {
            let os = self.state_mut(id).address_space.writeable(&mo);
            for index in start..limit {
                let value = os.read(&Expr::pointer(index), 8);
                bytes.push(eval_expr(&value.offset, &assignment) as u8);
            }
            os.write_concrete_bytes(start, &bytes);
        }
        Ok(())
    }

    fn execute_get_value(&mut self, id: StateId, args: &[Value]) -> Result<(), ExecutionError> {
        let value = args[0].clone();
        if self.is_seeding(id) && !value.is_constant() {
            self.terminate_state_on_error(
                id,
                TerminateReason::Unhandled,
                "get_value of a symbolic value is not supported while seeding",
                None,
            );
            return Ok(());
        }
        if value.is_constant() {
            self.bind_call_result(id, value);
            return Ok(());
        }
        self.stats.solver_queries += 1;
        let bits = self
            .solver
            .get_value(&self.states[&id].constraints, &value.offset)?;
        self.bind_call_result(id, Value::constant(value.width(), bits));
        Ok(())
    }

    /// Read a NUL-terminated string out of program memory, concretizing
    /// symbolic bytes.
    fn read_string(&mut self, id: StateId, pointer: &Value) -> Option<String> {
        let resolution = {
            let state = &self.states[&id];
            state
                .address_space
                .resolve_one(&state.constraints, &mut self.solver, pointer)
                .ok()??
        };
        let mo = Rc::clone(&resolution.pair.0);
        let start = match resolution.adjusted {
            Some((_, offset)) => offset,
            None => pointer.offset.as_u64()?,
        };

        let mut bytes = Vec::new();
        for index in start..mo.allocated_size {
            let value = self
                .state_mut(id)
                .address_space
                .writeable(&mo)
                .read(&Expr::pointer(index), 8);
            let byte = match value.offset.as_constant() {
                Some(bits) => bits as u8,
                None => {
                    self.stats.solver_queries += 1;
                    self.solver
                        .get_value(&self.states[&id].constraints, &value.offset)
                        .ok()? as u8
                }
            };
            if byte == 0 {
                break;
            }
            bytes.push(byte);
        }
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn call_external_function(
        &mut self,
        id: StateId,
        name: &str,
        args: Vec<Value>,
    ) -> Result<(), ExecutionError> {
        let policy = self.options.external_calls;

        match policy {
            ExternalCallPolicy::None => {
                self.terminate_state_on_error(
                    id,
                    TerminateReason::External,
                    &format!("external calls disallowed: {}", name),
                    None,
                );
                return Ok(());
            }
            ExternalCallPolicy::Pure => return self.pure_external_return(id, name),
            _ => {}
        }

        if !self.externals.is_registered(name) {
            // nothing concrete to call; fall back to the pure treatment
            warn!("calling undefined external: {}", name);
            return self.pure_external_return(id, name);
        }

        // concretize every argument up front
        let mut concrete_args: Vec<Value> = Vec::with_capacity(args.len());
        for arg in &args {
            if arg.is_constant() {
                concrete_args.push(arg.clone());
                continue;
            }
            match policy {
                ExternalCallPolicy::Concrete => {
                    self.terminate_state_on_error(
                        id,
                        TerminateReason::External,
                        &format!("external call with symbolic argument: {}", name),
                        None,
                    );
                    return Ok(());
                }
                _ => {
                    let segment =
                        self.to_constant(id, &arg.segment, "external call argument")?;
                    let offset =
                        self.to_constant(id, &arg.offset, "external call argument")?;
                    concrete_args.push(Value { segment, offset });
                }
            }
        }

        // pointer arguments get host buffers loaded with the object bytes
        let mut resolved = SegmentAddressMap::new();
        let mut temporary_buffers: Vec<u64> = Vec::new();
        let mut raw_args: Vec<u64> = Vec::with_capacity(concrete_args.len());
        for arg in &concrete_args {
            let segment = arg.constant_segment().unwrap_or(0);
            let offset = arg.offset.as_u64().unwrap_or(0);
            if segment == 0 {
                raw_args.push(offset);
                continue;
            }
            let (mo, os) = match self.state(id).address_space.find_by_segment(segment) {
                Some(pair) => (Rc::clone(&pair.0), Rc::clone(&pair.1)),
                None => {
                    let info = self.describe_address(id, arg);
                    self.terminate_state_on_error(
                        id,
                        TerminateReason::Ptr,
                        "memory error: invalid pointer passed to external call",
                        Some(info),
                    );
                    return Ok(());
                }
            };
            let address = match resolved.get(&mo.segment) {
                Some(address) => *address,
                None => {
                    let address = self.externals.host.allocate(os.size_bound());
                    temporary_buffers.push(address);
                    resolved.insert(mo.segment, address);
                    address
                }
            };
            raw_args.push(address + offset);
        }
        // errno travels with every call
        resolved.insert(
            self.errno_object.as_ref().expect("errno object exists").segment,
            self.externals.errno_address(),
        );

        self.states[&id].address_space.copy_out_concretes(
            &resolved,
            &mut self.externals.host,
            false,
        );

        trace!("[{}] external call {}({:?})", id, name, raw_args);
        let result = self.externals.call(name, &raw_args);

        let result = match result {
            Ok(result) => result,
            Err(message) => {
                self.terminate_state_on_error(
                    id,
                    TerminateReason::External,
                    &format!("failed external call: {} ({})", name, message),
                    None,
                );
                return Ok(());
            }
        };

        let copied_in = {
            let state = self.states.get_mut(&id).expect("state is live");
            state
                .address_space
                .copy_in_concretes(&resolved, &self.externals.host)
        };
        for address in temporary_buffers {
            self.externals.host.release(address);
        }
        if !copied_in {
            self.terminate_state_on_error(
                id,
                TerminateReason::External,
                &format!("external call modified a read-only object: {}", name),
                None,
            );
            return Ok(());
        }

        self.bind_call_result(id, Value::constant(PTR_WIDTH, result as u128));
        Ok(())
    }

    /// The "pure" treatment: skip the call, log a nondet draw for the
    /// return value when one is expected.
    fn pure_external_return(&mut self, id: StateId, name: &str) -> Result<(), ExecutionError> {
        let caller = self.state(id).prev_pc;
        let function = self.module().function(caller.function);
        let (has_dest, return_type) = match &function.blocks[caller.block].instructions
            [caller.index]
        {
            Instruction::Call {
                dest, return_type, ..
            } => (dest.is_some(), return_type.clone()),
            _ => (false, Type::Void),
        };
        if !has_dest || return_type == Type::Void {
            return Ok(());
        }
        let width = return_type.width();
        let value = self.create_nondet_value(
            id,
            &format!("external_{}", name),
            width,
            false,
            return_type.is_pointer(),
        );
        self.bind_call_result(id, value);
        Ok(())
    }
}
