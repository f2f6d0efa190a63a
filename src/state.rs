//! One path through the program under execution.

use crate::address_space::AddressSpace;
use crate::expr::{Array, ConstraintSet, Expr, Value, Width};
use crate::ir::{BlockId, CodePtr, FunctionId, LocalId};
use crate::memory::MemoryObject;
use crate::ptree::NodeId;
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(pub u64);

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// One activation record: the callee's registers plus everything that has
/// to be unwound when the frame pops.
#[derive(Debug, Clone)]
pub struct StackFrame {
    pub function: FunctionId,
    /// The call instruction to return to, `None` on the entry frame.
    pub caller: Option<CodePtr>,
    pub locals: Vec<Option<Value>>,
    pub varargs: Option<Rc<MemoryObject>>,
    /// Stack allocations to drop when this frame pops.
    pub allocas: Vec<Rc<MemoryObject>>,
}

impl StackFrame {
    pub fn new(function: FunctionId, caller: Option<CodePtr>, num_locals: usize) -> Self {
        Self {
            function,
            caller,
            locals: vec![None; num_locals],
            varargs: None,
            allocas: Vec::new(),
        }
    }
}

/// A fresh symbolic value drawn mid-run, recorded so replays can feed the
/// same draw back in.
#[derive(Debug, Clone)]
pub struct NondetValue {
    pub name: String,
    pub array: Rc<Array>,
    pub width: Width,
    pub is_signed: bool,
    pub is_pointer: bool,
}

#[derive(Debug)]
pub struct ExecutionState {
    pub id: StateId,
    pub stack: Vec<StackFrame>,
    pub constraints: ConstraintSet,
    pub address_space: AddressSpace,
    pub pc: CodePtr,
    pub prev_pc: CodePtr,
    /// Predecessor block, consulted by PHI nodes after a transfer.
    pub incoming_bb_index: BlockId,
    pub depth: u64,
    pub stepped_instructions: u64,
    pub covered_new: bool,
    pub covered_lines: HashSet<CodePtr>,
    pub fork_disabled: bool,
    /// Named symbolic inputs, in creation order.
    pub symbolics: Vec<(Rc<MemoryObject>, Rc<Array>)>,
    pub nondet_values: Vec<NondetValue>,
    /// Names already taken by symbolic arrays in this state.
    pub array_names: HashSet<String>,
    pub weight: f64,
    pub ptree_node: NodeId,
    /// Branch decisions taken so far, for path replay.
    pub path: Vec<bool>,
}

impl ExecutionState {
    pub fn new(id: StateId, entry: CodePtr, num_locals: usize) -> Self {
        Self {
            id,
            stack: vec![StackFrame::new(entry.function, None, num_locals)],
            constraints: ConstraintSet::new(),
            address_space: AddressSpace::new(),
            pc: entry,
            prev_pc: entry,
            incoming_bb_index: 0,
            depth: 0,
            stepped_instructions: 0,
            covered_new: false,
            covered_lines: HashSet::new(),
            fork_disabled: false,
            symbolics: Vec::new(),
            nondet_values: Vec::new(),
            array_names: HashSet::new(),
            weight: 1.0,
            ptree_node: 0,
            path: Vec::new(),
        }
    }

    pub fn frame(&self) -> &StackFrame {
        self.stack.last().expect("state has no stack frame")
    }

    pub fn frame_mut(&mut self) -> &mut StackFrame {
        self.stack.last_mut().expect("state has no stack frame")
    }

    pub fn push_frame(&mut self, function: FunctionId, caller: CodePtr, num_locals: usize) {
        self.stack
            .push(StackFrame::new(function, Some(caller), num_locals));
    }

    /// Pop the top frame and hand back its allocas for unbinding.
    pub fn pop_frame(&mut self) -> StackFrame {
        self.stack.pop().expect("pop on an empty stack")
    }

    pub fn local(&self, id: LocalId) -> Option<&Value> {
        self.frame().locals.get(id).and_then(Option::as_ref)
    }

    pub fn bind_local(&mut self, id: LocalId, value: Value) {
        let slot = self
            .frame_mut()
            .locals
            .get_mut(id)
            .expect("local register out of range");
        *slot = Some(value);
    }

    /// Extend the path constraints. A concrete-false condition means the
    /// caller forgot to prove feasibility first, which is a bug.
    pub fn add_constraint(&mut self, condition: Expr) {
        if let Some(bits) = condition.as_constant() {
            assert!(bits != 0, "attempt to add a provably false constraint");
            return;
        }
        self.constraints.push(condition);
    }

    /// A copy-on-write sibling. The caller registers it with the process
    /// tree and diverges the two by adding opposite constraints.
    pub fn branch(&mut self, id: StateId) -> ExecutionState {
        self.depth += 1;
        self.weight *= 0.5;
        ExecutionState {
            id,
            stack: self.stack.clone(),
            constraints: self.constraints.clone(),
            address_space: self.address_space.clone_cow(),
            pc: self.pc,
            prev_pc: self.prev_pc,
            incoming_bb_index: self.incoming_bb_index,
            depth: self.depth,
            stepped_instructions: self.stepped_instructions,
            covered_new: false,
            covered_lines: HashSet::new(),
            fork_disabled: self.fork_disabled,
            symbolics: self.symbolics.clone(),
            nondet_values: self.nondet_values.clone(),
            array_names: self.array_names.clone(),
            weight: self.weight,
            ptree_node: self.ptree_node,
            path: self.path.clone(),
        }
    }

    pub fn add_symbolic(&mut self, mo: Rc<MemoryObject>, array: Rc<Array>) {
        self.symbolics.push((mo, array));
    }

    pub fn add_nondet_value(&mut self, value: NondetValue) {
        self.nondet_values.push(value);
    }

    /// Claim `name`, appending a counter when it is already taken.
    pub fn unique_array_name(&mut self, name: &str) -> String {
        if self.array_names.insert(name.to_string()) {
            return name.to_string();
        }
        let mut counter = 1;
        loop {
            let candidate = format!("{}_{}", name, counter);
            if self.array_names.insert(candidate.clone()) {
                return candidate;
            }
            counter += 1;
        }
    }

    /// All symbolic arrays this state has created, for test generation.
    pub fn arrays(&self) -> Vec<Rc<Array>> {
        let mut arrays: Vec<Rc<Array>> = self
            .symbolics
            .iter()
            .map(|(_, array)| Rc::clone(array))
            .collect();
        for nondet in &self.nondet_values {
            if !arrays.iter().any(|a| Rc::ptr_eq(a, &nondet.array)) {
                arrays.push(Rc::clone(&nondet.array));
            }
        }
        arrays
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_shares_constraints_and_diverges_later() {
        let mut state = ExecutionState::new(StateId(0), CodePtr::entry(0), 4);
        let array = Array::symbolic("x", 4);
        let x = Expr::read_le(
            &crate::expr::UpdateList::new(array),
            &Expr::pointer(0),
            4,
        );
        let cond = Expr::eq(x, Expr::constant(32, 7));
        state.add_constraint(cond.clone());

        let mut sibling = state.branch(StateId(1));
        assert_eq!(sibling.constraints.len(), state.constraints.len());

        sibling.add_constraint(Expr::is_zero(&cond));
        assert_eq!(sibling.constraints.len(), state.constraints.len() + 1);
    }

    #[test]
    #[should_panic]
    fn concrete_false_constraint_is_a_bug() {
        let mut state = ExecutionState::new(StateId(0), CodePtr::entry(0), 0);
        state.add_constraint(Expr::bool_false());
    }

    #[test]
    fn array_names_stay_unique() {
        let mut state = ExecutionState::new(StateId(0), CodePtr::entry(0), 0);
        assert_eq!(state.unique_array_name("x"), "x");
        assert_eq!(state.unique_array_name("x"), "x_1");
        assert_eq!(state.unique_array_name("x"), "x_2");
    }
}
