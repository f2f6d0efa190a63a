//! The bundled baseline solver.
//!
//! Decides queries by searching for concrete assignments to the symbolic
//! arrays: backward value propagation through invertible nodes, then
//! randomized restarts. Complete enough for the common shapes the engine
//! produces; a production deployment plugs a real SMT backend into the
//! [`Solver`] trait instead.

use super::{eval_bool, eval_expr, Assignment, Solver, SolverError, Validity};
use crate::expr::{Array, BinOp, CmpOp, ConstraintSet, Expr, ExprNode, Width};
use log::{debug, warn};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::rc::Rc;
use std::time::{Duration, Instant};

fn mask(width: Width) -> u128 {
    if width >= 128 {
        u128::MAX
    } else {
        (1u128 << width) - 1
    }
}

fn to_signed(bits: u128, width: Width) -> i128 {
    let shift = 128 - width;
    ((bits << shift) as i128) >> shift
}

fn signed_min(width: Width) -> u128 {
    1u128 << (width - 1)
}

fn signed_max(width: Width) -> u128 {
    mask(width) >> 1
}

pub struct NativeSolver {
    rng: StdRng,
    timeout: Option<Duration>,
    max_rounds: usize,
}

impl Default for NativeSolver {
    fn default() -> Self {
        Self::new(0)
    }
}

impl NativeSolver {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            timeout: None,
            max_rounds: 64,
        }
    }

    fn find_model(&mut self, constraints: &[Expr]) -> Result<Option<Assignment>, SolverError> {
        let mut arrays: Vec<Rc<Array>> = Vec::new();
        for constraint in constraints {
            constraint.arrays(&mut arrays);
        }
        let mut assignment: Assignment = arrays
            .iter()
            .map(|array| (array.name.clone(), vec![0u8; array.size as usize]))
            .collect();

        let deadline = self.timeout.map(|t| Instant::now() + t);

        for _round in 0..self.max_rounds {
            if let Some(deadline) = deadline {
                if Instant::now() > deadline {
                    return Err(SolverError::Timeout);
                }
            }

            for _pass in 0..3 {
                for constraint in constraints {
                    if !eval_bool(constraint, &assignment) {
                        let _ = propagate(constraint, true, &mut assignment, &mut self.rng);
                    }
                }
                if constraints.iter().all(|c| eval_bool(c, &assignment)) {
                    return Ok(Some(assignment));
                }
            }

            if arrays.is_empty() {
                break;
            }

            // nudge a random byte and retry
            let which = self.rng.gen_range(0..arrays.len());
            let array = &arrays[which];
            if array.size > 0 {
                let index = self.rng.gen_range(0..array.size) as usize;
                if let Some(bytes) = assignment.get_mut(&array.name) {
                    bytes[index] = self.rng.gen();
                }
            }
        }

        Ok(None)
    }
}

impl Solver for NativeSolver {
    fn name(&self) -> &'static str {
        "native"
    }

    fn evaluate(
        &mut self,
        constraints: &ConstraintSet,
        expr: &Expr,
    ) -> Result<Validity, SolverError> {
        if let Some(bits) = expr.as_constant() {
            return Ok(if bits != 0 {
                Validity::True
            } else {
                Validity::False
            });
        }

        // a term without symbolic leaves has one fixed value
        let mut arrays = Vec::new();
        expr.arrays(&mut arrays);
        if arrays.is_empty() {
            let fixed = eval_bool(expr, &Assignment::new());
            return Ok(if fixed { Validity::True } else { Validity::False });
        }

        let base: Vec<Expr> = constraints.iter().cloned().collect();
        let mut with_true = base.clone();
        with_true.push(expr.clone());
        let mut with_false = base;
        with_false.push(Expr::is_zero(expr));

        let (may_true, may_false) = time_debug!("decided branch feasibility", {
            let may_true = self.find_model(&with_true)?.is_some();
            let may_false = self.find_model(&with_false)?.is_some();
            (may_true, may_false)
        });

        match (may_true, may_false) {
            (true, true) => Ok(Validity::Unknown),
            (true, false) => Ok(Validity::True),
            (false, true) => Ok(Validity::False),
            (false, false) => {
                warn!("no model found for either branch of {}", expr);
                Ok(Validity::Unknown)
            }
        }
    }

    fn get_value(
        &mut self,
        constraints: &ConstraintSet,
        expr: &Expr,
    ) -> Result<u128, SolverError> {
        let base: Vec<Expr> = constraints.iter().cloned().collect();
        match self.find_model(&base)? {
            Some(assignment) => Ok(eval_expr(expr, &assignment)),
            None => {
                debug!("no model for a live state, defaulting to the zero assignment");
                Ok(eval_expr(expr, &Assignment::new()))
            }
        }
    }

    fn get_initial_values(
        &mut self,
        constraints: &ConstraintSet,
        arrays: &[Rc<Array>],
    ) -> Result<Assignment, SolverError> {
        let base: Vec<Expr> = constraints.iter().cloned().collect();
        let mut assignment = match self.find_model(&base)? {
            Some(assignment) => assignment,
            None => {
                debug!("no model for a live state, emitting the zero assignment");
                Assignment::new()
            }
        };
        for array in arrays {
            assignment
                .entry(array.name.clone())
                .or_insert_with(|| vec![0u8; array.size as usize]);
        }
        Ok(assignment)
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }
}

/// Make `expr` evaluate to `want` by adjusting the assignment, where an
/// inverse is known. Failure leaves the assignment in a usable state; the
/// caller falls back to random search.
fn propagate(
    expr: &Expr,
    want: bool,
    assignment: &mut Assignment,
    rng: &mut StdRng,
) -> Result<(), ()> {
    match expr.node() {
        ExprNode::Cmp { op, lhs, rhs } => propagate_cmp(*op, lhs, rhs, want, assignment, rng),
        ExprNode::Not(inner) if inner.width() == 1 => propagate(inner, !want, assignment, rng),
        ExprNode::Binary {
            op: BinOp::And,
            lhs,
            rhs,
        } if expr.width() == 1 => {
            if want {
                propagate(lhs, true, assignment, rng)?;
                propagate(rhs, true, assignment, rng)
            } else if rng.gen() {
                propagate(lhs, false, assignment, rng)
            } else {
                propagate(rhs, false, assignment, rng)
            }
        }
        ExprNode::Binary {
            op: BinOp::Or,
            lhs,
            rhs,
        } if expr.width() == 1 => {
            if want {
                if rng.gen() {
                    propagate(lhs, true, assignment, rng)
                } else {
                    propagate(rhs, true, assignment, rng)
                }
            } else {
                propagate(lhs, false, assignment, rng)?;
                propagate(rhs, false, assignment, rng)
            }
        }
        ExprNode::Select {
            cond,
            then_expr,
            else_expr,
        } => {
            let taken = if eval_bool(cond, assignment) {
                then_expr
            } else {
                else_expr
            };
            propagate(taken, want, assignment, rng)
        }
        _ => assign(expr, want as u128, assignment, rng),
    }
}

fn propagate_cmp(
    op: CmpOp,
    lhs: &Expr,
    rhs: &Expr,
    want: bool,
    assignment: &mut Assignment,
    rng: &mut StdRng,
) -> Result<(), ()> {
    let width = lhs.width();
    match op {
        CmpOp::Eq => {
            if want {
                if let Some(c) = lhs.as_constant() {
                    assign(rhs, c, assignment, rng)
                } else if let Some(c) = rhs.as_constant() {
                    assign(lhs, c, assignment, rng)
                } else {
                    let target = eval_expr(rhs, assignment);
                    assign(lhs, target, assignment, rng)
                }
            } else {
                let (sym, other) = if lhs.is_constant() { (rhs, lhs) } else { (lhs, rhs) };
                let avoid = eval_expr(other, assignment);
                assign(sym, avoid.wrapping_add(1) & mask(width), assignment, rng)
            }
        }
        CmpOp::Ult | CmpOp::Ule => {
            let strict = op == CmpOp::Ult;
            if want {
                if let Some(c) = rhs.as_constant() {
                    if strict && c == 0 {
                        return Err(());
                    }
                    assign(lhs, 0, assignment, rng)
                } else if let Some(c) = lhs.as_constant() {
                    if strict && c == mask(width) {
                        return Err(());
                    }
                    let target = if strict { c + 1 } else { c };
                    assign(rhs, target, assignment, rng)
                } else {
                    assign(lhs, 0, assignment, rng)?;
                    if strict && eval_expr(rhs, assignment) == 0 {
                        assign(rhs, 1, assignment, rng)?;
                    }
                    Ok(())
                }
            } else {
                // lhs >= rhs (or >) must hold
                if rhs.is_constant() {
                    let c = rhs.as_constant().unwrap();
                    let target = if strict { c } else { (c + 1) & mask(width) };
                    assign(lhs, target, assignment, rng)
                } else {
                    assign(rhs, 0, assignment, rng)?;
                    if !strict {
                        let current = eval_expr(lhs, assignment);
                        if current == 0 {
                            assign(lhs, 1, assignment, rng)?;
                        }
                    }
                    Ok(())
                }
            }
        }
        CmpOp::Slt | CmpOp::Sle => {
            let strict = op == CmpOp::Slt;
            if want {
                if let Some(c) = rhs.as_constant() {
                    if strict && c == signed_min(width) {
                        return Err(());
                    }
                    assign(lhs, signed_min(width), assignment, rng)
                } else if let Some(c) = lhs.as_constant() {
                    if strict && c == signed_max(width) {
                        return Err(());
                    }
                    let target = if strict {
                        (to_signed(c, width) + 1) as u128 & mask(width)
                    } else {
                        c
                    };
                    assign(rhs, target, assignment, rng)
                } else {
                    assign(lhs, signed_min(width), assignment, rng)
                }
            } else if let Some(c) = rhs.as_constant() {
                assign(lhs, if strict { c } else { signed_max(width) }, assignment, rng)
            } else if let Some(c) = lhs.as_constant() {
                assign(rhs, if strict { c } else { signed_min(width) }, assignment, rng)
            } else {
                assign(rhs, signed_min(width), assignment, rng)
            }
        }
    }
}

/// Make `expr` evaluate to `target` by writing through invertible nodes
/// down to symbolic array bytes.
fn assign(
    expr: &Expr,
    target: u128,
    assignment: &mut Assignment,
    rng: &mut StdRng,
) -> Result<(), ()> {
    let width = expr.width();
    let target = target & mask(width);

    match expr.node() {
        ExprNode::Constant { bits, .. } => {
            if *bits == target {
                Ok(())
            } else {
                Err(())
            }
        }
        ExprNode::Read { updates, index } => {
            let idx = eval_expr(index, assignment) as u64;
            let mut cur = updates.head.as_ref();
            while let Some(node) = cur {
                if eval_expr(&node.index, assignment) as u64 == idx {
                    return assign(&node.value, target, assignment, rng);
                }
                cur = node.next.as_ref();
            }
            let array = &updates.array;
            if !array.is_symbolic() {
                return if array.constants.get(idx as usize).copied() == Some(target as u8) {
                    Ok(())
                } else {
                    Err(())
                };
            }
            if idx >= array.size {
                return Err(());
            }
            let bytes = assignment
                .entry(array.name.clone())
                .or_insert_with(|| vec![0u8; array.size as usize]);
            bytes[idx as usize] = target as u8;
            Ok(())
        }
        ExprNode::Select {
            cond,
            then_expr,
            else_expr,
        } => {
            let taken = if eval_bool(cond, assignment) {
                then_expr
            } else {
                else_expr
            };
            assign(taken, target, assignment, rng)
        }
        ExprNode::Concat { msb, lsb } => {
            let low = lsb.width();
            assign(lsb, target & mask(low), assignment, rng)?;
            assign(msb, target >> low, assignment, rng)
        }
        ExprNode::Extract {
            expr: inner,
            offset,
            width: w,
        } => {
            let current = eval_expr(inner, assignment);
            let cleared = current & !(mask(*w) << offset);
            assign(inner, cleared | (target << offset), assignment, rng)
        }
        ExprNode::ZExt { expr: inner, .. } => {
            if target & !mask(inner.width()) != 0 {
                return Err(());
            }
            assign(inner, target, assignment, rng)
        }
        ExprNode::SExt { expr: inner, width: w } => {
            let low = target & mask(inner.width());
            let extended = to_signed(low, inner.width()) as u128 & mask(*w);
            if extended != target {
                return Err(());
            }
            assign(inner, low, assignment, rng)
        }
        ExprNode::Not(inner) => assign(inner, !target, assignment, rng),
        ExprNode::Binary { op, lhs, rhs } => {
            let (constant, sym, const_on_left) = match (lhs.as_constant(), rhs.as_constant()) {
                (Some(c), None) => (c, rhs, true),
                (None, Some(c)) => (c, lhs, false),
                _ => return Err(()),
            };
            let m = mask(width);
            match op {
                BinOp::Add => assign(sym, target.wrapping_sub(constant) & m, assignment, rng),
                BinOp::Sub => {
                    if const_on_left {
                        // c - x = target
                        assign(sym, constant.wrapping_sub(target) & m, assignment, rng)
                    } else {
                        // x - c = target
                        assign(sym, target.wrapping_add(constant) & m, assignment, rng)
                    }
                }
                BinOp::Xor => assign(sym, target ^ constant, assignment, rng),
                BinOp::Shl if !const_on_left => {
                    let k = constant as u32;
                    if k >= width || target & mask(k.min(width)) != 0 {
                        return Err(());
                    }
                    assign(sym, target >> k, assignment, rng)
                }
                BinOp::LShr if !const_on_left => {
                    let k = constant as u32;
                    if k >= width {
                        return Err(());
                    }
                    let restored = (target << k) & m;
                    if restored >> k != target {
                        return Err(());
                    }
                    assign(sym, restored, assignment, rng)
                }
                BinOp::Mul if constant == 1 => assign(sym, target, assignment, rng),
                _ => Err(()),
            }
        }
        ExprNode::Cmp { .. } => propagate(expr, target != 0, assignment, rng),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::UpdateList;

    fn symbolic_u32(name: &str) -> Expr {
        let array = Array::symbolic(name, 4);
        Expr::read_le(&UpdateList::new(array), &Expr::pointer(0), 4)
    }

    #[test]
    fn solves_simple_equality() {
        let mut solver = NativeSolver::new(0);
        let x = symbolic_u32("x");
        let mut constraints = ConstraintSet::new();
        constraints.push(Expr::eq(x.clone(), Expr::constant(32, 7)));

        assert_eq!(solver.get_value(&constraints, &x).unwrap(), 7);
        let mut arrays = Vec::new();
        x.arrays(&mut arrays);
        let values = solver.get_initial_values(&constraints, &arrays).unwrap();
        assert_eq!(values["x"], vec![7, 0, 0, 0]);
    }

    #[test]
    fn branch_conditions_fork_both_ways() {
        let mut solver = NativeSolver::new(0);
        let x = symbolic_u32("x");
        let constraints = ConstraintSet::new();
        let cond = Expr::eq(x, Expr::constant(32, 7));
        assert_eq!(
            solver.evaluate(&constraints, &cond).unwrap(),
            Validity::Unknown
        );
    }

    #[test]
    fn contradictions_are_false() {
        let mut solver = NativeSolver::new(0);
        let x = symbolic_u32("x");
        let mut constraints = ConstraintSet::new();
        constraints.push(Expr::eq(x.clone(), Expr::constant(32, 3)));

        let cond = Expr::eq(x, Expr::constant(32, 4));
        assert_eq!(
            solver.evaluate(&constraints, &cond).unwrap(),
            Validity::False
        );
    }

    #[test]
    fn implied_conditions_are_true() {
        let mut solver = NativeSolver::new(0);
        let x = symbolic_u32("x");
        let mut constraints = ConstraintSet::new();
        constraints.push(Expr::eq(x.clone(), Expr::constant(32, 3)));

        let cond = Expr::ult(x, Expr::constant(32, 10));
        assert_eq!(
            solver.evaluate(&constraints, &cond).unwrap(),
            Validity::True
        );
    }

    #[test]
    fn range_narrows_under_constraints() {
        let mut solver = NativeSolver::new(0);
        let x = symbolic_u32("x");
        let mut constraints = ConstraintSet::new();
        constraints.push(Expr::eq(x.clone(), Expr::constant(32, 100)));

        let (lo, hi) = solver.get_range(&constraints, &x).unwrap();
        assert_eq!((lo, hi), (100, 100));
    }

    #[test]
    fn fixed_seed_is_deterministic() {
        let x = symbolic_u32("x");
        let mut constraints = ConstraintSet::new();
        constraints.push(Expr::ult(Expr::constant(32, 41), x.clone()));
        constraints.push(Expr::ult(x.clone(), Expr::constant(32, 43)));

        let mut a = NativeSolver::new(17);
        let mut b = NativeSolver::new(17);
        assert_eq!(
            a.get_value(&constraints, &x).unwrap(),
            b.get_value(&constraints, &x).unwrap()
        );
    }
}
