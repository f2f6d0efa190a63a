//! The solver interface the engine consumes.
//!
//! The engine only ever talks to the [`Solver`] trait; a real SMT backend
//! plugs in behind it. [`native::NativeSolver`] is the bundled baseline.

pub mod native;

use crate::expr::{Array, BinOp, CmpOp, ConstraintSet, Expr, ExprNode, Width};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;
use thiserror::Error;

/// Concrete bytes for each symbolic array, keyed by array name.
pub type Assignment = HashMap<String, Vec<u8>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, Error)]
pub enum SolverError {
    #[error("solver query timed out")]
    Timeout,

    #[error("solver failed internally: {0}")]
    Internal(String),
}

pub trait Solver {
    fn name(&self) -> &'static str;

    /// Decide `expr` under `constraints`: provably true, provably false,
    /// or feasible both ways.
    fn evaluate(
        &mut self,
        constraints: &ConstraintSet,
        expr: &Expr,
    ) -> Result<Validity, SolverError>;

    /// Some satisfying value of `expr` under `constraints`.
    fn get_value(&mut self, constraints: &ConstraintSet, expr: &Expr)
        -> Result<u128, SolverError>;

    /// Concrete bytes for the given arrays witnessing the constraints.
    fn get_initial_values(
        &mut self,
        constraints: &ConstraintSet,
        arrays: &[Rc<Array>],
    ) -> Result<Assignment, SolverError>;

    /// Per-call timeout; `None` clears it.
    fn set_timeout(&mut self, timeout: Option<Duration>);

    /// True iff `constraints ∧ ¬expr` is unsatisfiable.
    fn must_be_true(
        &mut self,
        constraints: &ConstraintSet,
        expr: &Expr,
    ) -> Result<bool, SolverError> {
        Ok(self.evaluate(constraints, expr)? == Validity::True)
    }

    /// True iff `constraints ∧ expr` is satisfiable.
    fn may_be_true(
        &mut self,
        constraints: &ConstraintSet,
        expr: &Expr,
    ) -> Result<bool, SolverError> {
        Ok(self.evaluate(constraints, expr)? != Validity::False)
    }

    /// An enclosing `[lo, hi]` interval of `expr`, by binary search.
    fn get_range(
        &mut self,
        constraints: &ConstraintSet,
        expr: &Expr,
    ) -> Result<(u128, u128), SolverError> {
        if let Some(bits) = expr.as_constant() {
            return Ok((bits, bits));
        }
        let width = expr.width();
        let max = mask(width);

        let mut lo = 0u128;
        let mut hi = max;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let below = Expr::ule(expr.clone(), Expr::constant(width, mid));
            if self.may_be_true(constraints, &below)? {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        let min = lo;

        let mut lo = min;
        let mut hi = max;
        while lo < hi {
            let mid = hi - (hi - lo) / 2;
            let above = Expr::ule(Expr::constant(width, mid), expr.clone());
            if self.may_be_true(constraints, &above)? {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }

        Ok((min, lo))
    }
}

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

/// Total concrete evaluation of `expr` under `assignment`. Bytes of arrays
/// missing from the assignment read as zero.
pub fn eval_expr(expr: &Expr, assignment: &Assignment) -> u128 {
    match expr.node() {
        ExprNode::Constant { bits, .. } => *bits,
        ExprNode::Read { updates, index } => {
            let idx = eval_expr(index, assignment) as u64;
            let mut cur = updates.head.as_ref();
            while let Some(node) = cur {
                if eval_expr(&node.index, assignment) as u64 == idx {
                    return eval_expr(&node.value, assignment) & 0xff;
                }
                cur = node.next.as_ref();
            }
            let array = &updates.array;
            if let Some(byte) = array.constants.get(idx as usize) {
                return *byte as u128;
            }
            assignment
                .get(&array.name)
                .and_then(|bytes| bytes.get(idx as usize))
                .copied()
                .unwrap_or(0) as u128
        }
        ExprNode::Select {
            cond,
            then_expr,
            else_expr,
        } => {
            if eval_expr(cond, assignment) != 0 {
                eval_expr(then_expr, assignment)
            } else {
                eval_expr(else_expr, assignment)
            }
        }
        ExprNode::Concat { msb, lsb } => {
            (eval_expr(msb, assignment) << lsb.width()) | eval_expr(lsb, assignment)
        }
        ExprNode::Extract {
            expr: inner,
            offset,
            width,
        } => (eval_expr(inner, assignment) >> offset) & mask(*width),
        ExprNode::ZExt { expr: inner, .. } => eval_expr(inner, assignment),
        ExprNode::SExt { expr: inner, width } => {
            let inner_width = inner.width();
            let bits = eval_expr(inner, assignment);
            (to_signed(bits, inner_width) as u128) & mask(*width)
        }
        ExprNode::Not(inner) => !eval_expr(inner, assignment) & mask(expr.width()),
        ExprNode::Binary { op, lhs, rhs } => {
            let width = lhs.width();
            let a = eval_expr(lhs, assignment);
            let b = eval_expr(rhs, assignment);
            eval_binary(*op, a, b, width)
        }
        ExprNode::Cmp { op, lhs, rhs } => {
            let width = lhs.width();
            let a = eval_expr(lhs, assignment);
            let b = eval_expr(rhs, assignment);
            let result = match op {
                CmpOp::Eq => a == b,
                CmpOp::Ult => a < b,
                CmpOp::Ule => a <= b,
                CmpOp::Slt => to_signed(a, width) < to_signed(b, width),
                CmpOp::Sle => to_signed(a, width) <= to_signed(b, width),
            };
            result as u128
        }
    }
}

pub fn eval_bool(expr: &Expr, assignment: &Assignment) -> bool {
    eval_expr(expr, assignment) != 0
}

fn eval_binary(op: BinOp, a: u128, b: u128, width: Width) -> u128 {
    let m = mask(width);
    let result = match op {
        BinOp::Add => a.wrapping_add(b),
        BinOp::Sub => a.wrapping_sub(b),
        BinOp::Mul => a.wrapping_mul(b),
        // bit-vector semantics for the zero divisor
        BinOp::UDiv => {
            if b == 0 {
                m
            } else {
                a / b
            }
        }
        BinOp::SDiv => {
            if b == 0 {
                if to_signed(a, width) < 0 {
                    1
                } else {
                    m
                }
            } else {
                to_signed(a, width).wrapping_div(to_signed(b, width)) as u128
            }
        }
        BinOp::URem => {
            if b == 0 {
                a
            } else {
                a % b
            }
        }
        BinOp::SRem => {
            if b == 0 {
                a
            } else {
                to_signed(a, width).wrapping_rem(to_signed(b, width)) as u128
            }
        }
        BinOp::And => a & b,
        BinOp::Or => a | b,
        BinOp::Xor => a ^ b,
        BinOp::Shl => {
            if b >= width as u128 {
                0
            } else {
                a << b
            }
        }
        BinOp::LShr => {
            if b >= width as u128 {
                0
            } else {
                a >> b
            }
        }
        BinOp::AShr => {
            if b >= width as u128 {
                if to_signed(a, width) < 0 {
                    m
                } else {
                    0
                }
            } else {
                (to_signed(a, width) >> b) as u128
            }
        }
    };
    result & m
}
