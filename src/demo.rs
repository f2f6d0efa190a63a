//! Small bundled programs the binary can execute without an IR loader.

use anyhow::{bail, Result};
use chimera::ir::{
    CmpPred, FunctionId, Instruction, Module, ModuleBuilder, Operand, Type,
};

pub const NAMES: &[&str] = &["symbolic-branch", "out-of-bounds", "double-free", "leak"];

pub fn build(name: &str) -> Result<(Module, FunctionId)> {
    match name {
        "symbolic-branch" => Ok(symbolic_branch()),
        "out-of-bounds" => Ok(out_of_bounds()),
        "double-free" => Ok(double_free()),
        "leak" => Ok(leak()),
        _ => bail!("unknown demo program {}", name),
    }
}

/// `int x; make_symbolic(&x); if (x == 7) abort();`
fn symbolic_branch() -> (Module, FunctionId) {
    let mut builder = ModuleBuilder::new();
    let make_symbolic = builder.declare(
        "make_symbolic",
        vec![Type::Pointer, Type::Int(64), Type::Pointer],
        Type::Void,
        false,
    );
    let abort = builder.declare("abort", vec![], Type::Void, false);
    let name = builder.add_global(
        "x_name",
        Type::Array(Box::new(Type::Int(8)), 2),
        Some(vec![b'x', 0]),
        true,
    );
    let main = builder.declare("main", vec![], Type::Int(32), false);
    {
        let mut f = builder.function(main);
        let entry = f.block();
        let then_block = f.block();
        let else_block = f.block();
        let p = f.local();
        let x = f.local();
        let cond = f.local();
        f.push(
            entry,
            Instruction::Alloca {
                dest: p,
                element_type: Type::Int(32),
                count: Operand::i32(1),
                alignment: 4,
            },
        );
        f.push(
            entry,
            Instruction::Call {
                dest: None,
                callee: Operand::Function(make_symbolic),
                args: vec![Operand::Local(p), Operand::i64(4), Operand::Global(name)],
                return_type: Type::Void,
                sext_return: false,
            },
        );
        f.push(
            entry,
            Instruction::Load {
                dest: x,
                address: Operand::Local(p),
                ty: Type::Int(32),
            },
        );
        f.push(
            entry,
            Instruction::ICmp {
                dest: cond,
                pred: CmpPred::Eq,
                lhs: Operand::Local(x),
                rhs: Operand::i32(7),
            },
        );
        f.push(
            entry,
            Instruction::CondBr {
                cond: Operand::Local(cond),
                then_dest: then_block,
                else_dest: else_block,
            },
        );
        f.push(
            then_block,
            Instruction::Call {
                dest: None,
                callee: Operand::Function(abort),
                args: vec![],
                return_type: Type::Void,
                sext_return: false,
            },
        );
        f.push(then_block, Instruction::Unreachable);
        f.push(
            else_block,
            Instruction::Ret {
                value: Some(Operand::i32(0)),
            },
        );
    }
    (builder.build(), main)
}

/// `int *p = malloc(8); p[2] = 9;`
fn out_of_bounds() -> (Module, FunctionId) {
    let mut builder = ModuleBuilder::new();
    let malloc = builder.declare("malloc", vec![Type::Int(64)], Type::Pointer, false);
    let main = builder.declare("main", vec![], Type::Int(32), false);
    {
        let mut f = builder.function(main);
        let entry = f.block();
        let p = f.local();
        let q = f.local();
        f.push(
            entry,
            Instruction::Call {
                dest: Some(p),
                callee: Operand::Function(malloc),
                args: vec![Operand::i64(8)],
                return_type: Type::Pointer,
                sext_return: false,
            },
        );
        f.push(
            entry,
            Instruction::GetElementPtr {
                dest: q,
                base: Operand::Local(p),
                offset: 8,
                indices: vec![],
            },
        );
        f.push(
            entry,
            Instruction::Store {
                address: Operand::Local(q),
                value: Operand::i32(9),
            },
        );
        f.push(
            entry,
            Instruction::Ret {
                value: Some(Operand::i32(0)),
            },
        );
    }
    (builder.build(), main)
}

/// `char *a = malloc(10); free(a); free(a);`
fn double_free() -> (Module, FunctionId) {
    let mut builder = ModuleBuilder::new();
    let malloc = builder.declare("malloc", vec![Type::Int(64)], Type::Pointer, false);
    let free = builder.declare("free", vec![Type::Pointer], Type::Void, false);
    let main = builder.declare("main", vec![], Type::Int(32), false);
    {
        let mut f = builder.function(main);
        let entry = f.block();
        let a = f.local();
        f.push(
            entry,
            Instruction::Call {
                dest: Some(a),
                callee: Operand::Function(malloc),
                args: vec![Operand::i64(10)],
                return_type: Type::Pointer,
                sext_return: false,
            },
        );
        for _ in 0..2 {
            f.push(
                entry,
                Instruction::Call {
                    dest: None,
                    callee: Operand::Function(free),
                    args: vec![Operand::Local(a)],
                    return_type: Type::Void,
                    sext_return: false,
                },
            );
        }
        f.push(
            entry,
            Instruction::Ret {
                value: Some(Operand::i32(0)),
            },
        );
    }
    (builder.build(), main)
}

/// `char *p = malloc(4);` under check-memcleanup
fn leak() -> (Module, FunctionId) {
    let mut builder = ModuleBuilder::new();
    let malloc = builder.declare("malloc", vec![Type::Int(64)], Type::Pointer, false);
    let main = builder.declare("main", vec![], Type::Int(32), false);
    {
        let mut f = builder.function(main);
        let entry = f.block();
        let p = f.local();
        f.push(
            entry,
            Instruction::Call {
                dest: Some(p),
                callee: Operand::Function(malloc),
                args: vec![Operand::i64(4)],
                return_type: Type::Pointer,
                sext_return: false,
            },
        );
        f.push(
            entry,
            Instruction::Ret {
                value: Some(Operand::i32(0)),
            },
        );
    }
    (builder.build(), main)
}
