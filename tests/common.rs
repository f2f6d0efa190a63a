use chimera::engine::{EngineOptions, Executor, Stats};
use chimera::exploration_strategy::DepthFirstStrategy;
use chimera::expr::BinOp;
use chimera::ir::{
    CmpPred, FunctionId, Instruction, Module, ModuleBuilder, Operand, Type,
};
use chimera::solver::native::NativeSolver;
use chimera::testcase::CollectingHandler;

pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn run_program(
    module: &Module,
    entry: FunctionId,
    options: EngineOptions,
) -> (CollectingHandler, Stats) {
    let mut handler = CollectingHandler::new();
    let stats = {
        let solver = NativeSolver::new(options.rng_seed);
        let strategy = DepthFirstStrategy::new();
        let mut executor = Executor::new(module, options, strategy, solver, &mut handler);
        executor.run(entry).expect("engine runs to completion");
        executor.stats
    };
    (handler, stats)
}

fn call(callee: FunctionId, args: Vec<Operand>, return_type: Type) -> Instruction {
    Instruction::Call {
        dest: None,
        callee: Operand::Function(callee),
        args,
        return_type,
        sext_return: false,
    }
}

fn ret_zero() -> Instruction {
    Instruction::Ret {
        value: Some(Operand::i32(0)),
    }
}

pub struct Runtime {
    pub builder: ModuleBuilder,
    pub make_symbolic: FunctionId,
    pub define_fixed_object: FunctionId,
    pub abort: FunctionId,
    pub malloc: FunctionId,
    pub free: FunctionId,
}

/// A module pre-populated with the declarations every scenario uses.
pub fn runtime() -> Runtime {
    let mut builder = ModuleBuilder::new();
    let make_symbolic = builder.declare(
        "make_symbolic",
        vec![Type::Pointer, Type::Int(64), Type::Pointer],
        Type::Void,
        false,
    );
    let define_fixed_object = builder.declare(
        "define_fixed_object",
        vec![Type::Pointer, Type::Int(64)],
        Type::Void,
        false,
    );
    let abort = builder.declare("abort", vec![], Type::Void, false);
    let malloc = builder.declare("malloc", vec![Type::Int(64)], Type::Pointer, false);
    let free = builder.declare("free", vec![Type::Pointer], Type::Void, false);
    Runtime {
        builder,
        make_symbolic,
        define_fixed_object,
        abort,
        malloc,
        free,
    }
}

/// `int x; make_symbolic(&x, 4, "x"); if (x == 7) abort();`
pub fn symbolic_branch_program() -> (Module, FunctionId) {
    let mut rt = runtime();
    let name = rt.builder.add_global(
        "x_name",
        Type::Array(Box::new(Type::Int(8)), 2),
        Some(vec![b'x', 0]),
        true,
    );
    let main = rt.builder.declare("main", vec![], Type::Int(32), false);
    {
        let mut f = rt.builder.function(main);
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
                callee: Operand::Function(rt.make_symbolic),
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
        f.push(then_block, call(rt.abort, vec![], Type::Void));
        f.push(then_block, Instruction::Unreachable);
        f.push(else_block, ret_zero());
    }
    (rt.builder.build(), main)
}

/// `int *p = malloc(8); p[2] = 9;` with the store at entry instruction 2.
pub fn out_of_bounds_program() -> (Module, FunctionId) {
    let mut rt = runtime();
    let main = rt.builder.declare("main", vec![], Type::Int(32), false);
    {
        let mut f = rt.builder.function(main);
        let entry = f.block();
        let p = f.local();
        let q = f.local();
        f.push(
            entry,
            Instruction::Call {
                dest: Some(p),
                callee: Operand::Function(rt.malloc),
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
        f.push(entry, ret_zero());
    }
    (rt.builder.build(), main)
}

/// `int *p = (int*)0x80; define_fixed_object(p, 8); p[1] = 10; p[2] = 9;`
pub fn fixed_object_program() -> (Module, FunctionId) {
    let mut rt = runtime();
    let main = rt.builder.declare("main", vec![], Type::Int(32), false);
    {
        let mut f = rt.builder.function(main);
        let entry = f.block();
        let p = f.local();
        let p1 = f.local();
        let p2 = f.local();
        f.push(
            entry,
            Instruction::Cast {
                dest: p,
                op: chimera::ir::CastOp::IntToPtr,
                value: Operand::i64(0x80),
                ty: Type::Pointer,
            },
        );
        f.push(
            entry,
            call(
                rt.define_fixed_object,
                vec![Operand::Local(p), Operand::i64(8)],
                Type::Void,
            ),
        );
        f.push(
            entry,
            Instruction::GetElementPtr {
                dest: p1,
                base: Operand::Local(p),
                offset: 4,
                indices: vec![],
            },
        );
        f.push(
            entry,
            Instruction::Store {
                address: Operand::Local(p1),
                value: Operand::i32(10),
            },
        );
        f.push(
            entry,
            Instruction::GetElementPtr {
                dest: p2,
                base: Operand::Local(p),
                offset: 8,
                indices: vec![],
            },
        );
        f.push(
            entry,
            Instruction::Store {
                address: Operand::Local(p2),
                value: Operand::i32(9),
            },
        );
        f.push(entry, ret_zero());
    }
    (rt.builder.build(), main)
}

/// `char *a = malloc(10); free(a); free(a);`
pub fn double_free_program() -> (Module, FunctionId) {
    let mut rt = runtime();
    let main = rt.builder.declare("main", vec![], Type::Int(32), false);
    {
        let mut f = rt.builder.function(main);
        let entry = f.block();
        let a = f.local();
        f.push(
            entry,
            Instruction::Call {
                dest: Some(a),
                callee: Operand::Function(rt.malloc),
                args: vec![Operand::i64(10)],
                return_type: Type::Pointer,
                sext_return: false,
            },
        );
        f.push(
            entry,
            call(rt.free, vec![Operand::Local(a)], Type::Void),
        );
        f.push(
            entry,
            call(rt.free, vec![Operand::Local(a)], Type::Void),
        );
        f.push(entry, ret_zero());
    }
    (rt.builder.build(), main)
}

/// `switch (x) { case 1: f(); break; case 2: f(); break; default: g(); }`
/// where `x` is symbolic; the case labels keep distinct successor blocks.
pub fn switch_program() -> (Module, FunctionId) {
    let mut rt = runtime();
    let name = rt.builder.add_global(
        "x_name",
        Type::Array(Box::new(Type::Int(8)), 2),
        Some(vec![b'x', 0]),
        true,
    );
    let marker = rt
        .builder
        .add_global("marker", Type::Int(32), Some(vec![0; 4]), false);
    let f_fn = rt.builder.declare("f", vec![], Type::Void, false);
    {
        let mut f = rt.builder.function(f_fn);
        let entry = f.block();
        f.push(
            entry,
            Instruction::Store {
                address: Operand::Global(marker),
                value: Operand::i32(1),
            },
        );
        f.push(entry, Instruction::Ret { value: None });
    }
    let g_fn = rt.builder.declare("g", vec![], Type::Void, false);
    {
        let mut f = rt.builder.function(g_fn);
        let entry = f.block();
        f.push(
            entry,
            Instruction::Store {
                address: Operand::Global(marker),
                value: Operand::i32(2),
            },
        );
        f.push(entry, Instruction::Ret { value: None });
    }
    let main = rt.builder.declare("main", vec![], Type::Int(32), false);
    {
        let mut f = rt.builder.function(main);
        let entry = f.block();
        let case1 = f.block();
        let case2 = f.block();
        let default = f.block();
        let done = f.block();
        let p = f.local();
        let x = f.local();
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
                callee: Operand::Function(rt.make_symbolic),
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
            Instruction::Switch {
                cond: Operand::Local(x),
                default_dest: default,
                cases: vec![(1, case1), (2, case2)],
            },
        );
        f.push(case1, call(f_fn, vec![], Type::Void));
        f.push(case1, Instruction::Br { dest: done });
        f.push(case2, call(f_fn, vec![], Type::Void));
        f.push(case2, Instruction::Br { dest: done });
        f.push(default, call(g_fn, vec![], Type::Void));
        f.push(default, Instruction::Br { dest: done });
        f.push(done, ret_zero());
    }
    (rt.builder.build(), main)
}

/// `char *p = malloc(4);` and nothing else.
pub fn leak_program() -> (Module, FunctionId) {
    let mut rt = runtime();
    let main = rt.builder.declare("main", vec![], Type::Int(32), false);
    {
        let mut f = rt.builder.function(main);
        let entry = f.block();
        let p = f.local();
        f.push(
            entry,
            Instruction::Call {
                dest: Some(p),
                callee: Operand::Function(rt.malloc),
                args: vec![Operand::i64(4)],
                return_type: Type::Pointer,
                sext_return: false,
            },
        );
        f.push(entry, ret_zero());
    }
    (rt.builder.build(), main)
}

/// `int x; make_symbolic(&x); int r = x / d;` with a symbolic divisor.
pub fn division_program() -> (Module, FunctionId) {
    let mut rt = runtime();
    let name = rt.builder.add_global(
        "d_name",
        Type::Array(Box::new(Type::Int(8)), 2),
        Some(vec![b'd', 0]),
        true,
    );
    let main = rt.builder.declare("main", vec![], Type::Int(32), false);
    {
        let mut f = rt.builder.function(main);
        let entry = f.block();
        let p = f.local();
        let d = f.local();
        let r = f.local();
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
                callee: Operand::Function(rt.make_symbolic),
                args: vec![Operand::Local(p), Operand::i64(4), Operand::Global(name)],
                return_type: Type::Void,
                sext_return: false,
            },
        );
        f.push(
            entry,
            Instruction::Load {
                dest: d,
                address: Operand::Local(p),
                ty: Type::Int(32),
            },
        );
        f.push(
            entry,
            Instruction::Binary {
                dest: r,
                op: BinOp::UDiv,
                lhs: Operand::i32(100),
                rhs: Operand::Local(d),
            },
        );
        f.push(entry, ret_zero());
    }
    (rt.builder.build(), main)
}
