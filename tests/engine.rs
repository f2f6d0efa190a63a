mod common;

use byteorder::{ByteOrder, LittleEndian};
use chimera::address_space::HostMemory;
use chimera::engine::{EngineOptions, Executor};
use chimera::error::TerminateReason;
use chimera::exploration_strategy::DepthFirstStrategy;
use chimera::ir::{CmpPred, CodePtr, Instruction, Operand, Type};
use chimera::solver::native::NativeSolver;
use chimera::testcase::{CollectingHandler, TestCase, TestObject};
use common::{init, run_program};

fn value_of(test: &TestCase, name: &str) -> u32 {
    let object = test.object(name).expect("input object present");
    LittleEndian::read_u32(&object.bytes)
}

#[test]
fn symbolic_branch_splits_into_abort_and_exit() {
    init();
    let (module, main) = common::symbolic_branch_program();
    let (handler, stats) = run_program(&module, main, EngineOptions::default());

    assert_eq!(handler.tests.len(), 2, "one test per explored path");
    assert_eq!(stats.forks, 1);

    let abort = handler
        .tests
        .iter()
        .find(|t| t.kind == Some(TerminateReason::Abort))
        .expect("the x == 7 path aborts");
    assert_eq!(value_of(abort, "x"), 7);

    let exit = handler
        .tests
        .iter()
        .find(|t| t.kind.is_none())
        .expect("the other path exits normally");
    assert_ne!(value_of(exit, "x"), 7);
}

#[test]
fn out_of_bounds_store_terminates_with_ptr() {
    init();
    let (module, main) = common::out_of_bounds_program();
    let (handler, _) = run_program(&module, main, EngineOptions::default());

    assert_eq!(handler.tests.len(), 1);
    let error = &handler.tests[0];
    assert_eq!(error.kind, Some(TerminateReason::Ptr));
    assert!(error
        .message
        .as_ref()
        .unwrap()
        .contains("out of bound pointer"));
    // attribution points at the store
    assert_eq!(
        error.instruction,
        Some(CodePtr {
            function: main,
            block: 0,
            index: 2
        })
    );
}

#[test]
fn fixed_object_store_in_bounds_succeeds_next_one_fails() {
    init();
    let (module, main) = common::fixed_object_program();
    let (handler, _) = run_program(&module, main, EngineOptions::default());

    assert_eq!(handler.tests.len(), 1);
    let error = &handler.tests[0];
    assert_eq!(error.kind, Some(TerminateReason::Ptr));
    // p[1] succeeded: the failure is attributed to the p[2] store
    assert_eq!(
        error.instruction,
        Some(CodePtr {
            function: main,
            block: 0,
            index: 5
        })
    );
}

#[test]
fn double_free_terminates_with_ptr() {
    init();
    let (module, main) = common::double_free_program();
    let (handler, _) = run_program(&module, main, EngineOptions::default());

    assert_eq!(handler.tests.len(), 1);
    let error = &handler.tests[0];
    assert_eq!(error.kind, Some(TerminateReason::Ptr));
    assert!(error.message.as_ref().unwrap().contains("double free"));
}

#[test]
fn switch_explores_each_case_with_two_forks() {
    init();
    let (module, main) = common::switch_program();
    let (handler, stats) = run_program(&module, main, EngineOptions::default());

    assert_eq!(handler.tests.len(), 3, "one terminal state per case");
    assert_eq!(stats.forks, 2, "a three-way branch is two forks");

    let mut values: Vec<u32> = handler
        .tests
        .iter()
        .map(|t| value_of(t, "x"))
        .collect();
    values.sort_unstable();
    assert_eq!(values[0], 1);
    assert_eq!(values[1], 2);
    assert!(values[2] != 1 && values[2] != 2, "default case input");
}

#[test]
fn memcleanup_reports_unfreed_allocation() {
    init();
    let (module, main) = common::leak_program();
    let options = EngineOptions {
        check_memcleanup: true,
        ..EngineOptions::default()
    };
    let (handler, _) = run_program(&module, main, options);

    assert_eq!(handler.tests.len(), 1);
    let error = &handler.tests[0];
    assert_eq!(error.kind, Some(TerminateReason::Leak));
    assert!(
        error.message.as_ref().unwrap().contains("malloc"),
        "leak info names the allocation site"
    );
}

#[test]
fn leak_check_accepts_reachable_memory() {
    init();
    // the pointer stays live in a local, so check-leaks (unlike
    // check-memcleanup) has nothing to report
    let (module, main) = common::leak_program();
    let options = EngineOptions {
        check_leaks: true,
        ..EngineOptions::default()
    };
    let (handler, _) = run_program(&module, main, options);
    assert!(handler
        .tests
        .iter()
        .all(|t| t.kind != Some(TerminateReason::Leak)));
}

#[test]
fn feasible_zero_divisor_forks_an_overflow_error() {
    init();
    let (module, main) = common::division_program();
    let (handler, _) = run_program(&module, main, EngineOptions::default());

    let overflow = handler
        .tests
        .iter()
        .find(|t| t.kind == Some(TerminateReason::Overflow))
        .expect("division by zero is feasible");
    assert_eq!(value_of(overflow, "d"), 0);

    let survivor = handler
        .tests
        .iter()
        .find(|t| t.kind.is_none())
        .expect("the nonzero divisor path survives");
    assert_ne!(value_of(survivor, "d"), 0);
}

#[test]
fn exit_on_error_type_halts_the_run() {
    init();
    let (module, main) = common::symbolic_branch_program();
    let options = EngineOptions {
        exit_on_error_kind: vec![TerminateReason::Abort],
        dump_states_on_halt: false,
        ..EngineOptions::default()
    };
    let (handler, _) = run_program(&module, main, options);

    assert!(handler
        .tests
        .iter()
        .any(|t| t.kind == Some(TerminateReason::Abort)));
    assert!(
        handler.tests.iter().all(|t| t.kind.is_some()),
        "halt left no normally-exited test behind"
    );
}

#[test]
fn generated_tests_are_deterministic_across_runs() {
    init();
    let (module, main) = common::switch_program();
    let (first, _) = run_program(&module, main, EngineOptions::default());
    let (second, _) = run_program(&module, main, EngineOptions::default());
    assert_eq!(first.tests, second.tests);

    let (module, main) = common::symbolic_branch_program();
    let (first, _) = run_program(&module, main, EngineOptions::default());
    let (second, _) = run_program(&module, main, EngineOptions::default());
    assert_eq!(first.tests, second.tests);
}

#[test]
fn seeds_steer_execution_into_the_abort_path() {
    init();
    let (module, main) = common::symbolic_branch_program();
    let seed = TestCase {
        objects: vec![TestObject {
            name: "x".to_string(),
            bytes: vec![7, 0, 0, 0],
        }],
        ..TestCase::default()
    };

    let options = EngineOptions {
        only_seed: true,
        ..EngineOptions::default()
    };
    let mut handler = CollectingHandler::new();
    {
        let solver = NativeSolver::new(options.rng_seed);
        let strategy = DepthFirstStrategy::new();
        let mut executor =
            Executor::new(&module, options, strategy, solver, &mut handler).with_seeds(vec![seed]);
        executor.run(main).expect("engine runs");
    }

    let abort = handler
        .tests
        .iter()
        .find(|t| t.kind == Some(TerminateReason::Abort))
        .expect("the seeded path reaches the abort");
    assert_eq!(value_of(abort, "x"), 7);
}

#[test]
fn test_cases_serialize_to_replayable_artifacts() {
    init();
    let (module, main) = common::symbolic_branch_program();
    let (handler, _) = run_program(&module, main, EngineOptions::default());

    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("test000001.txt");
    let mut file = std::fs::File::create(&path).expect("create artifact");
    handler.tests[0].write_to(&mut file).expect("write artifact");

    let text = std::fs::read_to_string(&path).expect("read artifact");
    assert!(text.contains("status:"));
    assert!(text.contains("object x"));
    assert!(text.contains("path:"));
}

#[test]
fn external_calls_marshal_concrete_arguments() {
    init();
    let mut rt = common::runtime();
    let add_pair = rt.builder.declare(
        "add_pair",
        vec![Type::Int(64), Type::Int(64)],
        Type::Int(64),
        false,
    );
    let abort = rt.abort;
    let main = rt.builder.declare("main", vec![], Type::Int(32), false);
    {
        let mut f = rt.builder.function(main);
        let entry = f.block();
        let hit = f.block();
        let missed = f.block();
        let sum = f.local();
        let cond = f.local();
        f.push(
            entry,
            Instruction::Call {
                dest: Some(sum),
                callee: Operand::Function(add_pair),
                args: vec![Operand::i64(2), Operand::i64(3)],
                return_type: Type::Int(64),
                sext_return: false,
            },
        );
        f.push(
            entry,
            Instruction::ICmp {
                dest: cond,
                pred: CmpPred::Eq,
                lhs: Operand::Local(sum),
                rhs: Operand::i64(5),
            },
        );
        f.push(
            entry,
            Instruction::CondBr {
                cond: Operand::Local(cond),
                then_dest: hit,
                else_dest: missed,
            },
        );
        f.push(
            hit,
            Instruction::Call {
                dest: None,
                callee: Operand::Function(abort),
                args: vec![],
                return_type: Type::Void,
                sext_return: false,
            },
        );
        f.push(hit, Instruction::Unreachable);
        f.push(
            missed,
            Instruction::Ret {
                value: Some(Operand::i32(0)),
            },
        );
    }
    let module = rt.builder.build();

    let mut handler = CollectingHandler::new();
    {
        let options = EngineOptions::default();
        let solver = NativeSolver::new(options.rng_seed);
        let strategy = DepthFirstStrategy::new();
        let mut executor = Executor::new(&module, options, strategy, solver, &mut handler);
        executor.externals_mut().register(
            "add_pair",
            Box::new(|_host: &mut HostMemory, args: &[u64]| Ok(args[0] + args[1])),
        );
        executor.run(main).expect("engine runs");
    }

    assert_eq!(handler.tests.len(), 1);
    assert_eq!(handler.tests[0].kind, Some(TerminateReason::Abort));
}
