//! End-to-end scenarios of the concolic engine.

mod common;

use common::*;
use cyclist_engine::engine::Engine;
use cyclist_engine::executor::Executor;
use cyclist_engine::solver::{constant_name, Solver};
use cyclist_engine::state::contextualized_name;
use cyclist_engine::value::Value;
use std::collections::BTreeSet;
use z3::ast::Ast;

// S1: one cycle of IF x THEN y := 1 ELSE y := 2 covers both branches and
// derives exactly the two input valuations.
#[test]
fn test_plain_if_with_symbolic_input() {
    let solver = Solver::with_seed(11);
    let cfg = compile(&branching_program());
    let engine = Engine::new(&solver, 1);
    let outcome = engine.run(&cfg).unwrap();

    assert_eq!(outcome.statement_coverage, 1.0);
    assert_eq!(outcome.branch_coverage, 1.0);
    assert_eq!(outcome.test_suite.len(), 2);

    let mut witnessed = BTreeSet::new();
    for test_case in outcome.test_suite.test_cases() {
        assert_eq!(test_case.initial_state().get("P.y"), Some(&Value::Int(0)));
        let inputs = &test_case.cycle_inputs()[&0];
        witnessed.insert(inputs["P.x"]);
    }
    assert_eq!(
        witnessed.into_iter().collect::<Vec<_>>(),
        vec![Value::Bool(false), Value::Bool(true)]
    );
}

// S2: after one cycle through the call, the main context's store holds
// P.y = 4.
#[test]
fn test_single_call() {
    let solver = Solver::with_seed(11);
    let cfg = compile(&calling_program());
    let mut executor = Executor::new(&solver);
    let context = executor.initial_context(&cfg).unwrap();
    let (context, forks) = run_to_cycle(&mut executor, context, 1);
    assert!(forks.is_empty(), "a straight-line program does not fork");
    assert_eq!(terminal_value(context.state(), "P.y", 0), Value::Int(4));
    // The callee's cells live under the instance scope.
    assert_eq!(terminal_value(context.state(), "P.f.o", 0), Value::Int(4));
    assert_eq!(terminal_value(context.state(), "P.f.i", 0), Value::Int(3));
}

// S3: the counter counts 1, 2, 3 over three cycles; the path constraint
// resets between cycles and versions restart at 0.
#[test]
fn test_cycle_carry() {
    let solver = Solver::with_seed(11);
    let cfg = compile(&counting_program());
    let mut executor = Executor::new(&solver);
    let mut context = executor.initial_context(&cfg).unwrap();
    for cycle in 0..3u32 {
        let (closed, forks) = run_to_cycle(&mut executor, context, cycle + 1);
        assert!(forks.is_empty());
        assert_eq!(
            terminal_value(closed.state(), "P.c", cycle),
            Value::Int(cycle as i64 + 1),
        );
        // Invariant 5: cycle closure clears the path constraint and
        // resets every version.
        assert!(closed.state().path_constraint().is_empty());
        assert!(closed.state().versions().values().all(|v| *v == 0));
        // The carried-forward cell of the next cycle is bound at
        // version 0.
        assert_eq!(
            closed.state().scanned_lowest_version("P.c", cycle + 1),
            0
        );
        context = closed;
    }
}

// S5: both branches behind the havoc'd cell are feasible.
#[test]
fn test_havoc_feasibility() {
    let solver = Solver::with_seed(11);
    let cfg = compile(&havoc_program());
    let engine = Engine::new(&solver, 1);
    let outcome = engine.run(&cfg).unwrap();
    assert_eq!(outcome.statement_coverage, 1.0);
    assert_eq!(outcome.branch_coverage, 1.0);
    assert!(!outcome.test_suite.is_empty());
}

// A havoc rebinds the cell to a fresh unconstrained constant that is
// distinguishable from the prior version.
#[test]
fn test_havoc_introduces_fresh_constant() {
    let solver = Solver::with_seed(11);
    let cfg = compile(&havoc_program());
    let mut executor = Executor::new(&solver);
    let mut context = executor.initial_context(&cfg).unwrap();
    // Step to just after the havoc: entry, then the havoc vertex.
    for _ in 0..2 {
        let (primary, _) = executor.execute(context).unwrap();
        context = primary;
    }
    let havoced = contextualized_name("P.x", 1, 0);
    let symbolic = context.state().symbolic_valuation(&havoced).unwrap();
    assert_eq!(constant_name(symbolic).as_deref(), Some(havoced.as_str()));
    // The prior version still holds its initial value.
    let initial = contextualized_name("P.x", 0, 0);
    assert!(context.state().concrete_valuation(&initial).is_ok());
    assert_ne!(havoced, initial);
}

// A guard over constrained-only constants must not fork.
#[test]
fn test_deterministic_guard_does_not_fork() {
    use cyclist_ir::expression::{BinaryOperator, Expression, VariableAccess};
    use cyclist_ir::instruction::Instruction;
    use cyclist_ir::interface::Interface;
    use cyclist_ir::module::{Module, ModuleKind, Project};
    use cyclist_ir::types::DataType;
    use cyclist_ir::variable::{StorageType, Variable};
    use std::collections::BTreeMap;

    // y := 5; IF y > 3 THEN z := 1 ELSE z := 2: the guard depends only on
    // a constant-valued local.
    let y = Variable::shared("y", DataType::INT, StorageType::Local);
    let z = Variable::shared("z", DataType::INT, StorageType::Output);
    let interface = Interface::new(vec![y.clone(), z.clone()]);
    let mut instructions = BTreeMap::new();
    instructions.insert(
        1,
        Instruction::assignment(VariableAccess::new(y.clone()), Expression::IntegerConstant(5)),
    );
    instructions.insert(2, Instruction::Goto { label: 3 });
    instructions.insert(
        3,
        Instruction::If {
            condition: Expression::binary(
                BinaryOperator::GreaterThan,
                Expression::variable(y),
                Expression::IntegerConstant(3),
            ),
            then_label: 4,
            else_label: 6,
        },
    );
    instructions.insert(
        4,
        Instruction::assignment(VariableAccess::new(z.clone()), Expression::IntegerConstant(1)),
    );
    instructions.insert(5, Instruction::Goto { label: 8 });
    instructions.insert(
        6,
        Instruction::assignment(VariableAccess::new(z), Expression::IntegerConstant(2)),
    );
    instructions.insert(7, Instruction::Goto { label: 8 });
    let module = Module::new(ModuleKind::Program, "P", interface, instructions, 0, 8);
    let project = Project::new(vec![module], "P").unwrap();

    let solver = Solver::with_seed(11);
    let cfg = compile(&project);
    let mut executor = Executor::new(&solver);
    let context = executor.initial_context(&cfg).unwrap();
    let (_, forks) = run_to_cycle(&mut executor, context, 1);
    assert!(forks.is_empty(), "local-deterministic branches never fork");
}

// Invariants 1-4 over a forked pair.
#[test]
fn test_fork_invariants() {
    let solver = Solver::with_seed(11);
    let cfg = compile(&branching_program());
    let mut executor = Executor::new(&solver);
    let mut context = executor.initial_context(&cfg).unwrap();

    // Step through the entry and the branch.
    let mut forked = None;
    while forked.is_none() {
        let (primary, fork) = executor.execute(context).unwrap();
        context = primary;
        forked = fork;
    }
    let forked = forked.unwrap();

    for state in [context.state(), forked.state()] {
        // Invariant 1: concrete and symbolic stores bind the same names.
        let concrete: Vec<_> = state.concrete_valuations().keys().collect();
        let symbolic: Vec<_> = state.symbolic_valuations().keys().collect();
        assert_eq!(concrete, symbolic);
        // Invariants 2-3: the local version map bounds the store scan.
        for (flattened, version) in state.versions() {
            assert_eq!(state.scanned_highest_version(flattened, 0), *version);
            assert!(executor.version(flattened).is_some_and(|g| *version <= g));
        }
    }

    // Invariant 4: the fork's path constraint is the parent's with the
    // branch expression appended, negated relative to the taken side.
    let parent = context.state().path_constraint();
    let child = forked.state().path_constraint();
    assert_eq!(parent.len(), 1);
    assert_eq!(child.len(), 1);
    assert_ne!(parent[0], child[0]);
    let negated = parent[0].not().simplify();
    assert_eq!(negated, child[0].simplify());
}
