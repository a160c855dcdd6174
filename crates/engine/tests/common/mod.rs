//! Shared fixtures: small labelled programs and pipeline helpers.
#![allow(dead_code)]

use cyclist_engine::context::Context;
use cyclist_engine::executor::Executor;
use cyclist_engine::solver::as_value;
use cyclist_engine::state::{contextualized_name, State};
use cyclist_engine::value::Value;
use cyclist_ir::builder::Builder;
use cyclist_ir::cfg::Cfg;
use cyclist_ir::expression::{
    BinaryOperator, Expression, FieldAccess, VariableAccess, VariableReference,
};
use cyclist_ir::instruction::{Assignment, Call, Instruction};
use cyclist_ir::interface::Interface;
use cyclist_ir::module::{Module, ModuleKind, Project};
use cyclist_ir::types::DataType;
use cyclist_ir::variable::{StorageType, Variable};
use cyclist_passes::tac::TacPass;
use std::collections::BTreeMap;
use std::rc::Rc;

/// Builds and three-address-converts a project's main program.
pub fn compile(project: &Project) -> Rc<Cfg> {
    let cfg = Builder::new(project).build().expect("project compiles");
    TacPass::new().apply(&cfg).expect("TAC applies")
}

/// S1: inputs x: BOOL, y: INT output;
/// `IF x THEN y := 1 ELSE y := 2 END_IF`.
pub fn branching_program() -> Project {
    let x = Variable::shared("x", DataType::BOOL, StorageType::Input);
    let y = Variable::shared("y", DataType::INT, StorageType::Output);
    let interface = Interface::new(vec![x.clone(), y.clone()]);
    let mut instructions = BTreeMap::new();
    instructions.insert(
        1,
        Instruction::If {
            condition: Expression::variable(x),
            then_label: 2,
            else_label: 4,
        },
    );
    instructions.insert(
        2,
        Instruction::assignment(VariableAccess::new(y.clone()), Expression::IntegerConstant(1)),
    );
    instructions.insert(3, Instruction::Goto { label: 6 });
    instructions.insert(
        4,
        Instruction::assignment(VariableAccess::new(y), Expression::IntegerConstant(2)),
    );
    instructions.insert(5, Instruction::Goto { label: 6 });
    let module = Module::new(ModuleKind::Program, "P", interface, instructions, 0, 6);
    Project::new(vec![module], "P").expect("project is well-formed")
}

/// S2: `f.i := 3; CALL f; y := f.o` with `Fb1 { i: IN, o: OUT; o := i + 1 }`.
pub fn calling_program() -> Project {
    let i = Variable::shared("i", DataType::INT, StorageType::Input);
    let o = Variable::shared("o", DataType::INT, StorageType::Output);
    let fb_interface = Interface::new(vec![i.clone(), o.clone()]);
    let mut fb_instructions = BTreeMap::new();
    fb_instructions.insert(
        11,
        Instruction::assignment(
            VariableAccess::new(o),
            Expression::binary(
                BinaryOperator::Add,
                Expression::variable(i),
                Expression::IntegerConstant(1),
            ),
        ),
    );
    fb_instructions.insert(12, Instruction::Goto { label: 13 });
    let fb = Module::new(
        ModuleKind::FunctionBlock,
        "Fb1",
        fb_interface,
        fb_instructions,
        10,
        13,
    );

    let f = Variable::shared(
        "f",
        DataType::Derived {
            name: "Fb1".to_string(),
        },
        StorageType::Local,
    );
    let y = Variable::shared("y", DataType::INT, StorageType::Output);
    let fi = Variable::shared("i", DataType::INT, StorageType::Input);
    let fo = Variable::shared("o", DataType::INT, StorageType::Output);
    let interface = Interface::new(vec![f.clone(), y.clone()]);
    let mut instructions = BTreeMap::new();
    instructions.insert(
        1,
        Instruction::Assignment(Assignment::parameter_in(
            FieldAccess::new(
                VariableAccess::new(f.clone()),
                VariableReference::Variable(VariableAccess::new(fi)),
            ),
            Expression::IntegerConstant(3),
        )),
    );
    instructions.insert(2, Instruction::Goto { label: 3 });
    instructions.insert(
        3,
        Instruction::Call(Call::new(VariableAccess::new(f.clone()), 5, 10)),
    );
    instructions.insert(
        5,
        Instruction::Assignment(Assignment::parameter_out(
            VariableAccess::new(y),
            Expression::FieldAccess(FieldAccess::new(
                VariableAccess::new(f),
                VariableReference::Variable(VariableAccess::new(fo)),
            )),
        )),
    );
    instructions.insert(6, Instruction::Goto { label: 7 });
    let main = Module::new(ModuleKind::Program, "P", interface, instructions, 0, 7);
    Project::new(vec![main, fb], "P").expect("project is well-formed")
}

/// S3: state `c : INT := 0`; body `c := c + 1`; no inputs.
pub fn counting_program() -> Project {
    let c = Rc::new(Variable::with_initialization(
        "c",
        DataType::INT,
        StorageType::Local,
        Expression::IntegerConstant(0),
    ));
    let interface = Interface::new(vec![c.clone()]);
    let mut instructions = BTreeMap::new();
    instructions.insert(
        1,
        Instruction::assignment(
            VariableAccess::new(c.clone()),
            Expression::binary(
                BinaryOperator::Add,
                Expression::variable(c),
                Expression::IntegerConstant(1),
            ),
        ),
    );
    instructions.insert(2, Instruction::Goto { label: 3 });
    let module = Module::new(ModuleKind::Program, "P", interface, instructions, 0, 3);
    Project::new(vec![module], "P").expect("project is well-formed")
}

/// S5: `Havoc(x); IF x > 10 THEN y := 1 ELSE y := 2 END_IF`.
pub fn havoc_program() -> Project {
    let x = Variable::shared("x", DataType::INT, StorageType::Local);
    let y = Variable::shared("y", DataType::INT, StorageType::Output);
    let interface = Interface::new(vec![x.clone(), y.clone()]);
    let mut instructions = BTreeMap::new();
    instructions.insert(1, Instruction::havoc(VariableAccess::new(x.clone())));
    instructions.insert(2, Instruction::Goto { label: 3 });
    instructions.insert(
        3,
        Instruction::If {
            condition: Expression::binary(
                BinaryOperator::GreaterThan,
                Expression::variable(x),
                Expression::IntegerConstant(10),
            ),
            then_label: 4,
            else_label: 6,
        },
    );
    instructions.insert(
        4,
        Instruction::assignment(VariableAccess::new(y.clone()), Expression::IntegerConstant(1)),
    );
    instructions.insert(5, Instruction::Goto { label: 8 });
    instructions.insert(
        6,
        Instruction::assignment(VariableAccess::new(y), Expression::IntegerConstant(2)),
    );
    instructions.insert(7, Instruction::Goto { label: 8 });
    let module = Module::new(ModuleKind::Program, "P", interface, instructions, 0, 8);
    Project::new(vec![module], "P").expect("project is well-formed")
}

/// S4: unified program with guard `change(x > 0, x >= 0)`.
pub fn unified_program() -> Project {
    let x = Variable::shared("x", DataType::INT, StorageType::Input);
    let y = Variable::shared("y", DataType::INT, StorageType::Output);
    let interface = Interface::new(vec![x.clone(), y.clone()]);
    let mut instructions = BTreeMap::new();
    instructions.insert(
        1,
        Instruction::If {
            condition: Expression::change(
                Expression::binary(
                    BinaryOperator::GreaterThan,
                    Expression::variable(x.clone()),
                    Expression::IntegerConstant(0),
                ),
                Expression::binary(
                    BinaryOperator::GreaterThanOrEqualTo,
                    Expression::variable(x),
                    Expression::IntegerConstant(0),
                ),
            ),
            then_label: 2,
            else_label: 4,
        },
    );
    instructions.insert(
        2,
        Instruction::assignment(VariableAccess::new(y.clone()), Expression::IntegerConstant(1)),
    );
    instructions.insert(3, Instruction::Goto { label: 6 });
    instructions.insert(
        4,
        Instruction::assignment(VariableAccess::new(y), Expression::IntegerConstant(2)),
    );
    instructions.insert(5, Instruction::Goto { label: 6 });
    let module = Module::new(ModuleKind::Program, "P", interface, instructions, 0, 6);
    Project::new(vec![module], "P").expect("project is well-formed")
}

/// Drives a context until it reaches the given cycle, collecting forks.
pub fn run_to_cycle<'ctx>(
    executor: &mut Executor<'ctx>,
    mut context: Context<'ctx>,
    cycle: u32,
) -> (Context<'ctx>, Vec<Context<'ctx>>) {
    let mut forks = Vec::new();
    while context.cycle() < cycle {
        let (primary, forked) = executor.execute(context).expect("execution succeeds");
        context = primary;
        if let Some(forked) = forked {
            forks.push(forked);
        }
    }
    (context, forks)
}

/// The concrete literal of a flattened name's highest version in a cycle.
pub fn terminal_value(state: &State<'_>, flattened: &str, cycle: u32) -> Value {
    let version = state.scanned_highest_version(flattened, cycle);
    let name = contextualized_name(flattened, version, cycle);
    as_value(state.concrete_valuation(&name).expect("cell is bound")).expect("cell is a literal")
}
