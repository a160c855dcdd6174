//! Call transformation: makes inter-procedural data flow explicit.
//!
//! Non-program CFGs are augmented with `<name>_input` / `<name>_output`
//! variables for their interface: inputs gain an `_input` twin and an
//! entry move `x := x_input`, outputs gain an `_output` twin and an exit
//! move `x_output := x`, and locals gain both. Callers mirror their
//! callees' state: for every instance `f : Fb1` the caller receives one
//! `f_x` copy per callee local `x`, threaded around each call site by a
//! prepended `f.x_input := f_x` and an appended `f_x := f.x_output`.
//! Parameter-in assignments written by the front end are retargeted to the
//! `_input` twin, parameter-out reads to the `_output` twin.

use cyclist_ir::cfg::{Cfg, CfgKind, Vertex, VertexKind};
use cyclist_ir::error::IrError;
use cyclist_ir::expression::{
    Expression, FieldAccess, Label, VariableAccess, VariableReference,
};
use cyclist_ir::instruction::{Assignment, AssignmentKind, Instruction};
use cyclist_ir::interface::Interface;
use cyclist_ir::variable::{StorageType, Variable};
use std::collections::BTreeMap;
use std::rc::Rc;

/// The call transformation pass with per-type-representative memoization.
pub struct CallTransformationPass {
    transformed: BTreeMap<String, Rc<Cfg>>,
}

impl CallTransformationPass {
    pub fn new() -> Self {
        CallTransformationPass {
            transformed: BTreeMap::new(),
        }
    }

    pub fn apply(&mut self, cfg: &Cfg) -> Result<Rc<Cfg>, IrError> {
        let mut callees = BTreeMap::new();
        for (name, callee) in cfg.callees() {
            let transformed = match self.transformed.get(name) {
                Some(existing) => existing.clone(),
                None => {
                    let fresh = self.apply(callee)?;
                    self.transformed.insert(name.clone(), fresh.clone());
                    fresh
                }
            };
            callees.insert(name.clone(), transformed);
        }

        // Rewrite the instruction of every regular vertex into a per-label
        // list; parameter moves are retargeted to their _input/_output
        // twins against the transformed callee interfaces.
        let mut label_to_instructions: BTreeMap<Label, Vec<Instruction>> = BTreeMap::new();
        for vertex in cfg.vertices() {
            if vertex.label() == cfg.entry_label() || vertex.label() == cfg.exit_label() {
                continue;
            }
            let instruction = vertex.instruction().ok_or_else(|| {
                IrError::invalid(format!(
                    "regular vertex L{} holds no instruction",
                    vertex.label()
                ))
            })?;
            rewrite(vertex.label(), instruction, &callees, &mut label_to_instructions)?;
        }

        // Build the augmented interface.
        let mut variables: Vec<Rc<Variable>> = Vec::new();
        // (x, x_input) pairs for the entry moves, (x_output, x) for exit.
        let mut entry_moves: Vec<(Rc<Variable>, Rc<Variable>)> = Vec::new();
        let mut exit_moves: Vec<(Rc<Variable>, Rc<Variable>)> = Vec::new();
        // instance name -> [(callee local name, caller state variable)]
        let mut state_copies: BTreeMap<String, Vec<(String, Rc<Variable>)>> = BTreeMap::new();

        for variable in cfg.interface().variables() {
            match variable.data_type().derived_name() {
                None => {
                    variables.push(variable.clone());
                    if cfg.kind() == CfgKind::Program {
                        continue;
                    }
                    match variable.storage() {
                        StorageType::Input => {
                            let twin = Rc::new(
                                variable
                                    .renamed(format!("{}_input", variable.name()))
                                    .with_storage(StorageType::Input),
                            );
                            variables.push(twin.clone());
                            entry_moves.push((variable.clone(), twin));
                        }
                        StorageType::Output => {
                            let twin = Rc::new(
                                variable
                                    .renamed(format!("{}_output", variable.name()))
                                    .with_storage(StorageType::Output),
                            );
                            variables.push(twin.clone());
                            exit_moves.push((twin, variable.clone()));
                        }
                        StorageType::Local => {
                            let input_twin = Rc::new(
                                variable
                                    .renamed(format!("{}_input", variable.name()))
                                    .with_storage(StorageType::Input),
                            );
                            variables.push(input_twin.clone());
                            entry_moves.push((variable.clone(), input_twin));
                            let output_twin = Rc::new(
                                variable
                                    .renamed(format!("{}_output", variable.name()))
                                    .with_storage(StorageType::Output),
                            );
                            variables.push(output_twin.clone());
                            exit_moves.push((output_twin, variable.clone()));
                        }
                        StorageType::Temporary => {}
                    }
                }
                Some(type_name) => {
                    variables.push(variable.clone());
                    let callee = callees.get(type_name).ok_or_else(|| {
                        IrError::invalid(format!(
                            "no type representative cfg for {} exists",
                            type_name
                        ))
                    })?;
                    let mut copies = Vec::new();
                    for local in callee.interface().local_variables() {
                        if local.data_type().is_derived() {
                            // Nested instances were flattened into their
                            // own caller's state copies already.
                            continue;
                        }
                        let copy = Rc::new(
                            local
                                .renamed(format!("{}_{}", variable.name(), local.name()))
                                .with_storage(StorageType::Local),
                        );
                        variables.push(copy.clone());
                        copies.push((local.name().to_string(), copy));
                    }
                    state_copies.insert(variable.name().to_string(), copies);
                }
            }
        }

        // Thread callee state around every call site.
        for (instance, copies) in &state_copies {
            if copies.is_empty() {
                continue;
            }
            let call_labels: Vec<Label> = label_to_instructions
                .iter()
                .filter(|(_, instructions)| {
                    instructions.iter().any(|i| match i {
                        Instruction::Call(call) => call.callee.name() == *instance,
                        _ => false,
                    })
                })
                .map(|(label, _)| *label)
                .collect();
            for call_label in call_labels {
                let instance_variable = variables
                    .iter()
                    .find(|v| v.name() == *instance)
                    .cloned()
                    .ok_or_else(|| {
                        IrError::invalid(format!("instance variable {} disappeared", instance))
                    })?;
                let return_label = cfg.call_to_return_edge(call_label)?.target();
                let mut pre = Vec::new();
                let mut post = Vec::new();
                for (local_name, copy) in copies {
                    let input_twin = Variable::shared(
                        format!("{}_input", local_name),
                        copy.data_type().clone(),
                        StorageType::Input,
                    );
                    pre.push(Instruction::Assignment(Assignment::parameter_in(
                        FieldAccess::new(
                            VariableAccess::new(instance_variable.clone()),
                            VariableReference::Variable(VariableAccess::new(input_twin)),
                        ),
                        Expression::variable(copy.clone()),
                    )));
                    let output_twin = Variable::shared(
                        format!("{}_output", local_name),
                        copy.data_type().clone(),
                        StorageType::Output,
                    );
                    post.push(Instruction::Assignment(Assignment::parameter_out(
                        VariableAccess::new(copy.clone()),
                        Expression::FieldAccess(FieldAccess::new(
                            VariableAccess::new(instance_variable.clone()),
                            VariableReference::Variable(VariableAccess::new(output_twin)),
                        )),
                    )));
                }
                splice_front(label_to_instructions.entry(call_label).or_default(), pre);
                splice_front(label_to_instructions.entry(return_label).or_default(), post);
            }
        }

        // Rebuild vertices; entry and exit of non-program CFGs receive the
        // move sequences.
        let mut vertices = BTreeMap::new();
        for vertex in cfg.vertices() {
            let label = vertex.label();
            if cfg.kind() != CfgKind::Program && label == cfg.entry_label() {
                let moves = entry_moves
                    .iter()
                    .map(|(target, source)| {
                        Instruction::assignment(
                            VariableAccess::new(target.clone()),
                            Expression::variable(source.clone()),
                        )
                    })
                    .collect();
                vertices.insert(
                    label,
                    Vertex::with_instruction(label, VertexKind::Entry, Instruction::Sequence(moves)),
                );
            } else if cfg.kind() != CfgKind::Program && label == cfg.exit_label() {
                // A call site returning directly to the exit contributes
                // its parameter-out moves ahead of the exit moves.
                let mut moves: Vec<Instruction> =
                    label_to_instructions.get(&label).cloned().unwrap_or_default();
                moves.extend(exit_moves.iter().map(|(target, source)| {
                    Instruction::assignment(
                        VariableAccess::new(target.clone()),
                        Expression::variable(source.clone()),
                    )
                }));
                vertices.insert(
                    label,
                    Vertex::with_instruction(label, VertexKind::Exit, Instruction::Sequence(moves)),
                );
            } else if let Some(instructions) = label_to_instructions.get(&label) {
                let instruction = if instructions.len() == 1 {
                    instructions[0].clone()
                } else {
                    Instruction::Sequence(instructions.clone())
                };
                vertices.insert(
                    label,
                    Vertex::with_instruction(label, vertex.kind(), instruction),
                );
            } else {
                vertices.insert(label, Vertex::new(label, vertex.kind()));
            }
        }

        let edges = cfg.edges().cloned().collect();
        Ok(Rc::new(Cfg::new(
            cfg.kind(),
            cfg.name(),
            Interface::new(variables),
            callees,
            vertices,
            edges,
            cfg.entry_label(),
            cfg.exit_label(),
        )))
    }
}

impl Default for CallTransformationPass {
    fn default() -> Self {
        CallTransformationPass::new()
    }
}

fn splice_front(list: &mut Vec<Instruction>, mut front: Vec<Instruction>) {
    front.append(list);
    *list = front;
}

fn rewrite(
    label: Label,
    instruction: &Instruction,
    callees: &BTreeMap<String, Rc<Cfg>>,
    out: &mut BTreeMap<Label, Vec<Instruction>>,
) -> Result<(), IrError> {
    match instruction {
        Instruction::Assignment(assignment) => {
            let rewritten = match assignment.kind {
                AssignmentKind::Regular => Instruction::Assignment(assignment.clone()),
                AssignmentKind::ParameterIn => {
                    let field = match &assignment.target {
                        VariableReference::Field(field) => field,
                        VariableReference::Variable(_) => {
                            return Err(IrError::invalid(format!(
                                "parameter-in assignment at L{} does not target a field",
                                label
                            )));
                        }
                    };
                    let twin = twin_access(field, callees, "_input")?;
                    Instruction::Assignment(Assignment::parameter_in(twin, assignment.rhs.clone()))
                }
                AssignmentKind::ParameterOut => {
                    let field = match &assignment.rhs {
                        Expression::FieldAccess(field) => field,
                        _ => {
                            return Err(IrError::NotImplemented(format!(
                                "parameter-out assignment at L{} with a non-field source",
                                label
                            )));
                        }
                    };
                    let twin = twin_access(field, callees, "_output")?;
                    Instruction::Assignment(Assignment::parameter_out(
                        assignment.target.clone(),
                        Expression::FieldAccess(twin),
                    ))
                }
            };
            out.entry(label).or_default().push(rewritten);
        }
        Instruction::Sequence(members) => {
            for member in members {
                rewrite(label, member, callees, out)?;
            }
        }
        Instruction::Goto { .. } => {
            return Err(IrError::NotImplemented(
                "goto instructions in compiled CFGs".to_string(),
            ));
        }
        _ => {
            out.entry(label).or_default().push(instruction.clone());
        }
    }
    Ok(())
}

/// Rebuilds `f.x` as `f.x_input` / `f.x_output` using the transformed
/// callee's interface declaration of the twin.
fn twin_access(
    field: &FieldAccess,
    callees: &BTreeMap<String, Rc<Cfg>>,
    suffix: &str,
) -> Result<FieldAccess, IrError> {
    let instance = field.record();
    let type_name = instance
        .variable()
        .data_type()
        .derived_name()
        .ok_or_else(|| {
            IrError::invalid(format!(
                "field access {} does not go through a derived-typed variable",
                field
            ))
        })?;
    let callee = callees.get(type_name).ok_or_else(|| {
        IrError::invalid(format!("no type representative cfg for {} exists", type_name))
    })?;
    let twin_name = format!("{}{}", field.field().name(), suffix);
    let twin = callee.interface().variable(&twin_name).cloned().ok_or_else(|| {
        IrError::invalid(format!(
            "transformed callee {} declares no variable {}",
            type_name, twin_name
        ))
    })?;
    Ok(FieldAccess::new(
        instance.clone(),
        VariableReference::Variable(VariableAccess::new(twin)),
    ))
}
