//! Braun-style on-demand SSA construction.
//!
//! Blocks are processed along control flow: a block is *filled* once its
//! instructions are rewritten and *sealed* once every predecessor is
//! filled. Reads resolve locally when possible and otherwise recurse into
//! predecessors; merge points receive operand-less phi candidates whose
//! operands are filled from the predecessors afterwards. A phi with one
//! distinct non-self operand is trivial and replaced by that operand,
//! recursively revisiting its users.
//!
//! Definition sites assign freshly suffixed variables `name_k` with a
//! value counter shared across the whole construction; `_input` and
//! `_output` variables introduced by the call transformation keep their
//! unsuffixed names so interprocedural data flow stays addressable.

use cyclist_ir::cfg::{Cfg, CfgKind, EdgeKind, Vertex};
use cyclist_ir::error::IrError;
use cyclist_ir::expression::{
    Expression, FieldAccess, Label, Phi, VariableAccess, VariableReference,
};
use cyclist_ir::instruction::{Assignment, AssignmentKind, Instruction};
use cyclist_ir::interface::Interface;
use cyclist_ir::variable::{StorageType, Variable};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::rc::Rc;

/// The SSA construction pass with per-type-representative memoization.
pub struct SsaPass {
    transformed: BTreeMap<String, Rc<Cfg>>,
    next_value: u32,
}

impl SsaPass {
    pub fn new() -> Self {
        SsaPass {
            transformed: BTreeMap::new(),
            next_value: 0,
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
        let mut build = SsaBuild::new(self, cfg);
        build.run()?;
        build.finish(callees)
    }
}

impl Default for SsaPass {
    fn default() -> Self {
        SsaPass::new()
    }
}

/// A pending merge: an operand-less phi placed at a merge point, filled
/// from its predecessors once they are known.
#[derive(Debug, Clone)]
struct PhiCandidate {
    name: String,
    label: Label,
    operands: Vec<(Label, u32)>,
    users: Vec<u32>,
}

struct SsaBuild<'a, 'p> {
    pass: &'p mut SsaPass,
    cfg: &'a Cfg,
    value_to_variable: BTreeMap<u32, Rc<Variable>>,
    current_definitions: BTreeMap<String, BTreeMap<Label, u32>>,
    filled: BTreeSet<Label>,
    sealed: BTreeSet<Label>,
    phi_candidates: BTreeMap<u32, PhiCandidate>,
    label_to_instructions: BTreeMap<Label, Vec<Instruction>>,
}

/// Whether a name belongs to the stable interprocedural namespace and
/// must not be version-suffixed.
fn keeps_plain_name(name: &str) -> bool {
    name.ends_with("_input") || name.ends_with("_output")
}

/// The base name of a versioned definition: `c_12` reverts to `c`,
/// interprocedural names stay as they are.
fn base_name(name: &str) -> &str {
    if keeps_plain_name(name) {
        return name;
    }
    match name.rsplit_once('_') {
        Some((base, suffix)) if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) => {
            base
        }
        _ => name,
    }
}

/// Reverts SSA form: every definition site gets its base name back and
/// phi assignments disappear, so each read sees the last reaching write.
/// The result is semantically equivalent to the pre-SSA CFG under any
/// concrete execution.
pub fn revert(cfg: &Cfg) -> Result<Rc<Cfg>, IrError> {
    let mut reverted: BTreeMap<String, Rc<Cfg>> = BTreeMap::new();
    let mut callees = BTreeMap::new();
    for (name, callee) in cfg.callees() {
        let fresh = match reverted.get(name) {
            Some(existing) => existing.clone(),
            None => {
                let fresh = revert(callee)?;
                reverted.insert(name.clone(), fresh.clone());
                fresh
            }
        };
        callees.insert(name.clone(), fresh);
    }

    // One base variable per versioned family, in first-occurrence order.
    let mut base_variables: Vec<Rc<Variable>> = Vec::new();
    for variable in cfg.interface().variables() {
        let base = base_name(variable.name());
        if base_variables.iter().all(|v| v.name() != base) {
            base_variables.push(Rc::new(variable.renamed(base)));
        }
    }
    let lookup = |name: &str| -> Result<Rc<Variable>, IrError> {
        base_variables
            .iter()
            .find(|v| v.name() == base_name(name))
            .cloned()
            .ok_or_else(|| IrError::invalid(format!("no base variable for {} exists", name)))
    };

    let mut vertices = BTreeMap::new();
    for vertex in cfg.vertices() {
        let reverted_instruction = match vertex.instruction() {
            None => None,
            Some(instruction) => revert_instruction(instruction, &lookup)?,
        };
        let fresh = match reverted_instruction {
            Some(instruction) => {
                Vertex::with_instruction(vertex.label(), vertex.kind(), instruction)
            }
            None => Vertex::new(vertex.label(), vertex.kind()),
        };
        vertices.insert(vertex.label(), fresh);
    }

    Ok(Rc::new(Cfg::new(
        cfg.kind(),
        cfg.name(),
        Interface::new(base_variables),
        callees,
        vertices,
        cfg.edges().cloned().collect(),
        cfg.entry_label(),
        cfg.exit_label(),
    )))
}

fn revert_instruction(
    instruction: &Instruction,
    lookup: &dyn Fn(&str) -> Result<Rc<Variable>, IrError>,
) -> Result<Option<Instruction>, IrError> {
    match instruction {
        Instruction::Assignment(assignment) => {
            // Phi assignments carry no behavior once names collapse.
            if matches!(assignment.rhs, Expression::Phi(_)) {
                return Ok(None);
            }
            let target = match &assignment.target {
                VariableReference::Variable(access) => {
                    VariableReference::Variable(VariableAccess::new(lookup(access.name())?))
                }
                VariableReference::Field(field) => VariableReference::Field(field.clone()),
            };
            Ok(Some(Instruction::Assignment(Assignment {
                target,
                rhs: revert_expression(&assignment.rhs, lookup)?,
                kind: assignment.kind,
            })))
        }
        Instruction::Havoc { target } => {
            let target = match target {
                VariableReference::Variable(access) => {
                    VariableReference::Variable(VariableAccess::new(lookup(access.name())?))
                }
                VariableReference::Field(field) => VariableReference::Field(field.clone()),
            };
            Ok(Some(Instruction::Havoc { target }))
        }
        Instruction::If {
            condition,
            then_label,
            else_label,
        } => Ok(Some(Instruction::If {
            condition: revert_expression(condition, lookup)?,
            then_label: *then_label,
            else_label: *else_label,
        })),
        Instruction::While {
            condition,
            body_label,
            exit_label,
        } => Ok(Some(Instruction::While {
            condition: revert_expression(condition, lookup)?,
            body_label: *body_label,
            exit_label: *exit_label,
        })),
        Instruction::Sequence(members) => {
            let mut reverted = Vec::new();
            for member in members {
                if let Some(instruction) = revert_instruction(member, lookup)? {
                    reverted.push(instruction);
                }
            }
            if reverted.is_empty() {
                Ok(None)
            } else if reverted.len() == 1 {
                Ok(Some(reverted.remove(0)))
            } else {
                Ok(Some(Instruction::Sequence(reverted)))
            }
        }
        Instruction::Call(_) | Instruction::Goto { .. } => Ok(Some(instruction.clone())),
    }
}

fn revert_expression(
    expression: &Expression,
    lookup: &dyn Fn(&str) -> Result<Rc<Variable>, IrError>,
) -> Result<Expression, IrError> {
    match expression {
        Expression::Binary { op, left, right } => Ok(Expression::binary(
            *op,
            revert_expression(left, lookup)?,
            revert_expression(right, lookup)?,
        )),
        Expression::Unary { op, operand } => {
            Ok(Expression::unary(*op, revert_expression(operand, lookup)?))
        }
        Expression::BooleanToIntegerCast(inner) => Ok(Expression::BooleanToIntegerCast(Box::new(
            revert_expression(inner, lookup)?,
        ))),
        Expression::IntegerToBooleanCast(inner) => Ok(Expression::IntegerToBooleanCast(Box::new(
            revert_expression(inner, lookup)?,
        ))),
        Expression::Change { old, new } => Ok(Expression::change(
            revert_expression(old, lookup)?,
            revert_expression(new, lookup)?,
        )),
        Expression::VariableAccess(access) => Ok(Expression::VariableAccess(VariableAccess::new(
            lookup(access.name())?,
        ))),
        Expression::Phi(phi) => Err(IrError::invalid(format!(
            "phi for {} outside an assignment",
            phi.target().name()
        ))),
        _ => Ok(expression.clone()),
    }
}

impl<'a, 'p> SsaBuild<'a, 'p> {
    fn new(pass: &'p mut SsaPass, cfg: &'a Cfg) -> Self {
        SsaBuild {
            pass,
            cfg,
            value_to_variable: BTreeMap::new(),
            current_definitions: BTreeMap::new(),
            filled: BTreeSet::new(),
            sealed: BTreeSet::new(),
            phi_candidates: BTreeMap::new(),
            label_to_instructions: BTreeMap::new(),
        }
    }

    fn fresh_value(&mut self) -> u32 {
        let value = self.pass.next_value;
        self.pass.next_value += 1;
        value
    }

    /// Storage class of a versioned definition: callee inputs and outputs
    /// were made explicit by the call transformation, so their original
    /// declarations demote to locals outside the program CFG.
    fn mapped_storage(&self, name: &str, storage: StorageType) -> StorageType {
        if self.cfg.kind() != CfgKind::Program
            && !keeps_plain_name(name)
            && matches!(storage, StorageType::Input | StorageType::Output)
        {
            StorageType::Local
        } else {
            storage
        }
    }

    fn run(&mut self) -> Result<(), IrError> {
        // Initial versions for every non-temporary interface variable.
        for variable in self.cfg.interface().variables() {
            if variable.storage() == StorageType::Temporary {
                continue;
            }
            let name = variable.name().to_string();
            let value = self.fresh_value();
            let storage = self.mapped_storage(&name, variable.storage());
            let fresh_name = if keeps_plain_name(&name) {
                name.clone()
            } else {
                format!("{}_{}", name, value)
            };
            let fresh = Rc::new(variable.renamed(fresh_name).with_storage(storage));
            self.value_to_variable.insert(value, fresh);
            self.write_variable(&name, self.cfg.entry_label(), value);
        }

        // The entry is sealed by construction; empty entry/exit vertices
        // are filled by construction.
        self.sealed.insert(self.cfg.entry_label());
        if self.cfg.entry().instruction().is_none() {
            self.filled.insert(self.cfg.entry_label());
        }
        if self.cfg.exit().instruction().is_none() {
            self.filled.insert(self.cfg.exit_label());
        }
        // Call-to-return targets have the callee exit among their
        // predecessors, which never fills within this CFG; processing
        // order still guarantees the intraprocedural predecessor fills
        // first.
        for edge in self.cfg.edges() {
            if *edge.kind() == EdgeKind::IntraproceduralCallToReturn {
                self.sealed.insert(edge.target());
            }
        }

        let vertex_count = self.cfg.vertices().count();
        let mut budget = vertex_count * vertex_count * 4 + 64;
        let mut queue = VecDeque::from([self.cfg.entry_label()]);
        while let Some(label) = queue.pop_front() {
            if budget == 0 {
                return Err(IrError::NotImplemented(
                    "cyclic control flow during SSA construction".to_string(),
                ));
            }
            budget -= 1;
            if label == self.cfg.entry_label() {
                if !self.filled.contains(&label) {
                    let instruction = self.cfg.entry().instruction().cloned();
                    if let Some(instruction) = instruction {
                        self.process(label, &instruction)?;
                    }
                    self.filled.insert(label);
                }
                queue.push_back(self.cfg.single_successor(label)?);
                continue;
            }
            if !self.sealed.contains(&label) && self.is_sealable(label) {
                self.sealed.insert(label);
            }
            if !self.sealed.contains(&label) {
                queue.push_back(label);
                continue;
            }
            if self.filled.contains(&label) {
                continue;
            }
            let instruction = self.cfg.vertex(label)?.instruction().cloned();
            if let Some(instruction) = instruction {
                self.process(label, &instruction)?;
            }
            self.filled.insert(label);
            for edge in self.cfg.outgoing_edges(label) {
                match edge.kind() {
                    EdgeKind::InterproceduralCall | EdgeKind::InterproceduralReturn { .. } => {}
                    _ => queue.push_back(edge.target()),
                }
            }
        }

        // Force a read of every variable local to this CFG at the exit to
        // trigger phi generation for merges reaching it.
        for variable in self.cfg.interface().variables() {
            if variable.storage() == StorageType::Temporary
                || variable.data_type().is_derived()
                || keeps_plain_name(variable.name())
            {
                continue;
            }
            let name = variable.name().to_string();
            self.read_variable(&name, self.cfg.exit_label())?;
        }
        Ok(())
    }

    fn is_sealable(&self, label: Label) -> bool {
        self.cfg
            .preceding_labels(label)
            .iter()
            .all(|pred| self.filled.contains(pred))
    }

    /// Intraprocedural predecessors: return edges come from another CFG
    /// and do not participate in merges.
    fn merge_predecessors(&self, label: Label) -> Vec<Label> {
        self.cfg
            .incoming_edges(label)
            .into_iter()
            .filter(|e| !matches!(e.kind(), EdgeKind::InterproceduralReturn { .. }))
            .map(|e| e.source())
            .collect()
    }

    fn write_variable(&mut self, name: &str, label: Label, value: u32) {
        self.current_definitions
            .entry(name.to_string())
            .or_default()
            .insert(label, value);
    }

    fn read_variable(&mut self, name: &str, label: Label) -> Result<u32, IrError> {
        match self.current_definitions.get(name) {
            Some(definitions) => {
                if let Some(&value) = definitions.get(&label) {
                    return Ok(value);
                }
            }
            None => {
                return Err(IrError::invalid(format!(
                    "no definition for variable {} exists",
                    name
                )));
            }
        }
        self.read_variable_recursive(name, label)
    }

    fn read_variable_recursive(&mut self, name: &str, label: Label) -> Result<u32, IrError> {
        if !self.sealed.contains(&label) {
            return Err(IrError::NotImplemented(
                "reading through an unsealed block".to_string(),
            ));
        }
        let predecessors = self.merge_predecessors(label);
        let value = if predecessors.len() == 1 {
            self.read_variable(name, predecessors[0])?
        } else {
            let value = self.place_operandless_phi(name, label)?;
            self.write_variable(name, label, value);
            self.add_phi_operands(name, value)?
        };
        self.write_variable(name, label, value);
        Ok(value)
    }

    fn place_operandless_phi(&mut self, name: &str, label: Label) -> Result<u32, IrError> {
        let declared = self
            .cfg
            .interface()
            .variable(name)
            .cloned()
            .ok_or_else(|| {
                IrError::invalid(format!("variable {} does not exist in this cfg", name))
            })?;
        let value = self.fresh_value();
        let storage = self.mapped_storage(name, declared.storage());
        let fresh = Rc::new(
            declared
                .renamed(format!("{}_{}", name, value))
                .with_storage(storage),
        );
        self.value_to_variable.insert(value, fresh);
        self.phi_candidates.insert(
            value,
            PhiCandidate {
                name: name.to_string(),
                label,
                operands: Vec::new(),
                users: Vec::new(),
            },
        );
        Ok(value)
    }

    fn add_phi_operands(&mut self, name: &str, phi_value: u32) -> Result<u32, IrError> {
        let label = self
            .phi_candidates
            .get(&phi_value)
            .ok_or_else(|| IrError::invalid("expected phi candidate does not exist".to_string()))?
            .label;
        for predecessor in self.merge_predecessors(label) {
            let operand = self.read_variable(name, predecessor)?;
            if let Some(candidate) = self.phi_candidates.get_mut(&phi_value) {
                candidate.operands.push((predecessor, operand));
            }
            if operand != phi_value {
                if let Some(operand_candidate) = self.phi_candidates.get_mut(&operand) {
                    operand_candidate.users.push(phi_value);
                }
            }
        }
        self.try_remove_trivial_phi(phi_value)
    }

    fn try_remove_trivial_phi(&mut self, phi_value: u32) -> Result<u32, IrError> {
        let candidate = match self.phi_candidates.get(&phi_value) {
            Some(candidate) => candidate.clone(),
            None => return Ok(phi_value),
        };
        let mut same: Option<u32> = None;
        for (_, operand) in &candidate.operands {
            if Some(*operand) == same || *operand == phi_value {
                continue;
            }
            if same.is_some() {
                // Two distinct operands: the phi merges real information.
                return Ok(phi_value);
            }
            same = Some(*operand);
        }
        let same = same.ok_or_else(|| {
            IrError::NotImplemented("phi candidate without reachable operands".to_string())
        })?;

        let users: Vec<u32> = candidate
            .users
            .iter()
            .copied()
            .filter(|user| *user != phi_value)
            .collect();
        self.phi_candidates.remove(&phi_value);
        self.value_to_variable.remove(&phi_value);
        // Reroute every use of the phi to its unique operand.
        for user in &users {
            match self.phi_candidates.get_mut(user) {
                Some(user_candidate) => {
                    for (_, operand) in user_candidate.operands.iter_mut() {
                        if *operand == phi_value {
                            *operand = same;
                        }
                    }
                }
                None => {
                    return Err(IrError::NotImplemented(
                        "non-phi uses of a trivial phi".to_string(),
                    ));
                }
            }
        }
        for definitions in self.current_definitions.values_mut() {
            for value in definitions.values_mut() {
                if *value == phi_value {
                    *value = same;
                }
            }
        }
        for user in users {
            if self.phi_candidates.contains_key(&user) {
                self.try_remove_trivial_phi(user)?;
            }
        }
        Ok(same)
    }

    fn variable_of(&self, value: u32) -> Result<Rc<Variable>, IrError> {
        self.value_to_variable
            .get(&value)
            .cloned()
            .ok_or_else(|| IrError::invalid(format!("ssa value {} has no variable", value)))
    }

    // ------------------------------------------------------------------
    // Instruction rewriting
    // ------------------------------------------------------------------

    fn process(&mut self, label: Label, instruction: &Instruction) -> Result<(), IrError> {
        match instruction {
            Instruction::Assignment(assignment) => self.process_assignment(label, assignment),
            Instruction::Havoc { target } => self.process_havoc(label, target),
            Instruction::Call(call) => {
                // Calls carry no data flow of their own: parameter moves
                // were made explicit by the call transformation.
                self.emit(label, Instruction::Call(call.clone()));
                Ok(())
            }
            Instruction::If {
                condition,
                then_label,
                else_label,
            } => {
                let condition = self.encode(label, condition)?;
                self.emit(
                    label,
                    Instruction::If {
                        condition,
                        then_label: *then_label,
                        else_label: *else_label,
                    },
                );
                Ok(())
            }
            Instruction::Sequence(members) => {
                for member in members {
                    self.process(label, member)?;
                }
                Ok(())
            }
            Instruction::While { .. } => Err(IrError::NotImplemented(
                "while loops during SSA construction".to_string(),
            )),
            Instruction::Goto { .. } => Err(IrError::NotImplemented(
                "goto instructions in compiled CFGs".to_string(),
            )),
        }
    }

    fn process_assignment(&mut self, label: Label, assignment: &Assignment) -> Result<(), IrError> {
        match assignment.kind {
            AssignmentKind::Regular => {
                let rhs = self.encode(label, &assignment.rhs)?;
                let name = assignment.target.name();
                let value = self.fresh_value();
                match &assignment.target {
                    VariableReference::Variable(access) => {
                        let declared = access.variable();
                        let storage = self.mapped_storage(&name, declared.storage());
                        let fresh_name = if keeps_plain_name(&name) {
                            name.clone()
                        } else {
                            format!("{}_{}", name, value)
                        };
                        let fresh = Rc::new(declared.renamed(fresh_name).with_storage(storage));
                        self.value_to_variable.insert(value, fresh.clone());
                        self.emit(
                            label,
                            Instruction::Assignment(Assignment::regular(
                                VariableAccess::new(fresh),
                                rhs,
                            )),
                        );
                    }
                    VariableReference::Field(_) => {
                        return Err(IrError::NotImplemented(
                            "field-access targets of regular assignments during SSA construction"
                                .to_string(),
                        ));
                    }
                }
                self.write_variable(&name, label, value);
                Ok(())
            }
            AssignmentKind::ParameterIn => {
                // The callee-side `_input` cell is interprocedural and
                // keeps its plain name; only the source is versioned.
                let rhs = self.encode(label, &assignment.rhs)?;
                self.emit(
                    label,
                    Instruction::Assignment(Assignment {
                        target: assignment.target.clone(),
                        rhs,
                        kind: AssignmentKind::ParameterIn,
                    }),
                );
                Ok(())
            }
            AssignmentKind::ParameterOut => {
                let rhs = match &assignment.rhs {
                    Expression::FieldAccess(field) => Expression::FieldAccess(field.clone()),
                    _ => {
                        return Err(IrError::NotImplemented(
                            "parameter-out assignments with a non-field source".to_string(),
                        ));
                    }
                };
                let name = assignment.target.name();
                let value = self.fresh_value();
                let target = match &assignment.target {
                    VariableReference::Variable(access) => {
                        let declared = access.variable();
                        let storage = self.mapped_storage(&name, declared.storage());
                        let fresh = Rc::new(
                            declared
                                .renamed(format!("{}_{}", name, value))
                                .with_storage(storage),
                        );
                        self.value_to_variable.insert(value, fresh.clone());
                        VariableReference::Variable(VariableAccess::new(fresh))
                    }
                    VariableReference::Field(field) => {
                        let declared = field.field().variable();
                        let fresh = Rc::new(
                            declared.renamed(format!("{}_{}", declared.name(), value)),
                        );
                        self.value_to_variable.insert(value, fresh.clone());
                        VariableReference::Field(FieldAccess::new(
                            field.record().clone(),
                            VariableReference::Variable(VariableAccess::new(fresh)),
                        ))
                    }
                };
                self.emit(
                    label,
                    Instruction::Assignment(Assignment {
                        target,
                        rhs,
                        kind: AssignmentKind::ParameterOut,
                    }),
                );
                self.write_variable(&name, label, value);
                Ok(())
            }
        }
    }

    fn process_havoc(&mut self, label: Label, target: &VariableReference) -> Result<(), IrError> {
        let name = target.name();
        let value = self.fresh_value();
        match target {
            VariableReference::Variable(access) => {
                let declared = access.variable();
                let storage = self.mapped_storage(&name, declared.storage());
                let fresh_name = if keeps_plain_name(&name) {
                    name.clone()
                } else {
                    format!("{}_{}", name, value)
                };
                let fresh = Rc::new(declared.renamed(fresh_name).with_storage(storage));
                self.value_to_variable.insert(value, fresh.clone());
                self.emit(label, Instruction::havoc(VariableAccess::new(fresh)));
            }
            VariableReference::Field(_) => {
                return Err(IrError::NotImplemented(
                    "field-access targets of havoc during SSA construction".to_string(),
                ));
            }
        }
        self.write_variable(&name, label, value);
        Ok(())
    }

    fn encode(&mut self, label: Label, expression: &Expression) -> Result<Expression, IrError> {
        match expression {
            Expression::Binary { op, left, right } => Ok(Expression::binary(
                *op,
                self.encode(label, left)?,
                self.encode(label, right)?,
            )),
            Expression::Unary { op, operand } => {
                Ok(Expression::unary(*op, self.encode(label, operand)?))
            }
            Expression::BooleanToIntegerCast(inner) => Ok(Expression::BooleanToIntegerCast(
                Box::new(self.encode(label, inner)?),
            )),
            Expression::IntegerToBooleanCast(inner) => Ok(Expression::IntegerToBooleanCast(
                Box::new(self.encode(label, inner)?),
            )),
            Expression::Change { old, new } => Ok(Expression::change(
                self.encode(label, old)?,
                self.encode(label, new)?,
            )),
            Expression::VariableAccess(access) => {
                let value = self.read_variable(access.name(), label)?;
                Ok(Expression::VariableAccess(VariableAccess::new(
                    self.variable_of(value)?,
                )))
            }
            // Interprocedural field accesses keep their plain names.
            Expression::FieldAccess(field) => Ok(Expression::FieldAccess(field.clone())),
            Expression::Phi(_) => Err(IrError::invalid(
                "phi expressions cannot occur before SSA construction".to_string(),
            )),
            _ => Ok(expression.clone()),
        }
    }

    fn emit(&mut self, label: Label, instruction: Instruction) {
        self.label_to_instructions
            .entry(label)
            .or_default()
            .push(instruction);
    }

    // ------------------------------------------------------------------
    // Output construction
    // ------------------------------------------------------------------

    fn finish(mut self, callees: BTreeMap<String, Rc<Cfg>>) -> Result<Rc<Cfg>, IrError> {
        // Materialize the surviving phi candidates as assignments prefixed
        // to their merge vertices.
        let candidates: Vec<(u32, PhiCandidate)> = self
            .phi_candidates
            .iter()
            .map(|(value, candidate)| (*value, candidate.clone()))
            .collect();
        for (value, candidate) in candidates {
            let target = VariableAccess::new(self.variable_of(value)?);
            let mut operands = BTreeMap::new();
            for (predecessor, operand_value) in &candidate.operands {
                operands.insert(
                    *predecessor,
                    VariableAccess::new(self.variable_of(*operand_value)?),
                );
            }
            let phi = Expression::Phi(Phi::new(target.clone(), operands));
            let assignment = Instruction::Assignment(Assignment::regular(target, phi));
            let list = self
                .label_to_instructions
                .entry(candidate.label)
                .or_default();
            list.insert(0, assignment);
        }

        // Rebuild vertices; entry and exit vertices may carry rewritten
        // move sequences.
        let mut vertices = BTreeMap::new();
        for vertex in self.cfg.vertices() {
            let label = vertex.label();
            match self.label_to_instructions.get(&label) {
                Some(instructions) if instructions.len() == 1 => {
                    vertices.insert(
                        label,
                        Vertex::with_instruction(label, vertex.kind(), instructions[0].clone()),
                    );
                }
                Some(instructions) => {
                    vertices.insert(
                        label,
                        Vertex::with_instruction(
                            label,
                            vertex.kind(),
                            Instruction::Sequence(instructions.clone()),
                        ),
                    );
                }
                None => {
                    vertices.insert(label, Vertex::new(label, vertex.kind()));
                }
            }
        }

        // The output interface holds every surviving versioned definition,
        // deduplicated by name (plain-named interprocedural variables are
        // defined once per occurrence).
        let mut seen = BTreeSet::new();
        let mut variables = Vec::new();
        for variable in self.value_to_variable.values() {
            if seen.insert(variable.name().to_string()) {
                variables.push(variable.clone());
            }
        }

        let edges = self.cfg.edges().cloned().collect();
        Ok(Rc::new(Cfg::new(
            self.cfg.kind(),
            self.cfg.name(),
            Interface::new(variables),
            callees,
            vertices,
            edges,
            self.cfg.entry_label(),
            self.cfg.exit_label(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic_blocks::BasicBlockPass;
    use crate::tac::TacPass;
    use cyclist_ir::builder::Builder;
    use cyclist_ir::module::{Module, ModuleKind, Project};
    use cyclist_ir::types::DataType;

    fn build_pipeline(project: &Project) -> Rc<Cfg> {
        let cfg = Builder::new(project).build().unwrap();
        let tac = TacPass::new().apply(&cfg).unwrap();
        let blocks = BasicBlockPass::new().apply(&tac).unwrap();
        SsaPass::new().apply(&blocks).unwrap()
    }

    // IF c THEN x := 1 ELSE x := 2 END_IF; y := x
    fn make_merge_project(then_value: i64, else_value: i64) -> Project {
        let c = Variable::shared("c", DataType::BOOL, StorageType::Input);
        let x = Variable::shared("x", DataType::INT, StorageType::Local);
        let y = Variable::shared("y", DataType::INT, StorageType::Output);
        let interface = Interface::new(vec![c.clone(), x.clone(), y.clone()]);
        let mut instructions = BTreeMap::new();
        instructions.insert(
            1,
            Instruction::If {
                condition: Expression::variable(c),
                then_label: 2,
                else_label: 4,
            },
        );
        instructions.insert(
            2,
            Instruction::assignment(
                VariableAccess::new(x.clone()),
                Expression::IntegerConstant(then_value),
            ),
        );
        instructions.insert(3, Instruction::Goto { label: 6 });
        instructions.insert(
            4,
            Instruction::assignment(
                VariableAccess::new(x.clone()),
                Expression::IntegerConstant(else_value),
            ),
        );
        instructions.insert(5, Instruction::Goto { label: 6 });
        instructions.insert(
            6,
            Instruction::assignment(VariableAccess::new(y), Expression::variable(x)),
        );
        instructions.insert(7, Instruction::Goto { label: 8 });
        let module = Module::new(ModuleKind::Program, "P", interface, instructions, 0, 8);
        Project::new(vec![module], "P").unwrap()
    }

    fn phis_in(cfg: &Cfg) -> Vec<String> {
        let mut phis = Vec::new();
        for vertex in cfg.vertices() {
            if let Some(instruction) = vertex.instruction() {
                for member in instruction.members() {
                    if let Instruction::Assignment(assignment) = member {
                        if matches!(assignment.rhs, Expression::Phi(_)) {
                            phis.push(member.to_string());
                        }
                    }
                }
            }
        }
        phis
    }

    #[test]
    fn test_merge_gets_phi() {
        let project = make_merge_project(1, 2);
        let ssa = build_pipeline(&project);
        let phis = phis_in(&ssa);
        assert_eq!(phis.len(), 1, "expected one phi, got {:?}", phis);
        // The phi target merges x's two arm definitions and feeds y.
        let join = ssa.vertex(6).unwrap().instruction().unwrap();
        let members = join.members();
        assert!(matches!(
            &members[0],
            Instruction::Assignment(a) if matches!(a.rhs, Expression::Phi(_))
        ));
        match &members[1] {
            Instruction::Assignment(assignment) => {
                // y's rhs is the phi target, not either arm's version.
                let phi_target = match &members[0] {
                    Instruction::Assignment(a) => a.target.name(),
                    _ => unreachable!(),
                };
                assert_eq!(assignment.rhs.to_string(), phi_target);
            }
            other => panic!("unexpected instruction {}", other),
        }
    }

    #[test]
    fn test_trivial_phi_is_elided() {
        // x is written before the branch and left alone in both arms, so
        // the candidate phi for x at the join has identical operands and
        // must vanish; y's definition uses the single version of x.
        let c = Variable::shared("c", DataType::BOOL, StorageType::Input);
        let x = Variable::shared("x", DataType::INT, StorageType::Local);
        let y = Variable::shared("y", DataType::INT, StorageType::Output);
        let z = Variable::shared("z", DataType::INT, StorageType::Local);
        let interface = Interface::new(vec![c.clone(), x.clone(), y.clone(), z.clone()]);
        let mut instructions = BTreeMap::new();
        instructions.insert(
            1,
            Instruction::assignment(VariableAccess::new(x.clone()), Expression::IntegerConstant(1)),
        );
        instructions.insert(2, Instruction::Goto { label: 3 });
        instructions.insert(
            3,
            Instruction::If {
                condition: Expression::variable(c),
                then_label: 4,
                else_label: 6,
            },
        );
        // Both arms write z (not x); x flows unchanged through the merge.
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
        instructions.insert(
            8,
            Instruction::assignment(VariableAccess::new(y), Expression::variable(x)),
        );
        instructions.insert(9, Instruction::Goto { label: 10 });
        let module = Module::new(ModuleKind::Program, "P", interface, instructions, 0, 10);
        let project = Project::new(vec![module], "P").unwrap();
        let ssa = build_pipeline(&project);
        // z needs a phi at the join, x does not: y reads x's single
        // version directly.
        let join = ssa.vertex(8).unwrap().instruction().unwrap();
        let members = join.members();
        let phi_count = members
            .iter()
            .filter(|m| {
                matches!(m, Instruction::Assignment(a) if matches!(a.rhs, Expression::Phi(_)))
            })
            .count();
        assert_eq!(phi_count, 1, "only z merges: {:?}", members);
        let y_assignment = members
            .iter()
            .find_map(|m| match m {
                Instruction::Assignment(a) if a.target.name().starts_with("y_") => Some(a),
                _ => None,
            })
            .expect("y is assigned at the join");
        assert!(
            y_assignment.rhs.to_string().starts_with("x_"),
            "y reads a direct x version, got {}",
            y_assignment.rhs
        );
    }

    #[test]
    fn test_every_definition_site_is_unique() {
        let project = make_merge_project(1, 2);
        let ssa = build_pipeline(&project);
        let mut defined = BTreeSet::new();
        for vertex in ssa.vertices() {
            if let Some(instruction) = vertex.instruction() {
                for member in instruction.members() {
                    if let Instruction::Assignment(assignment) = member {
                        assert!(
                            defined.insert(assignment.target.name()),
                            "duplicate definition of {}",
                            assignment.target.name()
                        );
                    }
                }
            }
        }
    }
}
