//! Modules and projects: the front-end collaborator data model.
//!
//! A front end hands over a [`Project`] of labelled [`Module`]s. Labels are
//! non-negative, monotonically increasing within a module, and disjoint
//! across modules; the designated main module is a `Program`.

use crate::error::IrError;
use crate::expression::Label;
use crate::instruction::Instruction;
use crate::interface::Interface;
use std::collections::BTreeMap;

/// The kind of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    /// The cyclically scheduled root.
    Program,
    /// A stateful callee instantiated as a variable of derived type.
    FunctionBlock,
    /// A stateless callee; unsupported by the execution engine.
    Function,
}

/// A single module: interface plus labelled instruction list.
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    kind: ModuleKind,
    name: String,
    interface: Interface,
    instructions: BTreeMap<Label, Instruction>,
    entry_label: Label,
    exit_label: Label,
}

impl Module {
    pub fn new(
        kind: ModuleKind,
        name: impl Into<String>,
        interface: Interface,
        instructions: BTreeMap<Label, Instruction>,
        entry_label: Label,
        exit_label: Label,
    ) -> Self {
        Module {
            kind,
            name: name.into(),
            interface,
            instructions,
            entry_label,
            exit_label,
        }
    }

    pub fn kind(&self) -> ModuleKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interface(&self) -> &Interface {
        &self.interface
    }

    pub fn instructions(&self) -> impl Iterator<Item = (&Label, &Instruction)> {
        self.instructions.iter()
    }

    pub fn entry_label(&self) -> Label {
        self.entry_label
    }

    pub fn exit_label(&self) -> Label {
        self.exit_label
    }
}

/// A compiled project: modules by fully-qualified name and a designated
/// main program.
#[derive(Debug, Clone, PartialEq)]
pub struct Project {
    modules: BTreeMap<String, Module>,
    main: String,
}

impl Project {
    pub fn new(modules: Vec<Module>, main: impl Into<String>) -> Result<Self, IrError> {
        let main = main.into();
        let modules: BTreeMap<String, Module> = modules
            .into_iter()
            .map(|m| (m.name().to_string(), m))
            .collect();
        let main_module = modules
            .get(&main)
            .ok_or_else(|| IrError::invalid(format!("no module named {} exists", main)))?;
        if main_module.kind() != ModuleKind::Program {
            return Err(IrError::invalid(format!(
                "main module {} is not a program",
                main
            )));
        }
        Ok(Project { modules, main })
    }

    pub fn modules(&self) -> impl Iterator<Item = &Module> {
        self.modules.values()
    }

    pub fn module(&self, name: &str) -> Result<&Module, IrError> {
        self.modules
            .get(name)
            .ok_or_else(|| IrError::invalid(format!("no module named {} exists", name)))
    }

    pub fn main(&self) -> &Module {
        // Checked at construction.
        &self.modules[&self.main]
    }
}
