//! Concolic execution state.
//!
//! A state holds the current location plus parallel concrete and symbolic
//! stores keyed by *contextualized* names `<flattened>_<version>__<cycle>`,
//! the ordered path constraint, and the state-local version map. Forking
//! clones the whole state; parent and child never alias.

use crate::error::EngineError;
use crate::solver::{as_value, is_literal, Solver, Term};
use cyclist_ir::expression::Label;
use std::collections::BTreeMap;
use std::fmt;
use z3::ast::{Bool, Dynamic};
use z3::Model;

/// Builds a contextualized name.
pub fn contextualized_name(flattened: &str, version: u32, cycle: u32) -> String {
    format!("{}_{}__{}", flattened, version, cycle)
}

/// Splits a contextualized name into flattened name, version, and cycle.
/// Flattened names may themselves contain underscores, so parsing is
/// anchored at the right.
pub fn parse_contextualized(name: &str) -> Option<(&str, u32, u32)> {
    let (head, cycle) = name.rsplit_once("__")?;
    let (flattened, version) = head.rsplit_once('_')?;
    Some((flattened, version.parse().ok()?, cycle.parse().ok()?))
}

/// The mutable execution state of one context.
#[derive(Debug, Clone)]
pub struct State<'ctx> {
    label: Label,
    entered_from: Option<Label>,
    concrete_valuations: BTreeMap<String, Term<'ctx>>,
    symbolic_valuations: BTreeMap<String, Term<'ctx>>,
    path_constraint: Vec<Bool<'ctx>>,
    versions: BTreeMap<String, u32>,
}

impl<'ctx> State<'ctx> {
    pub fn new(label: Label) -> Self {
        State {
            label,
            entered_from: None,
            concrete_valuations: BTreeMap::new(),
            symbolic_valuations: BTreeMap::new(),
            path_constraint: Vec::new(),
            versions: BTreeMap::new(),
        }
    }

    pub fn label(&self) -> Label {
        self.label
    }

    /// The label control most recently left; phi operands select on it.
    pub fn entered_from(&self) -> Option<Label> {
        self.entered_from
    }

    /// Advances the location, remembering where control came from.
    pub fn move_to(&mut self, label: Label) {
        self.entered_from = Some(self.label);
        self.label = label;
    }

    // ------------------------------------------------------------------
    // Stores
    // ------------------------------------------------------------------

    pub fn concrete_valuations(&self) -> &BTreeMap<String, Term<'ctx>> {
        &self.concrete_valuations
    }

    pub fn symbolic_valuations(&self) -> &BTreeMap<String, Term<'ctx>> {
        &self.symbolic_valuations
    }

    pub fn concrete_valuation(&self, name: &str) -> Result<&Term<'ctx>, EngineError> {
        self.concrete_valuations
            .get(name)
            .ok_or_else(|| EngineError::UndefinedValue(name.to_string()))
    }

    pub fn symbolic_valuation(&self, name: &str) -> Result<&Term<'ctx>, EngineError> {
        self.symbolic_valuations
            .get(name)
            .ok_or_else(|| EngineError::UndefinedValue(name.to_string()))
    }

    /// Binds a fresh concrete cell. Contextualized names are written once
    /// per version bump; rebinding indicates a versioning bug.
    pub fn set_concrete_valuation(&mut self, name: impl Into<String>, valuation: Term<'ctx>) {
        let name = name.into();
        debug_assert!(
            !self.concrete_valuations.contains_key(&name),
            "concrete cell {} bound twice",
            name
        );
        self.concrete_valuations.insert(name, valuation);
    }

    pub fn set_symbolic_valuation(&mut self, name: impl Into<String>, valuation: Term<'ctx>) {
        let name = name.into();
        debug_assert!(
            !self.symbolic_valuations.contains_key(&name),
            "symbolic cell {} bound twice",
            name
        );
        self.symbolic_valuations.insert(name, valuation);
    }

    /// Overwrites an existing concrete cell, e.g. with a model valuation.
    pub fn update_concrete_valuation(&mut self, name: &str, valuation: Term<'ctx>) {
        self.concrete_valuations.insert(name.to_string(), valuation);
    }

    // ------------------------------------------------------------------
    // Path constraint
    // ------------------------------------------------------------------

    pub fn path_constraint(&self) -> &[Bool<'ctx>] {
        &self.path_constraint
    }

    pub fn push_path_constraint(&mut self, expression: Bool<'ctx>) {
        self.path_constraint.push(expression);
    }

    /// Clears the path constraint at cycle closure; safe only after the
    /// carried-forward bindings of the next cycle exist, because all
    /// dependence on prior cycles is inlined in those symbolic terms.
    pub fn clear_path_constraint(&mut self) {
        self.path_constraint.clear();
    }

    // ------------------------------------------------------------------
    // Versions
    // ------------------------------------------------------------------

    pub fn version(&self, flattened_name: &str) -> Option<u32> {
        self.versions.get(flattened_name).copied()
    }

    pub fn set_version(&mut self, flattened_name: impl Into<String>, version: u32) {
        self.versions.insert(flattened_name.into(), version);
    }

    pub fn versions(&self) -> &BTreeMap<String, u32> {
        &self.versions
    }

    /// The highest version of a flattened name within a cycle. Reads the
    /// local version map; debug builds cross-check against a store scan
    /// and report disagreement as invalid IR.
    pub fn highest_version(&self, flattened_name: &str, cycle: u32) -> Result<u32, EngineError> {
        let tracked = self.versions.get(flattened_name).copied().ok_or_else(|| {
            EngineError::UndefinedValue(flattened_name.to_string())
        })?;
        if cfg!(debug_assertions) {
            let scanned = self.scanned_highest_version(flattened_name, cycle);
            if scanned != tracked {
                return Err(EngineError::Ir(cyclist_ir::error::IrError::invalid(format!(
                    "version counters disagree for {}: tracked {}, store holds {}",
                    flattened_name, tracked, scanned
                ))));
            }
        }
        Ok(tracked)
    }

    /// Highest version of a flattened name in the concrete store within
    /// one cycle, by scanning contextualized names.
    pub fn scanned_highest_version(&self, flattened_name: &str, cycle: u32) -> u32 {
        self.scan_versions(flattened_name, cycle).max().unwrap_or(0)
    }

    /// Lowest version of a flattened name within one cycle.
    pub fn scanned_lowest_version(&self, flattened_name: &str, cycle: u32) -> u32 {
        self.scan_versions(flattened_name, cycle).min().unwrap_or(0)
    }

    fn scan_versions<'a>(
        &'a self,
        flattened_name: &'a str,
        cycle: u32,
    ) -> impl Iterator<Item = u32> + 'a {
        self.concrete_valuations.keys().filter_map(move |name| {
            let (flattened, version, name_cycle) = parse_contextualized(name)?;
            (flattened == flattened_name && name_cycle == cycle).then_some(version)
        })
    }

    // ------------------------------------------------------------------
    // Forking
    // ------------------------------------------------------------------

    /// A fresh state for the alternative branch outcome: located at the
    /// untaken successor, concrete store updated from the model (cells
    /// the model leaves open keep their prior values), path constraint
    /// extended with the branch expression.
    pub fn fork(
        &self,
        solver: &'ctx Solver,
        label: Label,
        model: &Model<'ctx>,
        expression: &Bool<'ctx>,
    ) -> Result<State<'ctx>, EngineError> {
        let mut forked = self.forked_at(solver, label, model)?;
        forked.path_constraint.push(expression.clone());
        Ok(forked)
    }

    /// The model-updated clone underlying [`State::fork`]; divergent
    /// forks extend the per-version constraints instead of the plain one.
    pub(crate) fn forked_at(
        &self,
        solver: &'ctx Solver,
        label: Label,
        model: &Model<'ctx>,
    ) -> Result<State<'ctx>, EngineError> {
        let mut concrete_valuations = self.concrete_valuations.clone();
        for (name, valuation) in &mut concrete_valuations {
            let interpretation = eval_constant_like(solver, model, name, valuation)?;
            if let Some(interpretation) = interpretation {
                *valuation = interpretation;
            }
        }
        Ok(State {
            label,
            entered_from: Some(self.label),
            concrete_valuations,
            symbolic_valuations: self.symbolic_valuations.clone(),
            path_constraint: self.path_constraint.clone(),
            versions: self.versions.clone(),
        })
    }
}

/// Evaluates the uninterpreted constant named `name` (with the sort of
/// the prior valuation) in the model, without completion: a cell the
/// model does not constrain evaluates to itself and yields `None`.
pub(crate) fn eval_constant_like<'ctx>(
    solver: &'ctx Solver,
    model: &Model<'ctx>,
    name: &str,
    prior: &Term<'ctx>,
) -> Result<Option<Term<'ctx>>, EngineError> {
    let interpretation = if prior.as_bool().is_some() {
        model
            .eval(&solver.make_boolean_constant(name), false)
            .map(|b| Dynamic::from_ast(&b))
    } else if prior.as_int().is_some() {
        model
            .eval(&solver.make_integer_constant(name), false)
            .map(|i| Dynamic::from_ast(&i))
    } else {
        return Err(EngineError::Ir(cyclist_ir::error::IrError::invalid(
            format!("cell {} holds a term of unexpected sort", name),
        )));
    };
    Ok(interpretation.filter(is_literal))
}

impl fmt::Display for State<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "(vertex: L{},", self.label)?;
        write!(f, " concrete: {{")?;
        for (index, (name, term)) in self.concrete_valuations.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            match as_value(term) {
                Some(value) => write!(f, "{} -> {}", name, value)?,
                None => write!(f, "{} -> {}", name, term)?,
            }
        }
        writeln!(f, "}},")?;
        write!(f, " path constraint: [")?;
        for (index, constraint) in self.path_constraint.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", constraint)?;
        }
        write!(f, "])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contextualized_name_round_trip() {
        for (flattened, version, cycle) in
            [("P.x", 0, 0), ("P.f.c_input", 3, 2), ("P.f_c", 12, 40)]
        {
            let name = contextualized_name(flattened, version, cycle);
            assert_eq!(parse_contextualized(&name), Some((flattened, version, cycle)));
        }
    }

    #[test]
    fn test_scanned_versions() {
        let solver = Solver::with_seed(1);
        let mut state = State::new(0);
        state.set_concrete_valuation("P.x_0__0", solver.make_integer_value(1));
        state.set_concrete_valuation("P.x_2__0", solver.make_integer_value(2));
        state.set_concrete_valuation("P.x_0__1", solver.make_integer_value(3));
        assert_eq!(state.scanned_highest_version("P.x", 0), 2);
        assert_eq!(state.scanned_lowest_version("P.x", 0), 0);
        assert_eq!(state.scanned_highest_version("P.x", 1), 0);
    }

    #[test]
    fn test_move_to_tracks_entry() {
        let mut state = State::new(0);
        assert_eq!(state.entered_from(), None);
        state.move_to(4);
        assert_eq!(state.label(), 4);
        assert_eq!(state.entered_from(), Some(0));
    }
}
