//! Module interfaces: ordered collections of variable declarations.

use crate::variable::{StorageType, Variable};
use std::fmt;
use std::rc::Rc;

/// An ordered mapping from names to variables.
///
/// Declaration order is preserved; it determines the order of flattened
/// interfaces, initial valuations, and test-case serialization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Interface {
    variables: Vec<Rc<Variable>>,
}

impl Interface {
    pub fn new(variables: Vec<Rc<Variable>>) -> Self {
        Interface { variables }
    }

    pub fn variables(&self) -> impl Iterator<Item = &Rc<Variable>> {
        self.variables.iter()
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    pub fn variable(&self, name: &str) -> Option<&Rc<Variable>> {
        self.variables.iter().find(|v| v.name() == name)
    }

    pub fn input_variables(&self) -> impl Iterator<Item = &Rc<Variable>> {
        self.of_storage(StorageType::Input)
    }

    pub fn output_variables(&self) -> impl Iterator<Item = &Rc<Variable>> {
        self.of_storage(StorageType::Output)
    }

    pub fn local_variables(&self) -> impl Iterator<Item = &Rc<Variable>> {
        self.of_storage(StorageType::Local)
    }

    pub fn temporary_variables(&self) -> impl Iterator<Item = &Rc<Variable>> {
        self.of_storage(StorageType::Temporary)
    }

    fn of_storage(&self, storage: StorageType) -> impl Iterator<Item = &Rc<Variable>> {
        self.variables.iter().filter(move |v| v.storage() == storage)
    }

    /// Appends a variable; replaces an existing declaration of the same
    /// name in place, preserving declaration order.
    pub fn add_variable(&mut self, variable: Rc<Variable>) {
        if let Some(existing) = self
            .variables
            .iter_mut()
            .find(|v| v.name() == variable.name())
        {
            *existing = variable;
        } else {
            self.variables.push(variable);
        }
    }

    /// Removes a declaration by name; absent names are ignored.
    pub fn remove_variable(&mut self, name: &str) {
        self.variables.retain(|v| v.name() != name);
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for variable in &self.variables {
            writeln!(f, "{};", variable)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataType;

    fn make_interface() -> Interface {
        Interface::new(vec![
            Variable::shared("x", DataType::BOOL, StorageType::Input),
            Variable::shared("y", DataType::INT, StorageType::Output),
            Variable::shared("c", DataType::INT, StorageType::Local),
        ])
    }

    #[test]
    fn test_lookup_and_order() {
        let interface = make_interface();
        assert_eq!(interface.len(), 3);
        assert!(interface.variable("x").is_some());
        assert!(interface.variable("z").is_none());
        let names: Vec<_> = interface.variables().map(|v| v.name().to_string()).collect();
        assert_eq!(names, vec!["x", "y", "c"]);
    }

    #[test]
    fn test_storage_iterators() {
        let interface = make_interface();
        assert_eq!(interface.input_variables().count(), 1);
        assert_eq!(interface.output_variables().count(), 1);
        assert_eq!(interface.local_variables().count(), 1);
        assert_eq!(interface.temporary_variables().count(), 0);
    }

    #[test]
    fn test_add_replaces_same_name() {
        let mut interface = make_interface();
        interface.add_variable(Variable::shared("x", DataType::INT, StorageType::Input));
        assert_eq!(interface.len(), 3);
        assert_eq!(interface.variable("x").unwrap().data_type(), &DataType::INT);
        interface.remove_variable("y");
        assert!(interface.variable("y").is_none());
    }
}
