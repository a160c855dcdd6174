//! Test cases and test suites.
//!
//! A test case is an initial valuation of the non-input state plus the
//! concrete input valuations of every executed cycle, extracted from a
//! context's version-0 store cells. The suite is an ordered,
//! de-duplicated list, serialized as one `test_case_<i>.xml` per case.

use crate::context::Context;
use crate::error::EngineError;
use crate::solver::as_value;
use crate::state::contextualized_name;
use crate::value::Value;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

/// One derived test case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    initial_state: BTreeMap<String, Value>,
    cycle_inputs: BTreeMap<u32, BTreeMap<String, Value>>,
}

impl TestCase {
    pub fn new(
        initial_state: BTreeMap<String, Value>,
        cycle_inputs: BTreeMap<u32, BTreeMap<String, Value>>,
    ) -> Self {
        TestCase {
            initial_state,
            cycle_inputs,
        }
    }

    /// Initial concrete valuations of the non-input state, by flattened
    /// name.
    pub fn initial_state(&self) -> &BTreeMap<String, Value> {
        &self.initial_state
    }

    /// Concrete input valuations per cycle, by flattened name.
    pub fn cycle_inputs(&self) -> &BTreeMap<u32, BTreeMap<String, Value>> {
        &self.cycle_inputs
    }

    /// Extracts a test case from a context: version-0 valuations at cycle
    /// 0 for the non-input state, version-0 valuations for the
    /// whole-program inputs of every cycle up to `last_cycle`. The caller
    /// bounds the cycle explicitly so a context that just closed a cycle
    /// does not leak the next cycle's fresh random inputs into the case.
    pub fn from_context(context: &Context<'_>, last_cycle: u32) -> Result<TestCase, EngineError> {
        let cfg = context.main_frame().cfg();
        let state = context.state();
        let inputs: Vec<String> = cfg
            .interface()
            .input_variables()
            .filter(|v| !v.data_type().is_derived())
            .map(|v| format!("{}.{}", cfg.name(), v.name()))
            .collect();

        let mut initial_state = BTreeMap::new();
        for variable in cfg.flattened_interface() {
            let flattened = format!("{}.{}", cfg.name(), variable.name());
            if inputs.contains(&flattened) {
                continue;
            }
            let name = contextualized_name(&flattened, 0, 0);
            let term = state.concrete_valuation(&name)?;
            let value = as_value(term).ok_or_else(|| {
                EngineError::SuiteIo(format!("cell {} does not hold a literal", name))
            })?;
            initial_state.insert(flattened, value);
        }

        let mut cycle_inputs = BTreeMap::new();
        for cycle in 0..=last_cycle.min(context.cycle()) {
            let mut valuations = BTreeMap::new();
            for flattened in &inputs {
                // Cycle closure guarantees the initial valuation of every
                // cycle sits at version 0.
                let name = contextualized_name(flattened, 0, cycle);
                if let Ok(term) = state.concrete_valuation(&name) {
                    let value = as_value(term).ok_or_else(|| {
                        EngineError::SuiteIo(format!("cell {} does not hold a literal", name))
                    })?;
                    valuations.insert(flattened.clone(), value);
                }
            }
            cycle_inputs.insert(cycle, valuations);
        }
        Ok(TestCase::new(initial_state, cycle_inputs))
    }

    /// Serializes this test case to the XML exchange format.
    pub fn to_xml(&self) -> String {
        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<testcase>\n");
        xml.push_str("  <initialization>\n");
        for (name, value) in &self.initial_state {
            let _ = writeln!(
                xml,
                "    <valuation variable=\"{}\">{}</valuation>",
                name, value
            );
        }
        xml.push_str("  </initialization>\n");
        for (cycle, valuations) in &self.cycle_inputs {
            let _ = writeln!(xml, "  <input cycle=\"{}\">", cycle);
            for (name, value) in valuations {
                let _ = writeln!(
                    xml,
                    "    <valuation variable=\"{}\">{}</valuation>",
                    name, value
                );
            }
            xml.push_str("  </input>\n");
        }
        xml.push_str("</testcase>\n");
        xml
    }

    /// Parses a test case from the XML exchange format.
    pub fn from_xml(text: &str) -> Result<TestCase, EngineError> {
        let mut initial_state = BTreeMap::new();
        let mut cycle_inputs = BTreeMap::new();
        let mut section = Section::None;
        let mut current_cycle = 0;

        let mut rest = text;
        while let Some(start) = rest.find('<') {
            let after = &rest[start + 1..];
            let end = after
                .find('>')
                .ok_or_else(|| EngineError::SuiteIo("unterminated tag".to_string()))?;
            let tag = &after[..end];
            rest = &after[end + 1..];
            if tag.starts_with('?') || tag.starts_with('/') {
                if tag == "/initialization" || tag == "/input" {
                    section = Section::None;
                }
                continue;
            }
            if tag == "testcase" {
                continue;
            }
            if tag == "initialization" {
                section = Section::Initialization;
            } else if let Some(attributes) = tag.strip_prefix("input") {
                current_cycle = parse_attribute(attributes, "cycle")?
                    .parse::<u32>()
                    .map_err(|e| EngineError::SuiteIo(format!("bad cycle attribute: {}", e)))?;
                cycle_inputs.entry(current_cycle).or_insert_with(BTreeMap::new);
                section = Section::Input;
            } else if let Some(attributes) = tag.strip_prefix("valuation") {
                let variable = parse_attribute(attributes, "variable")?;
                let close = rest.find('<').ok_or_else(|| {
                    EngineError::SuiteIo("valuation element without content".to_string())
                })?;
                let literal = rest[..close].trim();
                let value = literal
                    .parse::<Value>()
                    .map_err(EngineError::SuiteIo)?;
                match section {
                    Section::Initialization => {
                        initial_state.insert(variable, value);
                    }
                    Section::Input => {
                        cycle_inputs
                            .entry(current_cycle)
                            .or_insert_with(BTreeMap::new)
                            .insert(variable, value);
                    }
                    Section::None => {
                        return Err(EngineError::SuiteIo(
                            "valuation outside initialization or input".to_string(),
                        ));
                    }
                }
            } else {
                return Err(EngineError::SuiteIo(format!("unexpected tag <{}>", tag)));
            }
        }
        Ok(TestCase::new(initial_state, cycle_inputs))
    }
}

enum Section {
    None,
    Initialization,
    Input,
}

fn parse_attribute(attributes: &str, name: &str) -> Result<String, EngineError> {
    let needle = format!("{}=\"", name);
    let start = attributes
        .find(&needle)
        .ok_or_else(|| EngineError::SuiteIo(format!("missing attribute {}", name)))?
        + needle.len();
    let end = attributes[start..]
        .find('"')
        .ok_or_else(|| EngineError::SuiteIo(format!("unterminated attribute {}", name)))?;
    Ok(attributes[start..start + end].to_string())
}

/// The ordered, de-duplicated collection of derived test cases.
#[derive(Debug, Clone, Default)]
pub struct TestSuite {
    test_cases: Vec<TestCase>,
}

impl TestSuite {
    pub fn new() -> Self {
        TestSuite::default()
    }

    pub fn test_cases(&self) -> &[TestCase] {
        &self.test_cases
    }

    pub fn len(&self) -> usize {
        self.test_cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.test_cases.is_empty()
    }

    /// Derives a test case from a context and appends it unless an equal
    /// case exists already (the same valuation can cover several branches
    /// within one execution). Returns whether the suite grew.
    pub fn derive_test_case(
        &mut self,
        context: &Context<'_>,
        last_cycle: u32,
    ) -> Result<bool, EngineError> {
        let test_case = TestCase::from_context(context, last_cycle)?;
        if self.test_cases.contains(&test_case) {
            tracing::trace!("duplicate test case, skipping");
            return Ok(false);
        }
        tracing::debug!(
            initial = test_case.initial_state.len(),
            cycles = test_case.cycle_inputs.len(),
            "derived test case {}",
            self.test_cases.len()
        );
        self.test_cases.push(test_case);
        Ok(true)
    }

    pub fn push(&mut self, test_case: TestCase) -> bool {
        if self.test_cases.contains(&test_case) {
            return false;
        }
        self.test_cases.push(test_case);
        true
    }

    /// Writes the suite as a directory of `test_case_<i>.xml` files.
    pub fn write_directory(&self, path: &Path) -> Result<(), EngineError> {
        fs::create_dir_all(path)
            .map_err(|e| EngineError::SuiteIo(format!("cannot create {}: {}", path.display(), e)))?;
        for (index, test_case) in self.test_cases.iter().enumerate() {
            let file = path.join(format!("test_case_{}.xml", index));
            fs::write(&file, test_case.to_xml())
                .map_err(|e| EngineError::SuiteIo(format!("cannot write {}: {}", file.display(), e)))?;
        }
        Ok(())
    }

    /// Reads every `.xml` file of a directory (or a single file) into a
    /// suite.
    pub fn read_directory(path: &Path) -> Result<TestSuite, EngineError> {
        let mut suite = TestSuite::new();
        if path.is_dir() {
            let mut files: Vec<_> = fs::read_dir(path)
                .map_err(|e| EngineError::SuiteIo(format!("cannot read {}: {}", path.display(), e)))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|ext| ext == "xml"))
                .collect();
            files.sort();
            for file in files {
                let text = fs::read_to_string(&file).map_err(|e| {
                    EngineError::SuiteIo(format!("cannot read {}: {}", file.display(), e))
                })?;
                suite.test_cases.push(TestCase::from_xml(&text)?);
            }
        } else {
            let text = fs::read_to_string(path)
                .map_err(|e| EngineError::SuiteIo(format!("cannot read {}: {}", path.display(), e)))?;
            suite.test_cases.push(TestCase::from_xml(&text)?);
        }
        Ok(suite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_case() -> TestCase {
        let mut initial_state = BTreeMap::new();
        initial_state.insert("P.y".to_string(), Value::Int(0));
        initial_state.insert("P.flag".to_string(), Value::Bool(false));
        let mut cycle_inputs = BTreeMap::new();
        let mut cycle0 = BTreeMap::new();
        cycle0.insert("P.x".to_string(), Value::Bool(true));
        cycle_inputs.insert(0, cycle0);
        let mut cycle1 = BTreeMap::new();
        cycle1.insert("P.x".to_string(), Value::Bool(false));
        cycle_inputs.insert(1, cycle1);
        TestCase::new(initial_state, cycle_inputs)
    }

    #[test]
    fn test_xml_round_trip_is_identity() {
        let test_case = make_test_case();
        let xml = test_case.to_xml();
        let parsed = TestCase::from_xml(&xml).unwrap();
        assert_eq!(parsed, test_case);
    }

    #[test]
    fn test_xml_shape() {
        let xml = make_test_case().to_xml();
        assert!(xml.contains("<testcase>"));
        assert!(xml.contains("<valuation variable=\"P.y\">0</valuation>"));
        assert!(xml.contains("<input cycle=\"1\">"));
        assert!(xml.contains("<valuation variable=\"P.x\">true</valuation>"));
    }

    #[test]
    fn test_suite_discards_duplicates() {
        let mut suite = TestSuite::new();
        assert!(suite.push(make_test_case()));
        assert!(!suite.push(make_test_case()));
        assert_eq!(suite.len(), 1);
    }

    #[test]
    fn test_directory_round_trip() {
        let directory = tempfile::tempdir().unwrap();
        let mut suite = TestSuite::new();
        suite.push(make_test_case());
        suite.write_directory(directory.path()).unwrap();
        assert!(directory.path().join("test_case_0.xml").exists());
        let read_back = TestSuite::read_directory(directory.path()).unwrap();
        assert_eq!(read_back.test_cases(), suite.test_cases());
    }
}
