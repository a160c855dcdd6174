//! Engine orchestration.
//!
//! The concolic engine pops one context at a time, executes one vertex,
//! pushes back the primary and (if present) forked contexts, updates
//! coverage, and derives a test case whenever coverage grows. A context
//! retires once it closes its final cycle.
//!
//! The shadow engine runs two phases: phase 1 drives the unified program
//! per seed test case with the divergence executor, collecting divergent
//! stops and divergent forks; phase 2 derives a witness test case from
//! each, replays it through the simulator to seed coverage with the
//! already-exercised history, and continues bounded concolic exploration
//! in the new version.

use crate::context::Context;
use crate::error::EngineError;
use crate::executor::Executor;
use crate::explorer::{Coverage, Explorer};
use crate::shadow::{
    DivergenceExecutor, DivergentContext, ExecutionStatus, ShadowProcessingMode,
};
use crate::simulator::Simulator;
use crate::solver::Solver;
use crate::testsuite::{TestCase, TestSuite};
use cyclist_ir::cfg::Cfg;
use cyclist_ir::expression::Label;
use std::rc::Rc;

/// What a concolic engine run produced.
#[derive(Debug)]
pub struct EngineOutcome {
    pub test_suite: TestSuite,
    pub statement_coverage: f64,
    pub branch_coverage: f64,
    pub steps: u64,
}

/// The concolic test-generation engine.
pub struct Engine<'ctx> {
    solver: &'ctx Solver,
    cycle_bound: u32,
}

impl<'ctx> Engine<'ctx> {
    /// An engine exploring `cycle_bound` cycles per context.
    pub fn new(solver: &'ctx Solver, cycle_bound: u32) -> Self {
        Engine {
            solver,
            cycle_bound: cycle_bound.max(1),
        }
    }

    pub fn from_config(solver: &'ctx Solver, config: &crate::config::EngineConfig) -> Self {
        Engine::new(solver, config.cycle_bound)
    }

    /// Explores the program and derives a test suite.
    pub fn run(&self, cfg: &Rc<Cfg>) -> Result<EngineOutcome, EngineError> {
        let mut executor = Executor::new(self.solver);
        let context = executor.initial_context(cfg)?;
        let mut coverage = Coverage::new();
        coverage.initialize(cfg);
        let mut explorer = Explorer::new();
        explorer.push(context);
        let mut test_suite = TestSuite::new();
        let steps = self.drive(
            &mut executor,
            &mut explorer,
            &mut coverage,
            &mut test_suite,
        )?;
        tracing::info!(
            steps,
            test_cases = test_suite.len(),
            statement = coverage.statement_coverage(),
            branch = coverage.branch_coverage(),
            "exploration finished"
        );
        Ok(EngineOutcome {
            test_suite,
            statement_coverage: coverage.statement_coverage(),
            branch_coverage: coverage.branch_coverage(),
            steps,
        })
    }

    /// The scheduling loop, shared with shadow phase 2.
    pub(crate) fn drive(
        &self,
        executor: &mut Executor<'ctx>,
        explorer: &mut Explorer<'ctx>,
        coverage: &mut Coverage,
        test_suite: &mut TestSuite,
    ) -> Result<u64, EngineError> {
        let mut steps = 0u64;
        while let Some(context) = explorer.pop() {
            steps += 1;
            let cycle_before = context.cycle();
            let cfg_of_step = context.frame().cfg().clone();
            let label = context.state().label();
            let (primary, forked) = executor.execute(context)?;

            let (statements_grew, branches_grew) =
                coverage.update(&cfg_of_step, label, primary.state().label());
            if statements_grew || branches_grew {
                test_suite.derive_test_case(&primary, cycle_before)?;
            }
            if let Some(forked_context) = &forked {
                // The untaken branch slot belongs to the fork.
                let (statements_grew, branches_grew) =
                    coverage.update(&cfg_of_step, label, forked_context.state().label());
                if statements_grew || branches_grew {
                    test_suite.derive_test_case(forked_context, cycle_before)?;
                }
            }

            if primary.cycle() < self.cycle_bound {
                explorer.push(primary);
            }
            if let Some(forked_context) = forked {
                if forked_context.cycle() < self.cycle_bound {
                    explorer.push(forked_context);
                }
            }
        }
        Ok(steps)
    }
}

// ----------------------------------------------------------------------
// Shadow engine
// ----------------------------------------------------------------------

/// A concretely observed divergence between the two program versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Divergence {
    pub cycle: u32,
    pub label: Label,
    pub scope: String,
}

/// What a shadow engine run produced.
#[derive(Debug)]
pub struct ShadowOutcome {
    pub test_suite: TestSuite,
    pub divergences: Vec<Divergence>,
    pub statement_coverage: f64,
    pub branch_coverage: f64,
}

/// The two-phase shadow divergence engine.
pub struct ShadowEngine<'ctx> {
    solver: &'ctx Solver,
    cycle_bound: u32,
}

impl<'ctx> ShadowEngine<'ctx> {
    pub fn new(solver: &'ctx Solver, cycle_bound: u32) -> Self {
        ShadowEngine {
            solver,
            cycle_bound: cycle_bound.max(1),
        }
    }

    /// Runs both phases against a unified program. `seeds` replays the
    /// given test cases through phase 1; an empty suite runs one seed
    /// with random inputs.
    pub fn run(&self, cfg: &Rc<Cfg>, seeds: &TestSuite) -> Result<ShadowOutcome, EngineError> {
        let mut collected: Vec<DivergentContext<'ctx>> = Vec::new();
        let mut divergences = Vec::new();

        // Phase 1: drive the unified program, collecting divergences.
        let seed_plans: Vec<Option<TestCase>> = if seeds.is_empty() {
            vec![None]
        } else {
            seeds.test_cases().iter().cloned().map(Some).collect()
        };
        for plan in seed_plans {
            let mut executor = match plan {
                Some(test_case) => DivergenceExecutor::with_input_plan(self.solver, test_case),
                None => DivergenceExecutor::new(self.solver),
            };
            let mut context = executor.initial_context(cfg)?;
            while context.cycle() < self.cycle_bound {
                let (status, primary, mut forks) = executor.execute(context)?;
                collected.append(&mut forks);
                match status {
                    ExecutionStatus::DivergentBehavior => {
                        divergences.push(Divergence {
                            cycle: primary.cycle(),
                            label: primary.state().base().label(),
                            scope: primary.frame().scope().to_string(),
                        });
                        collected.push(primary);
                        break;
                    }
                    ExecutionStatus::PotentialDivergentBehavior
                    | ExecutionStatus::ExpectedBehavior => {
                        context = primary;
                    }
                }
            }
        }
        tracing::info!(
            divergences = divergences.len(),
            contexts = collected.len(),
            "shadow phase 1 finished"
        );

        // Phase 2: explore onwards from every divergent context in the
        // new program version.
        let mut test_suite = TestSuite::new();
        let mut coverage = Coverage::new();
        coverage.initialize(cfg);
        let engine = Engine::new(self.solver, self.cycle_bound);
        for divergent in collected {
            let stop_label = divergent.state().base().label();
            let last_cycle = divergent.cycle();
            let context = to_exploration_context(&divergent);
            let witness = TestCase::from_context(&context, last_cycle)?;

            let mut simulator = Simulator::new(self.solver, ShadowProcessingMode::New);
            let outcome = simulator.run(cfg, &witness)?;
            coverage.seed_from_history(cfg, &outcome.execution_history, stop_label);
            test_suite.push(witness);

            let mut executor = Executor::new(self.solver);
            executor.initialize(cfg);
            let mut explorer = Explorer::new();
            explorer.push(context);
            engine.drive(&mut executor, &mut explorer, &mut coverage, &mut test_suite)?;
        }

        Ok(ShadowOutcome {
            test_suite,
            divergences,
            statement_coverage: coverage.statement_coverage(),
            branch_coverage: coverage.branch_coverage(),
        })
    }
}

/// Converts a divergent context into a plain exploration context for the
/// new version: the per-version constraints of the new program join the
/// plain path constraint.
fn to_exploration_context<'ctx>(divergent: &DivergentContext<'ctx>) -> Context<'ctx> {
    let mut state = divergent.state().base().clone();
    for constraint in divergent.state().new_path_constraint() {
        state.push_path_constraint(constraint.clone());
    }
    Context::from_parts(divergent.cycle(), state, divergent.call_stack().to_vec())
}
