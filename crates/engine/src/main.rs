//! cyclist CLI
//!
//! Utility surface around the engine library: test-suite validation and
//! shell completions. Programs enter through the library API; the
//! front end producing labelled modules lives outside this repository.

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use cyclist_engine::testsuite::TestSuite;
use std::io;
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cyclist")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Concolic test-suite generation for cyclic controller programs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and validate test suites
    Suite {
        #[command(subcommand)]
        command: SuiteCommands,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum SuiteCommands {
    /// Parse a test-suite directory and check that every case round-trips
    Check {
        /// Test-suite directory (or a single test-case file)
        path: PathBuf,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Suite { command } => match command {
            SuiteCommands::Check { path } => match check_suite(&path) {
                Ok(count) => {
                    println!("{}: {} test case(s), all round-trip", path.display(), count);
                }
                Err(error) => {
                    eprintln!("error: {}", error);
                    process::exit(error.exit_code());
                }
            },
        },
        Commands::Completions { shell } => {
            let mut command = Cli::command();
            let name = command.get_name().to_string();
            generate(shell, &mut command, name, &mut io::stdout());
        }
    }
}

fn check_suite(path: &PathBuf) -> Result<usize, cyclist_engine::EngineError> {
    let suite = TestSuite::read_directory(path)?;
    for test_case in suite.test_cases() {
        let xml = test_case.to_xml();
        let parsed = cyclist_engine::TestCase::from_xml(&xml)?;
        if parsed != *test_case {
            return Err(cyclist_engine::EngineError::SuiteIo(
                "test case does not round-trip".to_string(),
            ));
        }
    }
    Ok(suite.len())
}
