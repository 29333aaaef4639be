//! Suppression run CLI
//!
//! Loads a rule configuration, provisions the base population from a query
//! over a SQLite database, runs every rule and prints the run summary as JSON.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use suppression_engine::{
    EngineConfig, RunReport, Session, SqliteBackend, SuppressError, SuppressionEngine,
};

/// CLI configuration
struct Config {
    /// Rule configuration file
    config: PathBuf,
    /// SQLite database holding the population and reference tables
    database: Option<PathBuf>,
    /// Select returning `entity_id` and `attribute_value`
    population_query: String,
    verbose: bool,
}

fn usage() {
    println!("suppress-run - Suppression rule execution");
    println!();
    println!("USAGE:");
    println!("    suppress-run --config <FILE> --population-query <SQL> [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -c, --config <FILE>              Rule configuration (JSON)");
    println!("    -d, --database <FILE>            SQLite database [default: in-memory]");
    println!("    -q, --population-query <SQL>     Select returning entity_id, attribute_value");
    println!("    -v, --verbose                    Debug logging");
    println!("    -h, --help                       Print help information");
}

fn fail(message: &str) -> ! {
    eprintln!("error: {message}");
    std::process::exit(2);
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = None;
    let mut database = None;
    let mut population_query = None;
    let mut verbose = false;

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        let next = args.get(i + 1);
        let value = || {
            next.cloned()
                .unwrap_or_else(|| fail(&format!("{flag} requires a value")))
        };
        match flag {
            "--config" | "-c" => {
                config = Some(PathBuf::from(value()));
                i += 2;
            }
            "--database" | "-d" => {
                database = Some(PathBuf::from(value()));
                i += 2;
            }
            "--population-query" | "-q" => {
                population_query = Some(value());
                i += 2;
            }
            "--verbose" | "-v" => {
                verbose = true;
                i += 1;
            }
            "--help" | "-h" => {
                usage();
                std::process::exit(0);
            }
            arg => fail(&format!("unknown argument: {arg}")),
        }
    }

    Config {
        config: config.unwrap_or_else(|| fail("--config is required")),
        database,
        population_query: population_query.unwrap_or_else(|| fail("--population-query is required")),
        verbose,
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .init();
}

fn execute(engine: &SuppressionEngine, config: &EngineConfig, query: &str) -> Result<RunReport, SuppressError> {
    let catalog = config.catalog()?;
    let population = engine.load_population_from_query(query)?;
    engine.run_on(&catalog, &population)
}

fn main() -> ExitCode {
    let args = parse_args();
    init_logging(args.verbose);

    let config = match EngineConfig::from_path(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let backend = match &args.database {
        Some(path) => SqliteBackend::open(path),
        None => SqliteBackend::open_in_memory(),
    };
    let backend = match backend {
        Ok(backend) => Arc::new(backend),
        Err(e) => {
            error!(error = %e, "failed to open database");
            return ExitCode::FAILURE;
        }
    };
    let session = Arc::new(match &config.session_label {
        Some(label) => Session::with_label(backend, label.clone()),
        None => Session::new(backend),
    });

    let engine = match SuppressionEngine::new(Arc::clone(&session), config.engine_options()) {
        Ok(engine) => engine,
        Err(e) => {
            error!(error = %e, "failed to start engine");
            session.teardown();
            return ExitCode::FAILURE;
        }
    };

    let result = execute(&engine, &config, &args.population_query);
    let teardown = engine.teardown();
    if !teardown.is_clean() {
        warn!(failed = ?teardown.failed, "some working relations could not be dropped");
    }
    session.teardown();

    match result {
        Ok(report) => {
            match serde_json::to_string_pretty(&report.summary()) {
                Ok(json) => println!("{json}"),
                Err(e) => {
                    error!(error = %e, "failed to serialize run summary");
                    return ExitCode::FAILURE;
                }
            }
            for failed in report.failed_outcomes() {
                warn!(
                    rule_id = %failed.rule_id(),
                    error = %failed.error_message().unwrap_or_default(),
                    "rule failed"
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "suppression run failed");
            ExitCode::FAILURE
        }
    }
}
