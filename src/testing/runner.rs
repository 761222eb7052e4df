//! Test runner implementation
//!
//! Loads a YAML scenario, runs it through the orchestrator against real
//! processes and prints the result.

use std::path::Path;

use colored::Colorize;

use crate::common::config::Config;
use crate::common::{logging, Result};
use crate::orchestrator::Orchestrator;
use crate::report::RunReport;

use super::config::load_scenario;

/// Run a test scenario from a YAML file
///
/// Only failures to load the scenario or set up the orchestrator are
/// returned as errors; everything that happens during the run is in the
/// report.
pub async fn run_scenario(path: &Path, config: &Config) -> Result<RunReport> {
    let scenario = load_scenario(path)?;
    let scenario_dir = path.parent().unwrap_or(Path::new("."));

    let _log_guard = config.logging.run_log_dir(&scenario.name).and_then(|dir| {
        logging::init_file_logging(&dir)
            .map_err(|e| tracing::warn!(dir = %dir.display(), "Run log unavailable: {}", e))
            .ok()
            .flatten()
    });

    println!(
        "\n{} {}",
        "Running Test:".blue().bold(),
        scenario.name.white().bold()
    );

    if let Some(desc) = &scenario.description {
        println!("  {}", desc.dimmed());
    }

    let topology = scenario.topology(scenario_dir)?;
    let plan = scenario.probe_plan(&config.probe)?;

    if let Some(build) = &topology.build {
        println!(
            "  {} {} {}",
            "Build:".cyan(),
            build.program,
            build.args.join(" ").dimmed()
        );
    }
    println!("  {} {}", "Backend:".cyan(), topology.backend.program.display());
    println!("  {} {}", "Consumer:".cyan(), topology.consumer.program.display());
    println!(
        "  {} {} {}",
        "Probe:".cyan(),
        plan.url,
        format!("(timeout {:?})", plan.settings.timeout).dimmed()
    );

    let orchestrator = Orchestrator::from_config(config, &scenario.name)?;
    let report = orchestrator
        .run(&scenario.name, &topology, &plan, &scenario.expect)
        .await;

    println!("\n{}", report.render());
    Ok(report)
}
