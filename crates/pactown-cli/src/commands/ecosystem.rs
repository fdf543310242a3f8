//! Ecosystem lifecycle commands.

use std::path::Path;

use pactown_core::config::EcosystemConfig;
use pactown_core::error::EngineError;
use pactown_core::orchestrator::{Orchestrator, ServiceStatus};

/// Load a configuration and build an engine rooted at the config file's
/// directory.
fn engine(config_path: &Path) -> Result<Orchestrator, EngineError> {
    let config = EcosystemConfig::from_file(config_path)?;
    let base_path = config_path.parent().unwrap_or_else(|| Path::new("."));
    Orchestrator::new(config, base_path)
}

/// Start all services in dependency order, then stay resident until
/// Ctrl-C tears the ecosystem down.
pub async fn up(config_path: &Path) -> Result<(), EngineError> {
    let mut engine = engine(config_path)?;

    let issues = engine.validate();
    if !issues.is_empty() {
        for issue in &issues {
            eprintln!("  - {issue}");
        }
        return Err(EngineError::Validation { issues });
    }

    engine.up().await?;

    println!("Ecosystem '{}' is up:", engine.config().name);
    print_status_table(&engine.status().await);
    println!("\nPress Ctrl-C to stop all services");

    engine.run_until_shutdown().await?;
    println!("All services stopped");
    Ok(())
}

/// Stop all services in reverse dependency order.
pub async fn down(config_path: &Path) -> Result<(), EngineError> {
    let mut engine = engine(config_path)?;
    engine.down().await?;
    println!("All services stopped");
    Ok(())
}

/// Show the status of every configured service.
pub async fn status(config_path: &Path) -> Result<(), EngineError> {
    let engine = engine(config_path)?;
    println!("Ecosystem: {}", engine.config().name);
    print_status_table(&engine.status().await);
    Ok(())
}

/// Validate the configuration and artifacts without starting anything.
pub fn validate(config_path: &Path) -> Result<(), EngineError> {
    let engine = engine(config_path)?;
    let issues = engine.validate();

    if issues.is_empty() {
        println!("Ecosystem configuration is valid");
        Ok(())
    } else {
        println!("Validation failed:");
        for issue in &issues {
            println!("  - {issue}");
        }
        Err(EngineError::Validation { issues })
    }
}

/// Print the dependency graph.
pub fn graph(config_path: &Path) -> Result<(), EngineError> {
    let engine = engine(config_path)?;
    println!("{}", engine.render_graph());
    Ok(())
}

fn print_status_table(statuses: &[ServiceStatus]) {
    println!("{:<20} {:>6}  {:<14} {}", "SERVICE", "PORT", "STATE", "HEALTH");
    for status in statuses {
        let port = status
            .port
            .map_or_else(|| "-".to_string(), |p| p.to_string());
        let state = status
            .state
            .as_ref()
            .map_or_else(|| "not started".to_string(), ToString::to_string);
        let health = match status.healthy {
            Some(true) => "ok",
            Some(false) => "failing",
            None => "-",
        };
        println!("{:<20} {:>6}  {:<14} {}", status.name, port, state, health);
    }
}
