pub mod build;
pub mod completions;
pub mod config;
pub mod down;
pub mod events;
pub mod kill;
pub mod man_pages;
pub mod pause;
pub mod ps;
pub mod restart;
pub mod run;
pub mod scale;
pub mod start;
pub mod stop;
pub mod unpause;
pub mod up;

use flotilla_core::{CoreError, OperationReport, ServiceOutcome};
use flotilla_schema::{
    load_documents, sanitize_project_name, Project, ProjectName, ServiceName,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_INTERRUPTED: u8 = 130;

/// Default configuration layers, in merge order.
pub const DEFAULT_FILE: &str = "flotilla.yml";
pub const DEFAULT_OVERRIDE_FILE: &str = "flotilla.override.yml";

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

/// Flatten a core error into the message channel, keeping enough of a prefix
/// for exit-code classification in main.
pub fn core_error(error: CoreError) -> String {
    match &error {
        CoreError::Interrupted => "interrupted".to_owned(),
        CoreError::Config(_) => format!("config error: {error}"),
        _ => error.to_string(),
    }
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .expect("valid template")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✗ {msg}"));
}

pub fn colorize_status(status: &str) -> String {
    use console::Style;
    match status {
        "running" => Style::new().cyan().bold().apply_to(status).to_string(),
        "created" => Style::new().yellow().apply_to(status).to_string(),
        "paused" => Style::new().blue().apply_to(status).to_string(),
        "exited" | "dead" => Style::new().dim().apply_to(status).to_string(),
        other => other.to_owned(),
    }
}

/// Resolve configuration layers into the canonical project.
///
/// With no explicit files, `flotilla.yml` is the base layer and
/// `flotilla.override.yml` stacks on top when present. Interpolation reads
/// the process environment; warnings go to stderr.
pub fn load_project(files: &[PathBuf], project_name: Option<&str>) -> Result<Project, String> {
    let paths: Vec<PathBuf> = if files.is_empty() {
        let mut defaults = vec![PathBuf::from(DEFAULT_FILE)];
        if PathBuf::from(DEFAULT_OVERRIDE_FILE).exists() {
            defaults.push(PathBuf::from(DEFAULT_OVERRIDE_FILE));
        }
        defaults
    } else {
        files.to_vec()
    };

    let name = match project_name {
        Some(name) => sanitize_project_name(name),
        None => project_name_from_cwd(),
    };

    let set = load_documents(&paths).map_err(|e| format!("config error: {e}"))?;
    let environment: BTreeMap<String, String> = std::env::vars().collect();
    let resolved = Project::resolve(name, &set.layer_names, &set.registry, &environment)
        .map_err(|e| format!("config error: {e}"))?;
    for warning in &resolved.warnings {
        eprintln!("warning: {warning}");
    }
    Ok(resolved.project)
}

fn project_name_from_cwd() -> ProjectName {
    std::env::current_dir()
        .ok()
        .and_then(|dir| dir.file_name().map(|n| n.to_string_lossy().into_owned()))
        .map_or_else(|| ProjectName::new("default"), |n| sanitize_project_name(&n))
}

pub fn service_names(raw: &[String]) -> Vec<ServiceName> {
    raw.iter().map(ServiceName::new).collect()
}

/// Print per-service outcomes and map the report onto an exit code.
pub fn print_report(report: &OperationReport, json: bool) -> Result<u8, String> {
    if json {
        println!("{}", json_pretty(report)?);
        return Ok(report.exit_code());
    }
    for (service, outcome) in &report.outcomes {
        match outcome {
            ServiceOutcome::Converged { containers } => {
                if containers.is_empty() {
                    println!("✓ {service}");
                } else {
                    println!("✓ {service} ({})", containers.join(", "));
                }
            }
            ServiceOutcome::NoContainers => {
                eprintln!("no containers for service {service}");
            }
            ServiceOutcome::Skipped { blocked_on } => {
                eprintln!("skipped {service} (dependency {blocked_on} failed)");
            }
            ServiceOutcome::Failed { error } => {
                eprintln!("✗ {service}: {error}");
            }
        }
    }
    Ok(report.exit_code())
}
