use super::{colorize_status, core_error, json_pretty, EXIT_SUCCESS};
use flotilla_core::Reconciler;
use flotilla_runtime::ContainerEngine;
use flotilla_schema::Project;

pub fn run(
    project: &Project,
    engine: &dyn ContainerEngine,
    json: bool,
) -> Result<u8, String> {
    let reconciler = Reconciler::new(project, engine);
    let records = reconciler.project_containers(true).map_err(core_error)?;

    if json {
        println!("{}", json_pretty(&records)?);
    } else if records.is_empty() {
        println!("no containers found");
    } else {
        println!("{:<28} {:<10} {:<24} ID", "NAME", "STATE", "IMAGE");
        for record in &records {
            println!(
                "{:<28} {:<10} {:<24} {}",
                record.name,
                colorize_status(&record.status.to_string()),
                record.image,
                record.id
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
