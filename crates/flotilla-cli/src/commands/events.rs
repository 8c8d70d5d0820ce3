use super::{core_error, EXIT_SUCCESS};
use flotilla_core::EventProjector;
use flotilla_runtime::ContainerEngine;
use flotilla_schema::Project;

/// Follow the project's event stream until the feed closes or the process
/// is interrupted. The subscription starts from "now"; history never replays.
pub fn run(
    project: &Project,
    engine: &dyn ContainerEngine,
    json: bool,
) -> Result<u8, String> {
    let projector = EventProjector::subscribe(engine, project).map_err(core_error)?;
    for event in projector {
        if json {
            println!(
                "{}",
                serde_json::to_string(&event)
                    .map_err(|e| format!("JSON serialization failed: {e}"))?
            );
        } else {
            println!(
                "{} {} {}_{} ({})",
                event.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
                event.action,
                event.service,
                event.number,
                event.container_name,
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
