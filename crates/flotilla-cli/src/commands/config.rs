use super::{json_pretty, EXIT_SUCCESS};
use flotilla_schema::Project;

pub fn run(project: &Project, services_only: bool, quiet: bool, json: bool) -> Result<u8, String> {
    if quiet {
        // Resolution already succeeded; validation-only mode has nothing to print.
        return Ok(EXIT_SUCCESS);
    }
    if services_only {
        for name in project.service_names() {
            println!("{name}");
        }
        return Ok(EXIT_SUCCESS);
    }
    if json {
        println!("{}", json_pretty(project)?);
    } else {
        let yaml = serde_yaml::to_string(project)
            .map_err(|e| format!("YAML serialization failed: {e}"))?;
        print!("{yaml}");
    }
    Ok(EXIT_SUCCESS)
}
