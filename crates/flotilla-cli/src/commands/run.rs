use super::{core_error, json_pretty, EXIT_FAILURE, EXIT_SUCCESS};
use flotilla_core::{RunOptions, Scheduler};
use flotilla_schema::{Command, ServiceName};

#[allow(clippy::too_many_arguments, clippy::fn_params_excessive_bools)]
pub fn run(
    scheduler: &Scheduler<'_>,
    service: &str,
    command: &[String],
    detach: bool,
    no_deps: bool,
    remove: bool,
    timeout: Option<u64>,
    json: bool,
) -> Result<u8, String> {
    let command = if command.is_empty() {
        None
    } else {
        Some(Command::Exec(command.to_vec()))
    };
    let options = RunOptions {
        no_deps,
        detached: detach,
        remove,
        timeout_secs: timeout,
    };
    let result = scheduler
        .run(&ServiceName::new(service), command, &options)
        .map_err(core_error)?;

    if json {
        let payload = serde_json::json!({
            "container": result.container,
            "id": result.id,
            "exit_code": result.exit_code,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("{}", result.container);
    }
    // An attached one-off propagates the container's exit status.
    Ok(match result.exit_code {
        None | Some(0) => EXIT_SUCCESS,
        Some(code) => u8::try_from(code).unwrap_or(EXIT_FAILURE),
    })
}
