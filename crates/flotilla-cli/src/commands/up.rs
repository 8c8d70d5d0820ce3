use super::{core_error, print_report, service_names};
use flotilla_core::{RecreatePolicy, Scheduler, UpOptions};

#[allow(clippy::too_many_arguments, clippy::fn_params_excessive_bools)]
pub fn run(
    scheduler: &Scheduler<'_>,
    services: &[String],
    detach: bool,
    no_deps: bool,
    force_recreate: bool,
    no_recreate: bool,
    abort_on_container_exit: bool,
    remove_orphans: bool,
    timeout: Option<u64>,
    json: bool,
) -> Result<u8, String> {
    let options = UpOptions {
        services: service_names(services),
        no_deps,
        policy: RecreatePolicy {
            force_recreate,
            no_recreate,
        },
        detached: detach,
        abort_on_exit: abort_on_container_exit,
        recreate_dependents: false,
        remove_orphans,
        timeout_secs: timeout,
    };
    let report = scheduler.up(&options).map_err(core_error)?;
    print_report(&report, json)
}
