use super::{core_error, print_report, service_names};
use flotilla_core::Scheduler;

pub fn run(
    scheduler: &Scheduler<'_>,
    services: &[String],
    timeout: Option<u64>,
    json: bool,
) -> Result<u8, String> {
    let report = scheduler
        .stop(&service_names(services), timeout)
        .map_err(core_error)?;
    print_report(&report, json)
}
