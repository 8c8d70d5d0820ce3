use super::{core_error, print_report, service_names};
use flotilla_core::Scheduler;

pub fn run(scheduler: &Scheduler<'_>, services: &[String], json: bool) -> Result<u8, String> {
    let report = scheduler
        .restart(&service_names(services))
        .map_err(core_error)?;
    print_report(&report, json)
}
