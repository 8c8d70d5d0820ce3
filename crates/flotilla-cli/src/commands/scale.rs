use super::{core_error, print_report};
use flotilla_core::Scheduler;
use flotilla_schema::ServiceName;
use std::collections::BTreeMap;

pub fn run(
    scheduler: &Scheduler<'_>,
    specs: &[String],
    timeout: Option<u64>,
    json: bool,
) -> Result<u8, String> {
    let mut counts = BTreeMap::new();
    for spec in specs {
        let Some((name, count)) = spec.split_once('=') else {
            return Err(format!(
                "config error: invalid scale argument '{spec}' (expected SERVICE=COUNT)"
            ));
        };
        let count: u32 = count
            .parse()
            .map_err(|_| format!("config error: invalid scale count in '{spec}'"))?;
        counts.insert(ServiceName::new(name), count);
    }
    let report = scheduler.scale(&counts, timeout).map_err(core_error)?;
    print_report(&report, json)
}
