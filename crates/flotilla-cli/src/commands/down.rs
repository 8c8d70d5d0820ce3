use super::{core_error, print_report, spin_fail, spin_ok, spinner};
use flotilla_core::{DownOptions, ImageRemoval, Scheduler};

pub fn run(
    scheduler: &Scheduler<'_>,
    rmi: Option<&str>,
    volumes: bool,
    remove_orphans: bool,
    timeout: Option<u64>,
    json: bool,
) -> Result<u8, String> {
    let remove_images = match rmi {
        None => ImageRemoval::None,
        Some("local") => ImageRemoval::Local,
        Some("all") => ImageRemoval::All,
        Some(other) => {
            return Err(format!(
                "config error: invalid --rmi value '{other}' (expected local or all)"
            ))
        }
    };
    let options = DownOptions {
        remove_images,
        remove_volumes: volumes,
        remove_orphans,
        timeout_secs: timeout,
    };

    let pb = spinner("bringing project down...");
    match scheduler.down(&options) {
        Ok(report) => {
            spin_ok(&pb, "project down");
            print_report(&report, json)
        }
        Err(e) => {
            spin_fail(&pb, "down failed");
            Err(core_error(e))
        }
    }
}
