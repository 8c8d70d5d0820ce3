use super::{spin_fail, spin_ok, spinner, EXIT_SUCCESS};
use flotilla_runtime::{select_builder, BuildRequest};
use flotilla_schema::{Project, ServiceDescriptor};

pub fn run(
    project: &Project,
    engine_name: &str,
    services: &[String],
    no_cache: bool,
    pull: bool,
) -> Result<u8, String> {
    let builder = select_builder(engine_name).map_err(|e| e.to_string())?;

    let targets: Vec<&ServiceDescriptor> = if services.is_empty() {
        project.services.iter().filter(|s| s.build.is_some()).collect()
    } else {
        let mut targets = Vec::with_capacity(services.len());
        for name in services {
            let service = project
                .service(name)
                .ok_or_else(|| format!("config error: no such service: {name}"))?;
            targets.push(service);
        }
        targets
    };

    let mut built = 0usize;
    for service in targets {
        let Some(build) = &service.build else {
            eprintln!("{} uses an image, skipping build", service.name);
            continue;
        };
        let pb = spinner(&format!("building {}...", service.name));
        let request = BuildRequest {
            context: build.context.clone(),
            dockerfile: build.dockerfile.clone(),
            tags: vec![service.image_or_build_tag(&project.name)],
            no_cache,
            pull,
            force_rm: false,
        };
        match builder.build(&request) {
            Ok(image) => {
                spin_ok(&pb, &format!("built {image}"));
                built += 1;
            }
            Err(e) => {
                spin_fail(&pb, &format!("build failed for {}", service.name));
                return Err(e.to_string());
            }
        }
    }
    if built == 0 {
        println!("nothing to build");
    }
    Ok(EXIT_SUCCESS)
}
