mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{EXIT_CONFIG_ERROR, EXIT_FAILURE, EXIT_INTERRUPTED};
use flotilla_core::{DependencyGraph, Scheduler, SignalCoordinator};
use flotilla_runtime::select_engine;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(
    name = "flotilla",
    version,
    about = "Converge multi-service container applications onto an engine"
)]
struct Cli {
    /// Configuration file; repeat to stack override layers in order.
    #[arg(short = 'f', long = "file", global = true)]
    files: Vec<PathBuf>,

    /// Project name (defaults to the working directory name).
    #[arg(short = 'p', long = "project-name", global = true)]
    project_name: Option<String>,

    /// Container engine to converge against.
    #[arg(long, default_value = "docker", global = true)]
    engine: String,

    /// Maximum concurrent reconciliations.
    #[arg(long, default_value_t = flotilla_core::DEFAULT_PARALLELISM, global = true)]
    parallel: usize,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create and start the project's containers in dependency order.
    Up {
        /// Services to converge (default: all).
        services: Vec<String>,
        /// Do not attach; leave containers running in the background.
        #[arg(short, long, default_value_t = false)]
        detach: bool,
        /// Converge only the named services, skipping their dependencies.
        #[arg(long, default_value_t = false)]
        no_deps: bool,
        /// Recreate containers even when their configuration is unchanged.
        #[arg(long, default_value_t = false)]
        force_recreate: bool,
        /// Never recreate containers, even when configuration drifted.
        #[arg(long, default_value_t = false)]
        no_recreate: bool,
        /// Bring everything down once any root container exits.
        #[arg(long, default_value_t = false)]
        abort_on_container_exit: bool,
        /// Remove containers for services no longer in the configuration.
        #[arg(long, default_value_t = false)]
        remove_orphans: bool,
        /// Stop grace period in seconds (overrides per-service settings).
        #[arg(short, long)]
        timeout: Option<u64>,
    },
    /// Stop and remove containers, then project-owned networks.
    Down {
        /// Also remove images: "local" (built by the project) or "all".
        #[arg(long)]
        rmi: Option<String>,
        /// Also remove declared (non-external) volumes.
        #[arg(long, default_value_t = false)]
        volumes: bool,
        /// Remove containers for services no longer in the configuration.
        #[arg(long, default_value_t = false)]
        remove_orphans: bool,
        /// Stop grace period in seconds (overrides per-service settings).
        #[arg(short, long)]
        timeout: Option<u64>,
    },
    /// Start existing stopped containers.
    Start { services: Vec<String> },
    /// Stop running containers without removing them.
    Stop {
        services: Vec<String>,
        /// Stop grace period in seconds (overrides per-service settings).
        #[arg(short, long)]
        timeout: Option<u64>,
    },
    /// Restart containers through the engine.
    Restart { services: Vec<String> },
    /// Kill running containers immediately.
    Kill { services: Vec<String> },
    /// Pause running containers.
    Pause { services: Vec<String> },
    /// Unpause paused containers.
    Unpause { services: Vec<String> },
    /// Set the number of instances per service (SERVICE=COUNT...).
    Scale {
        #[arg(required = true)]
        counts: Vec<String>,
        /// Stop grace period in seconds when removing instances.
        #[arg(short, long)]
        timeout: Option<u64>,
    },
    /// Run a one-off container for a service.
    Run {
        service: String,
        /// Command override (after --).
        #[arg(last = true)]
        command: Vec<String>,
        /// Do not wait for the container to exit.
        #[arg(short, long, default_value_t = false)]
        detach: bool,
        /// Skip starting the service's dependencies.
        #[arg(long, default_value_t = false)]
        no_deps: bool,
        /// Remove the container after it exits.
        #[arg(long, default_value_t = false)]
        rm: bool,
        /// Stop grace period in seconds on interrupt.
        #[arg(short, long)]
        timeout: Option<u64>,
    },
    /// Build images for services that declare a build context.
    Build {
        services: Vec<String>,
        /// Build without using the builder cache.
        #[arg(long, default_value_t = false)]
        no_cache: bool,
        /// Always pull newer base images.
        #[arg(long, default_value_t = false)]
        pull: bool,
    },
    /// Print the resolved canonical project.
    Config {
        /// List service names only.
        #[arg(long, default_value_t = false)]
        services: bool,
        /// Validate without printing.
        #[arg(short, long, default_value_t = false)]
        quiet: bool,
    },
    /// List the project's containers.
    Ps,
    /// Follow the project's lifecycle event stream.
    Events,
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
    /// Generate man pages in the specified directory.
    ManPages {
        /// Output directory for man pages.
        #[arg(default_value = "man")]
        dir: PathBuf,
    },
}

#[allow(clippy::too_many_lines)]
fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("FLOTILLA_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .init();

    // Completions and man pages need no project or engine.
    match &cli.command {
        Commands::Completions { shell } => {
            return finish(commands::completions::run::<Cli>(*shell));
        }
        Commands::ManPages { dir } => {
            return finish(commands::man_pages::run::<Cli>(dir));
        }
        _ => {}
    }

    let project = match commands::load_project(&cli.files, cli.project_name.as_deref()) {
        Ok(project) => project,
        Err(message) => return fail(&message),
    };
    let graph = match DependencyGraph::build(&project) {
        Ok(graph) => graph,
        Err(e) => return fail(&format!("config error: {e}")),
    };
    let engine = match select_engine(&cli.engine) {
        Ok(engine) => engine,
        Err(e) => return fail(&e.to_string()),
    };

    let signal = SignalCoordinator::new();
    signal.install();
    let scheduler = Scheduler::new(&project, &graph, engine.as_ref())
        .with_signal(Arc::clone(&signal))
        .with_parallelism(cli.parallel);
    let json = cli.json;

    let result = match cli.command {
        Commands::Up {
            services,
            detach,
            no_deps,
            force_recreate,
            no_recreate,
            abort_on_container_exit,
            remove_orphans,
            timeout,
        } => commands::up::run(
            &scheduler,
            &services,
            detach,
            no_deps,
            force_recreate,
            no_recreate,
            abort_on_container_exit,
            remove_orphans,
            timeout,
            json,
        ),
        Commands::Down {
            rmi,
            volumes,
            remove_orphans,
            timeout,
        } => commands::down::run(
            &scheduler,
            rmi.as_deref(),
            volumes,
            remove_orphans,
            timeout,
            json,
        ),
        Commands::Start { services } => commands::start::run(&scheduler, &services, json),
        Commands::Stop { services, timeout } => {
            commands::stop::run(&scheduler, &services, timeout, json)
        }
        Commands::Restart { services } => commands::restart::run(&scheduler, &services, json),
        Commands::Kill { services } => commands::kill::run(&scheduler, &services, json),
        Commands::Pause { services } => commands::pause::run(&scheduler, &services, json),
        Commands::Unpause { services } => commands::unpause::run(&scheduler, &services, json),
        Commands::Scale { counts, timeout } => {
            commands::scale::run(&scheduler, &counts, timeout, json)
        }
        Commands::Run {
            service,
            command,
            detach,
            no_deps,
            rm,
            timeout,
        } => commands::run::run(
            &scheduler, &service, &command, detach, no_deps, rm, timeout, json,
        ),
        Commands::Build {
            services,
            no_cache,
            pull,
        } => commands::build::run(&project, &cli.engine, &services, no_cache, pull),
        Commands::Config { services, quiet } => {
            commands::config::run(&project, services, quiet, json)
        }
        Commands::Ps => commands::ps::run(&project, engine.as_ref(), json),
        Commands::Events => commands::events::run(&project, engine.as_ref(), json),
        Commands::Completions { .. } | Commands::ManPages { .. } => unreachable!("handled above"),
    };

    finish(result)
}

fn finish(result: Result<u8, String>) -> ExitCode {
    match result {
        Ok(code) => ExitCode::from(code),
        Err(message) => fail(&message),
    }
}

fn fail(message: &str) -> ExitCode {
    eprintln!("error: {message}");
    let code = if message.starts_with("interrupted") {
        EXIT_INTERRUPTED
    } else if message.starts_with("config error:")
        || message.starts_with("failed to parse config")
        || message.starts_with("failed to read config")
    {
        EXIT_CONFIG_ERROR
    } else {
        EXIT_FAILURE
    };
    ExitCode::from(code)
}
