use anyhow::{anyhow, Context};
use clap::{Arg, ArgAction, ArgMatches, Command};
use podbak::{
    dump_config, load_config, BackupOrchestrator, Direction, Options, Outcome, PodbakError,
    ProgressConfig, RestoreOrchestrator, RunReport, SkipVolumes, SystemRunner,
};
use std::path::{Path, PathBuf};
use std::process;
use tracing::warn;
use tracing_subscriber::EnvFilter;

fn main() {
    let result = run();
    match result {
        Ok(exit_code) => process::exit(exit_code),
        Err(error) => {
            eprintln!("Error: {error:#}");

            if let Some(error) = error.downcast_ref::<PodbakError>() {
                print_suggestions(error);
                process::exit(error.exit_code());
            }
            process::exit(1);
        }
    }
}

fn build_cli() -> Command {
    let skip_volumes = Arg::new("skip-volumes")
        .long("skip-volumes")
        .help("Volumes to leave out, comma separated. Use 'all' to skip every built-in volume")
        .value_name("VOLUMES")
        .value_delimiter(',')
        .action(ArgAction::Append);
    let flag = |name: &'static str, help: &'static str| {
        Arg::new(name)
            .long(name)
            .help(help)
            .action(ArgAction::SetTrue)
    };
    let dry_run = Arg::new("dry-run")
        .short('n')
        .long("dry-run")
        .help("Show what would be done without doing it")
        .action(ArgAction::SetTrue);

    Command::new("podbak")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Backup and restore of a podman and systemd hosted server")
        .long_about(
            "podbak saves the volumes, images, network, secrets and service units of a \
             containerized server into a directory, and restores them on a clean host.\n\
             Example: podbak create /var/backup/server",
        )
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Show detailed progress information")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .help("Suppress all output except errors")
                .action(ArgAction::SetTrue)
                .conflicts_with("verbose")
                .global(true),
        )
        .arg(
            Arg::new("dump-config")
                .long("dump-config")
                .help("Display current configuration settings and exit")
                .action(ArgAction::SetTrue),
        )
        .subcommand(
            Command::new("create")
                .about("Back up the server into an empty or new directory")
                .arg(
                    Arg::new("directory")
                        .help("Output directory")
                        .required(true)
                        .value_name("OUTPUT-DIRECTORY"),
                )
                .arg(skip_volumes.clone())
                .arg(
                    Arg::new("extra-volumes")
                        .long("extra-volumes")
                        .help("Additional volumes to back up, comma separated")
                        .value_name("VOLUMES")
                        .value_delimiter(',')
                        .action(ArgAction::Append),
                )
                .arg(flag("skip-database", "Do not back up the database volumes"))
                .arg(flag("skip-images", "Do not back up container images"))
                .arg(flag("skip-config", "Do not back up network, secrets and service units"))
                .arg(flag("no-restart", "Do not start the services again afterwards"))
                .arg(dry_run.clone()),
        )
        .subcommand(
            Command::new("restore")
                .about("Restore a backup onto this host")
                .arg(
                    Arg::new("directory")
                        .help("Directory holding the backup")
                        .required(true)
                        .value_name("INPUT-DIRECTORY"),
                )
                .arg(skip_volumes)
                .arg(flag("skip-database", "Do not restore the database volumes"))
                .arg(flag("skip-images", "Do not restore container images"))
                .arg(flag(
                    "skip-config",
                    "Do not restore the backed up configuration, use defaults",
                ))
                .arg(flag("no-restart", "Do not start the services again afterwards"))
                .arg(dry_run)
                .arg(flag("force", "Overwrite existing volumes, network and secrets"))
                .arg(
                    Arg::new("continue")
                        .long("continue")
                        .help("Skip volumes that already exist, even with --force")
                        .action(ArgAction::SetTrue),
                )
                .arg(flag("skip-verify", "Do not verify archive checksums")),
        )
}

fn has_flag(matches: &ArgMatches, name: &str) -> bool {
    matches.try_get_one::<bool>(name).ok().flatten().copied().unwrap_or(false)
}

fn values(matches: &ArgMatches, name: &str) -> Vec<String> {
    match matches.try_get_many::<String>(name) {
        Ok(Some(values)) => values.filter(|v| !v.is_empty()).cloned().collect(),
        _ => Vec::new(),
    }
}

/// Options of a `create` or `restore` invocation. Flags a subcommand lacks stay unset.
fn options_from(matches: &ArgMatches) -> Options {
    Options {
        skip_volumes: SkipVolumes::from_list(values(matches, "skip-volumes")),
        extra_volumes: values(matches, "extra-volumes"),
        skip_database: has_flag(matches, "skip-database"),
        skip_images: has_flag(matches, "skip-images"),
        skip_config: has_flag(matches, "skip-config"),
        no_restart: has_flag(matches, "no-restart"),
        dry_run: has_flag(matches, "dry-run"),
        force: has_flag(matches, "force"),
        skip_existing: has_flag(matches, "continue"),
        skip_verify: has_flag(matches, "skip-verify"),
    }
}

fn log_level(verbose: bool, quiet: bool) -> &'static str {
    if verbose {
        "debug"
    } else if quiet {
        "error"
    } else {
        "info"
    }
}

fn init_logging(verbose: bool, quiet: bool) -> anyhow::Result<()> {
    // RUST_LOG wins over the command line
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level(verbose, quiet)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!("Failed to initialize logging: {e}"))
}

fn run() -> anyhow::Result<i32> {
    let matches = build_cli().get_matches();
    let (command, sub) = match matches.subcommand() {
        Some((command, sub)) => (Some(command), Some(sub)),
        None => (None, None),
    };
    let verbose = sub.map_or(false, |s| has_flag(s, "verbose")) || has_flag(&matches, "verbose");
    let quiet = sub.map_or(false, |s| has_flag(s, "quiet")) || has_flag(&matches, "quiet");

    init_logging(verbose, quiet)?;

    let config = load_config().unwrap_or_else(|e| {
        warn!("Could not load config, using defaults: {e}");
        podbak::default_config()
    });

    if has_flag(&matches, "dump-config") {
        dump_config(&config)?;
        return Ok(0);
    }

    let (command, sub) = match (command, sub) {
        (Some(command), Some(sub)) => (command, sub),
        _ => {
            return Err(PodbakError::validation(
                "No command specified. Use --help for usage information.",
            )
            .into())
        }
    };

    let directory = sub
        .get_one::<String>("directory")
        .map(PathBuf::from)
        .ok_or_else(|| PodbakError::validation("No directory specified"))?;
    let options = options_from(sub);
    let direction = match command {
        "restore" => Direction::Restore,
        _ => Direction::Backup,
    };

    setup_signal_handlers(direction, &directory)?;

    let progress = if quiet {
        ProgressConfig::disabled()
    } else {
        ProgressConfig::auto_detect()
    };
    let runner = SystemRunner::new();
    let report = match direction {
        Direction::Backup => BackupOrchestrator::new(&runner, &config)
            .with_progress(progress)
            .run(&directory, &options),
        Direction::Restore => RestoreOrchestrator::new(&runner, &config)
            .with_progress(progress)
            .run(&directory, &options),
    };

    print_report(&report, verbose, quiet);
    Ok(report.outcome.exit_code())
}

fn print_report(report: &RunReport, verbose: bool, quiet: bool) {
    if let Some(message) = report.outcome.user_message(report.direction, &report.directory) {
        eprintln!("{message}");
    }
    match &report.outcome {
        Outcome::Success => {}
        Outcome::FatalNoData(error) => print_suggestions(error),
        Outcome::FatalDataRemains(error) | Outcome::RecoverableWarning(error) => {
            eprintln!("Error: {error}");
            print_suggestions(error);
        }
    }

    if quiet || report.outcome.abort() {
        return;
    }
    if verbose {
        println!("{}", report.summary());
        println!("  Volumes: {}", report.volumes.join(", "));
        println!("  Images: {}", report.images.join(", "));
        println!("  Duration: {:.2}s", report.duration.as_secs_f64());
    } else {
        println!("{}", report.summary());
    }
}

fn print_suggestions(error: &PodbakError) {
    let suggestions = error.suggestions();
    if !suggestions.is_empty() {
        eprintln!("\nSuggestions:");
        for suggestion in suggestions {
            eprintln!("  - {suggestion}");
        }
    }
}

fn interrupt_hint(direction: Direction, directory: &Path) -> String {
    match direction {
        Direction::Backup => format!(
            "Interrupted. Partially backed up files may remain in '{}'. \
             Stopped services need to be started manually",
            directory.display()
        ),
        Direction::Restore => "Interrupted. Volumes may be partially restored. \
             Stopped services need to be started manually"
            .to_string(),
    }
}

fn setup_signal_handlers(direction: Direction, directory: &Path) -> anyhow::Result<()> {
    let hint = interrupt_hint(direction, directory);
    ctrlc::set_handler(move || {
        eprintln!("\n{hint}");
        process::exit(130);
    })
    .context("Error setting Ctrl-C handler")
}
