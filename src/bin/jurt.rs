use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::LevelFilter;

use jurt::build::{BuildOptions, BuildStage};
use jurt::config::Config;
use jurt::error::is_interrupted;
use jurt::preflight;
use jurt::su::interrupt;
use jurt::target::Jurt;

const ERROR_EXIT: u8 = 2;
const INTERRUPTED_EXIT: u8 = 130;
const BUILD_FAILED_EXIT: u8 = 1;

#[derive(Parser)]
#[command(author, version, about = "Package build bot running builds inside disposable chroots", long_about = None)]
struct Cli {
    /// Debug output
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,
    /// Only warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,
    /// Configuration override, e.g. `target.cooker.arch=i586`
    #[arg(short = 'o', long = "option", value_name = "SECTION.KEY=VALUE", global = true)]
    options: Vec<String>,
    /// Extra configuration file, loaded after the system and user files
    #[arg(long = "config", value_name = "FILE", global = true)]
    config_files: Vec<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build source packages, each in a fresh root
    Build {
        #[arg(short, long)]
        target: Option<String>,
        /// Batch id, generated from the time and user name by default
        #[arg(long)]
        id: Option<String>,
        /// Build inside an existing root instead (default: the latest one)
        #[arg(long, value_name = "ROOT", num_args = 0..=1, default_missing_value = "latest")]
        reuse: Option<String>,
        /// Stop at this rpmbuild stage and open a shell in the root
        #[arg(short, long)]
        stage: Option<BuildStage>,
        /// Seconds the build step may take
        #[arg(long)]
        timeout: Option<u64>,
        /// Keep the root after the build
        #[arg(short, long)]
        keep: bool,
        /// Continue with the remaining packages after a failure
        #[arg(long)]
        keep_building: bool,
        /// Copy build output to the terminal
        #[arg(long)]
        tee: bool,
        #[arg(required = true)]
        packages: Vec<PathBuf>,
    },
    /// Open a shell in an interactive root
    Shell {
        #[arg(short, long)]
        target: Option<String>,
        /// Root name (default: a new root, or the latest interactive one)
        #[arg(long)]
        id: Option<String>,
        /// Create a new root
        #[arg(long)]
        fresh: bool,
    },
    /// Copy files into the builder's home of an interactive root
    Put {
        #[arg(short, long)]
        target: Option<String>,
        /// Root name (default: the latest interactive one)
        #[arg(long)]
        id: Option<String>,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// List active, kept and old roots
    ListRoots {
        #[arg(short, long)]
        target: Option<String>,
    },
    /// Keep a root instead of letting it become old
    Keep {
        #[arg(short, long)]
        target: Option<String>,
        root: String,
    },
    /// Remove old roots
    Gc {
        #[arg(short, long)]
        target: Option<String>,
        #[arg(long)]
        dry_run: bool,
        /// Remove roots older than this (default: old-roots-max-age-days)
        #[arg(long)]
        max_age_days: Option<u64>,
    },
    /// Check host tools and permissions of every target
    Check,
    /// List configured targets
    Targets,
}

fn init_logging(cli: &Cli) {
    let level = if cli.verbose {
        LevelFilter::Debug
    } else if cli.quiet {
        LevelFilter::Warn
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format_target(false)
        .format_timestamp(None)
        .parse_default_env()
        .init();
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::standard()?;
    for path in &cli.config_files {
        config.load(path)?;
    }
    for option in &cli.options {
        config
            .set_option(option)
            .with_context(|| format!("applying option {option}"))?;
    }
    Ok(config)
}

fn run(cli: Cli) -> Result<u8> {
    let jurt = Jurt::new(load_config(&cli)?);

    match cli.command {
        Commands::Build {
            target,
            id,
            reuse,
            stage,
            timeout,
            keep,
            keep_building,
            tee,
            packages,
        } => {
            let opts = BuildOptions {
                id,
                reuse,
                stage,
                timeout,
                keep_root: keep,
                keep_building,
                tee,
            };
            let report = jurt.build(&packages, target.as_deref(), &opts)?;
            for result in &report.results {
                let status = if result.success { "OK" } else { "FAILED" };
                println!("{status} {}", result.source_id);
                if let Some(reason) = &result.failure {
                    println!("   {reason}");
                }
            }
            println!("results in {}", report.delivery.display());
            if !report.all_succeeded() {
                return Ok(BUILD_FAILED_EXIT);
            }
        }
        Commands::Shell { target, id, fresh } => {
            let root = jurt.shell(target.as_deref(), id.as_deref(), fresh, false)?;
            println!("left root {root}");
        }
        Commands::Put { target, id, files } => {
            for placed in jurt.put(target.as_deref(), &files, id.as_deref())? {
                println!("{placed}");
            }
        }
        Commands::ListRoots { target } => {
            for (state, name) in jurt.list_roots(target.as_deref())? {
                println!("{state:<8}{name}");
            }
        }
        Commands::Keep { target, root } => {
            let root = jurt.keep(target.as_deref(), &root)?;
            println!("{} will be kept ({})", root.name, root.path.display());
        }
        Commands::Gc {
            target,
            dry_run,
            max_age_days,
        } => {
            let max_age = max_age_days.map(|days| Duration::from_secs(days * 24 * 3600));
            for path in jurt.gc(target.as_deref(), max_age, dry_run)? {
                println!("{}", path.display());
            }
        }
        Commands::Check => {
            for path in jurt.config().loaded_files() {
                log::info!("configuration loaded from {}", path.display());
            }
            for cfg in jurt.config().targets()? {
                preflight::check_target_tools(&cfg)?;
            }
            for name in jurt.check_permissions()? {
                println!("target {name}: OK");
            }
        }
        Commands::Targets => {
            for name in jurt.target_names() {
                println!("{name}");
            }
        }
    }
    Ok(0)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);
    if let Err(e) = interrupt::install_handler() {
        log::warn!("{e:#}");
    }

    match run(cli) {
        Ok(status) => ExitCode::from(status),
        Err(e) if is_interrupted(&e) => {
            eprintln!("interrupted");
            ExitCode::from(INTERRUPTED_EXIT)
        }
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(ERROR_EXIT)
        }
    }
}
