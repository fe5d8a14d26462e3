//! Privileged helper, normally run through sudo.
//!
//! With `--agent` it serves requests from stdin until EOF, ending each reply
//! with the cookie sentinel on stderr. Otherwise the trailing arguments form
//! a single request and its status becomes the exit code.

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use log::LevelFilter;

use jurt::agent::server::run_agent;
use jurt::agent::{AgentRequest, Dispatcher};
use jurt::config::Config;
use jurt::error::INVALID_REQUEST_STATUS;

#[derive(Parser)]
#[command(author, version, about = "jurt privileged helper", long_about = None)]
struct Cli {
    /// Serve requests from stdin until it is closed
    #[arg(long)]
    agent: bool,
    /// Token tagging every reply sentinel
    #[arg(long, requires = "agent")]
    cookie: Option<String>,
    /// Log what would run without running it
    #[arg(long)]
    dry_run: bool,
    #[arg(short, long)]
    verbose: bool,
    /// One request: an operation and its flags, e.g. `--type mkdir -- /path`
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    request: Vec<String>,
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn run(cli: Cli) -> Result<u8> {
    let mut dispatcher =
        Dispatcher::new(Config::system()?, jurt::pm::standard_registry()).dry_run(cli.dry_run);

    if cli.agent {
        let cookie = cli.cookie.unwrap_or_default();
        if cookie.is_empty() {
            eprintln!("error: --agent requires --cookie");
            return Ok(INVALID_REQUEST_STATUS as u8);
        }
        run_agent(&cookie, &mut dispatcher)?;
        return Ok(0);
    }

    let req = match AgentRequest::from_args(cli.request) {
        Ok(req) => req,
        Err(e) => {
            eprintln!("error: {e}");
            return Ok(INVALID_REQUEST_STATUS as u8);
        }
    };
    let status = dispatcher.run_once(&req);
    Ok(u8::try_from(status).unwrap_or(1))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match run(cli) {
        Ok(status) => ExitCode::from(status),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
    }
}
