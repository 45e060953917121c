//! grf — heap object reference analyzer.
//!
//! Thin shell over `grf-core`: parse arguments, configure logging and the reference
//! depth, reach the target through the debugger facade, run the scan, and report.

mod args;

use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use grf_core::target::AttachConfig;
use grf_utils::{init_logging, init_logging_with_level, LogFormat, LogLevel};

use args::{Args, Command};

fn main() -> ExitCode
{
    let args = Args::parse();

    let logging = if args.verbose {
        init_logging_with_level(LogLevel::Debug, LogFormat::Pretty)
    } else {
        init_logging()
    };
    if let Err(err) = logging {
        eprintln!("Failed to initialize logging: {err}");
        return ExitCode::FAILURE;
    }

    match args.command {
        Command::Attach {
            pid,
            executable,
            max_depth,
            out,
        } => run(
            AttachConfig {
                pid: Some(pid),
                executable,
                core: None,
            },
            max_depth,
            out,
        ),
        Command::Core {
            executable,
            core,
            max_depth,
            out,
        } => run(
            AttachConfig {
                pid: None,
                executable: Some(executable),
                core: Some(core),
            },
            max_depth,
            out,
        ),
        Command::Version => {
            println!("grf {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
    }
}

fn run(config: AttachConfig, max_depth: Option<usize>, out: PathBuf) -> ExitCode
{
    if let Some(depth) = max_depth {
        info!("set max reference depth to {depth}");
        grf_core::config::set_max_ref_depth(depth);
    }

    let target = match grf_core::create_target(&config) {
        Ok(target) => target,
        Err(err) => {
            error!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let file = match File::create(&out) {
        Ok(file) => file,
        Err(err) => {
            error!("cannot create {}: {err}", out.display());
            return ExitCode::FAILURE;
        }
    };

    match grf_core::analyze(target.as_ref(), file) {
        Ok(()) => {
            info!("successfully output to `{}`", out.display());
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}
