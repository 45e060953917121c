//! CLI argument definitions

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "grf", about = "Heap object reference analysis for Go processes and core dumps")]
pub struct Args
{
    #[command(subcommand)]
    pub command: Command,

    /// Print verbose info and enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Command
{
    /// Attach to a running process and begin scanning object references
    Attach
    {
        /// Process ID to attach to
        pid: u32,

        /// Path to the target executable (read from the process if omitted)
        executable: Option<PathBuf>,

        /// Max reference depth shown in the profile
        #[arg(long = "max-depth")]
        max_depth: Option<usize>,

        /// Output file name
        #[arg(short, long, default_value = "grf.out")]
        out: PathBuf,
    },

    /// Scan a core dump together with its executable
    Core
    {
        /// Path to the executable that produced the core
        executable: PathBuf,

        /// Path to the core dump
        core: PathBuf,

        /// Max reference depth shown in the profile
        #[arg(long = "max-depth")]
        max_depth: Option<usize>,

        /// Output file name
        #[arg(short, long, default_value = "grf.out")]
        out: PathBuf,
    },

    /// Print version information
    Version,
}
