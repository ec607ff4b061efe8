//! CLI argument parsing for callprof

use crate::dump::DumpFormat;
use crate::measurer::MeasureMode;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "callprof")]
#[command(version)]
#[command(about = "Call-stack profiler: replay recorded call events into call trees", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable debug tracing output to stderr
    #[arg(long, global = true)]
    pub debug: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Replay a JSON-lines event stream and write the resulting profile dump
    Replay(ReplayArgs),
}

#[derive(Args, Debug)]
pub struct ReplayArgs {
    /// Event stream, one JSON event per line
    #[arg(value_name = "EVENTS")]
    pub events: PathBuf,

    /// Profile configuration file (TOML)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Write the dump to this file instead of stdout
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Dump encoding
    #[arg(long, value_enum, default_value = "json")]
    pub format: DumpFormat,

    /// Override the configured measure mode
    #[arg(short = 'm', long = "measure-mode", value_enum)]
    pub measure_mode: Option<MeasureMode>,

    /// Thread filter (e.g., include=1,2 or exclude=3)
    #[arg(short = 't', long = "threads", value_name = "EXPR")]
    pub threads: Option<String>,

    /// Exclude a method, given as OWNER#MEMBER (repeatable)
    #[arg(short = 'x', long = "exclude", value_name = "METHOD")]
    pub exclude: Vec<String>,

    /// Record allocation events
    #[arg(long = "track-allocations")]
    pub track_allocations: bool,

    /// Fold fiber contexts into their thread after stopping
    #[arg(long = "merge-fibers")]
    pub merge_fibers: bool,
}
