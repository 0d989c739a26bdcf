//! Command-line interface definitions for the `bladelink` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Parser, Subcommand};

/// Top-level CLI for the `bladelink` binary.
#[derive(Debug, Parser)]
#[command(
    name = "bladelink",
    about = "Run commands and copy files across virtual blades through tunnelled SSH",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Log at debug level (overridden by `RUST_LOG`).
    #[arg(short, long, global = true)]
    pub(crate) verbose: bool,
    /// Operation to perform.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Subcommands of `bladelink`.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// List blade types and the hostnames of their instances.
    #[command(name = "list")]
    List,
    /// Run a command on every selected blade in parallel.
    #[command(name = "run")]
    Run(RunCommand),
    /// Copy a local file to every selected blade in parallel.
    #[command(name = "copy-to")]
    CopyTo(CopyToCommand),
    /// Copy a file from one blade to the local host.
    #[command(name = "copy-from")]
    CopyFrom(CopyFromCommand),
}

/// Arguments for `bladelink run`.
#[derive(Debug, Parser)]
pub(crate) struct RunCommand {
    /// Restrict the run to one blade type.
    #[arg(long, value_name = "TYPE")]
    pub(crate) blade_type: Option<String>,
    /// Prefix for the per-blade log files.
    #[arg(long, value_name = "NAME")]
    pub(crate) logname: Option<String>,
    /// Seconds to wait for each blade before terminating its command.
    #[arg(long, value_name = "SECS")]
    pub(crate) timeout: Option<u64>,
    /// Command to execute on each blade (use -- to separate flags). Placeholders
    /// such as `{blade_hostname}` and `{instance}` are filled per blade.
    #[arg(required = true, trailing_var_arg = true)]
    pub(crate) command: Vec<String>,
}

/// Arguments for `bladelink copy-to`.
#[derive(Debug, Parser)]
pub(crate) struct CopyToCommand {
    /// Copy directories recursively.
    #[arg(short, long)]
    pub(crate) recurse: bool,
    /// Restrict the copy to one blade type.
    #[arg(long, value_name = "TYPE")]
    pub(crate) blade_type: Option<String>,
    /// Prefix for the per-blade log files.
    #[arg(long, value_name = "NAME")]
    pub(crate) logname: Option<String>,
    /// Seconds to wait for each blade before terminating its copy.
    #[arg(long, value_name = "SECS")]
    pub(crate) timeout: Option<u64>,
    /// Local source path.
    pub(crate) source: String,
    /// Remote destination path.
    pub(crate) destination: String,
}

/// Arguments for `bladelink copy-from`.
#[derive(Debug, Parser)]
pub(crate) struct CopyFromCommand {
    /// Blade type to copy from.
    #[arg(long, value_name = "TYPE")]
    pub(crate) blade_type: String,
    /// Zero-based instance number to copy from.
    #[arg(long, value_name = "N", default_value_t = 0)]
    pub(crate) instance: usize,
    /// Copy directories recursively.
    #[arg(short, long)]
    pub(crate) recurse: bool,
    /// Remote source path.
    pub(crate) source: String,
    /// Local destination path.
    pub(crate) destination: String,
}
