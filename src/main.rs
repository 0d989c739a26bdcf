//! Binary entry point for the `bladelink` CLI.

use std::io::{self, Write};
use std::process;
use std::time::Duration;

use clap::Parser;
use shell_escape::unix::escape;
use thiserror::Error;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use bladelink::{
    BladeError, CommandOptions, ConnectConfig, CopyOptions, SshConnection, VirtualBlades,
};

mod cli;

use cli::{Cli, Command, CopyFromCommand, CopyToCommand, RunCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Blade(#[from] BladeError),
    #[error("invalid command argument: {0}")]
    InvalidCommand(String),
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let exit_code = match dispatch(cli.command).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "bladelink=debug,info" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(io::stderr))
        .with(filter)
        .init();
}

async fn dispatch(command: Command) -> Result<(), CliError> {
    let config =
        ConnectConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    let blades = VirtualBlades::from_config(&config)?;
    debug!(build_dir = %blades.build_dir(), "loaded provider configuration");

    match command {
        Command::List => list(&blades, io::stdout()),
        Command::Run(args) => run(&blades, args).await,
        Command::CopyTo(args) => copy_to(&blades, args).await,
        Command::CopyFrom(args) => copy_from(&blades, &args).await,
    }
}

fn list(blades: &VirtualBlades, mut out: impl Write) -> Result<(), CliError> {
    for blade_type in blades.blade_types() {
        for instance in 0..blades.blade_count(&blade_type)? {
            let hostname = blades.blade_hostname(&blade_type, instance)?;
            writeln!(out, "{blade_type}\t{instance}\t{hostname}")?;
        }
    }
    Ok(())
}

async fn run(blades: &VirtualBlades, args: RunCommand) -> Result<(), CliError> {
    validate_command_args(&args.command)?;
    let remote_command = render_remote_command(&args.command);
    let selected = selection(args.blade_type.as_deref());
    let set = blades.ssh_connect_blades(selected.as_deref(), None).await?;
    let mut options = CommandOptions::default().with_timeout(args.timeout.map(Duration::from_secs));
    options.logname = args.logname;
    set.run_command(&remote_command, &options, args.blade_type.as_deref())
        .await?;
    Ok(())
}

async fn copy_to(blades: &VirtualBlades, args: CopyToCommand) -> Result<(), CliError> {
    let selected = selection(args.blade_type.as_deref());
    let set = blades.ssh_connect_blades(selected.as_deref(), None).await?;
    let mut options = CopyOptions::default()
        .with_recurse(args.recurse)
        .with_timeout(args.timeout.map(Duration::from_secs));
    options.logname = args.logname;
    set.copy_to(
        &args.source,
        &args.destination,
        &options,
        args.blade_type.as_deref(),
    )
    .await?;
    Ok(())
}

async fn copy_from(blades: &VirtualBlades, args: &CopyFromCommand) -> Result<(), CliError> {
    let connection: SshConnection = blades
        .ssh_connect_blade(&args.blade_type, args.instance, None)
        .await?;
    connection
        .copy_from(
            &args.source,
            &args.destination,
            &CopyOptions::default().with_recurse(args.recurse),
        )
        .await?;
    Ok(())
}

fn selection(blade_type: Option<&str>) -> Option<Vec<String>> {
    blade_type.map(|name| vec![name.to_owned()])
}

fn render_remote_command(args: &[String]) -> String {
    args.iter()
        .map(|arg| escape(arg.as_str().into()).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn validate_command_args(args: &[String]) -> Result<(), CliError> {
    if args.iter().any(|arg| arg.chars().any(char::is_control)) {
        return Err(CliError::InvalidCommand(String::from(
            "command arguments must not contain control characters (newline, tab, NUL and similar)",
        )));
    }
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
