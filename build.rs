//! Build script rendering man pages for `bladelink` and its subcommands.
//!
//! Pages land in the build output directory: `bladelink.1` for the top-level
//! command and `bladelink-<subcommand>.1` for each subcommand.

use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

use cli::Cli;

fn render(command: clap::Command, out_dir: &Path, title: &str) -> std::io::Result<()> {
    let mut buffer = Vec::new();
    Man::new(command).title(title).render(&mut buffer)?;
    fs::write(out_dir.join(format!("{title}.1")), buffer)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = std::io::stdout();
    writeln!(stdout, "cargo:rerun-if-changed=build.rs")?;
    writeln!(stdout, "cargo:rerun-if-changed=src/cli/mod.rs")?;

    let out_dir = env::var_os("OUT_DIR")
        .map(PathBuf::from)
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "OUT_DIR was not set"))?;

    let top = Cli::command();
    for sub in top.get_subcommands() {
        let title = format!("bladelink-{}", sub.get_name());
        render(sub.clone(), &out_dir, &title)?;
    }
    render(top, &out_dir, "bladelink")?;

    Ok(())
}
