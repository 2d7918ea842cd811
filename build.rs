//! Build script generating the `ebsmount` man pages.
//!
//! One page is rendered for the top-level command and one per subcommand
//! (`ebsmount-mount.1`, `ebsmount-run.1`, ...) into the build output
//! directory for packaging.

use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

use cli::Cli;

fn render(
    command: clap::Command,
    title: &str,
    path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut buffer = Vec::new();
    Man::new(command).title(title).render(&mut buffer)?;
    fs::write(path, buffer)?;
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = std::io::stdout();
    writeln!(stdout, "cargo:rerun-if-changed=build.rs")?;
    writeln!(stdout, "cargo:rerun-if-changed=src/cli/mod.rs")?;

    let out_dir =
        PathBuf::from(env::var_os("OUT_DIR").ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "OUT_DIR was not set")
        })?);

    let root = Cli::command();
    for sub in root.get_subcommands() {
        let name = format!("ebsmount-{}", sub.get_name());
        render(sub.clone(), &name, &out_dir.join(format!("{name}.1")))?;
    }
    render(root, "ebsmount", &out_dir.join("ebsmount.1"))?;

    Ok(())
}
