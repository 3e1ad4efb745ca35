//! Shell completion generation for the drover CLI.

use std::io;

use anyhow::Result;
use clap::CommandFactory;
use clap_complete::{Shell, generate};

use crate::cli::{Cli, CompletionShell};

fn native_shell(shell: CompletionShell) -> Shell {
    match shell {
        CompletionShell::Bash => Shell::Bash,
        CompletionShell::Zsh => Shell::Zsh,
        CompletionShell::Fish => Shell::Fish,
    }
}

/// Write a completion script for `shell` to stdout.
pub fn print(shell: CompletionShell) -> Result<()> {
    let mut cmd = Cli::command();
    generate(native_shell(shell), &mut cmd, "drover", &mut io::stdout());
    Ok(())
}
