//! Shell completion scripts for the operator binary

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use clap::CommandFactory;
use clap_complete::{generate, shells};

use crate::cli::{Cli, CompletionShell};
use crate::error::CliError;

pub fn run_completions(shell: CompletionShell, output_path: Option<&Path>) -> Result<(), CliError> {
    let script = render_completions(shell);

    let Some(path) = output_path else {
        io::stdout().write_all(&script)?;
        return Ok(());
    };

    let target = completion_target(shell, path);
    if let Some(parent) = target.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(&target, &script)?;
    println!("{}", target.display());
    Ok(())
}

pub fn render_completions(shell: CompletionShell) -> Vec<u8> {
    let mut command = Cli::command();
    let name = command.get_name().to_string();
    let mut script = Vec::new();
    match shell {
        CompletionShell::Bash => generate(shells::Bash, &mut command, name, &mut script),
        CompletionShell::Zsh => generate(shells::Zsh, &mut command, name, &mut script),
        CompletionShell::Fish => generate(shells::Fish, &mut command, name, &mut script),
        CompletionShell::PowerShell => {
            generate(shells::PowerShell, &mut command, name, &mut script);
        }
    }
    script
}

/// File name each shell's completion loader picks up
pub const fn script_file_name(shell: CompletionShell) -> &'static str {
    match shell {
        CompletionShell::Bash => "crmsync.bash",
        CompletionShell::Zsh => "_crmsync",
        CompletionShell::Fish => "crmsync.fish",
        CompletionShell::PowerShell => "_crmsync.ps1",
    }
}

/// An existing directory receives the conventional file name
pub fn completion_target(shell: CompletionShell, path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join(script_file_name(shell))
    } else {
        path.to_path_buf()
    }
}
