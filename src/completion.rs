//! # Shell Completion Module
//!
//! Completion scripts for the supported shells, generated by `clap_complete`
//! from the CLI definition, plus the track id listing used by the hidden
//! `complete-tracks` command.
//!
//! ## Usage
//!
//! ```bash
//! # Generate bash completions
//! muse-engine completion bash > ~/.local/share/bash-completion/completions/muse-engine
//!
//! # Generate zsh completions
//! muse-engine completion zsh > ~/.config/zsh/completions/_muse-engine
//! ```

use anyhow::Result;
use clap::Command;
use clap_complete::{generate, Generator, Shell as CompletionShell};
use std::io;
use std::path::Path;

use crate::catalog::JsonCatalog;
use crate::cli::Shell;

/// Generate shell completions for the given shell
pub fn generate_completions<G: Generator>(gen: G, cmd: &mut Command) {
    generate(gen, cmd, cmd.get_name().to_string(), &mut io::stdout());
}

/// Convert our Shell enum to clap_complete's Shell enum
pub fn shell_to_completion_shell(shell: Shell) -> CompletionShell {
    match shell {
        Shell::Bash => CompletionShell::Bash,
        Shell::Zsh => CompletionShell::Zsh,
        Shell::Fish => CompletionShell::Fish,
        Shell::PowerShell => CompletionShell::PowerShell,
        Shell::Elvish => CompletionShell::Elvish,
    }
}

/// Track ids of a catalog, sorted, each with its display name.
///
/// A missing or unreadable catalog yields no completions.
pub fn track_completions(catalog: &Path) -> Vec<(String, String)> {
    let Ok(catalog) = JsonCatalog::load(catalog) else {
        return Vec::new();
    };
    let mut completions: Vec<(String, String)> = catalog
        .tracks()
        .iter()
        .map(|t| (t.id.clone(), t.display_name()))
        .collect();
    completions.sort();
    completions
}

/// Print completions as `id<TAB>description`, the format fish and zsh accept.
pub fn print_track_completions(catalog: &Path) -> Result<()> {
    for (id, name) in track_completions(catalog) {
        println!("{id}\t{}", name.replace(['\t', '\n'], " "));
    }
    Ok(())
}
