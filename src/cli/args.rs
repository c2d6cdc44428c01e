//! cli::args
//!
//! Command-line argument definitions using clap derive.
//!
//! # Global Flags
//!
//! These flags are available on all commands:
//! - `--working-dir <path>`: Module directory (or stack root)
//! - `--config <path>`: User settings file
//! - `--module-config <path>`: Module configuration to use instead of the
//!   working directory's `stackguard.toml`
//! - `--substitute TOKEN=VALUE`: Placeholder value, repeatable
//! - `--var NAME=VALUE`: Tool variable, repeatable, overrides the config
//! - `--holder`, `--tool`, `--local-root`: Override user settings
//! - `--debug`: Enable debug logging
//! - `--quiet` / `-q`: Minimal output
//! - `--non-interactive`: Never prompt

use std::io::IsTerminal;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// stackguard - locking, remote state and stack orchestration for Terraform
#[derive(Parser, Debug)]
#[command(name = "stackguard")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Module directory (or stack root); defaults to the current directory
    #[arg(long, global = true, value_name = "DIR")]
    pub working_dir: Option<PathBuf>,

    /// User settings file; overrides the standard locations
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Module configuration file to use instead of `<working-dir>/stackguard.toml`;
    /// the tool still runs in the working directory
    #[arg(long, global = true, value_name = "FILE")]
    pub module_config: Option<PathBuf>,

    /// Replace TOKEN with VALUE in every configuration string
    #[arg(long = "substitute", global = true, value_name = "TOKEN=VALUE")]
    pub substitutions: Vec<String>,

    /// Pass `-var NAME=VALUE` to the tool, overriding configured vars
    #[arg(long = "var", global = true, value_name = "NAME=VALUE")]
    pub vars: Vec<String>,

    /// Lock holder identity (default: user@host)
    #[arg(long, global = true)]
    pub holder: Option<String>,

    /// Provisioning tool binary (default: terraform)
    #[arg(long, global = true)]
    pub tool: Option<String>,

    /// Root directory of the local backend
    #[arg(long, global = true, value_name = "DIR")]
    pub local_root: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Minimal output; implies --non-interactive
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Never prompt
    #[arg(long, global = true)]
    pub non_interactive: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Parser::parse()
    }

    /// Determine if interactive mode is enabled.
    ///
    /// False with `--non-interactive` or `--quiet`, otherwise true when
    /// stdin is a terminal.
    pub fn interactive(&self) -> bool {
        if self.non_interactive || self.quiet {
            false
        } else {
            std::io::stdin().is_terminal()
        }
    }
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Apply the module in the working directory
    #[command(
        long_about = "Apply the module in the working directory.\n\n\
            Bootstraps the remote state bucket and lock table if the module \
            configures them, acquires the module's lock, runs `init` and \
            `apply -auto-approve`, and releases the lock whether the tool \
            succeeds or fails.",
        after_help = "\
EXAMPLES:
    # Apply the module here
    stackguard apply

    # Apply another module, overriding a variable
    stackguard --working-dir live/qa/my-app --var env=qa apply"
    )]
    Apply,

    /// Plan the module in the working directory (takes no lock)
    Plan,

    /// Destroy the module in the working directory
    Destroy,

    /// Acquire the module's lock and keep it
    #[command(
        name = "acquire-lock",
        long_about = "Acquire the module's lock and keep it.\n\n\
            The lock stays held until `release-lock` is run by the same \
            holder. Other holders' `apply` and `destroy` wait and then fail \
            with \"Unable to acquire lock\"."
    )]
    AcquireLock,

    /// Release the module's lock if you hold it
    #[command(name = "release-lock")]
    ReleaseLock,

    /// Show who holds the module's lock
    #[command(name = "lock-status")]
    LockStatus,

    /// Apply every module under the working directory in dependency order
    #[command(
        name = "spin-up",
        visible_alias = "stack-apply",
        after_help = "\
EXAMPLES:
    # Apply a whole stack, dependencies first
    stackguard --working-dir live spin-up"
    )]
    SpinUp,

    /// Destroy every module under the working directory, dependents first
    #[command(name = "tear-down", visible_alias = "stack-destroy")]
    TearDown,

    /// Delete the module's state bucket (every version) and lock table
    #[command(
        long_about = "Delete the module's state bucket and lock table.\n\n\
            Every object version in the bucket is deleted, then the bucket, \
            then the lock table. This cannot be undone. Requires `--yes` when \
            not interactive."
    )]
    Cleanup {
        /// Keep the lock table
        #[arg(long)]
        keep_table: bool,

        /// Do not ask for confirmation
        #[arg(long, short = 'y')]
        yes: bool,
    },

    /// Generate shell completion scripts
    #[command(after_help = "\
EXAMPLES:
    # Bash
    stackguard completion bash > ~/.local/share/bash-completion/completions/stackguard

    # Zsh
    stackguard completion zsh > ~/.zfunc/_stackguard")]
    Completion {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Supported shells for completion
#[derive(clap::ValueEnum, Debug, Clone, Copy)]
#[allow(clippy::enum_variant_names)]
pub enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "stackguard",
            "apply",
            "--var",
            "env=qa",
            "--var",
            "size=small",
            "--substitute",
            "__FILL_IN_BUCKET_NAME__=my-bucket",
            "--holder",
            "ci@runner",
        ])
        .unwrap();
        assert!(matches!(cli.command, Command::Apply));
        assert_eq!(cli.vars, vec!["env=qa", "size=small"]);
        assert_eq!(cli.substitutions.len(), 1);
        assert_eq!(cli.holder.as_deref(), Some("ci@runner"));
    }

    #[test]
    fn stack_aliases() {
        let cli = Cli::try_parse_from(["stackguard", "stack-apply"]).unwrap();
        assert!(matches!(cli.command, Command::SpinUp));
        let cli = Cli::try_parse_from(["stackguard", "stack-destroy"]).unwrap();
        assert!(matches!(cli.command, Command::TearDown));
    }

    #[test]
    fn quiet_is_never_interactive() {
        let cli = Cli::try_parse_from(["stackguard", "-q", "plan"]).unwrap();
        assert!(!cli.interactive());
    }
}
