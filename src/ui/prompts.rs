//! ui::prompts
//!
//! Interactive confirmations.
//!
//! # Design
//!
//! Prompts are only shown in interactive mode. In non-interactive mode,
//! operations requiring user input must either have defaults or fail
//! with a clear error message.

use std::io::{self, BufRead, Write};

use thiserror::Error;

/// Errors from prompts.
#[derive(Debug, Error)]
pub enum PromptError {
    #[error("not in interactive mode")]
    NotInteractive,

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

/// Prompt for confirmation (yes/no) on stdin.
///
/// An empty answer takes `default`.
///
/// # Errors
///
/// Returns [`PromptError::NotInteractive`] if not in interactive mode.
pub fn confirm(message: &str, default: bool, interactive: bool) -> Result<bool, PromptError> {
    if !interactive {
        return Err(PromptError::NotInteractive);
    }

    let hint = if default { "[Y/n]" } else { "[y/N]" };
    let mut stderr = io::stderr();
    write!(stderr, "{} {} ", message, hint)?;
    stderr.flush()?;

    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(parse_answer(&answer, default))
}

fn parse_answer(answer: &str, default: bool) -> bool {
    match answer.trim().to_ascii_lowercase().as_str() {
        "" => default,
        "y" | "yes" => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_interactive_refuses() {
        assert!(matches!(
            confirm("delete?", false, false),
            Err(PromptError::NotInteractive)
        ));
    }

    #[test]
    fn answers() {
        assert!(parse_answer("y\n", false));
        assert!(parse_answer(" YES ", false));
        assert!(!parse_answer("n", true));
        assert!(!parse_answer("maybe", true));
        assert!(parse_answer("\n", true));
        assert!(!parse_answer("", false));
    }
}
