//! Operator-facing send and receive modes.
//!
//! These glue config, locale, logging, discovery and the transfer sessions
//! together and own all stdin prompting.

pub mod recv_mode;
pub mod send_mode;

use anyhow::{Context, Result};
use std::io::{self, BufRead, Write};

pub use recv_mode::{run_recv, RecvOptions};
pub use send_mode::{run_send, SendOptions};

/// Print `prompt` and read one trimmed line from stdin.
pub fn prompt_line(prompt: &str) -> Result<String> {
    let mut stdout = io::stdout();
    write!(stdout, "{}", prompt)?;
    stdout.flush()?;

    let mut line = String::new();
    let n = io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read from stdin")?;
    if n == 0 {
        anyhow::bail!("stdin closed");
    }
    Ok(line.trim().to_string())
}

/// Interpret a yes/no answer; empty means yes.
pub fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "" | "y" | "yes")
}
