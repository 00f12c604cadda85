//! Terminal color support for CLI output.
//!
//! Colors are only used when the stream they are written to is a terminal,
//! so piped frame data and scripted output stay plain.

use is_terminal::IsTerminal;
use owo_colors::OwoColorize;

/// Check if stdout is a terminal (interactive mode).
pub fn is_interactive() -> bool {
    std::io::stdout().is_terminal()
}

/// Check if stderr is a terminal (interactive mode).
pub fn is_stderr_interactive() -> bool {
    std::io::stderr().is_terminal()
}

/// Style for error messages.
pub fn error(msg: &str) -> String {
    if is_stderr_interactive() {
        format!("{} {}", "error:".red().bold(), msg)
    } else {
        format!("error: {}", msg)
    }
}

/// Style for progress notes on stderr.
pub fn note(msg: &str) -> String {
    if is_stderr_interactive() {
        format!("{}", msg.cyan())
    } else {
        msg.to_string()
    }
}

/// Style for bold text.
pub fn bold(msg: &str) -> String {
    if is_interactive() {
        format!("{}", msg.bold())
    } else {
        msg.to_string()
    }
}

/// Style for numeric values (frame counts, timestamps).
pub fn number(msg: &str) -> String {
    if is_interactive() {
        format!("{}", msg.cyan())
    } else {
        msg.to_string()
    }
}

/// Format ownership state of a bus name with color.
pub fn owned(owned: bool) -> String {
    let text = if owned { "running" } else { "not running" };
    if !is_interactive() {
        return text.to_string();
    }
    if owned {
        format!("{}", text.green())
    } else {
        format!("{}", text.dimmed())
    }
}
