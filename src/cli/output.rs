//! Output helpers for consistent CLI formatting

use console::style;
use std::io::IsTerminal;

/// Whether stdout is a terminal that gets styled output
pub fn use_fancy_output() -> bool {
    std::io::stdout().is_terminal()
}

/// Display a success step with detail
pub fn step_ok_detail(message: &str, detail: &str) {
    println!("  {} {} ({})", style("[OK]").green(), message, style(detail).dim());
}

/// Display a warning step with hint
pub fn step_warn_hint(message: &str, hint: &str) {
    println!("  {} {} - {}", style("[WARN]").yellow(), message, style(hint).dim());
}

/// Print styled key-value pair
pub fn key_value(key: &str, value: &str) {
    if use_fancy_output() {
        println!("  {}: {}", style(key).dim(), value);
    } else {
        println!("  {}: {}", key, value);
    }
}

/// Display a section header
pub fn section(title: &str) {
    println!("{}", style(title).bold());
}
