//! Terminal output for `plot`. Status lines go to stdout; prompts use dialoguer.

use console::style;
use dialoguer::{theme::ColorfulTheme, Confirm, Input};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

fn theme() -> ColorfulTheme {
    ColorfulTheme::default()
}

pub fn success(msg: &str) {
    println!("{} {}", style("✔").green(), msg);
}

pub fn error(msg: &str) {
    eprintln!("{} {}", style("✖").red(), msg);
}

pub fn warning(msg: &str) {
    eprintln!("{} {}", style("!").yellow().bold(), msg);
}

pub fn info(msg: &str) {
    println!("  {}", style(msg).dim());
}

pub fn header(title: &str) {
    println!("\n  {}\n", style(title).bold());
}

/// Numbered list, followed by a blank line.
pub fn steps(items: &[&str]) {
    for (n, item) in items.iter().enumerate() {
        println!("  {} {}", style(format!("{}.", n + 1)).cyan(), item);
    }
    println!();
}

pub fn prompt_input(prompt: &str) -> anyhow::Result<String> {
    Ok(Input::<String>::with_theme(&theme()).with_prompt(prompt).interact_text()?)
}

/// Yes/no question, defaulting to yes.
pub fn prompt_confirm(prompt: &str) -> anyhow::Result<bool> {
    Ok(Confirm::with_theme(&theme()).with_prompt(prompt).default(true).interact()?)
}

pub fn spinner(message: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    if let Ok(template) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
        bar.set_style(template);
    }
    bar.set_message(message.to_string());
    bar.enable_steady_tick(Duration::from_millis(80));
    bar
}

/// One log line, with the level colored.
pub fn log_line(timestamp: &str, level: &str, message: &str) {
    let padded = format!("{:>5}", level);
    let level = match level {
        "error" => style(padded).red(),
        "warn" => style(padded).yellow(),
        "debug" | "trace" => style(padded).dim(),
        _ => style(padded).cyan(),
    };
    println!("{} {} {}", style(timestamp).dim(), level, message);
}
