use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Json,
    Pretty,
}

/// Print any serializable payload as a single JSON line.
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

pub fn print_json_pretty<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Field/value table for the pretty format.
pub fn print_kv(rows: &[(&str, String)]) {
    let width = rows.iter().map(|(k, _)| k.chars().count()).max().unwrap_or(0);
    for (key, value) in rows {
        let mut lines = value.lines();
        let first = lines.next().unwrap_or("");
        // Pad before colorizing so ANSI escapes do not skew the column.
        println!("{}  {}", format!("{key:>width$}").dimmed(), first);
        for continuation in lines {
            println!("{:>width$}  {}", "", continuation, width = width);
        }
    }
}

pub fn style_ok(text: &str) -> String {
    text.green().to_string()
}

pub fn style_warn(text: &str) -> String {
    text.yellow().to_string()
}

pub fn style_err(text: &str) -> String {
    text.red().bold().to_string()
}

pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        let keep = max_len.saturating_sub(3);
        let truncated: String = text.chars().take(keep).collect();
        format!("{truncated}...")
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_keeps_short_text() {
        assert_eq!(truncate_text("short", 10), "short");
    }

    #[test]
    fn truncate_adds_ellipsis() {
        assert_eq!(truncate_text("0123456789", 8), "01234...");
    }

    #[test]
    fn truncate_counts_chars_not_bytes() {
        let text = "héllöwörld!";
        let cut = truncate_text(text, 8);
        assert_eq!(cut.chars().count(), 8);
    }
}
