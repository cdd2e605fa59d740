//! Terminal output for agent replies, tool executions, and list tables.

use console::{measure_text_width, style};
use serde_json::Value;
use std::io::{self, Write};

const MAX_PARAMS_CHARS: usize = 50;
const MAX_RESULT_CHARS: usize = 500;

pub struct MessageDisplay<W: Write = io::Stdout> {
    out: W,
    show_tools: bool,
}

impl MessageDisplay<io::Stdout> {
    pub fn stdout(show_tools: bool) -> Self {
        Self::new(io::stdout(), show_tools)
    }
}

impl<W: Write> MessageDisplay<W> {
    pub fn new(out: W, show_tools: bool) -> Self {
        Self { out, show_tools }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    /// The agent's reply under its capitalised name.
    pub fn agent_reply(&mut self, agent_name: &str, text: &str) -> io::Result<()> {
        writeln!(
            self.out,
            "{}",
            style(format!("{}:", capitalize(agent_name))).bold().blue()
        )?;
        writeln!(self.out, "{}", text.trim_end())?;
        writeln!(self.out)?;
        self.out.flush()
    }

    /// One tool call and its (truncated) result. Silent unless tool output
    /// was requested.
    pub fn tool_execution(
        &mut self,
        tool_name: &str,
        args: &Value,
        result: &str,
        is_error: bool,
    ) -> io::Result<()> {
        if !self.show_tools {
            return Ok(());
        }
        let title = format!("{tool_name} {}", format_tool_params(args));
        let border = if is_error {
            style("│").red()
        } else {
            style("│").yellow()
        };
        writeln!(self.out, "{} {}", style("╭─").yellow(), style(title).bold().yellow())?;
        for line in truncate_chars(result, MAX_RESULT_CHARS).lines() {
            writeln!(self.out, "{border} {line}")?;
        }
        writeln!(self.out, "{}", style("╰─").yellow())?;
        writeln!(self.out)?;
        self.out.flush()
    }

    pub fn prompt_prefix(&mut self) -> io::Result<()> {
        write!(self.out, "{} ", style(">").bold().green())?;
        self.out.flush()
    }

    pub fn dim(&mut self, message: &str) -> io::Result<()> {
        writeln!(self.out, "{}", style(message).dim())
    }

    pub fn success(&mut self, message: &str) -> io::Result<()> {
        writeln!(self.out, "{} {message}", style("✓").green())
    }

    pub fn warning(&mut self, message: &str) -> io::Result<()> {
        writeln!(self.out, "{} {message}", style("Warning:").yellow())
    }

    pub fn error(&mut self, message: &str) -> io::Result<()> {
        writeln!(self.out, "{} {message}", style("Error:").red())
    }

    pub fn line(&mut self, message: &str) -> io::Result<()> {
        writeln!(self.out, "{message}")
    }

    /// Left-aligned columns sized to the widest cell.
    pub fn table(&mut self, headers: &[&str], rows: &[Vec<String>]) -> io::Result<()> {
        if rows.is_empty() {
            return self.dim("(none)");
        }
        let mut widths: Vec<usize> = headers.iter().map(|h| measure_text_width(h)).collect();
        for row in rows {
            for (i, cell) in row.iter().enumerate().take(widths.len()) {
                widths[i] = widths[i].max(measure_text_width(cell));
            }
        }

        let header_line = headers
            .iter()
            .zip(&widths)
            .map(|(h, w)| pad(h, *w))
            .collect::<Vec<_>>()
            .join("  ");
        writeln!(self.out, "{}", style(header_line.trim_end()).bold())?;
        let rule: usize = widths.iter().sum::<usize>() + 2 * widths.len().saturating_sub(1);
        writeln!(self.out, "{}", style("─".repeat(rule)).dim())?;

        for row in rows {
            let line = row
                .iter()
                .zip(&widths)
                .map(|(c, w)| pad(c, *w))
                .collect::<Vec<_>>()
                .join("  ");
            writeln!(self.out, "{}", line.trim_end())?;
        }
        Ok(())
    }
}

/// Compact JSON for a tool-call title, at most 50 chars.
pub fn format_tool_params(args: &Value) -> String {
    let params = args.to_string();
    truncate_chars(&params, MAX_PARAMS_CHARS)
}

/// Cut to `max` chars, ending in `...` when shortened.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let keep = max.saturating_sub(3);
    let mut out: String = s.chars().take(keep).collect();
    out.push_str("...");
    out
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn pad(s: &str, width: usize) -> String {
    let len = measure_text_width(s);
    format!("{s}{}", " ".repeat(width.saturating_sub(len)))
}
