use std::io::Write;

use colloquy_client::{CharacterEntry, InvocationSnapshot};
use colloquy_protocol::{CharacterStatus, UsageMetrics};
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, Color, ContentArrangement, Table};
use console::style;
use serde_json::Value;

const PREVIEW_CHARS: usize = 80;

/// Writes only the part of the accumulated content not yet on screen.
#[derive(Default)]
pub struct StreamPrinter {
    printed: String,
    muted: bool,
}

impl StreamPrinter {
    pub fn mute(&mut self) {
        self.muted = true;
    }

    pub fn update(&mut self, content: &str) {
        let Some(delta) = self.delta(content) else {
            return;
        };
        if self.muted {
            return;
        }
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(delta.as_bytes());
        let _ = stdout.flush();
    }

    /// Content is cumulative. When it no longer extends what was printed
    /// (a new invocation, or a rewrite), start over on a fresh line.
    fn delta(&mut self, content: &str) -> Option<String> {
        if content == self.printed {
            return None;
        }
        let delta = match content.strip_prefix(self.printed.as_str()) {
            Some(rest) => rest.to_string(),
            None if self.printed.is_empty() => content.to_string(),
            None => format!("\n{content}"),
        };
        self.printed = content.to_string();
        Some(delta)
    }

    pub fn finish(&mut self) {
        if !self.printed.is_empty() && !self.muted {
            println!();
        }
        self.printed.clear();
    }
}

pub fn print_outcome(snapshot: &InvocationSnapshot, json: bool) -> anyhow::Result<()> {
    let structured = snapshot
        .structured_analysis
        .as_ref()
        .or(snapshot.analysis.as_ref());

    if json {
        let value = structured.cloned().unwrap_or(Value::Null);
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    if let Some(Value::Object(fields)) = snapshot.structured_analysis.as_ref() {
        println!();
        for (key, value) in fields {
            println!("{} {}", style(format!("{key}:")).bold(), display_value(value));
        }
    }
    if let Some(metrics) = &snapshot.metrics {
        println!("{}", style(metrics_line(metrics)).dim());
    }
    Ok(())
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) if items.iter().all(Value::is_string) => items
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}

pub fn metrics_line(metrics: &UsageMetrics) -> String {
    let mut parts = vec![format!(
        "{} tokens ({} in / {} out)",
        metrics.total_tokens, metrics.input_tokens, metrics.output_tokens
    )];
    if let Some(ms) = metrics.duration_ms {
        parts.push(format!("{ms} ms"));
    }
    if let Some(cost) = metrics.cost {
        parts.push(format!("${cost:.4}"));
    }
    parts.join(" · ")
}

fn status_cell(status: CharacterStatus) -> Cell {
    let (label, color) = match status {
        CharacterStatus::Pending => ("pending", Color::DarkGrey),
        CharacterStatus::Processing => ("processing", Color::Yellow),
        CharacterStatus::Streaming => ("streaming", Color::Cyan),
        CharacterStatus::Complete => ("complete", Color::Green),
        CharacterStatus::Error => ("error", Color::Red),
    };
    Cell::new(label).fg(color)
}

fn preview(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= PREVIEW_CHARS {
        return flat;
    }
    let cut: String = flat.chars().take(PREVIEW_CHARS - 1).collect();
    format!("{cut}…")
}

pub fn multi_character_table(entries: &[CharacterEntry]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Character", "Status", "Tokens", "Response"]);

    for entry in entries {
        let response = &entry.response;
        let tokens = response
            .metrics
            .as_ref()
            .map(|m| m.total_tokens.to_string())
            .unwrap_or_else(|| "-".into());
        let body = match &response.error {
            Some(error) => error.clone(),
            None => preview(&response.content),
        };
        table.add_row(vec![
            Cell::new(&entry.profile.name),
            status_cell(response.status),
            Cell::new(tokens),
            Cell::new(body),
        ]);
    }
    table
}
