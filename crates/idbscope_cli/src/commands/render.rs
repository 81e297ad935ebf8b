//! Text and JSON output.

use crate::error::CliResult;
use clap::ValueEnum;
use idbscope_core::{LifecycleEvent, Record, SessionSnapshot};
use serde::Serialize;
use serde_json::json;
use std::io::Write;

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Writes shell output in the chosen format.
pub struct Renderer<W: Write> {
    out: W,
    format: OutputFormat,
}

impl<W: Write> Renderer<W> {
    /// Creates a renderer over `out`.
    pub fn new(out: W, format: OutputFormat) -> Self {
        Self { out, format }
    }

    /// Writes a prompt without a newline; text output only.
    pub fn prompt(&mut self) -> CliResult<()> {
        if self.format == OutputFormat::Text {
            write!(self.out, "idbscope> ")?;
            self.out.flush()?;
        }
        Ok(())
    }

    /// Echoes a script line.
    pub fn echo(&mut self, line: &str) -> CliResult<()> {
        match self.format {
            OutputFormat::Text => writeln!(self.out, "> {line}")?,
            OutputFormat::Json => self.json(&json!({ "command": line }))?,
        }
        Ok(())
    }

    /// Writes one event log entry.
    pub fn event(&mut self, event: &LifecycleEvent) -> CliResult<()> {
        match self.format {
            OutputFormat::Text => writeln!(self.out, "  {event}")?,
            OutputFormat::Json => self.json(&json!({ "event": event }))?,
        }
        Ok(())
    }

    /// Writes the records of the active collection.
    pub fn records(&mut self, collection: Option<&str>, records: &[Record]) -> CliResult<()> {
        match self.format {
            OutputFormat::Text => {
                let name = collection.unwrap_or("-");
                if records.is_empty() {
                    writeln!(self.out, "{name}: (no records)")?;
                }
                for record in records {
                    writeln!(self.out, "{name}: {record}")?;
                }
            }
            OutputFormat::Json => self.json(&json!({
                "collection": collection,
                "records": records,
            }))?,
        }
        Ok(())
    }

    /// Writes the collection list, marking the active one.
    pub fn collections(&mut self, collections: &[String], active: Option<&str>) -> CliResult<()> {
        match self.format {
            OutputFormat::Text => {
                if collections.is_empty() {
                    writeln!(self.out, "(no collections)")?;
                }
                for name in collections {
                    let marker = if Some(name.as_str()) == active { '*' } else { ' ' };
                    writeln!(self.out, "{marker} {name}")?;
                }
            }
            OutputFormat::Json => self.json(&json!({
                "collections": collections,
                "active": active,
            }))?,
        }
        Ok(())
    }

    /// Writes a session snapshot.
    pub fn snapshot(&mut self, snapshot: &SessionSnapshot) -> CliResult<()> {
        match self.format {
            OutputFormat::Text => {
                writeln!(self.out, "state:      {}", snapshot.state)?;
                match &snapshot.identity {
                    Some(identity) => writeln!(self.out, "database:   {identity}")?,
                    None => writeln!(self.out, "database:   -")?,
                }
                writeln!(self.out, "collections: {}", snapshot.collections.join(", "))?;
                writeln!(
                    self.out,
                    "active:     {}",
                    snapshot.active_collection.as_deref().unwrap_or("-")
                )?;
                writeln!(self.out, "records:    {}", snapshot.projection.len())?;
                writeln!(
                    self.out,
                    "events:     {} (last #{})",
                    snapshot.event_count, snapshot.last_sequence
                )?;
            }
            OutputFormat::Json => self.json(&json!({ "snapshot": snapshot }))?,
        }
        Ok(())
    }

    /// Writes an informational line.
    pub fn message(&mut self, message: &str) -> CliResult<()> {
        match self.format {
            OutputFormat::Text => writeln!(self.out, "{message}")?,
            OutputFormat::Json => self.json(&json!({ "message": message }))?,
        }
        Ok(())
    }

    /// Writes a failed command.
    pub fn error(&mut self, error: &dyn std::error::Error) -> CliResult<()> {
        match self.format {
            OutputFormat::Text => writeln!(self.out, "error: {error}")?,
            OutputFormat::Json => self.json(&json!({ "error": error.to_string() }))?,
        }
        Ok(())
    }

    fn json<T: Serialize>(&mut self, value: &T) -> CliResult<()> {
        serde_json::to_writer(&mut self.out, value)?;
        writeln!(self.out)?;
        Ok(())
    }
}
