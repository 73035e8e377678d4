//! Event file loading: JSONL and CSV.
//!
//! JSONL carries one event object per line. CSV needs a header with
//! `user_id,op,day`; any `metadata.*` column is folded into the event's
//! metadata object. Field values containing commas are not supported by
//! the CSV path; use JSONL for arbitrary metadata.

use std::path::Path;

use serde_json::{Map, Value};

use crate::domain::event::{Event, Op};
use crate::{CountveilError, Result};

/// Load events from a path, dispatching on the file extension.
///
/// # Errors
/// `Validation` for malformed rows; `Io` when the file is unreadable.
pub fn load_events(path: &Path) -> Result<Vec<Event>> {
    let content = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("csv") => parse_csv(&content),
        _ => parse_jsonl(&content),
    }
}

fn parse_jsonl(content: &str) -> Result<Vec<Event>> {
    let mut events = Vec::new();
    for (number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let event: Event = serde_json::from_str(line).map_err(|e| {
            CountveilError::Validation(format!("line {}: {e}", number + 1))
        })?;
        events.push(event);
    }
    Ok(events)
}

fn parse_csv(content: &str) -> Result<Vec<Event>> {
    let mut lines = content.lines().enumerate();
    let header = loop {
        match lines.next() {
            Some((_, line)) if line.trim().is_empty() => continue,
            Some((_, line)) => break line,
            None => return Ok(Vec::new()),
        }
    };
    let columns: Vec<&str> = header.split(',').map(str::trim).collect();
    for required in ["user_id", "op", "day"] {
        if !columns.contains(&required) {
            return Err(CountveilError::Validation(format!(
                "csv header is missing the '{required}' column"
            )));
        }
    }

    let mut events = Vec::new();
    for (number, line) in lines {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != columns.len() {
            return Err(CountveilError::Validation(format!(
                "line {}: expected {} fields, got {}",
                number + 1,
                columns.len(),
                fields.len()
            )));
        }

        let mut user_id = None;
        let mut op = None;
        let mut day = None;
        let mut metadata = Map::new();
        for (column, field) in columns.iter().zip(&fields) {
            match *column {
                "user_id" => user_id = Some((*field).to_string()),
                "op" => op = Some(*field),
                "day" => day = Some(*field),
                other => {
                    if let Some(key) = other.strip_prefix("metadata.") {
                        if !field.is_empty() {
                            metadata.insert(key.to_string(), Value::String((*field).to_string()));
                        }
                    }
                }
            }
        }

        let op: Op = op.unwrap_or_default().parse().map_err(|e: String| {
            CountveilError::Validation(format!("line {}: {e}", number + 1))
        })?;
        let day: chrono::NaiveDate = day.unwrap_or_default().parse().map_err(|_| {
            CountveilError::Validation(format!("line {}: day must be YYYY-MM-DD", number + 1))
        })?;

        let mut event = Event::new(user_id.unwrap_or_default(), op, day);
        if !metadata.is_empty() {
            event.metadata = Value::Object(metadata);
        }
        events.push(event);
    }
    Ok(events)
}
