use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::config::ColumnConfig;

pub const PAYLOAD_OFFSET_HEADER: &str = "payload_offset";
pub const PAYLOAD_LENGTH_HEADER: &str = "payload_length";

/// One index hit projected to the fields needed by a build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub blob_key: String,
    pub source: JsonMap<String, JsonValue>,
}

/// Byte range of one record's blob inside the payload file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadSegment {
    pub offset: u64,
    pub length: u64,
}

/// Maps a record to one metadata line. Implementations are pure.
pub trait RowEncoder: Send + Sync {
    /// Header line, terminated by `\n`.
    fn header(&self) -> String;

    /// Row line for `record`, terminated by `\n`.
    fn encode(&self, record: &Record, segment: PayloadSegment) -> String;
}

#[derive(Debug, Clone)]
struct Column {
    header: String,
    path: Vec<String>,
}

/// Tab-separated rows with configurable columns plus the payload segment.
#[derive(Debug, Clone)]
pub struct TsvRowEncoder {
    columns: Vec<Column>,
}

impl TsvRowEncoder {
    pub fn new(columns: &[ColumnConfig]) -> Self {
        debug_assert!(!columns.is_empty());
        let columns = columns
            .iter()
            .map(|column| Column {
                header: column.header.clone(),
                path: column
                    .field
                    .split('.')
                    .map(str::to_string)
                    .filter(|segment| !segment.is_empty())
                    .collect(),
            })
            .collect();
        Self { columns }
    }

    pub fn column_count(&self) -> usize {
        self.columns.len() + 2
    }
}

impl RowEncoder for TsvRowEncoder {
    fn header(&self) -> String {
        let mut cells: Vec<String> = self
            .columns
            .iter()
            .map(|column| escape_cell(&column.header))
            .collect();
        cells.push(PAYLOAD_OFFSET_HEADER.to_string());
        cells.push(PAYLOAD_LENGTH_HEADER.to_string());
        finish_line(cells)
    }

    fn encode(&self, record: &Record, segment: PayloadSegment) -> String {
        let mut cells: Vec<String> = self
            .columns
            .iter()
            .map(|column| escape_cell(&render(lookup(&record.source, &column.path))))
            .collect();
        cells.push(segment.offset.to_string());
        cells.push(segment.length.to_string());
        finish_line(cells)
    }
}

fn finish_line(cells: Vec<String>) -> String {
    let mut line = cells.join("\t");
    line.push('\n');
    line
}

fn lookup<'a>(source: &'a JsonMap<String, JsonValue>, path: &[String]) -> Option<&'a JsonValue> {
    let (first, rest) = path.split_first()?;
    let mut current = source.get(first)?;
    for segment in rest {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn render(value: Option<&JsonValue>) -> String {
    match value {
        None | Some(JsonValue::Null) => String::new(),
        Some(JsonValue::String(text)) => text.clone(),
        Some(JsonValue::Array(items)) => items
            .iter()
            .map(|item| render(Some(item)))
            .collect::<Vec<_>>()
            .join(","),
        Some(other) => other.to_string(),
    }
}

fn escape_cell(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out
}
