//! Loader for CLDF datasets (JSON metadata descriptor + delimited tables).

use super::delimited::DelimitedRows;
use super::{LoadError, Loader, RecordStream};
use crate::records::{Origin, RawRecord};
use serde_json::{json, Value};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Streams the FormTable of a CLDF dataset.
///
/// `path` may be the metadata descriptor itself or a dataset directory
/// containing `metadata.json`. The descriptor's `tables` array is searched
/// for the form table (by `dc:conformsTo` or file name); its rows are mapped
/// onto the raw payload shape via the declared column names.
pub struct CldfLoader;

impl Loader for CldfLoader {
    fn load(&self, path: &Path, source_id: &str) -> Result<RecordStream, LoadError> {
        let descriptor_path = if path.is_dir() {
            path.join("metadata.json")
        } else {
            path.to_path_buf()
        };

        let descriptor_file =
            File::open(&descriptor_path).map_err(|err| LoadError::io(&descriptor_path, err))?;
        let descriptor: Value = serde_json::from_reader(BufReader::new(descriptor_file))
            .map_err(|err| {
                LoadError::format(&descriptor_path, format!("invalid descriptor JSON: {err}"))
            })?;

        let (table_url, columns, delimiter) = find_form_table(&descriptor)
            .ok_or_else(|| LoadError::format(&descriptor_path, "no FormTable in descriptor"))?;

        let base_dir = descriptor_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let table_path = base_dir.join(&table_url);
        let table_file =
            File::open(&table_path).map_err(|err| LoadError::io(&table_path, err))?;
        let mut rows = DelimitedRows::new(BufReader::new(table_file), delimiter);

        // Header row may restate column order; prefer it when present.
        let header = rows
            .next_row()
            .map_err(|err| LoadError::io(&table_path, err))?
            .ok_or_else(|| LoadError::format(&table_path, "empty form table"))?
            .1;
        let column_names = if header.iter().any(|name| !name.trim().is_empty()) {
            header
        } else {
            columns
        };

        Ok(Box::new(CldfStream {
            rows,
            column_names,
            source_id: source_id.to_string(),
            file_path: table_path.display().to_string(),
        }))
    }
}

/// Locates the form table in a CLDF descriptor, returning its relative url,
/// declared column names, and field delimiter.
fn find_form_table(descriptor: &Value) -> Option<(String, Vec<String>, char)> {
    let tables = descriptor.get("tables")?.as_array()?;
    for table in tables {
        let url = table.get("url").and_then(Value::as_str)?;
        let conforms = table
            .get("dc:conformsTo")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if !conforms.contains("FormTable") && !url.to_lowercase().contains("form") {
            continue;
        }

        let columns: Vec<String> = table
            .get("tableSchema")
            .and_then(|schema| schema.get("columns"))
            .and_then(Value::as_array)
            .map(|columns| {
                columns
                    .iter()
                    .filter_map(|column| column.get("name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let delimiter = table
            .get("dialect")
            .and_then(|dialect| dialect.get("delimiter"))
            .and_then(Value::as_str)
            .and_then(|value| value.chars().next())
            .unwrap_or(',');

        return Some((url.to_string(), columns, delimiter));
    }
    None
}

struct CldfStream {
    rows: DelimitedRows<BufReader<File>>,
    column_names: Vec<String>,
    source_id: String,
    file_path: String,
}

impl CldfStream {
    fn column<'a>(&self, fields: &'a [String], name: &str) -> &'a str {
        self.column_names
            .iter()
            .position(|column| column.eq_ignore_ascii_case(name))
            .and_then(|idx| fields.get(idx))
            .map(|value| value.trim())
            .unwrap_or("")
    }
}

impl Iterator for CldfStream {
    type Item = Result<RawRecord, LoadError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (line_no, fields) = match self.rows.next_row() {
                Ok(Some(row)) => row,
                Ok(None) => return None,
                Err(err) => {
                    return Some(Err(LoadError::record(0, format!("unreadable row: {err}"))))
                }
            };

            let headword = self.column(&fields, "Form");
            let language = self.column(&fields, "Language_ID");
            if headword.is_empty() {
                return Some(Err(LoadError::record(line_no, "row has no Form value")));
            }
            if language.is_empty() {
                return Some(Err(LoadError::record(line_no, "row has no Language_ID")));
            }

            let payload = json!({
                "headword": headword,
                "language": language,
                "concept": self.column(&fields, "Parameter_ID"),
                "definition": self.column(&fields, "Parameter_ID"),
                "segments": self.column(&fields, "Segments"),
                "comment": self.column(&fields, "Comment"),
                "source_type": "cldf",
            });

            return Some(Ok(RawRecord::new(
                self.source_id.clone(),
                payload,
                Origin {
                    file_path: self.file_path.clone(),
                    line_no,
                },
            )));
        }
    }
}
