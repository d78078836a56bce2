//! Loader for comparative wordlist CSVs (concept column + language columns).

use super::delimited::DelimitedRows;
use super::{reject_compressed, LoadError, Loader, RecordStream};
use crate::records::{Origin, RawRecord};
use serde_json::json;
use std::collections::VecDeque;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Streams a Swadesh-style wordlist: the header row names a semantic concept
/// column and one column per language; every non-empty cell becomes one raw
/// record. Cells holding `-` mark absent forms and are skipped.
pub struct WordlistLoader;

impl Loader for WordlistLoader {
    fn load(&self, path: &Path, source_id: &str) -> Result<RecordStream, LoadError> {
        reject_compressed(path)?;
        let file = File::open(path).map_err(|err| LoadError::io(path, err))?;
        let mut rows = DelimitedRows::new(BufReader::new(file), ',');

        let header = rows
            .next_row()
            .map_err(|err| LoadError::io(path, err))?
            .ok_or_else(|| LoadError::format(path, "empty wordlist"))?
            .1;
        let concept_column = header
            .iter()
            .position(|name| name.trim().eq_ignore_ascii_case("concept"))
            .unwrap_or(0);
        if header.len() < 2 {
            return Err(LoadError::format(
                path,
                "wordlist needs a concept column and at least one language column",
            ));
        }

        Ok(Box::new(WordlistStream {
            rows,
            header,
            concept_column,
            source_id: source_id.to_string(),
            file_path: path.display().to_string(),
            pending: VecDeque::new(),
        }))
    }
}

struct WordlistStream {
    rows: DelimitedRows<BufReader<File>>,
    header: Vec<String>,
    concept_column: usize,
    source_id: String,
    file_path: String,
    pending: VecDeque<Result<RawRecord, LoadError>>,
}

impl Iterator for WordlistStream {
    type Item = Result<RawRecord, LoadError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(ready) = self.pending.pop_front() {
                return Some(ready);
            }
            let (line_no, fields) = match self.rows.next_row() {
                Ok(Some(row)) => row,
                Ok(None) => return None,
                Err(err) => {
                    return Some(Err(LoadError::record(0, format!("unreadable row: {err}"))))
                }
            };

            let concept = fields
                .get(self.concept_column)
                .map(|value| value.trim())
                .unwrap_or_default();

            for (column, cell) in fields.iter().enumerate() {
                if column == self.concept_column || column >= self.header.len() {
                    continue;
                }
                let headword = cell.trim();
                if headword.is_empty() || headword == "-" {
                    continue;
                }
                let language = self.header[column].trim();
                let payload = json!({
                    "headword": headword,
                    "language": language,
                    "concept": concept,
                    "definition": concept,
                    "source_type": "wordlist",
                });
                self.pending.push_back(Ok(RawRecord::new(
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn load_fixture(content: &str) -> Vec<RawRecord> {
        let mut file = NamedTempFile::new().expect("temp file");
        file.write_all(content.as_bytes()).expect("write");
        WordlistLoader
            .load(file.path(), "swadesh")
            .expect("stream opens")
            .map(|record| record.expect("record"))
            .collect()
    }

    #[test]
    fn each_cell_becomes_a_record() {
        let records = load_fixture("concept,en,de,la\nfather,father,vater,pater\nwater,water,wasser,aqua\n");
        assert_eq!(records.len(), 6);
        assert_eq!(records[0].field("headword"), Some("father"));
        assert_eq!(records[0].field("language"), Some("en"));
        assert_eq!(records[0].field("concept"), Some("father"));
        assert_eq!(records[2].field("headword"), Some("pater"));
        assert_eq!(records[2].field("language"), Some("la"));
        assert_eq!(records[3].origin.line_no, 3);
    }

    #[test]
    fn dashes_and_blanks_are_skipped() {
        let records = load_fixture("concept,en,de\nI,-,ich\nthou,thou,\n");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].field("headword"), Some("ich"));
        assert_eq!(records[1].field("headword"), Some("thou"));
    }

    #[test]
    fn empty_file_is_format_error() {
        let file = NamedTempFile::new().expect("temp file");
        let err = WordlistLoader
            .load(file.path(), "swadesh")
            .err()
            .expect("format error");
        assert!(matches!(err, LoadError::Format { .. }));
    }
}
