//! Line-delimited JSON loader for Wiktionary-style exports.

use super::{reject_compressed, LoadError, Loader, RecordStream};
use crate::records::{Origin, RawRecord};
use serde_json::{json, Value};
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::Path;

/// Streams one JSON object per line, projecting the Wiktionary export shape
/// (`word`, `lang_code`, `senses[].glosses[]`, `sounds[].ipa`,
/// `etymology_text`, `pos`) into the pipeline's raw payload shape.
pub struct JsonlLoader;

impl Loader for JsonlLoader {
    fn load(&self, path: &Path, source_id: &str) -> Result<RecordStream, LoadError> {
        reject_compressed(path)?;
        let file = File::open(path).map_err(|err| LoadError::io(path, err))?;
        Ok(Box::new(JsonlStream {
            lines: BufReader::new(file).lines(),
            source_id: source_id.to_string(),
            file_path: path.display().to_string(),
            line_no: 0,
        }))
    }
}

struct JsonlStream {
    lines: Lines<BufReader<File>>,
    source_id: String,
    file_path: String,
    line_no: u64,
}

impl Iterator for JsonlStream {
    type Item = Result<RawRecord, LoadError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(err) => {
                    self.line_no += 1;
                    return Some(Err(LoadError::record(
                        self.line_no,
                        format!("unreadable line: {err}"),
                    )));
                }
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }

            let parsed: Value = match serde_json::from_str(&line) {
                Ok(value) => value,
                Err(err) => {
                    return Some(Err(LoadError::record(
                        self.line_no,
                        format!("invalid JSON: {err}"),
                    )))
                }
            };

            return Some(match project_wiktionary(&parsed) {
                Ok(payload) => Ok(RawRecord::new(
                    self.source_id.clone(),
                    payload,
                    Origin {
                        file_path: self.file_path.clone(),
                        line_no: self.line_no,
                    },
                )),
                Err(message) => Err(LoadError::record(self.line_no, message)),
            });
        }
    }
}

/// Projects a Wiktionary export object into the raw payload shape. Errors
/// when the essential fields (headword, language) are missing or empty.
fn project_wiktionary(value: &Value) -> Result<Value, String> {
    let headword = value
        .get("word")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim();
    let language = value
        .get("lang_code")
        .or_else(|| value.get("lang"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim();

    if headword.is_empty() {
        return Err("missing headword".to_string());
    }
    if language.is_empty() {
        return Err("missing language".to_string());
    }

    let ipa = value
        .get("sounds")
        .and_then(Value::as_array)
        .and_then(|sounds| {
            sounds
                .iter()
                .find_map(|sound| sound.get("ipa").and_then(Value::as_str))
        })
        .unwrap_or_default();

    let mut glosses: Vec<&str> = Vec::new();
    if let Some(senses) = value.get("senses").and_then(Value::as_array) {
        for sense in senses {
            if let Some(found) = sense.get("glosses").and_then(Value::as_array) {
                glosses.extend(found.iter().filter_map(Value::as_str));
            }
        }
    }

    Ok(json!({
        "headword": headword,
        "language": language,
        "ipa": ipa,
        "definition": glosses.join(" | "),
        "etymology": value.get("etymology_text").and_then(Value::as_str).unwrap_or_default(),
        "pos_tag": value.get("pos").and_then(Value::as_str).unwrap_or_default(),
        "source_type": "wiktionary",
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_fixture(lines: &[&str]) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("temp file");
        for line in lines {
            writeln!(file, "{line}").expect("write line");
        }
        file
    }

    #[test]
    fn streams_wiktionary_records() {
        let fixture = write_fixture(&[
            r#"{"word":"father","lang_code":"en","pos":"noun","senses":[{"glosses":["male parent"]},{"glosses":["a priest"]}],"sounds":[{"ipa":"/ˈfɑːðər/"}],"etymology_text":"From Middle English fader"}"#,
            "",
            r#"{"word":"vater","lang":"de","senses":[{"glosses":["male parent"]}]}"#,
        ]);

        let records: Vec<_> = JsonlLoader
            .load(fixture.path(), "wikt")
            .expect("stream opens")
            .collect();
        assert_eq!(records.len(), 2);

        let first = records[0].as_ref().expect("first record");
        assert_eq!(first.field("headword"), Some("father"));
        assert_eq!(first.field("language"), Some("en"));
        assert_eq!(first.field("ipa"), Some("/ˈfɑːðər/"));
        assert_eq!(first.field("definition"), Some("male parent | a priest"));
        assert_eq!(first.origin.line_no, 1);

        let second = records[1].as_ref().expect("second record");
        assert_eq!(second.field("language"), Some("de"));
        assert_eq!(second.origin.line_no, 3);
    }

    #[test]
    fn bad_lines_surface_as_record_errors() {
        let fixture = write_fixture(&[
            "not json at all",
            r#"{"word":"","lang_code":"en"}"#,
            r#"{"word":"ok","lang_code":"en"}"#,
        ]);

        let results: Vec<_> = JsonlLoader
            .load(fixture.path(), "wikt")
            .expect("stream opens")
            .collect();
        assert_eq!(results.len(), 3);
        assert!(results[0].as_ref().unwrap_err().is_record());
        assert!(results[1].as_ref().unwrap_err().is_record());
        assert!(results[2].is_ok());
    }

    #[test]
    fn identical_lines_share_a_checksum() {
        let line = r#"{"word":"water","lang_code":"en","senses":[{"glosses":["clear liquid"]}]}"#;
        let fixture = write_fixture(&[line, line]);
        let records: Vec<_> = JsonlLoader
            .load(fixture.path(), "wikt")
            .expect("stream opens")
            .map(|r| r.expect("record"))
            .collect();
        assert_eq!(records[0].checksum, records[1].checksum);
        assert_ne!(records[0].origin.line_no, records[1].origin.line_no);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = JsonlLoader
            .load(Path::new("/nonexistent/dump.jsonl"), "wikt")
            .err()
            .expect("io error");
        assert!(matches!(err, LoadError::Io { .. }));
    }
}
