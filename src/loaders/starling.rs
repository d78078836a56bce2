//! Loader for Starling-style backslash-marker dictionary files.

use super::{reject_compressed, LoadError, Loader, RecordStream};
use crate::records::{Origin, RawRecord};
use serde_json::{json, Value};
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::Path;

/// Parses blank-line-terminated blocks of `\marker value` lines.
///
/// Recognized markers: `\lx` headword, `\ph` phonetics, `\lg` language,
/// `\ps` part of speech, `\de` definition, `\et` etymology. A `\lx` line
/// also starts a new block, so files without blank separators still parse.
pub struct StarlingLoader;

impl Loader for StarlingLoader {
    fn load(&self, path: &Path, source_id: &str) -> Result<RecordStream, LoadError> {
        reject_compressed(path)?;
        let file = File::open(path).map_err(|err| LoadError::io(path, err))?;
        Ok(Box::new(StarlingStream {
            lines: BufReader::new(file).lines(),
            source_id: source_id.to_string(),
            file_path: path.display().to_string(),
            line_no: 0,
            block: Block::default(),
            done: false,
        }))
    }
}

#[derive(Default)]
struct Block {
    start_line: u64,
    headword: Option<String>,
    ipa: Option<String>,
    language: Option<String>,
    pos_tag: Option<String>,
    definition: Option<String>,
    etymology: Option<String>,
}

impl Block {
    fn is_empty(&self) -> bool {
        self.headword.is_none()
            && self.ipa.is_none()
            && self.language.is_none()
            && self.pos_tag.is_none()
            && self.definition.is_none()
            && self.etymology.is_none()
    }

    fn set(&mut self, marker: &str, value: &str) -> bool {
        let value = value.trim();
        let slot = match marker {
            "lx" => &mut self.headword,
            "ph" => &mut self.ipa,
            "lg" => &mut self.language,
            "ps" => &mut self.pos_tag,
            "de" => &mut self.definition,
            "et" => &mut self.etymology,
            _ => return false,
        };
        // Repeated markers within a block append with a separator.
        match slot {
            Some(existing) => {
                existing.push_str(" | ");
                existing.push_str(value);
            }
            None => *slot = Some(value.to_string()),
        }
        true
    }

    fn into_payload(self) -> Result<(u64, Value), String> {
        let headword = self.headword.as_deref().unwrap_or("").trim().to_string();
        if headword.is_empty() {
            return Err("block has no \\lx headword".to_string());
        }
        let payload = json!({
            "headword": headword,
            "ipa": strip_phonetic_brackets(self.ipa.as_deref().unwrap_or("")),
            "language": self.language.unwrap_or_default(),
            "pos_tag": self.pos_tag.unwrap_or_default(),
            "definition": self.definition.unwrap_or_default(),
            "etymology": self.etymology.unwrap_or_default(),
            "source_type": "starling",
        });
        Ok((self.start_line, payload))
    }
}

fn strip_phonetic_brackets(input: &str) -> String {
    input
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string()
}

struct StarlingStream {
    lines: Lines<BufReader<File>>,
    source_id: String,
    file_path: String,
    line_no: u64,
    block: Block,
    done: bool,
}

impl StarlingStream {
    fn emit(&mut self) -> Option<Result<RawRecord, LoadError>> {
        if self.block.is_empty() {
            return None;
        }
        let block = std::mem::take(&mut self.block);
        Some(match block.into_payload() {
            Ok((start_line, payload)) => Ok(RawRecord::new(
                self.source_id.clone(),
                payload,
                Origin {
                    file_path: self.file_path.clone(),
                    line_no: start_line,
                },
            )),
            Err(message) => Err(LoadError::record(self.line_no, message)),
        })
    }
}

impl Iterator for StarlingStream {
    type Item = Result<RawRecord, LoadError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let Some(line) = self.lines.next() else {
                self.done = true;
                return self.emit();
            };
            let line = match line {
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
            let trimmed = line.trim();

            if trimmed.is_empty() {
                if let Some(record) = self.emit() {
                    return Some(record);
                }
                continue;
            }

            let Some(rest) = trimmed.strip_prefix('\\') else {
                continue; // Stray text between blocks is ignored.
            };
            let (marker, value) = rest.split_once(' ').unwrap_or((rest, ""));

            if marker == "lx" && self.block.headword.is_some() {
                let finished = self.emit();
                self.block.start_line = self.line_no;
                self.block.set(marker, value);
                if let Some(record) = finished {
                    return Some(record);
                }
                continue;
            }

            if self.block.is_empty() {
                self.block.start_line = self.line_no;
            }
            self.block.set(marker, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn load_fixture(content: &str) -> Vec<Result<RawRecord, LoadError>> {
        let mut file = NamedTempFile::new().expect("temp file");
        file.write_all(content.as_bytes()).expect("write");
        StarlingLoader
            .load(file.path(), "star")
            .expect("stream opens")
            .collect()
    }

    #[test]
    fn parses_blocks_separated_by_blank_lines() {
        let records = load_fixture(
            "\\lx pater\n\\ph [ˈpa.ter]\n\\lg la\n\\ps noun\n\\de father\n\\et from PIE *ph₂tḗr\n\n\\lx mater\n\\lg la\n\\de mother\n",
        );
        assert_eq!(records.len(), 2);

        let first = records[0].as_ref().expect("first record");
        assert_eq!(first.field("headword"), Some("pater"));
        assert_eq!(first.field("ipa"), Some("ˈpa.ter"));
        assert_eq!(first.field("language"), Some("la"));
        assert_eq!(first.origin.line_no, 1);

        let second = records[1].as_ref().expect("second record");
        assert_eq!(second.field("headword"), Some("mater"));
        assert_eq!(second.origin.line_no, 8);
    }

    #[test]
    fn new_lx_marker_starts_a_new_block() {
        let records = load_fixture("\\lx aqua\n\\de water\n\\lx ignis\n\\de fire\n");
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[1].as_ref().unwrap().field("headword"),
            Some("ignis")
        );
    }

    #[test]
    fn block_without_headword_is_record_error() {
        let records = load_fixture("\\de orphaned definition\n\n\\lx ok\n\\de fine\n");
        assert_eq!(records.len(), 2);
        assert!(records[0].as_ref().unwrap_err().is_record());
        assert!(records[1].is_ok());
    }

    #[test]
    fn repeated_definitions_append() {
        let records = load_fixture("\\lx aqua\n\\de water\n\\de liquid\n");
        let record = records[0].as_ref().unwrap();
        assert_eq!(record.field("definition"), Some("water | liquid"));
    }
}
