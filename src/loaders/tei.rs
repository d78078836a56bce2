//! Streaming loader for TEI-style XML lexicons.
//!
//! Scans the file line by line for `<entry>` elements and extracts the
//! lexical children (`<orth>`, `<pron>`, `<gramGrp>`, `<def>`, `<etym>`)
//! with a small tag scanner. Only the current entry is buffered, so memory
//! stays constant in the file size.

use super::{reject_compressed, LoadError, Loader, RecordStream};
use crate::records::{Origin, RawRecord};
use serde_json::json;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::Path;

/// Upper bound on a single buffered `<entry>` element.
const MAX_ENTRY_BYTES: usize = 1 << 20;

/// Streams `<entry>` elements from a TEI lexicon.
pub struct TeiLoader;

impl Loader for TeiLoader {
    fn load(&self, path: &Path, source_id: &str) -> Result<RecordStream, LoadError> {
        reject_compressed(path)?;
        let file = File::open(path).map_err(|err| LoadError::io(path, err))?;
        Ok(Box::new(TeiStream {
            lines: BufReader::new(file).lines(),
            source_id: source_id.to_string(),
            file_path: path.display().to_string(),
            line_no: 0,
            carry: String::new(),
            entry_buf: None,
            entry_start_line: 0,
        }))
    }
}

struct TeiStream {
    lines: Lines<BufReader<File>>,
    source_id: String,
    file_path: String,
    line_no: u64,
    /// Unconsumed tail of the current physical line.
    carry: String,
    entry_buf: Option<String>,
    entry_start_line: u64,
}

impl Iterator for TeiStream {
    type Item = Result<RawRecord, LoadError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.carry.is_empty() {
                let line = match self.lines.next() {
                    Some(Ok(line)) => line,
                    Some(Err(err)) => {
                        self.line_no += 1;
                        return Some(Err(LoadError::record(
                            self.line_no,
                            format!("unreadable line: {err}"),
                        )));
                    }
                    None => return None,
                };
                self.line_no += 1;
                self.carry = line;
                self.carry.push('\n');
            }

            if self.entry_buf.is_none() {
                match find_tag_open(&self.carry, "entry") {
                    Some(open) => {
                        self.entry_start_line = self.line_no;
                        self.entry_buf = Some(String::new());
                        self.carry.drain(..open);
                    }
                    None => self.carry.clear(),
                }
                continue;
            }

            if let Some(close) = self.carry.find("</entry>") {
                let end = close + "</entry>".len();
                let consumed: String = self.carry.drain(..end).collect();
                let mut entry_xml = self.entry_buf.take().unwrap_or_default();
                entry_xml.push_str(&consumed);
                return Some(self.parse_entry(&entry_xml));
            }

            let buf = self.entry_buf.as_mut().expect("entry buffer present");
            buf.push_str(&self.carry);
            self.carry.clear();
            if buf.len() > MAX_ENTRY_BYTES {
                self.entry_buf = None;
                return Some(Err(LoadError::record(
                    self.entry_start_line,
                    "entry element exceeds buffer limit",
                )));
            }
        }
    }
}

impl TeiStream {
    fn parse_entry(&self, entry_xml: &str) -> Result<RawRecord, LoadError> {
        let headword = element_text(entry_xml, "orth").unwrap_or_default();
        if headword.trim().is_empty() {
            return Err(LoadError::record(
                self.entry_start_line,
                "entry has no <orth> headword",
            ));
        }

        let language = attribute_value(entry_xml, "entry", "xml:lang")
            .unwrap_or_else(|| default_language(&self.source_id).to_string());

        let definitions = all_element_texts(entry_xml, "def");
        let pos_tag = element_text(entry_xml, "gramGrp")
            .or_else(|| element_text(entry_xml, "pos"))
            .unwrap_or_default();

        let payload = json!({
            "headword": headword.trim(),
            "language": language,
            "ipa": element_text(entry_xml, "pron").unwrap_or_default().trim(),
            "definition": definitions.join(" | "),
            "etymology": element_text(entry_xml, "etym").unwrap_or_default().trim(),
            "pos_tag": pos_tag.trim(),
            "source_type": "tei",
        });

        Ok(RawRecord::new(
            self.source_id.clone(),
            payload,
            Origin {
                file_path: self.file_path.clone(),
                line_no: self.entry_start_line,
            },
        ))
    }
}

/// Classical-lexicon convention: Greek sources carry `grc`, otherwise Latin.
fn default_language(source_id: &str) -> &'static str {
    if source_id.to_lowercase().contains("greek") {
        "grc"
    } else {
        "la"
    }
}

/// Byte offset of `<tag ...>` or `<tag>` in `input`, if present.
fn find_tag_open(input: &str, tag: &str) -> Option<usize> {
    let mut search_from = 0;
    while let Some(found) = input[search_from..].find('<') {
        let at = search_from + found;
        let after = &input[at + 1..];
        if after.starts_with(tag) {
            let boundary = after.as_bytes().get(tag.len()).copied();
            if matches!(boundary, Some(b' ') | Some(b'>') | Some(b'\t')) {
                return Some(at);
            }
        }
        search_from = at + 1;
    }
    None
}

/// Text content of the first `<tag>` element, nested markup stripped.
fn element_text(xml: &str, tag: &str) -> Option<String> {
    let open = find_tag_open(xml, tag)?;
    let after_open = &xml[open..];
    let content_start = open + after_open.find('>')? + 1;
    if after_open[..content_start - open].ends_with("/>") {
        return Some(String::new());
    }
    let close = format!("</{tag}>");
    let content_end = content_start + xml[content_start..].find(&close)?;
    Some(decode_entities(&strip_tags(&xml[content_start..content_end])))
}

/// Text content of every `<tag>` element, in document order.
fn all_element_texts(xml: &str, tag: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = xml;
    while let Some(text) = element_text(rest, tag) {
        let close = format!("</{tag}>");
        let advance = match rest.find(&close) {
            Some(at) => at + close.len(),
            None => break,
        };
        let trimmed = text.trim().to_string();
        if !trimmed.is_empty() {
            out.push(trimmed);
        }
        rest = &rest[advance..];
    }
    out
}

/// Value of `attr` on the first `<tag ...>` element.
fn attribute_value(xml: &str, tag: &str, attr: &str) -> Option<String> {
    let open = find_tag_open(xml, tag)?;
    let after_open = &xml[open..];
    let tag_end = after_open.find('>')?;
    let tag_text = &after_open[..tag_end];
    let needle = format!("{attr}=\"");
    let value_start = tag_text.find(&needle)? + needle.len();
    let value_end = tag_text[value_start..].find('"')?;
    Some(tag_text[value_start..value_start + value_end].to_string())
}

fn strip_tags(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_tag = false;
    for ch in input.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out
}

fn decode_entities(input: &str) -> String {
    let mut decoded = input.to_string();
    for (entity, replacement) in [
        ("&amp;", "&"),
        ("&lt;", "<"),
        ("&gt;", ">"),
        ("&quot;", "\""),
        ("&apos;", "'"),
    ] {
        decoded = decoded.replace(entity, replacement);
    }
    crate::cleaners::collapse_whitespace(&decoded)
}
