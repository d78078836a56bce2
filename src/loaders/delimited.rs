//! Minimal streaming reader for delimited text (CSV/TSV).
//!
//! Handles quoted fields, escaped quotes, and quoted newlines; reads one
//! row at a time from any `BufRead`.

use std::io::{self, BufRead};

/// Streaming row reader over delimiter-separated values.
pub struct DelimitedRows<R: BufRead> {
    reader: R,
    delimiter: char,
    line_no: u64,
}

impl<R: BufRead> DelimitedRows<R> {
    /// Wraps a reader with the given field delimiter.
    pub fn new(reader: R, delimiter: char) -> Self {
        Self {
            reader,
            delimiter,
            line_no: 0,
        }
    }

    /// Reads the next row, returning `(line_no, fields)`, or `None` at EOF.
    ///
    /// `line_no` is the 1-based line the row started on; quoted fields may
    /// span additional lines.
    pub fn next_row(&mut self) -> io::Result<Option<(u64, Vec<String>)>> {
        let mut line = String::new();
        loop {
            line.clear();
            let read = self.reader.read_line(&mut line)?;
            if read == 0 {
                return Ok(None);
            }
            self.line_no += 1;
            if !line.trim().is_empty() {
                break;
            }
        }
        let start_line = self.line_no;

        let mut fields = Vec::new();
        let mut field = String::new();
        let mut in_quotes = false;

        'row: loop {
            let mut chars = line.chars().peekable();
            while let Some(ch) = chars.next() {
                if in_quotes {
                    match ch {
                        '"' => {
                            if chars.peek() == Some(&'"') {
                                chars.next();
                                field.push('"');
                            } else {
                                in_quotes = false;
                            }
                        }
                        _ => field.push(ch),
                    }
                } else {
                    match ch {
                        '"' if field.is_empty() => in_quotes = true,
                        '\r' | '\n' => {
                            fields.push(std::mem::take(&mut field));
                            break 'row;
                        }
                        _ if ch == self.delimiter => {
                            fields.push(std::mem::take(&mut field));
                        }
                        _ => field.push(ch),
                    }
                }
            }

            if in_quotes {
                // Quoted newline: pull the next physical line into the field.
                field.push('\n');
                line.clear();
                let read = self.reader.read_line(&mut line)?;
                if read == 0 {
                    fields.push(std::mem::take(&mut field));
                    break;
                }
                self.line_no += 1;
            } else {
                // Line ended without a newline (EOF).
                fields.push(std::mem::take(&mut field));
                break;
            }
        }

        Ok(Some((start_line, fields)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn rows(input: &str, delimiter: char) -> Vec<Vec<String>> {
        let mut reader = DelimitedRows::new(Cursor::new(input.to_string()), delimiter);
        let mut out = Vec::new();
        while let Some((_, fields)) = reader.next_row().unwrap() {
            out.push(fields);
        }
        out
    }

    #[test]
    fn parses_plain_rows() {
        let parsed = rows("a,b,c\nd,e,f\n", ',');
        assert_eq!(parsed, vec![vec!["a", "b", "c"], vec!["d", "e", "f"]]);
    }

    #[test]
    fn parses_quoted_fields_and_escapes() {
        let parsed = rows("\"a,b\",\"say \"\"hi\"\"\",c\n", ',');
        assert_eq!(parsed, vec![vec!["a,b", "say \"hi\"", "c"]]);
    }

    #[test]
    fn quoted_newlines_stay_in_field() {
        let parsed = rows("\"line one\nline two\",x\n", ',');
        assert_eq!(parsed, vec![vec!["line one\nline two", "x"]]);
    }

    #[test]
    fn skips_blank_lines_and_handles_missing_trailing_newline() {
        let parsed = rows("a\tb\n\n\nc\td", '\t');
        assert_eq!(parsed, vec![vec!["a", "b"], vec!["c", "d"]]);
    }

    #[test]
    fn reports_starting_line_numbers() {
        let mut reader = DelimitedRows::new(Cursor::new("h1,h2\n\nv1,v2\n"), ',');
        let (line, _) = reader.next_row().unwrap().unwrap();
        assert_eq!(line, 1);
        let (line, _) = reader.next_row().unwrap().unwrap();
        assert_eq!(line, 3);
    }
}
