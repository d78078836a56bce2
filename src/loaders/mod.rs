//! Streaming source loaders for the supported dictionary formats.
//!
//! Every loader yields checksummed [`RawRecord`]s from a file without
//! buffering more than per-record parsing state. Single-record failures
//! surface as [`LoadError::Record`] and are skipped by the pipeline;
//! structural problems are fatal.

mod cldf;
mod delimited;
mod jsonl;
mod starling;
mod tei;
mod wordlist;

pub use cldf::CldfLoader;
pub use delimited::DelimitedRows;
pub use jsonl::JsonlLoader;
pub use starling::StarlingLoader;
pub use tei::TeiLoader;
pub use wordlist::WordlistLoader;

use crate::records::RawRecord;
use std::fmt;
use std::io;
use std::path::Path;

/// Boxed lazy record stream returned by loaders.
pub type RecordStream = Box<dyn Iterator<Item = Result<RawRecord, LoadError>> + Send>;

/// Errors surfaced while loading source files.
#[derive(Debug)]
pub enum LoadError {
    /// Filesystem failure opening or reading the input.
    Io {
        /// Offending path.
        path: String,
        /// Underlying error.
        source: io::Error,
    },
    /// The file structure is unusable; terminates the loader.
    Format {
        /// Offending path.
        path: String,
        /// What was wrong.
        message: String,
    },
    /// One record could not be parsed; skipped and counted.
    Record {
        /// Line number (1-based) of the offending record.
        line: u64,
        /// What was wrong.
        message: String,
    },
    /// The requested format name is not supported.
    UnsupportedFormat(String),
    /// Compressed inputs are not handled; decompress before ingesting.
    CompressedInput(String),
}

impl LoadError {
    /// Whether this error affects a single record rather than the file.
    pub fn is_record(&self) -> bool {
        matches!(self, LoadError::Record { .. })
    }

    fn io(path: &Path, source: io::Error) -> Self {
        LoadError::Io {
            path: path.display().to_string(),
            source,
        }
    }

    fn format(path: &Path, message: impl Into<String>) -> Self {
        LoadError::Format {
            path: path.display().to_string(),
            message: message.into(),
        }
    }

    fn record(line: u64, message: impl Into<String>) -> Self {
        LoadError::Record {
            line,
            message: message.into(),
        }
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::Io { path, source } => write!(f, "io error reading {path}: {source}"),
            LoadError::Format { path, message } => {
                write!(f, "unusable source file {path}: {message}")
            }
            LoadError::Record { line, message } => {
                write!(f, "bad record at line {line}: {message}")
            }
            LoadError::UnsupportedFormat(format) => write!(f, "unsupported format: {format}"),
            LoadError::CompressedInput(path) => {
                write!(f, "{path} is compressed; decompress it before ingesting")
            }
        }
    }
}

impl std::error::Error for LoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LoadError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// A streaming producer of raw records for one input file.
pub trait Loader: Send + Sync {
    /// Opens `path` and returns a lazy record stream tagged with `source_id`.
    fn load(&self, path: &Path, source_id: &str) -> Result<RecordStream, LoadError>;
}

/// Selects the loader implementation for a format name.
pub fn format_loader(format: &str) -> Result<Box<dyn Loader>, LoadError> {
    match format.to_ascii_lowercase().as_str() {
        "json" | "jsonl" => Ok(Box::new(JsonlLoader)),
        "cldf" => Ok(Box::new(CldfLoader)),
        "starling" => Ok(Box::new(StarlingLoader)),
        "tei" | "xml" => Ok(Box::new(TeiLoader)),
        "csv" | "wordlist" => Ok(Box::new(WordlistLoader)),
        other => Err(LoadError::UnsupportedFormat(other.to_string())),
    }
}

fn reject_compressed(path: &Path) -> Result<(), LoadError> {
    if path.extension().and_then(|ext| ext.to_str()) == Some("gz") {
        return Err(LoadError::CompressedInput(path.display().to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_resolves_known_formats() {
        for format in ["json", "jsonl", "cldf", "starling", "tei", "xml", "csv"] {
            assert!(format_loader(format).is_ok(), "missing loader for {format}");
        }
        assert!(matches!(
            format_loader("parquet"),
            Err(LoadError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn compressed_inputs_are_rejected() {
        let err = reject_compressed(Path::new("dump.jsonl.gz")).unwrap_err();
        assert!(matches!(err, LoadError::CompressedInput(_)));
        assert!(reject_compressed(Path::new("dump.jsonl")).is_ok());
    }
}
