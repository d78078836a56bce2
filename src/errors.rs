//! Pipeline error taxonomy shared across stages and binaries.

use std::fmt;

/// Classification of a failure, orthogonal to where it arose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad data in a single record; contained, counted, skipped.
    Invalid,
    /// A required external resource is absent (file, cache, table).
    ResourceMissing,
    /// A temporary failure worth retrying with backoff.
    Transient,
    /// Unrecoverable; aborts the pipeline.
    Fatal,
    /// Stored state contradicts incoming data; refuses to overwrite.
    Integrity,
}

/// A failure annotated with enough context to locate the offending work:
/// pipeline name, stage, batch id, and the first offending item or cursor.
#[derive(Debug)]
pub struct PipelineError {
    kind: ErrorKind,
    message: String,
    pipeline: Option<String>,
    stage: Option<String>,
    batch_id: Option<u64>,
    item: Option<String>,
}

impl PipelineError {
    /// Builds an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            pipeline: None,
            stage: None,
            batch_id: None,
            item: None,
        }
    }

    /// Per-record data failure.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Invalid, message)
    }

    /// Missing file, table, or backing service.
    pub fn resource_missing(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceMissing, message)
    }

    /// Retriable failure.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    /// Unrecoverable failure.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    /// Checksum collision with a different payload, or similar corruption.
    pub fn integrity(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Integrity, message)
    }

    /// Annotates the error with its pipeline and stage.
    pub fn in_stage(mut self, pipeline: &str, stage: &str) -> Self {
        self.pipeline = Some(pipeline.to_string());
        self.stage = Some(stage.to_string());
        self
    }

    /// Annotates the error with the failing batch id.
    pub fn with_batch(mut self, batch_id: u64) -> Self {
        self.batch_id = Some(batch_id);
        self
    }

    /// Annotates the error with the first offending item id or cursor.
    pub fn with_item(mut self, item: impl Into<String>) -> Self {
        self.item = Some(item.into());
        self
    }

    /// The error classification.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Whether the failure should be retried with backoff.
    pub fn is_retriable(&self) -> bool {
        self.kind == ErrorKind::Transient
    }

    /// Process exit code for this error class (sysexits-style).
    pub fn exit_code(&self) -> i32 {
        match self.kind {
            ErrorKind::Invalid => 65,
            ErrorKind::ResourceMissing => 74,
            ErrorKind::Transient => 75,
            ErrorKind::Fatal | ErrorKind::Integrity => 70,
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ErrorKind::Invalid => "invalid",
            ErrorKind::ResourceMissing => "resource missing",
            ErrorKind::Transient => "transient",
            ErrorKind::Fatal => "fatal",
            ErrorKind::Integrity => "integrity",
        };
        write!(f, "[{kind}]")?;
        if let Some(pipeline) = &self.pipeline {
            write!(f, " pipeline={pipeline}")?;
        }
        if let Some(stage) = &self.stage {
            write!(f, " stage={stage}")?;
        }
        if let Some(batch_id) = self.batch_id {
            write!(f, " batch={batch_id}")?;
        }
        if let Some(item) = &self.item {
            write!(f, " item={item}")?;
        }
        write!(f, ": {}", self.message)
    }
}

impl std::error::Error for PipelineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_sysexits() {
        assert_eq!(PipelineError::invalid("x").exit_code(), 65);
        assert_eq!(PipelineError::resource_missing("x").exit_code(), 74);
        assert_eq!(PipelineError::transient("x").exit_code(), 75);
        assert_eq!(PipelineError::fatal("x").exit_code(), 70);
        assert_eq!(PipelineError::integrity("x").exit_code(), 70);
    }

    #[test]
    fn display_includes_location_context() {
        let err = PipelineError::transient("db timeout")
            .in_stage("ingest", "typed-writer")
            .with_batch(42)
            .with_item("entry_deadbeef");
        let rendered = err.to_string();
        assert!(rendered.contains("pipeline=ingest"));
        assert!(rendered.contains("stage=typed-writer"));
        assert!(rendered.contains("batch=42"));
        assert!(rendered.contains("item=entry_deadbeef"));
        assert!(rendered.contains("db timeout"));
    }
}
