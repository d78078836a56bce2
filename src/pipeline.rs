//! Ordered cleaner composition with transform logging.

use crate::cleaners::{
    Cleaner, DefinitionCleaner, HeadwordStripper, IpaNormalizer, LanguageCodeCanonicalizer,
    TextNormalizer,
};
use crate::entry::epoch_ms_now;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// One applied transformation, recorded for provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformStep {
    /// Cleaner name.
    pub step_name: String,
    /// Cleaner version.
    pub step_version: String,
    /// Start of the step, milliseconds since the Unix epoch.
    pub at_epoch_ms: u64,
    /// Wall time the step took.
    pub duration_ms: u64,
    /// Whether the cleaner's validation accepted the result.
    pub ok: bool,
    /// Validation failure message, when not ok.
    pub error: Option<String>,
}

/// Result of pushing a value through a pipeline.
#[derive(Debug, Clone)]
pub struct CleanOutcome {
    /// Final transformed value.
    pub value: String,
    /// One step record per cleaner that ran.
    pub steps: Vec<TransformStep>,
    /// False when any cleaner's validation rejected its output.
    pub ok: bool,
}

/// An ordered composition of cleaners applied to one field.
///
/// In strict mode a failed validation short-circuits the remaining cleaners
/// and marks the outcome failed; otherwise the failure is recorded and
/// processing continues.
#[derive(Clone)]
pub struct CleanerPipeline {
    cleaners: Vec<Arc<dyn Cleaner>>,
    strict: bool,
}

impl CleanerPipeline {
    /// Creates an empty pipeline.
    pub fn new(strict: bool) -> Self {
        Self {
            cleaners: Vec::new(),
            strict,
        }
    }

    /// Appends a cleaner, preserving order.
    pub fn with(mut self, cleaner: impl Cleaner + 'static) -> Self {
        self.cleaners.push(Arc::new(cleaner));
        self
    }

    /// Whether this pipeline short-circuits on validation failure.
    pub fn strict(&self) -> bool {
        self.strict
    }

    /// Applies every cleaner in order, recording a transform step each.
    pub fn apply(&self, value: &str) -> CleanOutcome {
        let mut current = value.to_string();
        let mut steps = Vec::with_capacity(self.cleaners.len());
        let mut ok = true;

        for cleaner in &self.cleaners {
            let at_epoch_ms = epoch_ms_now();
            let started = Instant::now();
            let cleaned = cleaner.clean(&current);
            let valid = cleaner.validate(&cleaned);
            let duration_ms = started.elapsed().as_millis() as u64;

            steps.push(TransformStep {
                step_name: cleaner.name().to_string(),
                step_version: cleaner.version().to_string(),
                at_epoch_ms,
                duration_ms,
                ok: valid,
                error: (!valid).then(|| format!("{} rejected output", cleaner.name())),
            });

            current = cleaned;
            if !valid {
                ok = false;
                if self.strict {
                    break;
                }
            }
        }

        CleanOutcome {
            value: current,
            steps,
            ok,
        }
    }

    /// Applies the pipeline to each value, preserving input ordering.
    pub fn apply_many(&self, values: &[&str]) -> Vec<CleanOutcome> {
        values.iter().map(|value| self.apply(value)).collect()
    }

    /// Ordered `name:version` fingerprint of this pipeline.
    pub fn fingerprint(&self) -> String {
        self.cleaners
            .iter()
            .map(|cleaner| format!("{}:{}", cleaner.name(), cleaner.version()))
            .collect::<Vec<_>>()
            .join("_")
    }
}

/// Per-field pipelines for dictionary entries, applied by the cleaner stage.
#[derive(Clone)]
pub struct FieldPipelines {
    /// Headword cleaning.
    pub headword: CleanerPipeline,
    /// IPA normalization (strict: a bad transcription fails the field).
    pub ipa: CleanerPipeline,
    /// Definition cleaning.
    pub definition: CleanerPipeline,
    /// Language code canonicalization (strict).
    pub language: CleanerPipeline,
}

impl FieldPipelines {
    /// The standard entry-cleaning configuration.
    pub fn standard() -> Self {
        Self {
            headword: CleanerPipeline::new(false)
                .with(HeadwordStripper)
                .with(TextNormalizer::new()),
            ipa: CleanerPipeline::new(true).with(IpaNormalizer),
            definition: CleanerPipeline::new(false).with(DefinitionCleaner::new()),
            language: CleanerPipeline::new(true).with(LanguageCodeCanonicalizer),
        }
    }

    /// Combined fingerprint over all field pipelines, in a fixed field order.
    pub fn fingerprint(&self) -> String {
        format!(
            "headword[{}]_ipa[{}]_definition[{}]_language[{}]",
            self.headword.fingerprint(),
            self.ipa.fingerprint(),
            self.definition.fingerprint(),
            self.language.fingerprint()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleaners::Cleaner;

    struct Rejecting;

    impl Cleaner for Rejecting {
        fn name(&self) -> &'static str {
            "rejecting"
        }
        fn version(&self) -> &'static str {
            "0.0.1"
        }
        fn clean(&self, input: &str) -> String {
            input.to_string()
        }
        fn validate(&self, _cleaned: &str) -> bool {
            false
        }
    }

    #[test]
    fn records_one_step_per_cleaner() {
        let pipeline = CleanerPipeline::new(false)
            .with(HeadwordStripper)
            .with(TextNormalizer::new());
        let outcome = pipeline.apply("*wódr̥  ");
        assert!(outcome.ok);
        assert_eq!(outcome.steps.len(), 2);
        assert_eq!(outcome.steps[0].step_name, "headword_stripper");
        assert_eq!(outcome.steps[1].step_name, "text_normalizer");
        assert_eq!(outcome.value, "wódr̥");
    }

    #[test]
    fn strict_pipeline_short_circuits() {
        let pipeline = CleanerPipeline::new(true)
            .with(Rejecting)
            .with(TextNormalizer::new());
        let outcome = pipeline.apply("anything");
        assert!(!outcome.ok);
        assert_eq!(outcome.steps.len(), 1);
        assert!(outcome.steps[0].error.is_some());
    }

    #[test]
    fn lenient_pipeline_records_and_continues() {
        let pipeline = CleanerPipeline::new(false)
            .with(Rejecting)
            .with(TextNormalizer::new());
        let outcome = pipeline.apply("  keep   going ");
        assert!(!outcome.ok);
        assert_eq!(outcome.steps.len(), 2);
        assert_eq!(outcome.value, "keep going");
    }

    #[test]
    fn apply_many_preserves_order() {
        let pipeline = CleanerPipeline::new(false).with(TextNormalizer::new());
        let outcomes = pipeline.apply_many(&["  a ", " b", "c  "]);
        let values: Vec<&str> = outcomes.iter().map(|o| o.value.as_str()).collect();
        assert_eq!(values, vec!["a", "b", "c"]);
    }

    #[test]
    fn fingerprint_reflects_order() {
        let forward = CleanerPipeline::new(false)
            .with(HeadwordStripper)
            .with(TextNormalizer::new())
            .fingerprint();
        let backward = CleanerPipeline::new(false)
            .with(TextNormalizer::new())
            .with(HeadwordStripper)
            .fingerprint();
        assert_ne!(forward, backward);
        assert!(forward.starts_with("headword_stripper:1.0.0_"));
    }

    #[test]
    fn standard_fingerprint_is_stable() {
        assert_eq!(
            FieldPipelines::standard().fingerprint(),
            FieldPipelines::standard().fingerprint()
        );
    }
}
