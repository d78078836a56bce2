//! Cached phylogenetic distance table.
//!
//! Tree distances and cognate priors are computed offline by the external
//! phylogenetic service; the core only consumes the resulting table. At-rest
//! rows are `(lang_a, lang_b, tree_distance, prior)` with `lang_a < lang_b`.

use crate::errors::PipelineError;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Looked-up relatedness of a language pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhyloEntry {
    /// Path distance between the languages in the family tree.
    pub tree_distance: u32,
    /// Prior probability of cognacy given that distance, in `[0, 1]`.
    pub prior: f64,
}

/// In-memory phylogenetic distance table keyed by canonical language pair.
#[derive(Debug, Clone, Default)]
pub struct PhyloTable {
    pairs: HashMap<(String, String), PhyloEntry>,
}

impl PhyloTable {
    /// Empty table; every lookup misses and the etymological weight drops
    /// out of similarity composition.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Loads a tab-separated table: `lang_a\tlang_b\tdistance\tprior`.
    /// Blank lines and `#` comments are skipped; malformed lines are
    /// rejected so a truncated table is not silently half-loaded.
    pub fn load_tsv(path: &Path) -> Result<Self, PipelineError> {
        let file = File::open(path).map_err(|err| {
            PipelineError::resource_missing(format!(
                "cannot open phylo table {}: {err}",
                path.display()
            ))
        })?;

        let mut table = Self::empty();
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|err| {
                PipelineError::resource_missing(format!(
                    "cannot read phylo table {}: {err}",
                    path.display()
                ))
            })?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = trimmed.split('\t').collect();
            if fields.len() != 4 {
                return Err(PipelineError::invalid(format!(
                    "phylo table line {}: expected 4 tab-separated fields, got {}",
                    line_no + 1,
                    fields.len()
                )));
            }
            let tree_distance: u32 = fields[2].parse().map_err(|_| {
                PipelineError::invalid(format!(
                    "phylo table line {}: bad distance {:?}",
                    line_no + 1,
                    fields[2]
                ))
            })?;
            let prior: f64 = fields[3].parse().map_err(|_| {
                PipelineError::invalid(format!(
                    "phylo table line {}: bad prior {:?}",
                    line_no + 1,
                    fields[3]
                ))
            })?;
            table.insert(fields[0], fields[1], tree_distance, prior.clamp(0.0, 1.0));
        }
        Ok(table)
    }

    /// Inserts one pair, canonicalizing the key order.
    pub fn insert(&mut self, lang_a: &str, lang_b: &str, tree_distance: u32, prior: f64) {
        self.pairs
            .insert(canonical_pair(lang_a, lang_b), PhyloEntry { tree_distance, prior });
    }

    /// Looks up a language pair; identical languages are distance zero with
    /// prior 1.
    pub fn lookup(&self, lang_a: &str, lang_b: &str) -> Option<PhyloEntry> {
        if lang_a == lang_b {
            return Some(PhyloEntry {
                tree_distance: 0,
                prior: 1.0,
            });
        }
        self.pairs.get(&canonical_pair(lang_a, lang_b)).copied()
    }

    /// Number of stored pairs.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Whether the table holds no pairs.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

fn canonical_pair(lang_a: &str, lang_b: &str) -> (String, String) {
    if lang_a <= lang_b {
        (lang_a.to_string(), lang_b.to_string())
    } else {
        (lang_b.to_string(), lang_a.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn lookup_is_order_independent() {
        let mut table = PhyloTable::empty();
        table.insert("de", "en", 2, 0.6);
        assert_eq!(table.lookup("en", "de"), table.lookup("de", "en"));
        assert_eq!(table.lookup("de", "en").unwrap().tree_distance, 2);
    }

    #[test]
    fn same_language_is_distance_zero() {
        let table = PhyloTable::empty();
        let entry = table.lookup("en", "en").unwrap();
        assert_eq!(entry.tree_distance, 0);
        assert_eq!(entry.prior, 1.0);
    }

    #[test]
    fn missing_pair_is_none() {
        let table = PhyloTable::empty();
        assert!(table.lookup("en", "hu").is_none());
    }

    #[test]
    fn loads_tsv_with_comments() {
        let mut file = NamedTempFile::new().expect("temp file");
        writeln!(file, "# lang_a\tlang_b\tdistance\tprior").unwrap();
        writeln!(file, "de\ten\t2\t0.62").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "en\tla\t6\t0.21").unwrap();

        let table = PhyloTable::load_tsv(file.path()).expect("table loads");
        assert_eq!(table.len(), 2);
        assert_eq!(table.lookup("la", "en").unwrap().tree_distance, 6);
    }

    #[test]
    fn malformed_lines_are_rejected() {
        let mut file = NamedTempFile::new().expect("temp file");
        writeln!(file, "de\ten\ttwo\t0.62").unwrap();
        assert!(PhyloTable::load_tsv(file.path()).is_err());
    }

    #[test]
    fn missing_file_is_resource_error() {
        let err = PhyloTable::load_tsv(Path::new("/nonexistent/phylo.tsv")).unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::ResourceMissing);
    }
}
