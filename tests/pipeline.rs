//! End-to-end pipeline scenarios over the in-memory store backend.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use lexflow::cognates::{detect_cognates, CognateParams};
use lexflow::embedding::{CachedEmbedder, HashingEmbedder};
use lexflow::enrich::{run_enrich, EnrichConfig};
use lexflow::ingest::{run_ingest, run_reprocess, IngestConfig};
use lexflow::phylo::PhyloTable;
use lexflow::store::{
    CheckpointStore, EntryFilter, EntryStore, MemoryStoreProvider, RawStore,
};
use pretty_assertions::assert_eq;
use tempfile::NamedTempFile;

fn write_jsonl(lines: &[String]) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    for line in lines {
        writeln!(file, "{line}").expect("write line");
    }
    file
}

fn wikt_line(word: &str, lang: &str, gloss: &str, ipa: &str) -> String {
    format!(
        r#"{{"word":"{word}","lang_code":"{lang}","senses":[{{"glosses":["{gloss}"]}}],"sounds":[{{"ipa":"{ipa}"}}]}}"#
    )
}

fn small_config(file: &NamedTempFile, workers: usize) -> IngestConfig {
    let mut config = IngestConfig::new(file.path().to_path_buf(), "test-src", "jsonl");
    config.load_batch = 16;
    config.raw_write_batch = 8;
    config.clean_batch = 8;
    config.write_batch = 8;
    config.cleaner_workers = workers;
    config.writers = 2;
    config.checkpoint_every = 8;
    config.idle_flush = Duration::from_millis(20);
    config
}

fn stored_identities(provider: &MemoryStoreProvider) -> Vec<(String, String, String)> {
    let mut identities: Vec<(String, String, String)> = provider
        .entries()
        .dump()
        .into_iter()
        .map(|entry| (entry.id, entry.headword, entry.language))
        .collect();
    identities.sort();
    identities
}

#[test]
fn tiny_ingest_counts_duplicates_and_invalids() {
    // Three good entries, one exact duplicate, one with an empty headword.
    let lines = vec![
        wikt_line("father", "en", "male parent", "/ˈfɑːðər/"),
        wikt_line("vater", "de", "male parent", "/ˈfaːtɐ/"),
        wikt_line("pater", "la", "male parent", "/ˈpa.ter/"),
        wikt_line("father", "en", "male parent", "/ˈfɑːðər/"),
        wikt_line("", "en", "nothing", "/x/"),
    ];
    let file = write_jsonl(&lines);
    let provider = Arc::new(MemoryStoreProvider::new());

    let report = run_ingest(provider.clone(), small_config(&file, 2)).expect("ingest succeeds");

    assert_eq!(report.loaded, 4, "duplicate line still parses");
    assert_eq!(report.parse_errors, 1, "empty headword is skipped at load");
    assert_eq!(report.raw_inserted, 3);
    assert_eq!(report.raw_deduplicated, 1);
    assert_eq!(report.entries_written, 3);

    let entries = provider.entries().dump();
    assert_eq!(entries.len(), 3);
    let mut headwords: Vec<&str> = entries.iter().map(|e| e.headword.as_str()).collect();
    headwords.sort();
    assert_eq!(headwords, vec!["father", "pater", "vater"]);
}

#[test]
fn ingest_twice_is_idempotent() {
    let lines: Vec<String> = (0..40)
        .map(|i| wikt_line(&format!("word{i}"), "en", &format!("meaning {i}"), ""))
        .collect();
    let file = write_jsonl(&lines);
    let provider = Arc::new(MemoryStoreProvider::new());

    run_ingest(provider.clone(), small_config(&file, 2)).expect("first run");
    let first = stored_identities(&provider);

    let second_report =
        run_ingest(provider.clone(), small_config(&file, 2)).expect("second run");
    assert_eq!(second_report.raw_inserted, 0);
    assert_eq!(second_report.raw_deduplicated, 40);

    assert_eq!(first, stored_identities(&provider));
}

#[test]
fn parallel_worker_counts_agree() {
    let lines: Vec<String> = (0..200)
        .map(|i| {
            wikt_line(
                &format!("word{i}"),
                ["en", "de", "la", "fr"][i % 4],
                &format!("meaning {i}"),
                "",
            )
        })
        .collect();
    let file = write_jsonl(&lines);

    let single = Arc::new(MemoryStoreProvider::new());
    run_ingest(single.clone(), small_config(&file, 1)).expect("single worker run");

    let parallel = Arc::new(MemoryStoreProvider::new());
    run_ingest(parallel.clone(), small_config(&file, 8)).expect("parallel run");

    assert_eq!(stored_identities(&single), stored_identities(&parallel));
}

#[test]
fn reprocess_keeps_entries_and_embeddings() {
    let lines: Vec<String> = (0..20)
        .map(|i| wikt_line(&format!("word{i}"), "en", &format!("meaning {i}"), ""))
        .collect();
    let file = write_jsonl(&lines);
    let provider = Arc::new(MemoryStoreProvider::new());

    run_ingest(provider.clone(), small_config(&file, 2)).expect("ingest");

    let embedder = Arc::new(CachedEmbedder::new(Arc::new(HashingEmbedder::new(16)), 1000));
    run_enrich(
        provider.clone(),
        embedder,
        EnrichConfig {
            embed_batch: 8,
            idle_flush: Duration::from_millis(20),
            ..EnrichConfig::default()
        },
    )
    .expect("enrich");

    let before = provider.entries().dump();
    assert!(before.iter().all(|entry| entry.embedding.is_some()));

    // A later cleaner pipeline overwrites fields but never loses entries or
    // their embeddings.
    run_reprocess(provider.clone(), small_config(&file, 4)).expect("reprocess");
    let after = provider.entries().dump();
    assert_eq!(before.len(), after.len());
    for (b, a) in before.iter().zip(after.iter()) {
        assert_eq!(b.id, a.id);
        assert_eq!(b.embedding, a.embedding);
    }
}

#[test]
fn checkpoint_covers_committed_prefix_and_resume_skips_it() {
    let lines: Vec<String> = (0..100)
        .map(|i| wikt_line(&format!("word{i}"), "en", &format!("meaning {i}"), ""))
        .collect();
    let file = write_jsonl(&lines);
    let provider = Arc::new(MemoryStoreProvider::new());

    run_ingest(provider.clone(), small_config(&file, 2)).expect("ingest");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime");
    let checkpoint = runtime
        .block_on(async {
            provider
                .checkpoints()
                .latest("ingest")
                .await
                .expect("checkpoint query")
        })
        .expect("checkpoint recorded");
    let cursor = checkpoint
        .per_source_cursor
        .get("test-src")
        .copied()
        .expect("cursor recorded");
    assert_eq!(cursor, 100, "final checkpoint covers every raw record");

    // Resuming after the committed cursor finds nothing left to process.
    let mut resume_config = small_config(&file, 2);
    resume_config.resume = true;
    let resumed = run_reprocess(provider.clone(), resume_config).expect("resume run");
    assert_eq!(resumed.processed, 0);
    assert_eq!(stored_identities(&provider).len(), 100);

    // A full (non-resume) reprocess rebuilds the same entries.
    let before = stored_identities(&provider);
    run_reprocess(provider.clone(), small_config(&file, 2)).expect("full reprocess");
    assert_eq!(before, stored_identities(&provider));
}

#[test]
fn transform_log_records_cleaning_steps() {
    let lines = vec![wikt_line("father", "en", "male parent", "/ˈfɑːðər/")];
    let file = write_jsonl(&lines);
    let provider = Arc::new(MemoryStoreProvider::new());

    run_ingest(provider.clone(), small_config(&file, 1)).expect("ingest");

    let raw = provider.raw();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime");
    let stored = runtime
        .block_on(async { raw.scan(Some("test-src"), 0, 10).await })
        .expect("scan");
    assert_eq!(stored.len(), 1);

    let steps = provider
        .transform_log_handle()
        .steps_for(&stored[0].record.checksum);
    assert!(!steps.is_empty());
    assert!(steps.iter().any(|step| step.step_name == "headword_stripper"));
    assert!(steps.iter().any(|step| step.step_name == "ipa_normalizer"));
}

#[test]
fn ingest_enrich_and_detect_cognates_end_to_end() {
    let lines = vec![
        wikt_line("father", "en", "male parent", "/ˈfɑðər/"),
        wikt_line("vater", "de", "male parent", "/ˈfatər/"),
        wikt_line("pater", "la", "male parent", "/ˈpater/"),
        wikt_line("okno", "pl", "window opening", "/ˈɔknɔ/"),
    ];
    let file = write_jsonl(&lines);
    let provider = Arc::new(MemoryStoreProvider::new());

    run_ingest(provider.clone(), small_config(&file, 2)).expect("ingest");

    let embedder = Arc::new(CachedEmbedder::new(Arc::new(HashingEmbedder::new(64)), 1000));
    run_enrich(
        provider.clone(),
        embedder,
        EnrichConfig {
            embed_batch: 4,
            idle_flush: Duration::from_millis(20),
            ..EnrichConfig::default()
        },
    )
    .expect("enrich");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime");
    let entries = runtime
        .block_on(async {
            provider
                .entries()
                .scan(&EntryFilter::all(), "", 100)
                .await
        })
        .expect("scan entries");

    let mut phylo = PhyloTable::empty();
    phylo.insert("en", "de", 2, 0.62);
    phylo.insert("en", "la", 6, 0.21);
    phylo.insert("de", "la", 6, 0.21);

    let clusters = detect_cognates(
        &entries,
        &CognateParams {
            threshold: 0.75,
            ..CognateParams::default()
        },
        &phylo,
        &std::collections::HashMap::new(),
    );

    let father_cluster = clusters
        .iter()
        .find(|cluster| cluster.size == 3)
        .expect("father cognate set detected");
    assert_eq!(father_cluster.languages, vec!["de", "en", "la"]);
    assert!(father_cluster.confidence > 0.75);

    // The unrelated Polish word never joins a cluster.
    let okno = entries
        .iter()
        .find(|entry| entry.headword == "okno")
        .expect("okno stored");
    assert!(clusters
        .iter()
        .all(|cluster| !cluster.members.contains(&okno.id)));
}

#[test]
fn embedding_cache_makes_second_enrichment_near_free() {
    let lines: Vec<String> = (0..50)
        .map(|i| wikt_line(&format!("word{i}"), "en", &format!("meaning {i}"), ""))
        .collect();
    let file = write_jsonl(&lines);
    let provider = Arc::new(MemoryStoreProvider::new());
    run_ingest(provider.clone(), small_config(&file, 2)).expect("ingest");

    let embedder = Arc::new(CachedEmbedder::new(Arc::new(HashingEmbedder::new(32)), 10_000));
    let enrich_config = || EnrichConfig {
        embed_batch: 16,
        recompute: true,
        idle_flush: Duration::from_millis(20),
        ..EnrichConfig::default()
    };

    let first = run_enrich(provider.clone(), Arc::clone(&embedder), enrich_config())
        .expect("first enrichment");
    assert_eq!(first.encoded, 50);

    let second = run_enrich(provider, embedder, enrich_config()).expect("second enrichment");
    assert_eq!(second.encoded, 0, "rerun is answered entirely from cache");
    assert!(second.cache_hit_rate >= 0.99);
}
