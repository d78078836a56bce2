//! Embedding service: encoder contract, remote client, and two-level cache.

use crate::errors::PipelineError;
use lru::LruCache;
use reqwest::blocking::Client;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Text-to-vector encoder. Implementations are immutable after construction
/// and safe to share across pipeline workers.
pub trait Embedder: Send + Sync {
    /// Output vector dimension.
    fn dimension(&self) -> usize;

    /// Encodes a batch of texts into vectors, one per input, in order.
    fn encode(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, PipelineError>;
}

/// Shared (cross-process) vector cache keyed by text hash.
pub trait SharedVectorCache: Send + Sync {
    /// Looks up many hashes; `None` per miss.
    fn get_many(&self, hashes: &[String]) -> Result<Vec<Option<Vec<f32>>>, PipelineError>;

    /// Stores many `(hash, vector)` pairs. Existing keys are kept.
    fn put_many(&self, items: &[(String, Vec<f32>)]) -> Result<(), PipelineError>;
}

/// Cache key for a text: hex SHA-256 of its bytes.
pub fn text_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Blocking embeddings client for OpenAI-compatible endpoints.
///
/// Retries 429/5xx and transport failures with exponential backoff; once the
/// retry budget is exhausted it falls back to halved sub-batches before
/// giving up with a transient error.
#[derive(Clone)]
pub struct RemoteEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    dimension: usize,
    max_retries: usize,
    batch_size: usize,
}

impl RemoteEmbedder {
    /// Builds a new remote embeddings client.
    pub fn new(
        api_key: String,
        base_url: String,
        model: String,
        dimension: usize,
        timeout: Duration,
        max_retries: usize,
        batch_size: usize,
    ) -> Result<Self, PipelineError> {
        if api_key.trim().is_empty() {
            return Err(PipelineError::fatal("missing embedder API key"));
        }
        if dimension == 0 {
            return Err(PipelineError::fatal("embedding dimension must be positive"));
        }
        let mut headers = reqwest::header::HeaderMap::new();
        let auth = format!("Bearer {}", api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth)
                .map_err(|_| PipelineError::fatal("invalid embedder API key"))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|err| PipelineError::fatal(format!("failed to build HTTP client: {err}")))?;
        let endpoint = format!("{}/embeddings", base_url.trim_end_matches('/'));
        Ok(Self {
            client,
            endpoint,
            model,
            dimension,
            max_retries: max_retries.max(1),
            batch_size: batch_size.max(1),
        })
    }

    fn encode_chunk(&self, inputs: &[&str], batch_size: usize) -> Result<Vec<Vec<f32>>, PipelineError> {
        let mut out = Vec::with_capacity(inputs.len());
        for chunk in inputs.chunks(batch_size.max(1)) {
            match self.request_with_retries(chunk) {
                Ok(mut vectors) => out.append(&mut vectors),
                Err(err) if batch_size > 1 => {
                    // Transient budget exhausted; retry this chunk in halves
                    // before escalating.
                    eprintln!(
                        "embedder: batch of {} failed ({err}); retrying at batch size {}...",
                        chunk.len(),
                        batch_size / 2
                    );
                    let mut vectors = self.encode_chunk(chunk, batch_size / 2)?;
                    out.append(&mut vectors);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(out)
    }

    fn request_with_retries(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>, PipelineError> {
        let mut attempt = 0usize;
        loop {
            let request = EmbeddingRequest {
                model: &self.model,
                input: inputs,
                dimensions: Some(self.dimension),
            };
            let response = self.client.post(&self.endpoint).json(&request).send();
            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let mut parsed: EmbeddingResponse = resp.json().map_err(|err| {
                            PipelineError::transient(format!(
                                "failed to parse embedding response: {err}"
                            ))
                        })?;
                        parsed.data.sort_by_key(|entry| entry.index);
                        if parsed.data.len() != inputs.len() {
                            return Err(PipelineError::transient(format!(
                                "embedder returned {} vectors for {} inputs",
                                parsed.data.len(),
                                inputs.len()
                            )));
                        }
                        return Ok(parsed
                            .data
                            .into_iter()
                            .map(|entry| entry.embedding)
                            .collect());
                    }

                    let body = resp
                        .text()
                        .unwrap_or_else(|_| "<body unavailable>".to_string());
                    if should_retry(status) && attempt + 1 < self.max_retries {
                        attempt += 1;
                        thread::sleep(retry_backoff(attempt));
                        continue;
                    }
                    return Err(PipelineError::transient(format!(
                        "embedding request failed ({status}): {body}"
                    )));
                }
                Err(err) => {
                    if is_retryable_transport(&err) && attempt + 1 < self.max_retries {
                        attempt += 1;
                        thread::sleep(retry_backoff(attempt));
                        continue;
                    }
                    return Err(PipelineError::transient(format!(
                        "embedding transport error: {err}"
                    )));
                }
            }
        }
    }
}

impl Embedder for RemoteEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn encode(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, PipelineError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.encode_chunk(texts, self.batch_size)
    }
}

fn should_retry(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_retryable_transport(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_body() || err.is_request() || err.is_decode()
}

fn retry_backoff(attempt: usize) -> Duration {
    let capped = attempt.min(5) as u32;
    Duration::from_millis(500 * (1 << capped))
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

/// Deterministic feature-hashing encoder.
///
/// Buckets word tokens and character trigrams into a fixed-dimension vector
/// and L2-normalizes. No model weights, fully reproducible; used for tests,
/// dry runs, and environments without an embedding backend. Related texts
/// (shared tokens/trigrams) land near each other, unrelated texts do not.
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    /// Encoder producing vectors of the given dimension.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        let lowered = text.to_lowercase();

        for token in lowered.split_whitespace() {
            bump(&mut vector, token.as_bytes(), 0x9e3779b185ebca87, 1.0);
            let chars: Vec<char> = token.chars().collect();
            for window in chars.windows(3) {
                let trigram: String = window.iter().collect();
                bump(&mut vector, trigram.as_bytes(), 0x6d0f27bdceb7b067, 0.5);
            }
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in vector.iter_mut() {
                *x /= norm;
            }
        }
        vector
    }
}

impl Embedder for HashingEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn encode(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, PipelineError> {
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }
}

fn bump(vector: &mut [f32], data: &[u8], seed: u64, weight: f32) {
    let hash = feature_hash(data, seed);
    let idx = (hash as usize) % vector.len();
    let sign = if hash & (1 << 63) == 0 { 1.0 } else { -1.0 };
    vector[idx] += weight * sign;
}

fn feature_hash(data: &[u8], seed: u64) -> u64 {
    let mut hash = seed ^ data.len() as u64;
    for &byte in data {
        hash ^= (byte as u64).wrapping_mul(0x100000001b3);
        hash = hash.rotate_left(13).wrapping_mul(0xff51afd7ed558ccd);
    }
    hash ^ (hash >> 33)
}

/// Cache effectiveness counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from either cache level.
    pub hits: usize,
    /// Lookups that fell through to the encoder.
    pub misses: usize,
    /// Vectors written into the cache.
    pub writes: usize,
}

impl CacheStats {
    /// Fraction of lookups answered from cache.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Two-level cache (in-process LRU + optional shared store) in front of any
/// encoder. Shared-cache failures log once and degrade to LRU-only; both
/// levels failing degrades to direct encoding.
pub struct CachedEmbedder {
    inner: Arc<dyn Embedder>,
    lru: Mutex<LruCache<String, Vec<f32>>>,
    shared: Option<Arc<dyn SharedVectorCache>>,
    shared_degraded: AtomicBool,
    hits: AtomicUsize,
    misses: AtomicUsize,
    writes: AtomicUsize,
}

impl CachedEmbedder {
    /// Wraps an encoder with an LRU of `capacity` vectors.
    pub fn new(inner: Arc<dyn Embedder>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("nonzero capacity");
        Self {
            inner,
            lru: Mutex::new(LruCache::new(capacity)),
            shared: None,
            shared_degraded: AtomicBool::new(false),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// Adds the shared cache level.
    pub fn with_shared_cache(mut self, shared: Arc<dyn SharedVectorCache>) -> Self {
        self.shared = Some(shared);
        self
    }

    /// Current cache counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }

    /// Probes both cache levels without encoding. Hits found in the shared
    /// level are promoted into the LRU and counted; missing texts are not
    /// counted as misses until they reach [`CachedEmbedder::encode`].
    pub fn lookup(&self, texts: &[&str]) -> Vec<Option<Vec<f32>>> {
        let hashes: Vec<String> = texts.iter().map(|text| text_hash(text)).collect();
        let mut found: Vec<Option<Vec<f32>>> = {
            let mut lru = self.lru.lock().expect("lru mutex");
            hashes.iter().map(|hash| lru.get(hash).cloned()).collect()
        };

        let missing: Vec<usize> = (0..texts.len()).filter(|&i| found[i].is_none()).collect();
        if !missing.is_empty() {
            if let Some(shared_hits) = self.probe_shared(&hashes, &missing) {
                let mut lru = self.lru.lock().expect("lru mutex");
                for (slot, vector) in missing.iter().zip(shared_hits) {
                    if let Some(vector) = vector {
                        lru.put(hashes[*slot].clone(), vector.clone());
                        found[*slot] = Some(vector);
                    }
                }
            }
        }
        let hit_count = found.iter().filter(|slot| slot.is_some()).count();
        self.hits.fetch_add(hit_count, Ordering::Relaxed);
        found
    }

    fn probe_shared(&self, hashes: &[String], missing: &[usize]) -> Option<Vec<Option<Vec<f32>>>> {
        let shared = self.shared.as_ref()?;
        if self.shared_degraded.load(Ordering::Acquire) {
            return None;
        }
        let wanted: Vec<String> = missing.iter().map(|&i| hashes[i].clone()).collect();
        match shared.get_many(&wanted) {
            Ok(results) => Some(results),
            Err(err) => {
                self.degrade_shared(&err);
                None
            }
        }
    }

    fn write_shared(&self, items: &[(String, Vec<f32>)]) {
        let Some(shared) = self.shared.as_ref() else {
            return;
        };
        if self.shared_degraded.load(Ordering::Acquire) {
            return;
        }
        if let Err(err) = shared.put_many(items) {
            self.degrade_shared(&err);
        }
    }

    fn degrade_shared(&self, err: &PipelineError) {
        if !self.shared_degraded.swap(true, Ordering::AcqRel) {
            eprintln!("shared embedding cache unavailable, continuing with LRU only: {err}");
        }
    }
}

impl Embedder for CachedEmbedder {
    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn encode(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, PipelineError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let hashes: Vec<String> = texts.iter().map(|text| text_hash(text)).collect();
        let mut out: Vec<Option<Vec<f32>>> = {
            let mut lru = self.lru.lock().expect("lru mutex");
            hashes.iter().map(|hash| lru.get(hash).cloned()).collect()
        };

        let mut missing: Vec<usize> = (0..texts.len()).filter(|&i| out[i].is_none()).collect();
        if !missing.is_empty() {
            if let Some(shared_hits) = self.probe_shared(&hashes, &missing) {
                let mut lru = self.lru.lock().expect("lru mutex");
                for (slot, vector) in missing.iter().zip(shared_hits) {
                    if let Some(vector) = vector {
                        lru.put(hashes[*slot].clone(), vector.clone());
                        out[*slot] = Some(vector);
                    }
                }
                missing.retain(|&i| out[i].is_none());
            }
        }

        self.hits
            .fetch_add(texts.len() - missing.len(), Ordering::Relaxed);
        self.misses.fetch_add(missing.len(), Ordering::Relaxed);

        if !missing.is_empty() {
            let to_encode: Vec<&str> = missing.iter().map(|&i| texts[i]).collect();
            let encoded = self.inner.encode(&to_encode)?;
            if encoded.len() != to_encode.len() {
                return Err(PipelineError::fatal(format!(
                    "encoder returned {} vectors for {} inputs",
                    encoded.len(),
                    to_encode.len()
                )));
            }

            let mut shared_items = Vec::with_capacity(missing.len());
            {
                let mut lru = self.lru.lock().expect("lru mutex");
                for (slot, vector) in missing.iter().zip(encoded) {
                    lru.put(hashes[*slot].clone(), vector.clone());
                    shared_items.push((hashes[*slot].clone(), vector.clone()));
                    out[*slot] = Some(vector);
                }
            }
            self.write_shared(&shared_items);
            self.writes.fetch_add(shared_items.len(), Ordering::Relaxed);
        }

        Ok(out
            .into_iter()
            .map(|vector| vector.expect("all slots filled"))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryVectorCache;

    #[test]
    fn hashing_embedder_is_deterministic_and_normalized() {
        let embedder = HashingEmbedder::new(64);
        let first = embedder.encode(&["male parent"]).unwrap();
        let second = embedder.encode(&["male parent"]).unwrap();
        assert_eq!(first, second);
        assert_eq!(first[0].len(), 64);
        let norm: f32 = first[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn related_texts_are_closer_than_unrelated() {
        let embedder = HashingEmbedder::new(256);
        let vectors = embedder
            .encode(&["male parent", "a male parent", "volcanic eruption"])
            .unwrap();
        let related = crate::store::cosine(&vectors[0], &vectors[1]);
        let unrelated = crate::store::cosine(&vectors[0], &vectors[2]);
        assert!(related > unrelated);
    }

    #[test]
    fn second_pass_is_fully_cached() {
        let cached = CachedEmbedder::new(Arc::new(HashingEmbedder::new(32)), 1000);
        let texts = ["one", "two", "three"];
        cached.encode(&texts).unwrap();
        assert_eq!(cached.stats().misses, 3);

        cached.encode(&texts).unwrap();
        let stats = cached.stats();
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.misses, 3);
        assert!(stats.hit_rate() >= 0.49);

        // A third pass pushes the overall hit rate above the 0.99 target
        // for a rerun-shaped workload.
        for _ in 0..200 {
            cached.encode(&texts).unwrap();
        }
        assert!(cached.stats().hit_rate() > 0.99);
    }

    #[test]
    fn shared_cache_survives_lru_eviction() {
        let shared = Arc::new(MemoryVectorCache::new());
        let cached = CachedEmbedder::new(Arc::new(HashingEmbedder::new(16)), 1)
            .with_shared_cache(shared.clone());

        cached.encode(&["alpha"]).unwrap();
        cached.encode(&["beta"]).unwrap(); // Evicts alpha from the LRU.
        assert_eq!(shared.len(), 2);

        cached.encode(&["alpha"]).unwrap();
        // Answered by the shared level, not a fresh encode.
        assert_eq!(cached.stats().hits, 1);
    }

    struct FailingCache;

    impl SharedVectorCache for FailingCache {
        fn get_many(&self, _hashes: &[String]) -> Result<Vec<Option<Vec<f32>>>, PipelineError> {
            Err(PipelineError::resource_missing("cache down"))
        }
        fn put_many(&self, _items: &[(String, Vec<f32>)]) -> Result<(), PipelineError> {
            Err(PipelineError::resource_missing("cache down"))
        }
    }

    #[test]
    fn shared_cache_failure_degrades_to_lru_only() {
        let cached =
            CachedEmbedder::new(Arc::new(HashingEmbedder::new(16)), 100).with_shared_cache(Arc::new(FailingCache));
        let vectors = cached.encode(&["still works"]).unwrap();
        assert_eq!(vectors.len(), 1);
        // Second call hits the LRU despite the broken shared level.
        cached.encode(&["still works"]).unwrap();
        assert_eq!(cached.stats().hits, 1);
    }

    #[test]
    fn lookup_probes_without_encoding() {
        let cached = CachedEmbedder::new(Arc::new(HashingEmbedder::new(16)), 100);
        assert_eq!(cached.lookup(&["missing"]), vec![None]);
        cached.encode(&["missing"]).unwrap();
        assert!(cached.lookup(&["missing"])[0].is_some());
    }
}
