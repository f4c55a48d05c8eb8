//! Semantic similarity layer.
//!
//! The production deployment fronts an external vector index; this module
//! defines the seam and an in-memory implementation with a deterministic
//! bag-of-words embedder. A hit requires cosine similarity at or above the
//! configured threshold and the same (model, tenant).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

pub const EMBEDDING_DIM: usize = 256;

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, String>;
}

/// Deterministic hashing embedder: each lowercased token bumps one
/// dimension. No semantics beyond lexical overlap, but stable and free —
/// enough for the in-memory index and for tests.
pub struct HashEmbedder;

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, String> {
        use std::hash::{Hash, Hasher};
        let mut vector = vec![0.0f32; EMBEDDING_DIM];
        for token in text.to_lowercase().split_whitespace() {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            token.hash(&mut hasher);
            let dim = (hasher.finish() % EMBEDDING_DIM as u64) as usize;
            vector[dim] += 1.0;
        }
        Ok(vector)
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[async_trait]
pub trait SemanticIndex: Send + Sync {
    /// Nearest stored response for the prompt, if similarity clears the
    /// threshold within the same (model, tenant).
    async fn lookup(
        &self,
        prompt: &str,
        model: &str,
        tenant_id: &str,
    ) -> Result<Option<String>, String>;

    async fn store(
        &self,
        prompt: &str,
        model: &str,
        tenant_id: &str,
        content: &str,
    ) -> Result<(), String>;
}

struct SemanticEntry {
    embedding: Vec<f32>,
    model: String,
    tenant_id: String,
    content: String,
    created: Instant,
}

pub struct MemorySemanticIndex<E: Embedder> {
    embedder: E,
    entries: Mutex<Vec<SemanticEntry>>,
    threshold: f32,
    ttl: Duration,
}

impl<E: Embedder> MemorySemanticIndex<E> {
    pub fn new(embedder: E, threshold: f32, ttl_s: u64) -> Self {
        Self {
            embedder,
            entries: Mutex::new(Vec::new()),
            threshold,
            ttl: Duration::from_secs(ttl_s),
        }
    }
}

#[async_trait]
impl<E: Embedder> SemanticIndex for MemorySemanticIndex<E> {
    async fn lookup(
        &self,
        prompt: &str,
        model: &str,
        tenant_id: &str,
    ) -> Result<Option<String>, String> {
        let query = self.embedder.embed(prompt).await?;
        let mut entries = self.entries.lock().await;
        let ttl = self.ttl;
        entries.retain(|entry| entry.created.elapsed() < ttl);

        let mut best: Option<(f32, &SemanticEntry)> = None;
        for entry in entries.iter() {
            if entry.model != model || entry.tenant_id != tenant_id {
                continue;
            }
            let similarity = cosine_similarity(&query, &entry.embedding);
            if similarity >= self.threshold
                && best.map_or(true, |(score, _)| similarity > score)
            {
                best = Some((similarity, entry));
            }
        }
        Ok(best.map(|(_, entry)| entry.content.clone()))
    }

    async fn store(
        &self,
        prompt: &str,
        model: &str,
        tenant_id: &str,
        content: &str,
    ) -> Result<(), String> {
        let embedding = self.embedder.embed(prompt).await?;
        self.entries.lock().await.push(SemanticEntry {
            embedding,
            model: model.to_string(),
            tenant_id: tenant_id.to_string(),
            content: content.to_string(),
            created: Instant::now(),
        });
        Ok(())
    }
}
