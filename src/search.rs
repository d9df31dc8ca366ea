//! Embedding, nearest-neighbour and summarization collaborators
//!
//! Tools only see the three traits. The local implementations keep the binary
//! self-contained: a feature-hashing embedder, a brute-force L2 index over a
//! directory of text files, and a lead-sentence summarizer.

use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::{Arc, RwLock};

use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

pub const DEFAULT_DIMENSIONS: usize = 384;
pub const DEFAULT_SUMMARY_CHARS: usize = 280;

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("embedding failed: {0}")]
    Embedding(String),
    #[error("vector search failed: {0}")]
    Search(String),
    #[error("summarization failed: {0}")]
    Summarization(String),
    #[error("failed to load documents from {path}: {source}")]
    Load {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentRecord {
    pub file_name: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Neighbor {
    pub distance: f32,
    pub record: DocumentRecord,
}

pub trait TextTransform: Send + Sync {
    fn transform(&self, input: &str) -> Result<String, CollaboratorError>;
}

pub trait Embed: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>, CollaboratorError>;
}

pub trait NearestNeighbors: Send + Sync {
    fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, CollaboratorError>;
}

/// The collaborators a search tool needs, bundled for sharing across sessions.
#[derive(Clone)]
pub struct SearchBackend {
    pub embedder: Arc<dyn Embed>,
    pub index: Arc<dyn NearestNeighbors>,
    pub summarizer: Arc<dyn TextTransform>,
}

impl SearchBackend {
    /// Local backend over every `*.txt` file in `docs_dir`, or an empty index.
    pub fn local(docs_dir: Option<&Path>) -> Result<Self, CollaboratorError> {
        let embedder = Arc::new(HashingEmbedder::new(DEFAULT_DIMENSIONS)?);
        let index = InMemoryIndex::new();

        if let Some(dir) = docs_dir {
            let documents = load_documents(dir)?;
            for document in documents {
                let vector = embedder.embed(&document.content)?;
                index.insert(document, vector)?;
            }
            info!(
                docs_dir = %dir.display(),
                documents = index.len(),
                "search index loaded"
            );
        }

        Ok(Self {
            embedder,
            index: Arc::new(index),
            summarizer: Arc::new(LeadSentenceSummarizer::new(DEFAULT_SUMMARY_CHARS)),
        })
    }
}

pub fn load_documents(dir: &Path) -> Result<Vec<DocumentRecord>, CollaboratorError> {
    let load_error = |source| CollaboratorError::Load {
        path: dir.display().to_string(),
        source,
    };

    let mut paths = fs::read_dir(dir)
        .map_err(load_error)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "txt"))
        .collect::<Vec<_>>();
    paths.sort();

    paths
        .into_iter()
        .map(|path| {
            let content = fs::read_to_string(&path).map_err(load_error)?;
            let file_name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            Ok(DocumentRecord { file_name, content })
        })
        .collect()
}

const TOKEN_PATTERN: &str = r"[\p{L}\p{N}]+";

pub struct HashingEmbedder {
    dimensions: usize,
    tokenizer: Regex,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Result<Self, CollaboratorError> {
        let tokenizer = Regex::new(TOKEN_PATTERN)
            .map_err(|err| CollaboratorError::Embedding(format!("invalid token pattern: {err}")))?;
        Ok(Self {
            dimensions: dimensions.max(1),
            tokenizer,
        })
    }
}

impl Embed for HashingEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, CollaboratorError> {
        let mut vector = vec![0.0_f32; self.dimensions];
        for token in self.tokenizer.find_iter(text) {
            let mut hasher = DefaultHasher::new();
            token.as_str().to_lowercase().hash(&mut hasher);
            let bucket = (hasher.finish() % self.dimensions as u64) as usize;
            vector[bucket] += 1.0;
        }

        let norm = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|value| *value /= norm);
        }
        Ok(vector)
    }
}

#[derive(Default)]
pub struct InMemoryIndex {
    rows: RwLock<Vec<(Vec<f32>, DocumentRecord)>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: DocumentRecord, vector: Vec<f32>) -> Result<(), CollaboratorError> {
        self.rows
            .write()
            .map_err(|_| CollaboratorError::Search("index lock poisoned".to_string()))?
            .push((vector, record));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.read().map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NearestNeighbors for InMemoryIndex {
    fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, CollaboratorError> {
        let rows = self
            .rows
            .read()
            .map_err(|_| CollaboratorError::Search("index lock poisoned".to_string()))?;

        let mut neighbors = Vec::with_capacity(rows.len());
        for (vector, record) in rows.iter() {
            if vector.len() != query.len() {
                return Err(CollaboratorError::Search(format!(
                    "dimension mismatch: query has {}, {} has {}",
                    query.len(),
                    record.file_name,
                    vector.len()
                )));
            }
            let distance = vector
                .iter()
                .zip(query)
                .map(|(a, b)| (a - b) * (a - b))
                .sum::<f32>()
                .sqrt();
            neighbors.push(Neighbor {
                distance,
                record: record.clone(),
            });
        }

        neighbors.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        neighbors.truncate(k);
        Ok(neighbors)
    }
}

pub struct LeadSentenceSummarizer {
    max_chars: usize,
}

impl LeadSentenceSummarizer {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }
}

impl TextTransform for LeadSentenceSummarizer {
    fn transform(&self, input: &str) -> Result<String, CollaboratorError> {
        let text = input.split_whitespace().collect::<Vec<_>>().join(" ");

        let mut summary = String::new();
        for sentence in text.split_inclusive(['.', '!', '?']) {
            if !summary.is_empty() && summary.len() + sentence.len() > self.max_chars {
                break;
            }
            summary.push_str(sentence);
        }

        if summary.chars().count() > self.max_chars {
            summary = summary.chars().take(self.max_chars).collect();
        }
        Ok(summary.trim().to_string())
    }
}
