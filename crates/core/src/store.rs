//! Durable vector collections.
//!
//! [`VectorStore`] is the seam the indexer writes through. [`LocalVectorStore`]
//! keeps the collection in a directory on disk; [`QdrantStore`] talks to a
//! Qdrant server over HTTP.

use crate::error::IndexError;
use crate::models::{IndexEntry, PendingEntry, SearchFilter, SearchHit};
use crate::similarity::{rank, SimilarityMetric};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{info, warn};

const MANIFEST_FILE: &str = "collection.json";
const ENTRIES_FILE: &str = "entries.jsonl";

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Appends entries in order. On error nothing from the batch is kept.
    async fn append(&self, entries: Vec<PendingEntry>) -> Result<Vec<u64>, IndexError>;

    /// Highest-scoring entries matching `filter` first, ties broken by
    /// insertion order.
    async fn nearest(
        &self,
        query: &[f32],
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<SearchHit>, IndexError>;

    /// Drops every entry. Irreversible.
    async fn reset(&self) -> Result<(), IndexError>;

    async fn count(&self) -> Result<usize, IndexError>;

    /// Where the collection lives, for stats and logs.
    fn location(&self) -> String;
}

/// Identity of a collection; fixed until the next reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionManifest {
    pub collection: String,
    pub embedding_model_id: String,
    pub dimensions: usize,
    pub metric: SimilarityMetric,
}

struct Collection {
    entries: Vec<IndexEntry>,
    next_id: u64,
    /// Length of the log up to the last committed batch.
    log_len: u64,
    log: Option<File>,
}

/// A collection persisted as a manifest plus an append-only JSON-lines log.
pub struct LocalVectorStore {
    root: PathBuf,
    manifest: CollectionManifest,
    state: RwLock<Collection>,
}

impl LocalVectorStore {
    /// Opens the collection under `root/<collection>`, replaying any existing log.
    pub async fn open(root: &Path, manifest: CollectionManifest) -> Result<Self, IndexError> {
        let root = root.join(&manifest.collection);
        fs::create_dir_all(&root)
            .await
            .map_err(|error| unavailable(&root, error))?;

        let manifest_path = root.join(MANIFEST_FILE);
        match fs::read(&manifest_path).await {
            Ok(raw) => {
                let existing: CollectionManifest = serde_json::from_slice(&raw)?;
                if existing.dimensions != manifest.dimensions {
                    return Err(IndexError::DimensionMismatch {
                        expected: existing.dimensions,
                        actual: manifest.dimensions,
                    });
                }
                if existing != manifest {
                    return Err(IndexError::IndexUnavailable(format!(
                        "collection {} was built with model {} and metric {}; reset it before switching",
                        existing.collection,
                        existing.embedding_model_id,
                        existing.metric.as_str()
                    )));
                }
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                write_manifest(&manifest_path, &manifest).await?;
            }
            Err(error) => return Err(unavailable(&manifest_path, error)),
        }

        let log_path = root.join(ENTRIES_FILE);
        let (entries, torn) = replay_log(&log_path).await?;
        if torn {
            compact_log(&log_path, &entries).await?;
        }
        let next_id = entries.last().map_or(0, |entry| entry.entry_id + 1);
        let log_len = match fs::metadata(&log_path).await {
            Ok(meta) => meta.len(),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => 0,
            Err(error) => return Err(unavailable(&log_path, error)),
        };
        info!(
            collection = %manifest.collection,
            entries = entries.len(),
            path = %root.display(),
            "opened local vector collection"
        );

        Ok(Self {
            root,
            manifest,
            state: RwLock::new(Collection {
                entries,
                next_id,
                log_len,
                log: None,
            }),
        })
    }

    pub fn manifest(&self) -> &CollectionManifest {
        &self.manifest
    }

    /// Cuts the log back to `len`, dropping whatever a failed batch left behind.
    async fn rollback_log(&self, len: u64) {
        let path = self.root.join(ENTRIES_FILE);
        let truncated = match OpenOptions::new().write(true).open(&path).await {
            Ok(file) => file.set_len(len).await,
            Err(error) => Err(error),
        };
        if let Err(error) = truncated {
            warn!(path = %path.display(), error = %error, "could not roll back partial batch");
        }
    }

    async fn log_handle(&self, log: &mut Option<File>) -> Result<(), IndexError> {
        if log.is_none() {
            let path = self.root.join(ENTRIES_FILE);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .map_err(|error| unavailable(&path, error))?;
            *log = Some(file);
        }
        Ok(())
    }
}

#[async_trait]
impl VectorStore for LocalVectorStore {
    async fn append(&self, entries: Vec<PendingEntry>) -> Result<Vec<u64>, IndexError> {
        for entry in &entries {
            if entry.vector.len() != self.manifest.dimensions {
                return Err(IndexError::DimensionMismatch {
                    expected: self.manifest.dimensions,
                    actual: entry.vector.len(),
                });
            }
        }

        let mut state = self.state.write().await;
        let first_id = state.next_id;
        let mut batch = Vec::with_capacity(entries.len());
        let mut raw = Vec::new();
        for (offset, pending) in entries.into_iter().enumerate() {
            let entry = IndexEntry {
                entry_id: first_id + offset as u64,
                text: pending.text,
                vector: pending.vector,
                metadata: pending.metadata,
            };
            raw.extend(serde_json::to_vec(&entry)?);
            raw.push(b'\n');
            batch.push(entry);
        }
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let mut log = state.log.take();
        self.log_handle(&mut log).await?;
        let written = match log.as_mut() {
            Some(file) => write_batch(file, &raw).await,
            None => Ok(()),
        };

        if let Err(error) = written {
            // the handle is dropped and reopened by the next append
            self.rollback_log(state.log_len).await;
            return Err(unavailable(&self.root, error));
        }

        state.log = log;
        state.log_len += raw.len() as u64;
        state.next_id += batch.len() as u64;
        let ids = batch.iter().map(|entry| entry.entry_id).collect();
        state.entries.extend(batch);
        Ok(ids)
    }

    async fn nearest(
        &self,
        query: &[f32],
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<SearchHit>, IndexError> {
        if query.len() != self.manifest.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.manifest.dimensions,
                actual: query.len(),
            });
        }

        let state = self.state.read().await;
        let scored = state
            .entries
            .iter()
            .filter(|entry| filter.matches(&entry.metadata))
            .filter_map(|entry| {
                let score = self.manifest.metric.score(query, &entry.vector)?;
                Some((score, entry.entry_id, entry))
            })
            .collect::<Vec<_>>();

        Ok(rank(scored, top_k)
            .into_iter()
            .map(|(score, entry_id, entry)| SearchHit {
                entry_id,
                text: entry.text.clone(),
                metadata: entry.metadata.clone(),
                score,
            })
            .collect())
    }

    async fn reset(&self) -> Result<(), IndexError> {
        let mut state = self.state.write().await;
        state.log = None;

        let path = self.root.join(ENTRIES_FILE);
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => return Err(unavailable(&path, error)),
        }
        write_manifest(&self.root.join(MANIFEST_FILE), &self.manifest).await?;

        let dropped = state.entries.len();
        state.entries.clear();
        state.next_id = 0;
        state.log_len = 0;
        warn!(collection = %self.manifest.collection, dropped, "collection reset");
        Ok(())
    }

    async fn count(&self) -> Result<usize, IndexError> {
        Ok(self.state.read().await.entries.len())
    }

    fn location(&self) -> String {
        self.root.display().to_string()
    }
}

async fn write_batch(file: &mut File, raw: &[u8]) -> std::io::Result<()> {
    file.write_all(raw).await?;
    file.flush().await
}

async fn write_manifest(path: &Path, manifest: &CollectionManifest) -> Result<(), IndexError> {
    let raw = serde_json::to_vec_pretty(manifest)?;
    fs::write(path, raw).await.map_err(|error| unavailable(path, error))
}

/// Returns the readable entries and whether any line had to be skipped.
async fn replay_log(path: &Path) -> Result<(Vec<IndexEntry>, bool), IndexError> {
    let raw = match fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), false)),
        Err(error) => return Err(unavailable(path, error)),
    };

    let mut entries = Vec::new();
    let mut torn = false;
    for (line_no, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<IndexEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(error) => {
                // a torn final line from an interrupted writer
                warn!(line = line_no + 1, error = %error, "skipping unreadable index entry");
                torn = true;
            }
        }
    }
    Ok((entries, torn))
}

async fn compact_log(path: &Path, entries: &[IndexEntry]) -> Result<(), IndexError> {
    let mut raw = Vec::new();
    for entry in entries {
        raw.extend(serde_json::to_vec(entry)?);
        raw.push(b'\n');
    }
    fs::write(path, raw).await.map_err(|error| unavailable(path, error))
}

fn unavailable(path: &Path, error: std::io::Error) -> IndexError {
    IndexError::IndexUnavailable(format!("{}: {error}", path.display()))
}
