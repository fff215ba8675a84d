use crate::config::IndexConfig;
use crate::embeddings::{check_dimensions, Embedder};
use crate::error::{EmbeddingError, IndexError};
use crate::models::{Chunk, CollectionStats, EntryMetadata, PendingEntry, SearchFilter, SearchHit};
use crate::similarity::SimilarityMetric;
use crate::store::{CollectionManifest, LocalVectorStore, VectorStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// A chunk the embedder could not turn into a vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedChunk {
    pub document_id: String,
    pub chunk_index: u64,
    pub reason: String,
}

/// Outcome of one `add` call. Partial success is normal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddReport {
    pub succeeded: usize,
    pub failed: Vec<FailedChunk>,
    pub entry_ids: Vec<u64>,
}

impl AddReport {
    pub fn failed_indices(&self) -> Vec<u64> {
        self.failed.iter().map(|chunk| chunk.chunk_index).collect()
    }
}

/// Embeds chunks into a vector collection and answers queries against it.
///
/// `add` and `search` share the gate; `reset` holds it exclusively so it
/// never races with either.
pub struct Indexer {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    collection: String,
    metric: SimilarityMetric,
    gate: RwLock<()>,
}

impl Indexer {
    pub fn new(
        collection: impl Into<String>,
        metric: SimilarityMetric,
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            store,
            embedder,
            collection: collection.into(),
            metric,
            gate: RwLock::new(()),
        }
    }

    /// The manifest a collection built from `config` with `embedder` must carry.
    pub fn manifest_for(
        config: &IndexConfig,
        embedder: &dyn Embedder,
    ) -> Result<CollectionManifest, IndexError> {
        if embedder.dimensions() != config.embedding_dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: config.embedding_dimensions,
                actual: embedder.dimensions(),
            });
        }
        if embedder.model_id() != config.embedding_model_id {
            return Err(IndexError::IndexUnavailable(format!(
                "embedder is {} but the index is configured for {}",
                embedder.model_id(),
                config.embedding_model_id
            )));
        }

        Ok(CollectionManifest {
            collection: config.collection.clone(),
            embedding_model_id: config.embedding_model_id.clone(),
            dimensions: config.embedding_dimensions,
            metric: config.similarity_metric,
        })
    }

    /// Opens (or creates) the durable collection under `config.persist_directory`.
    pub async fn open_local(
        config: &IndexConfig,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self, IndexError> {
        let manifest = Self::manifest_for(config, embedder.as_ref())?;
        let store = LocalVectorStore::open(&config.persist_directory, manifest).await?;
        Ok(Self::new(
            config.collection.clone(),
            config.similarity_metric,
            Arc::new(store),
            embedder,
        ))
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Embeds and appends one entry per chunk.
    ///
    /// Chunks whose embedding fails are listed in the report and skipped.
    /// Only a store failure fails the call.
    pub async fn add(&self, chunks: &[Chunk]) -> Result<AddReport, IndexError> {
        if chunks.is_empty() {
            return Ok(AddReport::default());
        }

        let texts: Vec<String> = chunks.iter().map(|chunk| chunk.text.clone()).collect();
        let vectors = embed_all(Arc::clone(&self.embedder), texts).await?;

        let mut pending = Vec::with_capacity(chunks.len());
        let mut failed = Vec::new();
        for (chunk, vector) in chunks.iter().zip(vectors) {
            match vector {
                Ok(vector) => pending.push(PendingEntry {
                    text: chunk.text.clone(),
                    vector,
                    metadata: EntryMetadata::from(chunk),
                }),
                Err(error) => {
                    warn!(
                        document = %chunk.source_file,
                        chunk_index = chunk.chunk_index,
                        error = %error,
                        "embedding failed"
                    );
                    failed.push(FailedChunk {
                        document_id: chunk.document_id.clone(),
                        chunk_index: chunk.chunk_index,
                        reason: error.to_string(),
                    });
                }
            }
        }

        let entry_ids = {
            let _shared = self.gate.read().await;
            self.store.append(pending).await?
        };

        info!(
            collection = %self.collection,
            succeeded = entry_ids.len(),
            failed = failed.len(),
            "indexed chunks"
        );
        Ok(AddReport {
            succeeded: entry_ids.len(),
            failed,
            entry_ids,
        })
    }

    /// The `top_k` nearest entries to `query`, best first.
    pub async fn search(&self, query: &str, top_k: usize) -> Result<Vec<SearchHit>, IndexError> {
        self.search_with(query, top_k, &SearchFilter::default()).await
    }

    /// Like [`Indexer::search`], restricted to entries whose metadata matches `filter`.
    pub async fn search_with(
        &self,
        query: &str,
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<SearchHit>, IndexError> {
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let mut vectors = embed_all(Arc::clone(&self.embedder), vec![query.to_string()]).await?;
        let vector = vectors
            .pop()
            .unwrap_or_else(|| Err(EmbeddingError::Response("no query embedding".to_string())))?;

        let _shared = self.gate.read().await;
        self.store.nearest(&vector, top_k, filter).await
    }

    /// Clears the whole collection. Waits for in-flight `add`/`search` calls.
    pub async fn reset(&self) -> Result<(), IndexError> {
        let _exclusive = self.gate.write().await;
        self.store.reset().await?;
        warn!(collection = %self.collection, "index reset");
        Ok(())
    }

    pub async fn stats(&self) -> Result<CollectionStats, IndexError> {
        let _shared = self.gate.read().await;
        Ok(CollectionStats {
            collection: self.collection.clone(),
            total_entries: self.store.count().await?,
            embedding_model_id: self.embedder.model_id().to_string(),
            dimensions: self.embedder.dimensions(),
            metric: self.metric,
            location: self.store.location(),
        })
    }
}

/// Embedders may block on the network, so they run off the async workers.
async fn embed_all(
    embedder: Arc<dyn Embedder>,
    texts: Vec<String>,
) -> Result<Vec<Result<Vec<f32>, EmbeddingError>>, IndexError> {
    let vectors = tokio::task::spawn_blocking(move || {
        texts
            .iter()
            .map(|text| {
                embedder
                    .embed(text)
                    .and_then(|vector| check_dimensions(embedder.as_ref(), vector))
            })
            .collect::<Vec<_>>()
    })
    .await?;
    Ok(vectors)
}
