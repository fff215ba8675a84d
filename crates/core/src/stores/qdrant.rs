use crate::error::IndexError;
use crate::models::{EntryMetadata, PendingEntry, SearchFilter, SearchHit};
use crate::similarity::{rank, SimilarityMetric};
use crate::store::{CollectionManifest, VectorStore};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};
use url::Url;

/// Extra candidates fetched so ties at the cut-off resolve by insertion order.
const TIE_SLACK: usize = 16;

/// A collection stored in a Qdrant server. Point ids double as insertion sequence.
pub struct QdrantStore {
    endpoint: Url,
    manifest: CollectionManifest,
    client: Client,
    next_id: Mutex<Option<u64>>,
}

impl QdrantStore {
    pub fn new(endpoint: &str, manifest: CollectionManifest) -> Result<Self, IndexError> {
        let mut endpoint = Url::parse(endpoint)?;
        if !endpoint.path().ends_with('/') {
            let path = format!("{}/", endpoint.path());
            endpoint.set_path(&path);
        }

        Ok(Self {
            endpoint,
            manifest,
            client: Client::new(),
            next_id: Mutex::new(None),
        })
    }

    fn collection_url(&self, suffix: &str) -> Result<Url, IndexError> {
        Ok(self
            .endpoint
            .join(&format!("collections/{}{suffix}", self.manifest.collection))?)
    }

    /// Creates the collection when missing and checks its vector size otherwise.
    pub async fn ensure_collection(&self) -> Result<(), IndexError> {
        let response = self
            .client
            .get(self.collection_url("")?)
            .send()
            .await
            .map_err(unreachable)?;

        if response.status() == StatusCode::NOT_FOUND {
            let create = self.client.put(self.collection_url("")?).json(&json!({
                "vectors": {
                    "size": self.manifest.dimensions,
                    "distance": self.manifest.metric.qdrant_distance(),
                }
            }));
            send(create).await?;
            info!(collection = %self.manifest.collection, "created qdrant collection");
            return Ok(());
        }

        let parsed = parse(response).await?;
        let size = parsed
            .pointer("/result/config/params/vectors/size")
            .and_then(Value::as_u64)
            .unwrap_or_default() as usize;
        if size != self.manifest.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: size,
                actual: self.manifest.dimensions,
            });
        }
        Ok(())
    }

    async fn remote_count(&self) -> Result<u64, IndexError> {
        let request = self
            .client
            .post(self.collection_url("/points/count")?)
            .json(&json!({ "exact": true }));
        let parsed = send(request).await?;
        Ok(parsed
            .pointer("/result/count")
            .and_then(Value::as_u64)
            .unwrap_or_default())
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn append(&self, entries: Vec<PendingEntry>) -> Result<Vec<u64>, IndexError> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let mut next_id = self.next_id.lock().await;
        let first = match *next_id {
            Some(id) => id,
            None => self.remote_count().await?,
        };

        let mut ids = Vec::with_capacity(entries.len());
        let points = entries
            .into_iter()
            .enumerate()
            .map(|(offset, entry)| {
                if entry.vector.len() != self.manifest.dimensions {
                    return Err(IndexError::DimensionMismatch {
                        expected: self.manifest.dimensions,
                        actual: entry.vector.len(),
                    });
                }
                let id = first + offset as u64;
                ids.push(id);
                Ok(json!({
                    "id": id,
                    "vector": entry.vector,
                    "payload": {
                        "text": entry.text,
                        "metadata": entry.metadata,
                    },
                }))
            })
            .collect::<Result<Vec<_>, IndexError>>()?;

        let request = self
            .client
            .put(format!("{}?wait=true", self.collection_url("/points")?))
            .json(&json!({ "points": points }));
        send(request).await?;

        *next_id = Some(first + ids.len() as u64);
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
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let mut body = json!({
            "vector": query,
            "limit": top_k + TIE_SLACK,
            "with_payload": true,
        });
        if let Some(conditions) = qdrant_filter(filter) {
            body["filter"] = conditions;
        }

        let request = self
            .client
            .post(self.collection_url("/points/search")?)
            .json(&body);
        let parsed = send(request).await?;
        let scored = parse_hits(&parsed, self.manifest.metric)?;

        Ok(rank(scored, top_k)
            .into_iter()
            .map(|(score, entry_id, (text, metadata))| SearchHit {
                entry_id,
                text,
                metadata,
                score,
            })
            .collect())
    }

    async fn reset(&self) -> Result<(), IndexError> {
        let mut next_id = self.next_id.lock().await;
        let response = self
            .client
            .delete(self.collection_url("")?)
            .send()
            .await
            .map_err(unreachable)?;
        if !response.status().is_success() && response.status() != StatusCode::NOT_FOUND {
            return Err(IndexError::BackendResponse {
                backend: "qdrant".to_string(),
                details: response.status().to_string(),
            });
        }

        self.ensure_collection().await?;
        *next_id = Some(0);
        warn!(collection = %self.manifest.collection, "qdrant collection reset");
        Ok(())
    }

    async fn count(&self) -> Result<usize, IndexError> {
        Ok(self.remote_count().await? as usize)
    }

    fn location(&self) -> String {
        self.endpoint.to_string()
    }
}

/// Qdrant `must` conditions on the stored metadata payload.
fn qdrant_filter(filter: &SearchFilter) -> Option<Value> {
    if filter.is_empty() {
        return None;
    }

    let mut must = Vec::new();
    if let Some(source_file) = &filter.source_file {
        must.push(json!({ "key": "metadata.source_file", "match": { "value": source_file } }));
    }
    if let Some(document_id) = &filter.document_id {
        must.push(json!({ "key": "metadata.document_id", "match": { "value": document_id } }));
    }
    if let Some(ocr_used) = filter.ocr_used {
        must.push(json!({ "key": "metadata.ocr_used", "match": { "value": ocr_used } }));
    }
    Some(json!({ "must": must }))
}

type ScoredHit = (f32, u64, (String, EntryMetadata));

/// Euclid scores come back as raw distances, smallest first; they are
/// mapped onto the same higher-is-closer scale as the local store.
fn parse_hits(parsed: &Value, metric: SimilarityMetric) -> Result<Vec<ScoredHit>, IndexError> {
    let hits = parsed
        .pointer("/result")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let mut scored = Vec::with_capacity(hits.len());
    for hit in hits {
        let Some(id) = hit.pointer("/id").and_then(Value::as_u64) else {
            warn!("qdrant hit without numeric id");
            continue;
        };
        let raw = hit.pointer("/score").and_then(Value::as_f64).unwrap_or(0.0) as f32;
        let score = match metric {
            SimilarityMetric::Euclidean => 1.0 / (1.0 + raw.max(0.0)),
            SimilarityMetric::Cosine | SimilarityMetric::DotProduct => raw,
        };
        let text = hit
            .pointer("/payload/text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let metadata: EntryMetadata = serde_json::from_value(
            hit.pointer("/payload/metadata").cloned().unwrap_or(Value::Null),
        )?;
        scored.push((score, id, (text, metadata)));
    }
    Ok(scored)
}

fn unreachable(error: reqwest::Error) -> IndexError {
    if error.is_connect() || error.is_timeout() {
        IndexError::IndexUnavailable(format!("qdrant: {error}"))
    } else {
        IndexError::Http(error)
    }
}

async fn send(request: RequestBuilder) -> Result<Value, IndexError> {
    let response = request.send().await.map_err(unreachable)?;
    parse(response).await
}

async fn parse(response: reqwest::Response) -> Result<Value, IndexError> {
    if !response.status().is_success() {
        return Err(IndexError::BackendResponse {
            backend: "qdrant".to_string(),
            details: response.status().to_string(),
        });
    }
    Ok(response.json().await?)
}
