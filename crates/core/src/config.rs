use crate::error::IngestError;
use crate::similarity::SimilarityMetric;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_OCR_THRESHOLD_CHARS: usize = 100;
pub const DEFAULT_DPI: u32 = 300;
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 1_000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;
pub const DEFAULT_BOUNDARY_LOOKBACK: usize = 200;
pub const DEFAULT_MAX_CONCURRENT_DOCUMENTS: usize = 4;

/// How the OCR fallback stage may be used for a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrMode {
    /// OCR runs only when direct yield is below the threshold.
    Auto,
    /// OCR runs on every page regardless of direct yield.
    Force,
    /// OCR never runs; low yield fails with `InsufficientText`.
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    pub ocr_threshold_chars: usize,
    pub dpi: u32,
    pub force_ocr: bool,
    pub disable_ocr: bool,
    pub language: String,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            ocr_threshold_chars: DEFAULT_OCR_THRESHOLD_CHARS,
            dpi: DEFAULT_DPI,
            force_ocr: false,
            disable_ocr: false,
            language: "eng".to_string(),
        }
    }
}

impl OcrConfig {
    pub fn mode(&self) -> Result<OcrMode, IngestError> {
        match (self.force_ocr, self.disable_ocr) {
            (true, true) => Err(IngestError::InvalidConfig(
                "force_ocr and disable_ocr are mutually exclusive".to_string(),
            )),
            (true, false) => Ok(OcrMode::Force),
            (false, true) => Ok(OcrMode::Disabled),
            (false, false) => Ok(OcrMode::Auto),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub max_chunk_size: usize,
    pub chunk_overlap: usize,
    /// How far back from a hard cut the chunker looks for a natural break.
    pub boundary_lookback: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            boundary_lookback: DEFAULT_BOUNDARY_LOOKBACK,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.max_chunk_size == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "max_chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.chunk_overlap >= self.max_chunk_size {
            return Err(IngestError::InvalidChunkConfig(format!(
                "chunk_overlap {} must be less than max_chunk_size {}",
                self.chunk_overlap, self.max_chunk_size
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub collection: String,
    pub persist_directory: PathBuf,
    pub embedding_model_id: String,
    pub embedding_dimensions: usize,
    pub similarity_metric: SimilarityMetric,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            collection: "proposal_documents".to_string(),
            persist_directory: PathBuf::from("./data/vectordb"),
            embedding_model_id: crate::embeddings::DEFAULT_EMBEDDING_MODEL_ID.to_string(),
            embedding_dimensions: crate::embeddings::DEFAULT_EMBEDDING_DIMENSIONS,
            similarity_metric: SimilarityMetric::Cosine,
        }
    }
}

/// Everything one pipeline run needs. Built once and handed to each
/// component at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub ocr: OcrConfig,
    pub chunking: ChunkingConfig,
    pub index: IndexConfig,
    /// Documents a batch extracts and indexes at the same time.
    pub max_concurrent_documents: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ocr: OcrConfig::default(),
            chunking: ChunkingConfig::default(),
            index: IndexConfig::default(),
            max_concurrent_documents: DEFAULT_MAX_CONCURRENT_DOCUMENTS,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), IngestError> {
        self.chunking.validate()?;
        self.ocr.mode()?;
        if self.ocr.dpi == 0 {
            return Err(IngestError::InvalidConfig("dpi must be greater than zero".to_string()));
        }
        if self.index.embedding_dimensions == 0 {
            return Err(IngestError::InvalidConfig(
                "embedding_dimensions must be greater than zero".to_string(),
            ));
        }
        if self.max_concurrent_documents == 0 {
            return Err(IngestError::InvalidConfig(
                "max_concurrent_documents must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
