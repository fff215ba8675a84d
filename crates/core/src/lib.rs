pub mod chunking;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod indexer;
pub mod ingest;
pub mod models;
pub mod ocr;
pub mod similarity;
pub mod store;
pub mod stores;

pub use chunking::{split_spans, Chunker, PageMap, TextSpan};
pub use config::{
    ChunkingConfig, IndexConfig, OcrConfig, OcrMode, PipelineConfig, DEFAULT_MAX_CONCURRENT_DOCUMENTS,
};
pub use embeddings::{
    CharacterNgramEmbedder, Embedder, HttpEmbedder, DEFAULT_EMBEDDING_DIMENSIONS,
    DEFAULT_EMBEDDING_MODEL_ID,
};
pub use error::{EmbeddingError, IndexError, IngestError, OcrError};
pub use extractor::{DocumentExtractor, OcrDecision};
pub use indexer::{AddReport, FailedChunk, Indexer};
pub use ingest::{discover_documents, BatchReport, DocumentOutcome, DocumentReport, IngestPipeline};
pub use models::{
    Chunk, CollectionStats, Document, DocumentFingerprint, DocumentKind, EntryMetadata,
    ExtractionMetadata, ExtractionMethod, ExtractionResult, FailedPage, ImageFormat, IndexEntry,
    SearchFilter, SearchHit, PAGE_BREAK,
};
pub use ocr::{
    HttpRecognizer, OcrEngine, PageOcr, PdftoppmRasterizer, Rasterizer, Recognizer,
    TesseractRecognizer,
};
pub use similarity::SimilarityMetric;
pub use store::{CollectionManifest, LocalVectorStore, VectorStore};
pub use stores::QdrantStore;
