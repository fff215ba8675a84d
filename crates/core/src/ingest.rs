use crate::chunking::Chunker;
use crate::config::PipelineConfig;
use crate::error::IngestError;
use crate::extractor::DocumentExtractor;
use crate::indexer::{AddReport, Indexer};
use crate::models::{Document, DocumentFingerprint, DocumentKind, ExtractionMetadata};
use crate::ocr::OcrEngine;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};
use walkdir::WalkDir;

/// Files under `folder` with an extension the extractor understands, sorted.
pub fn discover_documents(folder: &Path, recursive: bool) -> Vec<PathBuf> {
    let mut walker = WalkDir::new(folder);
    if !recursive {
        walker = walker.max_depth(1);
    }

    let mut files = Vec::new();
    for entry in walker.into_iter().filter_map(|item| item.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }

        let supported = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(DocumentKind::from_extension)
            .is_some();

        if supported {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentReport {
    pub fingerprint: DocumentFingerprint,
    pub extraction: ExtractionMetadata,
    pub chunks: usize,
    pub index: AddReport,
}

#[derive(Debug)]
pub struct DocumentOutcome {
    pub path: PathBuf,
    pub result: Result<DocumentReport, IngestError>,
}

/// Per-document outcomes of a batch, in input order.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub outcomes: Vec<DocumentOutcome>,
}

impl BatchReport {
    pub fn succeeded(&self) -> impl Iterator<Item = (&Path, &DocumentReport)> {
        self.outcomes.iter().filter_map(|outcome| {
            outcome
                .result
                .as_ref()
                .ok()
                .map(|report| (outcome.path.as_path(), report))
        })
    }

    pub fn failed(&self) -> impl Iterator<Item = (&Path, &IngestError)> {
        self.outcomes.iter().filter_map(|outcome| {
            outcome
                .result
                .as_ref()
                .err()
                .map(|error| (outcome.path.as_path(), error))
        })
    }

    pub fn total_chunks(&self) -> usize {
        self.succeeded().map(|(_, report)| report.index.succeeded).sum()
    }
}

/// Extract, chunk and index, one document at a time or as a batch.
#[derive(Clone)]
pub struct IngestPipeline {
    extractor: DocumentExtractor,
    chunker: Chunker,
    indexer: Arc<Indexer>,
    max_concurrent_documents: usize,
}

impl IngestPipeline {
    /// Validates the whole configuration before anything is read.
    pub fn new(
        config: &PipelineConfig,
        ocr: OcrEngine,
        indexer: Arc<Indexer>,
    ) -> Result<Self, IngestError> {
        config.validate()?;
        Ok(Self {
            extractor: DocumentExtractor::new(&config.ocr, ocr)?,
            chunker: Chunker::new(config.chunking)?,
            indexer,
            max_concurrent_documents: config.max_concurrent_documents,
        })
    }

    pub fn indexer(&self) -> &Arc<Indexer> {
        &self.indexer
    }

    pub async fn ingest_document(&self, document: Document) -> Result<DocumentReport, IngestError> {
        self.run(move || Ok(document)).await
    }

    pub async fn ingest_path(&self, path: &Path) -> Result<DocumentReport, IngestError> {
        let path = path.to_path_buf();
        self.run(move || Document::open(&path, None)).await
    }

    /// Ingests every path, at most `max_concurrent_documents` at a time.
    /// A failing document never affects its siblings.
    pub async fn ingest_paths(&self, paths: Vec<PathBuf>) -> BatchReport {
        let permits = Arc::new(Semaphore::new(self.max_concurrent_documents));
        let mut tasks = JoinSet::new();
        for (position, path) in paths.iter().cloned().enumerate() {
            let pipeline = self.clone();
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let result = match permits.acquire_owned().await {
                    Ok(_permit) => pipeline.ingest_path(&path).await,
                    Err(_) => Err(IngestError::DocumentUnreadable(format!(
                        "ingestion of {} was cancelled",
                        path.display()
                    ))),
                };
                (position, result)
            });
        }

        let mut results: Vec<Option<Result<DocumentReport, IngestError>>> =
            paths.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((position, result)) => results[position] = Some(result),
                Err(error) => warn!(error = %error, "ingestion task aborted"),
            }
        }

        let outcomes = paths
            .into_iter()
            .zip(results)
            .map(|(path, result)| {
                let result = result.unwrap_or_else(|| {
                    Err(IngestError::DocumentUnreadable(format!(
                        "ingestion of {} was aborted",
                        path.display()
                    )))
                });
                if let Err(error) = &result {
                    warn!(document = %path.display(), error = %error, "document skipped");
                }
                DocumentOutcome { path, result }
            })
            .collect();

        BatchReport { outcomes }
    }

    pub async fn ingest_folder(&self, folder: &Path, recursive: bool) -> Result<BatchReport, IngestError> {
        if !folder.is_dir() {
            return Err(IngestError::DocumentUnreadable(format!(
                "{} is not a directory",
                folder.display()
            )));
        }

        let files = discover_documents(folder, recursive);
        if files.is_empty() {
            warn!(folder = %folder.display(), "no supported documents found");
        }
        Ok(self.ingest_paths(files).await)
    }

    async fn run<F>(&self, load: F) -> Result<DocumentReport, IngestError>
    where
        F: FnOnce() -> Result<Document, IngestError> + Send + 'static,
    {
        let extractor = self.extractor.clone();
        let chunker = self.chunker;

        // file reads, PDF parsing and OCR all block
        let prepared = tokio::task::spawn_blocking(move || {
            let document = load()?;
            let extraction = extractor.extract(&document)?;
            let chunks = chunker.chunk(&document, &extraction);
            Ok::<_, IngestError>((document.fingerprint(), extraction, chunks))
        })
        .await
        .map_err(|error| IngestError::DocumentUnreadable(format!("extraction task failed: {error}")))?;
        let (fingerprint, extraction, chunks) = prepared?;

        let index = self.indexer.add(&chunks).await?;
        info!(
            document = %fingerprint.document_title,
            method = %extraction.method,
            chars = extraction.char_count,
            pages = extraction.page_count(),
            chunks = chunks.len(),
            "document ingested"
        );

        Ok(DocumentReport {
            fingerprint,
            extraction: extraction.metadata(),
            chunks: chunks.len(),
            index,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::extractor::testing::{build_docx, build_pdf};
    use crate::models::ExtractionMethod;
    use crate::error::OcrError;
    use crate::ocr::testing::{FakeRasterizer, FakeRecognizer};
    use crate::ocr::Recognizer;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    const LONG_PAGE: &str = "Section 4 Management Approach. The program office holds weekly status reviews and escalates risks to the contracting officer within two days.";

    async fn pipeline(
        recognizer: FakeRecognizer,
    ) -> Result<(TempDir, IngestPipeline), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let config = PipelineConfig {
            index: IndexConfig {
                persist_directory: dir.path().join("index"),
                ..IndexConfig::default()
            },
            ..PipelineConfig::default()
        };
        let indexer = Indexer::open_local(&config.index, Arc::new(CharacterNgramEmbedder::default())).await?;
        let engine = OcrEngine::new(Arc::new(FakeRasterizer), Arc::new(recognizer), config.ocr.dpi);
        let pipeline = IngestPipeline::new(&config, engine, Arc::new(indexer))?;
        Ok((dir, pipeline))
    }

    #[test]
    fn discover_documents_honours_recursion() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let nested = dir.path().join("nested");
        fs::create_dir(&nested)?;
        fs::write(dir.path().join("b.txt"), "text")?;
        fs::write(dir.path().join("a.pdf"), "%PDF-1.4")?;
        fs::write(dir.path().join("notes.xyz"), "ignored")?;
        fs::write(nested.join("c.docx"), "zip")?;

        let flat = discover_documents(dir.path(), false);
        let names: Vec<_> = flat
            .iter()
            .filter_map(|path| path.file_name().and_then(|name| name.to_str()))
            .collect();
        assert_eq!(names, vec!["a.pdf", "b.txt"]);

        assert_eq!(discover_documents(dir.path(), true).len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn invalid_chunk_config_fails_before_processing() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let mut config = PipelineConfig::default();
        config.index.persist_directory = dir.path().to_path_buf();
        config.chunking.chunk_overlap = config.chunking.max_chunk_size;

        let indexer = Indexer::open_local(&config.index, Arc::new(CharacterNgramEmbedder::default())).await?;
        let engine = OcrEngine::new(Arc::new(FakeRasterizer), Arc::new(FakeRecognizer::default()), 300);
        let result = IngestPipeline::new(&config, engine, Arc::new(indexer));
        assert!(matches!(result, Err(IngestError::InvalidChunkConfig(_))));
        Ok(())
    }

    #[tokio::test]
    async fn scanned_pdf_is_indexed_with_ocr_provenance() -> Result<(), Box<dyn std::error::Error>> {
        let (dir, pipeline) = pipeline(FakeRecognizer::failing(&[2])).await?;
        let path = dir.path().join("scanned.pdf");
        fs::write(&path, build_pdf(&["", "", ""]))?;

        let report = pipeline.ingest_path(&path).await?;
        assert_eq!(report.extraction.method, ExtractionMethod::Ocr);
        assert!(report.extraction.ocr_used);
        assert_eq!(report.extraction.pages, 3);
        assert_eq!(report.extraction.failed_pages.len(), 1);
        assert!(report.index.failed.is_empty());

        let hits = pipeline.indexer().search("recognized text for scanned page 3", 5).await?;
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|hit| hit.metadata.ocr_used));
        assert_eq!(hits[0].metadata.source_file, "scanned.pdf");
        Ok(())
    }

    #[tokio::test]
    async fn batch_isolates_failing_documents() -> Result<(), Box<dyn std::error::Error>> {
        let (dir, pipeline) = pipeline(FakeRecognizer::default()).await?;
        let docs = dir.path().join("docs");
        fs::create_dir(&docs)?;
        fs::write(docs.join("a_direct.pdf"), build_pdf(&[LONG_PAGE]))?;
        fs::write(docs.join("b_broken.pdf"), b"%PDF-1.4\n%broken")?;
        fs::write(docs.join("c_memo.docx"), build_docx(&[LONG_PAGE, "Staffing plan attached."]))?;
        fs::write(docs.join("d_short.txt"), "Past performance summary for the county contracts.")?;

        let report = pipeline.ingest_folder(&docs, false).await?;
        assert_eq!(report.outcomes.len(), 4);
        assert_eq!(report.succeeded().count(), 3);

        let failed: Vec<_> = report.failed().collect();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].0.ends_with("b_broken.pdf"));
        assert!(matches!(failed[0].1, IngestError::DocumentUnreadable(_)));

        let methods: Vec<_> = report
            .succeeded()
            .map(|(_, document)| document.extraction.method)
            .collect();
        assert_eq!(
            methods,
            vec![ExtractionMethod::Direct, ExtractionMethod::Direct, ExtractionMethod::Ocr]
        );

        let stats = pipeline.indexer().stats().await?;
        assert_eq!(stats.total_entries, report.total_chunks());
        Ok(())
    }

    #[tokio::test]
    async fn missing_ocr_backend_fails_only_that_document() -> Result<(), Box<dyn std::error::Error>> {
        let (dir, pipeline) = pipeline(FakeRecognizer::missing()).await?;
        let scanned = dir.path().join("scanned.pdf");
        let digital = dir.path().join("digital.pdf");
        fs::write(&scanned, build_pdf(&[""]))?;
        fs::write(&digital, build_pdf(&[LONG_PAGE]))?;

        let report = pipeline.ingest_paths(vec![scanned, digital]).await;
        assert!(matches!(
            report.outcomes[0].result,
            Err(IngestError::OcrUnavailable(_))
        ));
        assert!(report.outcomes[1].result.is_ok());
        Ok(())
    }

    /// Slow recognizer that records how many pages it is handling at once.
    #[derive(Default)]
    struct GaugedRecognizer {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Recognizer for GaugedRecognizer {
        fn name(&self) -> &str {
            "gauged-ocr"
        }

        fn check_available(&self) -> Result<(), OcrError> {
            Ok(())
        }

        fn recognize(&self, _image: &[u8], _dpi: u32) -> Result<String, OcrError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok("scanned cover letter".to_string())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn batch_respects_document_concurrency_limit() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let config = PipelineConfig {
            index: IndexConfig {
                persist_directory: dir.path().join("index"),
                ..IndexConfig::default()
            },
            max_concurrent_documents: 2,
            ..PipelineConfig::default()
        };
        let indexer = Indexer::open_local(&config.index, Arc::new(CharacterNgramEmbedder::default())).await?;
        let recognizer = Arc::new(GaugedRecognizer::default());
        let engine = OcrEngine::new(Arc::new(FakeRasterizer), recognizer.clone(), config.ocr.dpi);
        let pipeline = IngestPipeline::new(&config, engine, Arc::new(indexer))?;

        let paths = (0..6)
            .map(|index| {
                let path = dir.path().join(format!("scan{index}.pdf"));
                fs::write(&path, build_pdf(&[""]))?;
                Ok(path)
            })
            .collect::<Result<Vec<_>, std::io::Error>>()?;

        let report = pipeline.ingest_paths(paths).await;
        assert_eq!(report.succeeded().count(), 6);
        let peak = recognizer.peak.load(Ordering::SeqCst);
        assert!((1..=2).contains(&peak), "peak concurrency {peak}");
        Ok(())
    }

    #[tokio::test]
    async fn reingestion_after_reset_is_idempotent() -> Result<(), Box<dyn std::error::Error>> {
        let (dir, pipeline) = pipeline(FakeRecognizer::default()).await?;
        let path = dir.path().join("approach.txt");
        fs::write(&path, LONG_PAGE.repeat(12))?;

        let first = pipeline.ingest_path(&path).await?;
        let before = pipeline.indexer().search("weekly status reviews", 100).await?;

        pipeline.indexer().reset().await?;
        let second = pipeline.ingest_path(&path).await?;
        let after = pipeline.indexer().search("weekly status reviews", 100).await?;

        assert_eq!(first.chunks, second.chunks);
        assert_eq!(first.fingerprint.document_id, second.fingerprint.document_id);
        assert_eq!(before.len(), after.len());
        for (left, right) in before.iter().zip(&after) {
            assert_eq!(left.metadata, right.metadata);
            assert_eq!(left.text, right.text);
        }
        Ok(())
    }

    #[tokio::test]
    async fn unsupported_file_reports_its_format() -> Result<(), Box<dyn std::error::Error>> {
        let (dir, pipeline) = pipeline(FakeRecognizer::default()).await?;
        let path = dir.path().join("budget.xyz");
        fs::write(&path, [0u8, 159, 146, 150])?;

        let result = pipeline.ingest_path(&path).await;
        assert!(matches!(result, Err(IngestError::UnsupportedFormat(_))));
        Ok(())
    }

    #[tokio::test]
    async fn in_memory_document_is_ingested() -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, pipeline) = pipeline(FakeRecognizer::default()).await?;
        let document = Document::from_bytes("inline.txt", LONG_PAGE.as_bytes().to_vec(), None)?;

        let report = pipeline.ingest_document(document).await?;
        assert_eq!(report.chunks, 1);
        assert_eq!(report.index.succeeded, 1);
        assert_eq!(report.fingerprint.document_title, "inline.txt");
        Ok(())
    }
}
