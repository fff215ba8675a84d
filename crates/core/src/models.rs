use crate::error::IngestError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;

/// Separates page texts inside `ExtractionResult::text`.
pub const PAGE_BREAK: char = '\u{000C}';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
    Tiff,
    Bmp,
}

/// Closed set of document types the extractor understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Pdf,
    Word,
    PlainText,
    Image(ImageFormat),
}

impl DocumentKind {
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "pdf" => Some(DocumentKind::Pdf),
            // legacy binary .doc is not a zip archive and has no reader here
            "docx" => Some(DocumentKind::Word),
            "txt" | "text" | "md" => Some(DocumentKind::PlainText),
            "png" => Some(DocumentKind::Image(ImageFormat::Png)),
            "jpg" | "jpeg" => Some(DocumentKind::Image(ImageFormat::Jpeg)),
            "tif" | "tiff" => Some(DocumentKind::Image(ImageFormat::Tiff)),
            "bmp" => Some(DocumentKind::Image(ImageFormat::Bmp)),
            _ => None,
        }
    }

    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(b"%PDF") {
            Some(DocumentKind::Pdf)
        } else if bytes.starts_with(b"PK\x03\x04") {
            Some(DocumentKind::Word)
        } else if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
            Some(DocumentKind::Image(ImageFormat::Png))
        } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(DocumentKind::Image(ImageFormat::Jpeg))
        } else if bytes.starts_with(b"II*\0") || bytes.starts_with(b"MM\0*") {
            Some(DocumentKind::Image(ImageFormat::Tiff))
        } else if bytes.starts_with(b"BM") {
            Some(DocumentKind::Image(ImageFormat::Bmp))
        } else {
            None
        }
    }

    /// Whether the document has pages that can be rendered for recognition.
    pub fn is_rasterizable(&self) -> bool {
        matches!(self, DocumentKind::Pdf | DocumentKind::Image(_))
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentKind::Pdf => write!(f, "pdf"),
            DocumentKind::Word => write!(f, "word"),
            DocumentKind::PlainText => write!(f, "plain_text"),
            DocumentKind::Image(format) => write!(f, "image/{format:?}"),
        }
    }
}

/// An ingested document. Immutable once built.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub name: String,
    pub source_path: String,
    pub kind: DocumentKind,
    pub bytes: Vec<u8>,
}

impl Document {
    /// Reads `path`, using `declared` when given and inferring the type otherwise.
    pub fn open(path: &Path, declared: Option<DocumentKind>) -> Result<Self, IngestError> {
        let bytes = std::fs::read(path).map_err(|error| {
            IngestError::DocumentUnreadable(format!("{}: {error}", path.display()))
        })?;
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .ok_or_else(|| {
                IngestError::DocumentUnreadable(format!(
                    "path has no file name: {}",
                    path.display()
                ))
            })?;
        let kind = resolve_kind(declared, path.extension().and_then(|ext| ext.to_str()), &bytes)
            .ok_or_else(|| IngestError::UnsupportedFormat(name.clone()))?;

        Ok(Self {
            id: sha256_hex(path.to_string_lossy().as_bytes()),
            name,
            source_path: path.to_string_lossy().to_string(),
            kind,
            bytes,
        })
    }

    /// Builds a document from an in-memory stream; the id is derived from the content.
    pub fn from_bytes(
        name: impl Into<String>,
        bytes: Vec<u8>,
        declared: Option<DocumentKind>,
    ) -> Result<Self, IngestError> {
        let name = name.into();
        let extension = Path::new(&name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_string);
        let kind = resolve_kind(declared, extension.as_deref(), &bytes)
            .ok_or_else(|| IngestError::UnsupportedFormat(name.clone()))?;

        Ok(Self {
            id: sha256_hex(&bytes),
            source_path: name.clone(),
            name,
            kind,
            bytes,
        })
    }

    pub fn fingerprint(&self) -> DocumentFingerprint {
        DocumentFingerprint {
            document_id: self.id.clone(),
            document_title: self.name.clone(),
            source_path: self.source_path.clone(),
            kind: self.kind,
            checksum: sha256_hex(&self.bytes),
            ingested_at: Utc::now(),
        }
    }
}

fn resolve_kind(
    declared: Option<DocumentKind>,
    extension: Option<&str>,
    bytes: &[u8],
) -> Option<DocumentKind> {
    declared
        .or_else(|| extension.and_then(DocumentKind::from_extension))
        .or_else(|| DocumentKind::sniff(bytes))
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentFingerprint {
    pub document_id: String,
    pub document_title: String,
    pub source_path: String,
    pub kind: DocumentKind,
    pub checksum: String,
    pub ingested_at: DateTime<Utc>,
}

/// Which extraction path produced the final text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionMethod {
    Direct,
    Ocr,
    Hybrid,
}

impl ExtractionMethod {
    pub fn ocr_used(&self) -> bool {
        !matches!(self, ExtractionMethod::Direct)
    }
}

impl fmt::Display for ExtractionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractionMethod::Direct => write!(f, "direct"),
            ExtractionMethod::Ocr => write!(f, "ocr"),
            ExtractionMethod::Hybrid => write!(f, "hybrid"),
        }
    }
}

/// A page the recognizer could not read. The page still contributes an
/// empty string to the result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedPage {
    pub page: u32,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct ExtractionResult {
    /// Page texts joined by `PAGE_BREAK`.
    pub text: String,
    /// One entry per page, empty when a page yielded nothing.
    pub pages: Vec<String>,
    pub method: ExtractionMethod,
    pub char_count: usize,
    pub failed_pages: Vec<FailedPage>,
}

impl ExtractionResult {
    pub fn from_pages(
        pages: Vec<String>,
        method: ExtractionMethod,
        failed_pages: Vec<FailedPage>,
    ) -> Self {
        let pages: Vec<String> = pages
            .into_iter()
            .map(|page| page.replace(PAGE_BREAK, "\n"))
            .collect();
        let char_count = pages.iter().map(|page| page.chars().count()).sum();
        let text = pages.join(&PAGE_BREAK.to_string());

        Self {
            text,
            pages,
            method,
            char_count,
            failed_pages,
        }
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn ocr_used(&self) -> bool {
        self.method.ocr_used()
    }

    pub fn metadata(&self) -> ExtractionMetadata {
        ExtractionMetadata {
            method: self.method,
            char_count: self.char_count,
            ocr_used: self.ocr_used(),
            pages: self.page_count(),
            failed_pages: self.failed_pages.clone(),
        }
    }
}

/// Extraction summary handed to the orchestration layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionMetadata {
    pub method: ExtractionMethod,
    pub char_count: usize,
    pub ocr_used: bool,
    pub pages: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_pages: Vec<FailedPage>,
}

/// A bounded span of one document's extracted text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub document_id: String,
    pub source_file: String,
    pub source_path: String,
    pub chunk_index: u64,
    pub page_start: u32,
    pub page_end: u32,
    /// Character offsets into the extraction text, end exclusive.
    pub char_start: usize,
    pub char_end: usize,
    pub text: String,
    pub ocr_used: bool,
    pub method: ExtractionMethod,
}

/// Provenance stored beside every vector. Enough to cite the file and
/// pages without reopening the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub chunk_id: String,
    pub document_id: String,
    pub source_file: String,
    pub source_path: String,
    pub page_range: [u32; 2],
    pub chunk_index: u64,
    pub ocr_used: bool,
    pub method: ExtractionMethod,
}

impl EntryMetadata {
    pub fn to_map(&self) -> serde_json::Map<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }
}

impl From<&Chunk> for EntryMetadata {
    fn from(chunk: &Chunk) -> Self {
        Self {
            chunk_id: chunk.chunk_id.clone(),
            document_id: chunk.document_id.clone(),
            source_file: chunk.source_file.clone(),
            source_path: chunk.source_path.clone(),
            page_range: [chunk.page_start, chunk.page_end],
            chunk_index: chunk.chunk_index,
            ocr_used: chunk.ocr_used,
            method: chunk.method,
        }
    }
}

/// An entry not yet assigned an id by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingEntry {
    pub text: String,
    pub vector: Vec<f32>,
    pub metadata: EntryMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub entry_id: u64,
    pub text: String,
    pub vector: Vec<f32>,
    pub metadata: EntryMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub entry_id: u64,
    pub text: String,
    pub metadata: EntryMetadata,
    pub score: f32,
}

/// Restricts a search to entries whose metadata matches every set field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilter {
    pub source_file: Option<String>,
    pub document_id: Option<String>,
    pub ocr_used: Option<bool>,
}

impl SearchFilter {
    pub fn is_empty(&self) -> bool {
        self.source_file.is_none() && self.document_id.is_none() && self.ocr_used.is_none()
    }

    pub fn matches(&self, metadata: &EntryMetadata) -> bool {
        self.source_file
            .as_ref()
            .map_or(true, |wanted| *wanted == metadata.source_file)
            && self
                .document_id
                .as_ref()
                .map_or(true, |wanted| *wanted == metadata.document_id)
            && self.ocr_used.map_or(true, |wanted| wanted == metadata.ocr_used)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionStats {
    pub collection: String,
    pub total_entries: usize,
    pub embedding_model_id: String,
    pub dimensions: usize,
    pub metric: crate::similarity::SimilarityMetric,
    pub location: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn declared_kind_wins_over_extension() -> Result<(), Box<dyn std::error::Error>> {
        let document = Document::from_bytes(
            "notes.pdf",
            b"plain words".to_vec(),
            Some(DocumentKind::PlainText),
        )?;
        assert_eq!(document.kind, DocumentKind::PlainText);
        Ok(())
    }

    #[test]
    fn kind_is_sniffed_without_extension() -> Result<(), Box<dyn std::error::Error>> {
        let document = Document::from_bytes("upload", b"%PDF-1.5\n".to_vec(), None)?;
        assert_eq!(document.kind, DocumentKind::Pdf);

        let png = Document::from_bytes("scan", b"\x89PNG\r\n\x1a\nrest".to_vec(), None)?;
        assert_eq!(png.kind, DocumentKind::Image(ImageFormat::Png));
        Ok(())
    }

    #[test]
    fn unknown_kind_is_unsupported() {
        let result = Document::from_bytes("archive.xyz", b"????".to_vec(), None);
        assert!(matches!(result, Err(IngestError::UnsupportedFormat(_))));
    }

    #[test]
    fn search_filter_requires_every_set_field() {
        let metadata = EntryMetadata {
            chunk_id: "c".to_string(),
            document_id: "doc-1".to_string(),
            source_file: "rfp.pdf".to_string(),
            source_path: "/tmp/rfp.pdf".to_string(),
            page_range: [1, 1],
            chunk_index: 0,
            ocr_used: true,
            method: ExtractionMethod::Ocr,
        };

        assert!(SearchFilter::default().is_empty());
        assert!(SearchFilter::default().matches(&metadata));

        let by_file = SearchFilter {
            source_file: Some("rfp.pdf".to_string()),
            ocr_used: Some(true),
            ..SearchFilter::default()
        };
        assert!(by_file.matches(&metadata));

        let wrong_document = SearchFilter {
            source_file: Some("rfp.pdf".to_string()),
            document_id: Some("doc-2".to_string()),
            ..SearchFilter::default()
        };
        assert!(!wrong_document.matches(&metadata));
    }

    #[test]
    fn legacy_word_files_are_unsupported() {
        let ole_header = vec![0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1, 0, 0];
        let result = Document::from_bytes("old-proposal.doc", ole_header, None);
        assert!(matches!(result, Err(IngestError::UnsupportedFormat(name)) if name == "old-proposal.doc"));
        assert_eq!(DocumentKind::from_extension("DOCX"), Some(DocumentKind::Word));
    }

    #[test]
    fn missing_file_is_unreadable() {
        let result = Document::open(Path::new("/definitely/not/here.pdf"), None);
        assert!(matches!(result, Err(IngestError::DocumentUnreadable(_))));
    }

    #[test]
    fn document_id_is_stable_per_path() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("rfp.txt");
        fs::write(&path, "Statement of work")?;

        let first = Document::open(&path, None)?;
        let second = Document::open(&path, None)?;
        assert_eq!(first.id, second.id);
        assert_eq!(first.name, "rfp.txt");
        assert_eq!(first.fingerprint().checksum, second.fingerprint().checksum);
        Ok(())
    }

    #[test]
    fn extraction_result_joins_pages_with_marker() {
        let result = ExtractionResult::from_pages(
            vec!["one".to_string(), String::new(), "th\u{000C}ree".to_string()],
            ExtractionMethod::Ocr,
            Vec::new(),
        );
        assert_eq!(result.text, "one\u{000C}\u{000C}th\nree");
        assert_eq!(result.page_count(), 3);
        assert_eq!(result.char_count, 9);
        assert!(result.metadata().ocr_used);
    }

    #[test]
    fn entry_metadata_map_carries_provenance() {
        let metadata = EntryMetadata {
            chunk_id: "c".to_string(),
            document_id: "d".to_string(),
            source_file: "rfp.pdf".to_string(),
            source_path: "/tmp/rfp.pdf".to_string(),
            page_range: [2, 3],
            chunk_index: 4,
            ocr_used: true,
            method: ExtractionMethod::Hybrid,
        };
        let map = metadata.to_map();
        assert_eq!(map["source_file"], "rfp.pdf");
        assert_eq!(map["page_range"], serde_json::json!([2, 3]));
        assert_eq!(map["ocr_used"], true);
        assert_eq!(map["method"], "hybrid");
    }
}
