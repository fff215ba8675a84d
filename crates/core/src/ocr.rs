//! Optical character recognition for pages without a usable text layer.
//!
//! A PDF page goes through two seams: a [`Rasterizer`] renders it to a PNG at
//! the configured resolution, then a [`Recognizer`] turns the bitmap into text.
//! Pages are processed in parallel and reassembled in page order.

use crate::config::OcrConfig;
use crate::error::{IngestError, OcrError};
use crate::models::{DocumentKind, ImageFormat};
use base64::{engine::general_purpose::STANDARD, Engine};
use rayon::prelude::*;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use tracing::{info, warn};

pub trait Rasterizer: Send + Sync {
    fn name(&self) -> &str;

    fn check_available(&self) -> Result<(), OcrError>;

    /// Renders the 1-based `page` of the PDF at `path` to PNG bytes.
    fn rasterize_page(&self, path: &Path, page: u32, dpi: u32) -> Result<Vec<u8>, OcrError>;
}

pub trait Recognizer: Send + Sync {
    fn name(&self) -> &str;

    fn check_available(&self) -> Result<(), OcrError>;

    fn recognize(&self, image: &[u8], dpi: u32) -> Result<String, OcrError>;
}

/// Recognition output for one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageOcr {
    pub page: u32,
    pub text: String,
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct OcrEngine {
    rasterizer: Arc<dyn Rasterizer>,
    recognizer: Arc<dyn Recognizer>,
    dpi: u32,
}

impl OcrEngine {
    pub fn new(rasterizer: Arc<dyn Rasterizer>, recognizer: Arc<dyn Recognizer>, dpi: u32) -> Self {
        Self {
            rasterizer,
            recognizer,
            dpi,
        }
    }

    /// pdftoppm for rendering, the tesseract CLI for recognition.
    pub fn tesseract(config: &OcrConfig) -> Self {
        Self::new(
            Arc::new(PdftoppmRasterizer::default()),
            Arc::new(TesseractRecognizer::new(config.language.clone())),
            config.dpi,
        )
    }

    pub fn dpi(&self) -> u32 {
        self.dpi
    }

    pub fn check_recognizer(&self) -> Result<(), IngestError> {
        self.recognizer.check_available()?;
        Ok(())
    }

    /// Runs recognition over every page of a PDF.
    ///
    /// A missing backend fails the whole call. A page that cannot be rendered
    /// or recognized yields an empty string with the reason attached.
    pub fn recognize_pdf(&self, pdf: &[u8], page_count: u32) -> Result<Vec<PageOcr>, IngestError> {
        self.rasterizer.check_available()?;
        self.recognizer.check_available()?;

        let mut staged = tempfile::Builder::new()
            .prefix("ocr-")
            .suffix(".pdf")
            .tempfile()?;
        staged.write_all(pdf)?;
        staged.flush()?;
        let path = staged.path().to_path_buf();

        info!(
            pages = page_count,
            dpi = self.dpi,
            rasterizer = self.rasterizer.name(),
            recognizer = self.recognizer.name(),
            "running ocr over pdf pages"
        );

        (1..=page_count)
            .into_par_iter()
            .map(|page| {
                let outcome = self
                    .rasterizer
                    .rasterize_page(&path, page, self.dpi)
                    .and_then(|image| self.recognizer.recognize(&image, self.dpi));
                settle_page(page, outcome)
            })
            .collect()
    }

    /// Recognizes a standalone image as a single page.
    pub fn recognize_image(&self, image: &[u8]) -> Result<PageOcr, IngestError> {
        self.recognizer.check_available()?;
        settle_page(1, self.recognizer.recognize(image, self.dpi))
    }
}

fn settle_page(page: u32, outcome: Result<String, OcrError>) -> Result<PageOcr, IngestError> {
    match outcome {
        Ok(text) => Ok(PageOcr {
            page,
            text,
            error: None,
        }),
        Err(OcrError::Failed(reason)) => {
            warn!(page, reason = %reason, "ocr failed for page, continuing with empty text");
            Ok(PageOcr {
                page,
                text: String::new(),
                error: Some(reason),
            })
        }
        Err(unavailable) => Err(unavailable.into()),
    }
}

fn spawn_failure(backend: &str, error: std::io::Error) -> OcrError {
    if error.kind() == ErrorKind::NotFound || error.kind() == ErrorKind::PermissionDenied {
        OcrError::Unavailable {
            backend: backend.to_string(),
            details: error.to_string(),
        }
    } else {
        OcrError::Failed(format!("{backend}: {error}"))
    }
}

/// Renders pages through poppler's `pdftoppm`.
#[derive(Debug, Clone)]
pub struct PdftoppmRasterizer {
    pub binary: PathBuf,
}

impl Default for PdftoppmRasterizer {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("pdftoppm"),
        }
    }
}

impl Rasterizer for PdftoppmRasterizer {
    fn name(&self) -> &str {
        "pdftoppm"
    }

    fn check_available(&self) -> Result<(), OcrError> {
        Command::new(&self.binary)
            .arg("-v")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|_| ())
            .map_err(|error| spawn_failure(self.name(), error))
    }

    fn rasterize_page(&self, path: &Path, page: u32, dpi: u32) -> Result<Vec<u8>, OcrError> {
        let workdir = tempfile::tempdir()
            .map_err(|error| OcrError::Failed(format!("page {page}: {error}")))?;
        let root = workdir.path().join("page");

        let output = Command::new(&self.binary)
            .args(["-r", &dpi.to_string()])
            .args(["-f", &page.to_string(), "-l", &page.to_string()])
            .args(["-png", "-singlefile"])
            .arg(path)
            .arg(&root)
            .output()
            .map_err(|error| spawn_failure(self.name(), error))?;

        if !output.status.success() {
            return Err(OcrError::Failed(format!(
                "pdftoppm exited with {} on page {page}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        std::fs::read(root.with_extension("png"))
            .map_err(|error| OcrError::Failed(format!("page {page} image missing: {error}")))
    }
}

/// Runs the `tesseract` CLI, feeding the image on stdin.
#[derive(Debug, Clone)]
pub struct TesseractRecognizer {
    pub binary: PathBuf,
    pub language: String,
}

impl TesseractRecognizer {
    pub fn new(language: impl Into<String>) -> Self {
        Self {
            binary: PathBuf::from("tesseract"),
            language: language.into(),
        }
    }
}

impl Recognizer for TesseractRecognizer {
    fn name(&self) -> &str {
        "tesseract"
    }

    fn check_available(&self) -> Result<(), OcrError> {
        let output = Command::new(&self.binary)
            .arg("--list-langs")
            .output()
            .map_err(|error| spawn_failure(self.name(), error))?;

        let listing = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() || !language_installed(&listing, &self.language) {
            return Err(OcrError::Unavailable {
                backend: self.name().to_string(),
                details: format!("language pack '{}' is not installed", self.language),
            });
        }
        Ok(())
    }

    fn recognize(&self, image: &[u8], dpi: u32) -> Result<String, OcrError> {
        let mut child = Command::new(&self.binary)
            .args(["stdin", "stdout", "-l", &self.language])
            .args(["--dpi", &dpi.to_string()])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|error| spawn_failure(self.name(), error))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(image)
                .map_err(|error| OcrError::Failed(format!("tesseract stdin: {error}")))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|error| OcrError::Failed(format!("tesseract: {error}")))?;

        if !output.status.success() {
            return Err(OcrError::Failed(format!(
                "tesseract exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn language_installed(listing: &str, language: &str) -> bool {
    // tesseract accepts "eng+deu" style combinations
    language
        .split('+')
        .all(|wanted| listing.lines().skip(1).any(|line| line.trim() == wanted))
}

#[derive(Debug, Clone, Serialize)]
struct HttpOcrRequest {
    image_base64: String,
    mime_type: &'static str,
    dpi: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct HttpOcrResponse {
    pages: Option<Vec<HttpOcrPage>>,
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct HttpOcrPage {
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    text: Option<String>,
}

/// Sends page images to a multimodal OCR endpoint.
#[derive(Debug, Clone)]
pub struct HttpRecognizer {
    pub endpoint: String,
    pub api_key: Option<String>,
}

impl HttpRecognizer {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim().to_string(),
            api_key: api_key.and_then(|key| {
                let key = key.trim().to_string();
                if key.is_empty() {
                    None
                } else {
                    Some(key)
                }
            }),
        }
    }
}

impl Recognizer for HttpRecognizer {
    fn name(&self) -> &str {
        "http-ocr"
    }

    fn check_available(&self) -> Result<(), OcrError> {
        url::Url::parse(&self.endpoint)
            .map(|_| ())
            .map_err(|error| OcrError::Unavailable {
                backend: self.name().to_string(),
                details: format!("invalid endpoint '{}': {error}", self.endpoint),
            })
    }

    fn recognize(&self, image: &[u8], dpi: u32) -> Result<String, OcrError> {
        let payload = HttpOcrRequest {
            image_base64: STANDARD.encode(image),
            mime_type: image_mime_type(image),
            dpi,
        };

        let mut request = Client::new()
            .post(&self.endpoint)
            .header("content-type", "application/json")
            .json(&payload);

        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().map_err(|error| {
            if error.is_connect() {
                OcrError::Unavailable {
                    backend: self.name().to_string(),
                    details: error.to_string(),
                }
            } else {
                OcrError::Failed(error.to_string())
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
            || status == reqwest::StatusCode::NOT_FOUND
        {
            return Err(OcrError::Unavailable {
                backend: self.name().to_string(),
                details: format!("{} returned {status}", self.endpoint),
            });
        }
        if !status.is_success() {
            return Err(OcrError::Failed(format!(
                "ocr request to {} returned {status}",
                self.endpoint
            )));
        }

        let payload: HttpOcrResponse = response
            .json()
            .map_err(|error| OcrError::Failed(format!("ocr response: {error}")))?;
        payload_to_text(&payload)
    }
}

fn image_mime_type(image: &[u8]) -> &'static str {
    match DocumentKind::sniff(image) {
        Some(DocumentKind::Image(ImageFormat::Jpeg)) => "image/jpeg",
        Some(DocumentKind::Image(ImageFormat::Tiff)) => "image/tiff",
        Some(DocumentKind::Image(ImageFormat::Bmp)) => "image/bmp",
        _ => "image/png",
    }
}

fn payload_to_text(payload: &HttpOcrResponse) -> Result<String, OcrError> {
    if let Some(listed) = &payload.pages {
        let mut listed = listed
            .iter()
            .filter_map(|page| {
                let text = page.text.as_ref()?.trim();
                if text.is_empty() {
                    None
                } else {
                    Some((page.page.unwrap_or(1), text.to_string()))
                }
            })
            .collect::<Vec<_>>();

        if !listed.is_empty() {
            listed.sort_by_key(|(page, _)| *page);
            return Ok(listed
                .into_iter()
                .map(|(_, text)| text)
                .collect::<Vec<_>>()
                .join("\n"));
        }
    }

    if let Some(text) = &payload.text {
        return Ok(text.trim().to_string());
    }

    Err(OcrError::Failed("ocr response carried no text".to_string()))
}


#[cfg(test)]
mod tests {
    use super::testing::{FakeRasterizer, FakeRecognizer};
    use super::*;

    fn engine(recognizer: Arc<FakeRecognizer>) -> OcrEngine {
        OcrEngine::new(Arc::new(FakeRasterizer), recognizer, 300)
    }

    #[test]
    fn pages_come_back_in_page_order() -> Result<(), Box<dyn std::error::Error>> {
        let recognizer = Arc::new(FakeRecognizer::default());
        let pages = engine(recognizer.clone()).recognize_pdf(b"%PDF-1.4", 12)?;

        let numbers: Vec<u32> = pages.iter().map(|page| page.page).collect();
        assert_eq!(numbers, (1..=12).collect::<Vec<_>>());
        assert_eq!(pages[4].text, "recognized text for scanned page 5");
        assert_eq!(recognizer.call_count(), 12);
        Ok(())
    }

    #[test]
    fn failed_page_yields_empty_text_with_reason() -> Result<(), Box<dyn std::error::Error>> {
        let pages = engine(Arc::new(FakeRecognizer::failing(&[2]))).recognize_pdf(b"%PDF", 3)?;

        assert_eq!(pages[1].text, "");
        assert_eq!(pages[1].error.as_deref(), Some("page 2 unreadable"));
        assert!(pages[0].error.is_none());
        assert!(pages[2].text.contains("page 3"));
        Ok(())
    }

    #[test]
    fn missing_backend_is_fatal() {
        let result = engine(Arc::new(FakeRecognizer::missing())).recognize_pdf(b"%PDF", 2);
        assert!(matches!(result, Err(IngestError::OcrUnavailable(_))));
    }

    #[test]
    fn missing_binary_reports_unavailable() {
        let rasterizer = PdftoppmRasterizer {
            binary: PathBuf::from("/nonexistent/bin/pdftoppm"),
        };
        assert!(matches!(
            rasterizer.check_available(),
            Err(OcrError::Unavailable { .. })
        ));

        let recognizer = TesseractRecognizer {
            binary: PathBuf::from("/nonexistent/bin/tesseract"),
            language: "eng".to_string(),
        };
        assert!(matches!(
            recognizer.recognize(b"png", 300),
            Err(OcrError::Unavailable { .. })
        ));
    }

    #[test]
    fn language_listing_is_parsed() {
        let listing = "List of available languages in \"/usr/share/tessdata/\" (2):\neng\nosd\n";
        assert!(language_installed(listing, "eng"));
        assert!(!language_installed(listing, "deu"));
        assert!(!language_installed(listing, "eng+deu"));
    }

    #[test]
    fn http_recognizer_rejects_blank_endpoint() {
        let recognizer = HttpRecognizer::new("  ", Some(" ".to_string()));
        assert!(recognizer.api_key.is_none());
        assert!(matches!(
            recognizer.check_available(),
            Err(OcrError::Unavailable { .. })
        ));
    }

    #[test]
    fn ocr_payload_with_pages_keeps_nonempty_text_in_order() {
        let response = HttpOcrResponse {
            pages: Some(vec![
                HttpOcrPage {
                    page: Some(3),
                    text: Some("Third".to_string()),
                },
                HttpOcrPage {
                    page: Some(2),
                    text: Some("  ".to_string()),
                },
                HttpOcrPage {
                    page: Some(1),
                    text: Some("First".to_string()),
                },
            ]),
            text: None,
        };

        let text = payload_to_text(&response).expect("payload should parse");
        assert_eq!(text, "First\nThird");
    }

    #[test]
    fn ocr_payload_falls_back_to_text_field() {
        let response = HttpOcrResponse {
            pages: None,
            text: Some("  Scanned cover letter\n".to_string()),
        };
        assert_eq!(
            payload_to_text(&response).expect("payload should parse"),
            "Scanned cover letter"
        );

        let empty = HttpOcrResponse {
            pages: Some(Vec::new()),
            text: None,
        };
        assert!(payload_to_text(&empty).is_err());
    }

    #[test]
    fn mime_type_follows_magic_bytes() {
        assert_eq!(image_mime_type(&[0xFF, 0xD8, 0xFF, 0x00]), "image/jpeg");
        assert_eq!(image_mime_type(b"unknown"), "image/png");
    }
}
