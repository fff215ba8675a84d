use crate::config::{OcrConfig, OcrMode};
use crate::error::IngestError;
use crate::models::{Document, DocumentKind, ExtractionMethod, ExtractionResult, FailedPage, PAGE_BREAK};
use crate::ocr::{OcrEngine, PageOcr};
use regex::Regex;
use std::io::{Cursor, Read};
use tracing::{info, warn};

/// Outcome of the threshold check between direct extraction and OCR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcrDecision {
    KeepDirect,
    RunOcr { forced: bool },
    Insufficient,
}

/// Extracts text from every supported document kind, falling back to OCR
/// when the direct yield is too small.
#[derive(Clone)]
pub struct DocumentExtractor {
    threshold_chars: usize,
    mode: OcrMode,
    ocr: OcrEngine,
}

impl DocumentExtractor {
    pub fn new(config: &OcrConfig, ocr: OcrEngine) -> Result<Self, IngestError> {
        Ok(Self {
            threshold_chars: config.ocr_threshold_chars,
            mode: config.mode()?,
            ocr,
        })
    }

    pub fn mode(&self) -> OcrMode {
        self.mode
    }

    pub fn decide(&self, yield_chars: usize) -> OcrDecision {
        match self.mode {
            OcrMode::Force => OcrDecision::RunOcr { forced: true },
            _ if yield_chars >= self.threshold_chars => OcrDecision::KeepDirect,
            OcrMode::Auto => OcrDecision::RunOcr { forced: false },
            OcrMode::Disabled => OcrDecision::Insufficient,
        }
    }

    pub fn extract(&self, document: &Document) -> Result<ExtractionResult, IngestError> {
        let pdf = match document.kind {
            DocumentKind::Pdf => Some(load_pdf(&document.bytes)?),
            _ => None,
        };

        let direct_pages = match (&pdf, self.mode) {
            // forced OCR never reads the text layer, only counts pages
            (Some(pdf), OcrMode::Force) => vec![String::new(); pdf.get_pages().len()],
            (Some(pdf), _) => pdf_direct_pages(pdf),
            (None, _) => extract_direct(document)?,
        };
        let yield_chars = meaningful_chars(&direct_pages);

        let decision = self.decide(yield_chars);
        info!(
            document = %document.name,
            kind = %document.kind,
            pages = direct_pages.len(),
            direct_chars = yield_chars,
            threshold = self.threshold_chars,
            decision = ?decision,
            "direct extraction finished"
        );

        let result = match decision {
            OcrDecision::KeepDirect => {
                ExtractionResult::from_pages(direct_pages, ExtractionMethod::Direct, Vec::new())
            }
            OcrDecision::Insufficient => {
                return Err(IngestError::InsufficientText {
                    chars: yield_chars,
                    threshold: self.threshold_chars,
                })
            }
            OcrDecision::RunOcr { forced } => self.run_ocr(document, direct_pages, forced)?,
        };

        info!(
            document = %document.name,
            method = %result.method,
            chars = result.char_count,
            failed_pages = result.failed_pages.len(),
            "extraction complete"
        );
        Ok(result)
    }

    fn run_ocr(
        &self,
        document: &Document,
        direct_pages: Vec<String>,
        forced: bool,
    ) -> Result<ExtractionResult, IngestError> {
        match document.kind {
            DocumentKind::Pdf => {
                let recognized = self
                    .ocr
                    .recognize_pdf(&document.bytes, direct_pages.len() as u32)?;
                Ok(merge_pages(direct_pages, recognized, forced))
            }
            DocumentKind::Image(_) => {
                let recognized = self.ocr.recognize_image(&document.bytes)?;
                Ok(merge_pages(direct_pages, vec![recognized], true))
            }
            DocumentKind::Word | DocumentKind::PlainText => {
                // no raster form: the decoded text stands in for the recognizer output
                self.ocr.check_recognizer()?;
                Ok(ExtractionResult::from_pages(
                    direct_pages,
                    ExtractionMethod::Ocr,
                    Vec::new(),
                ))
            }
        }
    }
}

/// Combines recognizer output with the direct text layer, page by page.
///
/// Recognized text wins. When not forced, a page the recognizer returned
/// nothing for keeps its direct text, which makes the result hybrid.
fn merge_pages(direct: Vec<String>, recognized: Vec<PageOcr>, forced: bool) -> ExtractionResult {
    let mut pages = Vec::with_capacity(recognized.len());
    let mut failed_pages = Vec::new();
    let mut kept_direct = 0usize;

    for page in recognized {
        if let Some(reason) = page.error {
            failed_pages.push(FailedPage {
                page: page.page,
                reason,
            });
        }

        let fallback = direct
            .get(page.page.saturating_sub(1) as usize)
            .filter(|text| !forced && !text.trim().is_empty());

        match fallback {
            Some(text) if page.text.trim().is_empty() => {
                kept_direct += 1;
                pages.push(text.clone());
            }
            _ => pages.push(page.text),
        }
    }

    let method = if kept_direct > 0 {
        ExtractionMethod::Hybrid
    } else {
        ExtractionMethod::Ocr
    };
    ExtractionResult::from_pages(pages, method, failed_pages)
}

fn meaningful_chars(pages: &[String]) -> usize {
    pages.iter().map(|page| page.trim().chars().count()).sum()
}

/// Reads the text layer of a document without rendering anything.
pub fn extract_direct(document: &Document) -> Result<Vec<String>, IngestError> {
    match document.kind {
        DocumentKind::Pdf => Ok(pdf_direct_pages(&load_pdf(&document.bytes)?)),
        DocumentKind::Word => Ok(vec![extract_docx_text(&document.bytes)?]),
        DocumentKind::PlainText => Ok(decode_text(&document.bytes)
            .split(PAGE_BREAK)
            .map(str::to_string)
            .collect()),
        DocumentKind::Image(_) => Ok(vec![String::new()]),
    }
}

fn load_pdf(bytes: &[u8]) -> Result<lopdf::Document, IngestError> {
    let document = lopdf::Document::load_mem(bytes)
        .map_err(|error| IngestError::DocumentUnreadable(format!("pdf parse error: {error}")))?;

    if document.get_pages().is_empty() {
        return Err(IngestError::DocumentUnreadable("pdf has no pages".to_string()));
    }
    Ok(document)
}

fn pdf_direct_pages(document: &lopdf::Document) -> Vec<String> {
    document
        .get_pages()
        .into_keys()
        .map(|page_no| match document.extract_text(&[page_no]) {
            Ok(text) => text,
            Err(error) => {
                warn!(page = page_no, error = %error, "direct extraction failed for page");
                String::new()
            }
        })
        .collect()
}

/// Decodes bytes as text, replacing anything undecodable instead of failing.
pub fn decode_text(bytes: &[u8]) -> String {
    if let Some(rest) = bytes.strip_prefix(&[0xFF, 0xFE]) {
        return decode_utf16(rest, u16::from_le_bytes);
    }
    if let Some(rest) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        return decode_utf16(rest, u16::from_be_bytes);
    }
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

fn decode_utf16(bytes: &[u8], unit: fn([u8; 2]) -> u16) -> String {
    let units = bytes.chunks(2).map(|pair| match pair {
        [high, low] => unit([*high, *low]),
        _ => 0xFFFD,
    });
    char::decode_utf16(units)
        .map(|decoded| decoded.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

/// Concatenates the paragraph text of a .docx body in document order.
pub fn extract_docx_text(bytes: &[u8]) -> Result<String, IngestError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|error| IngestError::DocumentUnreadable(format!("docx is not a zip archive: {error}")))?;

    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|error| IngestError::DocumentUnreadable(format!("docx has no document body: {error}")))?
        .read_to_string(&mut xml)
        .map_err(|error| IngestError::DocumentUnreadable(format!("docx body unreadable: {error}")))?;

    docx_paragraphs(&xml).map(|paragraphs| paragraphs.join("\n"))
}

fn docx_paragraphs(xml: &str) -> Result<Vec<String>, IngestError> {
    let properties = Regex::new(r"(?s)<w:(?:pPr|rPr)>.*?</w:(?:pPr|rPr)>").map_err(regex_failure)?;
    let paragraph = Regex::new(r"(?s)<w:p(?:\s[^>]*?)?(?:/>|>(.*?)</w:p>)").map_err(regex_failure)?;
    let token = Regex::new(
        r"(?s)<w:t(?:\s[^>]*)?>(?P<text>.*?)</w:t>|(?P<tab><w:tab(?:\s[^>]*)?/>)|(?P<br><w:(?:br|cr)(?:\s[^>]*)?/>)",
    )
    .map_err(regex_failure)?;

    let body = properties.replace_all(xml, "");
    let paragraphs = paragraph
        .captures_iter(&body)
        .map(|capture| {
            let inner = capture.get(1).map(|m| m.as_str()).unwrap_or_default();
            let mut text = String::new();
            for piece in token.captures_iter(inner) {
                if let Some(run) = piece.name("text") {
                    text.push_str(&unescape_xml(run.as_str()));
                } else if piece.name("tab").is_some() {
                    text.push('\t');
                } else if piece.name("br").is_some() {
                    text.push('\n');
                }
            }
            text
        })
        .collect();

    Ok(paragraphs)
}

fn regex_failure(error: regex::Error) -> IngestError {
    IngestError::InvalidConfig(format!("docx pattern: {error}"))
}

fn unescape_xml(value: &str) -> String {
    if !value.contains('&') {
        return value.to_string();
    }

    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        let Some(end) = tail.find(';') else {
            out.push_str(tail);
            return out;
        };
        let entity = &tail[1..end];
        let decoded = match entity {
            "lt" => Some('<'),
            "gt" => Some('>'),
            "amp" => Some('&'),
            "apos" => Some('\''),
            "quot" => Some('"'),
            _ => entity
                .strip_prefix("#x")
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                .and_then(char::from_u32),
        };
        match decoded {
            Some(ch) => out.push(ch),
            None => out.push_str(&tail[..=end]),
        }
        rest = &tail[end + 1..];
    }
    out.push_str(rest);
    out
}
