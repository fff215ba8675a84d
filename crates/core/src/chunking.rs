use crate::config::ChunkingConfig;
use crate::error::IngestError;
use crate::models::{Chunk, Document, ExtractionResult, PAGE_BREAK};
use sha2::{Digest, Sha256};

/// Offsets of the page-boundary markers inside an extraction text.
#[derive(Debug, Clone, Default)]
pub struct PageMap {
    breaks: Vec<usize>,
}

impl PageMap {
    pub fn from_text(text: &str) -> Self {
        Self::from_chars(&text.chars().collect::<Vec<_>>())
    }

    fn from_chars(chars: &[char]) -> Self {
        Self {
            breaks: chars
                .iter()
                .enumerate()
                .filter_map(|(offset, ch)| (*ch == PAGE_BREAK).then_some(offset))
                .collect(),
        }
    }

    /// 1-based page holding the character at `offset`.
    pub fn page_at(&self, offset: usize) -> u32 {
        1 + self.breaks.partition_point(|marker| *marker < offset) as u32
    }

    pub fn page_count(&self) -> usize {
        self.breaks.len() + 1
    }
}

/// A character range of the source text, end exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSpan {
    pub start: usize,
    pub end: usize,
    pub text: String,
    pub page_start: u32,
    pub page_end: u32,
}

/// Splits `text` into overlapping spans of at most `max_chunk_size` characters.
///
/// Each cut prefers the strongest natural break within the lookback window
/// (page or paragraph, then sentence or line, then word) and falls back to a
/// hard cut. Whitespace-only spans are dropped.
pub fn split_spans(text: &str, config: &ChunkingConfig) -> Result<Vec<TextSpan>, IngestError> {
    config.validate()?;
    Ok(split_validated(text, config))
}

fn split_validated(text: &str, config: &ChunkingConfig) -> Vec<TextSpan> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = text.chars().collect();
    let pages = PageMap::from_chars(&chars);
    let mut spans = Vec::new();
    let mut start = 0usize;

    loop {
        let hard_end = (start + config.max_chunk_size).min(chars.len());
        let end = if hard_end < chars.len() {
            natural_break(&chars, start, hard_end, config)
        } else {
            hard_end
        };

        if let Some(span) = make_span(&chars, &pages, start, end) {
            spans.push(span);
        }

        if end >= chars.len() {
            break;
        }
        start = end - config.chunk_overlap;
    }

    spans
}

fn natural_break(chars: &[char], start: usize, hard_end: usize, config: &ChunkingConfig) -> usize {
    // never cut so early that the next span would not advance
    let floor = (start + config.chunk_overlap + 1).max(hard_end.saturating_sub(config.boundary_lookback));

    let mut best: Option<(u8, usize)> = None;
    for end in (floor..=hard_end).rev() {
        let strength = break_strength(chars, end);
        if strength > best.map_or(0, |(found, _)| found) {
            best = Some((strength, end));
            if strength == 3 {
                break;
            }
        }
    }

    best.map_or(hard_end, |(_, end)| end)
}

/// How good a cut right before `chars[end]` is; 0 means mid-word.
fn break_strength(chars: &[char], end: usize) -> u8 {
    let Some(&last) = end.checked_sub(1).and_then(|index| chars.get(index)) else {
        return 0;
    };
    let previous = end.checked_sub(2).and_then(|index| chars.get(index)).copied();
    let next = chars.get(end).copied();

    if last == PAGE_BREAK || (last == '\n' && previous == Some('\n')) {
        3
    } else if last == '\n' || (matches!(last, '.' | '!' | '?') && next.map_or(true, char::is_whitespace)) {
        2
    } else if last.is_whitespace() {
        1
    } else {
        0
    }
}

fn make_span(chars: &[char], pages: &PageMap, start: usize, end: usize) -> Option<TextSpan> {
    let content = |offset: &usize| {
        let ch = chars[*offset];
        ch != PAGE_BREAK && !ch.is_whitespace()
    };
    let first = (start..end).find(content)?;
    let last = (start..end).rev().find(content)?;

    Some(TextSpan {
        start,
        end,
        text: chars[start..end]
            .iter()
            .map(|ch| if *ch == PAGE_BREAK { '\n' } else { *ch })
            .collect(),
        page_start: pages.page_at(first),
        page_end: pages.page_at(last),
    })
}

/// Turns an extraction into retrievable chunks tagged with provenance.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Result<Self, IngestError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    pub fn chunk(&self, document: &Document, extraction: &ExtractionResult) -> Vec<Chunk> {
        split_validated(&extraction.text, &self.config)
            .into_iter()
            .enumerate()
            .map(|(index, span)| {
                let chunk_index = index as u64;
                Chunk {
                    chunk_id: make_chunk_id(&document.id, chunk_index, &span.text),
                    document_id: document.id.clone(),
                    source_file: document.name.clone(),
                    source_path: document.source_path.clone(),
                    chunk_index,
                    page_start: span.page_start,
                    page_end: span.page_end,
                    char_start: span.start,
                    char_end: span.end,
                    text: span.text,
                    ocr_used: extraction.ocr_used(),
                    method: extraction.method,
                }
            })
            .collect()
    }
}

fn make_chunk_id(document_id: &str, index: u64, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(index.to_le_bytes());
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExtractionMethod;

    fn config(max: usize, overlap: usize) -> ChunkingConfig {
        ChunkingConfig {
            max_chunk_size: max,
            chunk_overlap: overlap,
            boundary_lookback: max / 2,
        }
    }

    fn reconstruct(spans: &[TextSpan], overlap: usize) -> String {
        let mut out = String::new();
        for (index, span) in spans.iter().enumerate() {
            let skip = if index == 0 { 0 } else { overlap };
            out.extend(span.text.chars().skip(skip));
        }
        out
    }

    const TEXT: &str = "The contractor shall provide staffing. Work begins in May!\n\nPhase two covers data migration and training for forty users. Reports are due monthly? Yes.\nFinal acceptance follows a thirty day pilot.";

    #[test]
    fn overlapping_spans_reconstruct_the_text() -> Result<(), IngestError> {
        let spans = split_spans(TEXT, &config(60, 12))?;
        assert!(spans.len() > 3);
        assert_eq!(reconstruct(&spans, 12), TEXT);
        Ok(())
    }

    #[test]
    fn spans_respect_size_and_overlap() -> Result<(), IngestError> {
        for (max, overlap) in [(60, 12), (25, 0), (40, 39), (7, 3)] {
            let spans = split_spans(TEXT, &config(max, overlap))?;
            for span in &spans {
                assert!(span.text.chars().count() <= max);
            }
            for pair in spans.windows(2) {
                let shared = pair[0].end - pair[1].start;
                assert!(shared >= overlap, "max={max} overlap={overlap}");
                let tail: String = pair[0].text.chars().skip(pair[0].text.chars().count() - overlap).collect();
                assert!(pair[1].text.starts_with(&tail));
            }
        }
        Ok(())
    }

    #[test]
    fn prefers_paragraph_then_sentence_breaks() -> Result<(), IngestError> {
        let spans = split_spans(TEXT, &config(80, 0))?;
        assert!(spans[0].text.ends_with("May!\n\n"), "{:?}", spans[0].text);

        let sentences = "Alpha beta gamma. Delta epsilon zeta eta theta iota kappa";
        let spans = split_spans(sentences, &config(30, 0))?;
        assert_eq!(spans[0].text, "Alpha beta gamma.");
        Ok(())
    }

    #[test]
    fn falls_back_to_hard_cut_without_boundaries() -> Result<(), IngestError> {
        let text = "x".repeat(25);
        let spans = split_spans(&text, &config(10, 2))?;
        let lengths: Vec<usize> = spans.iter().map(|span| span.text.len()).collect();
        assert_eq!(lengths, vec![10, 10, 9]);
        Ok(())
    }

    #[test]
    fn chunking_is_deterministic() -> Result<(), IngestError> {
        assert_eq!(split_spans(TEXT, &config(50, 10))?, split_spans(TEXT, &config(50, 10))?);
        Ok(())
    }

    #[test]
    fn blank_text_yields_no_spans() -> Result<(), IngestError> {
        assert!(split_spans("", &config(10, 2))?.is_empty());
        assert!(split_spans(" \n\t\u{000C} ", &config(10, 2))?.is_empty());
        Ok(())
    }

    #[test]
    fn invalid_overlap_is_rejected_before_splitting() {
        assert!(matches!(
            split_spans("", &config(10, 10)),
            Err(IngestError::InvalidChunkConfig(_))
        ));
        assert!(matches!(
            Chunker::new(config(5, 9)),
            Err(IngestError::InvalidChunkConfig(_))
        ));
    }

    #[test]
    fn page_ranges_follow_page_markers() -> Result<(), IngestError> {
        let text = "Page one text here.\u{000C}\u{000C}Page three text here.";
        let map = PageMap::from_text(text);
        assert_eq!(map.page_count(), 3);
        assert_eq!(map.page_at(0), 1);
        assert_eq!(map.page_at(21), 3);

        let spans = split_spans(text, &config(100, 0))?;
        assert_eq!(spans.len(), 1);
        assert_eq!((spans[0].page_start, spans[0].page_end), (1, 3));
        assert!(!spans[0].text.contains('\u{000C}'));

        let spans = split_spans(text, &config(20, 0))?;
        assert_eq!((spans[0].page_start, spans[0].page_end), (1, 1));
        let last = spans.last().map(|span| (span.page_start, span.page_end));
        assert_eq!(last, Some((3, 3)));
        Ok(())
    }

    #[test]
    fn chunks_carry_document_provenance() -> Result<(), IngestError> {
        let document = Document::from_bytes("rfp.txt", TEXT.as_bytes().to_vec(), None)?;
        let extraction = ExtractionResult::from_pages(
            vec![TEXT.to_string(), "Appendix A pricing tables.".to_string()],
            ExtractionMethod::Hybrid,
            Vec::new(),
        );

        let chunks = Chunker::new(config(60, 10))?.chunk(&document, &extraction);
        assert!(!chunks.is_empty());
        for (index, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, index as u64);
            assert_eq!(chunk.document_id, document.id);
            assert_eq!(chunk.source_file, "rfp.txt");
            assert!(chunk.ocr_used);
        }
        let last = chunks.last().expect("at least one chunk");
        assert_eq!(last.page_end, 2);
        assert_ne!(chunks[0].chunk_id, chunks[1].chunk_id);
        Ok(())
    }
}
