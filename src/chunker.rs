//! Boundary-preserving document chunking.
//!
//! Chunks carry their absolute character offsets so positions reported
//! against a chunk can be rewritten to document offsets. Splits prefer the
//! configured boundary kind and never cut a character in half; offsets are
//! character offsets throughout, matching entity positions.

use crate::router::{BoundaryKind, ChunkConfig, ChunkStrategy};
use tracing::debug;

/// A contiguous slice of the document, with absolute char offsets.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub index: usize,
    /// Absolute char offset of the first character.
    pub start: usize,
    /// Absolute char offset one past the last character.
    pub end: usize,
    pub text: String,
}

/// Split a document per the chunk configuration. Sizes are configured in
/// tokens and converted to characters with the same ratio the size
/// detector uses.
pub fn chunk_document(text: &str, config: &ChunkConfig, chars_per_token: f64) -> Vec<Chunk> {
    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();

    let chunk_chars = ((config.chunk_size_tokens as f64) * chars_per_token) as usize;
    let overlap_chars = ((config.overlap_tokens as f64) * chars_per_token) as usize;

    if matches!(config.strategy, ChunkStrategy::None)
        || total == 0
        || chunk_chars == 0
        || total <= chunk_chars
    {
        return vec![Chunk {
            id: "chunk_0".to_string(),
            index: 0,
            start: 0,
            end: total,
            text: text.to_string(),
        }];
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut index = 0usize;

    while start < total {
        let hard_end = (start + chunk_chars).min(total);
        let end = if hard_end == total {
            total
        } else {
            find_boundary(&chars, start, hard_end, config.preserve_boundaries)
        };

        chunks.push(Chunk {
            id: format!("chunk_{}", index),
            index,
            start,
            end,
            text: chars[start..end].iter().collect(),
        });

        if end == total {
            break;
        }

        // Step back by the overlap, but always make forward progress.
        let next = end.saturating_sub(overlap_chars);
        start = if next > start { next } else { end };
        index += 1;
    }

    debug!(
        "Chunked {} chars into {} chunks ({:?} boundaries, {} char overlap)",
        total,
        chunks.len(),
        config.preserve_boundaries,
        overlap_chars
    );

    chunks
}

/// Find a split point at or before `hard_end` that lands on the preferred
/// boundary. Falls back through weaker boundaries, then to the hard cut.
/// A boundary in the first half of the chunk is ignored so chunks stay
/// usefully sized.
fn find_boundary(chars: &[char], start: usize, hard_end: usize, kind: BoundaryKind) -> usize {
    let min_end = start + (hard_end - start) / 2;

    let delimiter_sets: &[&[&str]] = match kind {
        BoundaryKind::Page => &[&["\u{c}"], &["\n\n"], &["\n"]],
        BoundaryKind::Section => &[&["\n\n\n", "\n\n"], &["\n"]],
        BoundaryKind::Paragraph => &[&["\n\n"], &["\n"]],
        BoundaryKind::Sentence => &[&[". ", ".\n", "? ", "! "], &["\n"]],
    };

    for delimiters in delimiter_sets {
        let mut best: Option<usize> = None;
        for delimiter in *delimiters {
            if let Some(pos) = rfind_chars(chars, start, hard_end, delimiter) {
                let candidate = pos + delimiter.chars().count();
                if candidate > min_end {
                    best = Some(best.map_or(candidate, |b: usize| b.max(candidate)));
                }
            }
        }
        if let Some(end) = best {
            return end;
        }
    }

    hard_end
}

/// Last occurrence of `needle` starting within `[start, end)`, as a char
/// offset into `chars`.
fn rfind_chars(chars: &[char], start: usize, end: usize, needle: &str) -> Option<usize> {
    let needle: Vec<char> = needle.chars().collect();
    if needle.is_empty() || end - start < needle.len() {
        return None;
    }

    let last_start = end - needle.len();
    for pos in (start..=last_start).rev() {
        if chars[pos..pos + needle.len()] == needle[..] {
            return Some(pos);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::ChunkStrategy;

    fn config(chunk_size_tokens: usize, overlap_tokens: usize, kind: BoundaryKind) -> ChunkConfig {
        ChunkConfig {
            strategy: ChunkStrategy::Extraction,
            chunk_size_tokens,
            overlap_tokens,
            preserve_boundaries: kind,
        }
    }

    #[test]
    fn test_small_document_is_single_chunk() {
        let text = "short document";
        let chunks = chunk_document(text, &config(8000, 500, BoundaryKind::Paragraph), 4.0);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks[0].end, text.chars().count());
        assert_eq!(chunks[0].text, text);
    }

    #[test]
    fn test_chunks_cover_document_with_overlap() {
        let paragraph = "This is a paragraph of filler text for chunking tests.\n\n";
        let text = paragraph.repeat(100);
        // 25 tokens -> 100 chars per chunk, 5 tokens -> 20 char overlap
        let chunks = chunk_document(&text, &config(25, 5, BoundaryKind::Paragraph), 4.0);

        assert!(chunks.len() > 1);
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks.last().unwrap().end, text.chars().count());

        let all_chars: Vec<char> = text.chars().collect();
        for pair in chunks.windows(2) {
            // Overlapping, ordered, making progress
            assert!(pair[1].start < pair[0].end);
            assert!(pair[1].start > pair[0].start);
        }
        for chunk in &chunks {
            let expected: String = all_chars[chunk.start..chunk.end].iter().collect();
            assert_eq!(chunk.text, expected);
        }
    }

    #[test]
    fn test_paragraph_boundary_preserved() {
        let text = format!("{}\n\n{}", "a".repeat(80), "b".repeat(80));
        // 30 tokens -> 120 chars: boundary at 82 is past the midpoint
        let chunks = chunk_document(&text, &config(30, 0, BoundaryKind::Paragraph), 4.0);

        assert!(chunks.len() >= 2);
        // First chunk ends exactly after the paragraph break
        assert_eq!(chunks[0].end, 82);
        assert!(chunks[0].text.ends_with("\n\n"));
    }

    #[test]
    fn test_sentence_boundary_preserved() {
        let text = format!("{}. {}", "word ".repeat(20).trim(), "tail ".repeat(30));
        let chunks = chunk_document(&text, &config(30, 0, BoundaryKind::Sentence), 4.0);
        if chunks.len() > 1 {
            assert!(chunks[0].text.ends_with(". "));
        }
    }

    #[test]
    fn test_hard_cut_when_no_boundary() {
        let text = "x".repeat(1_000);
        let chunks = chunk_document(&text, &config(50, 10, BoundaryKind::Paragraph), 4.0);
        assert!(chunks.len() > 1);
        assert_eq!(chunks[0].end - chunks[0].start, 200);
    }

    #[test]
    fn test_early_boundary_ignored() {
        // Only paragraph break is near the start; splitting there would
        // produce a degenerate chunk
        let text = format!("ab\n\n{}", "c".repeat(400));
        let chunks = chunk_document(&text, &config(50, 0, BoundaryKind::Paragraph), 4.0);
        assert!(chunks[0].end > 100);
    }

    #[test]
    fn test_multibyte_characters_survive() {
        let text = "§ 1983 claims — café ruling.\n\n".repeat(30);
        let chunks = chunk_document(&text, &config(25, 5, BoundaryKind::Paragraph), 4.0);

        let all_chars: Vec<char> = text.chars().collect();
        for chunk in &chunks {
            let expected: String = all_chars[chunk.start..chunk.end].iter().collect();
            assert_eq!(chunk.text, expected);
        }
    }

    #[test]
    fn test_none_strategy_never_splits() {
        let text = "p.\n\n".repeat(500);
        let mut none_config = config(25, 5, BoundaryKind::Paragraph);
        none_config.strategy = ChunkStrategy::None;
        let chunks = chunk_document(&text, &none_config, 4.0);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn test_page_boundary_uses_form_feed() {
        let page = format!("{}\u{c}", "page body text ".repeat(4));
        let text = page.repeat(10);
        let chunks = chunk_document(&text, &config(30, 0, BoundaryKind::Page), 4.0);
        assert!(chunks.len() > 1);
        assert!(chunks[0].text.ends_with('\u{c}'));
    }

    #[test]
    fn test_empty_document() {
        let chunks = chunk_document("", &config(100, 10, BoundaryKind::Paragraph), 4.0);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].end, 0);
    }

    #[test]
    fn test_chunk_ids_are_sequential() {
        let text = "para.\n\n".repeat(200);
        let chunks = chunk_document(&text, &config(25, 5, BoundaryKind::Paragraph), 4.0);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
            assert_eq!(chunk.id, format!("chunk_{}", i));
        }
    }
}
