//! Chunking utilities for splitting policy documents into overlapping segments.
//!
//! Text is split recursively along a priority list of separators (paragraph
//! break, line break, sentence punctuation), falling back to whitespace
//! tokens. The resulting pieces are merged greedily into chunks of at most
//! `chunk_size` characters, and the tail of each chunk is repeated at the
//! start of the next so that context survives chunk boundaries.
//!
//! Sizes are counted in characters (Unicode scalar values); offsets are byte
//! offsets into the source text, so `&text[c.start_offset..c.end_offset]`
//! always equals `c.content`.

use serde::Serialize;

use crate::error::{Error, Result};

/// Default maximum chunk size in characters.
pub const DEFAULT_CHUNK_SIZE: usize = 300;

/// Default overlap between adjacent chunks in characters.
pub const DEFAULT_CHUNK_OVERLAP: usize = 50;

/// Default split points, tried in order.
pub const DEFAULT_SEPARATORS: &[&str] = &["\n\n", "\n", ".", "!"];

/// Chunking parameters.
///
/// # Examples
///
/// ```
/// use policyseek::chunking::{ChunkingConfig, DEFAULT_CHUNK_SIZE};
///
/// let config = ChunkingConfig::default();
/// assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
/// assert!(config.validate().is_ok());
///
/// assert!(ChunkingConfig::new(40, 40).validate().is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkingConfig {
    /// Maximum chunk size in characters.
    pub chunk_size: usize,
    /// Characters carried over from the end of one chunk to the next.
    pub overlap: usize,
    /// Split points in priority order.
    pub separators: Vec<String>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_OVERLAP)
    }
}

impl ChunkingConfig {
    /// Create a config with the default separators.
    pub fn new(chunk_size: usize, overlap: usize) -> Self {
        Self {
            chunk_size,
            overlap,
            separators: DEFAULT_SEPARATORS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    /// Replace the separator list.
    pub fn with_separators<I, S>(mut self, separators: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.separators = separators.into_iter().map(Into::into).collect();
        self
    }

    /// Reject configurations that cannot make progress.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk size must be positive".into()));
        }
        if self.overlap >= self.chunk_size {
            return Err(Error::Config(format!(
                "chunk overlap ({}) must be smaller than chunk size ({})",
                self.overlap, self.chunk_size
            )));
        }
        Ok(())
    }
}

/// A chunk of text from a larger document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chunk {
    /// The chunk text content.
    pub content: String,
    /// Zero-based position of the chunk within the document.
    pub index: usize,
    /// Byte offset where this chunk starts in the original document.
    pub start_offset: usize,
    /// Byte offset one past the end of this chunk.
    pub end_offset: usize,
}

impl Chunk {
    /// Length of the chunk in characters.
    pub fn char_len(&self) -> usize {
        self.content.chars().count()
    }
}

/// A contiguous byte range of the source text.
#[derive(Debug, Clone, Copy)]
struct Span {
    start: usize,
    end: usize,
    chars: usize,
}

/// Split text into overlapping chunks.
///
/// Returns an empty vector for empty input and a single chunk when the text
/// fits in `chunk_size`. A whitespace-free token longer than `chunk_size` is
/// emitted whole as its own chunk.
///
/// # Examples
///
/// ```
/// use policyseek::chunking::{chunk_text, ChunkingConfig};
///
/// let config = ChunkingConfig::new(1000, 100);
/// let chunks = chunk_text("Hello, world!", &config);
/// assert_eq!(chunks.len(), 1);
/// assert_eq!(chunks[0].content, "Hello, world!");
///
/// assert!(chunk_text("", &config).is_empty());
/// ```
pub fn chunk_text(text: &str, config: &ChunkingConfig) -> Vec<Chunk> {
    if text.is_empty() {
        return Vec::new();
    }

    let chunk_size = config.chunk_size.max(1);
    let char_count = text.chars().count();

    if char_count <= chunk_size {
        return vec![Chunk {
            content: text.to_string(),
            index: 0,
            start_offset: 0,
            end_offset: text.len(),
        }];
    }

    let separators: Vec<&str> = config
        .separators
        .iter()
        .map(String::as_str)
        .filter(|s| !s.is_empty())
        .collect();

    let mut pieces = Vec::new();
    split_recursive(text, 0, chunk_size, &separators, &mut pieces);

    merge_pieces(text, &pieces, chunk_size, config.overlap)
        .into_iter()
        .enumerate()
        .map(|(index, span)| Chunk {
            content: text[span.start..span.end].to_string(),
            index,
            start_offset: span.start,
            end_offset: span.end,
        })
        .collect()
}

/// Break `text` into pieces no longer than `chunk_size`, except for single
/// tokens that cannot be split further. `base` is the byte offset of `text`
/// within the whole document.
fn split_recursive(
    text: &str,
    base: usize,
    chunk_size: usize,
    separators: &[&str],
    out: &mut Vec<Span>,
) {
    let chars = text.chars().count();
    if chars <= chunk_size {
        out.push(Span {
            start: base,
            end: base + text.len(),
            chars,
        });
        return;
    }

    match separators.iter().position(|sep| text.contains(sep)) {
        Some(pos) => {
            let remaining = &separators[pos + 1..];
            for (offset, segment) in
                split_keeping_separator(text, separators[pos])
            {
                split_recursive(
                    segment,
                    base + offset,
                    chunk_size,
                    remaining,
                    out,
                );
            }
        }
        None => {
            for (offset, token) in split_tokens(text) {
                out.push(Span {
                    start: base + offset,
                    end: base + offset + token.len(),
                    chars: token.chars().count(),
                });
            }
        }
    }
}

/// Split at a separator, keeping it attached to the preceding segment.
fn split_keeping_separator<'a>(
    text: &'a str,
    separator: &str,
) -> Vec<(usize, &'a str)> {
    let mut result = Vec::new();
    let mut start = 0;

    while let Some(pos) = text[start..].find(separator) {
        let end = start + pos + separator.len();
        result.push((start, &text[start..end]));
        start = end;
    }

    if start < text.len() {
        result.push((start, &text[start..]));
    }

    result
}

/// Split into maximal runs of non-whitespace and single whitespace chars.
fn split_tokens(text: &str) -> Vec<(usize, &str)> {
    let mut result = Vec::new();
    let mut word_start: Option<usize> = None;

    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            if let Some(start) = word_start.take() {
                result.push((start, &text[start..i]));
            }
            result.push((i, &text[i..i + c.len_utf8()]));
        } else if word_start.is_none() {
            word_start = Some(i);
        }
    }

    if let Some(start) = word_start {
        result.push((start, &text[start..]));
    }

    result
}

/// Byte position reached by advancing `n` chars from `pos`.
fn advance_chars(text: &str, pos: usize, n: usize) -> usize {
    text[pos..]
        .char_indices()
        .nth(n)
        .map(|(i, _)| pos + i)
        .unwrap_or(text.len())
}

/// The last `overlap` chars of `span`, never the whole span.
fn overlap_tail(text: &str, span: Span, overlap: usize) -> Span {
    let keep = overlap.min(span.chars.saturating_sub(1));
    Span {
        start: advance_chars(text, span.start, span.chars - keep),
        end: span.end,
        chars: keep,
    }
}

/// Greedily merge contiguous pieces into overlapping chunk spans.
fn merge_pieces(
    text: &str,
    pieces: &[Span],
    chunk_size: usize,
    overlap: usize,
) -> Vec<Span> {
    let mut chunks = Vec::new();
    let mut window = Span {
        start: 0,
        end: 0,
        chars: 0,
    };
    // Everything before `covered` already belongs to an emitted chunk.
    let mut covered = 0;

    for piece in pieces {
        if window.chars + piece.chars > chunk_size && window.end > covered {
            chunks.push(window);
            covered = window.end;
            window = overlap_tail(text, window, overlap);
        }

        if piece.chars > chunk_size {
            chunks.push(*piece);
            covered = piece.end;
            window = overlap_tail(text, *piece, overlap);
            continue;
        }

        // Only the carried-over prefix can be in the way here; drop as much
        // of it as needed for the piece to fit.
        let excess = (window.chars + piece.chars).saturating_sub(chunk_size);
        if excess > 0 {
            window.start = advance_chars(text, window.start, excess);
            window.chars -= excess;
        }
        window.end = piece.end;
        window.chars += piece.chars;
    }

    if window.end > covered {
        chunks.push(window);
    }

    chunks
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    /// Rebuild the source from each chunk's non-overlapping portion.
    fn reconstruct(chunks: &[Chunk]) -> String {
        let mut out = String::new();
        let mut covered = 0;
        for chunk in chunks {
            assert!(chunk.start_offset <= covered, "gap before {chunk:?}");
            let skip = covered - chunk.start_offset;
            out.push_str(&chunk.content[skip..]);
            covered = chunk.end_offset;
        }
        out
    }

    #[test]
    fn empty_text_no_chunks() {
        assert!(chunk_text("", &ChunkingConfig::default()).is_empty());
    }

    #[test]
    fn short_text_single_chunk() {
        let text = "Economy class for flights under 6 hours.";
        let chunks = chunk_text(text, &ChunkingConfig::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, text);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[0].start_offset, 0);
        assert_eq!(chunks[0].end_offset, text.len());
    }

    #[test]
    fn text_exactly_chunk_size_is_one_chunk() {
        let text = "a".repeat(40);
        let chunks = chunk_text(&text, &ChunkingConfig::new(40, 10));
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn budget_sentences_overlap() {
        let text = "Budget limit is $5000 per person. Accommodations must be 4-star or higher.";
        let chunks = chunk_text(text, &ChunkingConfig::new(40, 10));

        assert!(chunks.len() >= 2, "got {chunks:?}");
        let first = &chunks[0].content;
        let tail: String = first
            .chars()
            .skip(first.chars().count() - 10)
            .collect();
        assert!(
            chunks[1].content.starts_with(&tail),
            "second chunk {:?} should start with {tail:?}",
            chunks[1].content
        );
        assert!(chunks[1].start_offset < chunks[0].end_offset);
        assert_eq!(reconstruct(&chunks), text);
    }

    #[test]
    fn first_chunk_ends_at_sentence_boundary() {
        let text = "Budget limit is $5000 per person. Accommodations must be 4-star or higher.";
        let chunks = chunk_text(text, &ChunkingConfig::new(40, 10));
        assert!(chunks[0].content.starts_with("Budget limit is $5000 per person."));
    }

    #[test]
    fn prefers_paragraph_breaks() {
        let para = "Flights must be booked six weeks ahead.";
        let text = format!("{para}\n\n{para}\n\n{para}");
        let chunks = chunk_text(&text, &ChunkingConfig::new(45, 0));

        assert_eq!(chunks.len(), 3);
        for chunk in &chunks {
            assert_eq!(chunk.content.trim(), para);
        }
    }

    #[test]
    fn indices_are_sequential_and_offsets_match() {
        let text = "Travel insurance is required. ".repeat(40);
        let chunks = chunk_text(&text, &ChunkingConfig::new(100, 20));

        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
            assert_eq!(&text[chunk.start_offset..chunk.end_offset], chunk.content);
            assert!(chunk.char_len() <= 100);
        }
        assert_eq!(reconstruct(&chunks), text);
    }

    #[test]
    fn long_token_emitted_whole() {
        let token = "x".repeat(120);
        let text = format!("short words here {token} and more words after");
        let chunks = chunk_text(&text, &ChunkingConfig::new(30, 5));

        assert!(chunks.iter().any(|c| c.content == token));
        assert_eq!(reconstruct(&chunks), text);
    }

    #[test]
    fn zero_overlap_chunks_are_disjoint() {
        let text = "one two three four five six seven eight nine ten ".repeat(10);
        let chunks = chunk_text(&text, &ChunkingConfig::new(50, 0));

        for pair in chunks.windows(2) {
            assert_eq!(pair[0].end_offset, pair[1].start_offset);
        }
    }

    #[test]
    fn handles_multibyte_chars() {
        let text = "Café ☕ naïve 日本語 🎉 policy. ".repeat(30);
        let chunks = chunk_text(&text, &ChunkingConfig::new(60, 15));

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.char_len() <= 60);
        }
        assert_eq!(reconstruct(&chunks), text);
    }

    #[test]
    fn custom_separators() {
        let text = "alpha;beta;gamma;delta;epsilon;zeta";
        let config = ChunkingConfig::new(12, 0).with_separators([";"]);
        let chunks = chunk_text(text, &config);

        assert_eq!(chunks[0].content, "alpha;beta;");
        assert_eq!(reconstruct(&chunks), text);
    }

    #[test]
    fn deterministic() {
        let text = "Rooms need WiFi. Rooms need AC!\nStay within 30 minutes.".repeat(8);
        let config = ChunkingConfig::new(50, 12);
        assert_eq!(chunk_text(&text, &config), chunk_text(&text, &config));
    }

    #[test]
    fn validate_rejects_bad_configs() {
        assert!(ChunkingConfig::new(0, 0).validate().is_err());
        assert!(ChunkingConfig::new(10, 10).validate().is_err());
        assert!(ChunkingConfig::new(10, 9).validate().is_ok());
    }

    proptest! {
        #[test]
        fn reconstructs_source(
            text in "[a-zA-Z0-9 .!,\n]{0,600}",
            size in 5usize..120,
            overlap_ratio in 0.0f64..0.9,
        ) {
            let overlap = (size as f64 * overlap_ratio) as usize;
            let chunks = chunk_text(&text, &ChunkingConfig::new(size, overlap));
            prop_assert_eq!(reconstruct(&chunks), text);
        }

        #[test]
        fn respects_size_bound(
            text in "\\PC{0,400}",
            size in 5usize..80,
            overlap in 0usize..4,
        ) {
            let chunks = chunk_text(&text, &ChunkingConfig::new(size, overlap));
            for chunk in &chunks {
                prop_assert!(
                    chunk.char_len() <= size
                        || !chunk.content.chars().any(char::is_whitespace),
                    "oversized chunk {:?}", chunk
                );
            }
        }

        #[test]
        fn unicode_reconstructs(
            text in "\\PC{0,300}",
            size in 3usize..60,
        ) {
            let chunks = chunk_text(&text, &ChunkingConfig::new(size, size / 3));
            prop_assert_eq!(reconstruct(&chunks), text);
        }
    }
}
