//! Span-tracking paragraph chunker.
//!
//! Splits a document into [`Chunk`]s on paragraph boundaries (`\n\n`),
//! respecting a byte budget per chunk. Unlike a copying chunker, every
//! chunk here is an exact contiguous byte slice of the document:
//! `chunk.text == doc_text[span_start..span_end]`. That invariant is what
//! lets a checkout reconstruct chunk text from the document blob alone,
//! and what makes per-tree FTS rebuilds verifiable against stored hashes.
//!
//! Chunk ids are deterministic — `"{doc_id}:{span_start}-{span_end}"` —
//! so re-ingesting identical text yields identical ids, hashes, and
//! ultimately identical tree hashes.

use sha2::{Digest, Sha256};

use crate::models::Chunk;

/// Identifier recorded in `tree_chunks.chunker_id` for spans produced here.
pub const CHUNKER_ID: &str = "paragraph-v1";

/// Split `text` into span-exact chunks on paragraph boundaries.
///
/// # Guarantees
///
/// - At least one chunk is returned (a `0..0` span for empty text).
/// - `text[span_start..span_end] == chunk.text` for every chunk.
/// - Spans are byte offsets, always on UTF-8 char boundaries.
/// - Consecutive paragraphs are packed while the combined slice stays
///   within `max_chunk_bytes`; oversized paragraphs are hard-split at the
///   nearest newline or space boundary.
pub fn chunk_document(doc_id: &str, text: &str, max_chunk_bytes: usize) -> Vec<Chunk> {
    if text.is_empty() {
        return vec![make_chunk(doc_id, text, 0, 0)];
    }

    let paragraphs = paragraph_ranges(text);
    if paragraphs.is_empty() {
        // Whitespace-only document: a single chunk covering all of it.
        return vec![make_chunk(doc_id, text, 0, text.len())];
    }

    let mut chunks = Vec::new();
    let mut group_start: Option<usize> = None;
    let mut group_end = 0usize;

    for &(start, end) in &paragraphs {
        if end - start > max_chunk_bytes {
            // Flush the open group, then hard-split the oversized paragraph.
            if let Some(gs) = group_start.take() {
                chunks.push(make_chunk(doc_id, text, gs, group_end));
            }
            for (s, e) in split_oversized(text, start, end, max_chunk_bytes) {
                chunks.push(make_chunk(doc_id, text, s, e));
            }
            continue;
        }

        match group_start {
            Some(gs) if end - gs <= max_chunk_bytes => {
                group_end = end;
            }
            Some(gs) => {
                chunks.push(make_chunk(doc_id, text, gs, group_end));
                group_start = Some(start);
                group_end = end;
            }
            None => {
                group_start = Some(start);
                group_end = end;
            }
        }
    }

    if let Some(gs) = group_start {
        chunks.push(make_chunk(doc_id, text, gs, group_end));
    }

    if chunks.is_empty() {
        chunks.push(make_chunk(doc_id, text, 0, text.len()));
    }

    chunks
}

/// Byte ranges of non-empty paragraphs, trimmed of surrounding whitespace.
fn paragraph_ranges(text: &str) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    let mut offset = 0usize;

    for segment in text.split("\n\n") {
        let seg_start = offset;
        offset += segment.len() + 2;

        let trimmed = segment.trim_start();
        let lead = segment.len() - trimmed.len();
        let trimmed = trimmed.trim_end();
        if trimmed.is_empty() {
            continue;
        }
        let start = seg_start + lead;
        ranges.push((start, start + trimmed.len()));
    }

    ranges
}

/// Hard-split an oversized paragraph into ranges of at most `max` bytes,
/// preferring newline then space boundaries, always on char boundaries.
fn split_oversized(text: &str, start: usize, end: usize, max: usize) -> Vec<(usize, usize)> {
    let max = max.max(1);
    let mut pieces = Vec::new();
    let mut cursor = start;

    while cursor < end {
        if end - cursor <= max {
            pieces.push((cursor, end));
            break;
        }

        let window = &text[cursor..end];
        let limit = snap_to_char_boundary(window, max);
        let cut = window[..limit]
            .rfind('\n')
            .or_else(|| window[..limit].rfind(' '))
            .map(|pos| pos + 1)
            .unwrap_or(limit);
        let cut = snap_to_char_boundary(window, cut);
        // Guarantee progress even for a single huge multibyte run.
        let cut = if cut == 0 {
            window
                .char_indices()
                .nth(1)
                .map(|(i, _)| i)
                .unwrap_or(window.len())
        } else {
            cut
        };

        pieces.push((cursor, cursor + cut));
        cursor += cut;
    }

    pieces
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn make_chunk(doc_id: &str, text: &str, start: usize, end: usize) -> Chunk {
    let slice = &text[start..end];
    let mut hasher = Sha256::new();
    hasher.update(slice.as_bytes());
    let content_hash = format!("{:x}", hasher.finalize());

    Chunk {
        chunk_id: format!("{}:{}-{}", doc_id, start, end),
        doc_id: doc_id.to_string(),
        span_start: start as i64,
        span_end: end as i64,
        text: slice.to_string(),
        content_hash,
    }
}
