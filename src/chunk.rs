//! Fixed-window overlapping text chunker.
//!
//! Splits document text into [`Chunk`]s of at most `chunk_size` characters,
//! each starting `chunk_size - overlap` characters after the previous one.
//! Offsets are counted in `char`s, so a window never ends inside a
//! multi-byte codepoint.
//!
//! # Guarantees
//!
//! - No chunk is empty; empty input yields no chunks.
//! - Text shorter than `chunk_size` yields exactly one chunk.
//! - Consecutive chunks overlap by exactly `overlap` characters, and
//!   [`reconstruct`] rebuilds the original text from the chunks.
//! - Chunk count is `ceil((len - overlap) / (chunk_size - overlap))` for
//!   `len > chunk_size`.
//! - Identical input produces identical chunks (ids included).
//!
//! # Example
//!
//! ```rust
//! use research_harness::chunk::chunk_text;
//!
//! let chunks = chunk_text("doc-1", "Hello world.", 800, 200);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].text, "Hello world.");
//! ```

use crate::models::{chunk_id_for, hash_text, Chunk};

/// Split `text` into overlapping chunks.
///
/// Callers must ensure `overlap < chunk_size` (validated at config load).
pub fn chunk_text(document_id: &str, text: &str, chunk_size: usize, overlap: usize) -> Vec<Chunk> {
    assert!(
        chunk_size > 0 && overlap < chunk_size,
        "chunk_size must be > overlap"
    );

    // Byte offset of every char boundary, plus the end of the string.
    let boundaries: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let n_chars = boundaries.len() - 1;

    let mut chunks = Vec::new();
    if n_chars == 0 {
        return chunks;
    }

    let stride = chunk_size - overlap;
    let mut start = 0usize;
    loop {
        let end = (start + chunk_size).min(n_chars);
        let piece = &text[boundaries[start]..boundaries[end]];
        let seq = chunks.len();
        chunks.push(Chunk {
            id: chunk_id_for(document_id, seq),
            document_id: document_id.to_string(),
            seq,
            start,
            end,
            text: piece.to_string(),
            hash: hash_text(piece),
        });
        if end == n_chars {
            break;
        }
        start += stride;
    }

    chunks
}

/// Expected chunk count for a text of `len` characters.
pub fn expected_chunk_count(len: usize, chunk_size: usize, overlap: usize) -> usize {
    if len == 0 {
        0
    } else if len <= chunk_size {
        1
    } else {
        let stride = chunk_size - overlap;
        (len - overlap).div_ceil(stride)
    }
}

/// Concatenate chunks, dropping the part of each chunk that overlaps the
/// previous one.
pub fn reconstruct(chunks: &[Chunk]) -> String {
    let mut out = String::new();
    let mut covered = 0usize;
    for chunk in chunks {
        let skip = covered.saturating_sub(chunk.start);
        out.extend(chunk.text.chars().skip(skip));
        covered = chunk.end;
    }
    out
}
