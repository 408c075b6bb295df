//! Fixed-size overlapping chunking
//!
//! Documents are split on character boundaries into windows of `size` chars
//! that overlap by `overlap` chars, so a sentence cut at one boundary is
//! still intact at the start of the next chunk.

/// Split `text` into overlapping chunks of at most `size` characters.
///
/// Consecutive chunks share their last/first `overlap` characters. A text
/// no longer than `size` yields exactly one chunk. Boundaries are measured
/// in `char`s, never inside a UTF-8 sequence.
///
/// # Panics
///
/// Panics if `overlap >= size`; callers validate chunking parameters at
/// configuration load.
#[must_use]
pub fn chunk_text(text: &str, size: usize, overlap: usize) -> Vec<String> {
    assert!(overlap < size, "chunk overlap must be smaller than chunk size");

    let chars: Vec<char> = text.chars().collect();
    let len = chars.len();
    if len <= size {
        return vec![text.to_string()];
    }

    let step = size - overlap;
    let count = (len - overlap).div_ceil(step);

    (0..count)
        .map(|i| {
            let start = i * step;
            let end = (start + size).min(len);
            chars[start..end].iter().collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text_single_chunk() {
        assert_eq!(chunk_text("hello", 10, 2), vec!["hello"]);
        assert_eq!(chunk_text("exactly-10", 10, 2), vec!["exactly-10"]);
        assert_eq!(chunk_text("", 10, 2), vec![""]);
    }

    #[test]
    fn test_chunk_count_formula() {
        // L=17, C=10, O=2 -> ceil((17-2)/8) = 2
        let chunks = chunk_text("title foo bar baz", 10, 2);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "title foo ");
        assert_eq!(chunks[1], "o bar baz");

        // L=25, C=10, O=2 -> ceil(23/8) = 3
        let chunks = chunk_text(&"x".repeat(25), 10, 2);
        assert_eq!(chunks.len(), 3);
    }

    #[test]
    fn test_overlap_between_consecutive_chunks() {
        let text: String = ('a'..='z').collect();
        let chunks = chunk_text(&text, 10, 3);

        for pair in chunks.windows(2) {
            let prev: Vec<char> = pair[0].chars().collect();
            let next: Vec<char> = pair[1].chars().collect();
            assert_eq!(&prev[prev.len() - 3..], &next[..3]);
        }
    }

    #[test]
    fn test_reconstruction() {
        let text = "the quick brown fox jumps over the lazy dog near the river bank";
        let overlap = 4;
        let chunks = chunk_text(text, 16, overlap);

        let mut rebuilt: String = chunks[0].clone();
        for chunk in &chunks[1..] {
            rebuilt.extend(chunk.chars().skip(overlap));
        }
        assert_eq!(rebuilt, text);
    }

    #[test]
    fn test_multibyte_boundaries() {
        let text = "héllo wörld çafé crème brûlée extra";
        let chunks = chunk_text(text, 12, 3);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 12);
        }
    }

    #[test]
    #[should_panic(expected = "chunk overlap must be smaller")]
    fn test_invalid_overlap_panics() {
        let _ = chunk_text("abc", 4, 4);
    }
}
