//! Text normalization for embedding and keyword search
//!
//! Raw sources arrive as markdown, HTML-ish chat exports, or plain text.
//! Everything that carries no semantic weight for retrieval is stripped
//! before embedding: code, markup, URLs down to their domain/path, mention
//! tokens. The result is whitespace-collapsed and case-folded.

use std::sync::LazyLock;

use regex::Regex;

static CODE_FENCE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)```.*?```").expect("valid regex"));
static INLINE_CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"`[^`]*`").expect("valid regex"));
static HTML_COMMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").expect("valid regex"));
static BLOCK_COMMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)/\*.*?\*/").expect("valid regex"));
static LINE_COMMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^\s*//.*$").expect("valid regex"));
static HEADER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^#{1,6}\s*").expect("valid regex"));
static IMAGE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"!\[([^\]]*)\]\([^)]*\)").expect("valid regex"));
static LINK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[([^\]]*)\]\([^)]*\)").expect("valid regex"));
static URL_PREFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"https?://(www\.)?").expect("valid regex"));
static MENTION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<@[!&]?\d+>").expect("valid regex"));
static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("valid regex"));
static HORIZONTAL_RULE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*[-*_]{3,}\s*$").expect("valid regex"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Normalize raw text for embedding and keyword search.
///
/// Order matters: code and comments go first (they may contain markup),
/// then markdown structure is reduced to label text, then URLs lose their
/// scheme, then remaining tag-like tokens are dropped.
#[must_use]
pub fn preprocess(raw: &str) -> String {
    let text = CODE_FENCE.replace_all(raw, "");
    let text = INLINE_CODE.replace_all(&text, "");
    let text = HTML_COMMENT.replace_all(&text, "");
    let text = BLOCK_COMMENT.replace_all(&text, "");
    let text = LINE_COMMENT.replace_all(&text, "");
    let text = HEADER.replace_all(&text, "");
    let text = IMAGE.replace_all(&text, "$1");
    let text = LINK.replace_all(&text, "$1");
    let text = URL_PREFIX.replace_all(&text, "");
    let text = MENTION.replace_all(&text, "");
    let text = TAG.replace_all(&text, "");
    let text = HORIZONTAL_RULE.replace_all(&text, "");
    let text = WHITESPACE.replace_all(&text, " ");

    text.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_markdown_reduced_to_labels() {
        let raw = "# Title\n\nSee [the docs](https://example.com/page) and ![logo](img.png).";
        assert_eq!(preprocess(raw), "title see the docs and logo.");
    }

    #[test]
    fn test_code_dropped() {
        let raw = "Before\n```rust\nfn main() {}\n```\nAfter `let x = 1;` done";
        assert_eq!(preprocess(raw), "before after done");
    }

    #[test]
    fn test_bare_url_reduced_to_domain_path() {
        let raw = "read https://www.example.com/a/b for details";
        assert_eq!(preprocess(raw), "read example.com/a/b for details");
    }

    #[test]
    fn test_mentions_and_tags_stripped() {
        let raw = "hey <@12345> check <b>this</b> out";
        assert_eq!(preprocess(raw), "hey check this out");
    }

    #[test]
    fn test_rules_and_comments_stripped() {
        let raw = "above\n---\n<!-- hidden -->\n/* block */\n// line\nbelow";
        assert_eq!(preprocess(raw), "above below");
    }

    #[test]
    fn test_whitespace_collapsed_and_case_folded() {
        let raw = "  Multiple   SPACES\n\nand\tlines ";
        assert_eq!(preprocess(raw), "multiple spaces and lines");
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(preprocess(""), "");
        assert_eq!(preprocess("```only code```"), "");
    }
}
