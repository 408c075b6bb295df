//! Lexical reranking over vector-scored candidates
//!
//! Vector similarity alone misses exact-term intent ("what does `sweep`
//! do"), so candidates get a second pass: term coverage boosts the score,
//! distinct query terms appearing close together boost it further, and a
//! candidate matching nothing from a context-free query is penalized.

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by", "is",
    "was", "are", "were", "be", "been", "this", "that", "these", "those", "it", "its", "as",
    "from", "about", "into", "over", "what", "when", "where", "which", "who", "how", "why", "can",
    "could", "do", "does", "did", "will", "would", "should", "has", "have", "had", "not", "you",
    "your", "they", "them", "there",
];

/// Window (in whitespace tokens) within which two distinct matched terms
/// count as a proximity hit.
const PROXIMITY_WINDOW: usize = 5;

/// Extract search terms from a query: lowercased whitespace tokens longer
/// than two characters, minus stop words.
#[must_use]
pub fn query_terms(query: &str) -> Vec<String> {
    query
        .to_lowercase()
        .split_whitespace()
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|t| t.len() > 2 && !STOP_WORDS.contains(&t.as_str()))
        .collect()
}

/// Rescore a single candidate.
///
/// `base` is the vector-derived similarity. Matching terms multiply it by
/// `1 + matched/total * 2`; distinct terms within [`PROXIMITY_WINDOW`]
/// tokens of each other multiply by a further 1.5. A candidate matching no
/// term is multiplied by 0.3, unless conversation context contributed to
/// the query (`has_context`), in which case the vector score stands.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn rerank_score(base: f32, text: &str, terms: &[String], has_context: bool) -> f32 {
    if terms.is_empty() {
        return base;
    }

    let text_lower = text.to_lowercase();
    let matched: Vec<&String> = terms.iter().filter(|t| text_lower.contains(t.as_str())).collect();

    if matched.is_empty() {
        return if has_context { base } else { base * 0.3 };
    }

    let coverage = matched.len() as f32 / terms.len() as f32;
    let mut score = base * (1.0 + coverage * 2.0);

    if has_proximity_match(&text_lower, &matched) {
        score *= 1.5;
    }

    score
}

/// True if two distinct matched terms occur within [`PROXIMITY_WINDOW`]
/// tokens of each other.
fn has_proximity_match(text_lower: &str, matched: &[&String]) -> bool {
    if matched.len() < 2 {
        return false;
    }

    // (token position, index of the matched term found in that token)
    let mut hits: Vec<(usize, usize)> = Vec::new();
    for (pos, token) in text_lower.split_whitespace().enumerate() {
        for (term_idx, term) in matched.iter().enumerate() {
            if token.contains(term.as_str()) {
                hits.push((pos, term_idx));
            }
        }
    }

    hits.iter().any(|&(pos_a, term_a)| {
        hits.iter().any(|&(pos_b, term_b)| {
            term_a != term_b && pos_a.abs_diff(pos_b) <= PROXIMITY_WINDOW
        })
    })
}
