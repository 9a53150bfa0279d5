//! Builds FTS5 match expressions from free text.

use std::sync::LazyLock;

use regex::Regex;

/// Lowercase alphanumeric terms of `text`, in order, without duplicates.
pub fn terms(text: &str) -> Vec<String> {
    static TERM_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"[\p{L}\p{N}]+").expect("valid regex"));

    let mut out: Vec<String> = Vec::new();
    for m in TERM_RE.find_iter(text) {
        let term = m.as_str().to_lowercase();
        if !out.contains(&term) {
            out.push(term);
        }
    }
    out
}

/// Function words that match nearly every chunk. Dropped from the positive
/// side unless the query consists of nothing else.
const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "into", "is", "it",
    "of", "on", "or", "the", "to", "with",
];

/// Build the shortlist expression: any query term matches, no negative
/// phrase may appear.
///
/// Each negative term is one quoted phrase, so excluding "machine learning"
/// keeps chunks that only mention "machine". Returns `None` when the query
/// has no usable terms.
pub fn match_expression(query: &str, negative_terms: &[String]) -> Option<String> {
    let all = terms(query);
    if all.is_empty() {
        return None;
    }
    let content: Vec<&String> = all
        .iter()
        .filter(|t| !STOP_WORDS.contains(&t.as_str()))
        .collect();
    let positive = if content.is_empty() {
        all.iter().collect()
    } else {
        content
    };

    let mut expr = format!(
        "({})",
        positive
            .iter()
            .map(|t| format!("\"{t}\""))
            .collect::<Vec<_>>()
            .join(" OR ")
    );

    let query_phrase = all.join(" ");
    for negative in negative_terms {
        let phrase = terms(negative).join(" ");
        if phrase.is_empty() || phrase == query_phrase {
            continue;
        }
        expr.push_str(&format!(" NOT \"{phrase}\""));
    }
    Some(expr)
}
