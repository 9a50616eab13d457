//! Concrete collaborators: SQLite introspection and read-only execution, and
//! JSON-backed knowledge-base and document indexes.

pub mod documents;
pub mod knowledge;
pub mod sqlite;

pub use documents::JsonDocumentIndex;
pub use knowledge::JsonKnowledgeBase;
pub use sqlite::{SqliteExecutor, SqliteIntrospector};

use crate::fuzzy_matcher::tokens;
use crate::resolver::is_stopword;

/// Shortest token kept as a search keyword
const MIN_KEYWORD_LEN: usize = 3;
/// Shared prefix length that counts as the same word ("quittance" / "quittances")
const STEM_LEN: usize = 5;

/// Folded content words of `text`.
pub(crate) fn keywords(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for token in tokens(text) {
        if token.chars().count() < MIN_KEYWORD_LEN || is_stopword(&token) {
            continue;
        }
        if !out.contains(&token) {
            out.push(token);
        }
    }
    out
}

fn same_word(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    short.len() >= STEM_LEN && long.starts_with(short)
}

/// Fraction of `query` keywords found in `haystack` keywords.
pub(crate) fn overlap(query: &[String], haystack: &[String]) -> f64 {
    if query.is_empty() {
        return 0.0;
    }
    let hits = query
        .iter()
        .filter(|q| haystack.iter().any(|h| same_word(q, h)))
        .count();
    hits as f64 / query.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keywords_drop_function_words() {
        assert_eq!(
            keywords("Comment générer une quittance ?"),
            vec!["generer".to_string(), "quittance".to_string()]
        );
    }

    #[test]
    fn test_overlap_tolerates_plurals() {
        let query = keywords("quittances de loyer");
        let doc = keywords("Quittance mensuelle de loyer");
        assert!((overlap(&query, &doc) - 1.0).abs() < f64::EPSILON);
        assert_eq!(overlap(&[], &doc), 0.0);
    }
}
