use crate::config::RouterConfig;
use strsim::{jaro_winkler, osa_distance};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Fold a string for alias and value comparison.
///
/// - Unicode NFD, combining marks dropped ("Baux Éteints" -> "baux eteints")
/// - Lowercase
/// - Punctuation replaced by spaces, whitespace collapsed
pub fn fold(s: &str) -> String {
    let stripped: String = s
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_lowercase().next().unwrap_or(c)
            } else {
                ' '
            }
        })
        .collect();

    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Folded tokens of an utterance.
pub fn tokens(s: &str) -> Vec<String> {
    fold(s).split(' ').filter(|t| !t.is_empty()).map(str::to_string).collect()
}

/// Fuzzy matcher for entity values (tenant surnames, property names)
#[derive(Debug, Clone)]
pub struct FuzzyMatcher {
    /// Similarity threshold (0.0-1.0) for considering two strings as matches
    pub similarity_threshold: f64,
    /// Upper bound on edits for long terms; short terms allow a single edit
    pub max_edit_distance: usize,
    /// Terms shorter than this never match fuzzily
    pub min_term_len: usize,
}

impl Default for FuzzyMatcher {
    fn default() -> Self {
        Self::from_config(&RouterConfig::default())
    }
}

impl FuzzyMatcher {
    pub fn from_config(config: &RouterConfig) -> Self {
        Self {
            similarity_threshold: config.fuzzy_threshold,
            max_edit_distance: config.max_edit_distance,
            min_term_len: config.min_fuzzy_term_len,
        }
    }

    /// Jaro-Winkler similarity of the folded strings
    pub fn similarity(&self, s1: &str, s2: &str) -> f64 {
        jaro_winkler(&fold(s1), &fold(s2))
    }

    /// Edit distance (optimal string alignment, so one transposition is one edit)
    pub fn edit_distance(&self, s1: &str, s2: &str) -> usize {
        osa_distance(&fold(s1), &fold(s2))
    }

    /// Edits tolerated for a term of the given length.
    pub fn allowed_edits(&self, term_len: usize) -> usize {
        if term_len >= 8 {
            self.max_edit_distance
        } else {
            self.max_edit_distance.min(1)
        }
    }

    /// Score a typo-tolerant match of `term` against `candidate`.
    ///
    /// Both the similarity threshold and the edit budget must hold, so a far-off
    /// term is never accepted just because it shares a long prefix.
    pub fn fuzzy_score(&self, term: &str, candidate: &str) -> Option<f64> {
        let term = fold(term);
        let candidate = fold(candidate);
        let term_len = term.chars().count();
        if term_len < self.min_term_len || candidate.is_empty() {
            return None;
        }

        let distance = osa_distance(&term, &candidate);
        if distance > self.allowed_edits(term_len.max(candidate.chars().count())) {
            return None;
        }

        let score = jaro_winkler(&term, &candidate);
        (score >= self.similarity_threshold).then_some(score)
    }

    pub fn is_match(&self, s1: &str, s2: &str) -> bool {
        self.fuzzy_score(s1, s2).is_some()
    }
}
