//! Entity & Term Resolver
//!
//! Matches natural-language terms to catalog elements. Order: exact alias
//! (diacritic and case-insensitive), then prefix/substring, then fuzzy. Close
//! scores are reported as ambiguous instead of picking one.

use crate::catalog::{AliasTarget, Catalog, EntityValue};
use crate::config::RouterConfig;
use crate::fuzzy_matcher::{fold, FuzzyMatcher};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const MAX_NGRAM: usize = 4;

/// Function words never matched on their own (French and English)
const STOPWORDS: &[&str] = &[
    "a", "au", "aux", "avec", "ce", "ces", "cet", "cette", "combien", "comment", "dans", "de",
    "des", "du", "elle", "en", "est", "et", "il", "je", "la", "le", "les", "leur", "leurs", "ma",
    "mes", "mon", "ne", "nos", "notre", "ou", "par", "pas", "pour", "qu", "que", "quel", "quelle",
    "quelles", "quels", "qui", "quoi", "sa", "se", "ses", "son", "sont", "sur", "ta", "tes", "ton",
    "tous", "tout", "toutes", "un", "une", "vos", "votre", "y", "d", "l", "s", "j", "n", "c",
    "nombre", "total", "somme", "moyenne", "moyen", "liste", "lister", "afficher", "affiche",
    "montre", "donne", "mois", "semaine", "annee", "jour", "jours", "dernier", "derniere",
    "derniers", "precedent", "hier", "aujourd", "hui", "ci", "y", "a", "t", "il", "ya",
    "the", "of", "for", "in", "on", "and", "or", "to", "how", "many", "what", "is", "are", "me",
    "show", "list", "all", "my", "this", "that", "last", "month", "year", "week", "today",
];

/// Words that may open a question without naming anything
const OPENERS: &[&str] = &[
    "quand", "pourquoi", "combien", "quel", "quelle", "quels", "quelles", "calcule", "calculer",
    "calculez", "donne", "donnez", "donner", "dis", "dites", "indique", "indiquez", "montrez",
    "affichez", "listez", "liste", "retrouve", "retrouver", "trouve", "trouver", "cherche",
    "chercher", "recherche", "rechercher", "peux", "pouvez", "peut", "ai", "avons", "avez", "ya",
    "existe", "bonjour", "salut", "merci", "svp", "stp", "sinon", "aussi", "pareil", "idem",
    "meme", "which", "give", "count", "sum", "average", "find", "where", "when", "who", "do",
    "does", "can", "please", "hello",
];

/// Prepositions after which a name is expected
const ENTITY_SLOTS: &[&str] = &["pour", "de", "du", "chez", "for", "of"];

/// Calendar words that are never names
const TIME_WORDS: &[&str] = &[
    "janvier", "fevrier", "mars", "avril", "mai", "juin", "juillet", "aout", "septembre",
    "octobre", "novembre", "decembre", "january", "february", "march", "april", "may", "june",
    "july", "august", "september", "october", "november", "december", "semaines", "annees",
    "ans", "an", "trimestre", "trimestres", "derniere", "dernieres", "precedente", "courant",
    "courante", "days", "months", "weeks", "years", "yesterday",
];

pub fn is_stopword(folded: &str) -> bool {
    STOPWORDS.contains(&folded)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MatchKind {
    Table,
    View,
    Column,
    Synonym,
    EntityValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRef {
    pub entity_type: String,
    pub id: i64,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateMatch {
    pub kind: MatchKind,
    pub canonical: String,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<EntityRef>,
    #[serde(skip)]
    pub target: Option<AliasTarget>,
}

/// Outcome of ranking a candidate list
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Unique(CandidateMatch),
    Ambiguous(Vec<CandidateMatch>),
    Unknown,
}

/// A span of the utterance that matched something in the catalog
#[derive(Debug, Clone)]
pub struct Mention {
    /// Word indexes `[start, end)`
    pub start: usize,
    pub end: usize,
    pub text: String,
    pub candidates: Vec<CandidateMatch>,
}

impl Mention {
    pub fn best(&self) -> Option<&CandidateMatch> {
        self.candidates.first()
    }

    pub fn resolution(&self, margin: f64) -> Resolution {
        classify(&self.candidates, margin)
    }

    pub fn is_entity(&self) -> bool {
        self.best().map(|c| c.kind == MatchKind::EntityValue).unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub struct Word {
    pub original: String,
    pub folded: String,
}

#[derive(Debug, Clone)]
pub struct ScanResult {
    pub words: Vec<Word>,
    pub mentions: Vec<Mention>,
}

impl ScanResult {
    pub fn entity_mentions(&self) -> impl Iterator<Item = &Mention> {
        self.mentions.iter().filter(|m| m.is_entity())
    }

    pub fn catalog_mentions(&self) -> impl Iterator<Item = &Mention> {
        self.mentions.iter().filter(|m| !m.is_entity())
    }

    fn covered(&self, index: usize) -> bool {
        self.mentions.iter().any(|m| m.start <= index && index < m.end)
    }

    /// Words that look like a name but matched nothing in the catalog.
    ///
    /// A word is suspect when it is capitalised, when it sits right after a
    /// preposition that introduces an entity ("pour", "chez", ...), or when it
    /// opens the sentence without being a known question opener.
    pub fn unresolved_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for (i, w) in self.words.iter().enumerate() {
            let folded = w.folded.as_str();
            if self.covered(i)
                || is_stopword(folded)
                || TIME_WORDS.contains(&folded)
                || folded.chars().all(|c| c.is_ascii_digit())
            {
                continue;
            }
            let capitalised = w.original.chars().next().map(char::is_uppercase).unwrap_or(false);
            let len = folded.chars().count();
            let suspect = if i == 0 {
                !OPENERS.contains(&folded) && (capitalised || len >= 4)
            } else {
                (capitalised && len >= 2)
                    || (len >= 4 && ENTITY_SLOTS.contains(&self.words[i - 1].folded.as_str()))
            };
            if suspect && !names.contains(&w.original) {
                names.push(w.original.clone());
            }
        }
        names
    }
}

/// Rank candidates and decide between unique, ambiguous and unknown.
pub fn classify(candidates: &[CandidateMatch], margin: f64) -> Resolution {
    match candidates {
        [] => Resolution::Unknown,
        [only] => Resolution::Unique(only.clone()),
        [first, rest @ ..] => {
            let close: Vec<CandidateMatch> = rest
                .iter()
                .take_while(|c| first.score - c.score <= margin)
                .cloned()
                .collect();
            if close.is_empty() {
                Resolution::Unique(first.clone())
            } else {
                let mut all = vec![first.clone()];
                all.extend(close);
                Resolution::Ambiguous(all)
            }
        }
    }
}

/// Split an utterance into words, keeping the original spelling alongside the folded form.
pub fn split_words(utterance: &str) -> Vec<Word> {
    utterance
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| Word {
            original: w.to_string(),
            folded: fold(w),
        })
        .filter(|w| !w.folded.is_empty())
        .collect()
}

pub struct TermResolver<'a> {
    catalog: &'a Catalog,
    matcher: FuzzyMatcher,
    ambiguity_margin: f64,
}

impl<'a> TermResolver<'a> {
    pub fn new(catalog: &'a Catalog, config: &RouterConfig) -> Self {
        Self {
            catalog,
            matcher: FuzzyMatcher::from_config(config),
            ambiguity_margin: config.ambiguity_margin,
        }
    }

    pub fn ambiguity_margin(&self) -> f64 {
        self.ambiguity_margin
    }

    /// Resolve a single term against the catalog.
    pub fn resolve(&self, term: &str) -> Vec<CandidateMatch> {
        let folded = fold(term);
        if folded.is_empty() {
            return Vec::new();
        }

        let exact = self.exact(&folded);
        if !exact.is_empty() {
            return rank(exact);
        }

        if folded.chars().count() >= 3 {
            let mut partial = Vec::new();
            for (alias, targets) in self.catalog.aliases() {
                if let Some(score) = partial_score(&folded, alias) {
                    partial.extend(targets.iter().map(|t| self.alias_candidate(t, score)));
                }
            }
            partial.extend(self.partial_entities(&folded));
            if !partial.is_empty() {
                return rank(partial);
            }
        }

        rank(self.fuzzy(&folded))
    }

    /// Scan an utterance for catalog mentions, longest phrase first.
    pub fn scan(&self, utterance: &str) -> ScanResult {
        let words = split_words(utterance);
        let folded: Vec<&str> = words.iter().map(|w| w.folded.as_str()).collect();
        let max_len = self.catalog.max_alias_tokens().clamp(1, MAX_NGRAM);
        let mut mentions = Vec::new();

        let mut i = 0;
        while i < folded.len() {
            let longest = max_len.min(folded.len() - i);
            let mut consumed = 0;

            // Exact pass
            for len in (1..=longest).rev() {
                let slice = &folded[i..i + len];
                if slice.iter().all(|w| is_stopword(w)) {
                    continue;
                }
                let phrase = slice.join(" ");
                let candidates = self.exact(&phrase);
                if !candidates.is_empty() {
                    mentions.push(Mention {
                        start: i,
                        end: i + len,
                        text: phrase,
                        candidates: rank(candidates),
                    });
                    consumed = len;
                    break;
                }
            }

            // Tolerant pass
            if consumed == 0 {
                for len in (1..=longest).rev() {
                    let slice = &folded[i..i + len];
                    if slice.iter().any(|w| is_stopword(w) && len == 1)
                        || (len > 1 && is_stopword(slice[0]) && is_stopword(slice[len - 1]))
                        || slice.iter().all(|w| w.chars().all(|c| c.is_ascii_digit()))
                    {
                        continue;
                    }
                    let phrase = slice.join(" ");
                    let mut candidates = self.fuzzy_same_width(&phrase, len);
                    if len == 1 && phrase.chars().count() >= 4 {
                        candidates.extend(self.partial_entities(&phrase));
                    }
                    if !candidates.is_empty() {
                        mentions.push(Mention {
                            start: i,
                            end: i + len,
                            text: phrase,
                            candidates: rank(candidates),
                        });
                        consumed = len;
                        break;
                    }
                }
            }

            i += consumed.max(1);
        }

        ScanResult { words, mentions }
    }

    fn exact(&self, folded: &str) -> Vec<CandidateMatch> {
        let mut out: Vec<CandidateMatch> = self
            .catalog
            .alias_targets(folded)
            .iter()
            .map(|t| self.alias_candidate(t, 1.0))
            .collect();
        out.extend(
            self.catalog
                .entities_by_key(folded)
                .into_iter()
                .map(|e| entity_candidate(e, 1.0)),
        );
        out
    }

    fn partial_entities(&self, folded: &str) -> Vec<CandidateMatch> {
        self.catalog
            .entities
            .iter()
            .filter_map(|e| {
                e.keys
                    .iter()
                    .filter_map(|k| partial_score(folded, k))
                    .fold(None, |best: Option<f64>, s| Some(best.map_or(s, |b| b.max(s))))
                    .map(|score| entity_candidate(e, score))
            })
            .collect()
    }

    fn fuzzy(&self, folded: &str) -> Vec<CandidateMatch> {
        let width = folded.split(' ').count();
        self.fuzzy_same_width(folded, width)
    }

    /// Fuzzy match against aliases and entity keys having the same number of words.
    fn fuzzy_same_width(&self, folded: &str, width: usize) -> Vec<CandidateMatch> {
        let mut out = Vec::new();
        for (alias, targets) in self.catalog.aliases() {
            if alias.split(' ').count() != width {
                continue;
            }
            if let Some(score) = self.matcher.fuzzy_score(folded, alias) {
                out.extend(targets.iter().map(|t| self.alias_candidate(t, score)));
            }
        }
        for e in &self.catalog.entities {
            let best = e
                .keys
                .iter()
                .filter(|k| k.split(' ').count() == width)
                .filter_map(|k| self.matcher.fuzzy_score(folded, k))
                .fold(None, |best: Option<f64>, s| Some(best.map_or(s, |b| b.max(s))));
            if let Some(score) = best {
                out.push(entity_candidate(e, score));
            }
        }
        out
    }

    fn alias_candidate(&self, target: &AliasTarget, score: f64) -> CandidateMatch {
        let kind = match target {
            AliasTarget::Table { .. } => MatchKind::Table,
            AliasTarget::View { .. } => MatchKind::View,
            AliasTarget::Column { .. } => MatchKind::Column,
            AliasTarget::Synonym { .. } => MatchKind::Synonym,
        };
        CandidateMatch {
            kind,
            canonical: target.canonical(self.catalog),
            score,
            entity: None,
            target: Some(target.clone()),
        }
    }
}

fn entity_candidate(e: &EntityValue, score: f64) -> CandidateMatch {
    CandidateMatch {
        kind: MatchKind::EntityValue,
        canonical: format!("{}#{}", e.entity_type, e.id),
        score,
        entity: Some(EntityRef {
            entity_type: e.entity_type.clone(),
            id: e.id,
            label: e.label.clone(),
        }),
        target: None,
    }
}

/// Prefix or whole-word substring score, always below an exact match.
fn partial_score(term: &str, key: &str) -> Option<f64> {
    if term == key || term.is_empty() {
        return None;
    }
    let ratio = term.chars().count() as f64 / key.chars().count().max(1) as f64;
    if ratio >= 1.0 {
        return None;
    }
    if key.starts_with(term) && key[term.len()..].starts_with(' ') {
        Some(0.8 + 0.15 * ratio)
    } else if key.starts_with(term) {
        Some(0.75 + 0.15 * ratio)
    } else if key.split(' ').any(|w| w == term) {
        Some(0.7 + 0.15 * ratio)
    } else {
        None
    }
}

/// Deduplicate by canonical element (best score wins) and sort best first.
fn rank(candidates: Vec<CandidateMatch>) -> Vec<CandidateMatch> {
    let mut best: HashMap<String, CandidateMatch> = HashMap::new();
    for c in candidates {
        match best.get(&c.canonical) {
            Some(existing) if existing.score >= c.score => {}
            _ => {
                best.insert(c.canonical.clone(), c);
            }
        }
    }
    best.into_values()
        .sorted_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.canonical.cmp(&b.canonical))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::fixtures;

    fn resolver(catalog: &Catalog) -> TermResolver<'_> {
        TermResolver::new(catalog, &RouterConfig::default())
    }

    #[test]
    fn test_exact_alias_ignores_case_and_diacritics() {
        let catalog = fixtures::catalog();
        let r = resolver(&catalog);
        let found = r.resolve("Résidence");
        assert_eq!(found[0].kind, MatchKind::Table);
        assert_eq!(found[0].canonical, "properties");
        assert_eq!(found[0].score, 1.0);
    }

    #[test]
    fn test_prefix_scores_below_exact() {
        let catalog = fixtures::catalog();
        let r = resolver(&catalog);
        let found = r.resolve("Tilleuls");
        assert_eq!(found[0].canonical, "property#1");
        assert!(found[0].score < 1.0);
    }

    #[test]
    fn test_one_letter_typo_resolves_to_intended_tenant() {
        let catalog = fixtures::catalog();
        let r = resolver(&catalog);
        let found = r.resolve("Dupond");
        assert_eq!(
            classify(&found, r.ambiguity_margin()),
            Resolution::Unique(found[0].clone())
        );
        assert_eq!(found[0].canonical, "tenant#1");

        let found = r.resolve("Lefebre");
        assert_eq!(found[0].canonical, "tenant#4");
    }

    #[test]
    fn test_distant_term_is_unknown() {
        let catalog = fixtures::catalog();
        let r = resolver(&catalog);
        let found = r.resolve("Zorglub");
        assert_eq!(classify(&found, r.ambiguity_margin()), Resolution::Unknown);
        // Three edits away from "Dupont"
        assert!(r.resolve("Durand").is_empty());
    }

    #[test]
    fn test_homonyms_are_ambiguous() {
        let catalog = fixtures::catalog();
        let r = resolver(&catalog);
        let found = r.resolve("martin");
        match classify(&found, r.ambiguity_margin()) {
            Resolution::Ambiguous(all) => {
                let ids: Vec<&str> = all.iter().map(|c| c.canonical.as_str()).collect();
                assert_eq!(ids, vec!["tenant#2", "tenant#3"]);
            }
            other => panic!("expected ambiguity, got {:?}", other),
        }
    }

    #[test]
    fn test_scan_prefers_longest_phrase() {
        let catalog = fixtures::catalog();
        let r = resolver(&catalog);
        let scan = r.scan("Combien de baux actifs ?");
        assert_eq!(scan.mentions.len(), 1);
        assert_eq!(scan.mentions[0].text, "baux actifs");
        assert_eq!(scan.mentions[0].best().unwrap().kind, MatchKind::Synonym);
    }

    #[test]
    fn test_scan_finds_multiword_entity_and_table() {
        let catalog = fixtures::catalog();
        let r = resolver(&catalog);
        let scan = r.scan("Combien de baux pour la résidence Les Acacias ?");
        let canon: Vec<&str> = scan
            .mentions
            .iter()
            .map(|m| m.best().unwrap().canonical.as_str())
            .collect();
        assert_eq!(canon, vec!["leases", "properties", "property#2"]);
        assert!(scan.unresolved_names().is_empty());
    }

    #[test]
    fn test_scan_tolerates_typo_in_surname() {
        let catalog = fixtures::catalog();
        let r = resolver(&catalog);
        let scan = r.scan("Loyers payés par Dupond");
        let entity = scan.entity_mentions().next().unwrap();
        assert_eq!(entity.best().unwrap().canonical, "tenant#1");
    }

    #[test]
    fn test_unknown_proper_noun_is_reported() {
        let catalog = fixtures::catalog();
        let r = resolver(&catalog);
        let scan = r.scan("Combien de baux pour Zorglub ?");
        assert_eq!(scan.unresolved_names(), vec!["Zorglub".to_string()]);
    }

    #[test]
    fn test_lowercase_name_in_entity_slot_is_reported() {
        let catalog = fixtures::catalog();
        let r = resolver(&catalog);
        let scan = r.scan("Combien de baux pour durand ?");
        assert_eq!(scan.unresolved_names(), vec!["durand".to_string()]);

        let scan = r.scan("Combien de baux chez morel ?");
        assert_eq!(scan.unresolved_names(), vec!["morel".to_string()]);
    }

    #[test]
    fn test_sentence_initial_name_is_reported() {
        let catalog = fixtures::catalog();
        let r = resolver(&catalog);
        let scan = r.scan("Durand a combien de baux ?");
        assert_eq!(scan.unresolved_names(), vec!["Durand".to_string()]);
    }

    #[test]
    fn test_openers_and_calendar_words_are_not_names() {
        let catalog = fixtures::catalog();
        let r = resolver(&catalog);
        for utterance in [
            "Calcule le total des loyers",
            "Combien de paiements de septembre ?",
            "Quand commence le bail de Dupont ?",
            "Total des loyers ce mois",
            "Combien de paiements pour ce bien ?",
        ] {
            assert!(
                r.scan(utterance).unresolved_names().is_empty(),
                "{:?} -> {:?}",
                utterance,
                r.scan(utterance).unresolved_names()
            );
        }
    }

    #[test]
    fn test_never_returns_outside_catalog() {
        let catalog = fixtures::catalog();
        let r = resolver(&catalog);
        for term in ["users", "password", "utilisateurs", "admin"] {
            for c in r.resolve(term) {
                match c.kind {
                    MatchKind::Table | MatchKind::View => assert!(catalog.is_whitelisted(&c.canonical)),
                    MatchKind::Column => {
                        let (t, col) = c.canonical.split_once('.').unwrap();
                        assert!(catalog.has_column(t, col));
                    }
                    _ => {}
                }
            }
        }
    }
}
