//! Structured query intent
//!
//! Turns resolver mentions into a typed intent: which relation, which
//! aggregation, which business conditions and which relative period. Anaphoric
//! continuations inherit from the last structured turn after re-validation.

use crate::catalog::{AliasTarget, Catalog, CompareOp, Queryable, SqlParam};
use crate::error::ErrorCategory;
use crate::fuzzy_matcher::fold;
use crate::memory::{last_structured_turn, ConversationTurn, ExtractedEntities};
use crate::resolver::{CandidateMatch, Resolution, ScanResult};
use crate::scope::ScopeContext;
use crate::time::{RelativePeriod, TimeWindow};
use chrono::NaiveDate;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static! {
    static ref COUNT_WORDS: Regex =
        Regex::new(r"\b(?:combien|nombre|how many|count)\b").unwrap();
    static ref SUM_WORDS: Regex =
        Regex::new(r"\b(?:total|totale|somme|cumul|sum)\b").unwrap();
    static ref AVG_WORDS: Regex =
        Regex::new(r"\b(?:moyenne|moyen|moyens|average|avg)\b").unwrap();
    static ref LIST_WORDS: Regex = Regex::new(
        r"\b(?:liste|lister|affiche|afficher|montre|montrer|quels|quelles|list|show|which)\b"
    )
    .unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Aggregation {
    Count,
    Sum { column: String },
    Average { column: String },
    List,
}

impl Aggregation {
    pub fn column(&self) -> Option<&str> {
        match self {
            Aggregation::Sum { column } | Aggregation::Average { column } => Some(column),
            Aggregation::Count | Aggregation::List => None,
        }
    }
}

/// A bound filter on the target relation coming from a business synonym
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Folded synonym phrase, kept so memory can re-validate it
    pub phrase: String,
    pub table: String,
    pub column: String,
    pub op: CompareOp,
    pub value: SqlParam,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryIntent {
    pub target: String,
    pub aggregation: Aggregation,
    pub conditions: Vec<Condition>,
    pub period: Option<RelativePeriod>,
    /// Always computed from `period` against today, never carried over
    pub window: Option<TimeWindow>,
    /// Remarks for the answer (ignored period, inherited context)
    pub notes: Vec<String>,
}

impl QueryIntent {
    /// Snapshot stored in conversational memory.
    pub fn extracted(&self, scope: Option<&ScopeContext>) -> ExtractedEntities {
        ExtractedEntities {
            tool: Some(crate::classifier::Tool::StructuredQuery),
            target: Some(self.target.clone()),
            aggregation: Some(self.aggregation.clone()),
            synonyms: self.conditions.iter().map(|c| c.phrase.clone()).collect(),
            period: self.period,
            scope: scope.cloned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IntentError {
    /// Mention matching several catalog elements
    Ambiguous(Vec<CandidateMatch>),
    /// Name-like words the catalog does not know
    UnknownTerm(Vec<String>),
    NotUnderstood,
}

impl IntentError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            IntentError::Ambiguous(_) => ErrorCategory::AmbiguousTerm,
            IntentError::UnknownTerm(_) => ErrorCategory::UnknownTerm,
            IntentError::NotUnderstood => ErrorCategory::NotUnderstood,
        }
    }
}

pub struct IntentExtractor<'a> {
    catalog: &'a Catalog,
    ambiguity_margin: f64,
}

impl<'a> IntentExtractor<'a> {
    pub fn new(catalog: &'a Catalog, ambiguity_margin: f64) -> Self {
        Self {
            catalog,
            ambiguity_margin,
        }
    }

    /// Extract the query intent of a structured-query turn.
    ///
    /// `preferred` lists canonical elements chosen in a clarification; they
    /// settle an ambiguous mention instead of asking again.
    pub fn extract(
        &self,
        utterance: &str,
        scan: &ScanResult,
        scope: Option<&ScopeContext>,
        history: &[ConversationTurn],
        anaphoric: bool,
        preferred: &[String],
        today: NaiveDate,
    ) -> Result<QueryIntent, IntentError> {
        let unknown = scan.unresolved_names();
        if !unknown.is_empty() {
            return Err(IntentError::UnknownTerm(unknown));
        }

        let mut relations: Vec<String> = Vec::new();
        let mut columns: Vec<(String, String)> = Vec::new();
        let mut synonyms: Vec<usize> = Vec::new();

        for mention in scan.catalog_mentions() {
            let chosen = match mention.resolution(self.ambiguity_margin) {
                Resolution::Unique(c) => c,
                Resolution::Ambiguous(candidates) => {
                    match candidates.iter().find(|c| preferred.contains(&c.canonical)) {
                        Some(c) => c.clone(),
                        None => return Err(IntentError::Ambiguous(candidates)),
                    }
                }
                Resolution::Unknown => continue,
            };
            match chosen.target {
                Some(AliasTarget::Table { name }) | Some(AliasTarget::View { name }) => {
                    relations.push(name)
                }
                Some(AliasTarget::Column { table, column }) => columns.push((table, column)),
                Some(AliasTarget::Synonym { index }) => synonyms.push(index),
                None => {}
            }
        }

        let scope_table = scope
            .and_then(|s| self.catalog.entity_type(&s.entity_type))
            .map(|et| et.table.clone());

        let stated_target = synonyms
            .first()
            .and_then(|i| self.catalog.synonyms.get(*i))
            .map(|s| s.table.clone())
            .or_else(|| {
                relations
                    .iter()
                    .find(|r| Some(*r) != scope_table.as_ref())
                    .cloned()
            })
            .or_else(|| relations.first().cloned())
            .or_else(|| columns.first().map(|(t, _)| t.clone()));

        let text = fold(utterance);
        let stated_aggregation = detect_aggregation(&text);

        let inherited = if anaphoric {
            last_structured_turn(history).map(|t| t.extracted_entities.revalidated(self.catalog))
        } else {
            None
        };

        let mut notes = Vec::new();
        let target = match (stated_target, &inherited) {
            (Some(t), _) => t,
            (None, Some(previous)) => match &previous.target {
                Some(t) => {
                    notes.push("suite de la question précédente".to_string());
                    t.clone()
                }
                None => return Err(IntentError::NotUnderstood),
            },
            (None, None) => return Err(IntentError::NotUnderstood),
        };

        let queryable = self
            .catalog
            .queryable(&target)
            .ok_or(IntentError::NotUnderstood)?;

        let same_target = |p: &ExtractedEntities| p.target.as_deref() == Some(target.as_str());

        let aggregation = match stated_aggregation {
            Some(kind) => self.measure(kind, queryable, &columns)?,
            None => match inherited.as_ref().filter(|p| same_target(p)).and_then(|p| p.aggregation.clone()) {
                Some(previous) => previous,
                None if !columns.is_empty() && anaphoric => {
                    self.measure(AggregationKind::Sum, queryable, &columns)?
                }
                None => Aggregation::List,
            },
        };

        let mut conditions = Vec::new();
        for index in &synonyms {
            let Some(s) = self.catalog.synonyms.get(*index) else {
                continue;
            };
            if s.table != target {
                return Err(IntentError::NotUnderstood);
            }
            conditions.push(Condition {
                phrase: fold(&s.phrase),
                table: s.table.clone(),
                column: s.column.clone(),
                op: s.op,
                value: s.value.clone(),
            });
        }
        if conditions.is_empty() {
            if let Some(previous) = inherited.as_ref().filter(|p| same_target(p)) {
                for phrase in &previous.synonyms {
                    let synonym = self
                        .catalog
                        .synonyms
                        .iter()
                        .find(|s| fold(&s.phrase) == *phrase && s.table == target);
                    if let Some(s) = synonym {
                        conditions.push(Condition {
                            phrase: phrase.clone(),
                            table: s.table.clone(),
                            column: s.column.clone(),
                            op: s.op,
                            value: s.value.clone(),
                        });
                    }
                }
            }
        }

        let mut period = RelativePeriod::detect(utterance);
        if period.is_none() {
            period = inherited.as_ref().and_then(|p| p.period);
        }
        if period.is_some() && queryable.time_column().is_none() {
            notes.push(format!(
                "période ignorée : {} n'a pas de date de référence",
                queryable.label()
            ));
            period = None;
        }
        let window = period.map(|p| p.resolve(today));

        Ok(QueryIntent {
            target,
            aggregation,
            conditions,
            period,
            window,
            notes,
        })
    }

    fn measure(
        &self,
        kind: AggregationKind,
        queryable: Queryable<'_>,
        columns: &[(String, String)],
    ) -> Result<Aggregation, IntentError> {
        let column = || {
            columns
                .iter()
                .filter(|(t, _)| t == queryable.name())
                .map(|(_, c)| c.as_str())
                .find(|c| {
                    queryable
                        .column(c)
                        .map(|info| info.data_type.is_numeric())
                        .unwrap_or(false)
                })
                .or_else(|| queryable.default_measure())
                .map(str::to_string)
                .ok_or(IntentError::NotUnderstood)
        };
        Ok(match kind {
            AggregationKind::Count => Aggregation::Count,
            AggregationKind::List => Aggregation::List,
            AggregationKind::Sum => Aggregation::Sum { column: column()? },
            AggregationKind::Average => Aggregation::Average { column: column()? },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AggregationKind {
    Count,
    Sum,
    Average,
    List,
}

fn detect_aggregation(folded: &str) -> Option<AggregationKind> {
    if AVG_WORDS.is_match(folded) {
        Some(AggregationKind::Average)
    } else if SUM_WORDS.is_match(folded) {
        Some(AggregationKind::Sum)
    } else if COUNT_WORDS.is_match(folded) {
        Some(AggregationKind::Count)
    } else if LIST_WORDS.is_match(folded) {
        Some(AggregationKind::List)
    } else {
        None
    }
}
