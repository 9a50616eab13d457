//! Intent & Tool Classifier
//!
//! Rule families from a swappable pattern table produce a score per tool,
//! then context signals are added. The engine sits behind the [`Classifier`]
//! trait so a statistical model can replace it without touching the router.

use crate::error::{ErrorCategory, Result, RouterError};
use crate::fuzzy_matcher::fold;
use crate::memory::{is_anaphoric_continuation, ConversationTurn};
use crate::resolver::ScanResult;
use crate::scope::ScopeContext;
use crate::time::RelativePeriod;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

const DEFAULT_PATTERNS: &str = include_str!("../data/intent_patterns.json");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tool {
    StructuredQuery,
    DocumentSearch,
    KnowledgeBase,
    Clarification,
}

impl Tool {
    /// French label shown in clarification options
    pub fn label(&self) -> &'static str {
        match self {
            Tool::StructuredQuery => "Interroger les données (baux, biens, paiements)",
            Tool::DocumentSearch => "Rechercher un document",
            Tool::KnowledgeBase => "Consulter l'aide",
            Tool::Clarification => "Préciser la question",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ToolScore {
    pub tool: Tool,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    /// `Clarification` when no tool is confidently ahead
    pub tool: Tool,
    pub confidence: f64,
    /// Every capability, best first
    pub ranked: Vec<ToolScore>,
    /// `LowConfidence` or `ClassifierTie` when `tool` is `Clarification`
    pub reason: Option<ErrorCategory>,
    /// Set when a destructive verb targets domain data; the turn must be rejected
    pub destructive: bool,
}

pub trait Classifier: Send + Sync {
    fn classify(
        &self,
        utterance: &str,
        scan: &ScanResult,
        scope: Option<&ScopeContext>,
        history: &[ConversationTurn],
    ) -> Classification;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternFamily {
    pub name: String,
    pub tool: Tool,
    pub weight: f64,
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalWeights {
    pub table_mention: f64,
    pub document_signal: f64,
    pub entity_or_scope: f64,
    pub continuation: f64,
}

/// Versioned rule data, kept out of control flow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternTable {
    pub version: String,
    pub families: Vec<PatternFamily>,
    #[serde(default)]
    pub search_verbs: Vec<String>,
    #[serde(default)]
    pub date_markers: Vec<String>,
    pub destructive_verbs: Vec<String>,
    pub weights: SignalWeights,
}

impl PatternTable {
    pub fn embedded() -> Result<Self> {
        Self::parse(DEFAULT_PATTERNS)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let table: PatternTable = serde_json::from_str(content)?;
        if table.destructive_verbs.is_empty() {
            return Err(RouterError::Config(
                "Pattern table has no destructive-verb patterns".to_string(),
            ));
        }
        Ok(table)
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p).map_err(|e| RouterError::Config(format!("Bad pattern '{}': {}", p, e)))
        })
        .collect()
}

struct CompiledFamily {
    name: String,
    tool: Tool,
    weight: f64,
    patterns: Vec<Regex>,
}

/// Rule engine over a [`PatternTable`]
pub struct RuleClassifier {
    version: String,
    families: Vec<CompiledFamily>,
    search_verbs: Vec<Regex>,
    date_markers: Vec<Regex>,
    destructive: Vec<Regex>,
    weights: SignalWeights,
    min_confidence: f64,
    tie_margin: f64,
}

impl RuleClassifier {
    pub fn new(table: PatternTable, min_confidence: f64, tie_margin: f64) -> Result<Self> {
        let families = table
            .families
            .iter()
            .map(|f| {
                Ok(CompiledFamily {
                    name: f.name.clone(),
                    tool: f.tool,
                    weight: f.weight,
                    patterns: compile(&f.patterns)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            version: table.version,
            families,
            search_verbs: compile(&table.search_verbs)?,
            date_markers: compile(&table.date_markers)?,
            destructive: compile(&table.destructive_verbs)?,
            weights: table.weights,
            min_confidence,
            tie_margin,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Destructive verb aimed at something the catalog knows about.
    pub fn is_destructive(&self, folded: &str, scan: &ScanResult) -> bool {
        !scan.mentions.is_empty() && self.destructive.iter().any(|re| re.is_match(folded))
    }

    fn any(patterns: &[Regex], text: &str) -> bool {
        patterns.iter().any(|re| re.is_match(text))
    }

    fn scores(
        &self,
        text: &str,
        utterance: &str,
        scan: &ScanResult,
        scope: Option<&ScopeContext>,
        history: &[ConversationTurn],
    ) -> Vec<ToolScore> {
        let mut structured = 0.0_f64;
        let mut documents = 0.0_f64;
        let mut knowledge = 0.0_f64;
        let mut document_noun = false;

        // Families: the strongest match per tool counts, not the sum.
        for family in &self.families {
            if !Self::any(&family.patterns, text) {
                continue;
            }
            debug!("Pattern family '{}' matched", family.name);
            let slot = match family.tool {
                Tool::StructuredQuery => &mut structured,
                Tool::DocumentSearch => {
                    document_noun = true;
                    &mut documents
                }
                Tool::KnowledgeBase => &mut knowledge,
                Tool::Clarification => continue,
            };
            *slot = slot.max(family.weight);
        }

        if scan.catalog_mentions().next().is_some() {
            structured += self.weights.table_mention;
        }
        if document_noun {
            let dated = RelativePeriod::detect(utterance).is_some()
                || Self::any(&self.date_markers, text);
            if dated || Self::any(&self.search_verbs, text) {
                documents += self.weights.document_signal;
            }
        }
        if scope.is_some() || scan.entity_mentions().next().is_some() {
            structured += self.weights.entity_or_scope;
            documents += self.weights.entity_or_scope;
        }
        if is_anaphoric_continuation(utterance) {
            let previous = history
                .iter()
                .rev()
                .filter_map(|t| t.extracted_entities.tool)
                .find(|t| *t != Tool::Clarification);
            match previous {
                Some(Tool::StructuredQuery) => structured += self.weights.continuation,
                Some(Tool::DocumentSearch) => documents += self.weights.continuation,
                Some(Tool::KnowledgeBase) => knowledge += self.weights.continuation,
                _ => {}
            }
        }

        let mut ranked = vec![
            ToolScore { tool: Tool::StructuredQuery, score: structured.min(1.0) },
            ToolScore { tool: Tool::DocumentSearch, score: documents.min(1.0) },
            ToolScore { tool: Tool::KnowledgeBase, score: knowledge.min(1.0) },
        ];
        // Stable sort keeps the declaration order on equal scores.
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        ranked
    }
}

impl Classifier for RuleClassifier {
    fn classify(
        &self,
        utterance: &str,
        scan: &ScanResult,
        scope: Option<&ScopeContext>,
        history: &[ConversationTurn],
    ) -> Classification {
        let text = fold(utterance);
        let ranked = self.scores(&text, utterance, scan, scope, history);
        let destructive = self.is_destructive(&text, scan);

        let best = ranked[0];
        let runner_up = ranked[1];

        let reason = if best.score < self.min_confidence {
            Some(ErrorCategory::LowConfidence)
        } else if best.score - runner_up.score < self.tie_margin {
            Some(ErrorCategory::ClassifierTie)
        } else {
            None
        };

        let tool = if reason.is_some() {
            Tool::Clarification
        } else {
            best.tool
        };

        debug!(
            "Classified as {:?} ({:.2}) with patterns v{}",
            tool, best.score, self.version
        );

        Classification {
            tool,
            confidence: best.score,
            ranked,
            reason,
            destructive,
        }
    }
}
