//! Clarification Engine
//!
//! Builds at most three ranked options when the router cannot decide. Picking
//! an option re-enters the router with the choice treated as explicitly
//! stated; a second unresolved ambiguity on the same turn is not clarified again.

use crate::catalog::Catalog;
use crate::classifier::{Tool, ToolScore};
use crate::config::MAX_CLARIFICATION_OPTIONS;
use crate::resolver::{CandidateMatch, MatchKind};
use crate::scope::ScopeContext;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Choice {
    Tool { tool: Tool },
    Entity { scope: ScopeContext },
    /// Canonical catalog element ("leases", "leases.rent_amount", "synonym:baux actifs")
    Term { canonical: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClarificationOption {
    pub id: String,
    pub label: String,
    pub description: String,
    pub score: f64,
    pub choice: Choice,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClarificationQuestion {
    pub question: String,
    pub options: Vec<ClarificationOption>,
}

/// Sent back by the caller with the original utterance and the picked option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClarificationReply {
    pub original_utterance: String,
    pub choice: Choice,
}

/// What a reply settles for the re-entered turn
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Hints {
    pub tool: Option<Tool>,
    pub scope: Option<ScopeContext>,
    pub terms: Vec<String>,
}

impl From<&Choice> for Hints {
    fn from(choice: &Choice) -> Self {
        match choice {
            Choice::Tool { tool } => Hints {
                tool: Some(*tool),
                ..Hints::default()
            },
            Choice::Entity { scope } => Hints {
                scope: Some(scope.clone()),
                ..Hints::default()
            },
            Choice::Term { canonical } => Hints {
                terms: vec![canonical.clone()],
                ..Hints::default()
            },
        }
    }
}

/// Rank, de-duplicate and cap. Ids are 1-based positions.
pub fn build_clarification(mut options: Vec<ClarificationOption>, limit: usize) -> Vec<ClarificationOption> {
    options.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut out: Vec<ClarificationOption> = Vec::new();
    for option in options {
        if !out.iter().any(|o| o.choice == option.choice) {
            out.push(option);
        }
    }
    out.truncate(limit.min(MAX_CLARIFICATION_OPTIONS));
    for (i, option) in out.iter_mut().enumerate() {
        option.id = (i + 1).to_string();
    }
    out
}

/// Options for an ambiguous or weak resolver match.
pub fn from_candidates(catalog: &Catalog, candidates: &[CandidateMatch]) -> Vec<ClarificationOption> {
    candidates
        .iter()
        .filter_map(|c| {
            let (label, description, choice) = match (&c.kind, &c.entity) {
                (MatchKind::EntityValue, Some(e)) => {
                    let type_label = catalog
                        .entity_type(&e.entity_type)
                        .and_then(|et| catalog.queryable(&et.table))
                        .map(|q| q.label().to_string())
                        .unwrap_or_else(|| e.entity_type.clone());
                    (
                        e.label.clone(),
                        format!("{} n°{}", type_label, e.id),
                        Choice::Entity {
                            scope: ScopeContext::new(e.entity_type.clone(), e.id),
                        },
                    )
                }
                (MatchKind::EntityValue, None) => return None,
                (_, _) => (
                    term_label(catalog, &c.canonical),
                    c.canonical.clone(),
                    Choice::Term {
                        canonical: c.canonical.clone(),
                    },
                ),
            };
            Some(ClarificationOption {
                id: String::new(),
                label,
                description,
                score: c.score,
                choice,
            })
        })
        .collect()
}

/// Options for a low-confidence or tied classification.
pub fn from_tools(ranked: &[ToolScore]) -> Vec<ClarificationOption> {
    ranked
        .iter()
        .filter(|s| s.tool != Tool::Clarification)
        .map(|s| ClarificationOption {
            id: String::new(),
            label: s.tool.label().to_string(),
            description: format!("confiance {:.0} %", s.score * 100.0),
            score: s.score,
            choice: Choice::Tool { tool: s.tool },
        })
        .collect()
}

fn term_label(catalog: &Catalog, canonical: &str) -> String {
    if let Some(phrase) = canonical.strip_prefix("synonym:") {
        return phrase.to_string();
    }
    match canonical.split_once('.') {
        Some((table, column)) => catalog
            .queryable(table)
            .and_then(|q| q.column(column).map(|c| (q, c)))
            .map(|(q, c)| {
                format!(
                    "{} ({})",
                    c.alias.clone().unwrap_or_else(|| c.name.clone()),
                    q.label()
                )
            })
            .unwrap_or_else(|| canonical.to_string()),
        None => catalog
            .queryable(canonical)
            .map(|q| q.label().to_string())
            .unwrap_or_else(|| canonical.to_string()),
    }
}

pub fn entity_question() -> String {
    "Plusieurs éléments correspondent. Lequel voulez-vous dire ?".to_string()
}

pub fn weak_entity_question(label: &str) -> String {
    format!("Vouliez-vous dire {} ?", label)
}

pub fn tool_question() -> String {
    "Je ne suis pas sûr de comprendre votre demande. Que souhaitez-vous faire ?".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::fixtures;
    use crate::config::RouterConfig;
    use crate::resolver::TermResolver;

    fn option(score: f64, tool: Tool) -> ClarificationOption {
        ClarificationOption {
            id: String::new(),
            label: tool.label().to_string(),
            description: String::new(),
            score,
            choice: Choice::Tool { tool },
        }
    }

    #[test]
    fn test_options_are_capped_and_ranked() {
        let options = vec![
            option(0.2, Tool::KnowledgeBase),
            option(0.5, Tool::StructuredQuery),
            option(0.4, Tool::DocumentSearch),
            option(0.3, Tool::Clarification),
            option(0.1, Tool::StructuredQuery),
        ];
        let built = build_clarification(options, 10);
        assert_eq!(built.len(), 3);
        assert_eq!(built[0].choice, Choice::Tool { tool: Tool::StructuredQuery });
        assert_eq!(built[0].id, "1");
        assert_eq!(built[2].id, "3");
        assert!(built.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn test_homonym_options() {
        let catalog = fixtures::catalog();
        let candidates = TermResolver::new(&catalog, &RouterConfig::default()).resolve("Martin");
        let options = build_clarification(from_candidates(&catalog, &candidates), 3);
        let labels: Vec<&str> = options.iter().map(|o| o.label.as_str()).collect();
        assert_eq!(labels, vec!["Paul Martin", "Julie Martin"]);
        assert_eq!(options[1].description, "locataires n°3");
        assert_eq!(
            options[1].choice,
            Choice::Entity { scope: ScopeContext::new("tenant", 3) }
        );
    }

    #[test]
    fn test_term_labels() {
        let catalog = fixtures::catalog();
        assert_eq!(term_label(&catalog, "leases"), "baux");
        assert_eq!(term_label(&catalog, "leases.rent_amount"), "loyer (baux)");
        assert_eq!(term_label(&catalog, "synonym:baux actifs"), "baux actifs");
    }

    #[test]
    fn test_reply_hints() {
        let hints = Hints::from(&Choice::Entity { scope: ScopeContext::new("tenant", 2) });
        assert_eq!(hints.scope, Some(ScopeContext::new("tenant", 2)));
        assert!(hints.tool.is_none());

        let json = r#"{ "originalUtterance": "Baux de Martin", "choice": { "kind": "entity", "scope": { "entityType": "tenant", "entityId": 2 } } }"#;
        let reply: ClarificationReply = serde_json::from_str(json).unwrap();
        assert_eq!(reply.choice, Choice::Entity { scope: ScopeContext::new("tenant", 2) });
    }
}
