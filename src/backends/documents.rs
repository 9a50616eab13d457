use crate::backends::{keywords, overlap};
use crate::collaborators::{DocumentSearch, DocumentSummary};
use crate::error::{Result, RouterError};
use crate::scope::ScopeContext;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

const DEFAULT_DOCUMENTS: &str = include_str!("../../data/documents.json");
const MAX_DOCUMENTS: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub date: Option<String>,
    /// entity type -> id the document is attached to
    #[serde(default)]
    pub entities: BTreeMap<String, i64>,
}

/// Document summaries from a JSON index, filtered by scope then ranked by keywords
#[derive(Debug, Clone)]
pub struct JsonDocumentIndex {
    documents: Vec<(DocumentRecord, Vec<String>)>,
}

impl JsonDocumentIndex {
    pub fn embedded() -> Result<Self> {
        Self::parse(DEFAULT_DOCUMENTS)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RouterError::Collaborator(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let records: Vec<DocumentRecord> = serde_json::from_str(content)?;
        Ok(Self::new(records))
    }

    pub fn new(records: Vec<DocumentRecord>) -> Self {
        let documents = records
            .into_iter()
            .map(|d| {
                let words = keywords(&format!(
                    "{} {} {} {}",
                    d.title,
                    d.kind,
                    d.summary,
                    d.date.as_deref().map(month_words).unwrap_or_default()
                ));
                (d, words)
            })
            .collect();
        Self { documents }
    }

    pub fn find(&self, utterance: &str, scope: Option<&ScopeContext>) -> Vec<DocumentSummary> {
        let query = keywords(utterance);
        let mut found: Vec<DocumentSummary> = self
            .documents
            .iter()
            .filter(|(d, _)| match scope {
                Some(s) => d.entities.get(&s.entity_type) == Some(&s.entity_id),
                None => true,
            })
            .filter_map(|(d, words)| {
                let score = overlap(&query, words);
                (score > 0.0).then(|| DocumentSummary {
                    id: d.id.clone(),
                    title: d.title.clone(),
                    summary: d.summary.clone(),
                    date: d.date.clone(),
                    score,
                })
            })
            .collect();
        found.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| b.date.cmp(&a.date)));
        found.truncate(MAX_DOCUMENTS);
        found
    }
}

/// "2026-09-14" -> "2026 septembre september", so month names in a question can match.
fn month_words(date: &str) -> String {
    const MONTHS: [(&str, &str); 12] = [
        ("janvier", "january"),
        ("fevrier", "february"),
        ("mars", "march"),
        ("avril", "april"),
        ("mai", "may"),
        ("juin", "june"),
        ("juillet", "july"),
        ("aout", "august"),
        ("septembre", "september"),
        ("octobre", "october"),
        ("novembre", "november"),
        ("decembre", "december"),
    ];
    let mut parts = date.split('-');
    let year = parts.next().unwrap_or_default();
    let month = parts
        .next()
        .and_then(|m| m.parse::<usize>().ok())
        .and_then(|m| m.checked_sub(1))
        .and_then(|i| MONTHS.get(i));
    match month {
        Some((fr, en)) => format!("{} {} {}", year, fr, en),
        None => year.to_string(),
    }
}

#[async_trait]
impl DocumentSearch for JsonDocumentIndex {
    async fn search(&self, utterance: &str, scope: Option<&ScopeContext>) -> Result<Vec<DocumentSummary>> {
        Ok(self.find(utterance, scope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_month_words() {
        assert_eq!(month_words("2026-09-14"), "2026 septembre september");
        assert_eq!(month_words("2026"), "2026");
    }

    #[test]
    fn test_scope_narrows_documents() {
        let index = JsonDocumentIndex::embedded().unwrap();
        let all = index.find("facture de septembre", None);
        let scoped = index.find("facture de septembre", Some(&ScopeContext::new("property", 2)));
        assert!(!all.is_empty());
        assert!(scoped.len() <= all.len());
        assert!(scoped.iter().all(|d| all.iter().any(|a| a.id == d.id)));
        assert!(scoped.iter().all(|d| d.id != "doc-001"));
    }

    #[tokio::test]
    async fn test_search_ranks_by_overlap() {
        let index = JsonDocumentIndex::embedded().unwrap();
        let found = index.search("facture plombier septembre", None).await.unwrap();
        assert_eq!(found[0].id, "doc-001");
    }
}
