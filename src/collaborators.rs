//! Collaborator contracts
//!
//! The router only talks to the outside world through these traits. Query
//! execution accepts nothing but a [`ValidatedQuery`], which only the
//! validator can construct.

use crate::error::Result;
use crate::scope::ScopeContext;
use crate::sql_validator::ValidatedQuery;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Rows returned by the read-only execution service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    /// Set when the backend stopped at the row budget
    #[serde(default)]
    pub truncated: bool,
}

impl QueryRows {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Single value of a one-row, one-column aggregate result.
    pub fn scalar(&self) -> Option<&serde_json::Value> {
        match (self.rows.len(), self.rows.first()) {
            (1, Some(row)) if row.len() == 1 => row.first(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSummary {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KbPassage {
    /// Source identifier, e.g. "kb/quittance"
    pub source: String,
    pub title: String,
    pub text: String,
    #[serde(default)]
    pub score: f64,
}

/// Read-only execution service
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, query: &ValidatedQuery) -> Result<QueryRows>;
}

/// Document/OCR search service
#[async_trait]
pub trait DocumentSearch: Send + Sync {
    async fn search(&self, utterance: &str, scope: Option<&ScopeContext>) -> Result<Vec<DocumentSummary>>;
}

/// Knowledge-base retrieval service
#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    async fn retrieve(&self, utterance: &str) -> Result<Vec<KbPassage>>;
}
