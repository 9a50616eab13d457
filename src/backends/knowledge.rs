use crate::backends::{keywords, overlap};
use crate::collaborators::{KbPassage, KnowledgeBase};
use crate::error::{Result, RouterError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

const DEFAULT_ARTICLES: &str = include_str!("../../data/knowledge_base.json");
const MAX_PASSAGES: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KbArticle {
    pub id: String,
    pub title: String,
    pub text: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Help articles ranked by keyword overlap with the question
#[derive(Debug, Clone)]
pub struct JsonKnowledgeBase {
    articles: Vec<(KbArticle, Vec<String>)>,
}

impl JsonKnowledgeBase {
    pub fn embedded() -> Result<Self> {
        Self::parse(DEFAULT_ARTICLES)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RouterError::Collaborator(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let articles: Vec<KbArticle> = serde_json::from_str(content)?;
        Ok(Self::new(articles))
    }

    pub fn new(articles: Vec<KbArticle>) -> Self {
        let articles = articles
            .into_iter()
            .map(|a| {
                let words = keywords(&format!("{} {} {}", a.title, a.tags.join(" "), a.text));
                (a, words)
            })
            .collect();
        Self { articles }
    }

    pub fn len(&self) -> usize {
        self.articles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.articles.is_empty()
    }

    /// Best passages for `utterance`; titles and tags weigh double.
    pub fn rank(&self, utterance: &str) -> Vec<KbPassage> {
        let query = keywords(utterance);
        let mut passages: Vec<KbPassage> = self
            .articles
            .iter()
            .filter_map(|(article, words)| {
                let headline = keywords(&format!("{} {}", article.title, article.tags.join(" ")));
                let score = (overlap(&query, words) + overlap(&query, &headline)) / 2.0;
                (score > 0.0).then(|| KbPassage {
                    source: format!("kb/{}", article.id),
                    title: article.title.clone(),
                    text: article.text.clone(),
                    score,
                })
            })
            .collect();
        passages.sort_by(|a, b| b.score.total_cmp(&a.score));
        passages.truncate(MAX_PASSAGES);
        debug!("Knowledge base returned {} passages", passages.len());
        passages
    }
}

#[async_trait]
impl KnowledgeBase for JsonKnowledgeBase {
    async fn retrieve(&self, utterance: &str) -> Result<Vec<KbPassage>> {
        Ok(self.rank(utterance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_articles_parse() {
        let kb = JsonKnowledgeBase::embedded().unwrap();
        assert!(kb.len() >= 5);
    }

    #[tokio::test]
    async fn test_receipt_question_finds_receipt_article() {
        let kb = JsonKnowledgeBase::embedded().unwrap();
        let passages = kb.retrieve("Comment générer une quittance ?").await.unwrap();
        assert!(!passages.is_empty());
        assert_eq!(passages[0].source, "kb/quittance");
        assert!(passages.len() <= MAX_PASSAGES);
    }

    #[test]
    fn test_unrelated_question_finds_nothing() {
        let kb = JsonKnowledgeBase::embedded().unwrap();
        assert!(kb.rank("zzz qqq").is_empty());
    }
}
