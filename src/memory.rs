//! Conversational Memory
//!
//! Bounded per-session history of typed turns. History is advisory: anything
//! taken from it is re-validated against the current catalog before reuse.

use crate::catalog::{AliasTarget, Catalog};
use crate::classifier::Tool;
use crate::fuzzy_matcher::fold;
use crate::intent::Aggregation;
use crate::scope::ScopeContext;
use crate::time::RelativePeriod;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

lazy_static! {
    static ref CONTINUATION: Regex = Regex::new(
        r"^(?:et|and|what about|how about|pareil|idem|meme chose|meme question|aussi|sinon)\b"
    )
    .unwrap();
    static ref BACK_REFERENCE: Regex = Regex::new(
        r"\b(?:ce bien|ce locataire|ce bail|cette location|celui ci|celle ci|ceux ci|ce dernier|cette derniere|le meme|la meme|les memes|this one|that one|the same)\b"
    )
    .unwrap();
}

/// Does the utterance continue the previous question rather than start a new one?
pub fn is_anaphoric_continuation(utterance: &str) -> bool {
    let text = fold(utterance);
    CONTINUATION.is_match(&text) || BACK_REFERENCE.is_match(&text)
}

/// Structured snapshot of what a turn was about. Periods are kept as
/// expressions, never as resolved windows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedEntities {
    #[serde(default)]
    pub tool: Option<Tool>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub aggregation: Option<Aggregation>,
    /// Folded synonym phrases applied as conditions
    #[serde(default)]
    pub synonyms: Vec<String>,
    #[serde(default)]
    pub period: Option<RelativePeriod>,
    #[serde(default)]
    pub scope: Option<ScopeContext>,
}

impl ExtractedEntities {
    /// Keep only what still exists in `catalog`.
    pub fn revalidated(&self, catalog: &Catalog) -> ExtractedEntities {
        let target = self
            .target
            .clone()
            .filter(|t| catalog.is_whitelisted(t));

        let aggregation = match (&target, &self.aggregation) {
            (Some(t), Some(agg)) => agg
                .column()
                .map_or(true, |c| catalog.has_column(t, c))
                .then(|| agg.clone()),
            _ => None,
        };

        let synonyms = self
            .synonyms
            .iter()
            .filter(|s| {
                catalog
                    .alias_targets(s)
                    .iter()
                    .any(|a| matches!(a, AliasTarget::Synonym { .. }))
            })
            .cloned()
            .collect();

        let scope = self
            .scope
            .clone()
            .filter(|s| catalog.entity(&s.entity_type, s.entity_id).is_some());

        ExtractedEntities {
            tool: self.tool,
            target,
            aggregation,
            synonyms,
            period: self.period,
            scope,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationTurn {
    pub question: String,
    pub answer: String,
    #[serde(default)]
    pub extracted_entities: ExtractedEntities,
    pub asked_at: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(question: impl Into<String>, answer: impl Into<String>, extracted: ExtractedEntities) -> Self {
        Self {
            question: question.into(),
            answer: answer.into(),
            extracted_entities: extracted,
            asked_at: Utc::now(),
        }
    }
}

/// Ring buffer of the last `capacity` turns
#[derive(Debug, Clone)]
pub struct ConversationMemory {
    turns: VecDeque<ConversationTurn>,
    capacity: usize,
}

impl ConversationMemory {
    pub fn new(capacity: usize) -> Self {
        Self {
            turns: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    /// Build from caller-supplied history, keeping only the most recent turns.
    pub fn from_history(history: &[ConversationTurn], capacity: usize) -> Self {
        let mut memory = Self::new(capacity);
        for turn in history {
            memory.append_turn(turn.clone());
        }
        memory
    }

    pub fn append_turn(&mut self, turn: ConversationTurn) {
        while self.turns.len() >= self.capacity {
            self.turns.pop_front();
        }
        self.turns.push_back(turn);
    }

    /// Up to `n` most recent turns, oldest first.
    pub fn recent_turns(&self, n: usize) -> Vec<ConversationTurn> {
        let skip = self.turns.len().saturating_sub(n);
        self.turns.iter().skip(skip).cloned().collect()
    }

    pub fn last_turn(&self) -> Option<&ConversationTurn> {
        self.turns.back()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Most recent turn in `history` that carried a structured target.
pub fn last_structured_turn(history: &[ConversationTurn]) -> Option<&ConversationTurn> {
    history
        .iter()
        .rev()
        .find(|t| t.extracted_entities.target.is_some())
}

struct Session {
    memory: Mutex<ConversationMemory>,
    last_used: AtomicU64,
}

/// Per-session memories. Each session sits behind its own mutex, so appends
/// within one session are serialized even if the host runs turns concurrently.
/// At most `max_sessions` are kept; the least recently used one goes first.
/// Reads never create a session.
pub struct SessionStore {
    sessions: DashMap<String, Arc<Session>>,
    capacity: usize,
    max_sessions: usize,
    tick: AtomicU64,
}

impl SessionStore {
    pub fn new(capacity: usize, max_sessions: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            capacity,
            max_sessions: max_sessions.max(1),
            tick: AtomicU64::new(0),
        }
    }

    fn touch(&self, session: &Session) {
        let now = self.tick.fetch_add(1, Ordering::Relaxed) + 1;
        session.last_used.store(now, Ordering::Relaxed);
    }

    pub fn recent_turns(&self, session_id: &str, n: usize) -> Vec<ConversationTurn> {
        let Some(session) = self.sessions.get(session_id).map(|s| s.value().clone()) else {
            return Vec::new();
        };
        self.touch(&session);
        let memory = session.memory.lock().unwrap_or_else(|e| e.into_inner());
        memory.recent_turns(n)
    }

    pub fn append_turn(&self, session_id: &str, turn: ConversationTurn) {
        let session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                Arc::new(Session {
                    memory: Mutex::new(ConversationMemory::new(self.capacity)),
                    last_used: AtomicU64::new(0),
                })
            })
            .value()
            .clone();
        self.touch(&session);
        session
            .memory
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .append_turn(turn);
        self.evict_idle();
    }

    fn evict_idle(&self) {
        while self.sessions.len() > self.max_sessions {
            let oldest = self
                .sessions
                .iter()
                .min_by_key(|e| e.value().last_used.load(Ordering::Relaxed))
                .map(|e| e.key().clone());
            match oldest {
                Some(id) => {
                    debug!("Evicting idle session {}", id);
                    self.sessions.remove(&id);
                }
                None => break,
            }
        }
    }

    pub fn clear(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::fixtures;

    fn turn(q: &str) -> ConversationTurn {
        ConversationTurn::new(q, "ok", ExtractedEntities::default())
    }

    #[test]
    fn test_buffer_is_bounded() {
        let mut memory = ConversationMemory::new(5);
        for i in 0..8 {
            memory.append_turn(turn(&format!("q{}", i)));
        }
        assert_eq!(memory.len(), 5);
        let recent: Vec<String> = memory.recent_turns(2).into_iter().map(|t| t.question).collect();
        assert_eq!(recent, vec!["q6", "q7"]);
        assert_eq!(memory.recent_turns(10).len(), 5);
    }

    #[test]
    fn test_anaphora_detection() {
        assert!(is_anaphoric_continuation("Et le mois dernier ?"));
        assert!(is_anaphoric_continuation("and last month?"));
        assert!(is_anaphoric_continuation("Combien de paiements pour ce bien ?"));
        assert!(!is_anaphoric_continuation("Combien de baux actifs ?"));
        assert!(!is_anaphoric_continuation("Etat locatif des Tilleuls"));
    }

    #[test]
    fn test_revalidation_drops_stale_references() {
        let catalog = fixtures::catalog();
        let stale = ExtractedEntities {
            tool: Some(Tool::StructuredQuery),
            target: Some("users".to_string()),
            aggregation: Some(Aggregation::Count),
            synonyms: vec!["baux actifs".to_string(), "baux fantomes".to_string()],
            period: Some(RelativePeriod::ThisMonth),
            scope: Some(ScopeContext::new("tenant", 999)),
        };
        let fresh = stale.revalidated(&catalog);
        assert_eq!(fresh.target, None);
        assert_eq!(fresh.aggregation, None);
        assert_eq!(fresh.synonyms, vec!["baux actifs".to_string()]);
        assert_eq!(fresh.scope, None);
        assert_eq!(fresh.period, Some(RelativePeriod::ThisMonth));
    }

    #[test]
    fn test_last_structured_turn_skips_clarifications() {
        let mut structured = turn("Combien de baux ?");
        structured.extracted_entities.target = Some("leases".to_string());
        let history = vec![structured, turn("?")];
        assert_eq!(last_structured_turn(&history).unwrap().question, "Combien de baux ?");
    }

    #[test]
    fn test_sessions_are_isolated() {
        let store = SessionStore::new(5, 10);
        store.append_turn("a", turn("q1"));
        store.append_turn("b", turn("q2"));
        store.append_turn("a", turn("q3"));
        assert_eq!(store.recent_turns("a", 5).len(), 2);
        assert_eq!(store.recent_turns("b", 5).len(), 1);
        store.clear("a");
        assert!(store.recent_turns("a", 5).is_empty());
    }

    #[test]
    fn test_concurrent_appends_are_serialized() {
        let store = Arc::new(SessionStore::new(1000, 10));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let s = store.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        s.append_turn("shared", turn(&format!("{}-{}", t, i)));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.recent_turns("shared", 1000).len(), 400);
    }

    #[test]
    fn test_reads_do_not_create_sessions() {
        let store = SessionStore::new(5, 10);
        for i in 0..100 {
            assert!(store.recent_turns(&format!("visitor-{}", i), 5).is_empty());
        }
        assert!(store.is_empty());
    }

    #[test]
    fn test_least_recently_used_session_is_evicted() {
        let store = SessionStore::new(5, 2);
        store.append_turn("a", turn("q1"));
        store.append_turn("b", turn("q2"));
        // "a" is read again, so "b" becomes the idle one
        assert_eq!(store.recent_turns("a", 5).len(), 1);
        store.append_turn("c", turn("q3"));

        assert_eq!(store.len(), 2);
        assert!(store.recent_turns("b", 5).is_empty());
        assert_eq!(store.recent_turns("a", 5).len(), 1);
        assert_eq!(store.recent_turns("c", 5).len(), 1);
    }
}
