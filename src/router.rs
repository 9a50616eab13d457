//! Router / Orchestrator
//!
//! One request/response cycle:
//! `Received -> ScopeResolved -> Classified -> {Generating | Delegating | Clarifying} -> Completed | Rejected`.
//!
//! Every per-turn failure becomes a well-formed [`RouteResult`]; nothing is
//! thrown across this boundary. Dropping the future returned by
//! [`Router::route`] cancels any in-flight delegated work.

use crate::audit::{AuditKind, AuditLog};
use crate::catalog::{Catalog, CatalogHandle, SqlParam};
use crate::clarification::{
    build_clarification, entity_question, from_candidates, from_tools, tool_question,
    weak_entity_question, ClarificationOption, ClarificationReply, Hints,
};
use crate::classifier::{Classifier, PatternTable, RuleClassifier, Tool};
use crate::collaborators::{DocumentSearch, KnowledgeBase, QueryExecutor, QueryRows};
use crate::config::RouterConfig;
use crate::error::{ErrorCategory, Result};
use crate::intent::{Aggregation, IntentError, IntentExtractor, QueryIntent};
use crate::memory::{is_anaphoric_continuation, ConversationMemory, ConversationTurn, ExtractedEntities, SessionStore};
use crate::resolver::{CandidateMatch, ScanResult, TermResolver};
use crate::scope::{ResolvedScope, RouteContext, ScopeContext, ScopeDecision, ScopeOverride, ScopeResolver};
use crate::sql_generator::SqlGenerator;
use crate::sql_validator::{SqlValidator, ValidationError};
use crate::time::{Clock, SystemClock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRequest {
    pub utterance: String,
    #[serde(default)]
    pub context: RouteContext,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Caller-held history; takes precedence over the session store when non-empty
    #[serde(default)]
    pub history: Vec<ConversationTurn>,
    /// Answer to a clarification asked on the previous call
    #[serde(default)]
    pub clarification: Option<ClarificationReply>,
}

impl RouteRequest {
    pub fn new(utterance: impl Into<String>) -> Self {
        Self {
            utterance: utterance.into(),
            ..Self::default()
        }
    }

    /// Re-enter the router with a picked clarification option.
    pub fn reply(reply: ClarificationReply) -> Self {
        Self {
            utterance: reply.original_utterance.clone(),
            clarification: Some(reply),
            ..Self::default()
        }
    }

    pub fn with_context(mut self, context: RouteContext) -> Self {
        self.context = context;
        self
    }

    pub fn in_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_history(mut self, history: Vec<ConversationTurn>) -> Self {
        self.history = history;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RouteStage {
    Received,
    ScopeResolved,
    Classified,
    Generating,
    Delegating,
    Clarifying,
    Completed,
    Rejected,
}

/// The only externally visible output of a turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteResult {
    pub request_id: String,
    pub tool: Tool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(default)]
    pub params: Vec<SqlParam>,
    pub answer: String,
    #[serde(default)]
    pub sources: Vec<String>,
    pub duration_ms: u64,
    pub needs_clarification: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarification_options: Option<Vec<ClarificationOption>>,
    #[serde(default)]
    pub scope: Option<ScopeContext>,
    #[serde(default)]
    pub scope_override: Option<ScopeOverride>,
    #[serde(default)]
    pub error: Option<ErrorCategory>,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<QueryRows>,
    pub stages: Vec<RouteStage>,
}

impl RouteResult {
    fn received(request_id: String) -> Self {
        Self {
            request_id,
            tool: Tool::Clarification,
            sql: None,
            params: Vec::new(),
            answer: String::new(),
            sources: Vec::new(),
            duration_ms: 0,
            needs_clarification: false,
            clarification_options: None,
            scope: None,
            scope_override: None,
            error: None,
            retryable: false,
            rows: None,
            stages: vec![RouteStage::Received],
        }
    }

    pub fn final_stage(&self) -> Option<RouteStage> {
        self.stages.last().copied()
    }

    pub fn is_rejected(&self) -> bool {
        self.final_stage() == Some(RouteStage::Rejected)
    }

    fn enter(&mut self, stage: RouteStage) {
        self.stages.push(stage);
    }

    /// Terminal failure: a fixed category message and nothing internal.
    fn rejected(mut self, category: ErrorCategory) -> Self {
        self.error = Some(category);
        self.retryable = category.retryable();
        self.answer = category.user_message().to_string();
        self.sql = None;
        self.params.clear();
        self.rows = None;
        self.enter(RouteStage::Rejected);
        self
    }

    fn clarifying(mut self, question: String, options: Vec<ClarificationOption>, reason: ErrorCategory) -> Self {
        self.tool = Tool::Clarification;
        self.needs_clarification = true;
        self.answer = question;
        self.clarification_options = Some(options);
        self.error = Some(reason);
        self.enter(RouteStage::Clarifying);
        self
    }

    fn completed(mut self, answer: String, sources: Vec<String>) -> Self {
        self.answer = answer;
        self.sources = sources;
        self.enter(RouteStage::Completed);
        self
    }
}

/// Per-call state shared by the routing steps
struct Turn<'a> {
    catalog: &'a Catalog,
    utterance: &'a str,
    context: &'a RouteContext,
    history: &'a [ConversationTurn],
    anaphoric: bool,
    hints: Hints,
    reply_round: bool,
    scope: ResolvedScope,
}

pub struct Router {
    catalog: Arc<CatalogHandle>,
    config: RouterConfig,
    classifier: Arc<dyn Classifier>,
    sessions: SessionStore,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    executor: Option<Arc<dyn QueryExecutor>>,
    documents: Option<Arc<dyn DocumentSearch>>,
    knowledge: Option<Arc<dyn KnowledgeBase>>,
}

impl Router {
    /// Router with the embedded rule classifier and the system clock.
    pub fn new(catalog: Arc<CatalogHandle>, config: RouterConfig) -> Result<Self> {
        config.validate()?;
        let classifier = RuleClassifier::new(
            PatternTable::embedded()?,
            config.min_confidence,
            config.tie_margin,
        )?;
        info!(
            "Router ready: catalog v{}, patterns v{}",
            catalog.snapshot().version,
            classifier.version()
        );
        Ok(Self {
            sessions: SessionStore::new(config.memory_capacity, config.max_sessions),
            audit: Arc::new(AuditLog::new(config.audit_capacity)),
            catalog,
            classifier: Arc::new(classifier),
            clock: Arc::new(SystemClock),
            executor: None,
            documents: None,
            knowledge: None,
            config,
        })
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn QueryExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_documents(mut self, documents: Arc<dyn DocumentSearch>) -> Self {
        self.documents = Some(documents);
        self
    }

    pub fn with_knowledge_base(mut self, knowledge: Arc<dyn KnowledgeBase>) -> Self {
        self.knowledge = Some(knowledge);
        self
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<CatalogHandle> {
        &self.catalog
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn audit_log(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// Route one turn.
    pub async fn route(&self, request: RouteRequest) -> RouteResult {
        let started = Instant::now();
        let catalog = self.catalog.snapshot();
        let result = RouteResult::received(Uuid::new_v4().to_string());
        debug!("Routing request {}", result.request_id);

        let history = self.history(&request);
        let (hints, reply_round) = match &request.clarification {
            Some(reply) => (Hints::from(&reply.choice), true),
            None => (Hints::default(), false),
        };
        let utterance = match &request.clarification {
            Some(reply) => reply.original_utterance.as_str(),
            None => request.utterance.as_str(),
        };

        let mut turn = Turn {
            catalog: &catalog,
            utterance,
            context: &request.context,
            history: &history,
            anaphoric: is_anaphoric_continuation(utterance),
            hints,
            reply_round,
            scope: ResolvedScope::default(),
        };

        let (mut result, extracted) = self.run(&mut turn, result).await;
        result.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        if let (Some(session_id), Some(extracted)) = (&request.session_id, extracted) {
            self.sessions.append_turn(
                session_id,
                ConversationTurn::new(utterance, result.answer.clone(), extracted),
            );
        }

        info!(
            "Request {} finished as {:?} via {:?} in {}ms",
            result.request_id,
            result.final_stage(),
            result.tool,
            result.duration_ms
        );
        result
    }

    fn history(&self, request: &RouteRequest) -> Vec<ConversationTurn> {
        let capacity = self.config.memory_capacity;
        if !request.history.is_empty() {
            return ConversationMemory::from_history(&request.history, capacity).recent_turns(capacity);
        }
        match &request.session_id {
            Some(id) => self.sessions.recent_turns(id, capacity),
            None => Vec::new(),
        }
    }

    /// Returns the result and, for completed turns, the snapshot to remember.
    async fn run(&self, turn: &mut Turn<'_>, mut result: RouteResult) -> (RouteResult, Option<ExtractedEntities>) {
        let catalog = turn.catalog;
        let scan = TermResolver::new(catalog, &self.config).scan(turn.utterance);

        let decision = ScopeResolver::new(catalog, &self.config).derive_scope(
            turn.context,
            &scan,
            turn.history,
            turn.anaphoric,
            turn.hints.scope.as_ref(),
        );
        let pending_entity = match decision {
            ScopeDecision::Resolved(resolved) => {
                turn.scope = resolved;
                None
            }
            ScopeDecision::NeedsClarification { candidates, fallback } => {
                turn.scope = fallback;
                Some(candidates)
            }
        };
        result.scope = turn.scope.scope.clone();
        result.scope_override = turn.scope.scope_override.clone();
        result.enter(RouteStage::ScopeResolved);

        if let Some(o) = &turn.scope.scope_override {
            warn!(
                target: "security",
                replaced = ?o.replaced,
                by = ?o.by,
                "Explicit entity overrides navigation scope"
            );
            self.audit.record(
                &result.request_id,
                AuditKind::ScopeOverride { scope_override: o.clone() },
                format!("{:?} -> {:?}", o.replaced_source, o.by_source),
            );
        }

        let classification = self.classifier.classify(
            turn.utterance,
            &scan,
            turn.scope.scope.as_ref(),
            turn.history,
        );
        result.tool = classification.tool;
        result.enter(RouteStage::Classified);

        if classification.destructive {
            warn!(target: "security", "Destructive request rejected before generation");
            self.audit.record(
                &result.request_id,
                AuditKind::DestructiveRejected,
                "destructive verb on domain data",
            );
            return (result.rejected(ErrorCategory::WriteOperationDetected), None);
        }

        if let Some(candidates) = pending_entity {
            return (self.clarify_candidates(turn, result, &candidates, true), None);
        }

        let tool = turn.hints.tool.unwrap_or(classification.tool);
        result.tool = tool;
        match tool {
            Tool::StructuredQuery => self.structured(turn, result, &scan).await,
            Tool::DocumentSearch => self.search_documents(turn, result).await,
            Tool::KnowledgeBase => self.ask_knowledge_base(turn, result).await,
            Tool::Clarification => {
                if turn.reply_round {
                    return (result.rejected(ErrorCategory::NotUnderstood), None);
                }
                let reason = classification.reason.unwrap_or(ErrorCategory::LowConfidence);
                let options = build_clarification(from_tools(&classification.ranked), self.config.clarification_limit());
                (result.clarifying(tool_question(), options, reason), None)
            }
        }
    }

    fn clarify_candidates(
        &self,
        turn: &Turn<'_>,
        result: RouteResult,
        candidates: &[CandidateMatch],
        entity: bool,
    ) -> RouteResult {
        if turn.reply_round {
            return result.rejected(ErrorCategory::NotUnderstood);
        }
        let options = build_clarification(
            from_candidates(turn.catalog, candidates),
            self.config.clarification_limit(),
        );
        if options.is_empty() {
            return result.rejected(ErrorCategory::NotUnderstood);
        }
        let question = match (entity, options.as_slice()) {
            (true, [only]) => weak_entity_question(&only.label),
            _ => entity_question(),
        };
        result.clarifying(question, options, ErrorCategory::AmbiguousTerm)
    }

    fn reject_query(&self, result: RouteResult, e: ValidationError) -> RouteResult {
        let category = e.category();
        if category.is_security_event() {
            self.audit.record(
                &result.request_id,
                AuditKind::ValidationRejected { category },
                "structured query",
            );
        }
        result.rejected(category)
    }

    async fn structured(
        &self,
        turn: &Turn<'_>,
        mut result: RouteResult,
        scan: &ScanResult,
    ) -> (RouteResult, Option<ExtractedEntities>) {
        result.enter(RouteStage::Generating);
        let catalog = turn.catalog;
        let scope = turn.scope.scope.as_ref();

        let intent = IntentExtractor::new(catalog, self.config.ambiguity_margin).extract(
            turn.utterance,
            scan,
            scope,
            turn.history,
            turn.anaphoric,
            &turn.hints.terms,
            self.clock.today(),
        );
        let intent = match intent {
            Ok(intent) => intent,
            Err(IntentError::Ambiguous(candidates)) => {
                return (self.clarify_candidates(turn, result, &candidates, false), None);
            }
            Err(IntentError::UnknownTerm(terms)) => {
                let mut result = result.rejected(ErrorCategory::UnknownTerm);
                result.answer = format!(
                    "Je ne trouve pas « {} » dans vos données.",
                    terms.join(", ")
                );
                return (result, None);
            }
            Err(e) => return (result.rejected(e.category()), None),
        };

        let generated = match SqlGenerator::new(catalog, &self.config).generate(&intent, scope) {
            Ok(g) => g,
            Err(e) => return (self.reject_query(result, e), None),
        };
        let validated = match SqlValidator::new(catalog, &self.config).validate(generated, scope) {
            Ok(v) => v,
            Err(e) => return (self.reject_query(result, e), None),
        };

        let extracted = intent.extracted(scope);
        let Some(executor) = &self.executor else {
            result.sql = Some(validated.sql().to_string());
            result.params = validated.params().to_vec();
            let answer = with_notes(
                format!("Requête préparée sur {}.", describe_target(catalog, &intent)),
                &intent,
                turn,
            );
            return (result.completed(answer, vec![source_of(&intent)]), Some(extracted));
        };

        result.enter(RouteStage::Delegating);
        let rows = match tokio::time::timeout(validated.statement_timeout(), executor.execute(&validated)).await {
            Ok(Ok(rows)) => rows,
            Ok(Err(e)) => {
                warn!("Execution via {} failed: {}", executor.name(), e);
                return (result.rejected(ErrorCategory::CollaboratorFailure), None);
            }
            Err(_) => {
                self.audit.record(
                    &result.request_id,
                    AuditKind::Timeout { stage: "execution".to_string() },
                    format!("after {}ms", self.config.statement_timeout_ms),
                );
                warn!("Execution via {} timed out", executor.name());
                return (result.rejected(ErrorCategory::Timeout), None);
            }
        };

        result.sql = Some(validated.sql().to_string());
        result.params = validated.params().to_vec();
        let answer = with_notes(answer_for(catalog, &intent, &rows), &intent, turn);
        result.rows = Some(rows);
        (result.completed(answer, vec![source_of(&intent)]), Some(extracted))
    }

    async fn search_documents(&self, turn: &Turn<'_>, mut result: RouteResult) -> (RouteResult, Option<ExtractedEntities>) {
        result.enter(RouteStage::Delegating);
        let Some(documents) = &self.documents else {
            warn!("No document search service configured");
            return (result.rejected(ErrorCategory::CollaboratorFailure), None);
        };
        let scope = turn.scope.scope.as_ref();
        let found = match tokio::time::timeout(self.config.delegate_timeout(), documents.search(turn.utterance, scope)).await {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                warn!("Document search failed: {}", e);
                return (result.rejected(ErrorCategory::CollaboratorFailure), None);
            }
            Err(_) => return (self.timed_out(result, "document-search"), None),
        };

        let answer = if found.is_empty() {
            "Aucun document ne correspond à votre recherche.".to_string()
        } else {
            let listed: Vec<String> = found
                .iter()
                .map(|d| match &d.date {
                    Some(date) => format!("{} ({})", d.title, date),
                    None => d.title.clone(),
                })
                .collect();
            format!("{} document(s) trouvé(s) : {}.", found.len(), listed.join(" ; "))
        };
        let sources = found.iter().map(|d| format!("doc/{}", d.id)).collect();
        let extracted = ExtractedEntities {
            tool: Some(Tool::DocumentSearch),
            scope: scope.cloned(),
            ..ExtractedEntities::default()
        };
        (result.completed(with_override(answer, turn), sources), Some(extracted))
    }

    async fn ask_knowledge_base(&self, turn: &Turn<'_>, mut result: RouteResult) -> (RouteResult, Option<ExtractedEntities>) {
        result.enter(RouteStage::Delegating);
        let Some(knowledge) = &self.knowledge else {
            warn!("No knowledge base configured");
            return (result.rejected(ErrorCategory::CollaboratorFailure), None);
        };
        let passages = match tokio::time::timeout(self.config.delegate_timeout(), knowledge.retrieve(turn.utterance)).await {
            Ok(Ok(passages)) => passages,
            Ok(Err(e)) => {
                warn!("Knowledge base retrieval failed: {}", e);
                return (result.rejected(ErrorCategory::CollaboratorFailure), None);
            }
            Err(_) => return (self.timed_out(result, "knowledge-base"), None),
        };

        let answer = match passages.split_first() {
            None => "Je n'ai trouvé aucun article d'aide sur ce sujet.".to_string(),
            Some((best, [])) => format!("{} : {}", best.title, best.text),
            Some((best, others)) => format!(
                "{} : {}\n\nVoir aussi : {}.",
                best.title,
                best.text,
                others.iter().map(|p| p.title.as_str()).collect::<Vec<_>>().join(" ; ")
            ),
        };
        let sources = passages.iter().map(|p| p.source.clone()).collect();
        let extracted = ExtractedEntities {
            tool: Some(Tool::KnowledgeBase),
            ..ExtractedEntities::default()
        };
        (result.completed(answer, sources), Some(extracted))
    }

    fn timed_out(&self, result: RouteResult, stage: &str) -> RouteResult {
        warn!("Delegation to {} timed out", stage);
        self.audit.record(
            &result.request_id,
            AuditKind::Timeout { stage: stage.to_string() },
            format!("after {}ms", self.config.delegate_timeout_ms),
        );
        result.rejected(ErrorCategory::Timeout)
    }
}

fn source_of(intent: &QueryIntent) -> String {
    format!("catalog:{}", intent.target)
}

fn describe_target(catalog: &Catalog, intent: &QueryIntent) -> String {
    match intent.conditions.first() {
        Some(c) => c.phrase.clone(),
        None => catalog
            .queryable(&intent.target)
            .map(|q| q.label().to_string())
            .unwrap_or_else(|| intent.target.clone()),
    }
}

fn measure_label(catalog: &Catalog, table: &str, column: &str) -> String {
    catalog
        .queryable(table)
        .and_then(|q| q.column(column))
        .and_then(|c| c.alias.clone())
        .unwrap_or_else(|| column.to_string())
}

fn number(value: Option<&Value>) -> String {
    match value {
        Some(Value::Number(n)) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => i.to_string(),
            (None, Some(f)) if f.fract() == 0.0 => format!("{:.0}", f),
            (None, Some(f)) => format!("{:.2}", f),
            _ => n.to_string(),
        },
        Some(Value::String(s)) => s.clone(),
        // SUM over no rows is NULL
        _ => "0".to_string(),
    }
}

fn answer_for(catalog: &Catalog, intent: &QueryIntent, rows: &QueryRows) -> String {
    let target = describe_target(catalog, intent);
    match &intent.aggregation {
        Aggregation::Count => format!("Nombre de {} : {}.", target, number(rows.scalar())),
        Aggregation::Sum { column } => format!(
            "Total ({}) des {} : {}.",
            measure_label(catalog, &intent.target, column),
            target,
            number(rows.scalar())
        ),
        Aggregation::Average { column } => format!(
            "Moyenne ({}) des {} : {}.",
            measure_label(catalog, &intent.target, column),
            target,
            number(rows.scalar())
        ),
        Aggregation::List => {
            let mut answer = format!("{} résultat(s) pour {}.", rows.row_count(), target);
            if rows.truncated {
                answer.push_str(&format!(" Liste limitée à {} lignes.", rows.row_count()));
            }
            answer
        }
    }
}

/// Period, inherited-context and scope-override remarks.
fn with_notes(mut answer: String, intent: &QueryIntent, turn: &Turn<'_>) -> String {
    if let (Some(period), Some(window)) = (intent.period, intent.window) {
        let last_day = window.end.pred_opt().unwrap_or(window.end);
        answer.push_str(&format!(
            " Période : {} (du {} au {}).",
            period.label(),
            window.start.format("%d/%m/%Y"),
            last_day.format("%d/%m/%Y")
        ));
    }
    if let Some(scope) = &turn.scope.scope {
        answer.push_str(&format!(" Filtré sur {}.", scope.label(turn.catalog)));
    }
    for note in &intent.notes {
        answer.push_str(&format!(" ({})", note));
    }
    with_override(answer, turn)
}

fn with_override(mut answer: String, turn: &Turn<'_>) -> String {
    if let Some(o) = &turn.scope.scope_override {
        answer.push_str(&format!(
            " Remarque : {} a été pris en compte à la place de {}.",
            o.by.label(turn.catalog),
            o.replaced.label(turn.catalog)
        ));
    }
    answer
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::fixtures;
    use crate::clarification::Choice;
    use crate::collaborators::{DocumentSummary, KbPassage};
    use crate::error::RouterError;
    use crate::sql_validator::ValidatedQuery;
    use crate::time::FixedClock;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Answers every aggregate with the same value and counts calls.
    struct CannedExecutor {
        value: i64,
        calls: AtomicUsize,
        delay: Option<Duration>,
    }

    impl CannedExecutor {
        fn new(value: i64) -> Self {
            Self {
                value,
                calls: AtomicUsize::new(0),
                delay: None,
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::new(0)
            }
        }
    }

    #[async_trait]
    impl QueryExecutor for CannedExecutor {
        fn name(&self) -> &'static str {
            "canned"
        }

        async fn execute(&self, _query: &ValidatedQuery) -> Result<QueryRows> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(QueryRows {
                columns: vec!["total".to_string()],
                rows: vec![vec![Value::from(self.value)]],
                truncated: false,
            })
        }
    }

    struct FailingExecutor;

    #[async_trait]
    impl QueryExecutor for FailingExecutor {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn execute(&self, _query: &ValidatedQuery) -> Result<QueryRows> {
            Err(RouterError::Collaborator("connection refused".to_string()))
        }
    }

    /// Knowledge base and document index that answer after `delay`.
    struct SlowDelegate {
        delay: Duration,
    }

    #[async_trait]
    impl KnowledgeBase for SlowDelegate {
        async fn retrieve(&self, _utterance: &str) -> Result<Vec<KbPassage>> {
            tokio::time::sleep(self.delay).await;
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl DocumentSearch for SlowDelegate {
        async fn search(
            &self,
            _utterance: &str,
            _scope: Option<&ScopeContext>,
        ) -> Result<Vec<DocumentSummary>> {
            tokio::time::sleep(self.delay).await;
            Ok(Vec::new())
        }
    }

    fn router(config: RouterConfig) -> Router {
        Router::new(Arc::new(CatalogHandle::new(fixtures::catalog())), config)
            .unwrap()
            .with_clock(Arc::new(FixedClock::new(NaiveDate::from_ymd_opt(2026, 10, 18).unwrap())))
    }

    #[tokio::test]
    async fn test_count_with_executor() {
        let executor = Arc::new(CannedExecutor::new(3));
        let router = router(RouterConfig::default()).with_executor(executor.clone());

        let result = router.route(RouteRequest::new("Combien de baux actifs ?")).await;
        assert_eq!(result.final_stage(), Some(RouteStage::Completed));
        assert_eq!(result.tool, Tool::StructuredQuery);
        assert_eq!(result.answer, "Nombre de baux actifs : 3.");
        assert_eq!(result.sources, vec!["catalog:leases"]);
        assert_eq!(
            result.sql.as_deref(),
            Some("SELECT COUNT(*) AS total FROM leases WHERE leases.status = ?1 LIMIT 1")
        );
        assert_eq!(
            result.stages,
            vec![
                RouteStage::Received,
                RouteStage::ScopeResolved,
                RouteStage::Classified,
                RouteStage::Generating,
                RouteStage::Delegating,
                RouteStage::Completed,
            ]
        );
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_destructive_request_is_rejected_and_audited() {
        let executor = Arc::new(CannedExecutor::new(0));
        let router = router(RouterConfig::default()).with_executor(executor.clone());

        let result = router.route(RouteRequest::new("Supprimer tous les baux")).await;
        assert!(result.is_rejected());
        assert_eq!(result.error, Some(ErrorCategory::WriteOperationDetected));
        assert!(result.sql.is_none());
        assert!(!result.stages.contains(&RouteStage::Generating));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);

        let records = router.audit_log().for_request(&result.request_id);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, AuditKind::DestructiveRejected);
    }

    #[tokio::test]
    async fn test_slow_execution_times_out() {
        let config = RouterConfig {
            statement_timeout_ms: 20,
            ..RouterConfig::default()
        };
        let router = router(config).with_executor(Arc::new(CannedExecutor::slow(Duration::from_millis(500))));

        let result = router.route(RouteRequest::new("Combien de baux actifs ?")).await;
        assert!(result.is_rejected());
        assert_eq!(result.error, Some(ErrorCategory::Timeout));
        assert!(result.retryable);
        assert!(result.sql.is_none());
        assert!(matches!(
            router.audit_log().for_request(&result.request_id)[0].kind,
            AuditKind::Timeout { .. }
        ));
    }

    #[tokio::test]
    async fn test_executor_failure_is_a_collaborator_failure() {
        let router = router(RouterConfig::default()).with_executor(Arc::new(FailingExecutor));
        let result = router.route(RouteRequest::new("Combien de baux actifs ?")).await;
        assert_eq!(result.error, Some(ErrorCategory::CollaboratorFailure));
        assert!(result.retryable);
        assert!(!result.answer.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_homonym_clarification_then_reply() {
        let router = router(RouterConfig::default());
        let utterance = "Combien de baux pour Martin ?";

        let first = router.route(RouteRequest::new(utterance)).await;
        assert!(first.needs_clarification);
        assert_eq!(first.error, Some(ErrorCategory::AmbiguousTerm));
        assert_eq!(first.final_stage(), Some(RouteStage::Clarifying));
        let options = first.clarification_options.unwrap();
        assert_eq!(options.len(), 2);
        assert!(options.iter().all(|o| o.label.contains("Martin")));

        let Choice::Entity { scope } = options[0].choice.clone() else {
            panic!("expected an entity option, got {:?}", options[0].choice);
        };
        let second = router
            .route(RouteRequest::reply(ClarificationReply {
                original_utterance: utterance.to_string(),
                choice: options[0].choice.clone(),
            }))
            .await;
        assert_eq!(second.final_stage(), Some(RouteStage::Completed));
        assert_eq!(second.scope, Some(scope.clone()));
        assert!(second.sql.unwrap().contains("leases.tenant_id = ?1"));
        assert_eq!(second.params, vec![SqlParam::Int(scope.entity_id)]);
    }

    #[tokio::test]
    async fn test_second_ambiguity_is_not_clarified_again() {
        let router = router(RouterConfig::default());
        let result = router
            .route(RouteRequest::reply(ClarificationReply {
                original_utterance: "Combien de baux pour Martin ?".to_string(),
                choice: Choice::Term {
                    canonical: "leases".to_string(),
                },
            }))
            .await;
        assert!(result.is_rejected());
        assert!(!result.needs_clarification);
        assert_eq!(result.error, Some(ErrorCategory::NotUnderstood));
    }

    #[tokio::test]
    async fn test_vague_request_offers_at_most_three_tools() {
        let router = router(RouterConfig::default());
        let result = router.route(RouteRequest::new("Bonjour")).await;
        assert!(result.needs_clarification);
        assert_eq!(result.error, Some(ErrorCategory::LowConfidence));
        let options = result.clarification_options.unwrap();
        assert!(!options.is_empty() && options.len() <= 3);
        assert!(options.iter().all(|o| matches!(o.choice, Choice::Tool { .. })));
    }

    #[tokio::test]
    async fn test_scope_override_is_reported_and_audited() {
        let router = router(RouterConfig::default()).with_executor(Arc::new(CannedExecutor::new(2)));
        let request = RouteRequest::new("Combien de baux pour Les Acacias ?")
            .with_context(RouteContext::new("/biens/1"));

        let result = router.route(request).await;
        assert_eq!(result.scope, Some(ScopeContext::new("property", 2)));
        let o = result.scope_override.clone().unwrap();
        assert_eq!(o.replaced, ScopeContext::new("property", 1));
        assert_eq!(result.params, vec![SqlParam::Int(2)]);
        assert!(result.answer.contains("Remarque : Les Acacias a été pris en compte à la place de Les Tilleuls."));

        let records = router.audit_log().for_request(&result.request_id);
        assert!(matches!(records[0].kind, AuditKind::ScopeOverride { .. }));
        assert!(!records[0].detail.contains("Acacias"));
    }

    #[tokio::test]
    async fn test_follow_up_reuses_session_context() {
        let router = router(RouterConfig::default());

        let first = router
            .route(RouteRequest::new("Combien de paiements ce mois-ci ?").in_session("s1"))
            .await;
        assert_eq!(first.final_stage(), Some(RouteStage::Completed));
        assert_eq!(
            first.params,
            vec![
                SqlParam::Text("2026-10-01".to_string()),
                SqlParam::Text("2026-11-01".to_string()),
            ]
        );

        let second = router
            .route(RouteRequest::new("Et le mois dernier ?").in_session("s1"))
            .await;
        assert_eq!(second.tool, Tool::StructuredQuery);
        assert_eq!(second.sql, first.sql);
        assert_eq!(
            second.params,
            vec![
                SqlParam::Text("2026-09-01".to_string()),
                SqlParam::Text("2026-10-01".to_string()),
            ]
        );
        assert_eq!(router.sessions().recent_turns("s1", 5).len(), 2);

        let fresh = router.route(RouteRequest::new("Et le mois dernier ?").in_session("s2")).await;
        assert_ne!(fresh.final_stage(), Some(RouteStage::Completed));
    }

    #[tokio::test]
    async fn test_unknown_name_is_reported() {
        let router = router(RouterConfig::default());
        let result = router.route(RouteRequest::new("Combien de baux pour Zorglub ?")).await;
        assert_eq!(result.error, Some(ErrorCategory::UnknownTerm));
        assert!(result.answer.contains("Zorglub"));
        assert!(result.sql.is_none());
    }

    #[tokio::test]
    async fn test_missing_collaborator_fails_cleanly() {
        let router = router(RouterConfig::default());
        let result = router.route(RouteRequest::new("Comment générer une quittance ?")).await;
        assert_eq!(result.tool, Tool::KnowledgeBase);
        assert_eq!(result.error, Some(ErrorCategory::CollaboratorFailure));
    }

    #[tokio::test]
    async fn test_unmatched_lowercase_or_leading_name_is_reported() {
        let executor = Arc::new(CannedExecutor::new(5));
        let router = router(RouterConfig::default()).with_executor(executor.clone());

        for (utterance, name) in [
            ("Combien de baux pour durand ?", "durand"),
            ("Durand a combien de baux ?", "Durand"),
        ] {
            let result = router.route(RouteRequest::new(utterance)).await;
            assert_eq!(result.error, Some(ErrorCategory::UnknownTerm), "{}", utterance);
            assert!(result.answer.contains(name), "answer: {}", result.answer);
            assert!(result.sql.is_none());
        }
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_slow_knowledge_base_times_out() {
        let config = RouterConfig {
            delegate_timeout_ms: 20,
            ..RouterConfig::default()
        };
        let router = router(config).with_knowledge_base(Arc::new(SlowDelegate {
            delay: Duration::from_millis(500),
        }));

        let result = router.route(RouteRequest::new("Comment générer une quittance ?")).await;

        assert_eq!(result.tool, Tool::KnowledgeBase);
        assert_eq!(result.error, Some(ErrorCategory::Timeout));
        assert!(result.retryable);
        let records = router.audit_log().for_request(&result.request_id);
        assert!(records.iter().any(|r| matches!(
            &r.kind,
            AuditKind::Timeout { stage } if stage == "knowledge-base"
        )));
    }

    #[tokio::test]
    async fn test_slow_document_search_times_out() {
        let config = RouterConfig {
            delegate_timeout_ms: 20,
            ..RouterConfig::default()
        };
        let router = router(config).with_documents(Arc::new(SlowDelegate {
            delay: Duration::from_millis(500),
        }));

        let result = router.route(RouteRequest::new("Retrouve la facture de septembre")).await;

        assert_eq!(result.tool, Tool::DocumentSearch);
        assert_eq!(result.error, Some(ErrorCategory::Timeout));
        assert!(result.retryable);
        let records = router.audit_log().for_request(&result.request_id);
        assert!(records.iter().any(|r| matches!(
            &r.kind,
            AuditKind::Timeout { stage } if stage == "document-search"
        )));
    }

    #[tokio::test]
    async fn test_session_count_stays_bounded() {
        let config = RouterConfig {
            max_sessions: 3,
            ..RouterConfig::default()
        };
        let router = router(config).with_executor(Arc::new(CannedExecutor::new(2)));

        for i in 0..10 {
            let request = RouteRequest::new("Combien de baux actifs ?").in_session(format!("s{}", i));
            router.route(request).await;
        }
        assert_eq!(router.sessions().len(), 3);

        for i in 10..60 {
            let request = RouteRequest::new("Supprimer tous les baux").in_session(format!("s{}", i));
            router.route(request).await;
            router.sessions().recent_turns(&format!("s{}", i), 5);
        }
        assert_eq!(router.sessions().len(), 3);
    }
}
