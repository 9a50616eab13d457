//! Context Scope Resolver
//!
//! Derives the implicit entity filter of a turn. Priority: route path, then
//! query parameter, then an entity named in the utterance, then the previous
//! turn's scope when the utterance is an anaphoric continuation. An explicit
//! entity in the utterance beats the navigation scope and the override is
//! recorded, never silently reconciled.

use crate::catalog::Catalog;
use crate::config::RouterConfig;
use crate::fuzzy_matcher::fold;
use crate::memory::{ConversationTurn, ExtractedEntities};
use crate::resolver::{CandidateMatch, Resolution, ScanResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Navigation context of the caller: current path and query parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteContext {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub query_params: BTreeMap<String, String>,
}

impl RouteContext {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            query_params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.insert(key.into(), value.into());
        self
    }
}

/// An AND-only entity filter. Once set for a turn it can be replaced by an
/// explicit reference but never dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeContext {
    pub entity_type: String,
    pub entity_id: i64,
}

impl ScopeContext {
    pub fn new(entity_type: impl Into<String>, entity_id: i64) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id,
        }
    }

    /// Human label, e.g. "Les Acacias" or "bail #7" when the value is not catalogued.
    pub fn label(&self, catalog: &Catalog) -> String {
        catalog
            .entity(&self.entity_type, self.entity_id)
            .map(|e| e.label.clone())
            .unwrap_or_else(|| format!("{} #{}", self.entity_type, self.entity_id))
    }

    /// Parse the canonical form used by resolver candidates ("tenant#4").
    pub fn from_canonical(canonical: &str) -> Option<Self> {
        let (entity_type, id) = canonical.split_once('#')?;
        Some(Self::new(entity_type, id.parse().ok()?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScopeSource {
    RoutePath,
    QueryParam,
    Utterance,
    History,
    Clarified,
}

/// Explicit reference that replaced the navigation scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeOverride {
    pub replaced: ScopeContext,
    pub replaced_source: ScopeSource,
    pub by: ScopeContext,
    pub by_source: ScopeSource,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedScope {
    pub scope: Option<ScopeContext>,
    pub source: Option<ScopeSource>,
    pub scope_override: Option<ScopeOverride>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScopeDecision {
    Resolved(ResolvedScope),
    /// The utterance names an entity we cannot pin down; `fallback` is what
    /// navigation alone would give.
    NeedsClarification {
        candidates: Vec<CandidateMatch>,
        fallback: ResolvedScope,
    },
}

pub struct ScopeResolver<'a> {
    catalog: &'a Catalog,
    threshold: f64,
    ambiguity_margin: f64,
}

impl<'a> ScopeResolver<'a> {
    pub fn new(catalog: &'a Catalog, config: &RouterConfig) -> Self {
        Self {
            catalog,
            threshold: config.scope_threshold,
            ambiguity_margin: config.ambiguity_margin,
        }
    }

    /// Scope carried by the route path, deepest entity segment wins ("/biens/3/baux/7" -> lease 7).
    pub fn from_route_path(&self, path: &str) -> Option<ScopeContext> {
        let segments: Vec<String> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(fold)
            .collect();

        segments
            .windows(2)
            .filter_map(|pair| {
                let id: i64 = pair[1].parse().ok()?;
                self.catalog
                    .entity_types
                    .iter()
                    .find(|et| et.route_segments.iter().any(|s| fold(s) == pair[0]))
                    .map(|et| ScopeContext::new(et.name.clone(), id))
            })
            .last()
    }

    pub fn from_query_params(&self, params: &BTreeMap<String, String>) -> Option<ScopeContext> {
        for et in &self.catalog.entity_types {
            for name in &et.query_params {
                let Some(raw) = params.get(name) else {
                    continue;
                };
                match raw.trim().parse::<i64>() {
                    Ok(id) => return Some(ScopeContext::new(et.name.clone(), id)),
                    Err(_) => debug!("Ignoring non-numeric scope parameter {}", name),
                }
            }
        }
        None
    }

    /// Derive the scope of a turn.
    ///
    /// `chosen` is an entity picked from a previous clarification and counts as
    /// explicitly stated.
    pub fn derive_scope(
        &self,
        route: &RouteContext,
        scan: &ScanResult,
        history: &[ConversationTurn],
        anaphoric: bool,
        chosen: Option<&ScopeContext>,
    ) -> ScopeDecision {
        let navigation = self
            .from_route_path(&route.path)
            .map(|s| (s, ScopeSource::RoutePath))
            .or_else(|| {
                self.from_query_params(&route.query_params)
                    .map(|s| (s, ScopeSource::QueryParam))
            });

        let fallback = match &navigation {
            Some((scope, source)) => ResolvedScope {
                scope: Some(scope.clone()),
                source: Some(*source),
                scope_override: None,
            },
            None => ResolvedScope::default(),
        };

        let explicit = match chosen {
            Some(scope) => Some((scope.clone(), ScopeSource::Clarified)),
            None => match self.named_entity(scan) {
                Named::Entity(scope) => Some((scope, ScopeSource::Utterance)),
                Named::Unclear(candidates) => {
                    return ScopeDecision::NeedsClarification { candidates, fallback };
                }
                Named::Nothing => None,
            },
        };

        let resolved = match (explicit, navigation) {
            (Some((by, by_source)), Some((current, current_source))) if by != current => {
                ResolvedScope {
                    scope: Some(by.clone()),
                    source: Some(by_source),
                    scope_override: Some(ScopeOverride {
                        replaced: current,
                        replaced_source: current_source,
                        by,
                        by_source,
                    }),
                }
            }
            (Some(_), Some(_)) => fallback,
            (Some((scope, source)), None) => ResolvedScope {
                scope: Some(scope),
                source: Some(source),
                scope_override: None,
            },
            (None, Some(_)) => fallback,
            (None, None) if anaphoric => self.inherited(history),
            (None, None) => ResolvedScope::default(),
        };
        ScopeDecision::Resolved(resolved)
    }

    fn named_entity(&self, scan: &ScanResult) -> Named {
        let Some(mention) = scan.entity_mentions().next() else {
            return Named::Nothing;
        };
        match mention.resolution(self.ambiguity_margin) {
            Resolution::Unique(best) if best.score >= self.threshold => best
                .entity
                .map(|e| Named::Entity(ScopeContext::new(e.entity_type, e.id)))
                .unwrap_or(Named::Nothing),
            Resolution::Unique(weak) => Named::Unclear(vec![weak]),
            Resolution::Ambiguous(candidates) => Named::Unclear(
                candidates
                    .into_iter()
                    .filter(|c| c.entity.is_some())
                    .collect(),
            ),
            Resolution::Unknown => Named::Nothing,
        }
    }

    fn inherited(&self, history: &[ConversationTurn]) -> ResolvedScope {
        let previous = history
            .iter()
            .rev()
            .find_map(|t| t.extracted_entities.scope.as_ref().map(|_| &t.extracted_entities));

        match previous.map(|e: &ExtractedEntities| e.revalidated(self.catalog).scope) {
            Some(Some(scope)) => ResolvedScope {
                scope: Some(scope),
                source: Some(ScopeSource::History),
                scope_override: None,
            },
            _ => ResolvedScope::default(),
        }
    }
}

enum Named {
    Entity(ScopeContext),
    Unclear(Vec<CandidateMatch>),
    Nothing,
}
