//! SQL Validator
//!
//! Runs unconditionally before any dispatch: tokenize, reject writes, check
//! the whitelist, check the scope filter, enforce budgets. Only this module can
//! build a [`ValidatedQuery`], and executors accept nothing else.
//!
//! Rejections never carry or log the SQL text.

use crate::catalog::{Catalog, SqlParam};
use crate::config::RouterConfig;
use crate::error::ErrorCategory;
use crate::scope::ScopeContext;
use crate::sql_generator::GeneratedQuery;
use crate::time::TimeWindow;
use sqlparser::dialect::GenericDialect;
use sqlparser::tokenizer::{Token, Tokenizer};
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const WRITE_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "TRUNCATE", "GRANT", "REVOKE", "CREATE",
    "REPLACE", "MERGE", "UPSERT", "ATTACH", "DETACH", "PRAGMA", "VACUUM", "REINDEX",
];

const READ_KEYWORDS: &[&str] = &[
    "SELECT", "DISTINCT", "FROM", "JOIN", "INNER", "ON", "WHERE", "AND", "OR", "AS", "ORDER",
    "BY", "ASC", "DESC", "LIMIT",
];

const FUNCTIONS: &[&str] = &["COUNT", "SUM", "AVG", "MIN", "MAX"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Write or DDL operation detected")]
    WriteOperationDetected,
    #[error("Reference outside the whitelisted schema")]
    NotWhitelisted,
    #[error("Scope filter missing")]
    MissingScope,
    #[error("Row or time budget exceeded")]
    BudgetExceeded,
    #[error("Statement shape not allowed")]
    Malformed,
}

impl ValidationError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ValidationError::WriteOperationDetected => ErrorCategory::WriteOperationDetected,
            ValidationError::NotWhitelisted | ValidationError::Malformed => {
                ErrorCategory::NotWhitelisted
            }
            ValidationError::MissingScope => ErrorCategory::MissingScope,
            ValidationError::BudgetExceeded => ErrorCategory::BudgetExceeded,
        }
    }
}

/// SQL that passed every check. Fields are private so the type cannot be
/// forged outside this module.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedQuery {
    sql: String,
    params: Vec<SqlParam>,
    window: Option<TimeWindow>,
    statement_timeout: Duration,
    max_rows: u64,
}

impl ValidatedQuery {
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[SqlParam] {
        &self.params
    }

    pub fn window(&self) -> Option<&TimeWindow> {
        self.window.as_ref()
    }

    pub fn statement_timeout(&self) -> Duration {
        self.statement_timeout
    }

    pub fn max_rows(&self) -> u64 {
        self.max_rows
    }
}

pub struct SqlValidator<'a> {
    catalog: &'a Catalog,
    max_rows: u64,
    max_time_range_days: i64,
    statement_timeout: Duration,
}

impl<'a> SqlValidator<'a> {
    pub fn new(catalog: &'a Catalog, config: &RouterConfig) -> Self {
        Self {
            catalog,
            max_rows: config.max_rows,
            max_time_range_days: config.max_time_range_days,
            statement_timeout: config.statement_timeout(),
        }
    }

    pub fn validate(
        &self,
        query: GeneratedQuery,
        scope: Option<&ScopeContext>,
    ) -> Result<ValidatedQuery, ValidationError> {
        match self.check(&query, scope) {
            Ok(()) => {
                debug!("SQL validated against catalog v{}", self.catalog.version);
                Ok(ValidatedQuery {
                    sql: query.sql,
                    params: query.params,
                    window: query.window,
                    statement_timeout: self.statement_timeout,
                    max_rows: self.max_rows,
                })
            }
            Err(e) => {
                warn!(target: "security", rejection = ?e, "Generated SQL rejected before dispatch");
                Err(e)
            }
        }
    }

    fn check(&self, query: &GeneratedQuery, scope: Option<&ScopeContext>) -> Result<(), ValidationError> {
        // (a) tokenize
        let dialect = GenericDialect {};
        let tokens: Vec<Token> = Tokenizer::new(&dialect, &query.sql)
            .tokenize()
            .map_err(|_| ValidationError::Malformed)?
            .into_iter()
            .filter(|t| !matches!(t, Token::Whitespace(_) | Token::EOF))
            .collect();

        // (b) read-only
        read_only(&tokens)?;
        check_shape(&tokens, query.params.len())?;

        // (c) whitelist
        let relations = self.whitelisted(&tokens)?;

        // (d) scope
        if let Some(scope) = scope {
            self.scoped(&tokens, &relations, &query.params, scope)?;
        }

        // (e) budgets
        self.within_budget(&tokens, query.window.as_ref())
    }

    fn whitelisted(&self, tokens: &[Token]) -> Result<Vec<String>, ValidationError> {
        let mut relations = Vec::new();
        let mut aliases = HashSet::new();
        for (i, token) in tokens.iter().enumerate() {
            if is_word(token, "FROM") || is_word(token, "JOIN") {
                let name = word_at(tokens, i + 1).ok_or(ValidationError::Malformed)?;
                if !self.catalog.is_whitelisted(name) {
                    return Err(ValidationError::NotWhitelisted);
                }
                relations.push(name.to_string());
            } else if is_word(token, "AS") {
                let alias = word_at(tokens, i + 1).ok_or(ValidationError::Malformed)?;
                aliases.insert(alias.to_string());
            }
        }
        if relations.is_empty() {
            return Err(ValidationError::Malformed);
        }

        let mut i = 0;
        while i < tokens.len() {
            let Some(word) = word_at(tokens, i) else {
                i += 1;
                continue;
            };
            if READ_KEYWORDS.contains(&word.to_uppercase().as_str()) {
                i += 1;
                continue;
            }
            if matches!(tokens.get(i + 1), Some(Token::Period)) {
                let column = word_at(tokens, i + 2).ok_or(ValidationError::Malformed)?;
                if !relations.iter().any(|r| r == word) || !self.catalog.has_column(word, column) {
                    return Err(ValidationError::NotWhitelisted);
                }
                i += 3;
                continue;
            }
            let allowed = if matches!(tokens.get(i + 1), Some(Token::LParen)) {
                FUNCTIONS.contains(&word.to_uppercase().as_str())
            } else {
                relations.iter().any(|r| r == word)
                    || aliases.contains(word)
                    || relations.iter().any(|r| self.catalog.has_column(r, word))
            };
            if !allowed {
                return Err(ValidationError::NotWhitelisted);
            }
            i += 1;
        }
        Ok(relations)
    }

    fn scoped(
        &self,
        tokens: &[Token],
        relations: &[String],
        params: &[SqlParam],
        scope: &ScopeContext,
    ) -> Result<(), ValidationError> {
        let entity_type = self
            .catalog
            .entity_type(&scope.entity_type)
            .ok_or(ValidationError::MissingScope)?;

        // A disjunction could widen past the scope filter.
        if tokens.iter().any(|t| is_word(t, "OR")) {
            return Err(ValidationError::MissingScope);
        }

        let expected = SqlParam::Int(scope.entity_id);
        let present = tokens.windows(6).any(|w| {
            let conjunct = is_word(&w[0], "WHERE") || is_word(&w[0], "AND");
            let (Some(relation), Some(column)) = (word_of(&w[1]), word_of(&w[3])) else {
                return false;
            };
            conjunct
                && matches!(w[2], Token::Period)
                && matches!(w[4], Token::Eq)
                && relations.iter().any(|r| r == relation)
                && self
                    .catalog
                    .direct_scope_columns(relation, entity_type)
                    .iter()
                    .any(|c| c == column)
                && placeholder_index(&w[5])
                    .and_then(|k| k.checked_sub(1))
                    .and_then(|i| params.get(i))
                    .map_or(false, |p| *p == expected)
        });

        if present {
            Ok(())
        } else {
            Err(ValidationError::MissingScope)
        }
    }

    fn within_budget(&self, tokens: &[Token], window: Option<&TimeWindow>) -> Result<(), ValidationError> {
        let n = tokens.len();
        let limit = match (n >= 2).then(|| (&tokens[n - 2], &tokens[n - 1])) {
            Some((kw, Token::Number(value, _))) if is_word(kw, "LIMIT") => value
                .parse::<u64>()
                .map_err(|_| ValidationError::BudgetExceeded)?,
            _ => return Err(ValidationError::BudgetExceeded),
        };
        if limit == 0 || limit > self.max_rows {
            return Err(ValidationError::BudgetExceeded);
        }
        if let Some(w) = window {
            if w.days() <= 0 || w.days() > self.max_time_range_days {
                return Err(ValidationError::BudgetExceeded);
            }
        }
        Ok(())
    }
}

fn read_only(tokens: &[Token]) -> Result<(), ValidationError> {
    if !tokens.first().map_or(false, |t| is_word(t, "SELECT")) {
        return Err(ValidationError::WriteOperationDetected);
    }
    for token in tokens {
        match token {
            Token::SemiColon => return Err(ValidationError::WriteOperationDetected),
            Token::Word(w) if WRITE_KEYWORDS.contains(&w.value.to_uppercase().as_str()) => {
                return Err(ValidationError::WriteOperationDetected)
            }
            _ => {}
        }
    }
    Ok(())
}

/// Only identifiers, numbers, placeholders and a few operators; every
/// placeholder `?k` must be bound, and every bound value used.
fn check_shape(tokens: &[Token], param_count: usize) -> Result<(), ValidationError> {
    let mut used = HashSet::new();
    for token in tokens {
        match token {
            Token::Word(w) if w.quote_style.is_none() => {}
            Token::Placeholder(_) => {
                let k = placeholder_index(token).ok_or(ValidationError::Malformed)?;
                if k == 0 || k > param_count {
                    return Err(ValidationError::Malformed);
                }
                used.insert(k);
            }
            Token::Number(_, _)
            | Token::Period
            | Token::Comma
            | Token::LParen
            | Token::RParen
            | Token::Mul
            | Token::Eq
            | Token::Neq
            | Token::Lt
            | Token::Gt
            | Token::LtEq
            | Token::GtEq => {}
            _ => return Err(ValidationError::Malformed),
        }
    }
    if used.len() != param_count {
        return Err(ValidationError::Malformed);
    }
    Ok(())
}

fn word_of(token: &Token) -> Option<&str> {
    match token {
        Token::Word(w) if w.quote_style.is_none() => Some(w.value.as_str()),
        _ => None,
    }
}

fn word_at(tokens: &[Token], i: usize) -> Option<&str> {
    tokens.get(i).and_then(word_of)
}

fn is_word(token: &Token, keyword: &str) -> bool {
    word_of(token).map_or(false, |w| w.eq_ignore_ascii_case(keyword))
}

fn placeholder_index(token: &Token) -> Option<usize> {
    match token {
        Token::Placeholder(p) => p.strip_prefix('?')?.parse().ok(),
        _ => None,
    }
}
