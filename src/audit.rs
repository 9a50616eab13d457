//! In-memory audit trail of security-relevant turn events

use crate::error::ErrorCategory;
use crate::scope::ScopeOverride;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum AuditKind {
    ScopeOverride {
        #[serde(rename = "scopeOverride")]
        scope_override: ScopeOverride,
    },
    ValidationRejected { category: ErrorCategory },
    DestructiveRejected,
    Timeout { stage: String },
}

/// One event. `detail` never contains SQL text or raw utterances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub request_id: String,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: AuditKind,
    pub detail: String,
}

/// Bounded, most recent records last
pub struct AuditLog {
    records: Mutex<VecDeque<AuditRecord>>,
    capacity: usize,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, request_id: &str, kind: AuditKind, detail: impl Into<String>) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        while records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(AuditRecord {
            request_id: request_id.to_string(),
            at: Utc::now(),
            kind,
            detail: detail.into(),
        });
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.iter().cloned().collect()
    }

    pub fn for_request(&self, request_id: &str) -> Vec<AuditRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.request_id == request_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
