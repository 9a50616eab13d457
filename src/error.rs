use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Introspection failed for '{relation}': {reason}")]
    Introspection { relation: String, reason: String },

    #[error("Collaborator error: {0}")]
    Collaborator(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, RouterError>;

/// Safe, caller-facing failure category of a single turn.
///
/// Never carries internal detail: a category maps to a fixed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCategory {
    AmbiguousTerm,
    UnknownTerm,
    NotWhitelisted,
    WriteOperationDetected,
    MissingScope,
    BudgetExceeded,
    Timeout,
    LowConfidence,
    ClassifierTie,
    NotUnderstood,
    CollaboratorFailure,
}

impl ErrorCategory {
    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorCategory::AmbiguousTerm => {
                "Votre demande peut se comprendre de plusieurs façons."
            }
            ErrorCategory::UnknownTerm => {
                "Je ne trouve pas cet élément dans vos données."
            }
            ErrorCategory::NotWhitelisted
            | ErrorCategory::WriteOperationDetected
            | ErrorCategory::MissingScope => {
                "Je ne peux pas traiter cette demande : seules les consultations autorisées sont possibles."
            }
            ErrorCategory::BudgetExceeded => {
                "La demande porte sur un volume ou une période trop large. Essayez de la restreindre."
            }
            ErrorCategory::Timeout => {
                "La recherche a pris trop de temps. Veuillez réessayer."
            }
            ErrorCategory::LowConfidence | ErrorCategory::ClassifierTie => {
                "Pouvez-vous préciser ce que vous cherchez ?"
            }
            ErrorCategory::NotUnderstood => {
                "Je n'ai pas compris votre demande. Pouvez-vous la reformuler ?"
            }
            ErrorCategory::CollaboratorFailure => {
                "Le service est momentanément indisponible. Veuillez réessayer."
            }
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Timeout | ErrorCategory::CollaboratorFailure
        )
    }

    /// Security-relevant rejections are fatal for the turn and audited.
    pub fn is_security_event(&self) -> bool {
        matches!(
            self,
            ErrorCategory::NotWhitelisted
                | ErrorCategory::WriteOperationDetected
                | ErrorCategory::MissingScope
        )
    }
}
