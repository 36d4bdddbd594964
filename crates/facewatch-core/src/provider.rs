//! Collaborator seams: where identities, settings and events come from and go.

use std::collections::HashMap;

use thiserror::Error;

use crate::types::{DetectionEvent, KnownIdentity};

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("invalid setting {name}={value:?}: {reason}")]
    Invalid {
        name: String,
        value: String,
        reason: String,
    },
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("event rejected: {0}")]
    Rejected(String),
    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

/// Source of registered identities.
pub trait IdentityStore: Send + Sync {
    /// Every active identity with its reference embeddings, in a stable order.
    fn list_identities(&self) -> Result<Vec<KnownIdentity>, ProviderError>;
}

/// Key/value settings lookup.
pub trait SettingsProvider: Send + Sync {
    /// Raw value for `name`, or `default` when unset.
    fn get(&self, name: &str, default: &str) -> Result<String, ProviderError>;
}

/// Destination for emitted detection events.
///
/// Called concurrently from every camera session.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &DetectionEvent) -> Result<(), SinkError>;
}

impl IdentityStore for Vec<KnownIdentity> {
    fn list_identities(&self) -> Result<Vec<KnownIdentity>, ProviderError> {
        Ok(self.clone())
    }
}

impl SettingsProvider for HashMap<String, String> {
    fn get(&self, name: &str, default: &str) -> Result<String, ProviderError> {
        Ok(HashMap::get(self, name)
            .cloned()
            .unwrap_or_else(|| default.to_string()))
    }
}
