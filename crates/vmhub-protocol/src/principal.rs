//! Caller identity.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity associated with the current connection, re-resolved on every
/// dispatch because the underlying transport may rebind identity per call
/// (token refresh). Controllers hold the latest value seen — it is
/// overwritten on each dispatch, never merged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Principal {
    /// Authenticated subject, `None` for anonymous callers.
    pub subject: Option<String>,
    /// Arbitrary identity claims resolved by the authentication layer.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub claims: HashMap<String, Value>,
}

impl Principal {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn named(subject: impl Into<String>) -> Self {
        Self {
            subject: Some(subject.into()),
            claims: HashMap::new(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.subject.is_none()
    }
}
