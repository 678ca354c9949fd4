//! Per-category error policies

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::error_code::{ErrorCategory, InvalidErrorCode};
use super::types::Severity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorPolicy {
    pub notify: bool,
    pub retryable: bool,
    /// Downgrade the snapshot to Offline
    pub set_offline: bool,
    pub severity_override: Option<Severity>,
}

impl ErrorPolicy {
    /// Policy for alerts whose code does not parse
    pub fn fallback(severity: Severity) -> Self {
        Self {
            notify: severity.is_error(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct PolicyTable {
    policies: HashMap<ErrorCategory, ErrorPolicy>,
}

impl Default for PolicyTable {
    fn default() -> Self {
        let mut policies = HashMap::new();
        policies.insert(
            ErrorCategory::Connect,
            ErrorPolicy {
                notify: true,
                retryable: true,
                set_offline: true,
                severity_override: Some(Severity::Error),
            },
        );
        policies.insert(
            ErrorCategory::Status,
            ErrorPolicy {
                notify: true,
                ..ErrorPolicy::default()
            },
        );
        policies.insert(
            ErrorCategory::Command,
            ErrorPolicy {
                notify: true,
                retryable: true,
                ..ErrorPolicy::default()
            },
        );
        Self { policies }
    }
}

impl PolicyTable {
    /// Defaults with configured categories replaced wholesale
    pub fn with_overrides(overrides: &HashMap<String, ErrorPolicy>) -> Result<Self, InvalidErrorCode> {
        let mut table = Self::default();
        for (category, policy) in overrides {
            table.policies.insert(category.parse()?, *policy);
        }
        Ok(table)
    }

    pub fn get(&self, category: ErrorCategory) -> ErrorPolicy {
        self.policies.get(&category).copied().unwrap_or_default()
    }
}
