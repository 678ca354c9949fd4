//! Status snapshot types
//!
//! Snapshots are values. Builders consume and return a new snapshot; nothing
//! is mutated after it has been handed to the pipeline.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error_code::ErrorCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Health {
    Online,
    Offline,
}

/// Source of an alert; alerts of different scopes never overwrite each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertScope {
    Connection,
    Status,
    Command,
}

impl fmt::Display for AlertScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertScope::Connection => write!(f, "connection"),
            AlertScope::Status => write!(f, "status"),
            AlertScope::Command => write!(f, "command"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn is_error(&self) -> bool {
        *self >= Severity::Error
    }
}

/// Dedup key of an alert
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AlertKey {
    pub scope: AlertScope,
    pub code: String,
}

impl fmt::Display for AlertKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope, self.code)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    /// Raw code text as raised
    pub code: String,
    /// Parsed form, when the raw text is a valid code
    pub error_code: Option<ErrorCode>,
    pub severity: Severity,
    pub message: String,
    pub notify: bool,
    /// Keeps the device Offline for as long as the alert stays stored
    #[serde(default)]
    pub forces_offline: bool,
    pub scope: AlertScope,
    pub timestamp: DateTime<Utc>,
}

impl StatusEvent {
    pub fn new(code: ErrorCode, severity: Severity, message: impl Into<String>, scope: AlertScope) -> Self {
        Self {
            code: code.to_string(),
            error_code: Some(code),
            severity,
            message: message.into(),
            notify: false,
            forces_offline: false,
            scope,
            timestamp: Utc::now(),
        }
    }

    /// Alert from free-form code text; parsed later by the pipeline
    pub fn raw(code: impl Into<String>, severity: Severity, message: impl Into<String>, scope: AlertScope) -> Self {
        Self {
            code: code.into(),
            error_code: None,
            severity,
            message: message.into(),
            notify: false,
            forces_offline: false,
            scope,
            timestamp: Utc::now(),
        }
    }

    pub fn key(&self) -> AlertKey {
        AlertKey {
            scope: self.scope,
            code: self.code.clone(),
        }
    }

    pub fn with_error_code(mut self, code: ErrorCode) -> Self {
        self.code = code.to_string();
        self.error_code = Some(code);
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_notify(mut self, notify: bool) -> Self {
        self.notify = notify;
        self
    }

    pub fn with_forces_offline(mut self, forces_offline: bool) -> Self {
        self.forces_offline = forces_offline;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub name: String,
    pub model: String,
    pub health: Health,
    pub alerts: Vec<StatusEvent>,
    /// Which scope's alerts this snapshot replaces
    pub scope: AlertScope,
    pub timestamp: DateTime<Utc>,
}

impl StatusSnapshot {
    pub fn new(name: impl Into<String>, model: impl Into<String>, health: Health, scope: AlertScope) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            health,
            alerts: Vec::new(),
            scope,
            timestamp: Utc::now(),
        }
    }

    pub fn online(name: impl Into<String>, model: impl Into<String>, scope: AlertScope) -> Self {
        Self::new(name, model, Health::Online, scope)
    }

    pub fn offline(name: impl Into<String>, model: impl Into<String>, scope: AlertScope) -> Self {
        Self::new(name, model, Health::Offline, scope)
    }

    pub fn with_health(mut self, health: Health) -> Self {
        self.health = health;
        self
    }

    pub fn with_alert(mut self, alert: StatusEvent) -> Self {
        self.alerts.push(alert);
        self
    }

    pub fn with_alerts(mut self, alerts: impl IntoIterator<Item = StatusEvent>) -> Self {
        self.alerts.extend(alerts);
        self
    }

    pub fn with_scope(mut self, scope: AlertScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn key_set(&self) -> BTreeSet<AlertKey> {
        self.alerts.iter().map(StatusEvent::key).collect()
    }

    pub fn is_online(&self) -> bool {
        self.health == Health::Online
    }

    /// Any alert at error severity or above
    pub fn has_error_alerts(&self) -> bool {
        self.alerts.iter().any(|a| a.severity.is_error())
    }
}
