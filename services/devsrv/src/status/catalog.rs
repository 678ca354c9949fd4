//! Code to human message lookup, injected into the pipeline

use std::collections::HashMap;

use super::error_code::ErrorCode;

#[derive(Debug, Clone, Default)]
pub struct MessageCatalog {
    messages: HashMap<String, String>,
}

impl MessageCatalog {
    pub fn new(messages: HashMap<String, String>) -> Self {
        Self { messages }
    }

    pub fn insert(&mut self, key: impl Into<String>, message: impl Into<String>) {
        self.messages.insert(key.into(), message.into());
    }

    /// Exact code, then `CATEGORY.DETAIL`, then the alert's own message
    pub fn resolve(&self, raw_code: &str, code: Option<&ErrorCode>, own: &str) -> String {
        if let Some(message) = self.messages.get(raw_code) {
            return message.clone();
        }
        if let Some(message) = code.and_then(|c| self.messages.get(&c.short())) {
            return message.clone();
        }
        own.to_string()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
