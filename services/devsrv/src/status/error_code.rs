//! Structured error codes: `DOMAIN.DEVICEKEY.CATEGORY.DETAIL`

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Domain used for every code raised by this service
pub const DEVICE_DOMAIN: &str = "DEVICE";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid error code '{0}'")]
pub struct InvalidErrorCode(pub String);

/// Policy category of a code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorCategory {
    Status,
    Command,
    Connect,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Status => "STATUS",
            ErrorCategory::Command => "COMMAND",
            ErrorCategory::Connect => "CONNECT",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCategory {
    type Err = InvalidErrorCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "STATUS" => Ok(ErrorCategory::Status),
            "COMMAND" => Ok(ErrorCategory::Command),
            "CONNECT" => Ok(ErrorCategory::Connect),
            _ => Err(InvalidErrorCode(format!("unknown category {s}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ErrorCode {
    domain: String,
    device_key: String,
    category: ErrorCategory,
    detail: String,
}

impl ErrorCode {
    pub fn new(
        domain: impl Into<String>,
        device_key: impl Into<String>,
        category: ErrorCategory,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            device_key: device_key.into(),
            category,
            detail: detail.into(),
        }
    }

    /// Code in the `DEVICE` domain
    pub fn device(device_key: impl Into<String>, category: ErrorCategory, detail: impl Into<String>) -> Self {
        Self::new(DEVICE_DOMAIN, device_key, category, detail)
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn device_key(&self) -> &str {
        &self.device_key
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }

    /// `CATEGORY.DETAIL`, the device-independent part
    pub fn short(&self) -> String {
        format!("{}.{}", self.category, self.detail)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.domain, self.device_key, self.category, self.detail
        )
    }
}

impl FromStr for ErrorCode {
    type Err = InvalidErrorCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 4 || parts.iter().any(|p| p.trim().is_empty()) {
            return Err(InvalidErrorCode(s.to_string()));
        }
        let category = parts[2]
            .parse()
            .map_err(|_| InvalidErrorCode(s.to_string()))?;
        Ok(Self::new(parts[0], parts[1], category, parts[3]))
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> Self {
        code.to_string()
    }
}

impl TryFrom<String> for ErrorCode {
    type Error = InvalidErrorCode;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
