//! User-visible failure report.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Failure report surfaced to the operator.
///
/// `message` is what the editor shows in its error dialog; `details` is
/// optional secondary text (shown expanded or logged). A report with an empty
/// message is not user-visible.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub details: String,
}

impl ErrorInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: String::new(),
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }

    pub fn is_user_visible(&self) -> bool {
        !self.message.trim().is_empty()
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.details.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{} ({})", self.message, self.details)
        }
    }
}

impl std::error::Error for ErrorInfo {}
