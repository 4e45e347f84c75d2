//! The DSL-level error payload (spec §7), distinct from the Rust
//! `std::error::Error` types the engine raises internally.

use serde::{Deserialize, Serialize};

use crate::position::Position;

/// The eight error kinds a workflow step can raise, each with a default
/// status code and a fixed type URI suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Validation,
    Expression,
    Authentication,
    Authorization,
    Timeout,
    Communication,
    Runtime,
}

impl ErrorKind {
    /// The `https://serverlessworkflow.io/dsl/errors/types/<kind>` suffix.
    pub fn type_suffix(self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Validation => "validation",
            ErrorKind::Expression => "expression",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Authorization => "authorization",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Communication => "communication",
            ErrorKind::Runtime => "runtime",
        }
    }

    /// The status code a `WorkflowError` of this kind carries unless the
    /// task that raised it overrides it explicitly.
    pub fn default_status(self) -> u16 {
        match self {
            ErrorKind::Configuration => 400,
            ErrorKind::Validation => 400,
            ErrorKind::Expression => 400,
            ErrorKind::Authentication => 401,
            ErrorKind::Authorization => 403,
            ErrorKind::Timeout => 408,
            ErrorKind::Communication => 500,
            ErrorKind::Runtime => 500,
        }
    }

    /// Matches the `kind` string a `retry.except.errors.with` or catch
    /// filter compares against (`RetryPolicy::should_retry` uses the same
    /// strings).
    pub fn as_str(self) -> &'static str {
        self.type_suffix()
    }
}

/// The error document a task raises, catches, or completes with. Mirrors
/// the Problem Details shape (`type`/`title`/`status`/`detail`/`instance`)
/// spec §7 specifies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowError {
    /// `https://serverlessworkflow.io/dsl/errors/types/<kind>`
    #[serde(rename = "type")]
    pub error_type: String,

    pub kind: ErrorKind,

    pub title: String,

    pub status: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    /// JSON Pointer to the task that raised the error, rendered from a
    /// [`Position`] at construction time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

impl WorkflowError {
    pub fn new(kind: ErrorKind, title: impl Into<String>) -> Self {
        Self {
            error_type: format!(
                "https://serverlessworkflow.io/dsl/errors/types/{}",
                kind.type_suffix()
            ),
            status: kind.default_status(),
            kind,
            title: title.into(),
            detail: None,
            instance: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn at(mut self, position: &Position) -> Self {
        self.instance = Some(position.to_pointer());
        self
    }

    pub fn configuration(title: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, title)
    }

    pub fn validation(title: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, title)
    }

    pub fn expression(title: impl Into<String>) -> Self {
        Self::new(ErrorKind::Expression, title)
    }

    pub fn authentication(title: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authentication, title)
    }

    pub fn authorization(title: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authorization, title)
    }

    pub fn timeout(title: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, title)
    }

    pub fn communication(title: impl Into<String>) -> Self {
        Self::new(ErrorKind::Communication, title)
    }

    pub fn runtime(title: impl Into<String>) -> Self {
        Self::new(ErrorKind::Runtime, title)
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.title, self.status, self.error_type)
    }
}

impl std::error::Error for WorkflowError {}
