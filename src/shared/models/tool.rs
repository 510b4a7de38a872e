use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::chart::ChartCommand;

/// Substring present in every failed tool payload. The conversation loop keys
/// off it to treat the result as recoverable input for the next turn.
pub const FAILURE_MARKER: &str = "Execution Failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    FormatError,
    ParameterError,
    ToolNotFound,
    ExecutionError,
    ServiceError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::FormatError => "FormatError",
            ErrorKind::ParameterError => "ParameterError",
            ErrorKind::ToolNotFound => "ToolNotFound",
            ErrorKind::ExecutionError => "ExecutionError",
            ErrorKind::ServiceError => "ServiceError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub function_name: String,
    pub raw_argument_text: String,
    pub parsed_arguments: BTreeMap<String, String>,
}

impl ToolCallRequest {
    pub fn argument(&self, name: &str) -> Option<&str> {
        self.parsed_arguments.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResult {
    pub succeeded: bool,
    pub output_text: String,
    pub error_kind: Option<ErrorKind>,
    /// Set only by `display_chart` on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chart_command: Option<ChartCommand>,
}

impl ToolResult {
    pub fn success(output_text: impl Into<String>) -> Self {
        Self {
            succeeded: true,
            output_text: output_text.into(),
            error_kind: None,
            chart_command: None,
        }
    }

    pub fn failure(error_kind: ErrorKind, output_text: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            output_text: output_text.into(),
            error_kind: Some(error_kind),
            chart_command: None,
        }
    }

    pub fn chart(output_text: impl Into<String>, chart_command: ChartCommand) -> Self {
        Self {
            chart_command: Some(chart_command),
            ..Self::success(output_text)
        }
    }
}

/// What the dispatcher saw and produced for one tool call. `request` is absent
/// when the fragment could not be parsed at all.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub request: Option<ToolCallRequest>,
    pub result: ToolResult,
}
