use thiserror::Error;

pub use crate::shared::models::ErrorKind;
use crate::shared::models::FAILURE_MARKER;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{0}")]
    Format(String),

    #[error("{0}")]
    Parameter(String),

    #[error("Unknown function tool called: '{0}'")]
    ToolNotFound(String),

    /// Fault raised while a tool ran. `kind` is the fault's own name, e.g.
    /// `ZeroDivisionError`.
    #[error("{kind}: {message}")]
    Execution { kind: String, message: String },

    #[error("{0}")]
    Service(String),

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Format(_) => ErrorKind::FormatError,
            EngineError::Parameter(_) => ErrorKind::ParameterError,
            EngineError::ToolNotFound(_) => ErrorKind::ToolNotFound,
            EngineError::Execution { .. } => ErrorKind::ExecutionError,
            EngineError::Service(_) | EngineError::Request(_) | EngineError::Json(_) => {
                ErrorKind::ServiceError
            }
        }
    }

    /// Name printed under `--- Error Type ---`.
    pub fn type_label(&self) -> String {
        match self {
            EngineError::Execution { kind, .. } => kind.clone(),
            other => other.kind().as_str().to_string(),
        }
    }

    pub fn message(&self) -> String {
        match self {
            EngineError::Execution { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Text handed back to the model when a tool call fails.
    pub fn failure_text(&self) -> String {
        failure_block(&self.type_label(), &self.message())
    }
}

pub fn failure_block(type_label: &str, message: &str) -> String {
    format!(
        "--- {FAILURE_MARKER} ---\n--- Error Type ---\n{type_label}\n--- Error Message ---\n{message}"
    )
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_text_carries_marker_kind_and_message() {
        let err = EngineError::Format("Invalid function call format.".to_string());
        assert_eq!(
            err.failure_text(),
            "--- Execution Failed ---\n--- Error Type ---\nFormatError\n--- Error Message ---\nInvalid function call format."
        );
    }

    #[test]
    fn execution_faults_report_their_own_kind() {
        let err = EngineError::Execution {
            kind: "ZeroDivisionError".to_string(),
            message: "division by zero".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::ExecutionError);
        let text = err.failure_text();
        assert!(text.contains(FAILURE_MARKER));
        assert!(text.contains("ZeroDivisionError"));
        assert!(text.contains("division by zero"));
    }

    #[test]
    fn unknown_tool_names_the_tool() {
        let err = EngineError::ToolNotFound("fly".to_string());
        assert_eq!(err.kind(), ErrorKind::ToolNotFound);
        assert!(err.failure_text().contains("'fly'"));
    }
}
