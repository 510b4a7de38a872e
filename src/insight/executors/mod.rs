pub mod python;

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use super::collaborators::DataAccess;
use super::error::{EngineError, Result};
use crate::shared::models::FAILURE_MARKER;

const MAX_STREAM_CHARS: usize = 8_192;
const NO_STDOUT: &str = "[No stdout]";
const NO_STDERR: &str = "[No stderr]";

/// Outcome of one snippet. `exception_kind` is set when the snippet raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exception_kind: Option<String>,
    pub exception_message: Option<String>,
}

impl SandboxExecutionResult {
    pub fn completed(stdout: String, stderr: String) -> Self {
        Self {
            stdout,
            stderr,
            exception_kind: None,
            exception_message: None,
        }
    }

    pub fn faulted(stdout: String, stderr: String, kind: String, message: String) -> Self {
        Self {
            stdout,
            stderr,
            exception_kind: Some(kind),
            exception_message: Some(message),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exception_kind.is_none()
    }

    /// Text fed back to the model.
    pub fn render(&self) -> String {
        let stdout = clip(&self.stdout);
        let stderr = clip(&self.stderr);

        match (&self.exception_kind, &self.exception_message) {
            (None, _) => format!(
                "--- Execution Result ---\n--- stdout ---\n{}\n--- stderr ---\n{}",
                or_marker(&stdout, NO_STDOUT),
                or_marker(&stderr, NO_STDERR)
            ),
            (Some(kind), message) => {
                let mut text = format!("--- {FAILURE_MARKER} ---");
                if !stdout.is_empty() {
                    text.push_str(&format!("\n--- stdout (before error) ---\n{stdout}"));
                }
                if !stderr.is_empty() {
                    text.push_str(&format!("\n--- stderr (before error) ---\n{stderr}"));
                }
                text.push_str(&format!(
                    "\n--- Error Type ---\n{kind}\n--- Error Message ---\n{}",
                    message.as_deref().unwrap_or_default()
                ));
                text
            }
        }
    }
}

/// Per-call context handed to the sandbox.
#[derive(Clone)]
pub struct ExecutorContext {
    pub subject_id: String,
    pub data: Option<Arc<dyn DataAccess>>,
}

impl ExecutorContext {
    pub fn new(subject_id: impl Into<String>, data: Option<Arc<dyn DataAccess>>) -> Self {
        Self {
            subject_id: subject_id.into(),
            data,
        }
    }
}

/// Runs a snippet on the blocking pool. Each call gets its own interpreter.
pub async fn run_python_snippet(ctx: &ExecutorContext, code: &str) -> Result<SandboxExecutionResult> {
    if code.trim().is_empty() {
        return Err(EngineError::Parameter(
            "run_code: Extracted code_string is empty after processing.".to_string(),
        ));
    }

    let code = code.to_string();
    let subject_id = ctx.subject_id.clone();
    let data = ctx.data.clone();
    let outcome =
        tokio::task::spawn_blocking(move || python::execute_snippet(&code, &subject_id, data))
            .await
            .map_err(|e| EngineError::Execution {
                kind: "SandboxPanic".to_string(),
                message: format!("Sandbox worker stopped unexpectedly: {e}"),
            })?;

    match &outcome.exception_kind {
        None => info!(
            "run_code completed (stdout {} chars, stderr {} chars)",
            outcome.stdout.len(),
            outcome.stderr.len()
        ),
        Some(kind) => warn!("run_code raised {}", kind),
    }
    Ok(outcome)
}

fn or_marker<'a>(text: &'a str, marker: &'a str) -> &'a str {
    if text.is_empty() {
        marker
    } else {
        text
    }
}

fn clip(value: &str) -> String {
    let trimmed = value.trim();
    let mut iter = trimmed.chars();
    let mut collected: String = iter.by_ref().take(MAX_STREAM_CHARS).collect();
    if iter.next().is_some() {
        collected.push_str("\n...[truncated]");
    }
    collected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insight::collaborators::data_store::{rows_from_json, TableStore};
    use serde_json::json;

    fn ctx() -> ExecutorContext {
        ExecutorContext::new("m1", None)
    }

    #[tokio::test]
    async fn prints_are_captured() {
        let outcome = run_python_snippet(&ctx(), "print(1+1)").await.unwrap();
        assert!(outcome.succeeded());
        assert_eq!(outcome.stdout.trim(), "2");
        assert_eq!(
            outcome.render(),
            "--- Execution Result ---\n--- stdout ---\n2\n--- stderr ---\n[No stderr]"
        );
    }

    #[tokio::test]
    async fn stderr_is_a_separate_channel() {
        let outcome = run_python_snippet(&ctx(), "print('warn', file=stderr)\nprint('ok')")
            .await
            .unwrap();
        assert_eq!(outcome.stdout.trim(), "ok");
        assert_eq!(outcome.stderr.trim(), "warn");
    }

    #[tokio::test]
    async fn bindings_do_not_survive_between_calls() {
        let first = run_python_snippet(&ctx(), "leak = 41\nprint(leak + 1)").await.unwrap();
        assert!(first.succeeded());

        let second = run_python_snippet(&ctx(), "print(leak)").await.unwrap();
        assert!(!second.succeeded());
        assert_eq!(second.exception_kind.as_deref(), Some("NameError"));
    }

    #[tokio::test]
    async fn faults_keep_partial_output() {
        let outcome = run_python_snippet(&ctx(), "print('before')\nx = 1 / 0")
            .await
            .unwrap();
        assert_eq!(outcome.exception_kind.as_deref(), Some("ZeroDivisionError"));
        let text = outcome.render();
        assert!(text.starts_with("--- Execution Failed ---"));
        assert!(text.contains("--- stdout (before error) ---\nbefore"));
        assert!(text.contains("--- Error Type ---\nZeroDivisionError"));
    }

    #[tokio::test]
    async fn syntax_errors_are_reported_not_raised() {
        let outcome = run_python_snippet(&ctx(), "def broken(:\n    pass").await.unwrap();
        assert_eq!(outcome.exception_kind.as_deref(), Some("SyntaxError"));
    }

    #[tokio::test]
    async fn blocked_imports_and_builtins_fail() {
        for snippet in ["import subprocess", "import socket", "open('/etc/passwd')", "eval('1')"] {
            let outcome = run_python_snippet(&ctx(), snippet).await.unwrap();
            assert!(!outcome.succeeded(), "{snippet} should fail");
        }
    }

    #[tokio::test]
    async fn allowed_helpers_are_available() {
        let code = "import collections\nprint(json.dumps({'m': collections.Counter('aab')['a']}))\nprint(math.floor(2.7))\nprint((date(2024, 5, 2) - timedelta(days=1)).isoformat())";
        let outcome = run_python_snippet(&ctx(), code).await.unwrap();
        assert!(outcome.succeeded(), "{:?}", outcome);
        let lines: Vec<&str> = outcome.stdout.lines().collect();
        assert_eq!(lines, vec![r#"{"m": 2}"#, "2", "2024-05-01"]);
    }

    #[tokio::test]
    async fn every_allowed_module_imports_and_library_code_still_works() {
        let mut code = String::new();
        for module in python::ALLOWED_MODULES {
            code.push_str(&format!("import {module}\nprint('{module}')\n"));
        }
        code.push_str("print(datetime.strptime('2024-05-01', '%Y-%m-%d').date().isoformat())\n");
        code.push_str("Point = collections.namedtuple('Point', 'x y')\nprint(Point(1, 2).y)\n");
        code.push_str("print(statistics.mean([1, 2, 3]))\n");

        let outcome = run_python_snippet(&ctx(), &code).await.unwrap();
        assert!(outcome.succeeded(), "{:?}", outcome);
        let lines: Vec<&str> = outcome.stdout.lines().collect();
        let mut expected: Vec<&str> = python::ALLOWED_MODULES.to_vec();
        expected.extend(["2024-05-01", "2", "2"]);
        assert_eq!(lines, expected);
    }

    #[tokio::test]
    async fn guarded_builtins_stay_hidden_from_snippets() {
        for snippet in ["exec('x = 1')", "compile('1', '<s>', 'eval')", "f = eval\nf('1')"] {
            let outcome = run_python_snippet(&ctx(), snippet).await.unwrap();
            assert_eq!(outcome.exception_kind.as_deref(), Some("NameError"), "{snippet}");
        }
    }

    #[tokio::test]
    async fn loader_and_subject_are_scoped_to_the_call() {
        let mut store = TableStore::new("merchant_id");
        store.insert_table(
            "transaction_data",
            rows_from_json(json!([
                { "merchant_id": "m1", "order_time": "2024-05-01T09:00:00Z", "total_amount": 10 },
                { "merchant_id": "m1", "order_time": "2024-05-02T09:00:00Z", "total_amount": 5 },
                { "merchant_id": "m2", "order_time": "2024-05-01T09:00:00Z", "total_amount": 99 }
            ])),
            None,
        );
        let ctx = ExecutorContext::new("m1", Some(Arc::new(store)));
        let code = "rows = loader.get_transaction_data_df(merchant_id=get_user_id())\nprint(get_user_id(), len(rows), sum(r['total_amount'] for r in rows))\nprint(len(loader.query('transaction_data', start_date='2024-05-02')))";

        let outcome = run_python_snippet(&ctx, code).await.unwrap();
        assert!(outcome.succeeded(), "{:?}", outcome);
        let lines: Vec<&str> = outcome.stdout.lines().collect();
        assert_eq!(lines, vec!["m1 2 15", "1"]);
    }

    #[tokio::test]
    async fn empty_code_is_a_parameter_error() {
        let err = run_python_snippet(&ctx(), "   \n").await.unwrap_err();
        assert!(matches!(err, EngineError::Parameter(_)));
    }
}
