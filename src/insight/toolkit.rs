use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::NaiveDate;
use tracing::{debug, info, warn};

use super::chart::{validate_chart, ChartRequest};
use super::collaborators::{AnomalyScanner, DataAccess, ReportGenerator};
use super::command::{parse_arguments, split_call};
use super::error::{EngineError, Result};
use super::executors::{run_python_snippet, ExecutorContext};
use crate::shared::models::{ErrorKind, ToolCallRequest, ToolInvocation, ToolResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    RunCode,
    GetDailyReport,
    CheckForAnomalies,
    DisplayChart,
}

#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub required: bool,
    pub description: &'static str,
}

const RUN_CODE_PARAMS: &[ParamSpec] = &[ParamSpec {
    name: "code_string",
    aliases: &["code"],
    required: true,
    description: "Python source to execute. Quote it with ''' when it spans several lines.",
}];

const DAILY_REPORT_PARAMS: &[ParamSpec] = &[ParamSpec {
    name: "report_date",
    aliases: &["date"],
    required: false,
    description: "Day to report on as YYYY-MM-DD. Omit it for the most recent day with data.",
}];

const DISPLAY_CHART_PARAMS: &[ParamSpec] = &[
    ParamSpec {
        name: "chart_type",
        aliases: &["type"],
        required: true,
        description: "'bar' or 'line'.",
    },
    ParamSpec {
        name: "chart_data",
        aliases: &["data"],
        required: true,
        description: "JSON object string: {\"labels\": [...], \"data\": [...]} or {\"labels\": [...], \"datasets\": [{\"label\": ..., \"data\": [...]}]}.",
    },
    ParamSpec {
        name: "title",
        aliases: &[],
        required: false,
        description: "Chart title. Defaults to 'Sales Data'.",
    },
    ParamSpec {
        name: "x_label",
        aliases: &[],
        required: false,
        description: "Label for the X axis.",
    },
    ParamSpec {
        name: "y_label",
        aliases: &[],
        required: false,
        description: "Label for the Y axis.",
    },
];

impl ToolKind {
    pub const ALL: [ToolKind; 4] = [
        ToolKind::RunCode,
        ToolKind::GetDailyReport,
        ToolKind::CheckForAnomalies,
        ToolKind::DisplayChart,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ToolKind::RunCode => "run_code",
            ToolKind::GetDailyReport => "get_daily_report",
            ToolKind::CheckForAnomalies => "check_for_anomalies",
            ToolKind::DisplayChart => "display_chart",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ToolKind::RunCode => {
                "Executes Python code to calculate figures or pull specific data points. Pre-loaded for direct use: \
                 `loader` (`loader.tables()`, `loader.query(table, start_date=None, end_date=None)`, `loader.get_<table>()`), \
                 `get_user_id()`, `json`, `math`, `datetime`, `date`, `timedelta`, `timezone` and a `stderr` stream. \
                 Rows come back as a list of dicts already scoped to the current user. Only a small set of standard \
                 modules may be imported; files, processes, networking and plotting libraries are unavailable. \
                 Output MUST be printed with print(). For chart data, print a valid JSON string."
            }
            ToolKind::GetDailyReport => {
                "Builds the daily sales report (orders, sales, average order value, day-over-day change and a \
                 recent sales trend). Future or invalid dates fall back to the most recent day with data; the \
                 report says which date it actually covers in `effective_report_date`."
            }
            ToolKind::CheckForAnomalies => {
                "Scans for unusual business signals such as a day-over-day sales drop or low stock. Returns a \
                 JSON list of findings, empty when nothing stands out."
            }
            ToolKind::DisplayChart => {
                "Asks the user interface to render a chart. Use it together with ANSWER: once the chart data is \
                 known, usually computed with run_code first."
            }
        }
    }

    pub fn params(&self) -> &'static [ParamSpec] {
        match self {
            ToolKind::RunCode => RUN_CODE_PARAMS,
            ToolKind::GetDailyReport => DAILY_REPORT_PARAMS,
            ToolKind::CheckForAnomalies => &[],
            ToolKind::DisplayChart => DISPLAY_CHART_PARAMS,
        }
    }

    fn example(&self) -> &'static str {
        match self {
            ToolKind::RunCode => {
                "CALL_FUNCTION: run_code(code_string='''rows = loader.get_transaction_data()\nprint(len(rows))''')"
            }
            ToolKind::GetDailyReport => "CALL_FUNCTION: get_daily_report(report_date='2024-05-01')",
            ToolKind::CheckForAnomalies => "CALL_FUNCTION: check_for_anomalies()",
            ToolKind::DisplayChart => {
                "CALL_FUNCTION: display_chart(chart_type='bar', chart_data='{\"labels\": [\"Mon\", \"Tue\"], \"data\": [5, 7]}', title='Orders per day')"
            }
        }
    }
}

/// Arguments after alias resolution, keyed by canonical parameter name.
struct ToolArgs(BTreeMap<&'static str, String>);

impl ToolArgs {
    fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    fn require(&self, name: &str) -> Result<&str> {
        self.get(name)
            .ok_or_else(|| EngineError::Parameter(format!("Missing required argument '{name}'")))
    }
}

pub struct ToolCatalog {
    registry: HashMap<&'static str, ToolKind>,
    data: Arc<dyn DataAccess>,
    reports: Arc<dyn ReportGenerator>,
    anomalies: Arc<dyn AnomalyScanner>,
}

impl ToolCatalog {
    pub fn new(
        data: Arc<dyn DataAccess>,
        reports: Arc<dyn ReportGenerator>,
        anomalies: Arc<dyn AnomalyScanner>,
    ) -> Self {
        let registry = ToolKind::ALL.into_iter().map(|kind| (kind.name(), kind)).collect();
        Self {
            registry,
            data,
            reports,
            anomalies,
        }
    }

    pub fn known_tools(&self) -> Vec<&'static str> {
        ToolKind::ALL.iter().map(ToolKind::name).collect()
    }

    pub fn has(&self, name: &str) -> bool {
        self.resolve(name).is_ok()
    }

    pub fn data(&self) -> &Arc<dyn DataAccess> {
        &self.data
    }

    fn resolve(&self, name: &str) -> Result<ToolKind> {
        self.registry
            .get(name.trim().to_ascii_lowercase().as_str())
            .copied()
            .ok_or_else(|| EngineError::ToolNotFound(name.to_string()))
    }

    pub fn command_catalog_prompt(&self) -> String {
        let mut guide = String::from("Available tools\n\n");
        guide.push_str("Call at most one tool per response, written on its own line as `CALL_FUNCTION: name(arg='value', ...)`. Quote every argument value; use ''' for multi-line values. A failed call returns an 'Execution Failed' report you can correct and retry.\n\n");

        for kind in ToolKind::ALL {
            guide.push_str(&format!("### Tool: {}\n", kind.name()));
            guide.push_str(&format!("- {}\n", kind.description()));
            if kind.params().is_empty() {
                guide.push_str("- Parameters: none\n");
            } else {
                guide.push_str("- Parameters:\n");
                for param in kind.params() {
                    let requirement = if param.required { "required" } else { "optional" };
                    guide.push_str(&format!(
                        "  - `{}` ({}): {}\n",
                        param.name, requirement, param.description
                    ));
                }
            }
            guide.push_str(&format!("- Example: {}\n\n", kind.example()));
        }
        guide
    }

    /// Parses and executes one tool call. Never fails: every problem is
    /// turned into a failure payload the model can read on its next turn.
    pub async fn dispatch(&self, subject_id: &str, call_text: &str) -> ToolInvocation {
        let mut request = match split_call(call_text) {
            Ok(request) => request,
            Err(err) => {
                warn!("Rejected tool call: {}", err);
                return ToolInvocation {
                    request: None,
                    result: ToolResult::failure(err.kind(), err.failure_text()),
                };
            }
        };

        info!("Dispatching tool '{}'", request.function_name);
        let result = match self.invoke(subject_id, &mut request).await {
            Ok(result) => result,
            Err(err) => {
                warn!("Tool '{}' failed: {}", request.function_name, err);
                ToolResult::failure(err.kind(), err.failure_text())
            }
        };

        ToolInvocation {
            request: Some(request),
            result,
        }
    }

    async fn invoke(&self, subject_id: &str, request: &mut ToolCallRequest) -> Result<ToolResult> {
        let kind = self.resolve(&request.function_name)?;
        request.parsed_arguments = parse_arguments(&request.raw_argument_text)?;
        let args = self.build_args(kind, &request.parsed_arguments)?;

        match kind {
            ToolKind::RunCode => {
                let code = args.require("code_string")?;
                let ctx = ExecutorContext::new(subject_id, Some(self.data.clone()));
                let outcome = run_python_snippet(&ctx, code).await?;
                let text = outcome.render();
                Ok(if outcome.succeeded() {
                    ToolResult::success(text)
                } else {
                    ToolResult::failure(ErrorKind::ExecutionError, text)
                })
            }
            ToolKind::GetDailyReport => {
                let report_date = args.get("report_date").and_then(parse_report_date);
                let report = self
                    .reports
                    .generate(subject_id, report_date)
                    .await
                    .map_err(|e| EngineError::Execution {
                        kind: "ReportError".to_string(),
                        message: e.to_string(),
                    })?;
                if let Some(message) = report.get("error").and_then(|e| e.as_str()) {
                    return Err(EngineError::Execution {
                        kind: "ReportError".to_string(),
                        message: message.to_string(),
                    });
                }
                Ok(ToolResult::success(serde_json::to_string(&report)?))
            }
            ToolKind::CheckForAnomalies => {
                let findings = self
                    .anomalies
                    .scan(subject_id)
                    .await
                    .map_err(|e| EngineError::Execution {
                        kind: "AnomalyScanError".to_string(),
                        message: e.to_string(),
                    })?;
                info!("Anomaly scan found {} finding(s)", findings.len());
                Ok(ToolResult::success(serde_json::to_string(&findings)?))
            }
            ToolKind::DisplayChart => {
                let chart = validate_chart(&ChartRequest {
                    chart_type: args.require("chart_type")?,
                    chart_data: args.require("chart_data")?,
                    title: args.get("title"),
                    x_label: args.get("x_label"),
                    y_label: args.get("y_label"),
                })?;
                let summary = format!(
                    "Chart ready: {} chart '{}'",
                    chart.chart_type().as_str(),
                    chart.payload.options.title
                );
                Ok(ToolResult::chart(summary, chart))
            }
        }
    }

    fn build_args(&self, kind: ToolKind, parsed: &BTreeMap<String, String>) -> Result<ToolArgs> {
        let mut resolved = BTreeMap::new();
        for param in kind.params() {
            let value = std::iter::once(param.name)
                .chain(param.aliases.iter().copied())
                .find_map(|key| parsed.get(key));
            match value {
                Some(value) => {
                    resolved.insert(param.name, value.clone());
                }
                None if param.required => {
                    return Err(EngineError::Parameter(format!(
                        "{}: missing required argument '{}'",
                        kind.name(),
                        param.name
                    )));
                }
                None => {}
            }
        }

        for key in parsed.keys() {
            let known = kind
                .params()
                .iter()
                .any(|p| p.name == key.as_str() || p.aliases.contains(&key.as_str()));
            if !known {
                debug!("Ignoring unexpected argument '{}' for {}", key, kind.name());
            }
        }
        Ok(ToolArgs(resolved))
    }
}

fn parse_report_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
        return None;
    }
    match NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        Ok(date) => Some(date),
        Err(_) => {
            warn!("Invalid report_date '{}', using the most recent day with data", trimmed);
            None
        }
    }
}
