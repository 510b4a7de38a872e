use serde_json::Value;

use super::error::{EngineError, Result};
use crate::shared::models::{ChartCommand, ChartOptions, ChartType};

#[derive(Debug, Clone, Default)]
pub struct ChartRequest<'a> {
    pub chart_type: &'a str,
    pub chart_data: &'a str,
    pub title: Option<&'a str>,
    pub x_label: Option<&'a str>,
    pub y_label: Option<&'a str>,
}

/// Checks a `display_chart` request and wraps it into a [`ChartCommand`].
///
/// `chart_data` must be a JSON object with a `labels` array and either a
/// `data` array or a `datasets` array whose entries each carry a `data` array.
pub fn validate_chart(request: &ChartRequest<'_>) -> Result<ChartCommand> {
    let chart_type = ChartType::parse(request.chart_type).ok_or_else(|| {
        EngineError::Parameter(format!(
            "Unsupported chart_type '{}'. Supported types: {}",
            request.chart_type.trim(),
            ChartType::SUPPORTED.map(|t| t.as_str()).join(", ")
        ))
    })?;

    let chart_data: Value = serde_json::from_str(request.chart_data.trim())
        .map_err(|e| EngineError::Parameter(format!("chart_data is not valid JSON: {e}")))?;
    check_chart_data(&chart_data)?;

    let mut options = ChartOptions::default();
    if let Some(title) = non_blank(request.title) {
        options.title = title;
    }
    options.x_label = non_blank(request.x_label);
    options.y_label = non_blank(request.y_label);

    Ok(ChartCommand::new(chart_type, chart_data, options))
}

fn check_chart_data(chart_data: &Value) -> Result<()> {
    let object = chart_data.as_object().ok_or_else(|| {
        EngineError::Parameter("chart_data must be a JSON object with 'labels'".to_string())
    })?;

    match object.get("labels") {
        Some(Value::Array(_)) => {}
        Some(_) => {
            return Err(EngineError::Parameter(
                "chart_data 'labels' must be a list".to_string(),
            ))
        }
        None => {
            return Err(EngineError::Parameter(
                "chart_data is missing the 'labels' key".to_string(),
            ))
        }
    }

    if let Some(data) = object.get("data") {
        return if data.is_array() {
            Ok(())
        } else {
            Err(EngineError::Parameter(
                "chart_data 'data' must be a list".to_string(),
            ))
        };
    }

    match object.get("datasets") {
        Some(Value::Array(datasets)) => {
            for (idx, dataset) in datasets.iter().enumerate() {
                let has_data = dataset
                    .get("data")
                    .map(Value::is_array)
                    .unwrap_or(false);
                if !has_data {
                    return Err(EngineError::Parameter(format!(
                        "chart_data datasets[{idx}] must be an object with a 'data' list"
                    )));
                }
            }
            Ok(())
        }
        Some(_) => Err(EngineError::Parameter(
            "chart_data 'datasets' must be a list".to_string(),
        )),
        None => Err(EngineError::Parameter(
            "chart_data needs either 'data' or 'datasets' alongside 'labels'".to_string(),
        )),
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::models::ErrorKind;
    use serde_json::json;

    fn request<'a>(chart_type: &'a str, chart_data: &'a str) -> ChartRequest<'a> {
        ChartRequest {
            chart_type,
            chart_data,
            ..Default::default()
        }
    }

    #[test]
    fn flat_data_is_accepted_with_default_title() {
        let chart = validate_chart(&request("bar", r#"{"labels":["Mon"],"data":[5]}"#)).unwrap();
        assert_eq!(chart.chart_type(), ChartType::Bar);
        assert_eq!(chart.payload.chart_data, json!({ "labels": ["Mon"], "data": [5] }));
        assert_eq!(chart.payload.options.title, "Sales Data");
        assert!(chart.payload.options.x_label.is_none());
    }

    #[test]
    fn datasets_are_accepted_with_labels() {
        let data = r#"{"labels":["Mon","Tue"],"datasets":[{"label":"Sales","data":[5,7]}]}"#;
        let chart = validate_chart(&ChartRequest {
            title: Some("Week"),
            x_label: Some("Day"),
            y_label: Some(" "),
            ..request("LINE", data)
        })
        .unwrap();
        assert_eq!(chart.chart_type(), ChartType::Line);
        assert_eq!(chart.payload.options.title, "Week");
        assert_eq!(chart.payload.options.x_label.as_deref(), Some("Day"));
        assert!(chart.payload.options.y_label.is_none());
    }

    #[test]
    fn missing_labels_is_parameter_error() {
        let err = validate_chart(&request("bar", r#"{"data":[1,2,3]}"#)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParameterError);
        assert!(err.to_string().contains("labels"));
    }

    #[test]
    fn labels_without_series_is_parameter_error() {
        let err = validate_chart(&request("bar", r#"{"labels":["a"]}"#)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParameterError);
    }

    #[test]
    fn dataset_without_data_is_parameter_error() {
        let err = validate_chart(&request("bar", r#"{"labels":["a"],"datasets":[{"label":"x"}]}"#))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParameterError);
    }

    #[test]
    fn unsupported_type_and_bad_json_are_parameter_errors() {
        let err = validate_chart(&request("pie", r#"{"labels":[],"data":[]}"#)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParameterError);
        let err = validate_chart(&request("bar", "{labels: [1]")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParameterError);
    }
}
