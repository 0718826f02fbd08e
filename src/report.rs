//! Human-readable console output: the configuration dump printed at start-up
//! and the final metrics table.

use serde_yaml::Value;

use crate::{config::Config, pipelines::text_classification::Snapshot};

/// Width of the rule framing the configuration dump
const RULE_WIDTH: usize = 40;

/// Render every configuration key, nested sections indented with tabs, between two rules
pub fn config_dump(config: &Config) -> anyhow::Result<String> {
    let value = serde_yaml::to_value(config)
        .map_err(|e| anyhow!("Unable to serialize the configuration: {}", e))?;

    let rule = "*".repeat(RULE_WIDTH);
    let mut lines = vec![rule.clone()];
    dump_value(&value, 0, &mut lines);
    lines.push(rule);

    Ok(lines.join("\n"))
}

fn dump_value(value: &Value, depth: usize, lines: &mut Vec<String>) {
    let Value::Mapping(mapping) = value else {
        return;
    };

    let indent = "\t".repeat(depth);

    for (key, value) in mapping {
        let key = scalar(key);
        match value {
            Value::Mapping(_) => {
                lines.push(format!("{indent}{key}:"));
                dump_value(value, depth + 1, lines);
            }
            other => lines.push(format!("{indent}{key}: {}", scalar(other))),
        }
    }
}

fn scalar(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

/// Render a snapshot as a grid table with `Metric` and `Value` columns, values
/// to four decimal places
pub fn metrics_table(snapshot: &Snapshot) -> String {
    let rows: Vec<(String, String)> = snapshot
        .entries()
        .into_iter()
        .map(|(name, value)| (name, format!("{value:.4}")))
        .collect();

    grid(("Metric", "Value"), &rows)
}

fn grid(headers: (&str, &str), rows: &[(String, String)]) -> String {
    let left = rows
        .iter()
        .map(|(name, _)| name.chars().count())
        .chain([headers.0.chars().count()])
        .max()
        .unwrap_or_default();
    let right = rows
        .iter()
        .map(|(_, value)| value.chars().count())
        .chain([headers.1.chars().count()])
        .max()
        .unwrap_or_default();

    let border = |fill: char| {
        format!(
            "+{}+{}+",
            fill.to_string().repeat(left + 2),
            fill.to_string().repeat(right + 2)
        )
    };

    let mut lines = vec![
        border('-'),
        format!("| {:<left$} | {:<right$} |", headers.0, headers.1),
        border('='),
    ];

    for (name, value) in rows {
        lines.push(format!("| {name:<left$} | {value:>right$} |"));
        lines.push(border('-'));
    }

    lines.join("\n")
}
