// Presentation Blocks
// Typed answer blocks built from a composed result, chosen by intent

use crate::plan::models::Intent;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One renderable block of the final answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PresentationBlock {
    Text {
        text: String,
    },
    Table {
        title: String,
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
    },
    Chart {
        title: String,
        chart_type: String,
        series: Vec<ChartSeries>,
    },
    Network {
        title: String,
        nodes: Vec<Value>,
        edges: Vec<Value>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartSeries {
    pub name: String,
    pub points: Vec<ChartPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartPoint {
    pub label: String,
    pub value: f64,
}

impl PresentationBlock {
    pub fn text(text: impl Into<String>) -> Self {
        PresentationBlock::Text { text: text.into() }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PresentationBlock::Text { .. } => "text",
            PresentationBlock::Table { .. } => "table",
            PresentationBlock::Chart { .. } => "chart",
            PresentationBlock::Network { .. } => "network",
        }
    }
}

/// Rows of a tool result: `rows`, `items` or the value itself when it is a list
pub fn result_rows(value: &Value) -> &[Value] {
    match value {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => map
            .get("rows")
            .or_else(|| map.get("items"))
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]),
        _ => &[],
    }
}

/// Table over object rows; columns in first-seen key order
pub fn table_block(title: impl Into<String>, rows: &[Value]) -> Option<PresentationBlock> {
    let objects: Vec<&Map<String, Value>> = rows.iter().filter_map(Value::as_object).collect();
    if objects.is_empty() {
        return None;
    }

    let mut columns: Vec<String> = Vec::new();
    for object in &objects {
        for key in object.keys() {
            if !columns.contains(key) {
                columns.push(key.clone());
            }
        }
    }

    let rows = objects
        .iter()
        .map(|object| {
            columns
                .iter()
                .map(|c| object.get(c).cloned().unwrap_or(Value::Null))
                .collect()
        })
        .collect();

    Some(PresentationBlock::Table {
        title: title.into(),
        columns,
        rows,
    })
}

/// Chart of the first numeric column, labelled by the first string column
pub fn chart_block(
    title: impl Into<String>,
    chart_type: &str,
    rows: &[Value],
) -> Option<PresentationBlock> {
    let first = rows.iter().find_map(Value::as_object)?;
    let label_key = first
        .iter()
        .find(|(_, v)| v.is_string())
        .map(|(k, _)| k.clone())?;
    let value_key = first
        .iter()
        .find(|(_, v)| v.is_number())
        .map(|(k, _)| k.clone())?;

    let points: Vec<ChartPoint> = rows
        .iter()
        .filter_map(Value::as_object)
        .filter_map(|row| {
            let label = row.get(&label_key)?.as_str()?.to_string();
            let value = row.get(&value_key)?.as_f64()?;
            Some(ChartPoint { label, value })
        })
        .collect();

    if points.is_empty() {
        return None;
    }

    Some(PresentationBlock::Chart {
        title: title.into(),
        chart_type: chart_type.to_string(),
        series: vec![ChartSeries {
            name: value_key,
            points,
        }],
    })
}

/// Network from a graph result carrying `nodes` and `edges`
pub fn network_block(title: impl Into<String>, value: &Value) -> Option<PresentationBlock> {
    let nodes = value.get("nodes").and_then(Value::as_array)?;
    if nodes.is_empty() {
        return None;
    }
    let edges = value
        .get("edges")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    Some(PresentationBlock::Network {
        title: title.into(),
        nodes: nodes.clone(),
        edges,
    })
}

/// Blocks for a composed result, by intent. Empty when nothing is presentable.
pub fn build_blocks(intent: Option<Intent>, composed: &Value) -> Vec<PresentationBlock> {
    let primary = composed.get("primary_result").unwrap_or(&Value::Null);
    let rows = result_rows(primary);
    let mut blocks = Vec::new();

    match intent {
        Some(Intent::Aggregate) => {
            blocks.extend(chart_block("Distribution", "bar", rows));
            blocks.extend(table_block("Aggregate", rows));
        }
        Some(Intent::Metric) => {
            blocks.extend(chart_block("Metric", "line", rows));
            blocks.extend(table_block("Metric values", rows));
        }
        Some(Intent::Path) => {
            let paths = composed
                .get("path_results")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            for (i, path) in paths.iter().enumerate() {
                blocks.extend(network_block(format!("Path {}", i + 1), path));
            }
            if blocks.is_empty() {
                blocks.extend(network_block("Topology", primary));
            }
        }
        Some(Intent::History) => blocks.extend(table_block("Events", rows)),
        Some(Intent::Search) => blocks.extend(table_block("Documents", rows)),
        Some(Intent::Lookup) | None => blocks.extend(table_block("Results", rows)),
    }

    if !blocks.is_empty() {
        if let Some(summary) = composed
            .get("results_summary")
            .and_then(|s| s.get("text"))
            .and_then(Value::as_str)
        {
            blocks.insert(0, PresentationBlock::text(summary));
        }
    }

    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_table_columns_in_first_seen_order() {
        let rows = vec![
            json!({"ci_id": "a", "status": "up"}),
            json!({"ci_id": "b", "owner": "ops"}),
        ];
        let block = table_block("Results", &rows).unwrap();
        if let PresentationBlock::Table { columns, rows, .. } = block {
            assert_eq!(columns, vec!["ci_id", "status", "owner"]);
            assert_eq!(rows[1], vec![json!("b"), Value::Null, json!("ops")]);
        } else {
            panic!("wrong block type");
        }
    }

    #[test]
    fn test_aggregate_blocks() {
        let composed = json!({
            "primary_result": {"rows": [
                {"ci_type": "server", "count": 3},
                {"ci_type": "db", "count": 1}
            ]},
            "results_summary": {"text": "2 groups"}
        });
        let blocks = build_blocks(Some(Intent::Aggregate), &composed);
        let kinds: Vec<&str> = blocks.iter().map(PresentationBlock::kind).collect();
        assert_eq!(kinds, vec!["text", "chart", "table"]);
    }

    #[test]
    fn test_path_blocks_from_path_results() {
        let composed = json!({
            "primary_result": null,
            "path_results": [{"nodes": [{"id": "a"}, {"id": "b"}], "edges": [{"from": "a", "to": "b"}]}]
        });
        let blocks = build_blocks(Some(Intent::Path), &composed);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].kind(), "network");
    }

    #[test]
    fn test_nothing_presentable() {
        let blocks = build_blocks(Some(Intent::Lookup), &json!({"primary_result": {"rows": []}}));
        assert!(blocks.is_empty());
    }

    #[test]
    fn test_block_serialization_is_tagged() {
        let json = serde_json::to_value(PresentationBlock::text("hi")).unwrap();
        assert_eq!(json, json!({"type": "text", "text": "hi"}));
    }
}
