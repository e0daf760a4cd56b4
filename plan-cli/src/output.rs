// Output formatting helpers for CLI commands

use plan_engine::PresentationBlock;
use serde_json::Value;

/// Print a status message: "  Status message"
pub fn status(action: &str, message: &str) {
    eprintln!("\x1b[1;36m{:>12}\x1b[0m {}", action, message);
}

/// Print a success message with checkmark
pub fn success(message: &str) {
    eprintln!("\x1b[1;32m  \u{2713}\x1b[0m {}", message);
}

/// Print a failure message with X
pub fn failure(message: &str) {
    eprintln!("\x1b[1;31m  \u{2717}\x1b[0m {}", message);
}

/// Print a check/pass item
pub fn check(message: &str) {
    eprintln!("\x1b[32m  \u{2713}\x1b[0m {}", message);
}

pub fn warning(message: &str) {
    eprintln!("\x1b[33m  !\x1b[0m {}", message);
}

pub fn error(message: &str) {
    eprintln!("\x1b[1;31merror:\x1b[0m {}", message);
}

pub fn info(message: &str) {
    eprintln!("\x1b[36m  i\x1b[0m {}", message);
}

pub fn dim(message: &str) {
    eprintln!("\x1b[2m{}\x1b[0m", message);
}

pub fn dim_success(message: &str) {
    eprintln!("\x1b[32m{}\x1b[0m", message);
}

pub fn dim_failure(message: &str) {
    eprintln!("\x1b[31m{}\x1b[0m", message);
}

/// Print a header line
pub fn header(message: &str) {
    eprintln!("\x1b[1m==> {}\x1b[0m", message);
}

fn cell(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "-".to_string(),
        other => other.to_string(),
    }
}

/// Render one presentation block to stdout
pub fn block(block: &PresentationBlock) {
    match block {
        PresentationBlock::Text { text } => println!("{}", text),
        PresentationBlock::Table {
            title,
            columns,
            rows,
        } => {
            println!("\n{}", title);
            println!("  {}", columns.join(" | "));
            for row in rows {
                let cells: Vec<String> = row.iter().map(cell).collect();
                println!("  {}", cells.join(" | "));
            }
        }
        PresentationBlock::Chart {
            title,
            chart_type,
            series,
        } => {
            println!("\n{} ({})", title, chart_type);
            for s in series {
                for point in &s.points {
                    println!("  {:<20} {:>10.2}  {}", point.label, point.value, s.name);
                }
            }
        }
        PresentationBlock::Network {
            title,
            nodes,
            edges,
        } => {
            println!("\n{}: {} nodes, {} edges", title, nodes.len(), edges.len());
            for edge in edges {
                let from = edge.get("from").map(cell).unwrap_or_default();
                let to = edge.get("to").map(cell).unwrap_or_default();
                println!("  {} -> {}", from, to);
            }
        }
    }
}
