//! DAG visualization: DOT and structured-JSON renderers.
//!
//! Both renderers walk the graph from the exported state after a digest
//! finalization pass, so the digests shown match what a build would
//! solve.

use serde::Serialize;

use crate::graph::State;
use crate::pb;
use crate::serialize::{collect_nodes, finalize_digests};

/// One graph vertex as surfaced to tooling.
#[derive(Debug, Clone, Serialize)]
pub struct NodeRecord {
    pub digest: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub file: String,
    pub line: i32,
    pub inputs: Vec<String>,
    pub details: serde_json::Value,
}

/// Collect records for every node reachable from `root`, post-order.
/// `filter` restricts the listing to one op kind.
pub fn collect_records(root: &State, filter: Option<&str>) -> Vec<NodeRecord> {
    finalize_digests(root);
    collect_nodes(root.node())
        .iter()
        .filter(|node| filter.map(|f| node.kind() == f).unwrap_or(true))
        .map(|node| {
            let meta = node.meta();
            let op = node.op_snapshot();
            NodeRecord {
                digest: node.digest(),
                kind: node.kind().to_string(),
                file: meta.origin.file.clone(),
                line: meta.origin.line,
                inputs: node
                    .edges()
                    .iter()
                    .flatten()
                    .map(|edge| edge.node.digest())
                    .collect(),
                details: details(&op),
            }
        })
        .collect()
}

/// Render the graph as GraphViz DOT.
pub fn render_dot(root: &State, filter: Option<&str>) -> String {
    let records = collect_records(root, filter);
    let mut out = String::from("digraph llb {\n");
    out.push_str("  rankdir=BT;\n");
    for record in &records {
        let mut label = format!("{}\\n{}", record.kind, short_digest(&record.digest));
        if !record.file.is_empty() {
            label.push_str(&format!("\\n{}:{}", record.file, record.line));
        }
        let hint = hint(record);
        if !hint.is_empty() {
            label.push_str("\\n");
            label.push_str(&escape(&hint));
        }
        out.push_str(&format!("  \"{}\" [label=\"{}\"];\n", record.digest, label));
    }
    let shown: std::collections::HashSet<&str> =
        records.iter().map(|r| r.digest.as_str()).collect();
    for record in &records {
        for input in &record.inputs {
            if shown.contains(input.as_str()) {
                out.push_str(&format!("  \"{}\" -> \"{}\";\n", input, record.digest));
            }
        }
    }
    out.push_str("}\n");
    out
}

/// Render the graph as a JSON array of node records.
pub fn render_json(root: &State, filter: Option<&str>) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&collect_records(root, filter))
}

fn short_digest(digest: &str) -> String {
    let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
    format!("sha256:{}", &hex[..12.min(hex.len())])
}

fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Type-specific display hint shown in DOT labels.
fn hint(record: &NodeRecord) -> String {
    match record.kind.as_str() {
        "source" => record.details["identifier"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
        "exec" => record.details["args"]
            .as_array()
            .and_then(|args| args.first())
            .and_then(|arg| arg.as_str())
            .unwrap_or_default()
            .to_string(),
        "file" => format!(
            "{} action(s)",
            record.details["actions"].as_u64().unwrap_or(0)
        ),
        "merge" => format!("{} inputs", record.inputs.len()),
        _ => String::new(),
    }
}

fn details(op: &pb::Op) -> serde_json::Value {
    match &op.op {
        Some(pb::op::Op::Source(src)) => serde_json::json!({
            "identifier": src.identifier,
            "attrs": src.attrs,
        }),
        Some(pb::op::Op::Exec(exec)) => {
            let meta = exec.meta.clone().unwrap_or_default();
            serde_json::json!({
                "args": meta.args,
                "env": meta.env,
                "cwd": meta.cwd,
                "mounts": exec.mounts.iter().map(|m| m.dest.clone()).collect::<Vec<_>>(),
            })
        }
        Some(pb::op::Op::File(file)) => serde_json::json!({
            "actions": file.actions.len(),
        }),
        Some(pb::op::Op::Merge(merge)) => serde_json::json!({
            "inputs": merge.inputs.len(),
        }),
        Some(pb::op::Op::Diff(_)) => serde_json::json!({}),
        Some(pb::op::Op::Build(_)) => serde_json::json!({}),
        None => serde_json::json!({}),
    }
}
