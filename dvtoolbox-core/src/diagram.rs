//! Mermaid flowcharts from cloud flow definitions (`workflow.clientdata`).
//!
//! Triggers point at the top-level actions that have no `runAfter`. Scopes,
//! loops and switch cases become subgraphs; conditions become decision
//! nodes with `Yes`/`No` edges into their branches; connector calls are
//! drawn as database shapes. Every `runAfter` entry becomes an edge.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::contract::RemoteClient;
use crate::error::{Result, ToolboxError};
use crate::flows::modern_flows;
use crate::lookup;

#[derive(Debug, Default, Deserialize)]
struct FlowAction {
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default, rename = "runAfter")]
    run_after: IndexMap<String, Value>,
    #[serde(default)]
    actions: IndexMap<String, FlowAction>,
    #[serde(default)]
    cases: IndexMap<String, Branch>,
    #[serde(default, rename = "else")]
    otherwise: Option<Branch>,
}

#[derive(Debug, Default, Deserialize)]
struct Branch {
    #[serde(default)]
    actions: IndexMap<String, FlowAction>,
}

fn node(key: &str) -> String {
    key.replace("_call", "_Call").replace(['(', ')'], "-")
}

fn roots(actions: &IndexMap<String, FlowAction>) -> impl Iterator<Item = &String> {
    actions
        .iter()
        .filter(|(_, action)| action.run_after.is_empty())
        .map(|(key, _)| key)
}

fn subgraph(graph: &mut String, key: &str, body: impl FnOnce(&mut String)) {
    let _ = writeln!(graph, "subgraph {}", node(key));
    let _ = writeln!(graph, "direction TB");
    body(graph);
    let _ = writeln!(graph, "end");
}

fn branch(graph: &mut String, key: &str, label: &str, actions: &IndexMap<String, FlowAction>) {
    render_actions(graph, actions);
    for root in roots(actions) {
        let _ = writeln!(graph, "{}-->|{label}|{}", node(key), node(root));
    }
}

fn render_actions(graph: &mut String, actions: &IndexMap<String, FlowAction>) {
    for (key, action) in actions {
        match action.kind.as_str() {
            "Scope" | "Foreach" | "Until" => {
                subgraph(graph, key, |g| render_actions(g, &action.actions));
            }
            "Switch" => {
                subgraph(graph, key, |g| {
                    for (case, body) in &action.cases {
                        subgraph(g, case, |g| render_actions(g, &body.actions));
                    }
                });
                for case in action.cases.keys() {
                    let _ = writeln!(graph, "{}-->{}", node(key), node(case));
                }
            }
            "If" => {
                let _ = writeln!(graph, "{}{{{key}}}", node(key));
                branch(graph, key, "Yes", &action.actions);
                if let Some(otherwise) = &action.otherwise {
                    branch(graph, key, "No", &otherwise.actions);
                }
            }
            "OpenApiConnection" => {
                let _ = writeln!(graph, "{}[({key})]", node(key));
            }
            _ => {
                let _ = writeln!(graph, "{}", node(key));
            }
        }
        for after in action.run_after.keys() {
            let _ = writeln!(graph, "{}-->{}", node(after), node(key));
        }
    }
}

/// Render a flow's client data as a Mermaid `flowchart`.
pub fn render_flowchart(client_data: &Value) -> Result<String> {
    let definition = client_data
        .pointer("/properties/definition")
        .ok_or_else(|| ToolboxError::FlowDefinition("missing properties.definition".into()))?;
    let triggers: IndexMap<String, Value> = match definition.get("triggers") {
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| ToolboxError::FlowDefinition(format!("triggers: {e}")))?,
        None => IndexMap::new(),
    };
    let actions: IndexMap<String, FlowAction> = match definition.get("actions") {
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| ToolboxError::FlowDefinition(format!("actions: {e}")))?,
        None => IndexMap::new(),
    };

    let mut graph = String::from("flowchart\n");
    for root in roots(&actions) {
        for trigger in triggers.keys() {
            let _ = writeln!(graph, "{}-->{}", node(trigger), node(root));
        }
    }
    render_actions(&mut graph, &actions);
    Ok(graph)
}

fn file_name(flow: &str) -> String {
    let safe: String = flow
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            other => other,
        })
        .collect();
    format!("{safe}.mmd")
}

/// Write `<flow name>.mmd` for every modern flow in the solution. A flow
/// whose definition cannot be read is skipped with a warning.
pub async fn write_flow_diagrams(
    client: &dyn RemoteClient,
    solution: &str,
    dir: &Path,
) -> Result<Vec<PathBuf>> {
    let solution_id = lookup::solution_id(client, solution).await?;
    let flows = modern_flows(client, solution_id).await?;
    info!(solution, count = flows.len(), dir = %dir.display(), "[FLOWS] Creating flow diagrams");
    std::fs::create_dir_all(dir)?;

    let mut written = Vec::with_capacity(flows.len());
    for flow in flows {
        let rendered = flow
            .client_data
            .as_deref()
            .ok_or_else(|| ToolboxError::FlowDefinition("flow has no client data".into()))
            .and_then(|text| {
                serde_json::from_str::<Value>(text)
                    .map_err(|e| ToolboxError::FlowDefinition(e.to_string()))
            })
            .and_then(|value| render_flowchart(&value));
        match rendered {
            Ok(graph) => {
                let path = dir.join(file_name(&flow.name));
                std::fs::write(&path, graph)?;
                info!(flow = %flow.name, path = %path.display(), "[FLOWS] Diagram written");
                written.push(path);
            }
            Err(e) => warn!(flow = %flow.name, error = %e, "[FLOWS] Skipping flow diagram"),
        }
    }
    Ok(written)
}
