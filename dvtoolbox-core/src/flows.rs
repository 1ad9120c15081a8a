//! Modern flows (workflows of category 5) in a solution.

use async_trait::async_trait;
use tracing::{error, info};
use uuid::Uuid;

use crate::artifact::{ArtifactRecord, ArtifactSet, ExactIdentity};
use crate::contract::{Field, Query, Record, RemoteClient};
use crate::error::{Result, ToolboxError};
use crate::lookup::{self, component_type};
use crate::progress::ProgressReporter;
use crate::reconcile::{ApplyReport, ArtifactSink, SinkCapabilities};

const MODERN_FLOW_CATEGORY: i32 = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct Flow {
    pub id: Uuid,
    pub name: String,
    pub created_on: String,
    pub state_code: i64,
    pub status_code: i64,
    /// Flow definition JSON.
    pub client_data: Option<String>,
}

impl Flow {
    fn from_record(record: &Record) -> Option<Self> {
        Some(Self {
            id: record.record_id()?,
            name: record.text("name")?.to_string(),
            created_on: record.text("createdon").unwrap_or_default().to_string(),
            state_code: record.int("statecode").unwrap_or_default(),
            status_code: record.int("statuscode").unwrap_or_default(),
            client_data: record.text("clientdata").map(str::to_string),
        })
    }

    /// Turned off: draft state with draft status.
    pub fn is_draft(&self) -> bool {
        self.state_code == 0 && self.status_code == 1
    }
}

/// Modern flows that are components of the solution, newest first.
pub async fn modern_flows(client: &dyn RemoteClient, solution_id: Uuid) -> Result<Vec<Flow>> {
    let query = Query::new("workflow")
        .select(&["workflowid", "name", "createdon", "statecode", "statuscode", "clientdata"])
        .eq("category", Field::Choice(MODERN_FLOW_CATEGORY))
        .order_desc("createdon");
    let rows =
        lookup::solution_members(client, solution_id, Some(component_type::WORKFLOW), query)
            .await?;
    let mut flows: Vec<Flow> = rows.iter().filter_map(Flow::from_record).collect();
    flows.sort_by(|a, b| b.created_on.cmp(&a.created_on));
    Ok(flows)
}

/// The solution's modern flows, identified by name. Flows arrive through
/// solution import, so only deletion is supported.
pub struct FlowSink<'a> {
    client: &'a dyn RemoteClient,
    solution_id: Uuid,
}

impl<'a> FlowSink<'a> {
    pub async fn for_solution(client: &'a dyn RemoteClient, solution: &str) -> Result<Self> {
        let solution_id = lookup::solution_id(client, solution).await?;
        Ok(Self { client, solution_id })
    }

    fn unsupported(&self, operation: &str) -> ToolboxError {
        ToolboxError::Unsupported {
            kind: "flow".to_string(),
            operation: operation.to_string(),
        }
    }
}

#[async_trait]
impl ArtifactSink<ExactIdentity> for FlowSink<'_> {
    fn kind(&self) -> &str {
        "flow"
    }

    fn capabilities(&self) -> SinkCapabilities {
        SinkCapabilities::DELETE_ONLY
    }

    async fn fetch(&self) -> Result<ArtifactSet<ExactIdentity>> {
        let flows = modern_flows(self.client, self.solution_id).await?;
        Ok(flows
            .into_iter()
            .map(|f| ArtifactRecord::marker(f.name).with_remote_id(f.id))
            .collect())
    }

    async fn add(&self, _local: &ArtifactRecord) -> Result<()> {
        Err(self.unsupported("add"))
    }

    async fn update(&self, _local: &ArtifactRecord, _remote: &ArtifactRecord) -> Result<()> {
        Err(self.unsupported("update"))
    }

    async fn delete(&self, remote: &ArtifactRecord) -> Result<()> {
        let id = remote
            .remote_id
            .ok_or_else(|| ToolboxError::not_found("workflow", remote.name.clone()))?;
        Ok(self.client.delete("workflow", id).await?)
    }
}

/// Switch every draft modern flow in the solution on, newest first. A flow
/// that fails to activate is recorded and the rest continue.
pub async fn activate_draft_flows(
    client: &dyn RemoteClient,
    reporter: &dyn ProgressReporter,
    solution: &str,
) -> Result<ApplyReport> {
    let solution_id = lookup::solution_id(client, solution).await?;
    let drafts: Vec<Flow> = modern_flows(client, solution_id)
        .await?
        .into_iter()
        .filter(Flow::is_draft)
        .collect();
    info!(solution, count = drafts.len(), "[FLOWS] Found flows to enable");

    let mut report = ApplyReport::new("flow", false);
    let total = drafts.len();
    for (done, flow) in drafts.into_iter().enumerate() {
        let record = Record::with_id("workflow", flow.id)
            .set("statecode", Field::Choice(1))
            .set("statuscode", Field::Choice(2));
        match client.update(&record).await {
            Ok(()) => {
                info!(flow = %flow.name, "[FLOWS] Enabled flow");
                report.updated.push(flow.name.clone());
            }
            Err(e) => {
                error!(flow = %flow.name, error = %e, "[FLOWS][ERROR] Could not enable flow");
                report.failed.push((flow.name.clone(), e.to_string()));
            }
        }
        reporter.report(
            &format!("Enabling flow {}", flow.name),
            (done + 1) as f64 * 100.0 / total as f64,
        );
    }
    Ok(report)
}
