//! Removal of solution items that no longer exist in the source of truth.
//!
//! The local view is either a package file or the same solution in another
//! environment. Additions come from solution import, so every sink here is
//! delete-only and the engine records planned adds and updates as skipped.

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::artifact::{ArtifactRecord, ArtifactSet, ExactIdentity, IdentityRule, PathIdentity};
use crate::contract::{Query, RemoteClient};
use crate::error::{Result, ToolboxError};
use crate::flows::FlowSink;
use crate::lookup;
use crate::package::{ComponentKind, PackageSource, SolutionPackage};
use crate::progress::ProgressReporter;
use crate::reconcile::{
    ApplyMode, ApplyReport, ArtifactSink, ArtifactSource, ReconciliationEngine, RemoteView,
    SinkCapabilities,
};
use crate::webresource::WebResourceSink;

/// Connection references in a solution, identified by logical name.
pub struct ConnectionReferenceSink<'a> {
    client: &'a dyn RemoteClient,
    solution_id: Uuid,
}

impl<'a> ConnectionReferenceSink<'a> {
    pub async fn for_solution(client: &'a dyn RemoteClient, solution: &str) -> Result<Self> {
        let solution_id = lookup::solution_id(client, solution).await?;
        Ok(Self { client, solution_id })
    }

    fn unsupported(&self, operation: &str) -> ToolboxError {
        ToolboxError::Unsupported {
            kind: "connection reference".to_string(),
            operation: operation.to_string(),
        }
    }
}

#[async_trait]
impl ArtifactSink<ExactIdentity> for ConnectionReferenceSink<'_> {
    fn kind(&self) -> &str {
        "connection reference"
    }

    fn capabilities(&self) -> SinkCapabilities {
        SinkCapabilities::DELETE_ONLY
    }

    async fn fetch(&self) -> Result<ArtifactSet<ExactIdentity>> {
        let query = Query::new("connectionreference")
            .select(&["connectionreferenceid", "connectionreferencelogicalname"]);
        let rows = lookup::solution_members(self.client, self.solution_id, None, query).await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                let name = row.text("connectionreferencelogicalname")?;
                Some(ArtifactRecord::marker(name).with_remote_id(row.record_id()?))
            })
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
            .ok_or_else(|| ToolboxError::not_found("connectionreference", remote.name.clone()))?;
        Ok(self.client.delete("connectionreference", id).await?)
    }
}

/// Where the surviving items are read from.
pub enum LocalView<'a> {
    Package(SolutionPackage),
    /// The same solution in a source environment.
    Environment(&'a dyn RemoteClient),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemovalOptions {
    pub web_resources: bool,
    pub connection_references: bool,
    pub flows: bool,
    pub mode: ApplyMode,
    pub allow_empty_source: bool,
}

impl Default for RemovalOptions {
    fn default() -> Self {
        Self {
            web_resources: true,
            connection_references: true,
            flows: true,
            mode: ApplyMode::DryRun,
            allow_empty_source: false,
        }
    }
}

async fn remove_kind<R: IdentityRule>(
    engine: &ReconciliationEngine<'_>,
    source: &dyn ArtifactSource<R>,
    target: &dyn ArtifactSink<R>,
    allow_empty_source: bool,
) -> Result<ApplyReport> {
    engine.run(source, target, allow_empty_source).await
}

/// Delete the target solution's web resources, connection references and
/// flows that the local view no longer has. One report per included kind.
pub async fn remove_deleted_items(
    target: &dyn RemoteClient,
    reporter: &dyn ProgressReporter,
    local: &LocalView<'_>,
    solution: &str,
    options: RemovalOptions,
) -> Result<Vec<ApplyReport>> {
    info!(solution, mode = ?options.mode, "[REMOVE] Looking for solution items deleted at the source");
    let engine = ReconciliationEngine::new(reporter, options.mode);
    let allow_empty = options.allow_empty_source;
    let mut reports = Vec::new();

    if options.web_resources {
        let sink = WebResourceSink::for_solution(target, solution).await?.delete_only();
        let report = match local {
            LocalView::Package(package) => {
                let source = PackageSource::<PathIdentity>::new(
                    package.clone(),
                    ComponentKind::WebResource,
                );
                remove_kind::<PathIdentity>(&engine, &source, &sink, allow_empty).await?
            }
            LocalView::Environment(client) => {
                let source = RemoteView(WebResourceSink::for_solution(*client, solution).await?);
                remove_kind::<PathIdentity>(&engine, &source, &sink, allow_empty).await?
            }
        };
        reports.push(report);
    }

    if options.connection_references {
        let sink = ConnectionReferenceSink::for_solution(target, solution).await?;
        let report = match local {
            LocalView::Package(package) => {
                let source = PackageSource::<ExactIdentity>::new(
                    package.clone(),
                    ComponentKind::ConnectionReference,
                );
                remove_kind::<ExactIdentity>(&engine, &source, &sink, allow_empty).await?
            }
            LocalView::Environment(client) => {
                let view = ConnectionReferenceSink::for_solution(*client, solution).await?;
                let source = RemoteView(view);
                remove_kind::<ExactIdentity>(&engine, &source, &sink, allow_empty).await?
            }
        };
        reports.push(report);
    }

    if options.flows {
        let sink = FlowSink::for_solution(target, solution).await?;
        let report = match local {
            LocalView::Package(package) => {
                let source = PackageSource::<ExactIdentity>::new(
                    package.clone(),
                    ComponentKind::Flow,
                );
                remove_kind::<ExactIdentity>(&engine, &source, &sink, allow_empty).await?
            }
            LocalView::Environment(client) => {
                let source = RemoteView(FlowSink::for_solution(*client, solution).await?);
                remove_kind::<ExactIdentity>(&engine, &source, &sink, allow_empty).await?
            }
        };
        reports.push(report);
    }

    Ok(reports)
}
