//! Web resources: a directory tree as the local view, the web resources of a
//! solution as the remote view.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tracing::{debug, info};
use uuid::Uuid;
use walkdir::{DirEntry, WalkDir};

use crate::artifact::{ArtifactRecord, ArtifactSet, Payload, PathIdentity};
use crate::config::TrackingSettings;
use crate::contract::{Field, Query, Record, RemoteClient};
use crate::error::{Result, ToolboxError};
use crate::lookup::{self, component_type};
use crate::progress::ProgressReporter;
use crate::reconcile::{
    ApplyMode, ApplyReport, ArtifactSink, ArtifactSource, ReconciliationEngine, SinkCapabilities,
};
use crate::solution::SolutionJobs;

/// `webresourcetype` for a file name, by extension.
pub fn web_resource_type(name: &str) -> Option<i32> {
    let extension = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
    let code = match extension.as_str() {
        "html" | "htm" => 1,
        "css" => 2,
        "js" => 3,
        "xml" => 4,
        "png" => 5,
        "jpg" | "jpeg" => 6,
        "gif" => 7,
        "xap" => 8,
        "xsl" => 9,
        "ico" => 10,
        "svg" => 11,
        "resx" => 12,
        _ => return None,
    };
    Some(code)
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0 && entry.file_name().to_string_lossy().starts_with('.')
}

/// Files under `root`, named by their forward-slash relative path, with
/// base64 content as payload. Dot-prefixed files and folders are skipped.
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ArtifactSource<PathIdentity> for DirectorySource {
    fn describe(&self) -> String {
        format!("directory {}", self.root.display())
    }

    async fn load(&self) -> Result<ArtifactSet<PathIdentity>> {
        if !self.root.is_dir() {
            return Err(ToolboxError::not_found("directory", self.root.display().to_string()));
        }
        let mut set = ArtifactSet::new();
        let walker = WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !is_hidden(e));
        for entry in walker {
            let entry = entry.map_err(|e| std::io::Error::other(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .map_err(|e| std::io::Error::other(e.to_string()))?;
            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let content = STANDARD.encode(std::fs::read(entry.path())?);
            debug!(file = %name, bytes = content.len(), "Read local web resource");
            set.insert(ArtifactRecord::new(name, Payload::Text(content)));
        }
        info!(root = %self.root.display(), count = set.len(), "Loaded local web resources");
        Ok(set)
    }
}

/// Web resources that are components of one solution.
pub struct WebResourceSink<'a> {
    client: &'a dyn RemoteClient,
    solution: String,
    solution_id: Uuid,
    capabilities: SinkCapabilities,
}

impl<'a> WebResourceSink<'a> {
    pub async fn for_solution(client: &'a dyn RemoteClient, solution: &str) -> Result<Self> {
        let solution_id = lookup::solution_id(client, solution).await?;
        Ok(Self {
            client,
            solution: solution.to_string(),
            solution_id,
            capabilities: SinkCapabilities::ALL,
        })
    }

    /// Only carry out deletions.
    pub fn delete_only(mut self) -> Self {
        self.capabilities = SinkCapabilities::DELETE_ONLY;
        self
    }

    fn content(local: &ArtifactRecord) -> &str {
        local.payload.as_text().unwrap_or_default()
    }

    fn remote_id(remote: &ArtifactRecord) -> Result<Uuid> {
        remote
            .remote_id
            .ok_or_else(|| ToolboxError::not_found("webresource", remote.name.clone()))
    }
}

#[async_trait]
impl ArtifactSink<PathIdentity> for WebResourceSink<'_> {
    fn kind(&self) -> &str {
        "web resource"
    }

    fn capabilities(&self) -> SinkCapabilities {
        self.capabilities
    }

    async fn fetch(&self) -> Result<ArtifactSet<PathIdentity>> {
        let rows = lookup::solution_members(
            self.client,
            self.solution_id,
            Some(component_type::WEB_RESOURCE),
            Query::new("webresource")
                .select(&["webresourceid", "name", "content"])
                .unpublished(),
        )
        .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let id = row.record_id()?;
                let name = row.text("name")?.to_string();
                let content = row.text("content").unwrap_or_default().to_string();
                Some(ArtifactRecord::new(name, Payload::Text(content)).with_remote_id(id))
            })
            .collect())
    }

    async fn add(&self, local: &ArtifactRecord) -> Result<()> {
        let kind = web_resource_type(&local.name)
            .ok_or_else(|| ToolboxError::UnsupportedFileType(local.name.clone()))?;
        let record = Record::new("webresource")
            .set("name", local.name.as_str())
            .set("displayname", local.name.as_str())
            .set("content", Self::content(local))
            .set("webresourcetype", Field::Choice(kind));
        let id = self.client.create(&record).await?;
        lookup::add_solution_component(
            self.client,
            Some(&self.solution),
            id,
            component_type::WEB_RESOURCE,
        )
        .await
    }

    async fn update(&self, local: &ArtifactRecord, remote: &ArtifactRecord) -> Result<()> {
        let record = Record::with_id("webresource", Self::remote_id(remote)?)
            .set("content", Self::content(local));
        Ok(self.client.update(&record).await?)
    }

    async fn delete(&self, remote: &ArtifactRecord) -> Result<()> {
        Ok(self
            .client
            .delete("webresource", Self::remote_id(remote)?)
            .await?)
    }
}

#[derive(Debug, Clone)]
pub struct WebResourceSyncOptions {
    pub mode: ApplyMode,
    /// Publish all customizations afterwards if anything changed.
    pub publish: bool,
    pub allow_empty_source: bool,
}

/// Bring the solution's web resources in line with the files under `root`.
pub async fn sync_web_resources(
    client: &dyn RemoteClient,
    reporter: &dyn ProgressReporter,
    settings: &TrackingSettings,
    root: &Path,
    solution: &str,
    options: &WebResourceSyncOptions,
) -> Result<ApplyReport> {
    info!(root = %root.display(), solution, mode = ?options.mode, "[SYNC] Synchronising web resources");
    let source = DirectorySource::new(root);
    let sink = WebResourceSink::for_solution(client, solution).await?;
    let engine = ReconciliationEngine::new(reporter, options.mode);
    let report = engine.run::<PathIdentity>(&source, &sink, options.allow_empty_source).await?;

    if options.publish && !report.dry_run && report.changed() > 0 {
        SolutionJobs::new(client, reporter, settings).publish_all().await?;
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_types_follow_extension() {
        assert_eq!(web_resource_type("scripts/form.JS"), Some(3));
        assert_eq!(web_resource_type("img/logo.jpeg"), Some(6));
        assert_eq!(web_resource_type("strings.resx"), Some(12));
        assert_eq!(web_resource_type("README"), None);
        assert_eq!(web_resource_type("archive.zip"), None);
    }
}
