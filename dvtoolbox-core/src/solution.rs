//! Solution import, export and publish, each driven as a tracked async job.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::TrackingSettings;
use crate::contract::{OperationRequest, Query, RemoteClient};
use crate::error::{RemoteError, Result};
use crate::package::{SolutionManifest, SolutionPackage};
use crate::progress::ProgressReporter;
use crate::tracker::{
    AsyncOperationProbe, AsyncOperationTracker, ImportJobProbe, JobOutcome, JobTrigger,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportOptions {
    /// Publish all customizations once the import succeeded.
    pub publish: bool,
    pub overwrite_unmanaged: bool,
    pub publish_workflows: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            publish: true,
            overwrite_unmanaged: true,
            publish_workflows: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportReport {
    pub manifest: SolutionManifest,
    pub operation_id: Uuid,
    pub import_job_id: Uuid,
    pub published: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportReport {
    pub path: PathBuf,
    pub bytes: usize,
    pub elapsed: Duration,
}

impl ExportReport {
    pub fn kilobytes(&self) -> f64 {
        (self.bytes as f64 / 1000.0 * 100.0).round() / 100.0
    }
}

/// Runs the solution-level async operations against one environment.
pub struct SolutionJobs<'a> {
    client: &'a dyn RemoteClient,
    reporter: &'a dyn ProgressReporter,
    settings: &'a TrackingSettings,
}

impl<'a> SolutionJobs<'a> {
    pub fn new(
        client: &'a dyn RemoteClient,
        reporter: &'a dyn ProgressReporter,
        settings: &'a TrackingSettings,
    ) -> Self {
        Self {
            client,
            reporter,
            settings,
        }
    }

    /// Import a package and wait for the import job to finish.
    ///
    /// Import progress fills the first 90 % when publishing follows, the
    /// first 99 % otherwise; only the final event reaches 100 %.
    pub async fn import(
        &self,
        package: &SolutionPackage,
        options: ImportOptions,
    ) -> Result<ImportReport> {
        let manifest = package.manifest()?;
        info!(solution = %manifest.unique_name, version = %manifest.version, package = %package.path().display(), "[IMPORT] Importing version");

        let content = STANDARD.encode(package.bytes()?);
        let requested_job_id = Uuid::new_v4();
        let request = OperationRequest::new("ImportSolutionAsync")
            .param("CustomizationFile", content)
            .param("OverwriteUnmanagedCustomizations", options.overwrite_unmanaged)
            .param("PublishWorkflows", options.publish_workflows)
            .param("ImportJobId", requested_job_id.to_string());

        let tracker = AsyncOperationTracker::new(self.client);
        let mut job = tracker.start(&JobTrigger::async_operation(request)).await?;
        self.reporter.report("Async solution import requested", 0.0);

        let started = tracker
            .wait_for_start(
                &mut job,
                &AsyncOperationProbe::new(self.client),
                self.settings.start_attempts,
                self.settings.start_interval(),
            )
            .await;
        if !started {
            warn!(operation_id = %job.operation_id, "[IMPORT] Import has not started yet, looking for its import job anyway");
        }

        let scale = if options.publish { 90.0 } else { 99.0 };
        let import_job_id = if job.state.is_terminal() {
            // Finished before an open import job could be seen.
            info!(operation_id = %job.operation_id, state = ?job.state, "[IMPORT] Import finished during the start check");
            tracker
                .wait_for_completion(
                    &mut job,
                    &AsyncOperationProbe::new(self.client),
                    self.settings.poll_interval(),
                    |_| {},
                )
                .await?;
            self.reporter.report("Solution Import 100%", scale);
            requested_job_id
        } else {
            let import_job_query = Query::new("importjob")
                .select(&["importjobid", "solutionname", "createdon"])
                .eq("solutionname", manifest.unique_name.as_str())
                .is_null("completedon")
                .order_desc("createdon");
            let import_job_id = tracker
                .resolve_tracking_id(
                    &mut job,
                    &import_job_query,
                    self.settings.resolve_interval(),
                    self.settings.resolve_attempts,
                )
                .await?;

            let reporter = self.reporter;
            tracker
                .wait_for_completion(
                    &mut job,
                    &ImportJobProbe::new(self.client),
                    self.settings.poll_interval(),
                    |progress| {
                        let rounded = (progress * 100.0).round() / 100.0;
                        reporter.report(
                            &format!("Solution Import {rounded}%"),
                            progress.clamp(0.0, 100.0) / 100.0 * scale,
                        );
                    },
                )
                .await?;
            import_job_id
        };
        info!(solution = %manifest.unique_name, %import_job_id, "[IMPORT] Changes successfully imported");

        if options.publish {
            self.reporter.report("Publishing changes", scale);
            self.run_publish().await?;
            self.reporter.report("Changes successfully published", 100.0);
        } else {
            self.reporter.report("Changes successfully imported", 100.0);
        }

        Ok(ImportReport {
            manifest,
            operation_id: job.operation_id,
            import_job_id,
            published: options.publish,
        })
    }

    /// Export a solution and write the archive to `output`.
    pub async fn export(
        &self,
        solution: &str,
        managed: bool,
        output: &Path,
    ) -> Result<ExportReport> {
        info!(solution, managed, "[EXPORT] Exporting solution");
        let timer = Instant::now();
        self.reporter.report(&format!("Exporting solution {solution}"), 0.0);

        let request = OperationRequest::new("ExportSolutionAsync")
            .param("SolutionName", solution)
            .param("Managed", managed);
        let trigger = JobTrigger::async_operation(request).correlated_by("ExportJobId");

        let tracker = AsyncOperationTracker::new(self.client);
        let mut job = tracker.start(&trigger).await?;
        let outcome: JobOutcome = tracker
            .wait_for_completion(
                &mut job,
                &AsyncOperationProbe::new(self.client),
                self.settings.poll_interval(),
                |_| {},
            )
            .await?;

        let export_job_id = outcome.correlation_id.unwrap_or(outcome.operation_id);
        let download = OperationRequest::new("DownloadSolutionExportData")
            .param("ExportJobId", export_job_id.to_string());
        let response = self.client.execute(&download).await?;
        let encoded = response
            .get("ExportSolutionFile")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| {
                RemoteError::Decode("response has no 'ExportSolutionFile'".to_string())
            })?;
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| RemoteError::Decode(format!("export file is not base64: {e}")))?;

        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(output, &bytes)?;

        let report = ExportReport {
            path: output.to_path_buf(),
            bytes: bytes.len(),
            elapsed: timer.elapsed(),
        };
        info!(solution, kilobytes = report.kilobytes(), elapsed = ?report.elapsed, path = %output.display(), "[EXPORT] Solution exported");
        self.reporter.report(
            &format!(
                "Solution was {} kilobytes and saved to {}",
                report.kilobytes(),
                output.display()
            ),
            100.0,
        );
        Ok(report)
    }

    /// Publish all customizations, reporting start and finish.
    pub async fn publish_all(&self) -> Result<JobOutcome> {
        self.reporter.report("Publishing all changes", 0.0);
        let timer = Instant::now();
        let outcome = self.run_publish().await?;
        self.reporter.report(
            &format!("All changes published in {}s", timer.elapsed().as_secs()),
            100.0,
        );
        Ok(outcome)
    }

    async fn run_publish(&self) -> Result<JobOutcome> {
        info!("[PUBLISH] Publishing all customizations");
        let tracker = AsyncOperationTracker::new(self.client);
        let mut job = tracker
            .start(&JobTrigger::async_operation(OperationRequest::new("PublishAllXmlAsync")))
            .await?;
        tracker
            .wait_for_completion(
                &mut job,
                &AsyncOperationProbe::new(self.client),
                self.settings.publish_interval(),
                |_| {},
            )
            .await
    }
}
