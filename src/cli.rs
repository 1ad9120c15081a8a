use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dvtoolbox_core::config::Config;
use dvtoolbox_core::descriptor::load_descriptor;
use dvtoolbox_core::diagram::write_flow_diagrams;
use dvtoolbox_core::document::write_documentation;
use dvtoolbox_core::flows::activate_draft_flows;
use dvtoolbox_core::package::SolutionPackage;
use dvtoolbox_core::progress::{ProgressMode, ProgressReporter};
use dvtoolbox_core::reconcile::{ApplyMode, ApplyReport};
use dvtoolbox_core::registration::{RegistrationOptions, RegistrationReport, RegistrationSync};
use dvtoolbox_core::solution::{ImportOptions, SolutionJobs};
use dvtoolbox_core::solution_items::{remove_deleted_items, LocalView, RemovalOptions};
use dvtoolbox_core::webresource::{sync_web_resources, WebResourceSyncOptions};

use crate::client::WebApiClient;
use crate::load_config::{load_config, resolve_connection, ConnectionOverrides};

#[derive(Parser)]
#[clap(
    name = "dvtoolbox",
    version,
    about = "Deploy and maintain Dataverse solutions: import, export, web resources, flows and plugin registration"
)]
pub struct Cli {
    #[clap(flatten)]
    pub global: GlobalArgs,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Default)]
pub struct GlobalArgs {
    /// Optional YAML config file
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,

    /// Environment URL, e.g. https://contoso.crm.dynamics.com
    #[clap(long, global = true)]
    pub url: Option<String>,

    #[clap(long, global = true)]
    pub tenant_id: Option<String>,

    #[clap(long, global = true)]
    pub client_id: Option<String>,

    /// Progress output: plain, bar or ci
    #[clap(long, global = true)]
    pub progress: Option<ProgressMode>,

    /// Fail when any planned item could not be applied
    #[clap(long, global = true)]
    pub strict: bool,
}

/// Shared switches of the reconciling commands.
#[derive(Args, Debug, Default, Clone, Copy)]
pub struct ReconcileArgs {
    /// Carry out the plan; without it only the plan is reported
    #[clap(long)]
    pub apply: bool,

    /// Allow deleting everything when the local side is empty
    #[clap(long)]
    pub allow_empty_source: bool,
}

impl ReconcileArgs {
    fn mode(self) -> ApplyMode {
        if self.apply {
            ApplyMode::Apply
        } else {
            ApplyMode::DryRun
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Export a solution and write the archive to a file
    Export {
        /// Unique name of the solution
        solution: String,
        /// Where to write the archive
        output: PathBuf,
        #[clap(long)]
        managed: bool,
    },
    /// Import a solution package and wait for it to finish
    Import {
        /// Path to the solution archive
        package: PathBuf,
        /// Skip publishing customizations afterwards
        #[clap(long)]
        no_publish: bool,
    },
    /// Publish all customizations
    PublishAll,
    /// Make the solution's web resources match a local directory
    SyncWebResources {
        /// Root of the web resource tree
        dir: PathBuf,
        solution: String,
        /// Publish all customizations when anything changed
        #[clap(long)]
        publish: bool,
        #[clap(flatten)]
        reconcile: ReconcileArgs,
    },
    /// Delete solution items that no longer exist at the source
    RemoveDeletedItems {
        solution: String,
        /// Solution archive holding the surviving items
        #[clap(long, conflicts_with = "source_url", required_unless_present = "source_url")]
        package: Option<PathBuf>,
        /// Environment holding the surviving items
        #[clap(long)]
        source_url: Option<String>,
        #[clap(long)]
        skip_web_resources: bool,
        #[clap(long)]
        skip_connection_references: bool,
        #[clap(long)]
        skip_flows: bool,
        #[clap(flatten)]
        reconcile: ReconcileArgs,
    },
    /// Turn on every draft cloud flow in a solution
    ActivateFlows { solution: String },
    /// Write a Mermaid flowchart (.mmd) for every cloud flow in a solution
    FlowDiagrams {
        solution: String,
        /// Output directory
        #[clap(default_value = "docs/flows")]
        output: PathBuf,
    },
    /// Register a plugin assembly, its types, steps and images
    RegisterPlugins {
        /// JSON registration descriptor
        descriptor: PathBuf,
        /// Solution that new components are added to
        #[clap(long)]
        solution: Option<String>,
        /// Remove remote steps and images the descriptor no longer declares
        #[clap(long)]
        sync_remote: bool,
        /// Only update the assembly content
        #[clap(long)]
        assembly_only: bool,
        /// Apply remote removals; without it they are only reported
        #[clap(long)]
        apply: bool,
    },
    /// Write Markdown pages describing the registered plugins
    DocumentPlugins {
        descriptor: PathBuf,
        /// Output directory
        #[clap(default_value = "docs/plugins")]
        output: PathBuf,
    },
}

struct Session {
    config: Config,
    reporter: Box<dyn ProgressReporter>,
    strict: bool,
}

impl Session {
    fn load(global: &GlobalArgs) -> Result<Self> {
        let config = load_config(global.config.as_ref())?;
        let mode = global.progress.unwrap_or(config.progress);
        Ok(Self {
            strict: global.strict || config.strict,
            reporter: mode.reporter(),
            config,
        })
    }

    fn client(&self, overrides: &ConnectionOverrides) -> Result<WebApiClient> {
        let connection = resolve_connection(&self.config, overrides)?;
        Ok(WebApiClient::new(connection)?)
    }

    fn finish(&self, report: ApplyReport) -> Result<()> {
        self.finish_all(vec![report])
    }

    fn finish_all(&self, reports: Vec<ApplyReport>) -> Result<()> {
        conclude(&mut std::io::stdout(), self.strict, reports)
    }
}

/// Print every report, then in strict mode fail on the first incomplete one.
fn conclude(out: &mut impl Write, strict: bool, reports: Vec<ApplyReport>) -> Result<()> {
    for report in &reports {
        write_report(out, report)?;
    }
    if strict {
        for report in reports {
            report.ensure_complete()?;
        }
    }
    Ok(())
}

fn write_report(out: &mut impl Write, report: &ApplyReport) -> std::io::Result<()> {
    let verb = if report.dry_run { "planned" } else { "applied" };
    writeln!(
        out,
        "{} {verb}: {} added, {} updated, {} deleted, {} skipped, {} failed",
        report.kind,
        report.added.len(),
        report.updated.len(),
        report.deleted.len(),
        report.skipped.len(),
        report.failed.len()
    )?;
    for (identity, reason) in &report.failed {
        writeln!(out, "  failed {identity}: {reason}")?;
    }
    Ok(())
}

fn print_registration(report: &RegistrationReport) {
    println!(
        "registration: {} created, {} updated, {} removed, {} failed",
        report.created.len(),
        report.updated.len(),
        report.removed.len(),
        report.failed.len()
    );
    for pending in &report.pending_removals {
        println!(
            "  remote only ({:?}{}): {}",
            pending.kind,
            if pending.customizable { "" } else { ", managed" },
            pending.name
        );
    }
    for (label, reason) in &report.failed {
        println!("  failed {label}: {reason}");
    }
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    tracing::info!("trace_initialised");

    let result = dispatch(cli).await;

    let exit_span = tracing::info_span!("exit");
    exit_span.in_scope(|| {
        tracing::info!(success = result.is_ok(), "exit");
    });

    result
}

async fn dispatch(cli: Cli) -> Result<()> {
    let overrides = ConnectionOverrides {
        url: cli.global.url.clone(),
        tenant_id: cli.global.tenant_id.clone(),
        client_id: cli.global.client_id.clone(),
    };

    match cli.command {
        Commands::DocumentPlugins { descriptor, output } => {
            let module = load_descriptor(&descriptor)?;
            let written = write_documentation(&module, &output)?;
            println!("Wrote {} page(s) to {}", written.len(), output.display());
            Ok(())
        }
        Commands::Export {
            solution,
            output,
            managed,
        } => {
            let session = Session::load(&cli.global)?;
            let client = session.client(&overrides)?;
            let jobs =
                SolutionJobs::new(&client, session.reporter.as_ref(), &session.config.tracking);
            let report = jobs.export(&solution, managed, &output).await?;
            println!(
                "Exported {solution} to {} ({:.1} KB in {:.1?})",
                report.path.display(),
                report.kilobytes(),
                report.elapsed
            );
            Ok(())
        }
        Commands::Import {
            package,
            no_publish,
        } => {
            let session = Session::load(&cli.global)?;
            let client = session.client(&overrides)?;
            let package = SolutionPackage::open(&package)?;
            let jobs =
                SolutionJobs::new(&client, session.reporter.as_ref(), &session.config.tracking);
            let options = ImportOptions {
                publish: !no_publish,
                ..ImportOptions::default()
            };
            let report = jobs.import(&package, options).await?;
            println!(
                "Imported {} {} (import job {})",
                report.manifest.unique_name, report.manifest.version, report.import_job_id
            );
            Ok(())
        }
        Commands::PublishAll => {
            let session = Session::load(&cli.global)?;
            let client = session.client(&overrides)?;
            let jobs =
                SolutionJobs::new(&client, session.reporter.as_ref(), &session.config.tracking);
            let outcome = jobs.publish_all().await?;
            println!("Published all customizations (operation {})", outcome.operation_id);
            Ok(())
        }
        Commands::SyncWebResources {
            dir,
            solution,
            publish,
            reconcile,
        } => {
            let session = Session::load(&cli.global)?;
            let client = session.client(&overrides)?;
            let options = WebResourceSyncOptions {
                mode: reconcile.mode(),
                publish,
                allow_empty_source: reconcile.allow_empty_source,
            };
            let report = sync_web_resources(
                &client,
                session.reporter.as_ref(),
                &session.config.tracking,
                &dir,
                &solution,
                &options,
            )
            .await?;
            session.finish(report)
        }
        Commands::RemoveDeletedItems {
            solution,
            package,
            source_url,
            skip_web_resources,
            skip_connection_references,
            skip_flows,
            reconcile,
        } => {
            let session = Session::load(&cli.global)?;
            let target = session.client(&overrides)?;
            let options = RemovalOptions {
                web_resources: !skip_web_resources,
                connection_references: !skip_connection_references,
                flows: !skip_flows,
                mode: reconcile.mode(),
                allow_empty_source: reconcile.allow_empty_source,
            };

            let source_client = match source_url {
                Some(url) => {
                    let connection = resolve_connection(&session.config, &overrides)?;
                    Some(WebApiClient::new(connection.with_url(url.trim_end_matches('/')))?)
                }
                None => None,
            };
            let local = match (&source_client, package) {
                (Some(source), _) => LocalView::Environment(source),
                (None, Some(path)) => LocalView::Package(SolutionPackage::open(&path)?),
                (None, None) => anyhow::bail!("Either --package or --source-url is required"),
            };

            let reports = remove_deleted_items(
                &target,
                session.reporter.as_ref(),
                &local,
                &solution,
                options,
            )
            .await?;
            session.finish_all(reports)
        }
        Commands::ActivateFlows { solution } => {
            let session = Session::load(&cli.global)?;
            let client = session.client(&overrides)?;
            let report = activate_draft_flows(&client, session.reporter.as_ref(), &solution).await?;
            session.finish(report)
        }
        Commands::FlowDiagrams { solution, output } => {
            let session = Session::load(&cli.global)?;
            let client = session.client(&overrides)?;
            let written = write_flow_diagrams(&client, &solution, &output).await?;
            println!("Wrote {} diagram(s) to {}", written.len(), output.display());
            Ok(())
        }
        Commands::RegisterPlugins {
            descriptor,
            solution,
            sync_remote,
            assembly_only,
            apply,
        } => {
            let session = Session::load(&cli.global)?;
            let module = load_descriptor(&descriptor)?;
            let client = session.client(&overrides)?;
            let options = RegistrationOptions {
                solution,
                sync_remote,
                mode: ReconcileArgs {
                    apply,
                    allow_empty_source: false,
                }
                .mode(),
                assembly_only,
            };
            let report = RegistrationSync::new(&client, options)
                .register(&module)
                .await
                .with_context(|| format!("Registering {} failed", module.name))?;
            print_registration(&report);
            if session.strict && !report.failed.is_empty() {
                anyhow::bail!("{} registration item(s) failed", report.failed.len());
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(kind: &str, failed: &[&str]) -> ApplyReport {
        let mut report = ApplyReport::new(kind, false);
        report.deleted.push(format!("stale {kind}"));
        report.failed = failed
            .iter()
            .map(|id| (id.to_string(), "server fault".to_string()))
            .collect();
        report
    }

    #[test]
    fn test_strict_mode_prints_every_report_before_failing() {
        let mut out = Vec::new();
        let reports = vec![
            report("web resource", &["old.js"]),
            report("connection reference", &[]),
            report("flow", &[]),
        ];

        let result = conclude(&mut out, true, reports);

        assert!(result.is_err());
        let printed = String::from_utf8(out).unwrap();
        assert!(printed
            .contains("web resource applied: 0 added, 0 updated, 1 deleted, 0 skipped, 1 failed"));
        assert!(printed.contains("  failed old.js: server fault"));
        assert!(printed.contains("connection reference applied"));
        assert!(printed.contains("flow applied"));
    }

    #[test]
    fn test_failures_are_reported_but_tolerated_without_strict() {
        let mut out = Vec::new();
        assert!(conclude(&mut out, false, vec![report("flow", &["Broken"])]).is_ok());
        assert!(String::from_utf8(out).unwrap().contains("failed Broken"));
    }
}
