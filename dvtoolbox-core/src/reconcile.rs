//! Reconciliation: diff a local artifact view against a remote one and apply
//! the resulting edit plan.
//!
//! # Pipeline
//! 1. An [`ArtifactSource`] produces the local view, an [`ArtifactSink`] the remote one.
//! 2. [`reconcile`] computes an [`EditPlan`] (add / update / delete).
//! 3. [`ReconciliationEngine::apply`] executes the plan through the sink:
//!    deletes first, then adds, then updates. Each item is applied on its own;
//!    a failure is logged and recorded in the [`ApplyReport`] and the rest of
//!    the plan still runs.
//!
//! In [`ApplyMode::DryRun`] the plan is reported and nothing is written.

use async_trait::async_trait;
use tracing::{error, info};

use crate::artifact::{ArtifactIdentity, ArtifactRecord, ArtifactSet, IdentityRule};
use crate::error::{Result, ToolboxError};
use crate::progress::ProgressReporter;

/// Computed add/update/delete identities. Consumed once by `apply`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EditPlan {
    to_add: Vec<ArtifactIdentity>,
    to_update: Vec<ArtifactIdentity>,
    to_delete: Vec<ArtifactIdentity>,
}

impl EditPlan {
    pub fn to_add(&self) -> &[ArtifactIdentity] {
        &self.to_add
    }

    pub fn to_update(&self) -> &[ArtifactIdentity] {
        &self.to_update
    }

    pub fn to_delete(&self) -> &[ArtifactIdentity] {
        &self.to_delete
    }

    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }

    pub fn len(&self) -> usize {
        self.to_add.len() + self.to_update.len() + self.to_delete.len()
    }
}

/// Diff two views of the same artifact kind.
///
/// `to_add` and `to_update` follow the local view's order, `to_delete` the
/// remote view's order.
pub fn reconcile<R: IdentityRule>(local: &ArtifactSet<R>, remote: &ArtifactSet<R>) -> EditPlan {
    let mut plan = EditPlan::default();

    for (key, record) in local.iter() {
        let identity = ArtifactIdentity {
            key: key.clone(),
            name: record.name.clone(),
        };
        match remote.get(key) {
            None => plan.to_add.push(identity),
            Some(existing) if existing.fingerprint != record.fingerprint => {
                plan.to_update.push(identity)
            }
            Some(_) => {}
        }
    }

    for (key, record) in remote.iter() {
        if !local.contains_key(key) {
            plan.to_delete.push(ArtifactIdentity {
                key: key.clone(),
                name: record.name.clone(),
            });
        }
    }

    plan
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApplyMode {
    /// Compute and report the plan without writing anything.
    #[default]
    DryRun,
    Apply,
}

/// Which plan operations a sink can carry out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkCapabilities {
    pub add: bool,
    pub update: bool,
    pub delete: bool,
}

impl SinkCapabilities {
    pub const ALL: SinkCapabilities = SinkCapabilities {
        add: true,
        update: true,
        delete: true,
    };

    /// Removal-only sinks: additions arrive through solution import instead.
    pub const DELETE_ONLY: SinkCapabilities = SinkCapabilities {
        add: false,
        update: false,
        delete: true,
    };
}

/// Produces the local view of one artifact kind.
#[async_trait]
pub trait ArtifactSource<R: IdentityRule>: Send + Sync {
    fn describe(&self) -> String;

    async fn load(&self) -> Result<ArtifactSet<R>>;
}

/// The remote view of one artifact kind plus the writes that change it.
#[async_trait]
pub trait ArtifactSink<R: IdentityRule>: Send + Sync {
    /// Human-readable artifact kind, used in logs and reports.
    fn kind(&self) -> &str;

    fn capabilities(&self) -> SinkCapabilities {
        SinkCapabilities::ALL
    }

    async fn fetch(&self) -> Result<ArtifactSet<R>>;

    async fn add(&self, local: &ArtifactRecord) -> Result<()>;

    async fn update(&self, local: &ArtifactRecord, remote: &ArtifactRecord) -> Result<()>;

    async fn delete(&self, remote: &ArtifactRecord) -> Result<()>;
}

/// Uses a remote view (e.g. another environment) as the local side of a
/// reconciliation.
pub struct RemoteView<S>(pub S);

#[async_trait]
impl<R, S> ArtifactSource<R> for RemoteView<S>
where
    R: IdentityRule,
    S: ArtifactSink<R>,
{
    fn describe(&self) -> String {
        format!("remote {}", self.0.kind())
    }

    async fn load(&self) -> Result<ArtifactSet<R>> {
        self.0.fetch().await
    }
}

/// Outcome of applying (or dry-running) one plan.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ApplyReport {
    pub kind: String,
    pub dry_run: bool,
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
    /// Planned items the sink cannot carry out.
    pub skipped: Vec<String>,
    /// `(identity, reason)` for every item that failed.
    pub failed: Vec<(String, String)>,
}

impl ApplyReport {
    pub fn new(kind: impl Into<String>, dry_run: bool) -> Self {
        Self {
            kind: kind.into(),
            dry_run,
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn changed(&self) -> usize {
        self.added.len() + self.updated.len() + self.deleted.len()
    }

    pub fn failed_identities(&self) -> Vec<String> {
        self.failed.iter().map(|(id, _)| id.clone()).collect()
    }

    /// Turn a report with failures into [`ToolboxError::PartialApply`].
    pub fn ensure_complete(self) -> Result<ApplyReport> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ToolboxError::PartialApply {
                kind: self.kind.clone(),
                attempted: self.changed() + self.failed.len(),
                failed: self.failed_identities(),
            })
        }
    }
}

/// Refuses a plan that would wipe the remote side because the local view
/// came back empty. Callers opt in with `allow_empty`.
pub fn guard_empty_source<R: IdentityRule>(
    kind: &str,
    local: &ArtifactSet<R>,
    remote: &ArtifactSet<R>,
    allow_empty: bool,
) -> Result<()> {
    if local.is_empty() && !remote.is_empty() && !allow_empty {
        error!(kind, remote = remote.len(), "Local view is empty, refusing to delete every remote artifact");
        return Err(ToolboxError::EmptySource {
            kind: kind.to_string(),
            remote: remote.len(),
        });
    }
    Ok(())
}

#[derive(Clone, Copy)]
enum Step {
    Delete,
    Add,
    Update,
}

impl Step {
    fn verb(self, dry_run: bool) -> &'static str {
        match (self, dry_run) {
            (Step::Delete, true) => "Will delete",
            (Step::Add, true) => "Will add",
            (Step::Update, true) => "Will update",
            (Step::Delete, false) => "Deleted",
            (Step::Add, false) => "Added",
            (Step::Update, false) => "Updated",
        }
    }
}

pub struct ReconciliationEngine<'a> {
    reporter: &'a dyn ProgressReporter,
    mode: ApplyMode,
}

impl<'a> ReconciliationEngine<'a> {
    pub fn new(reporter: &'a dyn ProgressReporter, mode: ApplyMode) -> Self {
        Self { reporter, mode }
    }

    /// Load both views concurrently (they are read-only) and diff them.
    pub async fn plan<R: IdentityRule>(
        &self,
        source: &dyn ArtifactSource<R>,
        sink: &dyn ArtifactSink<R>,
    ) -> Result<(ArtifactSet<R>, ArtifactSet<R>, EditPlan)> {
        info!(source = %source.describe(), kind = sink.kind(), "[SYNC] Loading local and remote views");
        let (local, remote) = futures::try_join!(source.load(), sink.fetch())?;
        let plan = reconcile(&local, &remote);
        info!(
            kind = sink.kind(),
            local = local.len(),
            remote = remote.len(),
            add = plan.to_add().len(),
            update = plan.to_update().len(),
            delete = plan.to_delete().len(),
            "[SYNC] Edit plan computed"
        );
        Ok((local, remote, plan))
    }

    /// Apply `plan` through `sink`: deletes, then adds, then updates.
    pub async fn apply<R: IdentityRule>(
        &self,
        plan: EditPlan,
        local: &ArtifactSet<R>,
        remote: &ArtifactSet<R>,
        sink: &dyn ArtifactSink<R>,
    ) -> ApplyReport {
        let dry_run = self.mode == ApplyMode::DryRun;
        let capabilities = sink.capabilities();
        let mut report = ApplyReport::new(sink.kind(), dry_run);

        let EditPlan {
            to_add,
            to_update,
            to_delete,
        } = plan;

        let mut queue: Vec<(Step, ArtifactIdentity)> =
            Vec::with_capacity(to_add.len() + to_update.len() + to_delete.len());
        for identity in to_delete {
            if capabilities.delete {
                queue.push((Step::Delete, identity));
            } else {
                report.skipped.push(identity.name);
            }
        }
        for identity in to_add {
            if capabilities.add {
                queue.push((Step::Add, identity));
            } else {
                report.skipped.push(identity.name);
            }
        }
        for identity in to_update {
            if capabilities.update {
                queue.push((Step::Update, identity));
            } else {
                report.skipped.push(identity.name);
            }
        }

        if !report.skipped.is_empty() {
            info!(kind = sink.kind(), skipped = report.skipped.len(), "[SYNC] Sink does not support some planned changes, skipping them");
        }

        let total = queue.len();
        for (done, (step, identity)) in queue.into_iter().enumerate() {
            let outcome = if dry_run {
                Ok(())
            } else {
                self.apply_one(step, &identity, local, remote, sink).await
            };

            match outcome {
                Ok(()) => {
                    info!(kind = sink.kind(), identity = %identity, "[SYNC] {}", step.verb(dry_run));
                    match step {
                        Step::Delete => report.deleted.push(identity.name.clone()),
                        Step::Add => report.added.push(identity.name.clone()),
                        Step::Update => report.updated.push(identity.name.clone()),
                    }
                }
                Err(e) => {
                    error!(kind = sink.kind(), identity = %identity, error = %e, "[SYNC][ERROR] Failed to apply change, continuing with the rest of the plan");
                    report.failed.push((identity.name.clone(), e.to_string()));
                }
            }

            let percentage = (done + 1) as f64 * 100.0 / total as f64;
            self.reporter.report(
                &format!("{} {} {}", step.verb(dry_run), sink.kind(), identity.name),
                percentage,
            );
        }

        info!(
            kind = sink.kind(),
            dry_run,
            added = report.added.len(),
            updated = report.updated.len(),
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            "[SYNC] Plan applied"
        );
        report
    }

    async fn apply_one<R: IdentityRule>(
        &self,
        step: Step,
        identity: &ArtifactIdentity,
        local: &ArtifactSet<R>,
        remote: &ArtifactSet<R>,
        sink: &dyn ArtifactSink<R>,
    ) -> Result<()> {
        let missing = |side: &str| {
            ToolboxError::not_found(side.to_string(), identity.name.clone())
        };
        match step {
            Step::Delete => {
                let remote_record =
                    remote.get(&identity.key).ok_or_else(|| missing("remote view"))?;
                sink.delete(remote_record).await
            }
            Step::Add => {
                let local_record = local.get(&identity.key).ok_or_else(|| missing("local view"))?;
                sink.add(local_record).await
            }
            Step::Update => {
                let local_record = local.get(&identity.key).ok_or_else(|| missing("local view"))?;
                let remote_record =
                    remote.get(&identity.key).ok_or_else(|| missing("remote view"))?;
                sink.update(local_record, remote_record).await
            }
        }
    }

    /// Plan and apply in one go.
    pub async fn run<R: IdentityRule>(
        &self,
        source: &dyn ArtifactSource<R>,
        sink: &dyn ArtifactSink<R>,
        allow_empty_source: bool,
    ) -> Result<ApplyReport> {
        let (local, remote, plan) = self.plan(source, sink).await?;
        guard_empty_source(sink.kind(), &local, &remote, allow_empty_source)?;
        Ok(self.apply(plan, &local, &remote, sink).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{ExactIdentity, Payload, PathIdentity};

    fn set<R: IdentityRule>(items: &[(&str, &str)]) -> ArtifactSet<R> {
        items
            .iter()
            .map(|(name, body)| ArtifactRecord::new(*name, Payload::Text(body.to_string())))
            .collect()
    }

    fn names(ids: &[ArtifactIdentity]) -> Vec<&str> {
        ids.iter().map(|i| i.name.as_str()).collect()
    }

    #[test]
    fn test_example_plan_adds_updates_and_deletes() {
        let local = set::<PathIdentity>(&[("a.js", "hashA"), ("b.js", "hashB")]);
        let remote = set::<PathIdentity>(&[("b.js", "hashB2"), ("c.js", "hashC")]);
        let plan = reconcile(&local, &remote);
        assert_eq!(names(plan.to_add()), vec!["a.js"]);
        assert_eq!(names(plan.to_update()), vec!["b.js"]);
        assert_eq!(names(plan.to_delete()), vec!["c.js"]);
    }

    #[test]
    fn test_identical_views_yield_empty_plan() {
        let local = set::<ExactIdentity>(&[("x", "1"), ("y", "2")]);
        let plan = reconcile(&local, &local.clone());
        assert!(plan.is_empty());
    }

    #[test]
    fn test_path_identities_match_across_case() {
        let local = set::<PathIdentity>(&[("Scripts/Main.js", "1")]);
        let remote = set::<PathIdentity>(&[("scripts/main.js", "1")]);
        assert!(reconcile(&local, &remote).is_empty());
    }

    #[test]
    fn test_exact_identities_do_not_match_across_case() {
        let local = set::<ExactIdentity>(&[("Flow", "")]);
        let remote = set::<ExactIdentity>(&[("flow", "")]);
        let plan = reconcile(&local, &remote);
        assert_eq!(names(plan.to_add()), vec!["Flow"]);
        assert_eq!(names(plan.to_delete()), vec!["flow"]);
    }

    #[test]
    fn test_add_and_delete_cover_the_symmetric_difference() {
        let local = set::<ExactIdentity>(&[("a", "1"), ("b", "1"), ("c", "1"), ("d", "1")]);
        let remote = set::<ExactIdentity>(&[("c", "2"), ("d", "1"), ("e", "1"), ("f", "1")]);
        let plan = reconcile(&local, &remote);

        let mut diff: Vec<&str> = names(plan.to_add());
        diff.extend(names(plan.to_delete()));
        diff.sort();
        assert_eq!(diff, vec!["a", "b", "e", "f"]);
        assert!(plan
            .to_add()
            .iter()
            .all(|a| plan.to_delete().iter().all(|d| d.key != a.key)));
        assert_eq!(names(plan.to_update()), vec!["c"]);
    }

    #[test]
    fn test_empty_local_plans_to_delete_everything() {
        let local = ArtifactSet::<ExactIdentity>::new();
        let remote = set::<ExactIdentity>(&[("a", "1"), ("b", "1")]);
        let plan = reconcile(&local, &remote);
        assert_eq!(names(plan.to_delete()), vec!["a", "b"]);
        assert!(guard_empty_source("flow", &local, &remote, false).is_err());
        assert!(guard_empty_source("flow", &local, &remote, true).is_ok());
    }

    #[test]
    fn test_report_with_failures_is_partial() {
        let mut report = ApplyReport::new("web resource", false);
        report.added.push("a.js".into());
        report.failed.push(("b.js".into(), "boom".into()));
        match report.ensure_complete() {
            Err(ToolboxError::PartialApply { attempted, failed, .. }) => {
                assert_eq!(attempted, 2);
                assert_eq!(failed, vec!["b.js".to_string()]);
            }
            other => panic!("expected partial apply failure, got {other:?}"),
        }
    }
}
