//! Registration of an extension module: assembly, extension points (plugin
//! types), trigger steps and their data images.
//!
//! Every level is update-if-exists-else-create. The assembly is keyed by
//! name; extension points and steps by their declared ids; images by
//! (step, role). Components are added to the solution only when created.
//!
//! With remote sync enabled, the registered steps of each extension point
//! are diffed against the descriptor first. Remote steps missing locally
//! are pending removals; if none are missing, each step's image roles are
//! diffed the same way. Only customizable records are deleted, and only in
//! [`ApplyMode::Apply`].

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use futures::future::try_join_all;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::artifact::{composite_name, ArtifactRecord, ArtifactSet, ExactIdentity};
use crate::contract::{EntityRef, Field, Query, Record, RemoteClient};
use crate::descriptor::{
    message_property_name, ExtensionModule, ExtensionPoint, ImageDeclaration, ImageRole,
    TriggerStep,
};
use crate::error::{Result, ToolboxError};
use crate::lookup::{self, component_type};
use crate::reconcile::{reconcile, ApplyMode};

/// Descriptive text cap for remote description fields.
pub const DESCRIPTION_LIMIT: usize = 256;

const ASSEMBLY: &str = "pluginassembly";
const PLUGIN_TYPE: &str = "plugintype";
const STEP: &str = "sdkmessageprocessingstep";
const IMAGE: &str = "sdkmessageprocessingstepimage";

fn truncate(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationOptions {
    /// Solution that newly created components join.
    pub solution: Option<String>,
    /// Diff remote steps and images against the descriptor before registering.
    pub sync_remote: bool,
    pub mode: ApplyMode,
    /// Update the assembly and stop.
    pub assembly_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalKind {
    ExtensionPoint,
    Step,
    Image,
}

/// A remote registration with no local counterpart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRemoval {
    pub kind: RemovalKind,
    pub id: Uuid,
    pub name: String,
    pub customizable: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistrationReport {
    pub assembly_id: Option<Uuid>,
    pub created: Vec<String>,
    pub updated: Vec<String>,
    /// Remote-only records that were reported but kept.
    pub pending_removals: Vec<PendingRemoval>,
    pub removed: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl RegistrationReport {
    fn record(&mut self, created: bool, label: String) {
        if created {
            self.created.push(label);
        } else {
            self.updated.push(label);
        }
    }
}

/// Message and optional filter a step binds to.
struct StepBinding {
    message: EntityRef,
    filter: Option<EntityRef>,
}

/// Remote step as seen by the sync diff.
struct RemoteStep {
    id: Uuid,
    name: String,
    customizable: bool,
}

pub struct RegistrationSync<'a> {
    client: &'a dyn RemoteClient,
    options: RegistrationOptions,
}

impl<'a> RegistrationSync<'a> {
    pub fn new(client: &'a dyn RemoteClient, options: RegistrationOptions) -> Self {
        Self { client, options }
    }

    /// Register a module, reading its compiled content from disk.
    pub async fn register(&self, module: &ExtensionModule) -> Result<RegistrationReport> {
        let content = module.content()?;
        self.register_with_content(module, &content).await
    }

    pub async fn register_with_content(
        &self,
        module: &ExtensionModule,
        content: &[u8],
    ) -> Result<RegistrationReport> {
        module.validate()?;
        info!(
            module = %module.name,
            version = %module.version,
            solution = ?self.options.solution,
            "[REGISTER] Registering extension module"
        );
        let mut report = RegistrationReport::default();

        // Lookups that can abort the run happen before anything is written.
        let bindings = if self.options.assembly_only {
            HashMap::new()
        } else {
            self.resolve_bindings(module).await?
        };

        if self.options.sync_remote {
            self.sync_remote(module, &mut report).await?;
        }

        let assembly_id = self.register_assembly(module, content, &mut report).await?;
        report.assembly_id = Some(assembly_id);

        if self.options.assembly_only {
            info!(module = %module.name, "[REGISTER] Assembly only, skipping extension points");
            return Ok(report);
        }

        for point in &module.extension_points {
            self.register_extension_point(assembly_id, point, &bindings, &mut report)
                .await?;
        }

        info!(
            module = %module.name,
            created = report.created.len(),
            updated = report.updated.len(),
            pending_removals = report.pending_removals.len(),
            removed = report.removed.len(),
            "[REGISTER] Done"
        );
        Ok(report)
    }

    async fn register_assembly(
        &self,
        module: &ExtensionModule,
        content: &[u8],
        report: &mut RegistrationReport,
    ) -> Result<Uuid> {
        let existing = lookup::existing_id(
            self.client,
            &Query::new(ASSEMBLY).select(&["pluginassemblyid"]).eq("name", module.name.as_str()),
        )
        .await?;
        let record = Record::new(ASSEMBLY)
            .set("version", module.version.as_str())
            .set("name", module.name.as_str())
            .set("isolationmode", Field::Choice(2))
            .set("content", STANDARD.encode(content));

        let label = format!("plugin assembly {}", module.name);
        let id = match existing {
            Some(id) => {
                info!(assembly = %module.name, %id, "[REGISTER] Updating plugin assembly");
                self.client.update(&Record { id: Some(id), ..record }).await?;
                report.record(false, label);
                id
            }
            None => {
                info!(assembly = %module.name, "[REGISTER] Creating plugin assembly");
                let id = self.client.create(&record).await?;
                lookup::add_solution_component(
                    self.client,
                    self.options.solution.as_deref(),
                    id,
                    component_type::PLUGIN_ASSEMBLY,
                )
                .await?;
                report.record(true, label);
                id
            }
        };
        Ok(id)
    }

    async fn register_extension_point(
        &self,
        assembly_id: Uuid,
        point: &ExtensionPoint,
        bindings: &HashMap<Uuid, StepBinding>,
        report: &mut RegistrationReport,
    ) -> Result<()> {
        info!(extension_point = %point.full_name, "[REGISTER] Registering plugin type");
        let record = Record::with_id(PLUGIN_TYPE, point.id)
            .set("plugintypeid", point.id)
            .set("typename", point.full_name.as_str())
            .set("name", point.full_name.as_str())
            .set("friendlyname", point.type_name.as_str())
            .set(
                "description",
                point.description.as_deref().map(|d| truncate(d, DESCRIPTION_LIMIT)),
            )
            .set("pluginassemblyid", EntityRef::new(ASSEMBLY, assembly_id));

        let existing = lookup::existing_id(
            self.client,
            &Query::new(PLUGIN_TYPE).select(&["plugintypeid"]).eq("plugintypeid", point.id),
        )
        .await?;
        let label = format!("plugin type {}", point.full_name);
        match existing {
            Some(_) => {
                self.client.update(&record).await?;
                report.record(false, label);
            }
            None => {
                self.client.create(&record).await?;
                report.record(true, label);
            }
        }

        for step in &point.steps {
            let binding = bindings
                .get(&step.id)
                .ok_or_else(|| ToolboxError::not_found("sdkmessage", step.message.clone()))?;
            let step_id = self.register_step(point.id, step, binding, report).await?;
            self.register_images(step, step_id, report).await?;
        }
        Ok(())
    }

    async fn resolve_bindings(
        &self,
        module: &ExtensionModule,
    ) -> Result<HashMap<Uuid, StepBinding>> {
        let mut bindings = HashMap::new();
        for step in module.extension_points.iter().flat_map(|p| &p.steps) {
            bindings.insert(step.id, self.resolve_binding(step).await?);
        }
        Ok(bindings)
    }

    async fn resolve_binding(&self, step: &TriggerStep) -> Result<StepBinding> {
        let message = lookup::find_unique(
            self.client,
            &Query::new("sdkmessage")
                .select(&["sdkmessageid", "name"])
                .eq("name", step.message.as_str()),
        )
        .await?
        .and_then(|r| r.to_ref())
        .ok_or_else(|| ToolboxError::not_found("sdkmessage", step.message.clone()))?;

        let filter = match step.entity.as_deref().filter(|e| !e.is_empty()) {
            Some(entity) => Some(
                lookup::find_unique(
                    self.client,
                    &Query::new("sdkmessagefilter")
                        .select(&["sdkmessagefilterid"])
                        .eq("primaryobjecttypecode", entity)
                        .eq("sdkmessageid", message.id),
                )
                .await?
                .and_then(|r| r.to_ref())
                .ok_or_else(|| {
                    let what = format!("{} on {entity}", step.message);
                    ToolboxError::not_found("sdkmessagefilter", what)
                })?,
            ),
            None => None,
        };
        Ok(StepBinding { message, filter })
    }

    async fn register_step(
        &self,
        plugin_type_id: Uuid,
        step: &TriggerStep,
        binding: &StepBinding,
        report: &mut RegistrationReport,
    ) -> Result<Uuid> {
        info!(
            step = %step.name,
            message = %step.message,
            entity = ?step.entity,
            filtering = %step.filtering_attributes.join(" "),
            "[REGISTER] Registering step"
        );

        let record = Record::with_id(STEP, step.id)
            .set("sdkmessageprocessingstepid", step.id)
            .set("filteringattributes", step.filtering_attributes.join(","))
            .set("mode", Field::Choice(step.mode))
            .set("name", step.name.as_str())
            .set(
                "description",
                step.description.as_deref().map(|d| truncate(d, DESCRIPTION_LIMIT)),
            )
            .set("rank", step.rank)
            .set("stage", Field::Choice(step.stage))
            .set("supporteddeployment", Field::Choice(step.supported_deployment))
            .set("plugintypeid", EntityRef::new(PLUGIN_TYPE, plugin_type_id))
            .set("sdkmessageid", binding.message.clone())
            .set("sdkmessagefilterid", binding.filter.clone());

        let existing = lookup::existing_id(
            self.client,
            &Query::new(STEP)
                .select(&["sdkmessageprocessingstepid"])
                .eq("sdkmessageprocessingstepid", step.id),
        )
        .await?;
        let label = format!("step {}", step.name);
        let id = match existing {
            Some(id) => {
                self.client.update(&Record { id: Some(id), ..record }).await?;
                report.record(false, label);
                id
            }
            None => {
                let id = self.client.create(&record).await?;
                lookup::add_solution_component(
                    self.client,
                    self.options.solution.as_deref(),
                    id,
                    component_type::SDK_MESSAGE_PROCESSING_STEP,
                )
                .await?;
                report.record(true, label);
                id
            }
        };
        Ok(id)
    }

    async fn register_images(
        &self,
        step: &TriggerStep,
        step_id: Uuid,
        report: &mut RegistrationReport,
    ) -> Result<()> {
        if step.images.is_empty() {
            return Ok(());
        }
        let property = message_property_name(&step.message).ok_or_else(|| {
            ToolboxError::Descriptor(format!("message '{}' takes no images", step.message))
        })?;

        // Existence lookups are read-only and independent, so run them together.
        let existing = try_join_all(step.images.iter().map(|image| {
            let query = Query::new(IMAGE)
                .select(&["sdkmessageprocessingstepimageid"])
                .eq("entityalias", image.role.entity_alias())
                .eq("sdkmessageprocessingstepid", step_id);
            async move { lookup::existing_id(self.client, &query).await }
        }))
        .await?;

        for (image, existing_id) in step.images.iter().zip(existing) {
            let record = image_record(image, property, step_id);
            let label = format!("{} of {}", image.role.label(), step.name);
            match existing_id {
                Some(id) => {
                    self.client.update(&Record { id: Some(id), ..record }).await?;
                    report.record(false, label);
                }
                None => {
                    self.client.create(&record).await?;
                    report.record(true, label);
                }
            }
        }
        Ok(())
    }

    async fn sync_remote(
        &self,
        module: &ExtensionModule,
        report: &mut RegistrationReport,
    ) -> Result<()> {
        let Some(assembly_id) = lookup::existing_id(
            self.client,
            &Query::new(ASSEMBLY).select(&["pluginassemblyid"]).eq("name", module.name.as_str()),
        )
        .await?
        else {
            debug!(module = %module.name, "[REGISTER] Assembly not registered yet, nothing to sync");
            return Ok(());
        };

        let remote_types = self
            .client
            .query(
                &Query::new(PLUGIN_TYPE)
                    .select(&["plugintypeid", "typename"])
                    .eq("pluginassemblyid", assembly_id),
            )
            .await?;

        for remote_type in remote_types {
            let Some(type_id) = remote_type.record_id() else {
                continue;
            };
            let type_name = remote_type.text("typename").unwrap_or_default().to_string();
            match module.extension_points.iter().find(|p| p.id == type_id) {
                None => {
                    warn!(plugin_type = %type_name, %type_id, "[REGISTER] Will remove plugin type");
                    report.pending_removals.push(PendingRemoval {
                        kind: RemovalKind::ExtensionPoint,
                        id: type_id,
                        name: type_name,
                        customizable: false,
                    });
                }
                Some(point) => self.sync_steps(point, report).await?,
            }
        }
        Ok(())
    }

    async fn sync_steps(
        &self,
        point: &ExtensionPoint,
        report: &mut RegistrationReport,
    ) -> Result<()> {
        let rows = self
            .client
            .query(
                &Query::new(STEP)
                    .select(&["sdkmessageprocessingstepid", "name", "iscustomizable"])
                    .eq("plugintypeid", point.id),
            )
            .await?;
        let remote_steps: Vec<RemoteStep> = rows
            .iter()
            .filter_map(|row| {
                Some(RemoteStep {
                    id: row.record_id()?,
                    name: row.text("name").unwrap_or_default().to_string(),
                    customizable: row.flag("iscustomizable").unwrap_or(false),
                })
            })
            .collect();

        let local: ArtifactSet<ExactIdentity> = point
            .steps
            .iter()
            .map(|s| ArtifactRecord::marker(s.id.to_string()))
            .collect();
        let remote: ArtifactSet<ExactIdentity> = remote_steps
            .iter()
            .map(|s| ArtifactRecord::marker(s.id.to_string()).with_remote_id(s.id))
            .collect();
        let plan = reconcile(&local, &remote);

        if !plan.to_delete().is_empty() {
            for identity in plan.to_delete() {
                let Some(step) = remote_steps.iter().find(|s| s.id.to_string() == identity.key)
                else {
                    continue;
                };
                let removal = PendingRemoval {
                    kind: RemovalKind::Step,
                    id: step.id,
                    name: step.name.clone(),
                    customizable: step.customizable,
                };
                self.remove(STEP, removal, report).await;
            }
            return Ok(());
        }

        for step in &remote_steps {
            let Some(local_step) = point.steps.iter().find(|s| s.id == step.id) else {
                continue;
            };
            self.sync_images(local_step, step, report).await?;
        }
        Ok(())
    }

    async fn sync_images(
        &self,
        local_step: &TriggerStep,
        remote_step: &RemoteStep,
        report: &mut RegistrationReport,
    ) -> Result<()> {
        let rows = self
            .client
            .query(
                &Query::new(IMAGE)
                    .select(&[
                        "sdkmessageprocessingstepimageid",
                        "imagetype",
                        "name",
                        "iscustomizable",
                    ])
                    .eq("sdkmessageprocessingstepid", remote_step.id),
            )
            .await?;

        let role_key =
            |role: ImageRole| composite_name(&[&remote_step.id.to_string(), role.entity_alias()]);
        let local: ArtifactSet<ExactIdentity> = local_step
            .images
            .iter()
            .map(|i| ArtifactRecord::marker(role_key(i.role)))
            .collect();
        let mut remote = ArtifactSet::<ExactIdentity>::new();
        for row in &rows {
            let (Some(id), Some(role)) = (
                row.record_id(),
                row.int("imagetype").and_then(ImageRole::from_image_type),
            ) else {
                continue;
            };
            remote.insert(ArtifactRecord::marker(role_key(role)).with_remote_id(id));
        }

        let plan = reconcile(&local, &remote);
        for identity in plan.to_delete() {
            let Some(id) = remote.get(&identity.key).and_then(|r| r.remote_id) else {
                continue;
            };
            let customizable = rows
                .iter()
                .find(|r| r.record_id() == Some(id))
                .and_then(|r| r.flag("iscustomizable"))
                .unwrap_or(remote_step.customizable);
            let removal = PendingRemoval {
                kind: RemovalKind::Image,
                id,
                name: format!(
                    "{} image of {}",
                    identity.key.rsplit('/').next().unwrap_or_default(),
                    remote_step.name
                ),
                customizable,
            };
            self.remove(IMAGE, removal, report).await;
        }
        Ok(())
    }

    /// Delete a customizable record in apply mode; report everything else.
    async fn remove(&self, entity: &str, removal: PendingRemoval, report: &mut RegistrationReport) {
        if !removal.customizable || self.options.mode == ApplyMode::DryRun {
            warn!(
                entity,
                id = %removal.id,
                name = %removal.name,
                customizable = removal.customizable,
                "[REGISTER] Will remove"
            );
            report.pending_removals.push(removal);
            return;
        }
        match self.client.delete(entity, removal.id).await {
            Ok(()) => {
                info!(entity, id = %removal.id, name = %removal.name, "[REGISTER] Removed");
                report.removed.push(removal.name);
            }
            Err(e) => {
                error!(
                    entity,
                    id = %removal.id,
                    name = %removal.name,
                    error = %e,
                    "[REGISTER][ERROR] Could not remove"
                );
                report.failed.push((removal.name, e.to_string()));
            }
        }
    }
}

fn image_record(image: &ImageDeclaration, property: &str, step_id: Uuid) -> Record {
    Record::new(IMAGE)
        .set("attributes", image.attributes.join(","))
        .set("description", image.role.label())
        .set("entityalias", image.role.entity_alias())
        .set("imagetype", Field::Choice(image.role.image_type()))
        .set("messagepropertyname", property)
        .set("name", image.role.label())
        .set("sdkmessageprocessingstepid", EntityRef::new(STEP, step_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptions_are_capped_by_characters() {
        let long = "å".repeat(300);
        assert_eq!(truncate(&long, DESCRIPTION_LIMIT).chars().count(), 256);
        assert_eq!(truncate("short", DESCRIPTION_LIMIT), "short");
    }

    #[test]
    fn test_image_record_carries_role_and_property() {
        let step_id = Uuid::new_v4();
        let image = ImageDeclaration {
            role: ImageRole::Post,
            attributes: vec!["name".into(), "revenue".into()],
        };
        let record = image_record(&image, "Target", step_id);
        assert_eq!(record.text("attributes"), Some("name,revenue"));
        assert_eq!(record.text("entityalias"), Some("postEntityImage"));
        assert_eq!(record.int("imagetype"), Some(1));
        assert_eq!(record.text("messagepropertyname"), Some("Target"));
        assert_eq!(record.uuid("sdkmessageprocessingstepid"), Some(step_id));
    }
}
