//! Extension descriptors: the typed description of a compiled extension
//! module, produced by an external extraction step and read from JSON.
//!
//! ```json
//! {
//!   "name": "Contoso.Plugins",
//!   "version": "1.2.0.0",
//!   "module": "bin/Contoso.Plugins.dll",
//!   "extension_points": [{
//!     "id": "6f1c...", "full_name": "Contoso.Plugins.AccountPlugin",
//!     "type_name": "AccountPlugin", "description": "...",
//!     "steps": [{
//!       "id": "0b9e...", "name": "Account: Update", "message": "Update",
//!       "entity": "account", "stage": 40, "mode": 0, "rank": 1,
//!       "filtering_attributes": ["name"],
//!       "images": [{ "role": "pre", "attributes": ["name"] }]
//!     }]
//!   }]
//! }
//! ```
//!
//! Step and extension point ids are assigned at declaration time and stay
//! stable across builds, so registration can tell an edited step from a new one.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{Result, ToolboxError};

/// Attribute name under which each trigger message passes its target record.
pub fn message_property_name(message: &str) -> Option<&'static str> {
    match message {
        "Assign" => Some("Target"),
        "Create" => Some("id"),
        "Delete" => Some("Target"),
        "DeliverIncoming" => Some("Target"),
        "DeliverPromote" => Some("Target"),
        "Route" => Some("Target"),
        "Send" => Some("emailId"),
        "SetStateDynamicEntity" => Some("entityMoniker"),
        "Update" => Some("Target"),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageRole {
    Pre,
    Post,
}

impl ImageRole {
    /// `imagetype` option value.
    pub fn image_type(self) -> i32 {
        match self {
            ImageRole::Pre => 0,
            ImageRole::Post => 1,
        }
    }

    pub fn from_image_type(value: i64) -> Option<Self> {
        match value {
            0 => Some(ImageRole::Pre),
            1 => Some(ImageRole::Post),
            _ => None,
        }
    }

    pub fn entity_alias(self) -> &'static str {
        match self {
            ImageRole::Pre => "preEntityImage",
            ImageRole::Post => "postEntityImage",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ImageRole::Pre => "Pre entity image",
            ImageRole::Post => "Post entity image",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDeclaration {
    pub role: ImageRole,
    #[serde(default)]
    pub attributes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerStep {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub message: String,
    /// Target entity filter; none means every entity.
    #[serde(default)]
    pub entity: Option<String>,
    pub stage: i32,
    pub mode: i32,
    #[serde(default)]
    pub rank: i32,
    #[serde(default)]
    pub supported_deployment: i32,
    #[serde(default)]
    pub async_auto_delete: i32,
    #[serde(default)]
    pub filtering_attributes: Vec<String>,
    #[serde(default)]
    pub images: Vec<ImageDeclaration>,
}

impl TriggerStep {
    pub fn image(&self, role: ImageRole) -> Option<&ImageDeclaration> {
        self.images.iter().find(|i| i.role == role)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionPoint {
    pub id: Uuid,
    pub full_name: String,
    pub type_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub steps: Vec<TriggerStep>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionModule {
    pub name: String,
    pub version: String,
    /// Compiled module, relative to the descriptor file until loaded.
    #[serde(default)]
    pub module: Option<PathBuf>,
    #[serde(default)]
    pub extension_points: Vec<ExtensionPoint>,
}

impl ExtensionModule {
    /// Structural checks registration relies on.
    pub fn validate(&self) -> Result<()> {
        let mut point_ids = HashSet::new();
        let mut step_ids = HashSet::new();
        for point in &self.extension_points {
            if !point_ids.insert(point.id) {
                return Err(ToolboxError::Descriptor(format!(
                    "extension point id {} is declared twice",
                    point.id
                )));
            }
            for step in &point.steps {
                if !step_ids.insert(step.id) {
                    return Err(ToolboxError::Descriptor(format!(
                        "step id {} ('{}') is declared twice",
                        step.id, step.name
                    )));
                }
                let mut roles = HashSet::new();
                for image in &step.images {
                    if !roles.insert(image.role) {
                        return Err(ToolboxError::Descriptor(format!(
                            "step '{}' declares more than one {:?} image",
                            step.name, image.role
                        )));
                    }
                }
                if !step.images.is_empty() && message_property_name(&step.message).is_none() {
                    return Err(ToolboxError::Descriptor(format!(
                        "step '{}' declares images but message '{}' has no image property",
                        step.name, step.message
                    )));
                }
            }
        }
        Ok(())
    }

    /// Bytes of the compiled module.
    pub fn content(&self) -> Result<Vec<u8>> {
        let path = self.module.as_ref().ok_or_else(|| {
            ToolboxError::Descriptor(format!("descriptor for '{}' names no module file", self.name))
        })?;
        std::fs::read(path).map_err(|e| {
            ToolboxError::Descriptor(format!("cannot read module {}: {e}", path.display()))
        })
    }

    pub fn step_count(&self) -> usize {
        self.extension_points.iter().map(|p| p.steps.len()).sum()
    }
}

/// Read and validate a descriptor file. A relative `module` path is resolved
/// against the descriptor's folder.
pub fn load_descriptor(path: &Path) -> Result<ExtensionModule> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        ToolboxError::Descriptor(format!("cannot read {}: {e}", path.display()))
    })?;
    let mut module: ExtensionModule = serde_json::from_str(&text)
        .map_err(|e| ToolboxError::Descriptor(format!("{}: {e}", path.display())))?;
    if let Some(relative) = module.module.as_ref().filter(|p| p.is_relative()) {
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        module.module = Some(base.join(relative));
    }
    module.validate()?;
    info!(
        descriptor = %path.display(),
        module = %module.name,
        version = %module.version,
        extension_points = module.extension_points.len(),
        steps = module.step_count(),
        "Loaded extension descriptor"
    );
    Ok(module)
}
