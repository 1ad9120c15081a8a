//! Read-only access to a solution package (zip): the manifest in
//! `solution.xml` and the component declarations in `customizations.xml`.

use std::fs::File;
use std::io::Read;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use roxmltree::{Document, Node};
use tracing::{debug, info};
use uuid::Uuid;
use zip::ZipArchive;

use crate::artifact::{ArtifactRecord, ArtifactSet, IdentityRule};
use crate::error::{Result, ToolboxError};
use crate::reconcile::ArtifactSource;

const SOLUTION_ENTRY: &str = "solution.xml";
const CUSTOMIZATIONS_ENTRY: &str = "customizations.xml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolutionManifest {
    pub unique_name: String,
    pub version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    WebResource,
    ConnectionReference,
    /// Modern (cloud) flows: workflows with category 5 and type 1.
    Flow,
}

impl ComponentKind {
    pub fn label(self) -> &'static str {
        match self {
            ComponentKind::WebResource => "web resource",
            ComponentKind::ConnectionReference => "connection reference",
            ComponentKind::Flow => "flow",
        }
    }
}

/// A component declared in the package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageComponent {
    pub name: String,
    pub id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct SolutionPackage {
    path: PathBuf,
}

fn package_error(path: &Path, detail: impl std::fmt::Display) -> ToolboxError {
    ToolboxError::Package(format!("{}: {detail}", path.display()))
}

fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|n| n.is_element() && n.tag_name().name() == name)
}

fn children<'a, 'input>(
    node: Node<'a, 'input>,
    name: &'a str,
) -> impl Iterator<Item = Node<'a, 'input>> + 'a {
    node.children()
        .filter(move |n| n.is_element() && n.tag_name().name() == name)
}

fn child_text<'a>(node: Node<'a, '_>, name: &str) -> Option<&'a str> {
    child(node, name).and_then(|n| n.text()).map(str::trim)
}

impl SolutionPackage {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.is_file() {
            return Err(package_error(&path, "not a file"));
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whole package, as sent to the import operation.
    pub fn bytes(&self) -> Result<Vec<u8>> {
        Ok(std::fs::read(&self.path)?)
    }

    /// Text of the entry whose file name is `name`, in any folder.
    fn read_entry(&self, name: &str) -> Result<String> {
        let file = File::open(&self.path)?;
        let mut archive = ZipArchive::new(file).map_err(|e| package_error(&self.path, e))?;
        let entry_name = archive
            .file_names()
            .find(|n| n.rsplit('/').next() == Some(name))
            .map(str::to_string)
            .ok_or_else(|| package_error(&self.path, format!("no {name} entry")))?;
        let mut entry = archive
            .by_name(&entry_name)
            .map_err(|e| package_error(&self.path, e))?;
        let mut text = String::new();
        entry.read_to_string(&mut text)?;
        debug!(package = %self.path.display(), entry = %entry_name, bytes = text.len(), "Read package entry");
        Ok(text)
    }

    pub fn manifest(&self) -> Result<SolutionManifest> {
        let text = self.read_entry(SOLUTION_ENTRY)?;
        let doc = Document::parse(&text).map_err(|e| package_error(&self.path, e))?;
        let manifest = child(doc.root_element(), "SolutionManifest")
            .ok_or_else(|| package_error(&self.path, "solution.xml has no SolutionManifest"))?;
        let unique_name = child_text(manifest, "UniqueName")
            .ok_or_else(|| package_error(&self.path, "manifest has no UniqueName"))?;
        let version = child_text(manifest, "Version").unwrap_or_default();
        Ok(SolutionManifest {
            unique_name: unique_name.to_string(),
            version: version.to_string(),
        })
    }

    /// Top-level declarations of one component kind, in document order.
    pub fn components(&self, kind: ComponentKind) -> Result<Vec<PackageComponent>> {
        let text = self.read_entry(CUSTOMIZATIONS_ENTRY)?;
        let doc = Document::parse(&text).map_err(|e| package_error(&self.path, e))?;
        let root = doc.root_element();

        let parse_id = |raw: Option<&str>| {
            raw.map(|s| s.trim_matches(|c| c == '{' || c == '}'))
                .and_then(|s| Uuid::parse_str(s).ok())
        };

        let components: Vec<PackageComponent> = match kind {
            ComponentKind::WebResource => child(root, "WebResources")
                .map(|list| {
                    children(list, "WebResource")
                        .filter_map(|wr| {
                            Some(PackageComponent {
                                name: child_text(wr, "Name")?.to_string(),
                                id: parse_id(child_text(wr, "WebResourceId")),
                            })
                        })
                        .collect()
                })
                .unwrap_or_default(),
            ComponentKind::ConnectionReference => child(root, "connectionreferences")
                .map(|list| {
                    children(list, "connectionreference")
                        .filter_map(|cr| {
                            Some(PackageComponent {
                                name: cr.attribute("connectionreferencelogicalname")?.to_string(),
                                id: None,
                            })
                        })
                        .collect()
                })
                .unwrap_or_default(),
            ComponentKind::Flow => child(root, "Workflows")
                .map(|list| {
                    children(list, "Workflow")
                        .filter(|wf| {
                            child_text(*wf, "Category") == Some("5")
                                && child_text(*wf, "Type") == Some("1")
                        })
                        .filter_map(|wf| {
                            Some(PackageComponent {
                                name: wf.attribute("Name")?.to_string(),
                                id: parse_id(wf.attribute("WorkflowId")),
                            })
                        })
                        .collect()
                })
                .unwrap_or_default(),
        };

        info!(package = %self.path.display(), kind = kind.label(), count = components.len(), "Read package components");
        Ok(components)
    }
}

/// A package's declarations of one kind as the local view.
pub struct PackageSource<R> {
    package: SolutionPackage,
    kind: ComponentKind,
    rule: PhantomData<fn() -> R>,
}

impl<R: IdentityRule> PackageSource<R> {
    pub fn new(package: SolutionPackage, kind: ComponentKind) -> Self {
        Self {
            package,
            kind,
            rule: PhantomData,
        }
    }
}

#[async_trait]
impl<R: IdentityRule> ArtifactSource<R> for PackageSource<R> {
    fn describe(&self) -> String {
        format!("{}s in {}", self.kind.label(), self.package.path().display())
    }

    async fn load(&self) -> Result<ArtifactSet<R>> {
        let components = self.package.components(self.kind)?;
        Ok(components
            .into_iter()
            .map(|c| {
                let record = ArtifactRecord::marker(c.name);
                match c.id {
                    Some(id) => record.with_remote_id(id),
                    None => record,
                }
            })
            .collect())
    }
}
