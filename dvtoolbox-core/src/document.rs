//! Markdown documentation for extension modules, one page per extension point.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::descriptor::{ExtensionModule, ExtensionPoint, ImageRole, TriggerStep};
use crate::error::Result;

fn image_attributes(step: &TriggerStep, role: ImageRole) -> String {
    let mut attributes: Vec<&str> = step
        .image(role)
        .map(|i| i.attributes.iter().map(String::as_str).collect())
        .unwrap_or_default();
    attributes.sort_unstable();
    attributes.join(", ")
}

pub fn render_extension_point(point: &ExtensionPoint) -> String {
    let mut page = String::new();
    let _ = writeln!(page, "# {}", point.full_name);
    let _ = writeln!(page, "{}", point.description.as_deref().unwrap_or_default());
    let _ = writeln!(page, "## Plugin steps");
    for step in &point.steps {
        let _ = writeln!(page, "### {}", step.name);
        let _ = writeln!(page, "{}", step.description.as_deref().unwrap_or_default());
        let _ = writeln!(page, "|Property|Value|");
        let _ = writeln!(page, "|--------|-----|");
        let _ = writeln!(page, "|Message|{}|", step.message);
        let entity = step.entity.as_deref().unwrap_or_default();
        let _ = writeln!(page, "|Triggering entity|{entity}|");
        let _ = writeln!(page, "|Mode|{}|", step.mode);
        let _ = writeln!(page, "|Stage|{}|", step.stage);
        let _ = writeln!(page, "|Filtering attributes|{}|", step.filtering_attributes.join(", "));
        let _ = writeln!(page, "|Pre image|{}|", image_attributes(step, ImageRole::Pre));
        let _ = writeln!(page, "|Post image|{}|", image_attributes(step, ImageRole::Post));
        let _ = writeln!(page, "|AsyncAutoDelete|{}|", step.async_auto_delete);
        let _ = writeln!(page, "|Rank|{}|", step.rank);
        let _ = writeln!(page, "|Supported deployment|{}|", step.supported_deployment);
    }
    page
}

/// Write `<type_name>.md` for every extension point into `dir`.
pub fn write_documentation(module: &ExtensionModule, dir: &Path) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)?;
    let mut written = Vec::with_capacity(module.extension_points.len());
    for point in &module.extension_points {
        info!(extension_point = %point.type_name, "Generating documentation");
        let path = dir.join(format!("{}.md", point.type_name));
        std::fs::write(&path, render_extension_point(point))?;
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ImageDeclaration;
    use uuid::Uuid;

    fn point() -> ExtensionPoint {
        ExtensionPoint {
            id: Uuid::new_v4(),
            full_name: "Contoso.Plugins.AccountPlugin".into(),
            type_name: "AccountPlugin".into(),
            description: Some("Keeps account names tidy.".into()),
            steps: vec![TriggerStep {
                id: Uuid::new_v4(),
                name: "Account: Update".into(),
                description: Some("Trims the name.".into()),
                message: "Update".into(),
                entity: Some("account".into()),
                stage: 20,
                mode: 0,
                rank: 1,
                supported_deployment: 0,
                async_auto_delete: 0,
                filtering_attributes: vec!["name".into(), "accountnumber".into()],
                images: vec![ImageDeclaration {
                    role: ImageRole::Pre,
                    attributes: vec!["name".into(), "accountnumber".into()],
                }],
            }],
        }
    }

    #[test]
    fn test_page_lists_step_properties_with_sorted_image_attributes() {
        let page = render_extension_point(&point());
        assert!(page.starts_with(
            "# Contoso.Plugins.AccountPlugin\nKeeps account names tidy.\n## Plugin steps\n"
        ));
        assert!(page.contains("### Account: Update\n"));
        assert!(page.contains("|Message|Update|\n"));
        assert!(page.contains("|Triggering entity|account|\n"));
        assert!(page.contains("|Filtering attributes|name, accountnumber|\n"));
        assert!(page.contains("|Pre image|accountnumber, name|\n"));
        assert!(page.contains("|Post image||\n"));
    }

    #[test]
    fn test_writes_one_page_per_extension_point() {
        let dir = tempfile::tempdir().unwrap();
        let module = ExtensionModule {
            name: "Contoso.Plugins".into(),
            version: "1.0.0.0".into(),
            module: None,
            extension_points: vec![point()],
        };
        let written = write_documentation(&module, &dir.path().join("docs")).unwrap();
        assert_eq!(written.len(), 1);
        assert!(written[0].ends_with("AccountPlugin.md"));
        assert!(std::fs::read_to_string(&written[0]).unwrap().contains("## Plugin steps"));
    }
}
