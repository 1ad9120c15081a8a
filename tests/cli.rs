use assert_cmd::Command;
use predicates::prelude::*;
use std::fs::write;
use tempfile::TempDir;

const CONNECTION_VARS: [&str; 4] = [
    "DATAVERSE_URL",
    "DATAVERSE_TENANT_ID",
    "DATAVERSE_CLIENT_ID",
    "DATAVERSE_CLIENT_SECRET",
];

fn dvtoolbox() -> Command {
    let mut cmd = Command::cargo_bin("dvtoolbox").expect("Binary exists");
    for var in CONNECTION_VARS {
        cmd.env_remove(var);
    }
    cmd
}

/// Descriptor with one plugin type and one step carrying a pre image.
fn write_descriptor(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("plugins.json");
    write(
        &path,
        r#"{
  "name": "Contoso.Plugins",
  "version": "1.0.0.0",
  "extension_points": [
    {
      "id": "8f2c6a1e-2b0d-4e43-9a51-1c9f0d3b7a10",
      "full_name": "Contoso.Plugins.AccountPlugin",
      "type_name": "AccountPlugin",
      "description": "Keeps account numbers in sync.",
      "steps": [
        {
          "id": "0b7d4c52-64f1-4f4e-8a1b-5c1d2e3f4a5b",
          "name": "Account: Update",
          "message": "Update",
          "entity": "account",
          "stage": 40,
          "mode": 0,
          "filtering_attributes": ["accountnumber"],
          "images": [{ "role": "pre", "attributes": ["name", "accountnumber"] }]
        }
      ]
    }
  ]
}"#,
    )
    .expect("Writing descriptor failed");
    path
}

#[test]
fn test_help_lists_commands() {
    dvtoolbox()
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("import")
                .and(predicate::str::contains("export"))
                .and(predicate::str::contains("sync-web-resources"))
                .and(predicate::str::contains("remove-deleted-items"))
                .and(predicate::str::contains("flow-diagrams"))
                .and(predicate::str::contains("register-plugins"))
                .and(predicate::str::contains("document-plugins")),
        );
}

#[test]
fn test_missing_connection_names_the_setting() {
    dvtoolbox()
        .arg("publish-all")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("DATAVERSE_URL"));
}

#[test]
fn test_missing_secret_is_reported_when_flags_give_the_rest() {
    dvtoolbox()
        .args([
            "publish-all",
            "--url",
            "https://contoso.crm.dynamics.com",
            "--tenant-id",
            "tenant",
            "--client-id",
            "client",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("DATAVERSE_CLIENT_SECRET"));
}

#[test]
fn test_unreadable_config_file_fails() {
    dvtoolbox()
        .args(["publish-all", "--config", "does/not/exist.yaml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read config file"));
}

#[test]
fn test_remove_deleted_items_requires_a_local_view() {
    dvtoolbox()
        .args(["remove-deleted-items", "contoso"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--package"));
}

#[test]
fn test_document_plugins_writes_one_page_per_plugin_type() {
    let dir = TempDir::new().expect("temp dir");
    let descriptor = write_descriptor(&dir);
    let out = dir.path().join("docs");

    dvtoolbox()
        .arg("document-plugins")
        .arg(&descriptor)
        .arg(&out)
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote 1 page(s)"));

    let page = std::fs::read_to_string(out.join("AccountPlugin.md")).expect("page written");
    assert!(page.starts_with("# Contoso.Plugins.AccountPlugin"));
    assert!(page.contains("|Pre image|accountnumber, name|"));
}

use std::sync::{Arc, Mutex};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{layer::Context, Layer, Registry};

/// Custom Layer to collect emitted event messages.
struct EventCollector {
    events: Arc<Mutex<Vec<String>>>,
}

impl<S> Layer<S> for EventCollector
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        self.events.lock().unwrap().push(format!("{:?}", event));
    }
}

#[tokio::test]
async fn test_emits_trace_initialised_event() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let collector = EventCollector {
        events: events.clone(),
    };
    let subscriber = Registry::default().with(collector);
    let _guard = tracing::subscriber::set_default(subscriber);

    use dvtoolbox::cli::{run, Cli, Commands, GlobalArgs};

    let cli = Cli {
        global: GlobalArgs::default(),
        command: Commands::DocumentPlugins {
            descriptor: std::path::PathBuf::from("dummy.json"),
            output: std::path::PathBuf::from("dummy-docs"),
        },
    };

    let result = run(cli).await;
    assert!(result.is_err());

    let event_msgs = events.lock().unwrap();
    assert!(
        event_msgs.iter().any(|msg| msg.contains("trace_initialised")),
        "Expected a 'trace_initialised' trace event, got: {:?}",
        event_msgs
    );
}
