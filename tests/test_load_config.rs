use dvtoolbox::load_config::{load_config, resolve_connection, ConnectionOverrides};
use dvtoolbox_core::progress::ProgressMode;
use serial_test::serial;
use std::env;
use std::fs::write;
use std::path::Path;
use std::time::Duration;
use tempfile::NamedTempFile;

const VARS: [&str; 4] = [
    "DATAVERSE_URL",
    "DATAVERSE_TENANT_ID",
    "DATAVERSE_CLIENT_ID",
    "DATAVERSE_CLIENT_SECRET",
];

fn clear_env() {
    for var in VARS {
        env::remove_var(var);
    }
}

/// File values are kept, gaps come from the environment and the secret is
/// always taken from the environment.
#[tokio::test]
#[serial]
async fn test_load_config_merges_file_and_env() {
    clear_env();
    let config_yaml = r#"
connection:
  url: https://contoso.crm.dynamics.com/
  client_id: from-file
tracking:
  poll_interval_ms: 250
progress: ci
strict: true
"#;
    let config_file = NamedTempFile::new().expect("temp file");
    write(config_file.path(), config_yaml).unwrap();

    env::set_var("DATAVERSE_TENANT_ID", "tenant-from-env");
    env::set_var("DATAVERSE_CLIENT_ID", "ignored-because-file-has-it");
    env::set_var("DATAVERSE_CLIENT_SECRET", "top-secret");

    let config = load_config(Some(config_file.path())).expect("Config should load");
    assert_eq!(config.connection.client_id, "from-file");
    assert_eq!(config.connection.tenant_id, "tenant-from-env");
    assert_eq!(config.connection.client_secret, "top-secret");
    assert_eq!(config.tracking.poll_interval(), Duration::from_millis(250));
    assert_eq!(config.progress, ProgressMode::Ci);
    assert!(config.strict);

    let connection = resolve_connection(&config, &ConnectionOverrides::default()).unwrap();
    assert_eq!(connection.url, "https://contoso.crm.dynamics.com");
    clear_env();
}

/// A secret written into the file is never used.
#[tokio::test]
#[serial]
async fn test_missing_secret_names_the_variable() {
    clear_env();
    let config_yaml = r#"
connection:
  url: https://contoso.crm.dynamics.com
  tenant_id: tenant
  client_id: client
  client_secret: should-be-ignored
"#;
    let config_file = NamedTempFile::new().expect("temp file");
    write(config_file.path(), config_yaml).unwrap();

    let config = load_config(Some(config_file.path())).expect("Config should load");
    let err = resolve_connection(&config, &ConnectionOverrides::default()).unwrap_err();
    assert!(
        err.to_string().contains("DATAVERSE_CLIENT_SECRET"),
        "Must name the secret variable, got: {err}"
    );
}

#[tokio::test]
#[serial]
async fn test_flags_override_file_and_env() {
    clear_env();
    env::set_var("DATAVERSE_URL", "https://env.crm.dynamics.com");
    env::set_var("DATAVERSE_TENANT_ID", "tenant");
    env::set_var("DATAVERSE_CLIENT_ID", "client");
    env::set_var("DATAVERSE_CLIENT_SECRET", "secret");

    let config = load_config(None::<&Path>).expect("Config should load");
    let overrides = ConnectionOverrides {
        url: Some("https://flag.crm.dynamics.com/".into()),
        ..ConnectionOverrides::default()
    };
    let connection = resolve_connection(&config, &overrides).unwrap();
    assert_eq!(connection.url, "https://flag.crm.dynamics.com");
    assert_eq!(connection.tenant_id, "tenant");
    clear_env();
}

#[tokio::test]
#[serial]
async fn test_missing_url_is_reported_first() {
    clear_env();
    let config = load_config(None::<&Path>).expect("Empty config is valid");
    let err = resolve_connection(&config, &ConnectionOverrides::default()).unwrap_err();
    assert!(err.to_string().contains("--url or DATAVERSE_URL"), "got: {err}");
}

#[tokio::test]
#[serial]
async fn test_load_config_errors_for_invalid_file() {
    let config_file = NamedTempFile::new().expect("temp file");
    write(config_file.path(), b"not-yaml: [:::").unwrap();

    let err = load_config(Some(config_file.path())).unwrap_err();
    let msg = err.to_string();
    assert!(
        msg.contains("parse") || msg.contains("YAML"),
        "Parse error expected, got: {msg}"
    );
}

#[tokio::test]
#[serial]
async fn test_empty_file_yields_defaults() {
    clear_env();
    let config_file = NamedTempFile::new().expect("temp file");
    write(config_file.path(), "").unwrap();

    let config = load_config(Some(config_file.path())).expect("Empty file is valid");
    assert_eq!(config.tracking.start_attempts, 10);
    assert_eq!(config.progress, ProgressMode::Plain);
}
