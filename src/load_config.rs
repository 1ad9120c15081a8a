//! Loads the optional YAML config file and merges in the environment.
//!
//! The file never holds the client secret. Connection values missing from
//! the file are read from `DATAVERSE_URL`, `DATAVERSE_TENANT_ID` and
//! `DATAVERSE_CLIENT_ID`; the secret always comes from
//! `DATAVERSE_CLIENT_SECRET`. Command-line flags are applied on top by the
//! caller through [`ConnectionOverrides`].

use std::fs;
use std::path::Path;

use anyhow::Result;
use dvtoolbox_core::config::{Config, ConnectionConfig};
use tracing::{error, info};

pub const URL_VAR: &str = "DATAVERSE_URL";
pub const TENANT_VAR: &str = "DATAVERSE_TENANT_ID";
pub const CLIENT_ID_VAR: &str = "DATAVERSE_CLIENT_ID";
pub const SECRET_VAR: &str = "DATAVERSE_CLIENT_SECRET";

/// Connection values given on the command line.
#[derive(Debug, Clone, Default)]
pub struct ConnectionOverrides {
    pub url: Option<String>,
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
}

fn env_value(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn fill_from_env(field: &mut String, var: &str) {
    if field.is_empty() {
        if let Some(value) = env_value(var) {
            info!(var, "Connection value taken from environment");
            *field = value;
        }
    }
}

/// Read `path` (if any) into a [`Config`] and fill connection gaps from the
/// environment. Does not require a complete connection.
pub fn load_config<P: AsRef<Path>>(path: Option<P>) -> Result<Config> {
    let mut config = match path {
        Some(path) => {
            let path_ref = path.as_ref();
            info!(config_path = ?path_ref, "Loading configuration from file");
            let content = match fs::read_to_string(path_ref) {
                Ok(content) => content,
                Err(e) => {
                    error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
                    return Err(anyhow::anyhow!(
                        "Failed to read config file {}: {e}",
                        path_ref.display()
                    ));
                }
            };
            match serde_yaml::from_str::<Option<Config>>(&content) {
                Ok(parsed) => parsed.unwrap_or_default(),
                Err(e) => {
                    error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
                    return Err(anyhow::anyhow!("Failed to parse config YAML: {e}"));
                }
            }
        }
        None => Config::default(),
    };

    fill_from_env(&mut config.connection.url, URL_VAR);
    fill_from_env(&mut config.connection.tenant_id, TENANT_VAR);
    fill_from_env(&mut config.connection.client_id, CLIENT_ID_VAR);
    config.connection.client_secret = env_value(SECRET_VAR).unwrap_or_default();

    config.trace_loaded();
    Ok(config)
}

/// Apply flag overrides and check that every connection value is present.
/// The error names the flag or variable to set.
pub fn resolve_connection(
    config: &Config,
    overrides: &ConnectionOverrides,
) -> Result<ConnectionConfig> {
    let mut connection = config.connection.clone();
    if let Some(url) = &overrides.url {
        connection.url = url.clone();
    }
    if let Some(tenant_id) = &overrides.tenant_id {
        connection.tenant_id = tenant_id.clone();
    }
    if let Some(client_id) = &overrides.client_id {
        connection.client_id = client_id.clone();
    }
    connection.url = connection.url.trim_end_matches('/').to_string();

    let missing = [
        (connection.url.is_empty(), "--url or DATAVERSE_URL"),
        (connection.tenant_id.is_empty(), "--tenant-id or DATAVERSE_TENANT_ID"),
        (connection.client_id.is_empty(), "--client-id or DATAVERSE_CLIENT_ID"),
        (connection.client_secret.is_empty(), SECRET_VAR),
    ];
    if let Some((_, name)) = missing.iter().find(|(absent, _)| *absent) {
        error!(missing = name, "Connection is incomplete");
        anyhow::bail!("Missing connection setting: set {name}");
    }
    info!(url = %connection.url, client_id = %connection.client_id, "Connection resolved");
    Ok(connection)
}
