//! Existence lookups and solution membership helpers shared by the sinks and
//! registration.

use tracing::{debug, error, info};
use uuid::Uuid;

use crate::contract::{OperationRequest, Query, Record, RemoteClient};
use crate::error::{Result, ToolboxError};

/// Solution component type codes.
pub mod component_type {
    pub const WORKFLOW: i32 = 29;
    pub const WEB_RESOURCE: i32 = 61;
    pub const PLUGIN_ASSEMBLY: i32 = 91;
    pub const SDK_MESSAGE_PROCESSING_STEP: i32 = 92;
}

/// Run a query expected to match at most one row. More than one match is an
/// ambiguous identity and never retried.
pub async fn find_unique(client: &dyn RemoteClient, query: &Query) -> Result<Option<Record>> {
    let mut rows = client.query(query).await?;
    match rows.len() {
        0 => Ok(None),
        1 => Ok(rows.pop()),
        count => {
            error!(entity = %query.entity, filter = %query.describe(), count, "[LOOKUP][ERROR] Multiple matches for a unique lookup");
            Err(ToolboxError::AmbiguousIdentity {
                entity: query.entity.clone(),
                key: query.describe(),
                count,
            })
        }
    }
}

/// Id of the single row matching `query`, if any.
pub async fn existing_id(client: &dyn RemoteClient, query: &Query) -> Result<Option<Uuid>> {
    Ok(find_unique(client, query)
        .await?
        .and_then(|record| record.record_id()))
}

pub async fn solution_id(client: &dyn RemoteClient, unique_name: &str) -> Result<Uuid> {
    let query = Query::new("solution")
        .select(&["solutionid", "uniquename"])
        .eq("uniquename", unique_name);
    existing_id(client, &query)
        .await?
        .ok_or_else(|| ToolboxError::not_found("solution", unique_name))
}

/// Object ids of the solution's components, optionally of one type.
pub async fn solution_component_ids(
    client: &dyn RemoteClient,
    solution_id: Uuid,
    component_type: Option<i32>,
) -> Result<Vec<Uuid>> {
    let mut query = Query::new("solutioncomponent")
        .select(&["objectid", "componenttype"])
        .eq("solutionid", solution_id);
    if let Some(kind) = component_type {
        query = query.eq("componenttype", kind);
    }
    let rows = client.query(&query).await?;
    let ids: Vec<Uuid> = rows.iter().filter_map(|r| r.uuid("objectid")).collect();
    debug!(%solution_id, ?component_type, count = ids.len(), "[LOOKUP] Solution components");
    Ok(ids)
}

/// Rows of `entity` whose primary key is one of the solution's components.
pub async fn solution_members(
    client: &dyn RemoteClient,
    solution_id: Uuid,
    component_type: Option<i32>,
    query: Query,
) -> Result<Vec<Record>> {
    let ids = solution_component_ids(client, solution_id, component_type).await?;
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let pk = Record::primary_key(&query.entity);
    Ok(client.query(&query.is_in(&pk, ids)).await?)
}

/// Add a component to a solution. No solution means nothing to do.
pub async fn add_solution_component(
    client: &dyn RemoteClient,
    solution: Option<&str>,
    component_id: Uuid,
    component_type: i32,
) -> Result<()> {
    let Some(solution) = solution else {
        return Ok(());
    };
    let request = OperationRequest::new("AddSolutionComponent")
        .param("ComponentId", component_id.to_string())
        .param("ComponentType", component_type)
        .param("SolutionUniqueName", solution)
        .param("AddRequiredComponents", false)
        .param("DoNotIncludeSubcomponents", false);
    client.execute(&request).await?;
    info!(%component_id, component_type, solution, "[LOOKUP] Added component to solution");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryRemote;

    #[tokio::test]
    async fn test_unique_lookup_distinguishes_none_one_and_many() {
        let remote = InMemoryRemote::new();
        let query = Query::new("pluginassembly").eq("name", "Contoso.Plugins");
        assert_eq!(existing_id(&remote, &query).await.unwrap(), None);

        let id = remote.seed(Record::new("pluginassembly").set("name", "Contoso.Plugins"));
        assert_eq!(existing_id(&remote, &query).await.unwrap(), Some(id));

        remote.seed(Record::new("pluginassembly").set("name", "Contoso.Plugins"));
        match existing_id(&remote, &query).await {
            Err(ToolboxError::AmbiguousIdentity { count, .. }) => assert_eq!(count, 2),
            other => panic!("expected ambiguous identity, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_membership_is_skipped_without_solution() {
        let remote = InMemoryRemote::new();
        add_solution_component(&remote, None, Uuid::new_v4(), component_type::WEB_RESOURCE)
            .await
            .unwrap();
        assert!(remote.executed().is_empty());

        add_solution_component(&remote, Some("Core"), Uuid::new_v4(), component_type::WEB_RESOURCE)
            .await
            .unwrap();
        let executed = remote.executed();
        assert_eq!(executed[0].name, "AddSolutionComponent");
        assert_eq!(executed[0].parameters["SolutionUniqueName"], "Core");
        assert_eq!(executed[0].parameters["ComponentType"], 61);
    }
}
