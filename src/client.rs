//! Dataverse Web API implementation of [`RemoteClient`].
//!
//! Authenticates with the OAuth2 client-credentials flow and caches the
//! bearer token until shortly before it expires. Queries become OData
//! `$filter`/`$select`/`$orderby`/`$top` requests and follow
//! `@odata.nextLink` paging. Lookup attributes are filtered and selected as
//! `_<name>_value` and written with `<name>@odata.bind`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dvtoolbox_core::config::ConnectionConfig;
use dvtoolbox_core::contract::{ConditionOp, Field, OperationRequest, Query, Record, RemoteClient};
use dvtoolbox_core::RemoteError;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, error, info};
use uuid::Uuid;

const API_PATH: &str = "api/data/v9.2";
const LOGIN_HOST: &str = "https://login.microsoftonline.com";
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Entity set (collection) name used in URLs.
pub fn entity_set(entity: &str) -> String {
    match entity {
        "webresource" => "webresourceset".to_string(),
        "pluginassembly" => "pluginassemblies".to_string(),
        other if other.ends_with('s') => format!("{other}es"),
        other => format!("{other}s"),
    }
}

/// Single-valued navigation properties, keyed by (entity, attribute).
pub fn is_lookup(entity: &str, attribute: &str) -> bool {
    matches!(
        (entity, attribute),
        ("solutioncomponent", "solutionid")
            | ("plugintype", "pluginassemblyid")
            | ("sdkmessagefilter", "sdkmessageid")
            | ("sdkmessageprocessingstep", "plugintypeid")
            | ("sdkmessageprocessingstep", "sdkmessageid")
            | ("sdkmessageprocessingstep", "sdkmessagefilterid")
            | ("sdkmessageprocessingstepimage", "sdkmessageprocessingstepid")
    )
}

fn wire_attribute(entity: &str, attribute: &str) -> String {
    if is_lookup(entity, attribute) {
        format!("_{attribute}_value")
    } else {
        attribute.to_string()
    }
}

fn literal(field: &Field) -> String {
    match field {
        Field::Null => "null".to_string(),
        Field::Bool(b) => b.to_string(),
        Field::Int(i) => i.to_string(),
        Field::Float(f) => f.to_string(),
        Field::Text(s) => format!("'{}'", s.replace('\'', "''")),
        Field::Id(id) => id.to_string(),
        Field::Choice(c) => c.to_string(),
        Field::Ref(r) => r.id.to_string(),
    }
}

/// Collection path for `query`. Unpublished reads go through the
/// `RetrieveUnpublishedMultiple` bound function.
pub fn resource_path(query: &Query) -> String {
    let set = entity_set(&query.entity);
    if query.unpublished {
        format!("{set}/Microsoft.Dynamics.CRM.RetrieveUnpublishedMultiple()")
    } else {
        set
    }
}

/// OData `$filter` for the query's conditions, `None` when unfiltered.
pub fn filter_expression(query: &Query) -> Option<String> {
    let clauses: Vec<String> = query
        .conditions
        .iter()
        .map(|condition| {
            let attribute = wire_attribute(&query.entity, &condition.attribute);
            match &condition.op {
                ConditionOp::Eq(value) => format!("{attribute} eq {}", literal(value)),
                ConditionOp::In(values) => {
                    let alternatives: Vec<String> = values
                        .iter()
                        .map(|v| format!("{attribute} eq {}", literal(v)))
                        .collect();
                    format!("({})", alternatives.join(" or "))
                }
                ConditionOp::IsNull => format!("{attribute} eq null"),
            }
        })
        .collect();
    (!clauses.is_empty()).then(|| clauses.join(" and "))
}

/// Query-string parameters for `query`.
pub fn query_parameters(query: &Query) -> Vec<(&'static str, String)> {
    let mut params = Vec::new();
    if !query.columns.is_empty() {
        let columns: Vec<String> = query
            .columns
            .iter()
            .map(|c| wire_attribute(&query.entity, c))
            .collect();
        params.push(("$select", columns.join(",")));
    }
    if let Some(filter) = filter_expression(query) {
        params.push(("$filter", filter));
    }
    if !query.order.is_empty() {
        let order: Vec<String> = query
            .order
            .iter()
            .map(|o| {
                let direction = if o.descending { "desc" } else { "asc" };
                format!("{} {direction}", wire_attribute(&query.entity, &o.attribute))
            })
            .collect();
        params.push(("$orderby", order.join(",")));
    }
    if let Some(top) = query.top {
        params.push(("$top", top.to_string()));
    }
    params
}

/// JSON body for a create or update of `record`.
pub fn record_body(record: &Record) -> Value {
    let mut body = Map::new();
    for (name, value) in &record.attributes {
        let json = match value {
            Field::Ref(target) => {
                body.insert(
                    format!("{name}@odata.bind"),
                    Value::String(format!("/{}({})", entity_set(&target.entity), target.id)),
                );
                continue;
            }
            Field::Null if is_lookup(&record.entity, name) => {
                body.insert(format!("{name}@odata.bind"), Value::Null);
                continue;
            }
            Field::Null => Value::Null,
            Field::Bool(b) => Value::Bool(*b),
            Field::Int(i) => Value::from(*i),
            Field::Float(f) => Value::from(*f),
            Field::Text(s) => Value::String(s.clone()),
            Field::Id(id) => Value::String(id.to_string()),
            Field::Choice(c) => Value::from(*c),
        };
        body.insert(name.clone(), json);
    }
    Value::Object(body)
}

/// Decode one returned row. Annotations are dropped, `_x_value` becomes
/// `x`, managed properties (`{"Value": ..}`) become their value.
pub fn decode_row(entity: &str, row: &Map<String, Value>) -> Record {
    let mut record = Record::new(entity);
    for (key, value) in row {
        if key.contains('@') {
            continue;
        }
        let (name, lookup) = match key.strip_prefix('_').and_then(|k| k.strip_suffix("_value")) {
            Some(inner) => (inner.to_string(), true),
            None => (key.clone(), false),
        };
        let field = match value {
            Value::Null => Field::Null,
            Value::Bool(b) => Field::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Field::Int(i),
                None => Field::Float(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) if lookup => match Uuid::parse_str(s) {
                Ok(id) => Field::Id(id),
                Err(_) => Field::Text(s.clone()),
            },
            Value::String(s) => Field::Text(s.clone()),
            Value::Object(inner) => match inner.get("Value") {
                Some(Value::Bool(b)) => Field::Bool(*b),
                Some(Value::Number(n)) => n.as_i64().map(Field::Int).unwrap_or(Field::Null),
                _ => Field::Null,
            },
            Value::Array(_) => continue,
        };
        record.attributes.insert(name, field);
    }
    record.id = record.uuid(&Record::primary_key(entity));
    record
}

/// Id from an `OData-EntityId` header such as `.../accounts(00000000-...)`.
pub fn entity_id_from_header(value: &str) -> Option<Uuid> {
    let start = value.rfind('(')?;
    let end = value.rfind(')')?;
    Uuid::parse_str(value.get(start + 1..end)?).ok()
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct Page {
    #[serde(default)]
    value: Vec<Map<String, Value>>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

pub struct WebApiClient {
    http: reqwest::Client,
    connection: ConnectionConfig,
    token: Mutex<Option<CachedToken>>,
}

impl WebApiClient {
    pub fn new(connection: ConnectionConfig) -> Result<Self, RemoteError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        info!(url = %connection.url, "Initialised Web API client");
        Ok(Self {
            http,
            connection,
            token: Mutex::new(None),
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/{API_PATH}/{path}", self.connection.url)
    }

    async fn bearer(&self) -> Result<String, RemoteError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() + TOKEN_REFRESH_MARGIN < token.expires_at {
                return Ok(token.value.clone());
            }
        }

        debug!(tenant = %self.connection.tenant_id, "Requesting access token");
        let scope = format!("{}/.default", self.connection.url);
        let response = self
            .http
            .post(format!("{LOGIN_HOST}/{}/oauth2/v2.0/token", self.connection.tenant_id))
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.connection.client_id.as_str()),
                ("client_secret", self.connection.client_secret.as_str()),
                ("scope", scope.as_str()),
            ])
            .send()
            .await
            .map_err(|e| RemoteError::Transport(format!("token request failed: {e}")))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            error!(status, "Access token request was rejected");
            return Err(RemoteError::Transport(format!(
                "token request rejected with status {status}: {body}"
            )));
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::Decode(format!("token response: {e}")))?;
        let value = token.access_token.clone();
        *cached = Some(CachedToken {
            value: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        });
        Ok(value)
    }

    async fn request(&self, method: Method, url: &str) -> Result<RequestBuilder, RemoteError> {
        let token = self.bearer().await?;
        Ok(self
            .http
            .request(method, url)
            .bearer_auth(token)
            .header("OData-MaxVersion", "4.0")
            .header("OData-Version", "4.0")
            .header("Accept", "application/json"))
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, RemoteError> {
        let response = builder
            .send()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.pointer("/error/message").and_then(Value::as_str).map(str::to_string))
            .unwrap_or(body);
        Err(RemoteError::Fault {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl RemoteClient for WebApiClient {
    async fn query(&self, query: &Query) -> Result<Vec<Record>, RemoteError> {
        let has_empty_in = query
            .conditions
            .iter()
            .any(|c| matches!(&c.op, ConditionOp::In(values) if values.is_empty()));
        if has_empty_in {
            return Ok(Vec::new());
        }

        debug!(
            entity = %query.entity,
            filter = %query.describe(),
            unpublished = query.unpublished,
            "Querying"
        );
        let mut rows = Vec::new();
        let first = self
            .request(Method::GET, &self.api_url(&resource_path(query)))
            .await?
            .query(&query_parameters(query));
        let mut page: Page = self
            .send(first)
            .await?
            .json()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))?;
        loop {
            rows.extend(page.value.iter().map(|row| decode_row(&query.entity, row)));
            let Some(next) = page.next_link.take() else {
                break;
            };
            page = self
                .send(self.request(Method::GET, &next).await?)
                .await?
                .json()
                .await
                .map_err(|e| RemoteError::Decode(e.to_string()))?;
        }
        debug!(entity = %query.entity, rows = rows.len(), "Query returned");
        Ok(rows)
    }

    async fn create(&self, record: &Record) -> Result<Uuid, RemoteError> {
        let mut body = record_body(record);
        if let (Some(id), Value::Object(map)) = (record.id, &mut body) {
            map.insert(Record::primary_key(&record.entity), Value::String(id.to_string()));
        }
        let builder = self
            .request(Method::POST, &self.api_url(&entity_set(&record.entity)))
            .await?
            .json(&body);
        let response = self.send(builder).await?;
        let id = response
            .headers()
            .get("OData-EntityId")
            .and_then(|h| h.to_str().ok())
            .and_then(entity_id_from_header)
            .or(record.id)
            .ok_or_else(|| {
                RemoteError::Decode(format!("create of {} returned no id", record.entity))
            })?;
        debug!(entity = %record.entity, %id, "Created record");
        Ok(id)
    }

    async fn update(&self, record: &Record) -> Result<(), RemoteError> {
        let id = record
            .record_id()
            .ok_or_else(|| RemoteError::Decode(format!("update of {} without id", record.entity)))?;
        let url = self.api_url(&format!("{}({id})", entity_set(&record.entity)));
        let builder = self
            .request(Method::PATCH, &url)
            .await?
            .header("If-Match", "*")
            .json(&record_body(record));
        self.send(builder).await?;
        debug!(entity = %record.entity, %id, "Updated record");
        Ok(())
    }

    async fn delete(&self, entity: &str, id: Uuid) -> Result<(), RemoteError> {
        let url = self.api_url(&format!("{}({id})", entity_set(entity)));
        self.send(self.request(Method::DELETE, &url).await?).await?;
        debug!(entity, %id, "Deleted record");
        Ok(())
    }

    async fn execute(&self, request: &OperationRequest) -> Result<Value, RemoteError> {
        info!(operation = %request.name, "Executing operation");
        let builder = self
            .request(Method::POST, &self.api_url(&request.name))
            .await?
            .json(&Value::Object(request.parameters.clone()));
        let response = self.send(builder).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(Value::Object(Map::new()));
        }
        let text = response
            .text()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        if text.trim().is_empty() {
            return Ok(Value::Object(Map::new()));
        }
        serde_json::from_str(&text)
            .map_err(|e| RemoteError::Decode(format!("{}: {e}", request.name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dvtoolbox_core::contract::EntityRef;

    #[test]
    fn test_entity_sets_follow_platform_naming() {
        assert_eq!(entity_set("webresource"), "webresourceset");
        assert_eq!(entity_set("pluginassembly"), "pluginassemblies");
        assert_eq!(entity_set("sdkmessageprocessingstep"), "sdkmessageprocessingsteps");
        assert_eq!(entity_set("solution"), "solutions");
        assert_eq!(entity_set("asyncoperation"), "asyncoperations");
    }

    #[test]
    fn test_filters_render_lookups_nulls_and_alternatives() {
        let solution = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let query = Query::new("solutioncomponent")
            .eq("solutionid", solution)
            .is_in("objectid", [a, b]);
        assert_eq!(
            filter_expression(&query).unwrap(),
            format!("_solutionid_value eq {solution} and (objectid eq {a} or objectid eq {b})")
        );

        let query = Query::new("importjob").eq("solutionname", "O'Brien").is_null("completedon");
        assert_eq!(
            filter_expression(&query).unwrap(),
            "solutionname eq 'O''Brien' and completedon eq null"
        );
        assert!(filter_expression(&Query::new("solution")).is_none());
    }

    #[test]
    fn test_unpublished_queries_use_the_bound_function() {
        let published = Query::new("webresource").select(&["name", "content"]);
        assert_eq!(resource_path(&published), "webresourceset");
        assert_eq!(
            resource_path(&published.unpublished()),
            "webresourceset/Microsoft.Dynamics.CRM.RetrieveUnpublishedMultiple()"
        );
    }

    #[test]
    fn test_parameters_cover_select_order_and_top() {
        let query = Query::new("sdkmessageprocessingstep")
            .select(&["name", "plugintypeid"])
            .order_desc("createdon")
            .top(5);
        let params = query_parameters(&query);
        assert_eq!(params[0], ("$select", "name,_plugintypeid_value".to_string()));
        assert_eq!(params[1], ("$orderby", "createdon desc".to_string()));
        assert_eq!(params[2], ("$top", "5".to_string()));
    }

    #[test]
    fn test_bodies_bind_references() {
        let assembly = Uuid::new_v4();
        let record = Record::new("plugintype")
            .set("name", "Contoso.Plugins.AccountPlugin")
            .set("pluginassemblyid", EntityRef::new("pluginassembly", assembly));
        let body = record_body(&record);
        assert_eq!(
            body["pluginassemblyid@odata.bind"],
            format!("/pluginassemblies({assembly})")
        );
        assert_eq!(body["name"], "Contoso.Plugins.AccountPlugin");

        let cleared = record_body(
            &Record::new("sdkmessageprocessingstep").set("sdkmessagefilterid", Field::Null),
        );
        assert!(cleared["sdkmessagefilterid@odata.bind"].is_null());
    }

    #[test]
    fn test_rows_decode_lookups_and_managed_properties() {
        let id = Uuid::new_v4();
        let type_id = Uuid::new_v4();
        let row = serde_json::json!({
            "@odata.etag": "W/\"1\"",
            "sdkmessageprocessingstepid": id.to_string(),
            "_plugintypeid_value": type_id.to_string(),
            "_plugintypeid_value@OData.Community.Display.V1.FormattedValue": "Account",
            "iscustomizable": { "Value": true, "CanBeChanged": true },
            "stage": 40,
            "name": "Account: Update"
        });
        let record = decode_row("sdkmessageprocessingstep", row.as_object().unwrap());
        assert_eq!(record.id, Some(id));
        assert_eq!(record.uuid("plugintypeid"), Some(type_id));
        assert_eq!(record.flag("iscustomizable"), Some(true));
        assert_eq!(record.int("stage"), Some(40));
        assert_eq!(record.text("name"), Some("Account: Update"));
        assert_eq!(record.attributes.len(), 5);
    }

    #[test]
    fn test_entity_id_header_is_parsed() {
        let id = Uuid::new_v4();
        let header = format!("https://org.crm.dynamics.com/api/data/v9.2/webresourceset({id})");
        assert_eq!(entity_id_from_header(&header), Some(id));
        assert_eq!(entity_id_from_header("no id here"), None);
    }
}
