//! # contract: the seam between the core and the remote platform
//!
//! The core never speaks HTTP. It talks to a [`RemoteClient`], which exposes the
//! five primitives the platform offers: query, create, update, delete and
//! execute a named operation. The CLI crate provides the networked
//! implementation; tests use [`MockRemoteClient`] or the in-memory remote in
//! [`crate::testing`].
//!
//! ## Records
//! A [`Record`] is an entity name, an optional primary id and a bag of typed
//! [`Field`]s. The primary key attribute is always `<entity>id`.
//!
//! ## Queries
//! [`Query`] is a flat filter over one entity: equality, membership and null
//! checks joined with `and`, plus ordering and an optional row cap.

use std::collections::BTreeMap;

use async_trait::async_trait;
use mockall::automock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RemoteError;

/// Reference to another record (a lookup attribute).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity: String,
    pub id: Uuid,
}

impl EntityRef {
    pub fn new(entity: impl Into<String>, id: Uuid) -> Self {
        Self {
            entity: entity.into(),
            id,
        }
    }
}

/// A typed attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Field {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Id(Uuid),
    /// Option-set value (state codes, stages, modes...).
    Choice(i32),
    Ref(EntityRef),
}

impl Field {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Field::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Field::Id(id) => Some(*id),
            Field::Ref(r) => Some(r.id),
            Field::Text(s) => Uuid::parse_str(s).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Field::Int(v) => Some(*v),
            Field::Choice(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Field::Float(v) => Some(*v),
            Field::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Field::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Field::Null)
    }
}

impl From<&str> for Field {
    fn from(v: &str) -> Self {
        Field::Text(v.to_string())
    }
}

impl From<String> for Field {
    fn from(v: String) -> Self {
        Field::Text(v)
    }
}

impl From<bool> for Field {
    fn from(v: bool) -> Self {
        Field::Bool(v)
    }
}

impl From<i64> for Field {
    fn from(v: i64) -> Self {
        Field::Int(v)
    }
}

impl From<i32> for Field {
    fn from(v: i32) -> Self {
        Field::Int(i64::from(v))
    }
}

impl From<f64> for Field {
    fn from(v: f64) -> Self {
        Field::Float(v)
    }
}

impl From<Uuid> for Field {
    fn from(v: Uuid) -> Self {
        Field::Id(v)
    }
}

impl From<EntityRef> for Field {
    fn from(v: EntityRef) -> Self {
        Field::Ref(v)
    }
}

impl<T: Into<Field>> From<Option<T>> for Field {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Field::Null)
    }
}

/// One remote row.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Record {
    pub entity: String,
    pub id: Option<Uuid>,
    pub attributes: BTreeMap<String, Field>,
}

impl Record {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            id: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_id(entity: impl Into<String>, id: Uuid) -> Self {
        Self {
            id: Some(id),
            ..Self::new(entity)
        }
    }

    /// Name of the primary key attribute for `entity`.
    pub fn primary_key(entity: &str) -> String {
        format!("{entity}id")
    }

    /// Builder-style attribute setter.
    pub fn set(mut self, name: &str, value: impl Into<Field>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: &str, value: impl Into<Field>) {
        self.attributes.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Field> {
        self.attributes.get(name)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Field::as_str)
    }

    pub fn uuid(&self, name: &str) -> Option<Uuid> {
        self.get(name).and_then(Field::as_uuid)
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Field::as_i64)
    }

    pub fn float(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(Field::as_f64)
    }

    pub fn flag(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(Field::as_bool)
    }

    /// True when the attribute is present and not null.
    pub fn has_value(&self, name: &str) -> bool {
        self.get(name).map(|f| !f.is_null()).unwrap_or(false)
    }

    /// The record id, falling back to the primary key attribute.
    pub fn record_id(&self) -> Option<Uuid> {
        self.id
            .or_else(|| self.uuid(&Self::primary_key(&self.entity)))
    }

    pub fn to_ref(&self) -> Option<EntityRef> {
        self.record_id().map(|id| EntityRef::new(self.entity.clone(), id))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConditionOp {
    Eq(Field),
    In(Vec<Field>),
    IsNull,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub attribute: String,
    pub op: ConditionOp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub attribute: String,
    pub descending: bool,
}

/// Flat query over one entity. An empty column list means "all columns".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub entity: String,
    pub columns: Vec<String>,
    pub conditions: Vec<Condition>,
    pub order: Vec<OrderBy>,
    pub top: Option<u32>,
    /// Read unpublished customizations instead of the published layer.
    #[serde(default)]
    pub unpublished: bool,
}

impl Query {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            columns: Vec::new(),
            conditions: Vec::new(),
            order: Vec::new(),
            top: None,
            unpublished: false,
        }
    }

    pub fn select(mut self, columns: &[&str]) -> Self {
        self.columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn eq(mut self, attribute: &str, value: impl Into<Field>) -> Self {
        self.conditions.push(Condition {
            attribute: attribute.to_string(),
            op: ConditionOp::Eq(value.into()),
        });
        self
    }

    pub fn is_in<I, V>(mut self, attribute: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Field>,
    {
        self.conditions.push(Condition {
            attribute: attribute.to_string(),
            op: ConditionOp::In(values.into_iter().map(Into::into).collect()),
        });
        self
    }

    pub fn is_null(mut self, attribute: &str) -> Self {
        self.conditions.push(Condition {
            attribute: attribute.to_string(),
            op: ConditionOp::IsNull,
        });
        self
    }

    pub fn order_desc(mut self, attribute: &str) -> Self {
        self.order.push(OrderBy {
            attribute: attribute.to_string(),
            descending: true,
        });
        self
    }

    pub fn top(mut self, rows: u32) -> Self {
        self.top = Some(rows);
        self
    }

    pub fn unpublished(mut self) -> Self {
        self.unpublished = true;
        self
    }

    /// Short human-readable rendering of the filter, used in error messages.
    pub fn describe(&self) -> String {
        let parts: Vec<String> = self
            .conditions
            .iter()
            .map(|c| match &c.op {
                ConditionOp::Eq(v) => format!("{} = {}", c.attribute, render_field(v)),
                ConditionOp::In(vs) => format!(
                    "{} in [{}]",
                    c.attribute,
                    vs.iter().map(render_field).collect::<Vec<_>>().join(", ")
                ),
                ConditionOp::IsNull => format!("{} is null", c.attribute),
            })
            .collect();
        if parts.is_empty() {
            "(all)".to_string()
        } else {
            parts.join(" and ")
        }
    }
}

fn render_field(field: &Field) -> String {
    match field {
        Field::Null => "null".to_string(),
        Field::Bool(b) => b.to_string(),
        Field::Int(i) => i.to_string(),
        Field::Float(f) => f.to_string(),
        Field::Text(s) => format!("'{s}'"),
        Field::Id(id) => id.to_string(),
        Field::Choice(c) => c.to_string(),
        Field::Ref(r) => r.id.to_string(),
    }
}

/// A named server-side operation (action) with JSON parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRequest {
    pub name: String,
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

impl OperationRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: serde_json::Map::new(),
        }
    }

    pub fn param(mut self, name: &str, value: impl Into<serde_json::Value>) -> Self {
        self.parameters.insert(name.to_string(), value.into());
        self
    }
}

/// Primitive operations against the remote platform.
///
/// Implementations must be safe to share across awaits. Every call may fail
/// with a [`RemoteError`]; callers decide whether that is fatal.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Run a filtered query and return every matching row.
    async fn query(&self, query: &Query) -> Result<Vec<Record>, RemoteError>;

    /// Create a record and return its id. A preset `record.id` is honoured.
    async fn create(&self, record: &Record) -> Result<Uuid, RemoteError>;

    /// Update the attributes present on `record`; `record.id` must be set.
    async fn update(&self, record: &Record) -> Result<(), RemoteError>;

    async fn delete(&self, entity: &str, id: Uuid) -> Result<(), RemoteError>;

    /// Execute a named operation and return its JSON response body.
    async fn execute(&self, request: &OperationRequest)
        -> Result<serde_json::Value, RemoteError>;
}
