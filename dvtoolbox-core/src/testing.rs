//! Test doubles shared by unit tests, the integration tests and the CLI crate.
//!
//! [`InMemoryRemote`] is a small table store that implements [`RemoteClient`]
//! closely enough for the sinks, the tracker probes and registration to run
//! unmodified against it. Every call is logged so tests can assert on the
//! exact mutation sequence.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use uuid::Uuid;

use crate::contract::{ConditionOp, Field, OperationRequest, Query, Record, RemoteClient};
use crate::error::RemoteError;
use crate::progress::ProgressReporter;

/// `Write` sink that can be cloned into a reporter and inspected afterwards.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        let bytes = self.0.lock().map(|b| b.clone()).unwrap_or_default();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.0.lock() {
            Ok(mut inner) => {
                inner.extend_from_slice(buf);
                Ok(buf.len())
            }
            Err(_) => Err(io::Error::new(io::ErrorKind::Other, "buffer poisoned")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Collects every `(message, percentage)` event.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<(String, f64)>>,
}

impl RecordingReporter {
    pub fn events(&self) -> Vec<(String, f64)> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn last_percentage(&self) -> Option<f64> {
        self.events().last().map(|(_, p)| *p)
    }
}

impl ProgressReporter for RecordingReporter {
    fn report(&self, message: &str, percentage: f64) {
        if let Ok(mut events) = self.events.lock() {
            events.push((message.to_string(), percentage));
        }
    }
}

/// One call observed by [`InMemoryRemote`].
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    Query(String),
    Create { entity: String, id: Uuid },
    Update { entity: String, id: Uuid },
    Delete { entity: String, id: Uuid },
    Execute(String),
}

impl RemoteCall {
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            RemoteCall::Create { .. } | RemoteCall::Update { .. } | RemoteCall::Delete { .. }
        )
    }
}

#[derive(Default)]
struct State {
    tables: BTreeMap<String, Vec<Record>>,
    calls: Vec<RemoteCall>,
    queries: Vec<Query>,
    executed: Vec<OperationRequest>,
    responses: HashMap<String, VecDeque<Result<serde_json::Value, RemoteError>>>,
    failing_ids: HashSet<Uuid>,
    failing_queries: HashMap<String, u32>,
}

#[derive(Default)]
pub struct InMemoryRemote {
    state: Mutex<State>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Insert a row directly, without logging a call. Returns its id.
    pub fn seed(&self, record: Record) -> Uuid {
        let mut state = self.state();
        insert_row(&mut state, record)
    }

    pub fn rows(&self, entity: &str) -> Vec<Record> {
        self.state().tables.get(entity).cloned().unwrap_or_default()
    }

    pub fn find(&self, entity: &str, id: Uuid) -> Option<Record> {
        self.rows(entity).into_iter().find(|r| r.id == Some(id))
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state().calls.clone()
    }

    /// Every query issued, in order.
    pub fn queries(&self) -> Vec<Query> {
        self.state().queries.clone()
    }

    pub fn mutations(&self) -> Vec<RemoteCall> {
        self.calls().into_iter().filter(RemoteCall::is_mutation).collect()
    }

    pub fn executed(&self) -> Vec<OperationRequest> {
        self.state().executed.clone()
    }

    /// Queue a response for the next `execute` of `operation`. Operations
    /// without a queued response answer `{}`.
    pub fn respond_to(&self, operation: &str, response: Result<serde_json::Value, RemoteError>) {
        self.state()
            .responses
            .entry(operation.to_string())
            .or_default()
            .push_back(response);
    }

    /// Every create, update or delete touching `id` fails with a server fault.
    pub fn fail_writes_to(&self, id: Uuid) {
        self.state().failing_ids.insert(id);
    }

    /// The next `times` queries on `entity` fail with a transport error.
    pub fn fail_queries_on(&self, entity: &str, times: u32) {
        self.state()
            .failing_queries
            .insert(entity.to_string(), times);
    }

    /// Apply `f` to a stored row, e.g. to advance a job between polls.
    pub fn modify(&self, entity: &str, id: Uuid, f: impl FnOnce(&mut Record)) {
        let mut state = self.state();
        if let Some(row) = state
            .tables
            .get_mut(entity)
            .and_then(|rows| rows.iter_mut().find(|r| r.id == Some(id)))
        {
            f(row);
        }
    }
}

fn insert_row(state: &mut State, mut record: Record) -> Uuid {
    let pk = Record::primary_key(&record.entity);
    let id = record.record_id().unwrap_or_else(Uuid::new_v4);
    record.id = Some(id);
    record.insert(&pk, id);
    state
        .tables
        .entry(record.entity.clone())
        .or_default()
        .push(record);
    id
}

/// Records solution membership the way the platform does.
fn add_component(state: &mut State, request: &OperationRequest) {
    let params = &request.parameters;
    let solution = params.get("SolutionUniqueName").and_then(|v| v.as_str());
    let component = params
        .get("ComponentId")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok());
    let kind = params.get("ComponentType").and_then(|v| v.as_i64());
    let (Some(solution), Some(component), Some(kind)) = (solution, component, kind) else {
        return;
    };
    let solution_id = state.tables.get("solution").and_then(|rows| {
        rows.iter()
            .find(|r| r.text("uniquename") == Some(solution))
            .and_then(Record::record_id)
    });
    if let Some(solution_id) = solution_id {
        insert_row(
            state,
            Record::new("solutioncomponent")
                .set("solutionid", solution_id)
                .set("objectid", component)
                .set("componenttype", Field::Choice(kind as i32)),
        );
    }
}

fn loosely_equal(a: &Field, b: &Field) -> bool {
    if a == b {
        return true;
    }
    match (a.as_uuid(), b.as_uuid()) {
        (Some(x), Some(y)) => return x == y,
        _ => {}
    }
    match (a.as_i64(), b.as_i64()) {
        (Some(x), Some(y)) => return x == y,
        _ => {}
    }
    matches!((a, b), (Field::Text(x), Field::Text(y)) if x.eq_ignore_ascii_case(y))
}

fn compare_fields(a: Option<&Field>, b: Option<&Field>) -> Ordering {
    let a = a.filter(|f| !f.is_null());
    let b = b.filter(|f| !f.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(Field::Text(x)), Some(Field::Text(y))) => x.cmp(y),
        (Some(x), Some(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        },
    }
}

fn matches(record: &Record, query: &Query) -> bool {
    query.conditions.iter().all(|condition| {
        let value = record.get(&condition.attribute);
        match &condition.op {
            ConditionOp::Eq(Field::Null) | ConditionOp::IsNull => {
                value.map(Field::is_null).unwrap_or(true)
            }
            ConditionOp::Eq(expected) => value.map(|v| loosely_equal(v, expected)).unwrap_or(false),
            ConditionOp::In(options) => value
                .map(|v| options.iter().any(|o| loosely_equal(v, o)))
                .unwrap_or(false),
        }
    })
}

fn fault(status: u16, message: impl Into<String>) -> RemoteError {
    RemoteError::Fault {
        status,
        message: message.into(),
    }
}

#[async_trait]
impl RemoteClient for InMemoryRemote {
    async fn query(&self, query: &Query) -> Result<Vec<Record>, RemoteError> {
        let mut state = self.state();
        state.calls.push(RemoteCall::Query(query.entity.clone()));
        state.queries.push(query.clone());

        if let Some(remaining) = state.failing_queries.get_mut(&query.entity) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RemoteError::Transport(format!(
                    "simulated outage querying {}",
                    query.entity
                )));
            }
        }

        let mut rows: Vec<Record> = state
            .tables
            .get(&query.entity)
            .map(|rows| rows.iter().filter(|r| matches(r, query)).cloned().collect())
            .unwrap_or_default();

        for order in query.order.iter().rev() {
            rows.sort_by(|a, b| {
                let ord = compare_fields(a.get(&order.attribute), b.get(&order.attribute));
                if order.descending {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }
        if let Some(top) = query.top {
            rows.truncate(top as usize);
        }
        Ok(rows)
    }

    async fn create(&self, record: &Record) -> Result<Uuid, RemoteError> {
        let mut state = self.state();
        if let Some(id) = record.record_id() {
            if state.failing_ids.contains(&id) {
                return Err(fault(500, format!("simulated failure creating {id}")));
            }
        }
        let id = insert_row(&mut state, record.clone());
        state.calls.push(RemoteCall::Create {
            entity: record.entity.clone(),
            id,
        });
        Ok(id)
    }

    async fn update(&self, record: &Record) -> Result<(), RemoteError> {
        let id = record
            .record_id()
            .ok_or_else(|| fault(400, format!("update of {} without id", record.entity)))?;
        let mut state = self.state();
        if state.failing_ids.contains(&id) {
            return Err(fault(500, format!("simulated failure updating {id}")));
        }
        let row = state
            .tables
            .get_mut(&record.entity)
            .and_then(|rows| rows.iter_mut().find(|r| r.id == Some(id)))
            .ok_or_else(|| fault(404, format!("{} {id} does not exist", record.entity)))?;
        for (name, value) in &record.attributes {
            row.attributes.insert(name.clone(), value.clone());
        }
        state.calls.push(RemoteCall::Update {
            entity: record.entity.clone(),
            id,
        });
        Ok(())
    }

    async fn delete(&self, entity: &str, id: Uuid) -> Result<(), RemoteError> {
        let mut state = self.state();
        if state.failing_ids.contains(&id) {
            return Err(fault(500, format!("simulated failure deleting {id}")));
        }
        let rows = state
            .tables
            .get_mut(entity)
            .ok_or_else(|| fault(404, format!("{entity} {id} does not exist")))?;
        let before = rows.len();
        rows.retain(|r| r.id != Some(id));
        if rows.len() == before {
            return Err(fault(404, format!("{entity} {id} does not exist")));
        }
        state.calls.push(RemoteCall::Delete {
            entity: entity.to_string(),
            id,
        });
        Ok(())
    }

    async fn execute(&self, request: &OperationRequest) -> Result<serde_json::Value, RemoteError> {
        let mut state = self.state();
        state.calls.push(RemoteCall::Execute(request.name.clone()));
        state.executed.push(request.clone());
        if let Some(response) = state
            .responses
            .get_mut(&request.name)
            .and_then(VecDeque::pop_front)
        {
            return response;
        }
        if request.name == "AddSolutionComponent" {
            add_component(&mut state, request);
        }
        Ok(serde_json::json!({}))
    }
}
