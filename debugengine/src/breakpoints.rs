/// Breakpoint model and synchronization
///
/// Breakpoints are declared by the client and claimed by at most one engine.
/// Each carries a small lifecycle (`BreakpointState`) that only moves on a
/// client edit or a backend acknowledgement. A synchronization pass turns
/// every pending edit of one engine into a single batched backend command.

use parking_lot::Mutex;
use regex::Regex;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use thiserror::Error;

use crate::commands::{group, to_hex, Command};
use crate::types::{EngineId, Value};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BreakpointError {
    #[error("unknown breakpoint {0}")]
    UnknownId(String),
    #[error("breakpoint {0} already exists")]
    DuplicateId(String),
    #[error("breakpoint {0} is being removed")]
    Removed(String),
    #[error("acknowledgement carries neither modelid nor lldbid")]
    MalformedAck,
    #[error("cannot parse breakpoint location '{0}'")]
    InvalidLocation(String),
}

pub type Result<T> = std::result::Result<T, BreakpointError>;

/// Client-assigned model id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BreakpointId(pub String);

impl std::fmt::Display for BreakpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BreakpointId {
    fn from(id: &str) -> Self {
        BreakpointId(id.to_string())
    }
}

/// Backend-assigned id. Sub-breakpoints use `major.minor`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct BreakpointResponseId(pub String);

impl BreakpointResponseId {
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
    }

    pub fn major_part(&self) -> &str {
        self.0.split('.').next().unwrap_or("")
    }

    pub fn sub(&self, minor: &str) -> BreakpointResponseId {
        BreakpointResponseId(format!("{}.{}", self.major_part(), minor))
    }
}

impl std::fmt::Display for BreakpointResponseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakpointLocation {
    FileAndLine { file: String, line: u32 },
    Function(String),
    Address(u64),
}

impl BreakpointLocation {
    /// Parse `file:line`, `0xADDR` or a function name.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Err(BreakpointError::InvalidLocation(text.to_string()));
        }

        if let Some(digits) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
            return u64::from_str_radix(digits, 16)
                .map(BreakpointLocation::Address)
                .map_err(|_| BreakpointError::InvalidLocation(text.to_string()));
        }

        let re = Regex::new(r"^(.+):(\d+)$").map_err(|_| BreakpointError::InvalidLocation(text.to_string()))?;
        if let Some(caps) = re.captures(text) {
            let line = caps[2]
                .parse()
                .map_err(|_| BreakpointError::InvalidLocation(text.to_string()))?;
            return Ok(BreakpointLocation::FileAndLine {
                file: caps[1].to_string(),
                line,
            });
        }

        if text.chars().any(char::is_whitespace) {
            return Err(BreakpointError::InvalidLocation(text.to_string()));
        }
        Ok(BreakpointLocation::Function(text.to_string()))
    }

    /// Numeric type code understood by the bridge.
    pub fn type_code(&self) -> i64 {
        match self {
            BreakpointLocation::FileAndLine { .. } => 1,
            BreakpointLocation::Function(_) => 2,
            BreakpointLocation::Address(_) => 3,
        }
    }
}

impl std::fmt::Display for BreakpointLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakpointLocation::FileAndLine { file, line } => write!(f, "{}:{}", file, line),
            BreakpointLocation::Function(name) => write!(f, "{}", name),
            BreakpointLocation::Address(address) => write!(f, "0x{:x}", address),
        }
    }
}

/// What the client asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointParameters {
    pub location: BreakpointLocation,
    pub condition: String,
    pub ignore_count: u32,
    pub enabled: bool,
    pub one_shot: bool,
    pub thread_spec: Option<i64>,
}

impl BreakpointParameters {
    pub fn new(location: BreakpointLocation) -> Self {
        Self {
            location,
            condition: String::new(),
            ignore_count: 0,
            enabled: true,
            one_shot: false,
            thread_spec: None,
        }
    }

    pub fn at_file_line(file: impl Into<String>, line: u32) -> Self {
        Self::new(BreakpointLocation::FileAndLine { file: file.into(), line })
    }

    pub fn at_function(name: impl Into<String>) -> Self {
        Self::new(BreakpointLocation::Function(name.into()))
    }

    pub fn at_address(address: u64) -> Self {
        Self::new(BreakpointLocation::Address(address))
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = condition.into();
        self
    }

    pub fn with_ignore_count(mut self, count: u32) -> Self {
        self.ignore_count = count;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn one_shot(mut self) -> Self {
        self.one_shot = true;
        self
    }

    pub fn with_thread(mut self, thread: i64) -> Self {
        self.thread_spec = Some(thread);
        self
    }
}

/// What the backend reported after inserting or changing a breakpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BreakpointResponse {
    pub id: BreakpointResponseId,
    pub address: u64,
    pub file: String,
    pub line: i64,
    pub function: String,
    pub enabled: bool,
    pub ignore_count: u32,
    pub condition: String,
    pub hit_count: i64,
}

/// One resolved location of a breakpoint that matched several addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubBreakpoint {
    pub id: BreakpointResponseId,
    pub address: u64,
    pub function: String,
    pub file: String,
    pub line: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakpointState {
    New,
    InsertRequested,
    InsertProceeding,
    Inserted,
    /// Acknowledged, but no location resolved yet.
    Pending,
    ChangeRequested,
    ChangeProceeding,
    RemoveRequested,
    RemoveProceeding,
    Dead,
}

impl BreakpointState {
    fn is_removing(self) -> bool {
        matches!(
            self,
            BreakpointState::RemoveRequested | BreakpointState::RemoveProceeding | BreakpointState::Dead
        )
    }
}

#[derive(Debug, Clone)]
pub struct Breakpoint {
    id: BreakpointId,
    params: BreakpointParameters,
    state: BreakpointState,
    engine: Option<EngineId>,
    response: BreakpointResponse,
    sub_breakpoints: Vec<SubBreakpoint>,
    needs_change: bool,
    needs_removal: bool,
}

impl Breakpoint {
    fn new(id: BreakpointId, params: BreakpointParameters) -> Self {
        Self {
            id,
            params,
            state: BreakpointState::New,
            engine: None,
            response: BreakpointResponse::default(),
            sub_breakpoints: Vec::new(),
            needs_change: false,
            needs_removal: false,
        }
    }

    pub fn id(&self) -> &BreakpointId {
        &self.id
    }

    pub fn params(&self) -> &BreakpointParameters {
        &self.params
    }

    pub fn state(&self) -> BreakpointState {
        self.state
    }

    pub fn engine(&self) -> Option<EngineId> {
        self.engine
    }

    pub fn response(&self) -> &BreakpointResponse {
        &self.response
    }

    pub fn sub_breakpoints(&self) -> &[SubBreakpoint] {
        &self.sub_breakpoints
    }

    pub fn is_claimed_by(&self, engine: EngineId) -> bool {
        self.engine == Some(engine)
    }

    fn set_state(&mut self, state: BreakpointState) {
        log::debug!("Breakpoint {} state {:?} -> {:?}", self.id, self.state, state);
        self.state = state;
    }

    fn claim(&mut self, engine: EngineId) {
        log::debug!("{} claims breakpoint {}", engine, self.id);
        self.engine = Some(engine);
        if self.state == BreakpointState::New {
            self.set_state(BreakpointState::InsertRequested);
        }
    }
}

/// One entry of a `handleBreakpoints` batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakpointOperation {
    Add {
        id: BreakpointId,
        params: BreakpointParameters,
    },
    Change {
        id: BreakpointId,
        backend_id: BreakpointResponseId,
        params: BreakpointParameters,
    },
    Remove {
        id: BreakpointId,
        backend_id: BreakpointResponseId,
    },
}

impl BreakpointOperation {
    pub fn name(&self) -> &'static str {
        match self {
            BreakpointOperation::Add { .. } => "add",
            BreakpointOperation::Change { .. } => "change",
            BreakpointOperation::Remove { .. } => "remove",
        }
    }

    pub fn id(&self) -> &BreakpointId {
        match self {
            BreakpointOperation::Add { id, .. }
            | BreakpointOperation::Change { id, .. }
            | BreakpointOperation::Remove { id, .. } => id,
        }
    }

    pub fn to_group(&self) -> JsonValue {
        let mut fields = vec![("operation", json!(self.name())), ("modelid", json!(self.id().0))];
        match self {
            BreakpointOperation::Add { params, .. } => {
                fields.extend(parameter_fields(params));
            }
            BreakpointOperation::Change { backend_id, params, .. } => {
                fields.extend(parameter_fields(params));
                fields.push(("lldbid", json!(backend_id.0)));
            }
            BreakpointOperation::Remove { backend_id, .. } => {
                fields.push(("lldbid", json!(backend_id.0)));
            }
        }
        group(fields)
    }
}

fn parameter_fields(params: &BreakpointParameters) -> Vec<(&'static str, JsonValue)> {
    let (function, file, line, address) = match &params.location {
        BreakpointLocation::FileAndLine { file, line } => (String::new(), file.clone(), i64::from(*line), 0),
        BreakpointLocation::Function(name) => (name.clone(), String::new(), 0, 0),
        BreakpointLocation::Address(address) => (String::new(), String::new(), 0, *address),
    };
    vec![
        ("type", json!(params.location.type_code())),
        ("ignorecount", json!(params.ignore_count)),
        ("condition", json!(to_hex(&params.condition))),
        ("function", json!(function)),
        ("oneshot", json!(params.one_shot)),
        ("enabled", json!(params.enabled)),
        ("file", json!(file)),
        ("line", json!(line)),
        ("address", json!(address)),
        ("expression", json!("")),
        ("thread", json!(params.thread_spec.unwrap_or(-1))),
    ]
}

/// Build the single command carrying every operation of one pass.
pub fn batch_command(operations: &[BreakpointOperation]) -> Command {
    Command::new("handleBreakpoints").list("bkpts", operations.iter().map(BreakpointOperation::to_group))
}

pub type SharedBreakHandler = Arc<Mutex<BreakHandler>>;

/// Registry of every breakpoint the client declared, in insertion order.
#[derive(Debug, Default)]
pub struct BreakHandler {
    breakpoints: Vec<Breakpoint>,
    next_id: usize,
}

impl BreakHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedBreakHandler {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn len(&self) -> usize {
        self.breakpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakpoints.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.iter()
    }

    pub fn get(&self, id: &BreakpointId) -> Option<&Breakpoint> {
        self.breakpoints.iter().find(|bp| &bp.id == id)
    }

    fn get_mut(&mut self, id: &BreakpointId) -> Option<&mut Breakpoint> {
        self.breakpoints.iter_mut().find(|bp| &bp.id == id)
    }

    /// Declare a breakpoint under a client-chosen id.
    pub fn add(&mut self, id: BreakpointId, params: BreakpointParameters) -> Result<()> {
        if self.get(&id).is_some() {
            return Err(BreakpointError::DuplicateId(id.0));
        }
        log::debug!("Adding breakpoint {} at {}", id, params.location);
        self.breakpoints.push(Breakpoint::new(id, params));
        Ok(())
    }

    /// Declare a breakpoint under the next free `B<n>` id.
    pub fn insert(&mut self, params: BreakpointParameters) -> BreakpointId {
        loop {
            self.next_id += 1;
            let id = BreakpointId(format!("B{}", self.next_id));
            if self.get(&id).is_none() {
                log::debug!("Adding breakpoint {} at {}", id, params.location);
                self.breakpoints.push(Breakpoint::new(id.clone(), params));
                return id;
            }
        }
    }

    /// Function breakpoint, reusing an existing one on the same function.
    pub fn break_by_function(&mut self, name: &str) -> BreakpointId {
        let existing = self.breakpoints.iter().find(|bp| {
            !bp.state.is_removing() && matches!(&bp.params.location, BreakpointLocation::Function(f) if f == name)
        });
        match existing {
            Some(bp) => bp.id.clone(),
            None => self.insert(BreakpointParameters::at_function(name)),
        }
    }

    /// Record a client edit.
    pub fn change(&mut self, id: &BreakpointId, params: BreakpointParameters) -> Result<()> {
        let bp = self
            .get_mut(id)
            .ok_or_else(|| BreakpointError::UnknownId(id.0.clone()))?;
        match bp.state {
            BreakpointState::New | BreakpointState::InsertRequested | BreakpointState::ChangeRequested => {
                bp.params = params;
            }
            BreakpointState::InsertProceeding | BreakpointState::ChangeProceeding => {
                bp.params = params;
                bp.needs_change = true;
            }
            BreakpointState::Inserted | BreakpointState::Pending => {
                bp.params = params;
                bp.set_state(BreakpointState::ChangeRequested);
            }
            BreakpointState::RemoveRequested | BreakpointState::RemoveProceeding | BreakpointState::Dead => {
                return Err(BreakpointError::Removed(id.0.clone()));
            }
        }
        Ok(())
    }

    /// Record a client removal. Breakpoints the backend never saw are
    /// dropped at once.
    pub fn remove(&mut self, id: &BreakpointId) -> Result<()> {
        let index = self
            .breakpoints
            .iter()
            .position(|bp| &bp.id == id)
            .ok_or_else(|| BreakpointError::UnknownId(id.0.clone()))?;

        match self.breakpoints[index].state {
            BreakpointState::New | BreakpointState::InsertRequested => {
                log::debug!("Dropping unsent breakpoint {}", id);
                self.breakpoints.remove(index);
            }
            BreakpointState::InsertProceeding | BreakpointState::ChangeProceeding => {
                self.breakpoints[index].needs_removal = true;
            }
            BreakpointState::Inserted | BreakpointState::Pending | BreakpointState::ChangeRequested => {
                self.breakpoints[index].set_state(BreakpointState::RemoveRequested);
            }
            BreakpointState::RemoveRequested | BreakpointState::RemoveProceeding | BreakpointState::Dead => {}
        }
        Ok(())
    }

    pub fn unclaimed_ids(&self) -> Vec<BreakpointId> {
        self.breakpoints
            .iter()
            .filter(|bp| bp.engine.is_none())
            .map(|bp| bp.id.clone())
            .collect()
    }

    pub fn engine_ids(&self, engine: EngineId) -> Vec<BreakpointId> {
        self.breakpoints
            .iter()
            .filter(|bp| bp.is_claimed_by(engine))
            .map(|bp| bp.id.clone())
            .collect()
    }

    /// Return every breakpoint of `engine` to the unclaimed pool. Breakpoints
    /// on their way out are dropped instead.
    pub fn release_all(&mut self, engine: EngineId) -> Vec<BreakpointId> {
        let mut released = Vec::new();
        self.breakpoints.retain_mut(|bp| {
            if !bp.is_claimed_by(engine) {
                return true;
            }
            released.push(bp.id.clone());
            if bp.state.is_removing() || bp.needs_removal {
                return false;
            }
            bp.engine = None;
            bp.state = BreakpointState::New;
            bp.response = BreakpointResponse::default();
            bp.sub_breakpoints.clear();
            bp.needs_change = false;
            true
        });
        if !released.is_empty() {
            log::debug!("{} released {} breakpoint(s)", engine, released.len());
        }
        released
    }

    /// One synchronization pass for `engine`. An empty result means the
    /// backend already holds everything.
    pub fn synchronize<F>(&mut self, engine: EngineId, accepts: F) -> Vec<BreakpointOperation>
    where
        F: Fn(&Breakpoint) -> bool,
    {
        for bp in self.breakpoints.iter_mut().filter(|bp| bp.engine.is_none()) {
            if accepts(bp) {
                bp.claim(engine);
            }
        }

        let mut operations = Vec::new();
        for bp in self.breakpoints.iter_mut().filter(|bp| bp.is_claimed_by(engine)) {
            match bp.state {
                BreakpointState::InsertRequested => {
                    operations.push(BreakpointOperation::Add {
                        id: bp.id.clone(),
                        params: bp.params.clone(),
                    });
                    bp.set_state(BreakpointState::InsertProceeding);
                }
                BreakpointState::ChangeRequested => {
                    operations.push(BreakpointOperation::Change {
                        id: bp.id.clone(),
                        backend_id: bp.response.id.clone(),
                        params: bp.params.clone(),
                    });
                    bp.set_state(BreakpointState::ChangeProceeding);
                }
                BreakpointState::RemoveRequested => {
                    operations.push(BreakpointOperation::Remove {
                        id: bp.id.clone(),
                        backend_id: bp.response.id.clone(),
                    });
                    bp.set_state(BreakpointState::RemoveProceeding);
                }
                _ => {}
            }
        }
        operations
    }

    /// Only breakpoints claimed by `engine` match: every backend numbers
    /// its ids from 1.
    fn find_for_ack(&mut self, engine: EngineId, value: &Value) -> Result<&mut Breakpoint> {
        let model_id = value.field("modelid");
        let backend_id = value.field("lldbid");
        if model_id.is_empty() && backend_id.is_empty() {
            return Err(BreakpointError::MalformedAck);
        }

        let index = self
            .breakpoints
            .iter()
            .position(|bp| !model_id.is_empty() && bp.is_claimed_by(engine) && bp.id.0 == model_id)
            .or_else(|| {
                self.breakpoints.iter().position(|bp| {
                    !backend_id.is_empty() && bp.is_claimed_by(engine) && bp.response.id.major_part() == backend_id
                })
            })
            .ok_or_else(|| {
                BreakpointError::UnknownId(if model_id.is_empty() { backend_id } else { model_id }.to_string())
            })?;
        Ok(&mut self.breakpoints[index])
    }

    /// Apply a `breakpoint-added` or `breakpoint-changed` acknowledgement.
    pub fn apply_update(&mut self, engine: EngineId, value: &Value) -> Result<BreakpointId> {
        let bp = self.find_for_ack(engine, value)?;

        let backend_id = value.field("lldbid");
        if !backend_id.is_empty() {
            bp.response.id = BreakpointResponseId(backend_id.to_string());
        }
        if let Some(enabled) = value.get("enabled") {
            bp.response.enabled = enabled.to_bool();
        }
        if let Some(ignore) = value.get("ignorecount") {
            bp.response.ignore_count = u32::try_from(ignore.to_int()).unwrap_or(0);
        }
        if let Some(condition) = value.get("condition") {
            bp.response.condition = condition.hex_text();
        }
        if let Some(hits) = value.get("hitcount") {
            bp.response.hit_count = hits.to_int();
        }
        if let Some(file) = value.get("file") {
            bp.response.file = file.data().to_string();
        }
        if let Some(line) = value.get("line") {
            bp.response.line = line.to_int();
        }

        let locations = value.get("locations").map(Value::children).unwrap_or_default();
        bp.sub_breakpoints.clear();
        match locations.as_slice() {
            [] => {}
            [only] => {
                bp.response.address = only.get("addr").map(Value::to_address).unwrap_or(0);
                bp.response.function = only.field("func").to_string();
            }
            several => {
                for location in several {
                    bp.sub_breakpoints.push(SubBreakpoint {
                        id: bp.response.id.sub(location.field("locid")),
                        address: location.get("addr").map(Value::to_address).unwrap_or(0),
                        function: location.field("func").to_string(),
                        file: location.field("file").to_string(),
                        line: location.get("line").map(Value::to_int).unwrap_or(0),
                    });
                }
            }
        }

        match bp.state {
            BreakpointState::ChangeRequested
            | BreakpointState::RemoveRequested
            | BreakpointState::RemoveProceeding
            | BreakpointState::Dead => {}
            _ => {
                if value.get("pending").is_some_and(Value::to_bool) {
                    bp.set_state(BreakpointState::Pending);
                } else {
                    if locations.is_empty() {
                        log::debug!("NO LOCATIONS (YET) FOR BP {}", bp.id);
                    }
                    bp.set_state(BreakpointState::Inserted);
                }
                if bp.needs_removal {
                    bp.needs_removal = false;
                    bp.needs_change = false;
                    bp.set_state(BreakpointState::RemoveRequested);
                } else if bp.needs_change {
                    bp.needs_change = false;
                    bp.set_state(BreakpointState::ChangeRequested);
                }
            }
        }

        Ok(bp.id.clone())
    }

    /// Apply a `breakpoint-removed` acknowledgement. The breakpoint is gone
    /// afterwards.
    pub fn apply_removed(&mut self, engine: EngineId, value: &Value) -> Result<BreakpointId> {
        let bp = self.find_for_ack(engine, value)?;
        bp.set_state(BreakpointState::Dead);
        let id = bp.id.clone();
        self.breakpoints.retain(|bp| bp.id != id);
        Ok(id)
    }
}
