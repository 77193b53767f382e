/// Outgoing command envelopes
///
/// Every command is a single JSON object carrying the command name under
/// `cmd`, its named arguments and the correlation `token`, written on one
/// line.

use serde_json::{Map, Value as JsonValue};

/// Follow-up action a backend echoes back once a round trip completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Continuation {
    /// Start the inferior once the initial breakpoint batch is acknowledged.
    RunEngine,
    UpdateAll,
    UpdateLocals,
    ReloadRegisters,
    SynchronizeBreakpoints,
}

impl Continuation {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "runEngine" => Some(Continuation::RunEngine),
            "updateAll" => Some(Continuation::UpdateAll),
            "updateLocals" => Some(Continuation::UpdateLocals),
            "reloadRegisters" => Some(Continuation::ReloadRegisters),
            "attemptBreakpointSynchronization" => Some(Continuation::SynchronizeBreakpoints),
            _ => None,
        }
    }
}

impl std::fmt::Display for Continuation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Continuation::RunEngine => "runEngine",
            Continuation::UpdateAll => "updateAll",
            Continuation::UpdateLocals => "updateLocals",
            Continuation::ReloadRegisters => "reloadRegisters",
            Continuation::SynchronizeBreakpoints => "attemptBreakpointSynchronization",
        };
        write!(f, "{}", s)
    }
}

/// A named backend command with its arguments, not yet assigned a token.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    function: String,
    args: Map<String, JsonValue>,
}

impl Command {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            args: Map::new(),
        }
    }

    /// Add a named argument. Later values replace earlier ones with the
    /// same name, keeping the original position.
    pub fn arg(mut self, name: &str, value: impl Into<JsonValue>) -> Self {
        self.push_arg(name, value);
        self
    }

    pub fn push_arg(&mut self, name: &str, value: impl Into<JsonValue>) {
        self.args.insert(name.to_string(), value.into());
    }

    /// Add a list argument built from groups or scalars.
    pub fn list<I, V>(self, name: &str, items: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<JsonValue>,
    {
        let items: Vec<JsonValue> = items.into_iter().map(Into::into).collect();
        self.arg(name, JsonValue::Array(items))
    }

    pub fn with_continuation(self, continuation: Continuation) -> Self {
        self.arg("continuation", continuation.to_string())
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn args(&self) -> &Map<String, JsonValue> {
        &self.args
    }

    pub fn continuation(&self) -> Option<Continuation> {
        self.args
            .get("continuation")
            .and_then(JsonValue::as_str)
            .and_then(Continuation::from_str)
    }

    /// Serialized argument payload, without command name or token.
    pub fn payload(&self) -> String {
        JsonValue::Object(self.args.clone()).to_string()
    }

    /// The full newline-terminated envelope for `token`.
    pub fn encode(&self, token: u64) -> String {
        let mut envelope = Map::new();
        envelope.insert("cmd".to_string(), JsonValue::String(self.function.clone()));
        for (name, value) in &self.args {
            if name == "cmd" || name == "token" {
                log::warn!("Command {} overrides reserved field '{}', dropping it", self.function, name);
                continue;
            }
            envelope.insert(name.clone(), value.clone());
        }
        envelope.insert("token".to_string(), JsonValue::from(token));

        let mut line = JsonValue::Object(envelope).to_string();
        line.push('\n');
        line
    }
}

impl From<&str> for Command {
    fn from(function: &str) -> Self {
        Command::new(function)
    }
}

/// Build a group (JSON object) for use inside list arguments.
pub fn group<I, K>(fields: I) -> JsonValue
where
    I: IntoIterator<Item = (K, JsonValue)>,
    K: Into<String>,
{
    JsonValue::Object(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
}

/// Hex encoding used for free-form text the bridge must not reinterpret.
pub fn to_hex(text: &str) -> String {
    hex::encode(text.as_bytes())
}
