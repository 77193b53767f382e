/// Protocol value types and per-session parameters
///
/// This module defines the decoded response tree produced by the wire codec
/// and the immutable parameters a session is started with.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// One node of a decoded response block.
///
/// Leaves are kept as the raw text the backend sent; the consumer decides
/// whether a leaf is a number, an address or a hex blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    String(String),
    List(Vec<Value>),
    Tuple(Vec<(String, Value)>),
}

impl Value {
    /// Get the value as a string, if possible
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get the value as a list, if possible
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(list) => Some(list),
            _ => None,
        }
    }

    /// Get the value as a tuple, if possible
    pub fn as_tuple(&self) -> Option<&[(String, Value)]> {
        match self {
            Value::Tuple(tuple) => Some(tuple),
            _ => None,
        }
    }

    /// Look up a named field of a tuple. Field order is preserved, the
    /// first match wins.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_tuple()?
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value)
    }

    /// Leaf text, or the empty string for lists and tuples.
    pub fn data(&self) -> &str {
        self.as_string().unwrap_or("")
    }

    /// Text of a named leaf field, empty when absent.
    pub fn field(&self, key: &str) -> &str {
        self.get(key).map(Value::data).unwrap_or("")
    }

    /// Children of a list, or the field values of a tuple.
    pub fn children(&self) -> Vec<&Value> {
        match self {
            Value::String(_) => Vec::new(),
            Value::List(list) => list.iter().collect(),
            Value::Tuple(tuple) => tuple.iter().map(|(_, value)| value).collect(),
        }
    }

    pub fn to_int(&self) -> i64 {
        let text = self.data().trim();
        match text {
            "true" => 1,
            "false" => 0,
            _ => text.parse().unwrap_or(0),
        }
    }

    pub fn to_bool(&self) -> bool {
        matches!(self.data().trim(), "1" | "true" | "y" | "yes")
    }

    /// Parse an address leaf, accepting `0x` prefixed hex or decimal text.
    pub fn to_address(&self) -> u64 {
        let text = self.data().trim();
        if let Some(hex_digits) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
            u64::from_str_radix(hex_digits, 16).unwrap_or(0)
        } else {
            text.parse().unwrap_or(0)
        }
    }

    /// Decode a hex-encoded leaf into text. Invalid hex decodes to an empty
    /// string, invalid UTF-8 is replaced.
    pub fn hex_text(&self) -> String {
        String::from_utf8_lossy(&self.hex_bytes()).into_owned()
    }

    pub fn hex_bytes(&self) -> Vec<u8> {
        hex::decode(self.data().trim()).unwrap_or_else(|err| {
            log::debug!("Ignoring undecodable hex payload: {}", err);
            Vec::new()
        })
    }
}

/// One backend-emitted unit: an ordered list of top-level named fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedResponse {
    pub items: Vec<(String, Value)>,
}

impl DecodedResponse {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.items
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    /// Token of the command this block answers, if the backend echoed one.
    pub fn token(&self) -> Option<u64> {
        self.get("token")?.data().trim().parse().ok()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Identity of one engine instance, used for breakpoint ownership.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct EngineId(pub usize);

impl std::fmt::Display for EngineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "engine-{}", self.0)
    }
}

/// How the inferior is brought under control.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StartMode {
    #[default]
    Launch,
    Attach,
    Remote,
    CoreFile,
}

impl StartMode {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "launch" => Some(StartMode::Launch),
            "attach" => Some(StartMode::Attach),
            "remote" => Some(StartMode::Remote),
            "core-file" | "core" => Some(StartMode::CoreFile),
            _ => None,
        }
    }

    pub fn is_attach(self) -> bool {
        matches!(self, StartMode::Attach | StartMode::Remote)
    }
}

impl std::fmt::Display for StartMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StartMode::Launch => "launch",
            StartMode::Attach => "attach",
            StartMode::Remote => "remote",
            StartMode::CoreFile => "core-file",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ToolChain {
    pub id: String,
    pub abi: Option<String>,
}

/// Per-session configuration. Built once before setup and never mutated
/// while the session runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SessionParameters {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub attach_pid: Option<u32>,
    pub remote_channel: Option<String>,
    pub start_mode: StartMode,
    pub core_file: Option<PathBuf>,
    pub tool_chain: ToolChain,
    pub sys_root: Option<PathBuf>,
    pub platform: Option<String>,
    pub break_at_main: bool,
    pub continue_after_attach: bool,
    pub use_terminal: bool,
}

impl SessionParameters {
    pub fn launch(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            ..Default::default()
        }
    }

    pub fn attach(pid: u32) -> Self {
        Self {
            attach_pid: Some(pid),
            start_mode: StartMode::Attach,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuple(fields: &[(&str, &str)]) -> Value {
        Value::Tuple(
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
                .collect(),
        )
    }

    #[test]
    fn test_field_lookup_keeps_first_match() {
        let value = tuple(&[("line", "10"), ("line", "20")]);
        assert_eq!(value.field("line"), "10");
        assert_eq!(value.field("missing"), "");
        assert_eq!(value.get("line").unwrap().to_int(), 10);
    }

    #[test]
    fn test_numeric_conversions() {
        assert_eq!(Value::String("0x401000".into()).to_address(), 0x401000);
        assert_eq!(Value::String("4096".into()).to_address(), 4096);
        assert_eq!(Value::String("garbage".into()).to_address(), 0);
        assert_eq!(Value::String("true".into()).to_int(), 1);
        assert!(Value::String("y".into()).to_bool());
        assert!(!Value::String("0".into()).to_bool());
    }

    #[test]
    fn test_hex_leaf_decoding() {
        assert_eq!(Value::String("6869".into()).hex_text(), "hi");
        assert!(Value::String("zz".into()).hex_bytes().is_empty());
    }

    #[test]
    fn test_response_token() {
        let response = DecodedResponse {
            items: vec![
                ("state".into(), Value::String("running".into())),
                ("token".into(), Value::String("17".into())),
            ],
        };
        assert_eq!(response.token(), Some(17));
        assert_eq!(response.get("state").unwrap().data(), "running");
    }

    #[test]
    fn test_start_mode_names() {
        for mode in [StartMode::Launch, StartMode::Attach, StartMode::Remote, StartMode::CoreFile] {
            assert_eq!(StartMode::from_str(&mode.to_string()), Some(mode));
        }
        assert!(StartMode::Remote.is_attach());
        assert!(!StartMode::CoreFile.is_attach());
    }

    #[test]
    fn test_parameters_deserialize_with_defaults() {
        let params: SessionParameters =
            serde_json::from_str(r#"{"executable":"/bin/true","break-at-main":true}"#).unwrap();
        assert_eq!(params.executable, PathBuf::from("/bin/true"));
        assert!(params.break_at_main);
        assert_eq!(params.start_mode, StartMode::Launch);
        assert!(params.args.is_empty());
    }
}
