//! Tool manifest data model and parser.
//!
//! A tool is a directory carrying a `tool.manifest` YAML document that
//! declares its parameters, how to invoke it, and how to provision its
//! execution environment. Parsing is tolerant: optional fields default,
//! partially-valid documents populate what they can, and only a missing
//! `runtime.entry` (or legacy `command`) is a hard error.

mod parser;


use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use parser::{parse_tool, DEFAULT_CATEGORY, MANIFEST_FILE};

/// Input field kind for one tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    File,
    Dir,
    Select,
    Int,
    Float,
    Text,
    Bool,
}

impl ParamType {
    /// Unrecognized names map to `Text`: the core never renders forms,
    /// so the permissive fallback loses nothing.
    pub fn parse(raw: &str) -> ParamType {
        match raw.trim().to_ascii_lowercase().as_str() {
            "file" => ParamType::File,
            "dir" => ParamType::Dir,
            "select" => ParamType::Select,
            "int" => ParamType::Int,
            "float" => ParamType::Float,
            "bool" => ParamType::Bool,
            _ => ParamType::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamOption {
    pub label: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamDefinition {
    pub key: String,
    pub label: String,
    #[serde(rename = "type")]
    pub kind: ParamType,
    pub required: bool,
    pub default: String,
    pub options: Vec<ParamOption>,
    pub multi: bool,
    /// Numeric bounds, meaningful for `Int`/`Float` params only.
    pub min: f64,
    pub max: f64,
    pub step: f64,
    pub placeholder: String,
    pub pattern: String,
    pub description: String,
}

impl Default for ParamDefinition {
    fn default() -> Self {
        Self {
            key: String::new(),
            label: String::new(),
            kind: ParamType::Text,
            required: false,
            default: String::new(),
            options: Vec::new(),
            multi: false,
            min: 0.0,
            max: 0.0,
            step: 1.0,
            placeholder: String::new(),
            pattern: String::new(),
            description: String::new(),
        }
    }
}

/// How a tool is invoked. Closed set: adding a runtime means updating
/// every match site, by design.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Python,
    R,
    #[default]
    Generic,
}

impl RuntimeKind {
    pub fn parse(raw: &str) -> RuntimeKind {
        match raw.trim().to_ascii_lowercase().as_str() {
            "python" => RuntimeKind::Python,
            "r" => RuntimeKind::R,
            _ => RuntimeKind::Generic,
        }
    }
}

/// Declared output of a run. Advisory metadata for the presentation
/// layer; nothing in the core enforces it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExpectedOutput {
    pub path: String,
    pub label: String,
    pub kind: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub kind: RuntimeKind,
    /// Path to the script/executable, relative to the tool directory.
    pub entry: String,
    /// Argument templates, expanded at run time (see `template`).
    pub args: Vec<String>,
    pub shell_wrap: bool,
    /// Working directory relative to the tool root.
    pub workdir: String,
    pub extra_env: BTreeMap<String, String>,
    /// Wall-clock limit for the spawned process; 0 = unbounded.
    pub timeout_secs: u64,
    pub expected_outputs: Vec<ExpectedOutput>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetupCommand {
    pub command: String,
    pub shell: bool,
    /// Working directory relative to the tool root.
    pub workdir: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvConfig {
    /// Raw strategy name from the manifest ("uv", "pak", "custom",
    /// "none" or empty = infer from the runtime kind). Resolved to a
    /// closed enum by the environment preparer.
    pub strategy: String,
    pub interpreter: String,
    pub dependencies: Vec<String>,
    /// Relative to the tool directory; empty means strategy default.
    pub cache_dir: String,
    pub setup: Option<SetupCommand>,
}

/// One discovered tool. Immutable once parsed; identity is `id`, the
/// tool's directory name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub category: String,
    pub thumbnail: String,
    pub tags: Vec<String>,
    pub params: Vec<ParamDefinition>,
    pub runtime: RuntimeConfig,
    pub env: EnvConfig,
}

/// Collected values for one parameter; a parameter may carry zero, one,
/// or many values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunParamValue {
    pub key: String,
    pub values: Vec<String>,
}

/// One execution intent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunRequest {
    pub tool_id: String,
    pub tool_version: String,
    pub params: Vec<RunParamValue>,
    /// Overrides the synthesized `<toolsRoot>/runs/<timestamp>_<toolId>`.
    pub run_dir: Option<PathBuf>,
    /// Overrides the resolved interpreter/program.
    pub program: Option<String>,
}

/// Outcome of scanning a tools root. Tools with parse errors are
/// excluded from `tools` but their errors still land in `error`, one
/// line each.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanResult {
    pub tools: Vec<ToolDefinition>,
    pub error: String,
}

impl ScanResult {
    pub fn ok(&self) -> bool {
        self.error.is_empty()
    }
}
