//! Tolerant `tool.manifest` parsing.

use std::path::Path;

use serde_yaml::Value;

use super::{
    EnvConfig, ExpectedOutput, ParamDefinition, ParamOption, ParamType, RuntimeConfig,
    RuntimeKind, SetupCommand, ToolDefinition,
};

pub const MANIFEST_FILE: &str = "tool.manifest";
pub const DEFAULT_CATEGORY: &str = "uncategorized";

/// Parse one tool directory's manifest.
///
/// Always returns a definition populated as far as possible, with `id`
/// set to the directory basename even when the manifest is missing or
/// broken, alongside an error describing what made the tool unusable,
/// if anything did.
pub fn parse_tool(tool_dir: &Path) -> (ToolDefinition, Option<String>) {
    let id = tool_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let mut tool = ToolDefinition {
        name: id.clone(),
        category: DEFAULT_CATEGORY.to_string(),
        id,
        ..ToolDefinition::default()
    };

    let manifest_path = tool_dir.join(MANIFEST_FILE);
    let raw = match std::fs::read_to_string(&manifest_path) {
        Ok(raw) => raw,
        Err(e) => {
            return (
                tool,
                Some(format!("failed to read {}: {e}", manifest_path.display())),
            )
        }
    };

    let doc: Value = match serde_yaml::from_str(&raw) {
        Ok(doc) => doc,
        Err(e) => {
            return (
                tool,
                Some(format!("invalid manifest {}: {e}", manifest_path.display())),
            )
        }
    };

    populate(&mut tool, &doc);

    if tool.runtime.entry.is_empty() {
        return (
            tool,
            Some(format!(
                "missing runtime.entry in {}",
                manifest_path.display()
            )),
        );
    }

    (tool, None)
}

fn populate(tool: &mut ToolDefinition, doc: &Value) {
    if let Some(name) = string_at(doc, "name") {
        if !name.is_empty() {
            tool.name = name;
        }
    }
    tool.version = string_at(doc, "version").unwrap_or_default();
    tool.description = string_at(doc, "description").unwrap_or_default();
    if let Some(category) = string_at(doc, "category") {
        if !category.is_empty() {
            tool.category = category;
        }
    }
    tool.thumbnail = string_at(doc, "thumbnail").unwrap_or_default();
    tool.tags = string_list_at(doc, "tags");

    if let Some(runtime) = doc.get("runtime") {
        tool.runtime = parse_runtime(runtime);
    }

    // Legacy manifests declare a flat `command` instead of a runtime
    // block; treat it as a generic entry.
    if tool.runtime.entry.is_empty() {
        if let Some(command) = string_at(doc, "command") {
            if !command.is_empty() {
                tool.runtime.kind = RuntimeKind::Generic;
                tool.runtime.entry = command;
            }
        }
    }

    if let Some(env) = doc.get("env") {
        tool.env = parse_env(env);
    }

    if tool.env.cache_dir.is_empty() {
        tool.env.cache_dir = match tool.runtime.kind {
            RuntimeKind::Python => ".venv".to_string(),
            RuntimeKind::R => ".r-lib".to_string(),
            RuntimeKind::Generic => String::new(),
        };
    }

    if let Some(params) = doc.get("params").and_then(Value::as_sequence) {
        tool.params = params.iter().map(parse_param).collect();
    }
}

fn parse_runtime(value: &Value) -> RuntimeConfig {
    let mut runtime = RuntimeConfig {
        kind: RuntimeKind::parse(&string_at(value, "type").unwrap_or_default()),
        entry: string_at(value, "entry").unwrap_or_default(),
        args: string_list_at(value, "args"),
        shell_wrap: bool_at(value, "shell"),
        workdir: string_at(value, "workdir").unwrap_or_default(),
        timeout_secs: u64_at(value, "timeout"),
        ..RuntimeConfig::default()
    };

    if let Some(extra) = value.get("extra_env").and_then(Value::as_mapping) {
        for (k, v) in extra {
            if let (Some(k), Some(v)) = (scalar_string(k), scalar_string(v)) {
                runtime.extra_env.insert(k, v);
            }
        }
    }

    if let Some(outputs) = value.get("expected_outputs").and_then(Value::as_sequence) {
        runtime.expected_outputs = outputs
            .iter()
            .map(|entry| ExpectedOutput {
                path: string_at(entry, "path").unwrap_or_default(),
                label: string_at(entry, "label").unwrap_or_default(),
                kind: string_at(entry, "type").unwrap_or_default(),
            })
            .collect();
    }

    runtime
}

fn parse_env(value: &Value) -> EnvConfig {
    let mut env = EnvConfig {
        strategy: string_at(value, "strategy").unwrap_or_default(),
        interpreter: string_at(value, "interpreter").unwrap_or_default(),
        dependencies: string_list_at(value, "dependencies"),
        cache_dir: string_at(value, "cache_dir").unwrap_or_default(),
        setup: None,
    };

    if let Some(setup) = value.get("setup") {
        let command = string_at(setup, "command").unwrap_or_default();
        if !command.is_empty() {
            env.setup = Some(SetupCommand {
                command,
                shell: bool_at(setup, "shell"),
                workdir: string_at(setup, "workdir").unwrap_or_default(),
            });
        }
    }

    env
}

fn parse_param(value: &Value) -> ParamDefinition {
    let mut param = ParamDefinition {
        key: string_at(value, "key").unwrap_or_default(),
        label: string_at(value, "label").unwrap_or_default(),
        kind: ParamType::parse(&string_at(value, "type").unwrap_or_default()),
        required: bool_at(value, "required"),
        default: string_at(value, "default").unwrap_or_default(),
        multi: bool_at(value, "multi"),
        placeholder: string_at(value, "placeholder").unwrap_or_default(),
        pattern: string_at(value, "pattern").unwrap_or_default(),
        description: string_at(value, "description").unwrap_or_default(),
        ..ParamDefinition::default()
    };

    if let Some(min) = f64_at(value, "min") {
        param.min = min;
    }
    if let Some(max) = f64_at(value, "max") {
        param.max = max;
    }
    if let Some(step) = f64_at(value, "step") {
        param.step = step;
    }

    // Options accept plain scalars (label = value) or {label, value}
    // maps.
    if let Some(options) = value.get("options").and_then(Value::as_sequence) {
        param.options = options
            .iter()
            .filter_map(|entry| {
                if let Some(scalar) = scalar_string(entry) {
                    return Some(ParamOption {
                        label: scalar.clone(),
                        value: scalar,
                    });
                }
                if entry.is_mapping() {
                    let value = string_at(entry, "value").unwrap_or_default();
                    let label = string_at(entry, "label").unwrap_or_else(|| value.clone());
                    return Some(ParamOption { label, value });
                }
                None
            })
            .collect();
    }

    param
}

/// Scalar coercion: strings verbatim, numbers and bools rendered the
/// way YAML wrote them.
fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn string_at(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(scalar_string)
}

fn string_list_at(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(Value::as_sequence)
        .map(|seq| seq.iter().filter_map(scalar_string).collect())
        .unwrap_or_default()
}

fn bool_at(value: &Value, key: &str) -> bool {
    match value.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.trim().eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn u64_at(value: &Value, key: &str) -> u64 {
    value.get(key).and_then(Value::as_u64).unwrap_or(0)
}

fn f64_at(value: &Value, key: &str) -> Option<f64> {
    value.get(key).and_then(Value::as_f64)
}
