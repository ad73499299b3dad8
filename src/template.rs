//! Argument templating.
//!
//! A tool's declared argument templates are expanded against the run
//! context right before spawn. Recognized placeholders:
//! `{{run.outputs}}`, `{{run.dir}}`, `{{tool.root}}`,
//! `{{runtime.workdir}}` and `{{params.<key>}}`.
//!
//! A template that is exactly one `{{params.<key>}}` token splices the
//! parameter's full value list into the argument vector (zero values
//! contribute one empty entry, preserving argument position). Embedded
//! in surrounding text, a params placeholder substitutes the first
//! value only; joining semantics for multi-value params in embedded
//! position are deliberately not defined.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::manifest::{RunParamValue, RuntimeConfig};

fn params_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*params\.([A-Za-z0-9_\-]+)\s*\}\}").expect("valid params regex")
    })
}

fn whole_params_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\{\{\s*params\.([A-Za-z0-9_\-]+)\s*\}\}$").expect("valid params regex")
    })
}

/// Index request parameters by key for expansion.
pub fn param_map(params: &[RunParamValue]) -> HashMap<String, Vec<String>> {
    params
        .iter()
        .map(|p| (p.key.clone(), p.values.clone()))
        .collect()
}

/// Expand every template into zero or more concrete arguments.
/// Pure: no filesystem or environment access.
pub fn expand_args(
    templates: &[String],
    params: &HashMap<String, Vec<String>>,
    run_dir: &str,
    output_dir: &str,
    tool_dir: &str,
    runtime: &RuntimeConfig,
) -> Vec<String> {
    templates
        .iter()
        .flat_map(|t| render_token(t, params, run_dir, output_dir, tool_dir, runtime))
        .collect()
}

fn render_token(
    token: &str,
    params: &HashMap<String, Vec<String>>,
    run_dir: &str,
    output_dir: &str,
    tool_dir: &str,
    runtime: &RuntimeConfig,
) -> Vec<String> {
    if let Some(captures) = whole_params_re().captures(token) {
        let values = params.get(&captures[1]);
        return match values {
            Some(values) if !values.is_empty() => values.clone(),
            _ => vec![String::new()],
        };
    }

    vec![apply_placeholders(
        token, params, run_dir, output_dir, tool_dir, runtime,
    )]
}

fn apply_placeholders(
    token: &str,
    params: &HashMap<String, Vec<String>>,
    run_dir: &str,
    output_dir: &str,
    tool_dir: &str,
    runtime: &RuntimeConfig,
) -> String {
    let token = token
        .replace("{{run.outputs}}", output_dir)
        .replace("{{run.dir}}", run_dir)
        .replace("{{tool.root}}", tool_dir)
        .replace("{{runtime.workdir}}", &runtime.workdir);

    params_re()
        .replace_all(&token, |captures: &regex::Captures| {
            params
                .get(&captures[1])
                .and_then(|values| values.first())
                .cloned()
                .unwrap_or_default()
        })
        .into_owned()
}
