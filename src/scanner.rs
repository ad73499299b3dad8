//! Tools-root directory scan.

use std::path::Path;

use crate::manifest::{parse_tool, ScanResult, MANIFEST_FILE};

/// Walk the immediate subdirectories of `tools_root` and parse each
/// one's manifest.
///
/// Only a nonexistent root fails the whole scan. Directories without a
/// manifest are silently skipped so non-tool directories (e.g. `runs/`)
/// can live under the root; per-tool parse errors are collected into
/// `ScanResult::error` without aborting the rest of the walk. Ordering
/// follows directory enumeration; callers wanting stable display order
/// sort themselves.
pub fn scan(tools_root: &Path) -> ScanResult {
    let mut result = ScanResult::default();

    let entries = match std::fs::read_dir(tools_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            result.error = format!("tools root does not exist: {}", tools_root.display());
            return result;
        }
        Err(e) => {
            result.error = format!("failed to read tools root {}: {e}", tools_root.display());
            return result;
        }
    };

    for entry in entries.flatten() {
        let tool_dir = entry.path();
        if !tool_dir.is_dir() {
            continue;
        }
        if !tool_dir.join(MANIFEST_FILE).is_file() {
            continue;
        }

        let (tool, error) = parse_tool(&tool_dir);
        if let Some(error) = error {
            if !result.error.is_empty() {
                result.error.push('\n');
            }
            result.error.push_str(&error);
            continue;
        }
        if tool.id.is_empty() {
            continue;
        }
        result.tools.push(tool);
    }

    tracing::debug!(
        root = %tools_root.display(),
        tools = result.tools.len(),
        ok = result.ok(),
        "scan finished"
    );
    result
}
