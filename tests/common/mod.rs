//! Helpers shared by the integration tests.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::timeout;

use tooldock::bus::{CoreEvent, EventEnvelope};
use tooldock::manifest::MANIFEST_FILE;

/// Create a tool directory with the given manifest and an executable
/// `run.sh` whose body is `script`.
pub fn write_tool(root: &Path, id: &str, manifest: &str, script: &str) -> PathBuf {
    let tool_dir = root.join(id);
    std::fs::create_dir_all(&tool_dir).expect("tool dir");
    std::fs::write(tool_dir.join(MANIFEST_FILE), manifest).expect("manifest");

    let script_path = tool_dir.join("run.sh");
    std::fs::write(&script_path, format!("#!/bin/sh\n{script}")).expect("script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755))
            .expect("script permissions");
    }
    tool_dir
}

/// Receive the next bus event, failing the test after `secs` seconds.
pub async fn next_event(rx: &mut broadcast::Receiver<EventEnvelope>, secs: u64) -> CoreEvent {
    timeout(Duration::from_secs(secs), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event bus closed")
        .event
}

/// Drain events until a `JobFinished` arrives, returning the collected
/// output lines and the terminal (exit_code, message).
pub async fn drain_until_finished(
    rx: &mut broadcast::Receiver<EventEnvelope>,
    secs: u64,
) -> (Vec<String>, i32, String) {
    let mut lines = Vec::new();
    loop {
        match next_event(rx, secs).await {
            CoreEvent::JobOutput { line, .. } => lines.push(line),
            CoreEvent::JobFinished {
                exit_code, message, ..
            } => return (lines, exit_code, message),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
