//! Shared helpers for unit tests.

use std::path::{Path, PathBuf};

use crate::manifest::MANIFEST_FILE;

/// Create a generic shell tool under `root/<id>` with a minimal
/// manifest and an executable `run.sh` containing `body`.
pub fn write_tool_script(root: &Path, id: &str, body: &str) -> PathBuf {
    let tool_dir = root.join(id);
    std::fs::create_dir_all(&tool_dir).expect("tool dir");
    std::fs::write(
        tool_dir.join(MANIFEST_FILE),
        "runtime:\n  type: generic\n  entry: run.sh\n",
    )
    .expect("manifest");

    let script = tool_dir.join("run.sh");
    std::fs::write(&script, format!("#!/bin/sh\n{body}")).expect("script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .expect("script permissions");
    }
    tool_dir
}
