//! Environment preparation strategies.
//!
//! Before a tool runs, its declared strategy provisions an isolated
//! dependency set: a uv-managed virtualenv, a pak-managed R library
//! path, a custom setup command, or nothing. All external commands run
//! with a bounded timeout so a wedged package manager can never hang
//! the environment worker forever.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;

use crate::manifest::{RuntimeKind, SetupCommand, ToolDefinition};

/// Timeout for setup and install invocations.
const SETUP_TIMEOUT: Duration = Duration::from_secs(60);
/// Timeout for `--version` existence probes.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("{0} is not installed. Please install {0} first.")]
    MissingManager(&'static str),
    #[error("command timed out: {0}")]
    CommandTimeout(String),
    #[error("{0}")]
    CommandFailed(String),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// How to provision a tool's environment. Closed set: a new strategy
/// must be handled at every match site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvStrategy {
    /// uv-managed virtualenv under the tool's cache dir.
    Uv,
    /// pak-managed R library path under the tool's cache dir.
    Pak,
    /// Tool-declared setup command decides success.
    Custom,
    /// Nothing to provision.
    None,
}

/// Explicit `env.strategy` wins; an empty one is inferred from the
/// runtime kind. An unrecognized name behaves like `Custom` but logs a
/// warning, since it is usually a typo.
pub fn resolve_strategy(tool: &ToolDefinition) -> EnvStrategy {
    match tool.env.strategy.trim().to_ascii_lowercase().as_str() {
        "uv" => EnvStrategy::Uv,
        "pak" => EnvStrategy::Pak,
        "custom" => EnvStrategy::Custom,
        "none" => EnvStrategy::None,
        "" => match tool.runtime.kind {
            RuntimeKind::Python => EnvStrategy::Uv,
            RuntimeKind::R => EnvStrategy::Pak,
            RuntimeKind::Generic => EnvStrategy::None,
        },
        other => {
            tracing::warn!(
                tool = %tool.id,
                strategy = other,
                "unrecognized env strategy, treating as custom"
            );
            EnvStrategy::Custom
        }
    }
}

/// Prepare the execution environment for `tool`, returning the resolved
/// environment path (empty for strategies that provision none).
///
/// Idempotent where the strategy allows it: an existing virtualenv is
/// reused, an existing library dir is kept. May create directories and
/// invoke package managers that touch the network.
pub async fn prepare(tools_root: &Path, tool: &ToolDefinition) -> Result<PathBuf, EnvError> {
    let tool_dir = tools_root.join(&tool.id);
    let strategy = resolve_strategy(tool);

    let env_path = match strategy {
        EnvStrategy::Uv => prepare_uv(&tool_dir, tool).await?,
        EnvStrategy::Pak => prepare_pak(&tool_dir, tool).await?,
        EnvStrategy::Custom | EnvStrategy::None => {
            if tool.env.cache_dir.is_empty() {
                PathBuf::new()
            } else {
                tool_dir.join(&tool.env.cache_dir)
            }
        }
    };

    run_setup_command(&tool_dir, tool).await?;

    tracing::info!(
        tool = %tool.id,
        strategy = ?strategy,
        env_path = %env_path.display(),
        "environment ready"
    );
    Ok(env_path)
}

async fn prepare_uv(tool_dir: &Path, tool: &ToolDefinition) -> Result<PathBuf, EnvError> {
    let cache_dir = if tool.env.cache_dir.is_empty() {
        ".venv"
    } else {
        tool.env.cache_dir.as_str()
    };
    let env_path = tool_dir.join(cache_dir);

    if !command_exists("uv").await {
        return Err(EnvError::MissingManager("uv"));
    }

    if !env_path.is_dir() {
        run_command(
            "uv",
            vec!["venv".into(), env_path.display().to_string()],
            Some(tool_dir),
            SETUP_TIMEOUT,
        )
        .await?;
    }

    if !tool.env.dependencies.is_empty() {
        let mut args = vec!["pip".to_string(), "install".to_string()];
        args.extend(tool.env.dependencies.iter().cloned());
        run_command("uv", args, Some(tool_dir), SETUP_TIMEOUT).await?;
    }

    Ok(env_path)
}

async fn prepare_pak(tool_dir: &Path, tool: &ToolDefinition) -> Result<PathBuf, EnvError> {
    let cache_dir = if tool.env.cache_dir.is_empty() {
        ".r-lib"
    } else {
        tool.env.cache_dir.as_str()
    };
    let env_path = tool_dir.join(cache_dir);

    if !command_exists("Rscript").await {
        return Err(EnvError::MissingManager("Rscript"));
    }

    std::fs::create_dir_all(&env_path)?;

    if !tool.env.dependencies.is_empty() {
        let script = pak_install_expression(&tool.env.dependencies, &env_path);
        run_command(
            "Rscript",
            vec!["-e".into(), script],
            Some(tool_dir),
            SETUP_TIMEOUT,
        )
        .await?;
    }

    Ok(env_path)
}

fn pak_install_expression(dependencies: &[String], lib_path: &Path) -> String {
    let quoted: Vec<String> = dependencies.iter().map(|d| format!("\"{d}\"")).collect();
    let lib = lib_path.display().to_string().replace('\\', "/");
    format!(
        "if(!requireNamespace('pak', quietly=TRUE)) install.packages('pak'); \
         pak::pkg_install(c({}), lib='{}')",
        quoted.join(","),
        lib
    )
}

async fn run_setup_command(tool_dir: &Path, tool: &ToolDefinition) -> Result<(), EnvError> {
    let Some(setup) = &tool.env.setup else {
        return Ok(());
    };
    if setup.command.trim().is_empty() {
        return Ok(());
    }

    let workdir = if setup.workdir.is_empty() {
        tool_dir.to_path_buf()
    } else {
        tool_dir.join(&setup.workdir)
    };

    let (program, args) = setup_invocation(setup);
    run_command(&program, args, Some(&workdir), SETUP_TIMEOUT).await
}

fn setup_invocation(setup: &SetupCommand) -> (String, Vec<String>) {
    if setup.shell {
        #[cfg(target_os = "windows")]
        return ("cmd.exe".into(), vec!["/C".into(), setup.command.clone()]);
        #[cfg(not(target_os = "windows"))]
        return ("sh".into(), vec!["-c".into(), setup.command.clone()]);
    }

    let mut parts = setup.command.split_whitespace().map(str::to_string);
    let program = parts.next().unwrap_or_default();
    (program, parts.collect())
}

/// Lightweight existence probe: `<program> --version` with a short
/// timeout.
async fn command_exists(program: &str) -> bool {
    run_command(program, vec!["--version".into()], None, PROBE_TIMEOUT)
        .await
        .is_ok()
}

async fn run_command(
    program: &str,
    args: Vec<String>,
    workdir: Option<&Path>,
    limit: Duration,
) -> Result<(), EnvError> {
    let mut command = Command::new(program);
    command.args(&args).kill_on_drop(true);
    if let Some(workdir) = workdir {
        command.current_dir(workdir);
    }

    let described = format!("{program} {}", args.join(" "));
    let output = match timeout(limit, command.output()).await {
        Err(_) => return Err(EnvError::CommandTimeout(described)),
        Ok(Err(e)) => return Err(EnvError::Io(e)),
        Ok(Ok(output)) => output,
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let message = if !stderr.is_empty() {
            stderr
        } else if !stdout.is_empty() {
            stdout
        } else {
            format!("command failed: {described}")
        };
        return Err(EnvError::CommandFailed(message));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{EnvConfig, RuntimeConfig, SetupCommand};

    fn tool_with(kind: RuntimeKind, strategy: &str) -> ToolDefinition {
        ToolDefinition {
            id: "demo".into(),
            runtime: RuntimeConfig {
                kind,
                entry: "run".into(),
                ..RuntimeConfig::default()
            },
            env: EnvConfig {
                strategy: strategy.into(),
                ..EnvConfig::default()
            },
            ..ToolDefinition::default()
        }
    }

    #[test]
    fn explicit_strategy_wins_over_runtime_kind() {
        let tool = tool_with(RuntimeKind::Python, "none");
        assert_eq!(resolve_strategy(&tool), EnvStrategy::None);
    }

    #[test]
    fn empty_strategy_infers_from_runtime_kind() {
        assert_eq!(
            resolve_strategy(&tool_with(RuntimeKind::Python, "")),
            EnvStrategy::Uv
        );
        assert_eq!(
            resolve_strategy(&tool_with(RuntimeKind::R, "")),
            EnvStrategy::Pak
        );
        assert_eq!(
            resolve_strategy(&tool_with(RuntimeKind::Generic, "")),
            EnvStrategy::None
        );
    }

    #[test]
    fn unrecognized_strategy_is_treated_as_custom() {
        let tool = tool_with(RuntimeKind::Generic, "uvv");
        assert_eq!(resolve_strategy(&tool), EnvStrategy::Custom);
    }

    #[tokio::test]
    async fn probe_fails_for_a_missing_program() {
        assert!(!command_exists("definitely-not-a-real-manager-7f3a").await);
    }

    #[tokio::test]
    async fn none_strategy_succeeds_with_empty_env_path() {
        let root = tempfile::tempdir().expect("temp dir");
        let tool = tool_with(RuntimeKind::Generic, "none");

        let env_path = prepare(root.path(), &tool).await.expect("prepare");
        assert_eq!(env_path, PathBuf::new());
    }

    #[tokio::test]
    async fn custom_strategy_reports_cache_dir_without_running_anything() {
        let root = tempfile::tempdir().expect("temp dir");
        let mut tool = tool_with(RuntimeKind::Generic, "custom");
        tool.env.cache_dir = ".cache".into();

        let env_path = prepare(root.path(), &tool).await.expect("prepare");
        assert_eq!(env_path, root.path().join("demo").join(".cache"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn custom_setup_command_failure_carries_its_stderr() {
        let root = tempfile::tempdir().expect("temp dir");
        std::fs::create_dir_all(root.path().join("demo")).expect("tool dir");
        let mut tool = tool_with(RuntimeKind::Generic, "custom");
        tool.env.setup = Some(SetupCommand {
            command: "echo setup exploded >&2; exit 3".into(),
            shell: true,
            workdir: String::new(),
        });

        let err = prepare(root.path(), &tool).await.expect_err("failure");
        match err {
            EnvError::CommandFailed(message) => {
                assert!(message.contains("setup exploded"), "got: {message}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn custom_setup_command_success_passes() {
        let root = tempfile::tempdir().expect("temp dir");
        std::fs::create_dir_all(root.path().join("demo")).expect("tool dir");
        let mut tool = tool_with(RuntimeKind::Generic, "custom");
        tool.env.setup = Some(SetupCommand {
            command: "true".into(),
            shell: false,
            workdir: String::new(),
        });

        prepare(root.path(), &tool).await.expect("prepare");
    }

    #[tokio::test]
    async fn existing_uv_env_with_no_deps_skips_install() {
        // Exercises the idempotent path when uv is present; a machine
        // without uv cannot run the managed-venv flow at all, so skip.
        if !command_exists("uv").await {
            return;
        }

        let root = tempfile::tempdir().expect("temp dir");
        let env_dir = root.path().join("demo").join(".venv");
        std::fs::create_dir_all(&env_dir).expect("env dir");
        let mut tool = tool_with(RuntimeKind::Python, "uv");
        tool.env.cache_dir = ".venv".into();

        let env_path = prepare(root.path(), &tool).await.expect("prepare");
        assert_eq!(env_path, env_dir);
    }

    #[test]
    fn pak_expression_embeds_dependencies_and_lib() {
        let deps = vec!["ggplot2".to_string(), "dplyr".to_string()];
        let expr = pak_install_expression(&deps, Path::new("/tools/demo/.r-lib"));
        assert!(expr.contains("c(\"ggplot2\",\"dplyr\")"), "got: {expr}");
        assert!(expr.contains("lib='/tools/demo/.r-lib'"), "got: {expr}");
    }

    #[test]
    fn missing_manager_message_is_actionable() {
        let message = EnvError::MissingManager("uv").to_string();
        assert!(message.contains("uv is not installed"), "got: {message}");
    }
}
