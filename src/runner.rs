//! Subprocess lifecycle for one tool run.
//!
//! A job moves Idle → Starting → Running → Finished, or Starting →
//! FailedToStart. The runner owns at most one active child at a time; a
//! run requested while one is active is refused immediately with a
//! finished event (exit code -1) instead of being queued. Exactly one
//! finished event fires per run: the normal-exit, watchdog and error
//! paths all funnel through an atomic compare-and-set terminal flag.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::bus::CoreEvent;
use crate::manifest::{RunRequest, RuntimeKind, ToolDefinition};
use crate::template;

const READ_CHUNK_BYTES: usize = 8192;

pub(crate) struct JobRunner {
    events: mpsc::UnboundedSender<CoreEvent>,
    active: Option<ActiveJob>,
}

struct ActiveJob {
    tool_id: String,
    pid: Option<u32>,
    finished: Arc<AtomicBool>,
}

impl JobRunner {
    pub fn new(events: mpsc::UnboundedSender<CoreEvent>) -> Self {
        Self {
            events,
            active: None,
        }
    }

    fn is_busy(&self) -> bool {
        self.active
            .as_ref()
            .map(|job| !job.finished.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Launch `tool` as a child process. Returns once the child is
    /// spawned (or refused); streaming and termination are handled by
    /// background tasks reporting through the event channel.
    pub async fn run(
        &mut self,
        tools_root: &Path,
        tool: &ToolDefinition,
        request: &RunRequest,
        env_path: Option<&Path>,
    ) {
        if self.is_busy() {
            self.send(CoreEvent::JobFinished {
                tool_id: tool.id.clone(),
                exit_code: -1,
                message: "a job is already running".into(),
            });
            return;
        }

        let run_dir = match ensure_run_dir(tools_root, tool, request) {
            Ok(dir) => dir,
            Err(e) => {
                self.send(CoreEvent::JobFinished {
                    tool_id: tool.id.clone(),
                    exit_code: -1,
                    message: format!("failed to prepare run directory: {e}"),
                });
                return;
            }
        };
        let output_dir = run_dir.join("outputs");
        let tool_dir = tools_root.join(&tool.id);

        let params = template::param_map(&request.params);
        let templated = template::expand_args(
            &tool.runtime.args,
            &params,
            &run_dir.display().to_string(),
            &output_dir.display().to_string(),
            &tool_dir.display().to_string(),
            &tool.runtime,
        );

        let invocation = resolve_invocation(tool, request, &tool_dir, env_path, templated);
        let (program, args) = if tool.runtime.shell_wrap {
            wrap_in_shell(invocation.program, invocation.args)
        } else {
            (invocation.program, invocation.args)
        };

        let mut command = Command::new(&program);
        command
            .args(&args)
            .current_dir(&run_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Host interpreter state must not leak into the child.
            .env_remove("PYTHONHOME")
            .env_remove("PYTHONPATH")
            .env("TOOL_OUTPUT_DIR", &output_dir)
            .env("TOOL_ROOT", &tool_dir)
            .env("TOOL_RUN_DIR", &run_dir);
        for (key, value) in invocation.env {
            command.env(key, value);
        }
        // Tool-declared variables layer last and may override the fixed
        // ones.
        for (key, value) in &tool.runtime.extra_env {
            command.env(key, value);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.send(CoreEvent::JobFinished {
                    tool_id: tool.id.clone(),
                    exit_code: -1,
                    message: format!("failed to start: {e}"),
                });
                return;
            }
        };

        self.send(CoreEvent::JobStarted {
            tool_id: tool.id.clone(),
            run_dir: run_dir.display().to_string(),
        });
        tracing::info!(
            tool = %tool.id,
            program = %program,
            ?args,
            run_dir = %run_dir.display(),
            "job started"
        );

        let finished = Arc::new(AtomicBool::new(false));
        self.active = Some(ActiveJob {
            tool_id: tool.id.clone(),
            pid: child.id(),
            finished: finished.clone(),
        });

        let stdout_task = child.stdout.take().map(|stream| {
            tokio::spawn(stream_output(
                stream,
                run_dir.join("logs").join("stdout.log"),
                tool.id.clone(),
                false,
                self.events.clone(),
            ))
        });
        let stderr_task = child.stderr.take().map(|stream| {
            tokio::spawn(stream_output(
                stream,
                run_dir.join("logs").join("stderr.log"),
                tool.id.clone(),
                true,
                self.events.clone(),
            ))
        });

        tokio::spawn(monitor_child(
            child,
            stdout_task,
            stderr_task,
            tool.id.clone(),
            tool.runtime.timeout_secs,
            finished,
            self.events.clone(),
        ));
    }

    /// Ask the active child, if any, to terminate gracefully. No
    /// force-kill, no synthesized finished event: the normal
    /// termination path reports once the child actually exits.
    pub fn cancel(&self) {
        let Some(job) = &self.active else {
            return;
        };
        if job.finished.load(Ordering::SeqCst) {
            return;
        }
        if let Some(pid) = job.pid {
            request_terminate(pid);
            tracing::info!(tool = %job.tool_id, pid, "termination requested");
        }
    }

    fn send(&self, event: CoreEvent) {
        let _ = self.events.send(event);
    }
}

struct Invocation {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

fn resolve_invocation(
    tool: &ToolDefinition,
    request: &RunRequest,
    tool_dir: &Path,
    env_path: Option<&Path>,
    templated: Vec<String>,
) -> Invocation {
    let entry_path = tool_dir.join(&tool.runtime.entry).display().to_string();
    let override_program = request
        .program
        .as_deref()
        .filter(|p| !p.trim().is_empty())
        .map(str::to_string);
    let interpreter = (!tool.env.interpreter.is_empty()).then(|| tool.env.interpreter.clone());

    match tool.runtime.kind {
        RuntimeKind::Python => {
            let program = override_program
                .or(interpreter)
                .or_else(|| env_path.map(python_from_env))
                .unwrap_or_else(|| "python".to_string());

            let mut args = vec![entry_path];
            args.extend(templated);

            let mut env = Vec::new();
            if let Some(env_path) = env_path {
                let bin_dir = env_bin_dir(env_path);
                let host_path = std::env::var("PATH").unwrap_or_default();
                env.push((
                    "PATH".to_string(),
                    format!("{}{}{}", bin_dir.display(), PATH_SEPARATOR, host_path),
                ));
                env.push(("VIRTUAL_ENV".to_string(), env_path.display().to_string()));
            }

            Invocation { program, args, env }
        }
        RuntimeKind::R => {
            let program = override_program
                .or(interpreter)
                .unwrap_or_else(|| "Rscript".to_string());

            let mut args = vec![entry_path];
            args.extend(templated);

            let mut env = Vec::new();
            if let Some(env_path) = env_path {
                env.push(("R_LIBS_USER".to_string(), env_path.display().to_string()));
            }

            Invocation { program, args, env }
        }
        RuntimeKind::Generic => Invocation {
            program: override_program.unwrap_or(entry_path),
            args: templated,
            env: Vec::new(),
        },
    }
}

#[cfg(target_os = "windows")]
const PATH_SEPARATOR: char = ';';
#[cfg(not(target_os = "windows"))]
const PATH_SEPARATOR: char = ':';

fn env_bin_dir(env_path: &Path) -> PathBuf {
    #[cfg(target_os = "windows")]
    return env_path.join("Scripts");
    #[cfg(not(target_os = "windows"))]
    return env_path.join("bin");
}

fn python_from_env(env_path: &Path) -> String {
    #[cfg(target_os = "windows")]
    return env_path.join("Scripts").join("python.exe").display().to_string();
    #[cfg(not(target_os = "windows"))]
    return env_path.join("bin").join("python").display().to_string();
}

fn quote_arg(arg: &str) -> String {
    #[cfg(target_os = "windows")]
    {
        let escaped = arg.replace('"', "\\\"");
        if escaped.contains(' ') {
            format!("\"{escaped}\"")
        } else {
            escaped
        }
    }
    #[cfg(not(target_os = "windows"))]
    {
        if arg
            .chars()
            .any(|c| c.is_whitespace() || c == '"' || c == '\'')
            || arg.is_empty()
        {
            format!("'{}'", arg.replace('\'', "'\"'\"'"))
        } else {
            arg.to_string()
        }
    }
}

fn wrap_in_shell(program: String, args: Vec<String>) -> (String, Vec<String>) {
    let line = std::iter::once(&program)
        .chain(args.iter())
        .map(|a| quote_arg(a))
        .collect::<Vec<_>>()
        .join(" ");

    #[cfg(target_os = "windows")]
    return ("cmd.exe".to_string(), vec!["/C".to_string(), line]);
    #[cfg(not(target_os = "windows"))]
    return ("sh".to_string(), vec!["-c".to_string(), line]);
}

/// Resolve the run directory and make sure `logs/` and `outputs/`
/// exist before the process spawns.
fn ensure_run_dir(
    tools_root: &Path,
    tool: &ToolDefinition,
    request: &RunRequest,
) -> std::io::Result<PathBuf> {
    let run_dir = match &request.run_dir {
        Some(dir) if !dir.as_os_str().is_empty() => dir.clone(),
        _ => {
            let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
            tools_root
                .join("runs")
                .join(format!("{timestamp}_{}", tool.id))
        }
    };

    std::fs::create_dir_all(run_dir.join("logs"))?;
    std::fs::create_dir_all(run_dir.join("outputs"))?;
    Ok(run_dir)
}

/// Tee one child stream: raw bytes go to the log file verbatim,
/// newline-delimited trimmed lines become tagged output events. A
/// trailing fragment without a newline is emitted once the stream ends.
async fn stream_output(
    mut stream: impl AsyncRead + Unpin,
    log_path: PathBuf,
    tool_id: String,
    is_error: bool,
    events: mpsc::UnboundedSender<CoreEvent>,
) {
    let mut log_file = match tokio::fs::File::create(&log_path).await {
        Ok(file) => Some(file),
        Err(e) => {
            tracing::warn!(path = %log_path.display(), "failed to open log file: {e}");
            None
        }
    };

    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    let mut carry = String::new();
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        if let Some(file) = log_file.as_mut() {
            let _ = file.write_all(&buf[..n]).await;
        }
        carry.push_str(&String::from_utf8_lossy(&buf[..n]));
        while let Some(pos) = carry.find('\n') {
            let line: String = carry.drain(..=pos).collect();
            emit_line(&events, &tool_id, &line, is_error);
        }
    }

    if let Some(file) = log_file.as_mut() {
        let _ = file.flush().await;
    }
    emit_line(&events, &tool_id, &carry, is_error);
}

fn emit_line(
    events: &mpsc::UnboundedSender<CoreEvent>,
    tool_id: &str,
    raw: &str,
    is_error: bool,
) {
    let line = raw.trim();
    if line.is_empty() {
        return;
    }
    let _ = events.send(CoreEvent::JobOutput {
        tool_id: tool_id.to_string(),
        line: line.to_string(),
        is_error,
    });
}

/// Wait for the child, drain the stream tasks so every output event
/// precedes the finished event, then report the terminal outcome
/// exactly once.
async fn monitor_child(
    mut child: Child,
    stdout_task: Option<JoinHandle<()>>,
    stderr_task: Option<JoinHandle<()>>,
    tool_id: String,
    timeout_secs: u64,
    finished: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<CoreEvent>,
) {
    let mut timed_out = false;
    let status = if timeout_secs > 0 {
        match timeout(Duration::from_secs(timeout_secs), child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                timed_out = true;
                let _ = child.start_kill();
                child.wait().await
            }
        }
    } else {
        child.wait().await
    };

    if let Some(task) = stdout_task {
        let _ = task.await;
    }
    if let Some(task) = stderr_task {
        let _ = task.await;
    }

    if finished
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return;
    }

    let (exit_code, message) = if timed_out {
        (-1, format!("timed out after {timeout_secs}s"))
    } else {
        match status {
            Ok(status) => match status.code() {
                Some(code) => (code, format!("exit {code}")),
                None => (-1, "crashed".to_string()),
            },
            Err(e) => (-1, format!("process error: {e}")),
        }
    };

    tracing::info!(tool = %tool_id, exit_code, %message, "job finished");
    let _ = events.send(CoreEvent::JobFinished {
        tool_id,
        exit_code,
        message,
    });
}

/// Graceful termination request, SIGTERM-style. Windows has no direct
/// equivalent; `taskkill` without `/F` asks politely.
fn request_terminate(pid: u32) {
    #[cfg(target_os = "windows")]
    let _ = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T"])
        .spawn();
    #[cfg(not(target_os = "windows"))]
    let _ = std::process::Command::new("kill")
        .args(["-TERM", &pid.to_string()])
        .spawn();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{EnvConfig, RuntimeConfig};

    fn tool(kind: RuntimeKind, entry: &str) -> ToolDefinition {
        ToolDefinition {
            id: "demo".into(),
            runtime: RuntimeConfig {
                kind,
                entry: entry.into(),
                ..RuntimeConfig::default()
            },
            ..ToolDefinition::default()
        }
    }

    #[test]
    fn generic_runtime_runs_the_entry_verbatim() {
        let invocation = resolve_invocation(
            &tool(RuntimeKind::Generic, "run.sh"),
            &RunRequest::default(),
            Path::new("/tools/demo"),
            None,
            vec!["--flag".into()],
        );
        assert_eq!(invocation.program, Path::new("/tools/demo").join("run.sh").display().to_string());
        assert_eq!(invocation.args, vec!["--flag"]);
        assert!(invocation.env.is_empty());
    }

    #[test]
    fn python_without_env_falls_back_to_bare_interpreter() {
        let invocation = resolve_invocation(
            &tool(RuntimeKind::Python, "main.py"),
            &RunRequest::default(),
            Path::new("/tools/demo"),
            None,
            vec![],
        );
        assert_eq!(invocation.program, "python");
        assert_eq!(invocation.args.len(), 1);
        assert!(invocation.args[0].ends_with("main.py"));
    }

    #[test]
    fn python_with_env_uses_its_interpreter_and_exports_markers() {
        let invocation = resolve_invocation(
            &tool(RuntimeKind::Python, "main.py"),
            &RunRequest::default(),
            Path::new("/tools/demo"),
            Some(Path::new("/tools/demo/.venv")),
            vec![],
        );
        assert!(invocation.program.contains(".venv"));
        let keys: Vec<&str> = invocation.env.iter().map(|(k, _)| k.as_str()).collect();
        assert!(keys.contains(&"PATH"));
        assert!(keys.contains(&"VIRTUAL_ENV"));
    }

    #[test]
    fn request_program_override_wins() {
        let mut tool = tool(RuntimeKind::Python, "main.py");
        tool.env = EnvConfig {
            interpreter: "/opt/python3".into(),
            ..EnvConfig::default()
        };
        let request = RunRequest {
            program: Some("/custom/python".into()),
            ..RunRequest::default()
        };
        let invocation =
            resolve_invocation(&tool, &request, Path::new("/tools/demo"), None, vec![]);
        assert_eq!(invocation.program, "/custom/python");
    }

    #[test]
    fn r_runtime_exports_library_path_when_env_set() {
        let invocation = resolve_invocation(
            &tool(RuntimeKind::R, "main.R"),
            &RunRequest::default(),
            Path::new("/tools/demo"),
            Some(Path::new("/tools/demo/.r-lib")),
            vec![],
        );
        assert_eq!(invocation.program, "Rscript");
        assert_eq!(
            invocation.env,
            vec![(
                "R_LIBS_USER".to_string(),
                Path::new("/tools/demo/.r-lib").display().to_string()
            )]
        );
    }

    #[cfg(unix)]
    #[test]
    fn shell_quoting_escapes_spaces_and_quotes() {
        assert_eq!(quote_arg("plain"), "plain");
        assert_eq!(quote_arg("two words"), "'two words'");
        assert_eq!(quote_arg("it's"), "'it'\"'\"'s'");
        assert_eq!(quote_arg(""), "''");
    }

    #[cfg(unix)]
    #[test]
    fn shell_wrap_joins_into_a_single_command_line() {
        let (program, args) = wrap_in_shell("echo".into(), vec!["hello world".into()]);
        assert_eq!(program, "sh");
        assert_eq!(args, vec!["-c".to_string(), "echo 'hello world'".to_string()]);
    }

    #[test]
    fn run_dir_override_is_respected() {
        let root = tempfile::tempdir().expect("temp dir");
        let wanted = root.path().join("custom-run");
        let request = RunRequest {
            run_dir: Some(wanted.clone()),
            ..RunRequest::default()
        };

        let run_dir =
            ensure_run_dir(root.path(), &tool(RuntimeKind::Generic, "x"), &request).expect("dir");
        assert_eq!(run_dir, wanted);
        assert!(wanted.join("logs").is_dir());
        assert!(wanted.join("outputs").is_dir());
    }

    #[test]
    fn synthesized_run_dir_lands_under_runs() {
        let root = tempfile::tempdir().expect("temp dir");
        let run_dir = ensure_run_dir(
            root.path(),
            &tool(RuntimeKind::Generic, "x"),
            &RunRequest::default(),
        )
        .expect("dir");

        assert!(run_dir.starts_with(root.path().join("runs")));
        let name = run_dir.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.ends_with("_demo"), "got: {name}");
        assert!(run_dir.join("logs").is_dir());
        assert!(run_dir.join("outputs").is_dir());
    }

    #[tokio::test]
    async fn second_run_while_active_is_rejected() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut runner = JobRunner::new(tx);
        runner.active = Some(ActiveJob {
            tool_id: "demo".into(),
            pid: None,
            finished: Arc::new(AtomicBool::new(false)),
        });

        let root = tempfile::tempdir().expect("temp dir");
        runner
            .run(
                root.path(),
                &tool(RuntimeKind::Generic, "run.sh"),
                &RunRequest::default(),
                None,
            )
            .await;

        match rx.recv().await.expect("event") {
            CoreEvent::JobFinished {
                exit_code, message, ..
            } => {
                assert_eq!(exit_code, -1);
                assert_eq!(message, "a job is already running");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        // Refusal must not touch the filesystem.
        assert!(!root.path().join("runs").exists());
    }

    #[tokio::test]
    async fn spawn_failure_reports_failed_to_start() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut runner = JobRunner::new(tx);
        let root = tempfile::tempdir().expect("temp dir");

        runner
            .run(
                root.path(),
                &tool(RuntimeKind::Generic, "does-not-exist-anywhere"),
                &RunRequest::default(),
                None,
            )
            .await;

        match rx.recv().await.expect("event") {
            CoreEvent::JobFinished {
                exit_code, message, ..
            } => {
                assert_eq!(exit_code, -1);
                assert!(message.starts_with("failed to start:"), "got: {message}");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_output_tees_bytes_and_emits_trimmed_lines() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dir = tempfile::tempdir().expect("temp dir");
        let log_path = dir.path().join("stdout.log");

        let data: &[u8] = b"first line\nsecond line\ntrailing fragment";
        stream_output(data, log_path.clone(), "demo".into(), false, tx).await;

        let logged = std::fs::read(&log_path).expect("log file");
        assert_eq!(logged, data);

        let mut lines = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                CoreEvent::JobOutput { line, is_error, .. } => {
                    assert!(!is_error);
                    lines.push(line);
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(lines, vec!["first line", "second line", "trailing fragment"]);
    }
}
