//! Command-line front end for the launcher core.
//!
//! `tooldock scan <tools-root>` prints the discovered tools as JSON.
//! `tooldock run <tools-root> <tool-id> [--param k=v]... [--run-dir D]
//! [--program P] [--no-env]` runs one tool, streaming events as JSON
//! lines, and exits with the tool's exit code.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use tracing_subscriber::EnvFilter;

use tooldock::bus::CoreEvent;
use tooldock::manifest::{RunParamValue, RunRequest, ToolDefinition};
use tooldock::runtime::CoreService;
use tooldock::scanner;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tooldock=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match args.first().map(String::as_str) {
        Some("scan") => match args.get(1) {
            Some(root) => cmd_scan(Path::new(root)),
            None => usage(),
        },
        Some("run") => match (args.get(1), args.get(2)) {
            (Some(root), Some(tool_id)) => {
                match parse_run_flags(tool_id.clone(), &args[3..]) {
                    Ok((request, prepare_env)) => {
                        runtime.block_on(cmd_run(PathBuf::from(root), request, prepare_env))
                    }
                    Err(message) => {
                        eprintln!("{message}");
                        ExitCode::FAILURE
                    }
                }
            }
            _ => usage(),
        },
        _ => usage(),
    }
}

fn usage() -> ExitCode {
    eprintln!("usage: tooldock scan <tools-root>");
    eprintln!(
        "       tooldock run <tools-root> <tool-id> [--param k=v]... \
         [--run-dir <dir>] [--program <path>] [--no-env]"
    );
    ExitCode::FAILURE
}

fn parse_run_flags(tool_id: String, flags: &[String]) -> Result<(RunRequest, bool), String> {
    let mut request = RunRequest {
        tool_id,
        ..RunRequest::default()
    };
    let mut prepare_env = true;

    let mut iter = flags.iter();
    while let Some(flag) = iter.next() {
        match flag.as_str() {
            "--param" => {
                let pair = iter
                    .next()
                    .ok_or_else(|| "--param requires a k=v argument".to_string())?;
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| format!("malformed --param (want k=v): {pair}"))?;
                push_param(&mut request.params, key, value);
            }
            "--run-dir" => {
                let dir = iter
                    .next()
                    .ok_or_else(|| "--run-dir requires a path".to_string())?;
                request.run_dir = Some(PathBuf::from(dir));
            }
            "--program" => {
                let program = iter
                    .next()
                    .ok_or_else(|| "--program requires a path".to_string())?;
                request.program = Some(program.clone());
            }
            "--no-env" => prepare_env = false,
            other => return Err(format!("unknown flag: {other}")),
        }
    }
    Ok((request, prepare_env))
}

fn push_param(params: &mut Vec<RunParamValue>, key: &str, value: &str) {
    if let Some(existing) = params.iter_mut().find(|p| p.key == key) {
        existing.values.push(value.to_string());
        return;
    }
    params.push(RunParamValue {
        key: key.to_string(),
        values: vec![value.to_string()],
    });
}

fn cmd_scan(tools_root: &Path) -> ExitCode {
    let result = scanner::scan(tools_root);
    match serde_json::to_string_pretty(&result) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            eprintln!("failed to encode scan result: {e}");
            return ExitCode::FAILURE;
        }
    }
    if result.ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn cmd_run(tools_root: PathBuf, request: RunRequest, prepare_env: bool) -> ExitCode {
    let tool = match find_tool(&tools_root, &request.tool_id) {
        Ok(tool) => tool,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::FAILURE;
        }
    };

    let service = CoreService::new();
    let mut rx = service.subscribe();
    if prepare_env {
        service.run_tool(&tools_root, tool, request);
    } else {
        service.run_job(&tools_root, tool, request, None);
    }

    loop {
        let envelope = match rx.recv().await {
            Ok(envelope) => envelope,
            Err(e) => {
                eprintln!("event stream ended: {e}");
                return ExitCode::FAILURE;
            }
        };
        if let Ok(json) = serde_json::to_string(&envelope) {
            println!("{json}");
        }
        match envelope.event {
            CoreEvent::EnvFailed { .. } => return ExitCode::FAILURE,
            CoreEvent::JobFinished { exit_code, .. } => {
                return if exit_code == 0 {
                    ExitCode::SUCCESS
                } else {
                    ExitCode::FAILURE
                };
            }
            _ => {}
        }
    }
}

fn find_tool(tools_root: &Path, tool_id: &str) -> Result<ToolDefinition, String> {
    let result = scanner::scan(tools_root);
    let ok = result.ok();
    if let Some(tool) = result.tools.into_iter().find(|t| t.id == tool_id) {
        return Ok(tool);
    }
    if ok {
        Err(format!("no such tool: {tool_id}"))
    } else {
        Err(format!("no such tool: {tool_id}\n{}", result.error))
    }
}
