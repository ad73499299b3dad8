//! Core service: background workers and the orchestrator loop.
//!
//! Each concern runs on its own tokio task with a dedicated command
//! channel. The orchestrator is the only writer of cross-worker state
//! (the pending-job map) and the only publisher of worker events onto
//! the bus, so subscribers observe one globally ordered stream:
//! env-preparing precedes env-ready, which precedes job-started, for
//! any given run.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use crate::bus::{CoreEvent, EventBus, EventEnvelope};
use crate::envprep;
use crate::manifest::{RunRequest, ScanResult, ToolDefinition};
use crate::runner::JobRunner;
use crate::scanner;

/// Requests accepted by the service façade.
enum Command {
    Scan {
        tools_root: PathBuf,
    },
    RunTool {
        tools_root: PathBuf,
        tool: ToolDefinition,
        request: RunRequest,
    },
    RunJob {
        tools_root: PathBuf,
        tool: ToolDefinition,
        request: RunRequest,
        env_path: Option<PathBuf>,
    },
    Cancel,
}

enum ScanCommand {
    Scan { tools_root: PathBuf },
}

enum EnvCommand {
    Prepare {
        tools_root: PathBuf,
        tool: ToolDefinition,
    },
}

enum JobCommand {
    Run {
        tools_root: PathBuf,
        tool: ToolDefinition,
        request: RunRequest,
        env_path: Option<PathBuf>,
    },
    Cancel,
}

/// A run waiting on environment preparation, keyed by tool id. A
/// re-request for the same tool before its environment resolves
/// replaces the earlier entry.
struct PendingJob {
    tools_root: PathBuf,
    tool: ToolDefinition,
    request: RunRequest,
}

/// Cloneable handle to the launcher core. All methods enqueue work and
/// return immediately; results arrive on the event bus.
#[derive(Clone)]
pub struct CoreService {
    cmd_tx: mpsc::UnboundedSender<Command>,
    bus: Arc<EventBus>,
}

impl CoreService {
    pub fn new() -> Self {
        Self::with_bus(Arc::new(EventBus::new()))
    }

    /// Spawn the workers and the orchestrator onto the current tokio
    /// runtime, publishing onto `bus`.
    pub fn with_bus(bus: Arc<EventBus>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (evt_tx, evt_rx) = mpsc::unbounded_channel();

        let (scan_tx, scan_rx) = mpsc::unbounded_channel();
        tokio::spawn(scan_worker(scan_rx, evt_tx.clone()));

        let (env_tx, env_rx) = mpsc::unbounded_channel();
        tokio::spawn(env_worker(env_rx, evt_tx.clone()));

        let (job_tx, job_rx) = mpsc::unbounded_channel();
        tokio::spawn(job_worker(job_rx, evt_tx));

        tokio::spawn(orchestrate(
            cmd_rx,
            evt_rx,
            scan_tx,
            env_tx,
            job_tx,
            bus.clone(),
        ));

        Self { cmd_tx, bus }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.bus.subscribe()
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    /// Discover tools under `tools_root`; answers with `ScanFinished`.
    pub fn scan(&self, tools_root: impl Into<PathBuf>) {
        self.send(Command::Scan {
            tools_root: tools_root.into(),
        });
    }

    /// Full pipeline: prepare the tool's environment, then launch it.
    pub fn run_tool(
        &self,
        tools_root: impl Into<PathBuf>,
        tool: ToolDefinition,
        request: RunRequest,
    ) {
        self.send(Command::RunTool {
            tools_root: tools_root.into(),
            tool,
            request,
        });
    }

    /// Launch directly against an already-prepared (or absent)
    /// environment, skipping preparation.
    pub fn run_job(
        &self,
        tools_root: impl Into<PathBuf>,
        tool: ToolDefinition,
        request: RunRequest,
        env_path: Option<PathBuf>,
    ) {
        self.send(Command::RunJob {
            tools_root: tools_root.into(),
            tool,
            request,
            env_path,
        });
    }

    /// Request graceful termination of the active job, if any.
    pub fn cancel(&self) {
        self.send(Command::Cancel);
    }

    fn send(&self, command: Command) {
        if self.cmd_tx.send(command).is_err() {
            tracing::error!("core service command loop is gone");
        }
    }
}

impl Default for CoreService {
    fn default() -> Self {
        Self::new()
    }
}

async fn scan_worker(
    mut rx: mpsc::UnboundedReceiver<ScanCommand>,
    events: mpsc::UnboundedSender<CoreEvent>,
) {
    while let Some(ScanCommand::Scan { tools_root }) = rx.recv().await {
        let result = match tokio::task::spawn_blocking(move || scanner::scan(&tools_root)).await {
            Ok(result) => result,
            Err(e) => ScanResult {
                tools: Vec::new(),
                error: format!("scan task failed: {e}"),
            },
        };
        let _ = events.send(CoreEvent::ScanFinished { result });
    }
}

async fn env_worker(
    mut rx: mpsc::UnboundedReceiver<EnvCommand>,
    events: mpsc::UnboundedSender<CoreEvent>,
) {
    while let Some(EnvCommand::Prepare { tools_root, tool }) = rx.recv().await {
        let event = match envprep::prepare(&tools_root, &tool).await {
            Ok(env_path) => CoreEvent::EnvReady {
                tool_id: tool.id.clone(),
                env_path: env_path.display().to_string(),
            },
            Err(e) => {
                tracing::warn!(tool = %tool.id, "environment preparation failed: {e}");
                CoreEvent::EnvFailed {
                    tool_id: tool.id.clone(),
                    message: e.to_string(),
                }
            }
        };
        let _ = events.send(event);
    }
}

async fn job_worker(
    mut rx: mpsc::UnboundedReceiver<JobCommand>,
    events: mpsc::UnboundedSender<CoreEvent>,
) {
    let mut runner = JobRunner::new(events);
    while let Some(command) = rx.recv().await {
        match command {
            JobCommand::Run {
                tools_root,
                tool,
                request,
                env_path,
            } => {
                runner
                    .run(&tools_root, &tool, &request, env_path.as_deref())
                    .await;
            }
            JobCommand::Cancel => runner.cancel(),
        }
    }
}

/// Single-writer loop: routes façade commands to workers, chains
/// env-ready into a job launch, and republishes every worker event on
/// the bus in arrival order.
async fn orchestrate(
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    mut evt_rx: mpsc::UnboundedReceiver<CoreEvent>,
    scan_tx: mpsc::UnboundedSender<ScanCommand>,
    env_tx: mpsc::UnboundedSender<EnvCommand>,
    job_tx: mpsc::UnboundedSender<JobCommand>,
    bus: Arc<EventBus>,
) {
    let mut pending: HashMap<String, PendingJob> = HashMap::new();

    loop {
        tokio::select! {
            command = cmd_rx.recv() => {
                let Some(command) = command else { break };
                match command {
                    Command::Scan { tools_root } => {
                        let _ = scan_tx.send(ScanCommand::Scan { tools_root });
                    }
                    Command::RunTool { tools_root, tool, request } => {
                        bus.publish(CoreEvent::EnvPreparing {
                            tool_id: tool.id.clone(),
                        });
                        pending.insert(
                            tool.id.clone(),
                            PendingJob {
                                tools_root: tools_root.clone(),
                                tool: tool.clone(),
                                request,
                            },
                        );
                        let _ = env_tx.send(EnvCommand::Prepare { tools_root, tool });
                    }
                    Command::RunJob { tools_root, tool, request, env_path } => {
                        let _ = job_tx.send(JobCommand::Run {
                            tools_root,
                            tool,
                            request,
                            env_path,
                        });
                    }
                    Command::Cancel => {
                        let _ = job_tx.send(JobCommand::Cancel);
                    }
                }
            }
            event = evt_rx.recv() => {
                let Some(event) = event else { break };
                match &event {
                    CoreEvent::EnvReady { tool_id, env_path } => {
                        if let Some(job) = pending.remove(tool_id) {
                            // Publish env-ready before dispatching so
                            // job-started can never precede it.
                            let env_path = (!env_path.is_empty())
                                .then(|| PathBuf::from(env_path));
                            bus.publish(event.clone());
                            let _ = job_tx.send(JobCommand::Run {
                                tools_root: job.tools_root,
                                tool: job.tool,
                                request: job.request,
                                env_path,
                            });
                            continue;
                        }
                    }
                    CoreEvent::EnvFailed { tool_id, .. } => {
                        pending.remove(tool_id);
                    }
                    _ => {}
                }
                bus.publish(event);
            }
        }
    }
}
