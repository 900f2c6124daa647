//! Collaborator bridge.
//!
//! Feature derivation and model scoring are external collaborators. The
//! [`Collaborator`] trait is the seam; [`BridgeCollaborator`] implements it by
//! spawning one long-lived subprocess per stage and exchanging JSON-lines
//! messages over stdin/stdout:
//!
//! ```text
//! bridge → {"type":"ready"}
//! host   → {"type":"run","id":"req-1","task":{"stage":"transform","unit":"<hash>","input_path":"…","output_path":"…"}}
//! bridge → {"type":"result","id":"req-1","result":{"output_path":"…"}}
//!        | {"type":"error","id":"req-1","error":"…"}
//! host   → {"type":"shutdown"}
//! ```
//!
//! Artifacts travel through scratch files, never inline. The transform bridge
//! writes the encoded feature artifact; the score bridge writes
//! `{"ids": [...], "probabilities": [[...], ...]}` which the score stage
//! packages into a prediction table.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ledgerflow_shared::{CollaboratorsConfig, LedgerflowError, Result, Stage};

/// How long a freshly spawned bridge has to announce itself.
const READY_TIMEOUT: Duration = Duration::from_secs(30);

/// External per-unit collaborator for the transform and score stages.
#[async_trait]
pub trait Collaborator: Send + Sync {
    /// Run `stage` on one unit's input bytes and return the output bytes.
    async fn invoke(&self, stage: Stage, unit: &str, input: &[u8]) -> Result<Vec<u8>>;
}

// ---------------------------------------------------------------------------
// Protocol types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
struct BridgeTask {
    stage: Stage,
    unit: String,
    input_path: String,
    output_path: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RequestMessage {
    Run { id: String, task: BridgeTask },
    Shutdown,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseMessage {
    Ready,
    Result { id: String, result: BridgeResult },
    Error { id: String, error: String },
}

#[derive(Debug, Default, Deserialize)]
struct BridgeResult {
    /// Where the bridge wrote its output; defaults to the suggested path.
    #[serde(default)]
    output_path: Option<String>,
}

// ---------------------------------------------------------------------------
// Bridge config
// ---------------------------------------------------------------------------

/// How to launch the bridge subprocesses.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Bridge command (e.g. `python3`).
    pub bridge_cmd: String,
    /// Script per stage, passed as the command's only argument.
    pub scripts: HashMap<Stage, String>,
    /// Working directory for the subprocesses.
    pub working_dir: PathBuf,
    /// Directory for input/output scratch files.
    pub scratch_dir: PathBuf,
}

impl From<&CollaboratorsConfig> for BridgeConfig {
    fn from(config: &CollaboratorsConfig) -> Self {
        Self {
            bridge_cmd: config.bridge_cmd.clone(),
            scripts: HashMap::from([
                (Stage::Transform, config.transform_script.clone()),
                (Stage::Score, config.score_script.clone()),
            ]),
            working_dir: PathBuf::from(&config.working_dir),
            scratch_dir: std::env::temp_dir().join("ledgerflow-bridge"),
        }
    }
}

// ---------------------------------------------------------------------------
// Bridge handle
// ---------------------------------------------------------------------------

/// Handle to one spawned bridge subprocess.
struct BridgeHandle {
    child: Child,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
    request_counter: u64,
}

impl BridgeHandle {
    async fn spawn(config: &BridgeConfig, stage: Stage) -> Result<Self> {
        let script = config.scripts.get(&stage).ok_or_else(|| {
            LedgerflowError::config(format!("no bridge script configured for {stage}"))
        })?;
        info!(cmd = %config.bridge_cmd, %script, %stage, "spawning collaborator bridge");

        let mut child = Command::new(&config.bridge_cmd)
            .arg(script)
            .current_dir(&config.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                LedgerflowError::config(format!(
                    "failed to spawn {stage} bridge: {e}. Is `{}` installed?",
                    config.bridge_cmd
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LedgerflowError::config("failed to capture bridge stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LedgerflowError::config("failed to capture bridge stdout"))?;

        let mut handle = Self {
            child,
            stdin,
            lines: BufReader::new(stdout).lines(),
            request_counter: 0,
        };
        handle.wait_for_ready().await?;
        Ok(handle)
    }

    async fn read_message(&mut self) -> std::result::Result<ResponseMessage, String> {
        let line = self
            .lines
            .next_line()
            .await
            .map_err(|e| format!("bridge read error: {e}"))?
            .ok_or_else(|| "bridge closed stdout unexpectedly".to_string())?;

        serde_json::from_str(line.trim()).map_err(|e| {
            let head: String = line.chars().take(200).collect();
            format!("invalid bridge message: {e} (got: {head})")
        })
    }

    async fn wait_for_ready(&mut self) -> Result<()> {
        let msg = tokio::time::timeout(READY_TIMEOUT, self.read_message())
            .await
            .map_err(|_| LedgerflowError::config("bridge did not become ready in time"))?
            .map_err(LedgerflowError::config)?;

        match msg {
            ResponseMessage::Ready => {
                debug!("bridge is ready");
                Ok(())
            }
            other => Err(LedgerflowError::config(format!(
                "expected ready message, got {other:?}"
            ))),
        }
    }

    async fn send_line(&mut self, msg: &RequestMessage) -> std::result::Result<(), String> {
        let json = serde_json::to_string(msg).map_err(|e| format!("failed to serialize request: {e}"))?;
        self.stdin
            .write_all(format!("{json}\n").as_bytes())
            .await
            .map_err(|e| format!("failed to write to bridge stdin: {e}"))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| format!("failed to flush bridge stdin: {e}"))
    }

    /// Send one task and wait for its response.
    async fn run(&mut self, task: BridgeTask) -> std::result::Result<BridgeResult, String> {
        self.request_counter += 1;
        let id = format!("req-{}", self.request_counter);
        self.send_line(&RequestMessage::Run {
            id: id.clone(),
            task,
        })
        .await?;

        match self.read_message().await? {
            ResponseMessage::Result { id: resp_id, result } if resp_id == id => Ok(result),
            ResponseMessage::Result { id: resp_id, .. } => {
                Err(format!("response id mismatch: sent {id}, got {resp_id}"))
            }
            ResponseMessage::Error { error, .. } => Err(error),
            ResponseMessage::Ready => Err("unexpected ready message during run".into()),
        }
    }

    async fn shutdown(mut self) {
        let _ = self.send_line(&RequestMessage::Shutdown).await;
        match tokio::time::timeout(Duration::from_secs(5), self.child.wait()).await {
            Ok(Ok(status)) => info!(?status, "bridge exited"),
            Ok(Err(e)) => warn!("bridge wait error: {e}"),
            Err(_) => {
                warn!("bridge did not exit after shutdown, killing");
                let _ = self.child.kill().await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// BridgeCollaborator
// ---------------------------------------------------------------------------

/// [`Collaborator`] backed by JSON-lines bridge subprocesses, spawned lazily.
pub struct BridgeCollaborator {
    config: BridgeConfig,
    handles: Mutex<HashMap<Stage, BridgeHandle>>,
}

impl BridgeCollaborator {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Ask every running bridge to exit.
    pub async fn shutdown(&self) {
        let handles: Vec<BridgeHandle> = self.handles.lock().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.shutdown().await;
        }
    }

    async fn run_task(&self, stage: Stage, task: BridgeTask) -> Result<BridgeResult> {
        let unit = task.unit.clone();
        let mut handles = self.handles.lock().await;

        if !handles.contains_key(&stage) {
            let handle = BridgeHandle::spawn(&self.config, stage).await?;
            handles.insert(stage, handle);
        }
        let Some(handle) = handles.get_mut(&stage) else {
            return Err(LedgerflowError::config(format!("{stage} bridge unavailable")));
        };

        match handle.run(task).await {
            Ok(result) => Ok(result),
            Err(message) => {
                // A dead bridge is respawned on the next unit.
                if let Ok(Some(status)) = handle.child.try_wait() {
                    warn!(?status, %stage, "bridge exited, dropping handle");
                    handles.remove(&stage);
                }
                Err(LedgerflowError::upstream(unit, message))
            }
        }
    }
}

#[async_trait]
impl Collaborator for BridgeCollaborator {
    async fn invoke(&self, stage: Stage, unit: &str, input: &[u8]) -> Result<Vec<u8>> {
        let scratch = &self.config.scratch_dir;
        tokio::fs::create_dir_all(scratch)
            .await
            .map_err(|e| LedgerflowError::io(scratch, e))?;

        let token = Uuid::now_v7();
        let input_path = scratch.join(format!("{token}.in"));
        let suggested_output = scratch.join(format!("{token}.out"));
        tokio::fs::write(&input_path, input)
            .await
            .map_err(|e| LedgerflowError::io(&input_path, e))?;

        let task = BridgeTask {
            stage,
            unit: unit.to_string(),
            input_path: input_path.display().to_string(),
            output_path: suggested_output.display().to_string(),
        };
        let result = self.run_task(stage, task).await;
        let _ = tokio::fs::remove_file(&input_path).await;

        let output_path = result?
            .output_path
            .map(PathBuf::from)
            .unwrap_or(suggested_output);
        let bytes = tokio::fs::read(&output_path).await.map_err(|e| {
            LedgerflowError::upstream(
                unit,
                format!("bridge output {} unreadable: {e}", output_path.display()),
            )
        })?;
        let _ = tokio::fs::remove_file(&output_path).await;
        Ok(bytes)
    }
}
