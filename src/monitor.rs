use std::path::PathBuf;
use std::process::Stdio;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::control::normalize_id;
use crate::error::EngineError;
use crate::status::MachineStatus;

/// Buffer size for the parsed-event channel. Events are small and the
/// consumer applies them synchronously, so a short queue is plenty.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// One line of the control tool's event stream, as emitted.
#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "Timestamp")]
    #[allow(dead_code)]
    timestamp: String,
    #[serde(rename = "VM ID")]
    vm_id: String,
    #[serde(rename = "Event name")]
    event_name: String,
    #[serde(rename = "Additional info", default)]
    additional_info: Option<serde_json::Value>,
}

/// A decoded hypervisor lifecycle event, one variant per recognized
/// event kind plus a catch-all for everything else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// The machine changed lifecycle state on the hypervisor side.
    StateChanged {
        machine_id: String,
        state: MachineStatus,
    },
    /// A machine was registered; the full record must be fetched.
    Added { machine_id: String },
    /// A machine was unregistered and must leave the model.
    Unregistered { machine_id: String },
    /// The snapshot tree changed; the event carries no snapshot data,
    /// so the machine record is re-fetched to stay current.
    SnapshotsChanged { machine_id: String },
    /// Any event kind this engine does not recognize.
    Unknown { machine_id: String, name: String },
}

/// Parse one NDJSON line of the event stream.
///
/// Each line parses independently; an error here affects only this line,
/// never the stream.
pub(crate) fn parse_event_line(line: &str) -> Result<MonitorEvent, serde_json::Error> {
    let raw: RawEvent = serde_json::from_str(line)?;
    let machine_id = normalize_id(&raw.vm_id);

    let event = match raw.event_name.as_str() {
        "vm_state_changed" => MonitorEvent::StateChanged {
            machine_id,
            state: state_from_info(raw.additional_info.as_ref()),
        },
        "vm_added" => MonitorEvent::Added { machine_id },
        "vm_unregistered" => MonitorEvent::Unregistered { machine_id },
        "vm_snapshots_tree_changed" => MonitorEvent::SnapshotsChanged { machine_id },
        other => MonitorEvent::Unknown {
            machine_id,
            name: other.to_string(),
        },
    };
    Ok(event)
}

/// Pull the new state out of a `vm_state_changed` payload. A missing or
/// unrecognized state decodes to `Unknown` rather than failing.
fn state_from_info(info: Option<&serde_json::Value>) -> MachineStatus {
    info.and_then(|v| v.get("VM state").or_else(|| v.get("vm_state")))
        .and_then(|v| v.as_str())
        .map(MachineStatus::decode_token)
        .unwrap_or(MachineStatus::Unknown)
}

/// Supervises the single long-lived event stream subprocess.
///
/// Owned by the engine's composition root; there is no global handle.
/// At most one monitor process runs at a time: starting while one is
/// already running is a no-op. The monitor does not restart itself on
/// exit; that is its owner's call.
pub struct EventMonitor {
    tool: PathBuf,
    child: Option<Child>,
}

impl EventMonitor {
    pub fn new(tool: PathBuf) -> Self {
        Self { tool, child: None }
    }

    /// Whether the monitor subprocess is currently alive. An exited
    /// process clears the handle as a side effect.
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(None) => true,
                Ok(Some(status)) => {
                    info!(%status, "event monitor process exited");
                    self.child = None;
                    false
                }
                Err(e) => {
                    warn!(error = %e, "could not query event monitor process");
                    self.child = None;
                    false
                }
            },
            None => false,
        }
    }

    /// Spawn the event stream subprocess and return the channel of parsed
    /// events. Returns `Ok(None)` if a monitor is already running.
    ///
    /// Lines that fail to parse are logged and skipped; they never abort
    /// the stream.
    pub fn start(&mut self) -> Result<Option<mpsc::Receiver<MonitorEvent>>, EngineError> {
        if self.is_running() {
            debug!("event monitor already running; start is a no-op");
            return Ok(None);
        }

        let mut child = Command::new(&self.tool)
            .arg("monitor")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| EngineError::ProcessUnavailable(e.to_string()))?;

        let stdout = child.stdout.take().ok_or_else(|| {
            EngineError::ProcessUnavailable("monitor stdout not captured".into())
        })?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match parse_event_line(&line) {
                            Ok(event) => {
                                if tx.send(event).await.is_err() {
                                    debug!("event consumer dropped; stopping reader");
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, line, "skipping unparseable event line");
                            }
                        }
                    }
                    Ok(None) => {
                        info!("event stream closed");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "error reading event stream");
                        break;
                    }
                }
            }
        });

        info!(tool = %self.tool.display(), "event monitor started");
        self.child = Some(child);
        Ok(Some(rx))
    }

    /// Kill the monitor subprocess. This is the one hard cancellation
    /// point in the engine.
    pub async fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill event monitor");
            } else {
                info!("event monitor stopped");
            }
        }
    }
}
