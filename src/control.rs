use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::error::EngineError;
use crate::fleet::Snapshot;
use crate::status::{MachineStatus, TargetStatus};

/// A lifecycle command understood by the control tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOp {
    Start,
    Stop,
    Pause,
    Resume,
    Suspend,
}

impl LifecycleOp {
    /// Control tool subcommand for this operation.
    pub fn subcommand(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Suspend => "suspend",
        }
    }

    /// Terminal status that confirms this operation took effect.
    pub fn target(&self) -> TargetStatus {
        match self {
            Self::Start | Self::Resume => TargetStatus::Running,
            Self::Stop => TargetStatus::Stopped,
            Self::Pause => TargetStatus::Paused,
            Self::Suspend => TargetStatus::Suspended,
        }
    }

    /// Whether the operation is meaningful for a machine currently in the
    /// given status. Group fan-outs skip ineligible machines.
    pub fn eligible(&self, status: MachineStatus) -> bool {
        match self {
            Self::Start => matches!(
                status,
                MachineStatus::Stopped | MachineStatus::Suspended
            ),
            Self::Stop => matches!(
                status,
                MachineStatus::Running | MachineStatus::Paused
            ),
            Self::Pause | Self::Suspend => matches!(status, MachineStatus::Running),
            Self::Resume => matches!(status, MachineStatus::Paused),
        }
    }
}

impl std::fmt::Display for LifecycleOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.subcommand())
    }
}

/// One machine record from a control tool listing.
#[derive(Debug, Clone, Deserialize)]
pub struct MachineListing {
    pub uuid: String,
    pub name: String,
    pub status: String,
    #[serde(default, rename = "ip_configured")]
    pub address: Option<String>,
}

impl MachineListing {
    /// Decoded lifecycle status; unknown text fails closed to `Unknown`.
    pub fn decoded_status(&self) -> MachineStatus {
        MachineStatus::decode_token(&self.status)
    }

    /// Hypervisor identifiers come wrapped in braces; strip them so the
    /// model uses one canonical form.
    pub fn canonical_id(&self) -> String {
        normalize_id(&self.uuid)
    }
}

/// Operations the transition supervisor, reconciler, and event-apply
/// logic need from the hypervisor. A trait so tests can substitute a
/// scripted fake for the real external tool.
pub trait HypervisorControl: Send + Sync {
    fn list_all(&self) -> impl Future<Output = Result<Vec<MachineListing>, EngineError>> + Send;

    fn machine_info(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<MachineListing, EngineError>> + Send;

    fn machine_status(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<MachineStatus, EngineError>> + Send;

    fn lifecycle(
        &self,
        op: LifecycleOp,
        id: &str,
    ) -> impl Future<Output = Result<(), EngineError>> + Send;
}

/// Client for the external hypervisor control tool.
///
/// Every operation is an independent, stateless process invocation:
/// spawn, collect stdout/stderr, check the exit code, parse. No process
/// is reused across calls; the only long-lived subprocess belongs to the
/// event monitor.
#[derive(Debug, Clone)]
pub struct ControlClient {
    tool: PathBuf,
}

impl ControlClient {
    pub fn new(tool: PathBuf) -> Self {
        Self { tool }
    }

    /// Reject an empty machine identifier before any process is spawned.
    fn require_id(id: &str) -> Result<(), EngineError> {
        if id.trim().is_empty() {
            return Err(EngineError::InvalidArgument(
                "machine identifier must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Run one control tool invocation and return its stdout.
    async fn run(&self, op: &str, args: &[&str]) -> Result<String, EngineError> {
        debug!(tool = %self.tool.display(), op, ?args, "running control tool");

        let output = Command::new(&self.tool)
            .arg(op)
            .args(args)
            .output()
            .await
            .map_err(|e| EngineError::ToolExecutionFailed {
                op: op.to_string(),
                code: None,
                stderr: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(EngineError::ToolExecutionFailed {
                op: op.to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Fetch snapshots for a machine as a flat list with parent links.
    pub async fn snapshot_list(&self, id: &str) -> Result<Vec<Snapshot>, EngineError> {
        Self::require_id(id)?;
        let stdout = self.run("snapshot-list", &[id, "--json"]).await?;
        parse_snapshot_list(&stdout)
    }

    pub async fn snapshot_create(&self, id: &str, name: &str) -> Result<(), EngineError> {
        Self::require_id(id)?;
        if name.trim().is_empty() {
            return Err(EngineError::InvalidArgument(
                "snapshot name must not be empty".into(),
            ));
        }
        self.run("snapshot", &[id, "--name", name]).await?;
        Ok(())
    }

    pub async fn snapshot_delete(&self, id: &str, snapshot_id: &str) -> Result<(), EngineError> {
        Self::require_id(id)?;
        Self::require_id(snapshot_id)?;
        self.run("snapshot-delete", &[id, "--id", snapshot_id]).await?;
        Ok(())
    }

    pub async fn snapshot_restore(&self, id: &str, snapshot_id: &str) -> Result<(), EngineError> {
        Self::require_id(id)?;
        Self::require_id(snapshot_id)?;
        self.run("snapshot-switch", &[id, "--id", snapshot_id]).await?;
        Ok(())
    }

    /// Register an existing machine bundle with the hypervisor.
    pub async fn register(&self, path: &Path) -> Result<(), EngineError> {
        let path = path.to_string_lossy();
        if path.trim().is_empty() {
            return Err(EngineError::InvalidArgument(
                "machine bundle path must not be empty".into(),
            ));
        }
        self.run("register", &[path.as_ref()]).await?;
        Ok(())
    }

    pub async fn unregister(&self, id: &str) -> Result<(), EngineError> {
        Self::require_id(id)?;
        self.run("unregister", &[id]).await?;
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<(), EngineError> {
        Self::require_id(id)?;
        self.run("delete", &[id]).await?;
        Ok(())
    }

    /// Rename is a config mutation on the hypervisor side.
    pub async fn rename(&self, id: &str, new_name: &str) -> Result<(), EngineError> {
        Self::require_id(id)?;
        if new_name.trim().is_empty() {
            return Err(EngineError::InvalidArgument(
                "new machine name must not be empty".into(),
            ));
        }
        self.run("set", &[id, "--name", new_name]).await?;
        Ok(())
    }

    /// Set a single configuration key on a machine, e.g. `--memsize 2048`.
    pub async fn set_config(&self, id: &str, key: &str, value: &str) -> Result<(), EngineError> {
        Self::require_id(id)?;
        if key.trim().is_empty() {
            return Err(EngineError::InvalidArgument(
                "config key must not be empty".into(),
            ));
        }
        let flag = format!("--{key}");
        self.run("set", &[id, &flag, value]).await?;
        Ok(())
    }

    /// Capture the machine's screen to an image file.
    pub async fn capture_screen(&self, id: &str, file: &Path) -> Result<(), EngineError> {
        Self::require_id(id)?;
        let file = file.to_string_lossy();
        self.run("capture", &[id, "--file", file.as_ref()]).await?;
        Ok(())
    }
}

impl HypervisorControl for ControlClient {
    async fn list_all(&self) -> Result<Vec<MachineListing>, EngineError> {
        let stdout = self.run("list", &["--all", "--json"]).await?;
        parse_listing(&stdout)
    }

    async fn machine_info(&self, id: &str) -> Result<MachineListing, EngineError> {
        Self::require_id(id)?;
        let stdout = self.run("list", &["--json", "--info", id]).await?;
        let mut machines = parse_listing(&stdout)?;
        if machines.is_empty() {
            return Err(EngineError::MalformedOutput {
                op: "list".into(),
                reason: format!("no record returned for machine {id}"),
            });
        }
        Ok(machines.swap_remove(0))
    }

    async fn machine_status(&self, id: &str) -> Result<MachineStatus, EngineError> {
        Self::require_id(id)?;
        let stdout = self.run("status", &[id]).await?;
        Ok(MachineStatus::decode_line(&stdout))
    }

    async fn lifecycle(&self, op: LifecycleOp, id: &str) -> Result<(), EngineError> {
        Self::require_id(id)?;
        self.run(op.subcommand(), &[id]).await?;
        Ok(())
    }
}

/// Strip the brace wrapping the tool puts around identifiers.
pub fn normalize_id(raw: &str) -> String {
    raw.trim()
        .trim_start_matches('{')
        .trim_end_matches('}')
        .to_string()
}

/// Parse a `list --json` document: a JSON array of machine records.
pub(crate) fn parse_listing(stdout: &str) -> Result<Vec<MachineListing>, EngineError> {
    serde_json::from_str(stdout).map_err(|e| EngineError::MalformedOutput {
        op: "list".into(),
        reason: e.to_string(),
    })
}

/// Raw snapshot record as emitted by `snapshot-list --json`: an object
/// keyed by snapshot id.
#[derive(Debug, Deserialize)]
struct RawSnapshot {
    name: String,
    #[serde(default)]
    parent: String,
    #[serde(default)]
    current: bool,
}

/// Parse a `snapshot-list --json` document into a flat snapshot list.
///
/// The tool emits an empty string (not `{}`) for machines without
/// snapshots; treat that as an empty list rather than a parse error.
pub(crate) fn parse_snapshot_list(stdout: &str) -> Result<Vec<Snapshot>, EngineError> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    // BTreeMap keeps the output order deterministic.
    let raw: BTreeMap<String, RawSnapshot> =
        serde_json::from_str(stdout).map_err(|e| EngineError::MalformedOutput {
            op: "snapshot-list".into(),
            reason: e.to_string(),
        })?;

    Ok(raw
        .into_iter()
        .map(|(id, snap)| Snapshot {
            id: normalize_id(&id),
            parent: if snap.parent.is_empty() {
                None
            } else {
                Some(normalize_id(&snap.parent))
            },
            name: snap.name,
            current: snap.current,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_listing_array() {
        let json = r#"[
            {"uuid": "{a1}", "name": "web", "status": "running", "ip_configured": "10.0.0.5"},
            {"uuid": "{b2}", "name": "db", "status": "stopped"}
        ]"#;
        let machines = parse_listing(json).unwrap();
        assert_eq!(machines.len(), 2);
        assert_eq!(machines[0].canonical_id(), "a1");
        assert_eq!(machines[0].decoded_status(), MachineStatus::Running);
        assert_eq!(machines[0].address.as_deref(), Some("10.0.0.5"));
        assert_eq!(machines[1].decoded_status(), MachineStatus::Stopped);
        assert!(machines[1].address.is_none());
    }

    #[test]
    fn parse_listing_empty_array() {
        assert!(parse_listing("[]").unwrap().is_empty());
    }

    #[test]
    fn parse_listing_rejects_garbage() {
        let err = parse_listing("not json at all").unwrap_err();
        assert!(matches!(err, EngineError::MalformedOutput { .. }));
    }

    #[test]
    fn listing_unknown_status_fails_closed() {
        let json = r#"[{"uuid": "{a1}", "name": "web", "status": "resetting"}]"#;
        let machines = parse_listing(json).unwrap();
        assert_eq!(machines[0].decoded_status(), MachineStatus::Unknown);
    }

    #[test]
    fn parse_snapshots_with_tree() {
        let json = r#"{
            "{s1}": {"name": "base", "parent": "", "current": false},
            "{s2}": {"name": "after-setup", "parent": "{s1}", "current": true}
        }"#;
        let snaps = parse_snapshot_list(json).unwrap();
        assert_eq!(snaps.len(), 2);
        let current: Vec<_> = snaps.iter().filter(|s| s.current).collect();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].name, "after-setup");
        assert_eq!(current[0].parent.as_deref(), Some("s1"));
    }

    #[test]
    fn parse_snapshots_empty_output() {
        assert!(parse_snapshot_list("").unwrap().is_empty());
        assert!(parse_snapshot_list("  \n").unwrap().is_empty());
        assert!(parse_snapshot_list("{}").unwrap().is_empty());
    }

    #[test]
    fn normalize_strips_braces() {
        assert_eq!(normalize_id("{abc-123}"), "abc-123");
        assert_eq!(normalize_id("abc-123"), "abc-123");
        assert_eq!(normalize_id(" {abc} "), "abc");
    }

    #[test]
    fn lifecycle_op_targets() {
        assert_eq!(LifecycleOp::Start.target(), TargetStatus::Running);
        assert_eq!(LifecycleOp::Resume.target(), TargetStatus::Running);
        assert_eq!(LifecycleOp::Stop.target(), TargetStatus::Stopped);
        assert_eq!(LifecycleOp::Pause.target(), TargetStatus::Paused);
        assert_eq!(LifecycleOp::Suspend.target(), TargetStatus::Suspended);
    }

    #[test]
    fn lifecycle_eligibility() {
        assert!(LifecycleOp::Pause.eligible(MachineStatus::Running));
        assert!(!LifecycleOp::Pause.eligible(MachineStatus::Stopped));
        assert!(LifecycleOp::Start.eligible(MachineStatus::Suspended));
        assert!(!LifecycleOp::Start.eligible(MachineStatus::Running));
        assert!(LifecycleOp::Resume.eligible(MachineStatus::Paused));
        assert!(!LifecycleOp::Resume.eligible(MachineStatus::Running));
        assert!(LifecycleOp::Stop.eligible(MachineStatus::Paused));
    }

    #[tokio::test]
    async fn empty_id_fails_before_spawn() {
        let client = ControlClient::new(PathBuf::from("/nonexistent/control-tool"));
        let err = client.machine_status("").await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)), "{err}");

        let err = client.lifecycle(LifecycleOp::Start, "  ").await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)), "{err}");
    }

    #[tokio::test]
    async fn missing_tool_reports_execution_failure() {
        let client = ControlClient::new(PathBuf::from("/nonexistent/control-tool"));
        let err = client.lifecycle(LifecycleOp::Start, "vm-1").await.unwrap_err();
        match err {
            EngineError::ToolExecutionFailed { op, code, .. } => {
                assert_eq!(op, "start");
                assert!(code.is_none());
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
