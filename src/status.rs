use serde::{Deserialize, Serialize};

/// Lifecycle status of a machine as reported by the control tool.
///
/// `Transitioning` is a local-only label set while a lifecycle command is
/// in flight; the control tool never reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    Stopped,
    Running,
    Paused,
    Suspended,
    Snapshotting,
    Transitioning(TargetStatus),
    Unknown,
}

/// The terminal states a lifecycle operation can aim for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    Stopped,
    Running,
    Paused,
    Suspended,
}

impl From<TargetStatus> for MachineStatus {
    fn from(target: TargetStatus) -> Self {
        match target {
            TargetStatus::Stopped => MachineStatus::Stopped,
            TargetStatus::Running => MachineStatus::Running,
            TargetStatus::Paused => MachineStatus::Paused,
            TargetStatus::Suspended => MachineStatus::Suspended,
        }
    }
}

impl MachineStatus {
    /// Decode a single status token from control tool output.
    ///
    /// The match is exact (case-insensitive) against the known vocabulary;
    /// anything else decodes to `Unknown` rather than an error, so a
    /// phrasing change in the external tool can never misclassify a state.
    pub fn decode_token(token: &str) -> Self {
        match token.trim().to_ascii_lowercase().as_str() {
            "stopped" => Self::Stopped,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "suspended" => Self::Suspended,
            "snapshooting" | "snapshotting" => Self::Snapshotting,
            _ => Self::Unknown,
        }
    }

    /// Decode a status from a full line of `status` subcommand output.
    ///
    /// The tool prints a short sentence ending in the state word
    /// (e.g. "VM vm-1 exist stopped"); the last whitespace-separated
    /// token is the state.
    pub fn decode_line(line: &str) -> Self {
        line.split_whitespace()
            .last()
            .map(Self::decode_token)
            .unwrap_or(Self::Unknown)
    }

    /// Whether an address fetched from the hypervisor is meaningful in
    /// this state. Stopped and suspended machines have no live address.
    pub fn has_address(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl std::fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Suspended => write!(f, "suspended"),
            Self::Snapshotting => write!(f, "snapshotting"),
            Self::Transitioning(target) => write!(f, "{}...", target.verb()),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl TargetStatus {
    /// Progressive verb shown while a transition to this state is pending.
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Running => "starting",
            Self::Stopped => "stopping",
            Self::Paused => "pausing",
            Self::Suspended => "suspending",
        }
    }
}

impl std::fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        MachineStatus::from(*self).fmt(f)
    }
}
