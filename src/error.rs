use thiserror::Error;

use crate::status::{MachineStatus, TargetStatus};

/// Engine-level error taxonomy.
///
/// `InvalidArgument` and `MalformedOutput` are never retried; they indicate
/// a programming or environment error. `ToolExecutionFailed` is surfaced
/// without implicit retry so the caller (e.g. a group fan-out) can decide.
/// `TransitionTimeout` is non-fatal: the model keeps the last observed
/// status. None of these terminate the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The control tool ran but exited non-zero, or could not be launched
    /// at all (no exit code in that case).
    #[error("control tool '{op}' failed ({}): {stderr}", exit_label(.code))]
    ToolExecutionFailed {
        op: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("malformed output from '{op}': {reason}")]
    MalformedOutput { op: String, reason: String },

    #[error(
        "transition to {target} not confirmed after {attempts} status polls \
         (last observed: {last})"
    )]
    TransitionTimeout {
        target: TargetStatus,
        attempts: u32,
        last: MachineStatus,
    },

    #[error("event monitor unavailable: {0}")]
    ProcessUnavailable(String),

    #[error("machine or group not found: {0}")]
    NotFound(String),

    /// Aggregate of per-machine failures from a group fan-out. Sibling
    /// branches are never cancelled; this reports the ones that failed.
    #[error("{} of {total} machines failed: {}", .failures.len(), format_failures(.failures))]
    GroupFailure {
        total: usize,
        failures: Vec<(String, String)>,
    },
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("exit code {c}"),
        None => "failed to launch".to_string(),
    }
}

fn format_failures(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(id, err)| format!("{id}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_failure_display_with_code() {
        let err = EngineError::ToolExecutionFailed {
            op: "start".into(),
            code: Some(1),
            stderr: "no such machine".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("start"), "{msg}");
        assert!(msg.contains("exit code 1"), "{msg}");
        assert!(msg.contains("no such machine"), "{msg}");
    }

    #[test]
    fn tool_failure_display_without_code() {
        let err = EngineError::ToolExecutionFailed {
            op: "list".into(),
            code: None,
            stderr: "No such file or directory".into(),
        };
        assert!(err.to_string().contains("failed to launch"));
    }

    #[test]
    fn group_failure_display() {
        let err = EngineError::GroupFailure {
            total: 3,
            failures: vec![
                ("vm-1".into(), "exit code 1".into()),
                ("vm-2".into(), "timeout".into()),
            ],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("2 of 3"), "{msg}");
        assert!(msg.contains("vm-1: exit code 1"), "{msg}");
    }
}
