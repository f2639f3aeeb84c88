//! Scripted fake control tool for engine tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use crate::control::{HypervisorControl, LifecycleOp, MachineListing};
use crate::error::EngineError;
use crate::status::MachineStatus;

#[derive(Default)]
struct FakeState {
    listings: Vec<MachineListing>,
    /// Scripted status sequences per machine id; the last entry repeats
    /// once the script runs out.
    statuses: HashMap<String, VecDeque<MachineStatus>>,
    /// Machines whose lifecycle commands fail with exit code 1.
    fail_lifecycle: HashSet<String>,
    /// Machines whose status polls fail once their script is used up,
    /// instead of repeating the last entry.
    fail_status_when_exhausted: HashSet<String>,
    lifecycle_calls: Vec<(LifecycleOp, String)>,
    status_polls: usize,
}

/// In-memory stand-in for the external control tool.
#[derive(Clone, Default)]
pub(crate) struct FakeControl {
    inner: Arc<Mutex<FakeState>>,
}

impl FakeControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listing(&self, uuid: &str, name: &str, status: &str, address: Option<&str>) {
        self.inner.lock().unwrap().listings.push(MachineListing {
            uuid: uuid.to_string(),
            name: name.to_string(),
            status: status.to_string(),
            address: address.map(str::to_string),
        });
    }

    pub fn script_statuses(&self, id: &str, statuses: &[MachineStatus]) {
        self.inner
            .lock()
            .unwrap()
            .statuses
            .insert(id.to_string(), statuses.iter().copied().collect());
    }

    pub fn fail_lifecycle_for(&self, id: &str) {
        self.inner.lock().unwrap().fail_lifecycle.insert(id.to_string());
    }

    pub fn fail_status_when_exhausted(&self, id: &str) {
        self.inner
            .lock()
            .unwrap()
            .fail_status_when_exhausted
            .insert(id.to_string());
    }

    pub fn lifecycle_calls(&self) -> Vec<(LifecycleOp, String)> {
        self.inner.lock().unwrap().lifecycle_calls.clone()
    }

    pub fn status_polls(&self) -> usize {
        self.inner.lock().unwrap().status_polls
    }
}

impl HypervisorControl for FakeControl {
    async fn list_all(&self) -> Result<Vec<MachineListing>, EngineError> {
        let state = self.inner.lock().unwrap();
        Ok(state
            .listings
            .iter()
            .map(|l| MachineListing {
                uuid: l.uuid.clone(),
                name: l.name.clone(),
                status: l.status.clone(),
                address: l.address.clone(),
            })
            .collect())
    }

    async fn machine_info(&self, id: &str) -> Result<MachineListing, EngineError> {
        let state = self.inner.lock().unwrap();
        state
            .listings
            .iter()
            .find(|l| l.canonical_id().eq_ignore_ascii_case(id))
            .map(|l| MachineListing {
                uuid: l.uuid.clone(),
                name: l.name.clone(),
                status: l.status.clone(),
                address: l.address.clone(),
            })
            .ok_or_else(|| EngineError::MalformedOutput {
                op: "list".into(),
                reason: format!("no record returned for machine {id}"),
            })
    }

    async fn machine_status(&self, id: &str) -> Result<MachineStatus, EngineError> {
        let mut state = self.inner.lock().unwrap();
        state.status_polls += 1;
        let fail_when_exhausted = state.fail_status_when_exhausted.contains(id);
        let queue = state
            .statuses
            .get_mut(id)
            .ok_or_else(|| EngineError::ToolExecutionFailed {
                op: "status".into(),
                code: Some(1),
                stderr: format!("machine {id} not found"),
            })?;
        if queue.len() > 1 {
            return Ok(queue.pop_front().unwrap_or(MachineStatus::Unknown));
        }
        if fail_when_exhausted {
            return Err(EngineError::ToolExecutionFailed {
                op: "status".into(),
                code: Some(255),
                stderr: "scripted status failure".into(),
            });
        }
        Ok(queue.front().copied().unwrap_or(MachineStatus::Unknown))
    }

    async fn lifecycle(&self, op: LifecycleOp, id: &str) -> Result<(), EngineError> {
        let mut state = self.inner.lock().unwrap();
        state.lifecycle_calls.push((op, id.to_string()));
        if state.fail_lifecycle.contains(id) {
            return Err(EngineError::ToolExecutionFailed {
                op: op.subcommand().to_string(),
                code: Some(1),
                stderr: "scripted failure".into(),
            });
        }
        Ok(())
    }
}
