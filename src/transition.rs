use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::control::{HypervisorControl, LifecycleOp};
use crate::error::EngineError;
use crate::fleet::SharedModel;
use crate::signal::RefreshSignal;
use crate::status::MachineStatus;

/// Polling policy for confirming a lifecycle transition.
///
/// Injected rather than hard-coded so tests can run with tiny budgets and
/// a zero interval (no timer is created when the interval is zero).
#[derive(Debug, Clone)]
pub struct PollPolicy {
    /// Maximum number of status polls before giving up.
    pub max_attempts: u32,
    /// Delay between polls. Zero means back-to-back polls whose pacing is
    /// only the status call's own latency.
    pub interval: Duration,
    /// Optional overall deadline for the polling phase.
    pub deadline: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 40,
            interval: Duration::ZERO,
            deadline: None,
        }
    }
}

/// Issue one lifecycle command and confirm its effect by polling status.
///
/// Protocol:
/// 1. Optimistically record a transitional status and signal the UI.
/// 2. Invoke the control tool. On failure the machine's previous status
///    is restored; the operation is not assumed to have taken effect.
/// 3. Poll status within the policy's budget, signalling the UI after
///    every poll. Observing the target confirms the transition.
/// 4. On an exhausted budget the machine keeps the last status actually
///    observed from a poll, never a synthetic value, and the caller gets
///    `TransitionTimeout`.
pub async fn run<C: HypervisorControl>(
    client: &C,
    model: &SharedModel,
    refresh: &RefreshSignal,
    id: &str,
    op: LifecycleOp,
    policy: &PollPolicy,
) -> Result<MachineStatus, EngineError> {
    let target = op.target();
    let wanted = MachineStatus::from(target);

    let previous = {
        let mut model = model.write().await;
        let Some(machine) = model.find_machine_mut(id) else {
            return Err(EngineError::NotFound(id.to_string()));
        };
        let previous = machine.status;
        machine.status = MachineStatus::Transitioning(target);
        previous
    };
    refresh.notify();

    debug!(machine = id, %op, "issuing lifecycle command");
    if let Err(e) = client.lifecycle(op, id).await {
        // The command never took effect; put the last confirmed status back.
        let mut model = model.write().await;
        if let Some(machine) = model.find_machine_mut(id) {
            machine.status = previous;
        }
        refresh.notify();
        warn!(machine = id, %op, error = %e, "lifecycle command failed");
        return Err(e);
    }

    let started = Instant::now();
    let mut last_observed = MachineStatus::Transitioning(target);
    let mut attempts = 0;

    while attempts < policy.max_attempts {
        if let Some(deadline) = policy.deadline {
            if started.elapsed() >= deadline {
                break;
            }
        }

        let observed = match client.machine_status(id).await {
            Ok(observed) => observed,
            Err(e) => {
                // The transition may still complete; record the last
                // observation instead of leaving the optimistic label.
                let mut model = model.write().await;
                if let Some(machine) = model.find_machine_mut(id) {
                    machine.status = last_observed;
                }
                drop(model);
                refresh.notify();
                warn!(machine = id, %op, error = %e, "status poll failed");
                return Err(e);
            }
        };
        attempts += 1;
        last_observed = observed;
        refresh.notify();

        if observed == wanted {
            let mut model = model.write().await;
            if let Some(machine) = model.find_machine_mut(id) {
                machine.status = wanted;
            }
            info!(machine = id, %op, attempts, "transition confirmed");
            return Ok(wanted);
        }

        if !policy.interval.is_zero() {
            tokio::time::sleep(policy.interval).await;
        }
    }

    // Budget exhausted: record what was last observed, not what was hoped.
    {
        let mut model = model.write().await;
        if let Some(machine) = model.find_machine_mut(id) {
            machine.status = last_observed;
        }
    }
    refresh.notify();
    warn!(machine = id, %op, attempts, last = %last_observed, "transition unconfirmed");
    Err(EngineError::TransitionTimeout {
        target,
        attempts,
        last: last_observed,
    })
}

/// Fan a lifecycle operation out over every eligible machine in a group.
///
/// Eligibility is per-operation (only running machines are paused, and so
/// on). Each branch is an independently scheduled supervisor run; a
/// failing branch never cancels its siblings, and partial failures are
/// reported as one aggregate error after all branches complete.
pub async fn run_group<C>(
    client: &C,
    model: &SharedModel,
    refresh: &RefreshSignal,
    group_id_or_name: &str,
    op: LifecycleOp,
    policy: &PollPolicy,
) -> Result<usize, EngineError>
where
    C: HypervisorControl + Clone + 'static,
{
    let eligible: Vec<String> = {
        let model = model.read().await;
        let Some(group) = model.find_group(group_id_or_name) else {
            return Err(EngineError::NotFound(group_id_or_name.to_string()));
        };
        group
            .machines
            .iter()
            .filter(|m| op.eligible(m.status))
            .map(|m| m.id.clone())
            .collect()
    };

    if eligible.is_empty() {
        debug!(group = group_id_or_name, %op, "no eligible machines");
        return Ok(0);
    }

    let total = eligible.len();
    let mut branches = JoinSet::new();
    for id in eligible {
        let client = client.clone();
        let model = model.clone();
        let refresh = refresh.clone();
        let policy = policy.clone();
        branches.spawn(async move {
            let result = run(&client, &model, &refresh, &id, op, &policy).await;
            (id, result)
        });
    }

    let mut failures = Vec::new();
    while let Some(joined) = branches.join_next().await {
        match joined {
            Ok((_, Ok(_))) => {}
            Ok((id, Err(e))) => failures.push((id, e.to_string())),
            Err(e) => failures.push(("<branch>".to_string(), e.to_string())),
        }
    }

    if failures.is_empty() {
        Ok(total)
    } else {
        Err(EngineError::GroupFailure { total, failures })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::RwLock;

    use super::*;
    use crate::fleet::{FleetModel, Group, Machine, UNGROUPED_ID};
    use crate::status::TargetStatus;
    use crate::testutil::FakeControl;

    fn shared(machines: &[(&str, &str, MachineStatus)]) -> SharedModel {
        let mut model = FleetModel::new(false);
        for (id, name, status) in machines {
            model.add_machine(UNGROUPED_ID, Machine::new(*id, *name, *status));
        }
        Arc::new(RwLock::new(model))
    }

    fn quick_policy(max_attempts: u32) -> PollPolicy {
        PollPolicy {
            max_attempts,
            interval: Duration::ZERO,
            deadline: None,
        }
    }

    /// Scenario: stopped machine, "start" succeeds, polls observe
    /// stopped, stopped, running; final recorded status is running.
    #[tokio::test]
    async fn start_confirmed_after_polls() {
        let client = FakeControl::new();
        client.script_statuses(
            "vm-1",
            &[
                MachineStatus::Stopped,
                MachineStatus::Stopped,
                MachineStatus::Running,
            ],
        );
        let model = shared(&[("vm-1", "web", MachineStatus::Stopped)]);
        let refresh = RefreshSignal::new();

        let result = run(
            &client,
            &model,
            &refresh,
            "vm-1",
            LifecycleOp::Start,
            &quick_policy(40),
        )
        .await
        .unwrap();

        assert_eq!(result, MachineStatus::Running);
        assert_eq!(
            model.read().await.find_machine("vm-1").unwrap().status,
            MachineStatus::Running
        );
        assert_eq!(client.status_polls(), 3);
        assert_eq!(
            client.lifecycle_calls(),
            vec![(LifecycleOp::Start, "vm-1".to_string())]
        );
        // One signal for the optimistic label plus one per poll.
        assert_eq!(refresh.generation(), 4);
    }

    /// Scenario: the control tool invocation itself fails; the machine
    /// keeps its pre-operation status and the caller gets the tool error.
    #[tokio::test]
    async fn command_failure_restores_previous_status() {
        let client = FakeControl::new();
        client.fail_lifecycle_for("vm-2");
        let model = shared(&[("vm-2", "db", MachineStatus::Stopped)]);
        let refresh = RefreshSignal::new();

        let err = run(
            &client,
            &model,
            &refresh,
            "vm-2",
            LifecycleOp::Start,
            &quick_policy(40),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, EngineError::ToolExecutionFailed { .. }), "{err}");
        assert_eq!(
            model.read().await.find_machine("vm-2").unwrap().status,
            MachineStatus::Stopped
        );
        assert_eq!(client.status_polls(), 0);
    }

    /// Exhausted budget: the recorded status is the last one actually
    /// observed from a poll, never a synthetic value, and the error says
    /// how many polls ran.
    #[tokio::test]
    async fn timeout_keeps_last_observed_status() {
        let client = FakeControl::new();
        client.script_statuses("vm-1", &[MachineStatus::Stopped]);
        let model = shared(&[("vm-1", "web", MachineStatus::Stopped)]);
        let refresh = RefreshSignal::new();

        let err = run(
            &client,
            &model,
            &refresh,
            "vm-1",
            LifecycleOp::Start,
            &quick_policy(5),
        )
        .await
        .unwrap_err();

        match err {
            EngineError::TransitionTimeout { attempts, last, .. } => {
                assert_eq!(attempts, 5);
                assert_eq!(last, MachineStatus::Stopped);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(
            model.read().await.find_machine("vm-1").unwrap().status,
            MachineStatus::Stopped
        );
        assert_eq!(client.status_polls(), 5);
    }

    /// A failing status poll surfaces the tool error, and the machine is
    /// left showing the last real observation rather than the optimistic
    /// transitional label.
    #[tokio::test]
    async fn poll_failure_records_last_observation() {
        let client = FakeControl::new();
        client.script_statuses("vm-1", &[MachineStatus::Stopped, MachineStatus::Stopped]);
        client.fail_status_when_exhausted("vm-1");
        let model = shared(&[("vm-1", "web", MachineStatus::Stopped)]);
        let refresh = RefreshSignal::new();

        let err = run(
            &client,
            &model,
            &refresh,
            "vm-1",
            LifecycleOp::Start,
            &quick_policy(40),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, EngineError::ToolExecutionFailed { .. }), "{err}");
        assert_eq!(
            model.read().await.find_machine("vm-1").unwrap().status,
            MachineStatus::Stopped
        );
        // One good poll before the failing one.
        assert_eq!(client.status_polls(), 2);
    }

    #[tokio::test]
    async fn transitional_label_visible_during_polls() {
        let client = FakeControl::new();
        client.script_statuses("vm-1", &[MachineStatus::Stopped]);
        let model = shared(&[("vm-1", "web", MachineStatus::Stopped)]);
        let refresh = RefreshSignal::new();

        // With a zero-attempt budget the optimistic label survives until
        // the (immediate) timeout writes the last observation; there was
        // no observation, so the label itself is what remains.
        let err = run(
            &client,
            &model,
            &refresh,
            "vm-1",
            LifecycleOp::Suspend,
            &quick_policy(0),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, EngineError::TransitionTimeout { .. }));
        assert_eq!(
            model.read().await.find_machine("vm-1").unwrap().status,
            MachineStatus::Transitioning(TargetStatus::Suspended)
        );
    }

    #[tokio::test]
    async fn unknown_machine_is_not_found() {
        let client = FakeControl::new();
        let model = shared(&[]);
        let refresh = RefreshSignal::new();

        let err = run(
            &client,
            &model,
            &refresh,
            "ghost",
            LifecycleOp::Start,
            &quick_policy(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)), "{err}");
    }

    /// Scenario: group with one running and one stopped machine; "pause
    /// group" only touches the running one.
    #[tokio::test]
    async fn group_pause_skips_ineligible() {
        let client = FakeControl::new();
        client.script_statuses("vm-4", &[MachineStatus::Paused]);

        let model = {
            let mut m = FleetModel::new(false);
            m.add_group(None, Group::new("g"));
            let gid = m.find_group("g").unwrap().id.clone();
            m.add_machine(&gid, Machine::new("vm-4", "worker", MachineStatus::Running));
            m.add_machine(&gid, Machine::new("vm-5", "spare", MachineStatus::Stopped));
            Arc::new(RwLock::new(m))
        };
        let refresh = RefreshSignal::new();

        let touched = run_group(
            &client,
            &model,
            &refresh,
            "g",
            LifecycleOp::Pause,
            &quick_policy(10),
        )
        .await
        .unwrap();

        assert_eq!(touched, 1);
        assert_eq!(
            client.lifecycle_calls(),
            vec![(LifecycleOp::Pause, "vm-4".to_string())]
        );
        let model = model.read().await;
        assert_eq!(model.find_machine("vm-4").unwrap().status, MachineStatus::Paused);
        assert_eq!(model.find_machine("vm-5").unwrap().status, MachineStatus::Stopped);
    }

    /// A failing branch does not cancel its siblings; the aggregate error
    /// names only the failed machines.
    #[tokio::test]
    async fn group_partial_failure_is_aggregated() {
        let client = FakeControl::new();
        client.script_statuses("vm-1", &[MachineStatus::Running]);
        client.script_statuses("vm-2", &[MachineStatus::Stopped]);
        client.fail_lifecycle_for("vm-2");

        let model = {
            let mut m = FleetModel::new(false);
            m.add_group(None, Group::new("g"));
            let gid = m.find_group("g").unwrap().id.clone();
            m.add_machine(&gid, Machine::new("vm-1", "a", MachineStatus::Stopped));
            m.add_machine(&gid, Machine::new("vm-2", "b", MachineStatus::Stopped));
            Arc::new(RwLock::new(m))
        };
        let refresh = RefreshSignal::new();

        let err = run_group(
            &client,
            &model,
            &refresh,
            "g",
            LifecycleOp::Start,
            &quick_policy(10),
        )
        .await
        .unwrap_err();

        match err {
            EngineError::GroupFailure { total, failures } => {
                assert_eq!(total, 2);
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].0, "vm-2");
            }
            other => panic!("unexpected error: {other}"),
        }
        // The healthy sibling completed despite the failure.
        let model = model.read().await;
        assert_eq!(model.find_machine("vm-1").unwrap().status, MachineStatus::Running);
        assert_eq!(model.find_machine("vm-2").unwrap().status, MachineStatus::Stopped);
    }

    #[tokio::test]
    async fn group_with_no_eligible_machines_is_zero_work() {
        let client = FakeControl::new();
        let model = {
            let mut m = FleetModel::new(false);
            m.add_group(None, Group::new("g"));
            let gid = m.find_group("g").unwrap().id.clone();
            m.add_machine(&gid, Machine::new("vm-1", "a", MachineStatus::Stopped));
            Arc::new(RwLock::new(m))
        };
        let refresh = RefreshSignal::new();

        let touched = run_group(
            &client,
            &model,
            &refresh,
            "g",
            LifecycleOp::Pause,
            &quick_policy(10),
        )
        .await
        .unwrap();
        assert_eq!(touched, 0);
        assert!(client.lifecycle_calls().is_empty());
    }

    #[tokio::test]
    async fn deadline_bounds_the_polling_phase() {
        let client = FakeControl::new();
        client.script_statuses("vm-1", &[MachineStatus::Stopped]);
        let model = shared(&[("vm-1", "web", MachineStatus::Stopped)]);
        let refresh = RefreshSignal::new();

        let policy = PollPolicy {
            max_attempts: u32::MAX,
            interval: Duration::from_millis(5),
            deadline: Some(Duration::from_millis(20)),
        };
        let err = run(&client, &model, &refresh, "vm-1", LifecycleOp::Start, &policy)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::TransitionTimeout { .. }), "{err}");
        // Far fewer polls than the (effectively unbounded) attempt budget.
        assert!(client.status_polls() < 100);
    }
}
