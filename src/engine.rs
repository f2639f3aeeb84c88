use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::control::{ControlClient, HypervisorControl, LifecycleOp};
use crate::error::EngineError;
use crate::fleet::{
    FleetModel, Group, Machine, PersistedFleet, SharedModel, Snapshot, UNGROUPED_ID,
};
use crate::monitor::{EventMonitor, MonitorEvent};
use crate::reconcile::reconcile;
use crate::signal::RefreshSignal;
use crate::status::MachineStatus;
use crate::transition;

/// Composition root of the fleet synchronization engine.
///
/// Owns the fleet model, the control client, the event monitor handle,
/// and the UI refresh signal. All fleet-affecting operations funnel
/// through here so the model is saved and the UI signalled consistently.
pub struct Engine {
    config: Config,
    client: ControlClient,
    model: SharedModel,
    refresh: RefreshSignal,
    monitor: EventMonitor,
}

impl Engine {
    /// Build the engine, loading any previously persisted fleet state.
    pub fn new(config: Config) -> Result<Self> {
        let client = ControlClient::new(config.tool.path.clone());
        let monitor = EventMonitor::new(config.tool.path.clone());
        let mut model = FleetModel::new(config.fleet.sort_alphabetically);

        match load_model(&config.fleet.state_file) {
            Ok(Some(persisted)) => {
                info!(path = %config.fleet.state_file.display(), "loaded fleet state");
                model.restore(persisted);
            }
            Ok(None) => debug!("no fleet state file; starting empty"),
            Err(e) => warn!(error = %e, "could not load fleet state; starting empty"),
        }

        Ok(Self {
            config,
            client,
            monitor,
            model: Arc::new(RwLock::new(model)),
            refresh: RefreshSignal::new(),
        })
    }

    /// Whether listings should include entries flagged hidden.
    pub fn show_hidden(&self) -> bool {
        self.config.fleet.show_hidden
    }

    /// A cloned view of the whole tree, for rendering.
    pub async fn model_view(&self) -> FleetModel {
        self.model.read().await.clone()
    }

    /// Resolve a machine id or name to the hypervisor identifier.
    async fn resolve_machine(&self, id_or_name: &str) -> Result<String, EngineError> {
        let model = self.model.read().await;
        model
            .find_machine(id_or_name)
            .map(|m| m.id.clone())
            .ok_or_else(|| EngineError::NotFound(id_or_name.to_string()))
    }

    async fn save(&self) {
        let model = self.model.read().await.clone();
        if let Err(e) = save_model(&self.config.fleet.state_file, &model) {
            error!(error = %e, "failed to persist fleet state");
        }
    }

    /// Re-derive the model from an authoritative full listing.
    pub async fn refresh_now(&self) -> Result<bool, EngineError> {
        let changed = reconcile(&self.client, &self.model, &self.refresh).await?;
        if changed {
            self.save().await;
        }
        Ok(changed)
    }

    /// Run one lifecycle transition against a machine (by id or name).
    pub async fn machine_lifecycle(
        &self,
        id_or_name: &str,
        op: LifecycleOp,
    ) -> Result<MachineStatus, EngineError> {
        let id = self.resolve_machine(id_or_name).await?;
        let policy = self.config.poll.policy();
        let result =
            transition::run(&self.client, &self.model, &self.refresh, &id, op, &policy).await;
        self.save().await;
        result
    }

    /// Fan a lifecycle operation out over a group. Returns the number of
    /// machines the operation was issued to.
    pub async fn group_lifecycle(
        &self,
        group: &str,
        op: LifecycleOp,
    ) -> Result<usize, EngineError> {
        let policy = self.config.poll.policy();
        let result = transition::run_group(
            &self.client,
            &self.model,
            &self.refresh,
            group,
            op,
            &policy,
        )
        .await;
        self.save().await;
        result
    }

    pub async fn machine_status(&self, id_or_name: &str) -> Result<MachineStatus, EngineError> {
        let id = self.resolve_machine(id_or_name).await?;
        self.client.machine_status(&id).await
    }

    pub async fn snapshots(&self, id_or_name: &str) -> Result<Vec<Snapshot>, EngineError> {
        let id = self.resolve_machine(id_or_name).await?;
        self.client.snapshot_list(&id).await
    }

    pub async fn snapshot_create(&self, id_or_name: &str, name: &str) -> Result<(), EngineError> {
        let id = self.resolve_machine(id_or_name).await?;
        self.client.snapshot_create(&id, name).await
    }

    pub async fn snapshot_delete(
        &self,
        id_or_name: &str,
        snapshot_id: &str,
    ) -> Result<(), EngineError> {
        let id = self.resolve_machine(id_or_name).await?;
        self.client.snapshot_delete(&id, snapshot_id).await
    }

    pub async fn snapshot_restore(
        &self,
        id_or_name: &str,
        snapshot_id: &str,
    ) -> Result<(), EngineError> {
        let id = self.resolve_machine(id_or_name).await?;
        self.client.snapshot_restore(&id, snapshot_id).await
    }

    /// Rename on the hypervisor, then mirror the new name locally.
    pub async fn rename_machine(
        &self,
        id_or_name: &str,
        new_name: &str,
    ) -> Result<(), EngineError> {
        let id = self.resolve_machine(id_or_name).await?;
        self.client.rename(&id, new_name).await?;
        {
            let mut model = self.model.write().await;
            if let Some(machine) = model.find_machine_mut(&id) {
                machine.name = new_name.to_string();
            }
        }
        self.refresh.notify();
        self.save().await;
        Ok(())
    }

    pub async fn set_machine_config(
        &self,
        id_or_name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), EngineError> {
        let id = self.resolve_machine(id_or_name).await?;
        self.client.set_config(&id, key, value).await
    }

    pub async fn capture_screen(
        &self,
        id_or_name: &str,
        file: &Path,
    ) -> Result<(), EngineError> {
        let id = self.resolve_machine(id_or_name).await?;
        self.client.capture_screen(&id, file).await
    }

    /// Register a machine bundle, then pick the new machine up from a
    /// fresh listing.
    pub async fn register_machine(&self, path: &Path) -> Result<(), EngineError> {
        self.client.register(path).await?;
        self.refresh_now().await?;
        Ok(())
    }

    pub async fn unregister_machine(&self, id_or_name: &str) -> Result<(), EngineError> {
        let id = self.resolve_machine(id_or_name).await?;
        self.client.unregister(&id).await?;
        self.refresh_now().await?;
        Ok(())
    }

    pub async fn delete_machine(&self, id_or_name: &str) -> Result<(), EngineError> {
        let id = self.resolve_machine(id_or_name).await?;
        self.client.delete(&id).await?;
        self.refresh_now().await?;
        Ok(())
    }

    /// Create a group, optionally nested under a parent (id or name).
    pub async fn create_group(
        &self,
        name: &str,
        parent: Option<&str>,
    ) -> Result<(), EngineError> {
        if name.trim().is_empty() {
            return Err(EngineError::InvalidArgument(
                "group name must not be empty".into(),
            ));
        }
        {
            let mut model = self.model.write().await;
            let parent_id = match parent {
                Some(p) => Some(
                    model
                        .find_group(p)
                        .map(|g| g.id.clone())
                        .ok_or_else(|| EngineError::NotFound(p.to_string()))?,
                ),
                None => None,
            };
            model.add_group(parent_id.as_deref(), Group::new(name));
        }
        self.refresh.notify();
        self.save().await;
        Ok(())
    }

    /// Remove a group; its machines move to the ungrouped group.
    pub async fn remove_group(&self, id_or_name: &str) -> Result<(), EngineError> {
        {
            let mut model = self.model.write().await;
            let id = model
                .find_group(id_or_name)
                .map(|g| g.id.clone())
                .ok_or_else(|| EngineError::NotFound(id_or_name.to_string()))?;
            model.remove_group(&id);
        }
        self.refresh.notify();
        self.save().await;
        Ok(())
    }

    /// Move a machine into another group.
    pub async fn move_machine(
        &self,
        machine: &str,
        group: &str,
    ) -> Result<(), EngineError> {
        {
            let mut model = self.model.write().await;
            let record = model
                .find_machine(machine)
                .cloned()
                .ok_or_else(|| EngineError::NotFound(machine.to_string()))?;
            let group_id = model
                .find_group(group)
                .map(|g| g.id.clone())
                .ok_or_else(|| EngineError::NotFound(group.to_string()))?;
            model.add_machine(&group_id, record);
        }
        self.refresh.notify();
        self.save().await;
        Ok(())
    }

    /// Toggle the hidden flag on a machine or group (machines first).
    pub async fn set_hidden(&self, target: &str, hidden: bool) -> Result<(), EngineError> {
        {
            let mut model = self.model.write().await;
            if let Some(machine) = model.find_machine_mut(target) {
                machine.hidden = hidden;
            } else if let Some(group) = model.find_group_mut(target) {
                group.hidden = hidden;
            } else {
                return Err(EngineError::NotFound(target.to_string()));
            }
        }
        self.refresh.notify();
        self.save().await;
        Ok(())
    }

    /// Start the event monitor and the task that applies its events to
    /// the model. A no-op if the monitor is already running.
    pub fn start_monitor(&mut self) -> Result<(), EngineError> {
        let Some(rx) = self.monitor.start()? else {
            return Ok(());
        };
        let client = self.client.clone();
        let model = self.model.clone();
        let refresh = self.refresh.clone();
        let state_file = self.config.fleet.state_file.clone();
        tokio::spawn(async move {
            event_loop(client, model, refresh, state_file, rx).await;
        });
        Ok(())
    }

    pub async fn stop_monitor(&mut self) {
        self.monitor.stop().await;
    }

    /// Run the long-lived daemon: event monitor plus timer-driven
    /// reconciler, until interrupted.
    pub async fn run_daemon(&mut self) -> Result<()> {
        if let Err(e) = self.start_monitor() {
            // The reconciler still repairs drift; run degraded.
            warn!(error = %e, "event monitor unavailable; relying on reconciler only");
        }

        if let Err(e) = self.refresh_now().await {
            warn!(error = %e, "initial fleet refresh failed");
        }

        let auto = self.config.refresh.enabled;
        let interval = self.config.refresh.interval();
        let mut refresh_rx = self.refresh.subscribe();
        // A standing interval keeps the reconcile schedule steady even
        // when other select branches fire in between.
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        info!(auto_refresh = auto, interval_ms = interval.as_millis() as u64, "engine running");

        loop {
            tokio::select! {
                _ = ticker.tick(), if auto => {
                    if let Err(e) = self.refresh_now().await {
                        warn!(error = %e, "auto-refresh failed");
                    }
                }
                changed = refresh_rx.changed() => {
                    if changed.is_ok() {
                        debug!(generation = *refresh_rx.borrow_and_update(), "fleet updated");
                    }
                }
                result = tokio::signal::ctrl_c() => {
                    result.context("listening for shutdown signal")?;
                    info!("shutting down");
                    break;
                }
            }
        }

        self.stop_monitor().await;
        self.save().await;
        Ok(())
    }
}

/// Consume parsed monitor events, applying each to the model. Events
/// that change nothing produce neither a save nor a refresh signal.
async fn event_loop<C: HypervisorControl>(
    client: C,
    model: SharedModel,
    refresh: RefreshSignal,
    state_file: PathBuf,
    mut rx: mpsc::Receiver<MonitorEvent>,
) {
    while let Some(event) = rx.recv().await {
        match apply_event(&client, &model, event).await {
            Ok(true) => {
                refresh.notify();
                let snapshot = model.read().await.clone();
                if let Err(e) = save_model(&state_file, &snapshot) {
                    error!(error = %e, "failed to persist fleet state after event");
                }
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "failed to apply monitor event"),
        }
    }
    debug!("event loop finished");
}

/// Apply one decoded monitor event to the fleet model. Returns whether
/// the model changed.
pub(crate) async fn apply_event<C: HypervisorControl>(
    client: &C,
    model: &SharedModel,
    event: MonitorEvent,
) -> Result<bool, EngineError> {
    match event {
        MonitorEvent::StateChanged { machine_id, state } => {
            // Running machines get their configured address fetched; the
            // fetch happens before taking the write lock.
            let address = if state.has_address() {
                match client.machine_info(&machine_id).await {
                    Ok(info) => info.address,
                    Err(e) => {
                        debug!(machine = %machine_id, error = %e, "address fetch failed");
                        None
                    }
                }
            } else {
                None
            };

            let mut model = model.write().await;
            let Some(machine) = model.find_machine_mut(&machine_id) else {
                debug!(machine = %machine_id, "state change for unknown machine");
                return Ok(false);
            };
            let mut changed = machine.status != state;
            machine.status = state;
            match state {
                MachineStatus::Running => {
                    if machine.address != address {
                        machine.address = address;
                        changed = true;
                    }
                }
                MachineStatus::Stopped | MachineStatus::Suspended => {
                    if machine.address.take().is_some() {
                        changed = true;
                    }
                }
                _ => {}
            }
            Ok(changed)
        }

        MonitorEvent::Added { machine_id } => {
            let info = client.machine_info(&machine_id).await?;
            let mut model = model.write().await;
            // A re-registered machine goes back to its previous group.
            let group_id = model
                .find_machine(&machine_id)
                .map(|m| m.group_id.clone())
                .unwrap_or_else(|| UNGROUPED_ID.to_string());

            let mut machine =
                Machine::new(info.canonical_id(), info.name.clone(), info.decoded_status());
            machine.address = if machine.status.has_address() {
                info.address.clone()
            } else {
                None
            };
            machine.hidden = false;
            model.add_machine(&group_id, machine);
            info!(machine = %machine_id, "machine added");
            Ok(true)
        }

        MonitorEvent::Unregistered { machine_id } => {
            let removed = model.write().await.remove_machine(&machine_id).is_some();
            if removed {
                info!(machine = %machine_id, "machine unregistered");
            }
            Ok(removed)
        }

        MonitorEvent::SnapshotsChanged { machine_id } => {
            // Snapshot data is not embedded in the event; re-fetch the
            // machine record to keep it current.
            let info = client.machine_info(&machine_id).await?;
            let status = info.decoded_status();
            let address = if status.has_address() {
                info.address.clone()
            } else {
                None
            };
            let mut model = model.write().await;
            let Some(machine) = model.find_machine_mut(&machine_id) else {
                return Ok(false);
            };
            let changed = machine.name != info.name
                || machine.status != status
                || machine.address != address;
            machine.name = info.name;
            machine.status = status;
            machine.address = address;
            Ok(changed)
        }

        MonitorEvent::Unknown { machine_id, name } => {
            debug!(machine = %machine_id, event = %name, "ignoring unrecognized event");
            Ok(false)
        }
    }
}

/// Load the persisted fleet model; `Ok(None)` when no state file exists.
fn load_model(path: &Path) -> Result<Option<FleetModel>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading state file: {}", path.display()))?;
    let persisted: PersistedFleet = serde_json::from_str(&content)
        .with_context(|| format!("parsing state file: {}", path.display()))?;
    Ok(Some(persisted.model))
}

/// Persist the fleet model as pretty JSON, creating parent directories.
fn save_model(path: &Path, model: &FleetModel) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating state directory: {}", parent.display()))?;
        }
    }
    let persisted = PersistedFleet {
        schema_version: PersistedFleet::SCHEMA_VERSION,
        model: model.clone(),
    };
    let json = serde_json::to_string_pretty(&persisted).context("serializing fleet state")?;
    std::fs::write(path, json)
        .with_context(|| format!("writing state file: {}", path.display()))?;
    Ok(())
}
