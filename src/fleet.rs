use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::status::MachineStatus;

/// Identifier of the distinguished "ungrouped" group. It is created
/// lazily on first need and is the default home for any machine not
/// explicitly assigned elsewhere.
pub const UNGROUPED_ID: &str = "ungrouped";
pub const UNGROUPED_NAME: &str = "Ungrouped";

/// Shared handle to the fleet model. Mutations are synchronous and the
/// write lock is never held across an await, which keeps single-writer
/// consistency even though many tasks interleave.
pub type SharedModel = Arc<RwLock<FleetModel>>;

/// One managed virtual machine and its last-known state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Machine {
    /// Opaque identifier assigned by the hypervisor; immutable.
    pub id: String,
    /// Display name; mutable via rename.
    pub name: String,
    pub status: MachineStatus,
    /// Configured network address, present only while running.
    pub address: Option<String>,
    pub hidden: bool,
    /// Identifier of the owning group.
    pub group_id: String,
    pub first_seen: DateTime<Utc>,
}

impl Machine {
    pub fn new(id: impl Into<String>, name: impl Into<String>, status: MachineStatus) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status,
            address: None,
            hidden: false,
            group_id: UNGROUPED_ID.to_string(),
            first_seen: Utc::now(),
        }
    }
}

/// A named, optionally nested collection of machines and sub-groups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub hidden: bool,
    /// Identifier of the parent group, None for top-level groups.
    pub parent: Option<String>,
    /// Materialized path: ancestor names joined with '/'.
    pub path: String,
    pub machines: Vec<Machine>,
    pub children: Vec<Group>,
}

impl Group {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: Uuid::new_v4().to_string(),
            path: name.clone(),
            name,
            hidden: false,
            parent: None,
            machines: Vec::new(),
            children: Vec::new(),
        }
    }

    fn ungrouped() -> Self {
        Self {
            id: UNGROUPED_ID.to_string(),
            name: UNGROUPED_NAME.to_string(),
            hidden: false,
            parent: None,
            path: UNGROUPED_NAME.to_string(),
            machines: Vec::new(),
            children: Vec::new(),
        }
    }

    fn matches(&self, id_or_name: &str) -> bool {
        self.id.eq_ignore_ascii_case(id_or_name) || self.name.eq_ignore_ascii_case(id_or_name)
    }
}

/// The in-memory hierarchical record of all known groups and machines.
///
/// Pure data plus invariants, no I/O. Every machine belongs to exactly
/// one group at all times; group membership forms a tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetModel {
    groups: Vec<Group>,
    /// When set, each group's machine list is kept alphabetically sorted
    /// by name; otherwise insertion order is preserved.
    #[serde(default)]
    sort_alphabetically: bool,
}

impl FleetModel {
    pub fn new(sort_alphabetically: bool) -> Self {
        Self {
            groups: Vec::new(),
            sort_alphabetically,
        }
    }

    /// Top-level groups, in order.
    pub fn top_level(&self) -> &[Group] {
        &self.groups
    }

    /// The ungrouped group, created on first need.
    fn ensure_ungrouped(&mut self) {
        if !self.groups.iter().any(|g| g.id == UNGROUPED_ID) {
            self.groups.push(Group::ungrouped());
        }
    }

    /// Insert a machine into the given group, or replace an existing
    /// machine with the same identifier or name (case-insensitive) in
    /// place. Replacement is idempotent; duplicates are never an error.
    /// Falls back to the ungrouped group when the target group is gone.
    pub fn add_machine(&mut self, group_id: &str, mut machine: Machine) {
        // A machine lives in exactly one group; drop any copy held
        // elsewhere before inserting.
        let target_id = match self.group(group_id) {
            Some(g) => g.id.clone(),
            None => {
                self.ensure_ungrouped();
                UNGROUPED_ID.to_string()
            }
        };
        let moved = self
            .find_machine(&machine.id)
            .map(|m| !m.group_id.eq_ignore_ascii_case(&target_id))
            .unwrap_or(false);
        if moved {
            let id = machine.id.clone();
            self.remove_machine(&id);
        }

        let sort = self.sort_alphabetically;
        let Some(group) = self.group_mut(&target_id) else {
            return;
        };
        machine.group_id = group.id.clone();

        let slot = group.machines.iter().position(|m| {
            m.id.eq_ignore_ascii_case(&machine.id) || m.name.eq_ignore_ascii_case(&machine.name)
        });
        match slot {
            Some(i) => group.machines[i] = machine,
            None => group.machines.push(machine),
        }
        if sort {
            group
                .machines
                .sort_by(|a, b| a.name.to_ascii_lowercase().cmp(&b.name.to_ascii_lowercase()));
        }
    }

    /// Remove the machine with the given identifier from whichever group
    /// holds it. No-op if absent; returns the removed machine.
    pub fn remove_machine(&mut self, id: &str) -> Option<Machine> {
        fn walk(groups: &mut [Group], id: &str) -> Option<Machine> {
            for group in groups {
                if let Some(i) = group
                    .machines
                    .iter()
                    .position(|m| m.id.eq_ignore_ascii_case(id))
                {
                    return Some(group.machines.remove(i));
                }
                if let Some(m) = walk(&mut group.children, id) {
                    return Some(m);
                }
            }
            None
        }
        walk(&mut self.groups, id)
    }

    /// Add a group under the given parent (None or an unknown parent id
    /// makes it top-level). A group with the same name or identifier
    /// already present at that level is replaced in place, keeping its
    /// machines and children.
    pub fn add_group(&mut self, parent_id: Option<&str>, mut group: Group) {
        let parent_info = parent_id
            .and_then(|p| self.group(p))
            .map(|g| (g.id.clone(), g.path.clone()));

        match parent_info {
            Some((pid, prefix)) => {
                group.parent = Some(pid.clone());
                group.path = format!("{}/{}", prefix, group.name);
                if let Some(parent) = self.group_mut(&pid) {
                    insert_group(&mut parent.children, group);
                }
            }
            None => {
                group.parent = None;
                group.path = group.name.clone();
                insert_group(&mut self.groups, group);
            }
        }
    }

    /// Remove a group, reassigning every machine in its subtree to the
    /// ungrouped group. Machines are never dropped by a group removal.
    /// No-op if absent (or if asked to remove the ungrouped group itself).
    pub fn remove_group(&mut self, id: &str) {
        if id.eq_ignore_ascii_case(UNGROUPED_ID) {
            return;
        }

        fn detach(groups: &mut Vec<Group>, id: &str) -> Option<Group> {
            if let Some(i) = groups.iter().position(|g| g.id.eq_ignore_ascii_case(id)) {
                return Some(groups.remove(i));
            }
            for group in groups {
                if let Some(g) = detach(&mut group.children, id) {
                    return Some(g);
                }
            }
            None
        }

        fn drain_machines(group: Group, out: &mut Vec<Machine>) {
            out.extend(group.machines);
            for child in group.children {
                drain_machines(child, out);
            }
        }

        let Some(removed) = detach(&mut self.groups, id) else {
            return;
        };
        let mut orphans = Vec::new();
        drain_machines(removed, &mut orphans);
        for machine in orphans {
            self.add_machine(UNGROUPED_ID, machine);
        }
    }

    /// Case-insensitive lookup by identifier or name.
    pub fn find_machine(&self, id_or_name: &str) -> Option<&Machine> {
        self.all_machines().into_iter().find(|m| {
            m.id.eq_ignore_ascii_case(id_or_name) || m.name.eq_ignore_ascii_case(id_or_name)
        })
    }

    pub fn find_machine_mut(&mut self, id_or_name: &str) -> Option<&mut Machine> {
        fn walk<'a>(groups: &'a mut [Group], key: &str) -> Option<&'a mut Machine> {
            for group in groups {
                if let Some(i) = group.machines.iter().position(|m| {
                    m.id.eq_ignore_ascii_case(key) || m.name.eq_ignore_ascii_case(key)
                }) {
                    return Some(&mut group.machines[i]);
                }
                if let Some(m) = walk(&mut group.children, key) {
                    return Some(m);
                }
            }
            None
        }
        walk(&mut self.groups, id_or_name)
    }

    /// Case-insensitive group lookup by identifier or name.
    pub fn find_group(&self, id_or_name: &str) -> Option<&Group> {
        self.all_groups()
            .into_iter()
            .find(|g| g.matches(id_or_name))
    }

    pub fn find_group_mut(&mut self, id_or_name: &str) -> Option<&mut Group> {
        fn walk<'a>(groups: &'a mut [Group], key: &str) -> Option<&'a mut Group> {
            for group in groups {
                if group.matches(key) {
                    return Some(group);
                }
                if let Some(g) = walk(&mut group.children, key) {
                    return Some(g);
                }
            }
            None
        }
        walk(&mut self.groups, id_or_name)
    }

    fn group(&self, id: &str) -> Option<&Group> {
        self.all_groups()
            .into_iter()
            .find(|g| g.id.eq_ignore_ascii_case(id))
    }

    fn group_mut(&mut self, id: &str) -> Option<&mut Group> {
        fn walk<'a>(groups: &'a mut [Group], id: &str) -> Option<&'a mut Group> {
            for group in groups {
                if group.id.eq_ignore_ascii_case(id) {
                    return Some(group);
                }
                if let Some(g) = walk(&mut group.children, id) {
                    return Some(g);
                }
            }
            None
        }
        walk(&mut self.groups, id)
    }

    /// Flatten the tree into all machines, depth-first.
    pub fn all_machines(&self) -> Vec<&Machine> {
        fn walk<'a>(groups: &'a [Group], out: &mut Vec<&'a Machine>) {
            for group in groups {
                out.extend(group.machines.iter());
                walk(&group.children, out);
            }
        }
        let mut out = Vec::new();
        walk(&self.groups, &mut out);
        out
    }

    /// Flatten the tree into all groups, depth-first.
    pub fn all_groups(&self) -> Vec<&Group> {
        fn walk<'a>(groups: &'a [Group], out: &mut Vec<&'a Group>) {
            for group in groups {
                out.push(group);
                walk(&group.children, out);
            }
        }
        let mut out = Vec::new();
        walk(&self.groups, &mut out);
        out
    }

    /// Identifiers of all machines currently in the model.
    pub fn machine_ids(&self) -> Vec<String> {
        self.all_machines().iter().map(|m| m.id.clone()).collect()
    }

    /// Replace this model's contents from a persisted one, keeping the
    /// configured sort mode.
    pub fn restore(&mut self, persisted: FleetModel) {
        self.groups = persisted.groups;
    }

    #[cfg(test)]
    fn assert_single_membership(&self) {
        let machines = self.all_machines();
        for m in &machines {
            let owners = machines
                .iter()
                .filter(|other| other.id.eq_ignore_ascii_case(&m.id))
                .count();
            assert_eq!(owners, 1, "machine {} belongs to {} groups", m.id, owners);
        }
    }
}

/// Insert a group among siblings, replacing an existing sibling with the
/// same name or identifier (case-insensitive) in place while keeping its
/// machines and children. Only identity fields change on replacement.
fn insert_group(siblings: &mut Vec<Group>, mut group: Group) {
    let slot = siblings.iter().position(|g| {
        g.id.eq_ignore_ascii_case(&group.id) || g.name.eq_ignore_ascii_case(&group.name)
    });
    match slot {
        Some(i) => {
            let old = &mut siblings[i];
            group.machines = std::mem::take(&mut old.machines);
            group.children = std::mem::take(&mut old.children);
            siblings[i] = group;
        }
        None => siblings.push(group),
    }
}

/// Persisted fleet state (serialized to JSON on disk).
#[derive(Debug, Serialize, Deserialize)]
pub struct PersistedFleet {
    /// Schema version for forward-compatible state file migrations.
    #[serde(default)]
    pub schema_version: u32,
    pub model: FleetModel,
}

impl PersistedFleet {
    pub const SCHEMA_VERSION: u32 = 1;
}

/// A point-in-time checkpoint of a machine. Fetched on demand from the
/// control tool; never stored in the fleet model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    /// Parent snapshot identifier; None for roots of the tree.
    pub parent: Option<String>,
    pub name: String,
    /// At most one snapshot per machine is current.
    pub current: bool,
}
