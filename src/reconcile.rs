use tracing::{debug, info};

use crate::control::HypervisorControl;
use crate::error::EngineError;
use crate::fleet::{Machine, SharedModel, UNGROUPED_ID};
use crate::signal::RefreshSignal;

/// Merge a fresh authoritative listing into the fleet model.
///
/// Every machine in the listing is inserted or updated into whichever
/// group it is currently recorded as belonging to (ungrouped for newly
/// seen machines); every machine the model knows but the listing lacks
/// is removed. The listing always wins over stale in-memory state; this
/// is the self-healing backstop for event monitor downtime or missed
/// events.
///
/// Returns whether the model changed, and signals the UI if it did.
pub async fn reconcile<C: HypervisorControl>(
    client: &C,
    model: &SharedModel,
    refresh: &RefreshSignal,
) -> Result<bool, EngineError> {
    let listing = client.list_all().await?;
    debug!(machines = listing.len(), "reconciling fleet from full listing");

    let mut changed = false;
    {
        let mut model = model.write().await;

        for entry in &listing {
            let id = entry.canonical_id();
            let status = entry.decoded_status();
            let address = if status.has_address() {
                entry.address.clone()
            } else {
                None
            };

            let (group_id, hidden, first_seen, unchanged) = match model.find_machine(&id) {
                Some(existing) => (
                    existing.group_id.clone(),
                    existing.hidden,
                    existing.first_seen,
                    existing.name == entry.name
                        && existing.status == status
                        && existing.address == address,
                ),
                None => (UNGROUPED_ID.to_string(), false, chrono::Utc::now(), false),
            };
            if unchanged {
                continue;
            }

            let mut machine = Machine::new(id, entry.name.clone(), status);
            machine.address = address;
            machine.hidden = hidden;
            machine.first_seen = first_seen;
            model.add_machine(&group_id, machine);
            changed = true;
        }

        // Machines the hypervisor no longer reports leave the model.
        let fresh_ids: Vec<String> = listing.iter().map(|l| l.canonical_id()).collect();
        let stale: Vec<String> = model
            .machine_ids()
            .into_iter()
            .filter(|known| !fresh_ids.iter().any(|f| f.eq_ignore_ascii_case(known)))
            .collect();
        for id in stale {
            info!(machine = %id, "machine no longer reported; removing from model");
            model.remove_machine(&id);
            changed = true;
        }
    }

    if changed {
        refresh.notify();
    }
    Ok(changed)
}
