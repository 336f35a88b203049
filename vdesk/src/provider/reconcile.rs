//! One-directional reconciliation of stored records against backend truth.
//!
//! The backend is authoritative. A stored record whose resource no longer
//! exists is removed; a record whose live `addr`/`status` drifted is
//! overwritten, unless its address is reserved (static addresses survive
//! stop/start and must not be clobbered by a transient listing). Local
//! records never cause backend resources to be created.

use crate::instance::{DesktopInstance, InstanceStatus};
use crate::store::FileStore;

/// One live backend resource, as reported by a provider's listing call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveResource {
    /// Backend-side identity; matched against `DesktopInstance::resource_name`
    /// (falling back to the instance name for process-backed providers).
    pub resource_name: String,
    pub addr: String,
    pub status: InstanceStatus,
}

/// Outcome of diffing the full record list against the live listing.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Records whose backend resource vanished.
    pub remove: Vec<DesktopInstance>,
    /// Records already patched with the live `addr`/`status`.
    pub update: Vec<DesktopInstance>,
}

impl ReconcilePlan {
    /// `true` when the store already matches the backend.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.update.is_empty()
    }
}

/// What a `refresh` pass actually changed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSummary {
    pub removed: usize,
    pub updated: usize,
}

impl RefreshSummary {
    /// `true` when the pass mutated nothing.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.removed == 0 && self.updated == 0
    }
}

/// Diff every stored record against the live listing.
///
/// Pure; call it again on the diffed result and the plan is empty, which is
/// what makes `refresh` idempotent.
#[must_use]
pub fn diff(records: Vec<DesktopInstance>, live: &[LiveResource]) -> ReconcilePlan {
    let mut plan = ReconcilePlan::default();
    for mut record in records {
        let match_key = record
            .resource_name
            .clone()
            .unwrap_or_else(|| record.name.clone());
        match live.iter().find(|l| l.resource_name == match_key) {
            None => plan.remove.push(record),
            Some(resource) => {
                if record.reserved_ip {
                    continue;
                }
                if record.addr != resource.addr || record.status != resource.status {
                    record.addr = resource.addr.clone();
                    record.status = resource.status;
                    plan.update.push(record);
                }
            }
        }
    }
    plan
}

/// Write a plan back to the store.
///
/// Per-record failures are logged and skipped so one bad record never
/// aborts the pass.
pub fn apply(store: &FileStore<DesktopInstance>, plan: &ReconcilePlan) -> RefreshSummary {
    let mut summary = RefreshSummary::default();
    for record in &plan.remove {
        match store.remove(&record.id) {
            Ok(_) => {
                tracing::info!(name = %record.name, "removing record for vanished resource");
                summary.removed += 1;
            }
            Err(e) => tracing::warn!(name = %record.name, error = %e, "failed to remove record"),
        }
    }
    for record in &plan.update {
        match store.upsert(record) {
            Ok(()) => {
                tracing::info!(name = %record.name, addr = %record.addr, status = %record.status, "updating drifted record");
                summary.updated += 1;
            }
            Err(e) => tracing::warn!(name = %record.name, error = %e, "failed to update record"),
        }
    }
    summary
}

/// Full reconciliation pass for one provider kind: load its records, diff
/// against `live`, apply.
///
/// # Errors
///
/// Returns an error only if the record store cannot be read.
pub fn run(
    store: &FileStore<DesktopInstance>,
    kind: crate::instance::ProviderKind,
    live: &[LiveResource],
) -> crate::error::Result<RefreshSummary> {
    let records: Vec<DesktopInstance> = store
        .load()?
        .into_iter()
        .filter(|r| r.provider.kind == kind)
        .collect();
    let plan = diff(records, live);
    Ok(apply(store, &plan))
}
