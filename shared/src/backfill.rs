//! Migration from single-owner records to family-owned records.
//!
//! For every user who owns at least one student, curriculum or assignment,
//! make sure a family with a parent membership exists, then stamp that
//! family onto the user's records that have none. Running it again changes
//! nothing, and a run interrupted halfway is finished by the next one.

use serde::Serialize;

use crate::families::family_name_for_user;
use crate::permissions::Access;
use crate::store::{Store, StoreResult};
use crate::types::{Family, Role};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    /// Distinct record owners seen.
    pub owners: usize,
    pub families_created: usize,
    pub records_updated: usize,
}

pub async fn backfill_families<S: Store + ?Sized>(store: &S) -> StoreResult<BackfillReport> {
    let owners = store.record_owners().await?;
    let mut report = BackfillReport {
        owners: owners.len(),
        ..Default::default()
    };

    for owner_id in &owners {
        let access = Access::load(store, owner_id).await?;
        let existing = match access.first_family_with_role(Role::Parent) {
            Some(family_id) => store.get_family(family_id).await?,
            None => None,
        };

        let family = match existing {
            Some(family) => family,
            None => {
                let family = create_family_for(store, owner_id).await?;
                report.families_created += 1;
                family
            }
        };

        let updated = store.assign_family_where_null(owner_id, family.id).await?;
        if updated > 0 {
            tracing::info!(
                "Assigned {} records of {} to family {}",
                updated,
                owner_id,
                family.id
            );
        }
        report.records_updated += updated;
    }

    tracing::info!(
        "Backfill finished: {} owners, {} families created, {} records updated",
        report.owners,
        report.families_created,
        report.records_updated
    );
    Ok(report)
}

/// Undoes [`backfill_families`] by clearing the family of every record.
/// Families and memberships are left in place.
pub async fn reverse_backfill<S: Store + ?Sized>(store: &S) -> StoreResult<usize> {
    let cleared = store.clear_record_families().await?;
    tracing::info!("Reverse backfill cleared the family of {} records", cleared);
    Ok(cleared)
}

async fn create_family_for<S: Store + ?Sized>(store: &S, owner_id: &str) -> StoreResult<Family> {
    let profile = store.get_user(owner_id).await?;
    let family = store
        .create_family(&family_name_for_user(owner_id, profile.as_ref()), None)
        .await?;
    store
        .add_membership(owner_id, family.id, Role::Parent)
        .await?;
    tracing::info!("Created family {} ({}) for {}", family.id, family.name, owner_id);
    Ok(family)
}
