//! Persistence seam for families, memberships, invitations and owned records.
//!
//! Two backends implement [`Store`]: [`memory::InMemoryStore`] for tests and
//! local runs, and [`dynamo::DynamoStore`] for the single-table DynamoDB
//! deployment.

use std::collections::BTreeSet;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::permissions::RecordFilter;
use crate::types::{
    Family, FamilyId, FamilyMembership, Invitation, InvitationStatus, NewOrganization,
    Organization, RecordId, ResourceKind, ResourceLink, ResourceRow, Role, User,
};

pub mod dynamo;
pub mod memory;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait Store: Send + Sync {
    async fn get_user(&self, user_id: &str) -> StoreResult<Option<User>>;
    async fn put_user(&self, user: User) -> StoreResult<User>;

    async fn create_organization(&self, org: NewOrganization) -> StoreResult<Organization>;
    async fn get_organization(&self, id: i64) -> StoreResult<Option<Organization>>;

    async fn create_family(&self, name: &str, organization_id: Option<i64>) -> StoreResult<Family>;
    async fn get_family(&self, id: FamilyId) -> StoreResult<Option<Family>>;
    /// Removes the family with its memberships and invitations. Records tagged
    /// with the family fall back to legacy (null family) ownership.
    async fn delete_family(&self, id: FamilyId) -> StoreResult<()>;

    /// Fails with [`StoreError::Conflict`] if the user already belongs to the family.
    async fn add_membership(
        &self,
        user_id: &str,
        family_id: FamilyId,
        role: Role,
    ) -> StoreResult<FamilyMembership>;
    async fn get_membership(
        &self,
        user_id: &str,
        family_id: FamilyId,
    ) -> StoreResult<Option<FamilyMembership>>;
    /// Memberships of one user ordered by ascending membership id.
    async fn memberships_for_user(&self, user_id: &str) -> StoreResult<Vec<FamilyMembership>>;
    /// Memberships of one family ordered by ascending membership id.
    async fn memberships_for_family(&self, family_id: FamilyId)
        -> StoreResult<Vec<FamilyMembership>>;
    async fn remove_membership(&self, user_id: &str, family_id: FamilyId) -> StoreResult<()>;

    /// Fails with [`StoreError::Conflict`] while another pending invitation
    /// exists for the same `(email, family)`.
    async fn insert_invitation(&self, invitation: Invitation) -> StoreResult<Invitation>;
    async fn get_invitation(&self, id: Uuid) -> StoreResult<Option<Invitation>>;
    async fn update_invitation(&self, invitation: &Invitation) -> StoreResult<()>;
    async fn list_invitations(
        &self,
        family_id: FamilyId,
        status: Option<InvitationStatus>,
    ) -> StoreResult<Vec<Invitation>>;

    /// Assigns the next id of the row's kind and stores it.
    async fn insert_record(&self, row: ResourceRow) -> StoreResult<ResourceRow>;
    async fn get_record(&self, kind: ResourceKind, id: RecordId) -> StoreResult<Option<ResourceRow>>;
    async fn update_record(&self, row: &ResourceRow) -> StoreResult<()>;
    /// Deleting an assignment also removes its resource links.
    async fn delete_record(&self, kind: ResourceKind, id: RecordId) -> StoreResult<()>;
    /// Rows of one kind matching the filter, ordered by id.
    async fn list_records(
        &self,
        kind: ResourceKind,
        filter: &RecordFilter,
    ) -> StoreResult<Vec<ResourceRow>>;

    /// Assigns the next link id and stores it.
    async fn insert_resource_link(&self, link: ResourceLink) -> StoreResult<ResourceLink>;
    /// Links of one assignment, oldest first.
    async fn resource_links_for(&self, assignment_id: RecordId) -> StoreResult<Vec<ResourceLink>>;
    async fn delete_resource_link(&self, assignment_id: RecordId, link_id: RecordId)
        -> StoreResult<()>;

    /// Distinct owner ids across every record kind.
    async fn record_owners(&self) -> StoreResult<BTreeSet<String>>;
    /// Tags every null-family record of the owner with `family_id` and returns
    /// how many rows changed. Rows that already carry a family are untouched.
    async fn assign_family_where_null(&self, owner_id: &str, family_id: FamilyId)
        -> StoreResult<usize>;
    /// Clears the family of every record and returns how many rows changed.
    async fn clear_record_families(&self) -> StoreResult<usize>;
}
