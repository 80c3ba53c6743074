//! In-memory [`Store`] backed by maps behind one `tokio::sync::RwLock`.
//!
//! Not durable. Every mutation takes the write lock for its whole duration,
//! so multi-step operations such as the pending-invitation check or the
//! family cascade are atomic within the process. Used by tests and local runs.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{Store, StoreError, StoreResult};
use crate::permissions::RecordFilter;
use crate::types::{
    Family, FamilyId, FamilyMembership, Invitation, InvitationStatus, NewOrganization,
    Organization, RecordId, ResourceKind, ResourceLink, ResourceRow, Role, User,
};

#[derive(Debug, Default)]
struct Inner {
    counters: HashMap<&'static str, i64>,
    users: HashMap<String, User>,
    organizations: BTreeMap<i64, Organization>,
    families: BTreeMap<FamilyId, Family>,
    memberships: BTreeMap<i64, FamilyMembership>,
    invitations: HashMap<Uuid, Invitation>,
    records: BTreeMap<(ResourceKind, RecordId), ResourceRow>,
    links: BTreeMap<(RecordId, RecordId), ResourceLink>,
}

impl Inner {
    fn next_id(&mut self, counter: &'static str) -> i64 {
        let next = self.counters.entry(counter).or_insert(0);
        *next += 1;
        *next
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_user(&self, user_id: &str) -> StoreResult<Option<User>> {
        Ok(self.inner.read().await.users.get(user_id).cloned())
    }

    async fn put_user(&self, user: User) -> StoreResult<User> {
        self.inner
            .write()
            .await
            .users
            .insert(user.user_id.clone(), user.clone());
        Ok(user)
    }

    async fn create_organization(&self, org: NewOrganization) -> StoreResult<Organization> {
        let mut inner = self.inner.write().await;
        let organization = Organization {
            id: inner.next_id("organization"),
            name: org.name,
            org_type: org.org_type,
            requires_teacher_oversight: org.requires_teacher_oversight,
            created_at: Utc::now(),
        };
        inner
            .organizations
            .insert(organization.id, organization.clone());
        Ok(organization)
    }

    async fn get_organization(&self, id: i64) -> StoreResult<Option<Organization>> {
        Ok(self.inner.read().await.organizations.get(&id).cloned())
    }

    async fn create_family(&self, name: &str, organization_id: Option<i64>) -> StoreResult<Family> {
        let mut inner = self.inner.write().await;
        if let Some(org_id) = organization_id {
            if !inner.organizations.contains_key(&org_id) {
                return Err(StoreError::NotFound(format!("organization {org_id}")));
            }
        }
        let family = Family {
            id: inner.next_id("family"),
            name: name.to_string(),
            organization_id,
            created_at: Utc::now(),
        };
        inner.families.insert(family.id, family.clone());
        Ok(family)
    }

    async fn get_family(&self, id: FamilyId) -> StoreResult<Option<Family>> {
        Ok(self.inner.read().await.families.get(&id).cloned())
    }

    async fn delete_family(&self, id: FamilyId) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if inner.families.remove(&id).is_none() {
            return Err(StoreError::NotFound(format!("family {id}")));
        }
        inner.memberships.retain(|_, m| m.family_id != id);
        inner.invitations.retain(|_, i| i.family_id != id);
        for row in inner.records.values_mut() {
            if row.family_id == Some(id) {
                row.family_id = None;
            }
        }
        Ok(())
    }

    async fn add_membership(
        &self,
        user_id: &str,
        family_id: FamilyId,
        role: Role,
    ) -> StoreResult<FamilyMembership> {
        let mut inner = self.inner.write().await;
        if !inner.families.contains_key(&family_id) {
            return Err(StoreError::NotFound(format!("family {family_id}")));
        }
        if inner
            .memberships
            .values()
            .any(|m| m.user_id == user_id && m.family_id == family_id)
        {
            return Err(StoreError::Conflict(format!(
                "user {user_id} already belongs to family {family_id}"
            )));
        }
        let membership = FamilyMembership {
            id: inner.next_id("membership"),
            user_id: user_id.to_string(),
            family_id,
            role,
            created_at: Utc::now(),
        };
        inner.memberships.insert(membership.id, membership.clone());
        Ok(membership)
    }

    async fn get_membership(
        &self,
        user_id: &str,
        family_id: FamilyId,
    ) -> StoreResult<Option<FamilyMembership>> {
        Ok(self
            .inner
            .read()
            .await
            .memberships
            .values()
            .find(|m| m.user_id == user_id && m.family_id == family_id)
            .cloned())
    }

    async fn memberships_for_user(&self, user_id: &str) -> StoreResult<Vec<FamilyMembership>> {
        Ok(self
            .inner
            .read()
            .await
            .memberships
            .values()
            .filter(|m| m.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn memberships_for_family(
        &self,
        family_id: FamilyId,
    ) -> StoreResult<Vec<FamilyMembership>> {
        Ok(self
            .inner
            .read()
            .await
            .memberships
            .values()
            .filter(|m| m.family_id == family_id)
            .cloned()
            .collect())
    }

    async fn remove_membership(&self, user_id: &str, family_id: FamilyId) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let before = inner.memberships.len();
        inner
            .memberships
            .retain(|_, m| !(m.user_id == user_id && m.family_id == family_id));
        if inner.memberships.len() == before {
            return Err(StoreError::NotFound(format!(
                "membership {user_id} in family {family_id}"
            )));
        }
        Ok(())
    }

    async fn insert_invitation(&self, invitation: Invitation) -> StoreResult<Invitation> {
        let mut inner = self.inner.write().await;
        if !inner.families.contains_key(&invitation.family_id) {
            return Err(StoreError::NotFound(format!(
                "family {}",
                invitation.family_id
            )));
        }
        if invitation.status == InvitationStatus::Pending
            && inner.invitations.values().any(|i| {
                i.status == InvitationStatus::Pending
                    && i.family_id == invitation.family_id
                    && i.email == invitation.email
            })
        {
            return Err(StoreError::Conflict(format!(
                "pending invitation for {} in family {}",
                invitation.email, invitation.family_id
            )));
        }
        inner.invitations.insert(invitation.id, invitation.clone());
        Ok(invitation)
    }

    async fn get_invitation(&self, id: Uuid) -> StoreResult<Option<Invitation>> {
        Ok(self.inner.read().await.invitations.get(&id).cloned())
    }

    async fn update_invitation(&self, invitation: &Invitation) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        match inner.invitations.get_mut(&invitation.id) {
            Some(existing) => {
                *existing = invitation.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("invitation {}", invitation.id))),
        }
    }

    async fn list_invitations(
        &self,
        family_id: FamilyId,
        status: Option<InvitationStatus>,
    ) -> StoreResult<Vec<Invitation>> {
        let mut invitations: Vec<_> = self
            .inner
            .read()
            .await
            .invitations
            .values()
            .filter(|i| i.family_id == family_id && status.map_or(true, |s| i.status == s))
            .cloned()
            .collect();
        invitations.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(invitations)
    }

    async fn insert_record(&self, mut row: ResourceRow) -> StoreResult<ResourceRow> {
        let mut inner = self.inner.write().await;
        row.id = inner.next_id(row.kind.as_str());
        inner.records.insert((row.kind, row.id), row.clone());
        Ok(row)
    }

    async fn get_record(&self, kind: ResourceKind, id: RecordId) -> StoreResult<Option<ResourceRow>> {
        Ok(self.inner.read().await.records.get(&(kind, id)).cloned())
    }

    async fn update_record(&self, row: &ResourceRow) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        match inner.records.get_mut(&(row.kind, row.id)) {
            Some(existing) => {
                *existing = row.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("{} {}", row.kind.as_str(), row.id))),
        }
    }

    async fn delete_record(&self, kind: ResourceKind, id: RecordId) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if inner.records.remove(&(kind, id)).is_none() {
            return Err(StoreError::NotFound(format!("{} {id}", kind.as_str())));
        }
        if kind == ResourceKind::Assignment {
            inner.links.retain(|(assignment_id, _), _| *assignment_id != id);
        }
        Ok(())
    }

    async fn insert_resource_link(&self, mut link: ResourceLink) -> StoreResult<ResourceLink> {
        let mut inner = self.inner.write().await;
        if !inner
            .records
            .contains_key(&(ResourceKind::Assignment, link.assignment_id))
        {
            return Err(StoreError::NotFound(format!("assignment {}", link.assignment_id)));
        }
        link.id = inner.next_id("resource_link");
        inner
            .links
            .insert((link.assignment_id, link.id), link.clone());
        Ok(link)
    }

    async fn resource_links_for(&self, assignment_id: RecordId) -> StoreResult<Vec<ResourceLink>> {
        let inner = self.inner.read().await;
        let mut links: Vec<_> = inner
            .links
            .range((assignment_id, RecordId::MIN)..=(assignment_id, RecordId::MAX))
            .map(|(_, link)| link.clone())
            .collect();
        links.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(links)
    }

    async fn delete_resource_link(
        &self,
        assignment_id: RecordId,
        link_id: RecordId,
    ) -> StoreResult<()> {
        match self.inner.write().await.links.remove(&(assignment_id, link_id)) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(format!("resource link {link_id}"))),
        }
    }

    async fn list_records(
        &self,
        kind: ResourceKind,
        filter: &RecordFilter,
    ) -> StoreResult<Vec<ResourceRow>> {
        if filter.is_empty() {
            return Ok(Vec::new());
        }
        let inner = self.inner.read().await;
        Ok(inner
            .records
            .range((kind, RecordId::MIN)..=(kind, RecordId::MAX))
            .map(|(_, row)| row)
            .filter(|row| filter.matches(*row))
            .cloned()
            .collect())
    }

    async fn record_owners(&self) -> StoreResult<BTreeSet<String>> {
        Ok(self
            .inner
            .read()
            .await
            .records
            .values()
            .map(|row| row.owner_id.clone())
            .collect())
    }

    async fn assign_family_where_null(
        &self,
        owner_id: &str,
        family_id: FamilyId,
    ) -> StoreResult<usize> {
        let mut inner = self.inner.write().await;
        let mut changed = 0;
        for row in inner.records.values_mut() {
            if row.owner_id == owner_id && row.family_id.is_none() {
                row.family_id = Some(family_id);
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn clear_record_families(&self) -> StoreResult<usize> {
        let mut inner = self.inner.write().await;
        let mut changed = 0;
        for row in inner.records.values_mut() {
            if row.family_id.take().is_some() {
                changed += 1;
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(kind: ResourceKind, owner: &str, family_id: Option<FamilyId>) -> ResourceRow {
        ResourceRow {
            kind,
            id: 0,
            owner_id: owner.to_string(),
            family_id,
            data: json!({}),
        }
    }

    #[tokio::test]
    async fn duplicate_membership_conflicts() {
        let store = InMemoryStore::new();
        let family = store.create_family("Smith Family", None).await.unwrap();
        store.add_membership("u", family.id, Role::Parent).await.unwrap();

        let err = store
            .add_membership("u", family.id, Role::Teacher)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn membership_ids_increase() {
        let store = InMemoryStore::new();
        let a = store.create_family("A", None).await.unwrap();
        let b = store.create_family("B", None).await.unwrap();
        store.add_membership("u", b.id, Role::Teacher).await.unwrap();
        store.add_membership("u", a.id, Role::Parent).await.unwrap();

        let families: Vec<_> = store
            .memberships_for_user("u")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.family_id)
            .collect();
        assert_eq!(families, vec![b.id, a.id]);
    }

    #[tokio::test]
    async fn second_pending_invitation_conflicts() {
        let store = InMemoryStore::new();
        let family = store.create_family("Smith Family", None).await.unwrap();
        let now = Utc::now();
        store
            .insert_invitation(Invitation::new("t@x.com".into(), family.id, "p".into(), now))
            .await
            .unwrap();

        let err = store
            .insert_invitation(Invitation::new("t@x.com".into(), family.id, "p".into(), now))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn deleting_a_family_cascades() {
        let store = InMemoryStore::new();
        let family = store.create_family("Smith Family", None).await.unwrap();
        store.add_membership("p", family.id, Role::Parent).await.unwrap();
        let invite = store
            .insert_invitation(Invitation::new("t@x.com".into(), family.id, "p".into(), Utc::now()))
            .await
            .unwrap();
        let record = store
            .insert_record(row(ResourceKind::Student, "p", Some(family.id)))
            .await
            .unwrap();

        store.delete_family(family.id).await.unwrap();

        assert!(store.memberships_for_user("p").await.unwrap().is_empty());
        assert!(store.get_invitation(invite.id).await.unwrap().is_none());
        let record = store
            .get_record(ResourceKind::Student, record.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.family_id, None);
    }

    #[tokio::test]
    async fn list_records_is_per_kind_and_filtered() {
        let store = InMemoryStore::new();
        let family = store.create_family("Smith Family", None).await.unwrap();
        store
            .insert_record(row(ResourceKind::Student, "p", Some(family.id)))
            .await
            .unwrap();
        store
            .insert_record(row(ResourceKind::Student, "q", None))
            .await
            .unwrap();
        store
            .insert_record(row(ResourceKind::Curriculum, "p", Some(family.id)))
            .await
            .unwrap();

        let filter = RecordFilter::new(BTreeSet::from([family.id]), Some("p".into()));
        let students = store
            .list_records(ResourceKind::Student, &filter)
            .await
            .unwrap();
        assert_eq!(students.len(), 1);
        assert_eq!(students[0].family_id, Some(family.id));

        let nothing = store
            .list_records(ResourceKind::Student, &RecordFilter::default())
            .await
            .unwrap();
        assert!(nothing.is_empty());
    }

    #[tokio::test]
    async fn assign_family_touches_only_null_rows() {
        let store = InMemoryStore::new();
        let a = store.create_family("A", None).await.unwrap();
        let b = store.create_family("B", None).await.unwrap();
        store
            .insert_record(row(ResourceKind::Student, "p", None))
            .await
            .unwrap();
        store
            .insert_record(row(ResourceKind::Assignment, "p", Some(b.id)))
            .await
            .unwrap();

        assert_eq!(store.assign_family_where_null("p", a.id).await.unwrap(), 1);
        assert_eq!(store.assign_family_where_null("p", a.id).await.unwrap(), 0);
        assert_eq!(store.clear_record_families().await.unwrap(), 2);
    }

    fn link(assignment_id: RecordId, url: &str) -> ResourceLink {
        ResourceLink {
            id: 0,
            assignment_id,
            url: url.to_string(),
            label: String::new(),
            link_type: Default::default(),
            window_start: None,
            window_end: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn links_go_away_with_their_assignment() {
        let store = InMemoryStore::new();
        let first = store
            .insert_record(row(ResourceKind::Assignment, "p", None))
            .await
            .unwrap();
        let second = store
            .insert_record(row(ResourceKind::Assignment, "p", None))
            .await
            .unwrap();
        store.insert_resource_link(link(first.id, "https://a.test")).await.unwrap();
        store.insert_resource_link(link(first.id, "https://b.test")).await.unwrap();
        let kept = store.insert_resource_link(link(second.id, "https://c.test")).await.unwrap();

        let urls: Vec<_> = store
            .resource_links_for(first.id)
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.url)
            .collect();
        assert_eq!(urls, vec!["https://a.test", "https://b.test"]);

        store.delete_record(ResourceKind::Assignment, first.id).await.unwrap();
        assert!(store.resource_links_for(first.id).await.unwrap().is_empty());
        assert_eq!(store.resource_links_for(second.id).await.unwrap(), vec![kept]);

        let err = store.insert_resource_link(link(first.id, "https://d.test")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
