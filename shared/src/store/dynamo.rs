//! Single-table DynamoDB [`Store`].
//!
//! Key layout:
//!
//! | PK                    | SK                         | item                         |
//! |-----------------------|----------------------------|------------------------------|
//! | `USER#{id}`           | `USER#{id}`                | user profile                 |
//! | `USER#{id}`           | `MEMBERSHIP#{padded id}`   | membership, by user          |
//! | `ORG#{id}`            | `METADATA`                 | organization                 |
//! | `FAMILY#{id}`         | `METADATA`                 | family                       |
//! | `FAMILY#{id}`         | `MEMBER#{user id}`         | membership, by family        |
//! | `FAMILY#{id}`         | `INVITE#{uuid}`            | invitation, by family        |
//! | `FAMILY#{id}`         | `PENDING_INVITE#{email}`   | one-pending-invite guard     |
//! | `INVITE#{uuid}`       | `METADATA`                 | invitation                   |
//! | `RECORD#{kind}#{id}`  | `METADATA`                 | student, curriculum, assignment |
//! | `RECORD#assignment#{id}` | `LINK#{padded id}`      | resource link of an assignment |
//! | `COUNTER#{name}`      | `COUNTER`                  | id sequence                  |
//!
//! Uniqueness rules (one membership per user and family, one pending
//! invitation per email and family) are enforced with conditional writes
//! inside a single transaction.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Debug;

use anyhow::anyhow;
use async_trait::async_trait;
use aws_sdk_dynamodb::types::{
    AttributeValue, Delete, DeleteRequest, Put, ReturnValue, TransactWriteItem, WriteRequest,
};
use aws_sdk_dynamodb::Client as DynamoClient;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{Store, StoreError, StoreResult};
use crate::permissions::RecordFilter;
use crate::types::{
    Family, FamilyId, FamilyMembership, Invitation, InvitationStatus, NewOrganization, OrgType,
    LinkType, Organization, RecordId, ResourceKind, ResourceLink, ResourceRow, Role, User,
};

type Item = HashMap<String, AttributeValue>;

const METADATA: &str = "METADATA";
const BATCH_SIZE: usize = 25;
const MAX_BATCH_ATTEMPTS: u32 = 5;
const MAX_IN_OPERANDS: usize = 100;

#[derive(Debug, Clone)]
pub struct DynamoStore {
    client: DynamoClient,
    table_name: String,
}

impl DynamoStore {
    pub fn new(client: DynamoClient, table_name: impl Into<String>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
        }
    }

    async fn next_id(&self, counter: &str) -> StoreResult<i64> {
        let result = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .key("PK", s(format!("COUNTER#{counter}")))
            .key("SK", s("COUNTER"))
            .update_expression("ADD next_id :one")
            .expression_attribute_values(":one", n(1))
            .return_values(ReturnValue::UpdatedNew)
            .send()
            .await
            .map_err(|e| unexpected("increment counter", e))?;

        let attributes = result
            .attributes()
            .ok_or_else(|| StoreError::Unexpected(anyhow!("counter {counter} returned nothing")))?;
        get_n(attributes, "next_id")
    }

    async fn get_item(&self, pk: String, sk: &str) -> StoreResult<Option<Item>> {
        let result = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("PK", s(pk))
            .key("SK", s(sk))
            .send()
            .await
            .map_err(|e| unexpected("get item", e))?;
        Ok(result.item)
    }

    async fn put_item(&self, item: Item) -> StoreResult<()> {
        self.client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(item))
            .send()
            .await
            .map_err(|e| unexpected("put item", e))?;
        Ok(())
    }

    /// Every item of a partition whose sort key starts with `sk_prefix`.
    async fn query_prefix(&self, pk: String, sk_prefix: &str) -> StoreResult<Vec<Item>> {
        let mut items = Vec::new();
        let mut start_key = None;
        loop {
            let result = self
                .client
                .query()
                .table_name(&self.table_name)
                .key_condition_expression("PK = :pk AND begins_with(SK, :sk_prefix)")
                .expression_attribute_values(":pk", s(pk.clone()))
                .expression_attribute_values(":sk_prefix", s(sk_prefix))
                .set_exclusive_start_key(start_key)
                .send()
                .await
                .map_err(|e| unexpected("query", e))?;

            items.extend(result.items.unwrap_or_default());
            start_key = result.last_evaluated_key;
            if start_key.is_none() {
                return Ok(items);
            }
        }
    }

    async fn scan(&self, expression: &Expression) -> StoreResult<Vec<Item>> {
        let mut items = Vec::new();
        let mut start_key = None;
        loop {
            let result = self
                .client
                .scan()
                .table_name(&self.table_name)
                .filter_expression(&expression.filter)
                .set_expression_attribute_names(Some(expression.names.clone()))
                .set_expression_attribute_values(Some(expression.values.clone()))
                .set_exclusive_start_key(start_key)
                .send()
                .await
                .map_err(|e| unexpected("scan", e))?;

            items.extend(result.items.unwrap_or_default());
            start_key = result.last_evaluated_key;
            if start_key.is_none() {
                return Ok(items);
            }
        }
    }

    fn put(&self, item: Item, condition: Option<&str>) -> StoreResult<TransactWriteItem> {
        let put = Put::builder()
            .table_name(&self.table_name)
            .set_item(Some(item))
            .set_condition_expression(condition.map(str::to_string))
            .build()
            .map_err(|e| unexpected("build put", e))?;
        Ok(TransactWriteItem::builder().put(put).build())
    }

    fn delete(&self, key: Item) -> StoreResult<TransactWriteItem> {
        let delete = Delete::builder()
            .table_name(&self.table_name)
            .set_key(Some(key))
            .build()
            .map_err(|e| unexpected("build delete", e))?;
        Ok(TransactWriteItem::builder().delete(delete).build())
    }

    /// Runs the writes atomically. A failed condition surfaces as
    /// [`StoreError::Conflict`] with the given description.
    async fn transact(&self, items: Vec<TransactWriteItem>, conflict: String) -> StoreResult<()> {
        match self
            .client
            .transact_write_items()
            .set_transact_items(Some(items))
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e)
                if e
                    .as_service_error()
                    .is_some_and(|se| se.is_transaction_canceled_exception()) =>
            {
                Err(StoreError::Conflict(conflict))
            }
            Err(e) => Err(unexpected("transact write", e)),
        }
    }

    /// Deletes in chunks of 25, retrying unprocessed keys with a linear backoff.
    async fn batch_delete(&self, keys: Vec<Item>) -> StoreResult<()> {
        for chunk in keys.chunks(BATCH_SIZE) {
            let requests = chunk
                .iter()
                .map(|key| {
                    DeleteRequest::builder()
                        .set_key(Some(key.clone()))
                        .build()
                        .map(|request| WriteRequest::builder().delete_request(request).build())
                        .map_err(|e| unexpected("build delete request", e))
                })
                .collect::<StoreResult<Vec<_>>>()?;

            let mut attempts = 0;
            let mut unprocessed = Some(requests);
            while let Some(requests) = unprocessed.take() {
                attempts += 1;
                if attempts > MAX_BATCH_ATTEMPTS {
                    return Err(StoreError::Unexpected(anyhow!(
                        "{} deletes still unprocessed after {} attempts",
                        requests.len(),
                        MAX_BATCH_ATTEMPTS
                    )));
                }

                let result = self
                    .client
                    .batch_write_item()
                    .request_items(&self.table_name, requests)
                    .send()
                    .await
                    .map_err(|e| unexpected("batch delete", e))?;

                unprocessed = result
                    .unprocessed_items
                    .and_then(|mut items| items.remove(&self.table_name))
                    .filter(|items| !items.is_empty());

                if let Some(pending) = &unprocessed {
                    tracing::warn!(
                        "Retrying {} unprocessed deletes (attempt {})",
                        pending.len(),
                        attempts
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(100 * u64::from(attempts)))
                        .await;
                }
            }
        }
        Ok(())
    }

    /// Sets or removes the family column of one record. With `only_if_null`
    /// the write is skipped when the row already carries a family; returns
    /// whether the row changed.
    async fn set_record_family(
        &self,
        key: Item,
        family_id: Option<FamilyId>,
        only_if_null: bool,
    ) -> StoreResult<bool> {
        let mut request = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .set_key(Some(key))
            .expression_attribute_names("#family", "family_id");

        request = match family_id {
            Some(family_id) => request
                .update_expression("SET #family = :family")
                .expression_attribute_values(":family", n(family_id)),
            None => request.update_expression("REMOVE #family"),
        };
        if only_if_null {
            request = request.condition_expression("attribute_not_exists(#family)");
        }

        match request.send().await {
            Ok(_) => Ok(true),
            Err(e)
                if e
                    .as_service_error()
                    .is_some_and(|se| se.is_conditional_check_failed_exception()) =>
            {
                Ok(false)
            }
            Err(e) => Err(unexpected("update record family", e)),
        }
    }

    async fn release_pending_guard(&self, invitation: &Invitation) -> StoreResult<()> {
        let result = self
            .client
            .delete_item()
            .table_name(&self.table_name)
            .key("PK", s(family_pk(invitation.family_id)))
            .key("SK", s(pending_guard_sk(&invitation.email)))
            .condition_expression("invite_id = :id")
            .expression_attribute_values(":id", s(invitation.id.to_string()))
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            // The guard already belongs to a newer invitation.
            Err(e)
                if e
                    .as_service_error()
                    .is_some_and(|se| se.is_conditional_check_failed_exception()) =>
            {
                Ok(())
            }
            Err(e) => Err(unexpected("release pending invitation guard", e)),
        }
    }
}

#[async_trait]
impl Store for DynamoStore {
    async fn get_user(&self, user_id: &str) -> StoreResult<Option<User>> {
        let pk = user_pk(user_id);
        self.get_item(pk.clone(), &pk)
            .await?
            .map(|item| item_to_user(&item))
            .transpose()
    }

    async fn put_user(&self, user: User) -> StoreResult<User> {
        let pk = user_pk(&user.user_id);
        let item = HashMap::from([
            ("PK".to_string(), s(pk.clone())),
            ("SK".to_string(), s(pk)),
            ("entity_type".to_string(), s("user")),
            ("user_id".to_string(), s(user.user_id.clone())),
            ("email".to_string(), s(user.email.clone())),
            ("first_name".to_string(), s(user.first_name.clone())),
            ("last_name".to_string(), s(user.last_name.clone())),
            ("created_at".to_string(), s(user.created_at.to_rfc3339())),
        ]);
        self.put_item(item).await?;
        Ok(user)
    }

    async fn create_organization(&self, org: NewOrganization) -> StoreResult<Organization> {
        let organization = Organization {
            id: self.next_id("organization").await?,
            name: org.name,
            org_type: org.org_type,
            requires_teacher_oversight: org.requires_teacher_oversight,
            created_at: Utc::now(),
        };
        let item = HashMap::from([
            ("PK".to_string(), s(format!("ORG#{}", organization.id))),
            ("SK".to_string(), s(METADATA)),
            ("entity_type".to_string(), s("organization")),
            ("org_id".to_string(), n(organization.id)),
            ("name".to_string(), s(organization.name.clone())),
            ("org_type".to_string(), s(org_type_str(organization.org_type))),
            (
                "requires_teacher_oversight".to_string(),
                AttributeValue::Bool(organization.requires_teacher_oversight),
            ),
            ("created_at".to_string(), s(organization.created_at.to_rfc3339())),
        ]);
        self.put_item(item).await?;
        Ok(organization)
    }

    async fn get_organization(&self, id: i64) -> StoreResult<Option<Organization>> {
        self.get_item(format!("ORG#{id}"), METADATA)
            .await?
            .map(|item| item_to_organization(&item))
            .transpose()
    }

    async fn create_family(&self, name: &str, organization_id: Option<i64>) -> StoreResult<Family> {
        if let Some(org_id) = organization_id {
            if self.get_organization(org_id).await?.is_none() {
                return Err(StoreError::NotFound(format!("organization {org_id}")));
            }
        }

        let family = Family {
            id: self.next_id("family").await?,
            name: name.to_string(),
            organization_id,
            created_at: Utc::now(),
        };
        let mut item = HashMap::from([
            ("PK".to_string(), s(family_pk(family.id))),
            ("SK".to_string(), s(METADATA)),
            ("entity_type".to_string(), s("family")),
            ("family_id".to_string(), n(family.id)),
            ("name".to_string(), s(family.name.clone())),
            ("created_at".to_string(), s(family.created_at.to_rfc3339())),
        ]);
        if let Some(org_id) = organization_id {
            item.insert("organization_id".to_string(), n(org_id));
        }
        self.put_item(item).await?;
        Ok(family)
    }

    async fn get_family(&self, id: FamilyId) -> StoreResult<Option<Family>> {
        self.get_item(family_pk(id), METADATA)
            .await?
            .map(|item| item_to_family(&item))
            .transpose()
    }

    async fn delete_family(&self, id: FamilyId) -> StoreResult<()> {
        if self.get_family(id).await?.is_none() {
            return Err(StoreError::NotFound(format!("family {id}")));
        }

        let pk = family_pk(id);
        let mut keys = vec![key(pk.clone(), METADATA)];
        for item in self.query_prefix(pk.clone(), "MEMBER#").await? {
            let membership = item_to_membership(&item)?;
            keys.push(key_of(&item)?);
            keys.push(key(user_pk(&membership.user_id), membership_sk(membership.id)));
        }
        for item in self.query_prefix(pk.clone(), "INVITE#").await? {
            let invitation = item_to_invitation(&item)?;
            keys.push(key_of(&item)?);
            keys.push(key(invite_pk(invitation.id), METADATA));
        }
        for item in self.query_prefix(pk, "PENDING_INVITE#").await? {
            keys.push(key_of(&item)?);
        }
        tracing::info!("Deleting family {} ({} items)", id, keys.len());
        self.batch_delete(keys).await?;

        let tagged = Expression::records()
            .and("#family = :family")
            .name("#family", "family_id")
            .value(":family", n(id));
        for item in self.scan(&tagged).await? {
            self.set_record_family(key_of(&item)?, None, false).await?;
        }
        Ok(())
    }

    async fn add_membership(
        &self,
        user_id: &str,
        family_id: FamilyId,
        role: Role,
    ) -> StoreResult<FamilyMembership> {
        if self.get_family(family_id).await?.is_none() {
            return Err(StoreError::NotFound(format!("family {family_id}")));
        }

        let membership = FamilyMembership {
            id: self.next_id("membership").await?,
            user_id: user_id.to_string(),
            family_id,
            role,
            created_at: Utc::now(),
        };
        let by_user = membership_item(&membership, user_pk(user_id), membership_sk(membership.id));
        let by_family = membership_item(&membership, family_pk(family_id), member_sk(user_id));

        self.transact(
            vec![
                self.put(by_user, None)?,
                self.put(by_family, Some("attribute_not_exists(PK)"))?,
            ],
            format!("user {user_id} already belongs to family {family_id}"),
        )
        .await?;
        Ok(membership)
    }

    async fn get_membership(
        &self,
        user_id: &str,
        family_id: FamilyId,
    ) -> StoreResult<Option<FamilyMembership>> {
        self.get_item(family_pk(family_id), &member_sk(user_id))
            .await?
            .map(|item| item_to_membership(&item))
            .transpose()
    }

    async fn memberships_for_user(&self, user_id: &str) -> StoreResult<Vec<FamilyMembership>> {
        // Zero-padded sort keys keep the query in membership id order.
        self.query_prefix(user_pk(user_id), "MEMBERSHIP#")
            .await?
            .iter()
            .map(item_to_membership)
            .collect()
    }

    async fn memberships_for_family(
        &self,
        family_id: FamilyId,
    ) -> StoreResult<Vec<FamilyMembership>> {
        let mut memberships = self
            .query_prefix(family_pk(family_id), "MEMBER#")
            .await?
            .iter()
            .map(item_to_membership)
            .collect::<StoreResult<Vec<_>>>()?;
        memberships.sort_by_key(|m| m.id);
        Ok(memberships)
    }

    async fn remove_membership(&self, user_id: &str, family_id: FamilyId) -> StoreResult<()> {
        let membership = self
            .get_membership(user_id, family_id)
            .await?
            .ok_or_else(|| {
                StoreError::NotFound(format!("membership {user_id} in family {family_id}"))
            })?;

        self.transact(
            vec![
                self.delete(key(family_pk(family_id), member_sk(user_id)))?,
                self.delete(key(user_pk(user_id), membership_sk(membership.id)))?,
            ],
            format!("membership {user_id} in family {family_id} changed concurrently"),
        )
        .await
    }

    async fn insert_invitation(&self, invitation: Invitation) -> StoreResult<Invitation> {
        if self.get_family(invitation.family_id).await?.is_none() {
            return Err(StoreError::NotFound(format!(
                "family {}",
                invitation.family_id
            )));
        }

        let mut writes = vec![
            self.put(
                invitation_item(&invitation, invite_pk(invitation.id), METADATA.to_string()),
                Some("attribute_not_exists(PK)"),
            )?,
            self.put(
                invitation_item(
                    &invitation,
                    family_pk(invitation.family_id),
                    invite_sk(invitation.id),
                ),
                None,
            )?,
        ];
        if invitation.status == InvitationStatus::Pending {
            let guard = HashMap::from([
                ("PK".to_string(), s(family_pk(invitation.family_id))),
                ("SK".to_string(), s(pending_guard_sk(&invitation.email))),
                ("invite_id".to_string(), s(invitation.id.to_string())),
            ]);
            writes.push(self.put(guard, Some("attribute_not_exists(PK)"))?);
        }

        self.transact(
            writes,
            format!(
                "pending invitation for {} in family {}",
                invitation.email, invitation.family_id
            ),
        )
        .await?;
        Ok(invitation)
    }

    async fn get_invitation(&self, id: Uuid) -> StoreResult<Option<Invitation>> {
        self.get_item(invite_pk(id), METADATA)
            .await?
            .map(|item| item_to_invitation(&item))
            .transpose()
    }

    async fn update_invitation(&self, invitation: &Invitation) -> StoreResult<()> {
        if self.get_invitation(invitation.id).await?.is_none() {
            return Err(StoreError::NotFound(format!("invitation {}", invitation.id)));
        }

        self.transact(
            vec![
                self.put(
                    invitation_item(invitation, invite_pk(invitation.id), METADATA.to_string()),
                    None,
                )?,
                self.put(
                    invitation_item(
                        invitation,
                        family_pk(invitation.family_id),
                        invite_sk(invitation.id),
                    ),
                    None,
                )?,
            ],
            format!("invitation {} changed concurrently", invitation.id),
        )
        .await?;

        if invitation.status != InvitationStatus::Pending {
            self.release_pending_guard(invitation).await?;
        }
        Ok(())
    }

    async fn list_invitations(
        &self,
        family_id: FamilyId,
        status: Option<InvitationStatus>,
    ) -> StoreResult<Vec<Invitation>> {
        let mut invitations = self
            .query_prefix(family_pk(family_id), "INVITE#")
            .await?
            .iter()
            .map(item_to_invitation)
            .collect::<StoreResult<Vec<_>>>()?;
        invitations.retain(|i| status.map_or(true, |s| i.status == s));
        invitations.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(invitations)
    }

    async fn insert_record(&self, mut row: ResourceRow) -> StoreResult<ResourceRow> {
        row.id = self.next_id(row.kind.as_str()).await?;
        self.put_item(record_item(&row)?).await?;
        Ok(row)
    }

    async fn get_record(&self, kind: ResourceKind, id: RecordId) -> StoreResult<Option<ResourceRow>> {
        self.get_item(record_pk(kind, id), METADATA)
            .await?
            .map(|item| item_to_record(&item))
            .transpose()
    }

    async fn update_record(&self, row: &ResourceRow) -> StoreResult<()> {
        let result = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(record_item(row)?))
            .condition_expression("attribute_exists(PK)")
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e)
                if e
                    .as_service_error()
                    .is_some_and(|se| se.is_conditional_check_failed_exception()) =>
            {
                Err(StoreError::NotFound(format!("{} {}", row.kind.as_str(), row.id)))
            }
            Err(e) => Err(unexpected("update record", e)),
        }
    }

    async fn delete_record(&self, kind: ResourceKind, id: RecordId) -> StoreResult<()> {
        let result = self
            .client
            .delete_item()
            .table_name(&self.table_name)
            .key("PK", s(record_pk(kind, id)))
            .key("SK", s(METADATA))
            .condition_expression("attribute_exists(PK)")
            .send()
            .await;

        match result {
            Ok(_) => {}
            Err(e)
                if e
                    .as_service_error()
                    .is_some_and(|se| se.is_conditional_check_failed_exception()) =>
            {
                return Err(StoreError::NotFound(format!("{} {id}", kind.as_str())));
            }
            Err(e) => return Err(unexpected("delete record", e)),
        }

        if kind == ResourceKind::Assignment {
            let links = self
                .query_prefix(record_pk(kind, id), "LINK#")
                .await?
                .iter()
                .map(key_of)
                .collect::<StoreResult<Vec<_>>>()?;
            if !links.is_empty() {
                tracing::info!("Removing {} links of assignment {}", links.len(), id);
                self.batch_delete(links).await?;
            }
        }
        Ok(())
    }

    async fn insert_resource_link(&self, mut link: ResourceLink) -> StoreResult<ResourceLink> {
        if self
            .get_item(record_pk(ResourceKind::Assignment, link.assignment_id), METADATA)
            .await?
            .is_none()
        {
            return Err(StoreError::NotFound(format!("assignment {}", link.assignment_id)));
        }
        link.id = self.next_id("resource_link").await?;
        self.put_item(link_item(&link)).await?;
        Ok(link)
    }

    async fn resource_links_for(&self, assignment_id: RecordId) -> StoreResult<Vec<ResourceLink>> {
        let mut links = self
            .query_prefix(record_pk(ResourceKind::Assignment, assignment_id), "LINK#")
            .await?
            .iter()
            .map(item_to_link)
            .collect::<StoreResult<Vec<_>>>()?;
        links.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(links)
    }

    async fn delete_resource_link(
        &self,
        assignment_id: RecordId,
        link_id: RecordId,
    ) -> StoreResult<()> {
        let result = self
            .client
            .delete_item()
            .table_name(&self.table_name)
            .key("PK", s(record_pk(ResourceKind::Assignment, assignment_id)))
            .key("SK", s(link_sk(link_id)))
            .condition_expression("attribute_exists(PK)")
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e)
                if e
                    .as_service_error()
                    .is_some_and(|se| se.is_conditional_check_failed_exception()) =>
            {
                Err(StoreError::NotFound(format!("resource link {link_id}")))
            }
            Err(e) => Err(unexpected("delete resource link", e)),
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

        let mut rows = self
            .scan(&Expression::records_matching(kind, filter))
            .await?
            .iter()
            .map(item_to_record)
            .collect::<StoreResult<Vec<_>>>()?;
        rows.sort_by_key(|row| row.id);
        Ok(rows)
    }

    async fn record_owners(&self) -> StoreResult<BTreeSet<String>> {
        self.scan(&Expression::records())
            .await?
            .iter()
            .map(|item| get_s(item, "owner_id").map(str::to_string))
            .collect()
    }

    async fn assign_family_where_null(
        &self,
        owner_id: &str,
        family_id: FamilyId,
    ) -> StoreResult<usize> {
        let legacy = Expression::records()
            .and("#owner = :owner AND attribute_not_exists(#family)")
            .name("#owner", "owner_id")
            .name("#family", "family_id")
            .value(":owner", s(owner_id));

        let mut changed = 0;
        for item in self.scan(&legacy).await? {
            if self
                .set_record_family(key_of(&item)?, Some(family_id), true)
                .await?
            {
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn clear_record_families(&self) -> StoreResult<usize> {
        let tagged = Expression::records()
            .and("attribute_exists(#family)")
            .name("#family", "family_id");

        let mut changed = 0;
        for item in self.scan(&tagged).await? {
            self.set_record_family(key_of(&item)?, None, false).await?;
            changed += 1;
        }
        Ok(changed)
    }
}

/// Scan filter with its placeholder maps.
#[derive(Debug, Clone)]
struct Expression {
    filter: String,
    names: HashMap<String, String>,
    values: Item,
}

impl Expression {
    fn records() -> Self {
        Self {
            filter: "#entity = :entity".to_string(),
            names: HashMap::from([("#entity".to_string(), "entity_type".to_string())]),
            values: HashMap::from([(":entity".to_string(), s("record"))]),
        }
    }

    /// `family IN (...) OR (family missing AND owner = ...)` for one kind.
    fn records_matching(kind: ResourceKind, filter: &RecordFilter) -> Self {
        let mut expression = Self::records()
            .and("#kind = :kind")
            .name("#kind", "kind")
            .value(":kind", s(kind.as_str()))
            .name("#family", "family_id");

        // DynamoDB caps an IN list at 100 operands.
        let families: Vec<FamilyId> = filter.families().iter().copied().collect();
        let mut clauses = Vec::new();
        for (chunk_index, chunk) in families.chunks(MAX_IN_OPERANDS).enumerate() {
            let placeholders: Vec<String> = chunk
                .iter()
                .enumerate()
                .map(|(i, family_id)| {
                    let placeholder = format!(":f{}", chunk_index * MAX_IN_OPERANDS + i);
                    expression.values.insert(placeholder.clone(), n(*family_id));
                    placeholder
                })
                .collect();
            clauses.push(format!("#family IN ({})", placeholders.join(", ")));
        }
        if let Some(owner) = filter.legacy_owner() {
            expression = expression
                .name("#owner", "owner_id")
                .value(":owner", s(owner));
            clauses.push("(attribute_not_exists(#family) AND #owner = :owner)".to_string());
        }

        expression.and(&format!("({})", clauses.join(" OR ")))
    }

    fn and(mut self, clause: &str) -> Self {
        self.filter = format!("{} AND {}", self.filter, clause);
        self
    }

    fn name(mut self, placeholder: &str, attribute: &str) -> Self {
        self.names
            .insert(placeholder.to_string(), attribute.to_string());
        self
    }

    fn value(mut self, placeholder: &str, value: AttributeValue) -> Self {
        self.values.insert(placeholder.to_string(), value);
        self
    }
}

// ========== KEYS ==========

fn user_pk(user_id: &str) -> String {
    format!("USER#{user_id}")
}

fn family_pk(family_id: FamilyId) -> String {
    format!("FAMILY#{family_id}")
}

fn invite_pk(id: Uuid) -> String {
    format!("INVITE#{id}")
}

fn invite_sk(id: Uuid) -> String {
    format!("INVITE#{id}")
}

fn member_sk(user_id: &str) -> String {
    format!("MEMBER#{user_id}")
}

fn membership_sk(membership_id: i64) -> String {
    format!("MEMBERSHIP#{membership_id:020}")
}

fn pending_guard_sk(email: &str) -> String {
    format!("PENDING_INVITE#{email}")
}

fn record_pk(kind: ResourceKind, id: RecordId) -> String {
    format!("RECORD#{}#{id}", kind.as_str())
}

fn link_sk(link_id: RecordId) -> String {
    format!("LINK#{link_id:020}")
}

fn key(pk: String, sk: impl Into<String>) -> Item {
    HashMap::from([("PK".to_string(), s(pk)), ("SK".to_string(), s(sk))])
}

fn key_of(item: &Item) -> StoreResult<Item> {
    Ok(key(
        get_s(item, "PK")?.to_string(),
        get_s(item, "SK")?.to_string(),
    ))
}

// ========== ATTRIBUTES ==========

fn s(value: impl Into<String>) -> AttributeValue {
    AttributeValue::S(value.into())
}

fn n(value: i64) -> AttributeValue {
    AttributeValue::N(value.to_string())
}

fn unexpected(context: &str, err: impl Debug) -> StoreError {
    StoreError::Unexpected(anyhow!("{context}: {err:?}"))
}

fn get_s<'a>(item: &'a Item, name: &str) -> StoreResult<&'a str> {
    item.get(name)
        .and_then(|v| v.as_s().ok())
        .map(String::as_str)
        .ok_or_else(|| StoreError::Unexpected(anyhow!("item is missing string attribute {name}")))
}

fn get_opt_n(item: &Item, name: &str) -> StoreResult<Option<i64>> {
    item.get(name)
        .and_then(|v| v.as_n().ok())
        .map(|raw| {
            raw.parse::<i64>()
                .map_err(|e| StoreError::Unexpected(anyhow!("attribute {name} is not an integer: {e}")))
        })
        .transpose()
}

fn get_n(item: &Item, name: &str) -> StoreResult<i64> {
    get_opt_n(item, name)?
        .ok_or_else(|| StoreError::Unexpected(anyhow!("item is missing number attribute {name}")))
}

fn parse_time(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Unexpected(anyhow!("bad timestamp {raw}: {e}")))
}

fn get_time(item: &Item, name: &str) -> StoreResult<DateTime<Utc>> {
    parse_time(get_s(item, name)?)
}

fn get_opt_time(item: &Item, name: &str) -> StoreResult<Option<DateTime<Utc>>> {
    item.get(name)
        .and_then(|v| v.as_s().ok())
        .map(|raw| parse_time(raw))
        .transpose()
}

fn org_type_str(org_type: OrgType) -> &'static str {
    match org_type {
        OrgType::Charter => "charter",
        OrgType::StateProgram => "state_program",
        OrgType::CoOp => "co_op",
        OrgType::Private => "private",
        OrgType::Other => "other",
    }
}

fn parse_org_type(raw: &str) -> StoreResult<OrgType> {
    match raw {
        "charter" => Ok(OrgType::Charter),
        "state_program" => Ok(OrgType::StateProgram),
        "co_op" => Ok(OrgType::CoOp),
        "private" => Ok(OrgType::Private),
        "other" => Ok(OrgType::Other),
        other => Err(StoreError::Unexpected(anyhow!("unknown org type {other}"))),
    }
}

// ========== ITEM CONVERSIONS ==========

fn item_to_user(item: &Item) -> StoreResult<User> {
    Ok(User {
        user_id: get_s(item, "user_id")?.to_string(),
        email: get_s(item, "email")?.to_string(),
        first_name: get_s(item, "first_name").unwrap_or_default().to_string(),
        last_name: get_s(item, "last_name").unwrap_or_default().to_string(),
        created_at: get_time(item, "created_at")?,
    })
}

fn item_to_organization(item: &Item) -> StoreResult<Organization> {
    Ok(Organization {
        id: get_n(item, "org_id")?,
        name: get_s(item, "name")?.to_string(),
        org_type: parse_org_type(get_s(item, "org_type")?)?,
        requires_teacher_oversight: item
            .get("requires_teacher_oversight")
            .and_then(|v| v.as_bool().ok())
            .copied()
            .unwrap_or(false),
        created_at: get_time(item, "created_at")?,
    })
}

fn item_to_family(item: &Item) -> StoreResult<Family> {
    Ok(Family {
        id: get_n(item, "family_id")?,
        name: get_s(item, "name")?.to_string(),
        organization_id: get_opt_n(item, "organization_id")?,
        created_at: get_time(item, "created_at")?,
    })
}

fn membership_item(membership: &FamilyMembership, pk: String, sk: String) -> Item {
    HashMap::from([
        ("PK".to_string(), s(pk)),
        ("SK".to_string(), s(sk)),
        ("entity_type".to_string(), s("membership")),
        ("membership_id".to_string(), n(membership.id)),
        ("user_id".to_string(), s(membership.user_id.clone())),
        ("family_id".to_string(), n(membership.family_id)),
        ("role".to_string(), s(membership.role.as_str())),
        ("created_at".to_string(), s(membership.created_at.to_rfc3339())),
    ])
}

fn item_to_membership(item: &Item) -> StoreResult<FamilyMembership> {
    let role = get_s(item, "role")?;
    Ok(FamilyMembership {
        id: get_n(item, "membership_id")?,
        user_id: get_s(item, "user_id")?.to_string(),
        family_id: get_n(item, "family_id")?,
        role: Role::parse(role)
            .ok_or_else(|| StoreError::Unexpected(anyhow!("unknown role {role}")))?,
        created_at: get_time(item, "created_at")?,
    })
}

fn invitation_item(invitation: &Invitation, pk: String, sk: String) -> Item {
    let mut item = HashMap::from([
        ("PK".to_string(), s(pk)),
        ("SK".to_string(), s(sk)),
        ("entity_type".to_string(), s("invitation")),
        ("invite_id".to_string(), s(invitation.id.to_string())),
        ("email".to_string(), s(invitation.email.clone())),
        ("family_id".to_string(), n(invitation.family_id)),
        ("invited_by".to_string(), s(invitation.invited_by.clone())),
        ("role".to_string(), s(invitation.role.as_str())),
        ("status".to_string(), s(invitation.status.as_str())),
        ("created_at".to_string(), s(invitation.created_at.to_rfc3339())),
    ]);
    if let Some(accepted_at) = invitation.accepted_at {
        item.insert("accepted_at".to_string(), s(accepted_at.to_rfc3339()));
    }
    if let Some(resent_at) = invitation.resent_at {
        item.insert("resent_at".to_string(), s(resent_at.to_rfc3339()));
    }
    item
}

fn item_to_invitation(item: &Item) -> StoreResult<Invitation> {
    let raw_id = get_s(item, "invite_id")?;
    let role = get_s(item, "role")?;
    let status = get_s(item, "status")?;
    Ok(Invitation {
        id: Uuid::parse_str(raw_id)
            .map_err(|e| StoreError::Unexpected(anyhow!("bad invite id {raw_id}: {e}")))?,
        email: get_s(item, "email")?.to_string(),
        family_id: get_n(item, "family_id")?,
        invited_by: get_s(item, "invited_by")?.to_string(),
        role: Role::parse(role)
            .ok_or_else(|| StoreError::Unexpected(anyhow!("unknown role {role}")))?,
        status: InvitationStatus::parse(status)
            .ok_or_else(|| StoreError::Unexpected(anyhow!("unknown invite status {status}")))?,
        created_at: get_time(item, "created_at")?,
        accepted_at: get_opt_time(item, "accepted_at")?,
        resent_at: get_opt_time(item, "resent_at")?,
    })
}

fn record_item(row: &ResourceRow) -> StoreResult<Item> {
    let data = serde_json::to_string(&row.data)
        .map_err(|e| StoreError::Unexpected(anyhow!("serialize record data: {e}")))?;
    let mut item = HashMap::from([
        ("PK".to_string(), s(record_pk(row.kind, row.id))),
        ("SK".to_string(), s(METADATA)),
        ("entity_type".to_string(), s("record")),
        ("kind".to_string(), s(row.kind.as_str())),
        ("record_id".to_string(), n(row.id)),
        ("owner_id".to_string(), s(row.owner_id.clone())),
        ("data".to_string(), s(data)),
    ]);
    if let Some(family_id) = row.family_id {
        item.insert("family_id".to_string(), n(family_id));
    }
    Ok(item)
}

fn item_to_record(item: &Item) -> StoreResult<ResourceRow> {
    let kind = get_s(item, "kind")?;
    Ok(ResourceRow {
        kind: ResourceKind::parse(kind)
            .ok_or_else(|| StoreError::Unexpected(anyhow!("unknown record kind {kind}")))?,
        id: get_n(item, "record_id")?,
        owner_id: get_s(item, "owner_id")?.to_string(),
        family_id: get_opt_n(item, "family_id")?,
        data: serde_json::from_str(get_s(item, "data")?)
            .map_err(|e| StoreError::Unexpected(anyhow!("decode record data: {e}")))?,
    })
}

fn link_item(link: &ResourceLink) -> Item {
    let mut item = HashMap::from([
        ("PK".to_string(), s(record_pk(ResourceKind::Assignment, link.assignment_id))),
        ("SK".to_string(), s(link_sk(link.id))),
        ("entity_type".to_string(), s("resource_link")),
        ("link_id".to_string(), n(link.id)),
        ("assignment_id".to_string(), n(link.assignment_id)),
        ("url".to_string(), s(link.url.clone())),
        ("label".to_string(), s(link.label.clone())),
        ("link_type".to_string(), s(link.link_type.as_str())),
        ("created_at".to_string(), s(link.created_at.to_rfc3339())),
    ]);
    if let Some(start) = link.window_start {
        item.insert("window_start".to_string(), s(start.to_rfc3339()));
    }
    if let Some(end) = link.window_end {
        item.insert("window_end".to_string(), s(end.to_rfc3339()));
    }
    item
}

fn item_to_link(item: &Item) -> StoreResult<ResourceLink> {
    let link_type = get_s(item, "link_type")?;
    Ok(ResourceLink {
        id: get_n(item, "link_id")?,
        assignment_id: get_n(item, "assignment_id")?,
        url: get_s(item, "url")?.to_string(),
        label: get_s(item, "label")?.to_string(),
        link_type: LinkType::parse(link_type)
            .ok_or_else(|| StoreError::Unexpected(anyhow!("unknown link type {link_type}")))?,
        window_start: get_opt_time(item, "window_start")?,
        window_end: get_opt_time(item, "window_end")?,
        created_at: get_time(item, "created_at")?,
    })
}
