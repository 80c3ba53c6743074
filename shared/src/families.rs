use serde::Serialize;

use crate::error::{AppError, AppResult};
use crate::permissions::Access;
use crate::selector::{get_selected_family, RequestContext};
use crate::store::{Store, StoreResult};
use crate::types::{
    CreateFamilyRequest, Family, Identity, NewOrganization, Organization, Role, User,
};
use crate::AppState;

/// One entry of the family switcher.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FamilyChoice {
    #[serde(flatten)]
    pub family: Family,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FamiliesOverview {
    pub families: Vec<FamilyChoice>,
    pub selected_family: Option<Family>,
    pub can_invite_teacher: bool,
}

/// The user's primary family: first parent membership by ascending id.
/// Session and request parameters play no part here.
pub async fn get_active_family<S: Store + ?Sized>(
    store: &S,
    user_id: &str,
) -> StoreResult<Option<Family>> {
    let access = Access::load(store, user_id).await?;
    active_family_for(store, &access).await
}

/// [`get_active_family`] over an already loaded membership snapshot.
pub async fn active_family_for<S: Store + ?Sized>(
    store: &S,
    access: &Access,
) -> StoreResult<Option<Family>> {
    match access.first_family_with_role(Role::Parent) {
        Some(family_id) => store.get_family(family_id).await,
        None => Ok(None),
    }
}

/// Every family the user belongs to with their role, in membership order.
pub async fn get_user_families<S: Store + ?Sized>(
    store: &S,
    user_id: &str,
) -> StoreResult<Vec<FamilyChoice>> {
    let access = Access::load(store, user_id).await?;
    let mut choices = Vec::with_capacity(access.memberships().len());
    for membership in access.memberships() {
        if let Some(family) = store.get_family(membership.family_id).await? {
            choices.push(FamilyChoice {
                family,
                role: membership.role,
            });
        }
    }
    Ok(choices)
}

/// Data for the navigation family switcher.
pub async fn families_overview<S: Store + ?Sized>(
    store: &S,
    ctx: &mut RequestContext,
) -> StoreResult<FamiliesOverview> {
    let selected_family = get_selected_family(store, ctx).await?;
    let can_invite_teacher = match &selected_family {
        Some(family) => ctx.access(store).await?.role_in(family.id) == Some(Role::Parent),
        None => false,
    };
    let families = get_user_families(store, ctx.user_id()).await?;

    Ok(FamiliesOverview {
        families,
        selected_family,
        can_invite_teacher,
    })
}

/// Display name for a family created on a user's behalf.
pub fn family_name_for_user(user_id: &str, profile: Option<&User>) -> String {
    match profile {
        Some(user) if !user.last_name.is_empty() => format!("{} Family", user.last_name),
        Some(user) if !user.email.is_empty() => format!("{} Family", user.email),
        _ => format!("Family for {user_id}"),
    }
}

/// Creates a family with the caller as its parent. Joining an organization
/// happens here; an unknown organization id is not found.
pub async fn create_family(
    state: &AppState,
    identity: &Identity,
    req: CreateFamilyRequest,
) -> AppResult<Family> {
    let store = state.store.as_ref();
    let name = match req.name.trim() {
        "" => {
            let profile = store.get_user(&identity.user_id).await?;
            family_name_for_user(&identity.user_id, profile.as_ref())
        }
        name => name.to_string(),
    };

    let family = store.create_family(&name, req.organization_id).await?;
    store
        .add_membership(&identity.user_id, family.id, Role::Parent)
        .await?;
    tracing::info!(
        "User {} created family {} (organization {:?})",
        identity.user_id,
        family.id,
        family.organization_id
    );
    Ok(family)
}

/// Registers an umbrella organization. Only configured admins may do this;
/// anyone else gets not found.
pub async fn create_organization(
    state: &AppState,
    identity: &Identity,
    mut req: NewOrganization,
) -> AppResult<Organization> {
    if !state.config.admin_user_ids.contains(&identity.user_id) {
        return Err(AppError::NotFound);
    }
    req.name = req.name.trim().to_string();
    if req.name.is_empty() {
        return Err(AppError::validation("name", "This field is required."));
    }
    let organization = state.store.create_organization(req).await?;
    tracing::info!(
        "Organization {} registered by {}",
        organization.id,
        identity.user_id
    );
    Ok(organization)
}

/// Visible to admins and to members of a family inside the organization.
pub async fn get_organization(
    state: &AppState,
    access: &Access,
    id: i64,
) -> AppResult<Organization> {
    let store = state.store.as_ref();
    let Some(organization) = store.get_organization(id).await? else {
        return Err(AppError::NotFound);
    };
    if state.config.admin_user_ids.contains(access.user_id()) {
        return Ok(organization);
    }
    for family_id in access.viewable_family_ids() {
        if let Some(family) = store.get_family(family_id).await? {
            if family.organization_id == Some(id) {
                return Ok(organization);
            }
        }
    }
    Err(AppError::NotFound)
}
