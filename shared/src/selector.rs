//! Per-request "active family" resolution.
//!
//! Order: explicit `family_id` request parameter, then the family stored in
//! the session, then the first parent membership, then the first membership
//! of any role. Whatever wins is written back to the session. The answer is
//! memoized on the [`RequestContext`], so later calls within the same
//! request never hit the store again.

use crate::permissions::Access;
use crate::session::Session;
use crate::store::{Store, StoreResult};
use crate::types::{Family, FamilyId, Identity, Role};

/// Everything one request knows about its caller.
#[derive(Debug)]
pub struct RequestContext {
    identity: Identity,
    family_param: Option<String>,
    session: Session,
    access: Option<Access>,
    selected: Option<Option<Family>>,
}

impl RequestContext {
    pub fn new(identity: Identity, family_param: Option<String>, session: Session) -> Self {
        Self {
            identity,
            family_param,
            session,
            access: None,
            selected: None,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn user_id(&self) -> &str {
        &self.identity.user_id
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn into_session(self) -> Session {
        self.session
    }

    /// Membership snapshot of the caller, loaded on first use.
    pub async fn access<S: Store + ?Sized>(&mut self, store: &S) -> StoreResult<&Access> {
        let access = match self.access.take() {
            Some(access) => access,
            None => Access::load(store, &self.identity.user_id).await?,
        };
        Ok(self.access.insert(access))
    }
}

pub async fn get_selected_family<S: Store + ?Sized>(
    store: &S,
    ctx: &mut RequestContext,
) -> StoreResult<Option<Family>> {
    if let Some(selected) = &ctx.selected {
        return Ok(selected.clone());
    }

    let selected = resolve(store, ctx).await?;
    match &selected {
        Some(family) => ctx.session.set_selected_family_id(family.id),
        None => ctx.session.clear_selected_family_id(),
    }
    ctx.selected = Some(selected.clone());
    Ok(selected)
}

async fn resolve<S: Store + ?Sized>(
    store: &S,
    ctx: &mut RequestContext,
) -> StoreResult<Option<Family>> {
    let access = ctx.access(store).await?.clone();

    if let Some(raw) = ctx.family_param.as_deref() {
        match raw.trim().parse::<FamilyId>() {
            Ok(family_id) => {
                if let Some(family) = viewable_family(store, &access, family_id).await? {
                    return Ok(Some(family));
                }
                tracing::warn!(
                    "User {} asked for family {} without access",
                    access.user_id(),
                    family_id
                );
            }
            Err(_) => tracing::warn!("Ignoring malformed family_id parameter {:?}", raw),
        }
    }

    if let Some(family_id) = ctx.session.selected_family_id() {
        if let Some(family) = viewable_family(store, &access, family_id).await? {
            return Ok(Some(family));
        }
        tracing::info!(
            "Clearing stale family {} from session of {}",
            family_id,
            access.user_id()
        );
        ctx.session.clear_selected_family_id();
    }

    let fallbacks = [
        access.first_family_with_role(Role::Parent),
        access.memberships().first().map(|m| m.family_id),
    ];
    for family_id in fallbacks.into_iter().flatten() {
        if let Some(family) = store.get_family(family_id).await? {
            return Ok(Some(family));
        }
    }
    Ok(None)
}

async fn viewable_family<S: Store + ?Sized>(
    store: &S,
    access: &Access,
    family_id: FamilyId,
) -> StoreResult<Option<Family>> {
    if access.role_in(family_id).is_none() {
        return Ok(None);
    }
    store.get_family(family_id).await
}
