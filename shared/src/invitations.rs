//! Teacher invitations: pending until accepted or expired.
//!
//! Expiry is evaluated lazily. Any path that reads an invitation runs it
//! through [`evaluate_and_maybe_expire`] and persists the status flip when
//! one happened, so no background job is needed.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::email::InvitationEmail;
use crate::error::{AppError, AppResult, InviteRejection};
use crate::families::active_family_for;
use crate::permissions::Access;
use crate::store::StoreError;
use crate::types::{Family, Identity, Invitation, InvitationStatus, InviteResponse, Role};
use crate::AppState;

const DUPLICATE_PENDING: &str = "A pending invitation already exists for this email.";
const FAMILY_REQUIRED: &str =
    "You need to belong to a family as a parent before you can invite a teacher.";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AcceptedInvitation {
    pub family: Family,
    pub role: Role,
    pub message: String,
}

/// Trims and lowercases an address, rejecting anything that is not a plausible email.
pub fn normalize_email(raw: &str) -> AppResult<String> {
    let email = raw.trim().to_lowercase();
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    };
    if !valid {
        return Err(AppError::validation("email", "Enter a valid email address."));
    }
    Ok(email)
}

pub fn expires_at(invitation: &Invitation, max_age: Duration) -> DateTime<Utc> {
    invitation.created_at + max_age
}

pub fn is_expired(invitation: &Invitation, now: DateTime<Utc>, max_age: Duration) -> bool {
    now > expires_at(invitation, max_age)
}

/// Returns the invitation with status `expired` when it is still pending but
/// past its window. Anything else comes back untouched.
pub fn evaluate_and_maybe_expire(
    mut invitation: Invitation,
    now: DateTime<Utc>,
    max_age: Duration,
) -> Invitation {
    if invitation.status == InvitationStatus::Pending && is_expired(&invitation, now, max_age) {
        invitation.status = InvitationStatus::Expired;
    }
    invitation
}

/// Lazy expiry plus persistence of the flip.
async fn refresh(state: &AppState, invitation: Invitation, now: DateTime<Utc>) -> AppResult<Invitation> {
    let before = invitation.status;
    let invitation = evaluate_and_maybe_expire(invitation, now, state.config.invite_max_age);
    if invitation.status != before {
        tracing::info!("Invitation {} expired", invitation.id);
        state.store.update_invitation(&invitation).await?;
    }
    Ok(invitation)
}

/// Family the caller administers invitations for, if any.
async fn inviting_family(state: &AppState, access: &Access) -> AppResult<Family> {
    match active_family_for(state.store.as_ref(), access).await? {
        Some(family) => Ok(family),
        // Teachers asking for the invitation screen get nothing back.
        None if !access.memberships().is_empty() => Err(AppError::NotFound),
        None => Err(AppError::Validation {
            field: None,
            message: FAMILY_REQUIRED.to_string(),
        }),
    }
}

pub async fn create_invitation(
    state: &AppState,
    inviter: &Identity,
    raw_email: &str,
    now: DateTime<Utc>,
) -> AppResult<InviteResponse> {
    let access = Access::load(state.store.as_ref(), &inviter.user_id).await?;
    let family = inviting_family(state, &access).await?;
    let email = normalize_email(raw_email)?;

    for existing in state
        .store
        .list_invitations(family.id, Some(InvitationStatus::Pending))
        .await?
    {
        if existing.email != email {
            continue;
        }
        if refresh(state, existing, now).await?.status == InvitationStatus::Pending {
            return Err(AppError::validation("email", DUPLICATE_PENDING));
        }
    }

    let invitation = Invitation::new(email, family.id, inviter.user_id.clone(), now);
    let invitation = match state.store.insert_invitation(invitation).await {
        Ok(invitation) => invitation,
        Err(StoreError::Conflict(_)) => return Err(AppError::validation("email", DUPLICATE_PENDING)),
        Err(e) => return Err(e.into()),
    };
    tracing::info!(
        "Invitation {} created for {} to family {}",
        invitation.id,
        invitation.email,
        family.id
    );

    send_invitation_email(state, &invitation, &family, inviter).await?;
    Ok(invite_response(state, &invitation, &family))
}

pub async fn resend_invitation(
    state: &AppState,
    inviter: &Identity,
    invite_id: Uuid,
    now: DateTime<Utc>,
) -> AppResult<InviteResponse> {
    let access = Access::load(state.store.as_ref(), &inviter.user_id).await?;
    let family = active_family_for(state.store.as_ref(), &access)
        .await?
        .ok_or(AppError::NotFound)?;

    let invitation = state
        .store
        .get_invitation(invite_id)
        .await?
        .filter(|i| i.family_id == family.id)
        .ok_or(AppError::NotFound)?;
    let mut invitation = refresh(state, invitation, now).await?;

    match invitation.status {
        InvitationStatus::Pending => {}
        InvitationStatus::Accepted => {
            return Err(AppError::Invitation(InviteRejection::AlreadyAccepted))
        }
        InvitationStatus::Expired if is_expired(&invitation, now, state.config.invite_max_age) => {
            return Err(AppError::Invitation(InviteRejection::ResendExpired))
        }
        InvitationStatus::Expired => {
            return Err(AppError::Invitation(InviteRejection::NotResendable))
        }
    }

    send_invitation_email(state, &invitation, &family, inviter).await?;
    // The expiry window stays anchored to created_at.
    invitation.resent_at = Some(now);
    state.store.update_invitation(&invitation).await?;
    tracing::info!("Invitation {} resent to {}", invitation.id, invitation.email);

    Ok(invite_response(state, &invitation, &family))
}

pub async fn accept_invitation(
    state: &AppState,
    identity: &Identity,
    invite_id: Uuid,
    now: DateTime<Utc>,
) -> AppResult<AcceptedInvitation> {
    let mut invitation = state
        .store
        .get_invitation(invite_id)
        .await?
        .ok_or(AppError::NotFound)?;

    if invitation.status == InvitationStatus::Accepted {
        return Err(AppError::Invitation(InviteRejection::AlreadyAccepted));
    }
    if is_expired(&invitation, now, state.config.invite_max_age) {
        refresh(state, invitation, now).await?;
        return Err(AppError::Invitation(InviteRejection::Expired));
    }
    if invitation.status != InvitationStatus::Pending {
        return Err(AppError::Invitation(InviteRejection::NoLongerValid));
    }

    let family = state
        .store
        .get_family(invitation.family_id)
        .await?
        .ok_or(AppError::NotFound)?;

    // Acceptance is bound to the signed-in user, not to the invited address.
    if let Some(email) = &identity.email {
        if !email.trim().eq_ignore_ascii_case(&invitation.email) {
            tracing::warn!(
                "Invitation {} for {} accepted by {} signed in as {}",
                invitation.id,
                invitation.email,
                identity.user_id,
                email
            );
        }
    }

    let membership = match state
        .store
        .get_membership(&identity.user_id, family.id)
        .await?
    {
        Some(existing) => existing,
        None => match state
            .store
            .add_membership(&identity.user_id, family.id, invitation.role)
            .await
        {
            Ok(created) => created,
            Err(StoreError::Conflict(_)) => state
                .store
                .get_membership(&identity.user_id, family.id)
                .await?
                .ok_or(AppError::NotFound)?,
            Err(e) => return Err(e.into()),
        },
    };

    invitation.status = InvitationStatus::Accepted;
    invitation.accepted_at = Some(now);
    state.store.update_invitation(&invitation).await?;
    tracing::info!(
        "User {} joined family {} as {} via invitation {}",
        identity.user_id,
        family.id,
        membership.role.as_str(),
        invitation.id
    );

    Ok(AcceptedInvitation {
        message: format!(
            "Welcome! You've joined {} as a {}.",
            family.name,
            invitation.role.as_str()
        ),
        role: membership.role,
        family,
    })
}

/// Public lookup used by the accept page before sign-in.
pub async fn invitation_details(
    state: &AppState,
    invite_id: Uuid,
    now: DateTime<Utc>,
) -> AppResult<InviteResponse> {
    let invitation = state
        .store
        .get_invitation(invite_id)
        .await?
        .ok_or(AppError::NotFound)?;
    let invitation = refresh(state, invitation, now).await?;
    let family = state
        .store
        .get_family(invitation.family_id)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(invite_response(state, &invitation, &family))
}

/// Still-pending invitations of the caller's active family, newest first.
pub async fn pending_invitations(
    state: &AppState,
    identity: &Identity,
    now: DateTime<Utc>,
) -> AppResult<Vec<InviteResponse>> {
    let access = Access::load(state.store.as_ref(), &identity.user_id).await?;
    let family = inviting_family(state, &access).await?;

    let mut pending = Vec::new();
    for invitation in state
        .store
        .list_invitations(family.id, Some(InvitationStatus::Pending))
        .await?
    {
        let invitation = refresh(state, invitation, now).await?;
        if invitation.status == InvitationStatus::Pending {
            pending.push(invite_response(state, &invitation, &family));
        }
    }
    Ok(pending)
}

fn invite_response(state: &AppState, invitation: &Invitation, family: &Family) -> InviteResponse {
    InviteResponse {
        invite_id: invitation.id,
        email: invitation.email.clone(),
        family_id: family.id,
        family_name: family.name.clone(),
        status: invitation.status,
        expires_at: expires_at(invitation, state.config.invite_max_age),
    }
}

/// Delivery failures are logged and swallowed: the invitation stays valid and
/// can be resent.
async fn send_invitation_email(
    state: &AppState,
    invitation: &Invitation,
    family: &Family,
    inviter: &Identity,
) -> AppResult<()> {
    let inviter_name = inviter_display_name(state, inviter).await?;
    let accept_url = format!(
        "{}/invites/{}/accept",
        state.config.frontend_url.trim_end_matches('/'),
        invitation.id
    );
    let email = InvitationEmail {
        to: &invitation.email,
        inviter_name: &inviter_name,
        family_name: &family.name,
        accept_url: &accept_url,
        app_name: &state.config.app_name,
        max_age: state.config.invite_max_age,
    }
    .render();

    match state.mailer.send(&email).await {
        Ok(()) => tracing::info!("Invite email sent successfully to {}", invitation.email),
        Err(e) => tracing::error!("Failed to send invite email: {}", e),
    }
    Ok(())
}

async fn inviter_display_name(state: &AppState, inviter: &Identity) -> AppResult<String> {
    if let Some(profile) = state.store.get_user(&inviter.user_id).await? {
        let full_name = format!("{} {}", profile.first_name, profile.last_name);
        let full_name = full_name.trim();
        if !full_name.is_empty() {
            return Ok(full_name.to_string());
        }
    }
    Ok(inviter
        .display_name
        .clone()
        .or_else(|| inviter.email.clone())
        .unwrap_or_else(|| inviter.user_id.clone()))
}
