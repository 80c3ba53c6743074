use chrono::{DateTime, Utc};

use crate::error::{AppError, AppResult};
use crate::invitations::normalize_email;
use crate::store::Store;
use crate::types::{Identity, UpsertUserRequest, User};

/// Creates or refreshes the caller's profile. The original `created_at`
/// survives later updates.
pub async fn upsert_user<S: Store + ?Sized>(
    store: &S,
    identity: &Identity,
    req: UpsertUserRequest,
    now: DateTime<Utc>,
) -> AppResult<User> {
    let email = normalize_email(&req.email)?;
    let created_at = store
        .get_user(&identity.user_id)
        .await?
        .map(|existing| existing.created_at)
        .unwrap_or(now);

    let user = store
        .put_user(User {
            user_id: identity.user_id.clone(),
            email,
            first_name: req.first_name.trim().to_string(),
            last_name: req.last_name.trim().to_string(),
            created_at,
        })
        .await?;
    tracing::info!("Saved profile for {}", user.user_id);
    Ok(user)
}

pub async fn get_user<S: Store + ?Sized>(store: &S, identity: &Identity) -> AppResult<User> {
    store
        .get_user(&identity.user_id)
        .await?
        .ok_or(AppError::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;
    use chrono::Duration;

    #[tokio::test]
    async fn upsert_keeps_first_created_at() {
        let store = InMemoryStore::new();
        let identity = Identity::new("u");
        let first = Utc::now();

        upsert_user(
            &store,
            &identity,
            UpsertUserRequest {
                email: "U@X.com".into(),
                first_name: "Pat".into(),
                last_name: String::new(),
            },
            first,
        )
        .await
        .unwrap();
        let updated = upsert_user(
            &store,
            &identity,
            UpsertUserRequest {
                email: "u@x.com".into(),
                first_name: "Pat".into(),
                last_name: " Lee ".into(),
            },
            first + Duration::days(1),
        )
        .await
        .unwrap();

        assert_eq!(updated.created_at, first);
        assert_eq!(updated.email, "u@x.com");
        assert_eq!(updated.last_name, "Lee");
        assert_eq!(get_user(&store, &identity).await.unwrap(), updated);
    }

    #[tokio::test]
    async fn missing_profile_is_not_found() {
        let store = InMemoryStore::new();
        assert!(matches!(
            get_user(&store, &Identity::new("ghost")).await,
            Err(AppError::NotFound)
        ));
    }
}
