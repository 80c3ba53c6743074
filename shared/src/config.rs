use std::collections::BTreeSet;

use anyhow::{Context, Result};
use chrono::Duration;

// Runtime configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub table_name: String,
    pub frontend_url: String,
    pub from_email: String,
    pub app_name: String,
    pub session_secret: String,
    pub invite_max_age: Duration,
    pub student_link_max_age: Duration,
    pub session_cookie_secure: bool,
    /// Trust `X-User-Id`/`X-User-Email` when no JWT authorizer ran.
    pub allow_header_identity: bool,
    /// Users allowed to register organizations.
    pub admin_user_ids: BTreeSet<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let table_name =
            std::env::var("TABLE_NAME").unwrap_or_else(|_| "homeschool-hub".to_string());
        let frontend_url = std::env::var("FRONTEND_URL")
            .unwrap_or_else(|_| "http://localhost:8080".to_string());
        let from_email = std::env::var("FROM_EMAIL")
            .unwrap_or_else(|_| "noreply@homeschoolhub.app".to_string());
        let app_name = std::env::var("APP_NAME").unwrap_or_else(|_| "Homeschool Hub".to_string());
        let session_secret =
            std::env::var("SESSION_SECRET").with_context(|| "read SESSION_SECRET")?;
        let invite_max_age = days_from_env("INVITE_MAX_AGE_DAYS", 7)?;
        let student_link_max_age = days_from_env("STUDENT_LINK_MAX_AGE_DAYS", 7)?;
        let session_cookie_secure = std::env::var("SESSION_COOKIE_SECURE")
            .unwrap_or_else(|_| "true".to_string())
            .parse()
            .with_context(|| "parse SESSION_COOKIE_SECURE")?;
        let allow_header_identity = std::env::var("ALLOW_HEADER_IDENTITY")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .with_context(|| "parse ALLOW_HEADER_IDENTITY")?;
        let admin_user_ids = std::env::var("ADMIN_USER_IDS")
            .map(|raw| parse_id_list(&raw))
            .unwrap_or_default();

        Ok(Self {
            table_name,
            frontend_url,
            from_email,
            app_name,
            session_secret,
            invite_max_age,
            student_link_max_age,
            session_cookie_secure,
            allow_header_identity,
            admin_user_ids,
        })
    }

    /// Defaults for tests and local runs. Identity headers are trusted.
    pub fn local(session_secret: impl Into<String>) -> Self {
        Self {
            table_name: "homeschool-hub".to_string(),
            frontend_url: "http://localhost:8080".to_string(),
            from_email: "noreply@homeschoolhub.app".to_string(),
            app_name: "Homeschool Hub".to_string(),
            session_secret: session_secret.into(),
            invite_max_age: Duration::days(7),
            student_link_max_age: Duration::days(7),
            session_cookie_secure: false,
            allow_header_identity: true,
            admin_user_ids: BTreeSet::new(),
        }
    }
}

fn days_from_env(name: &str, default: i64) -> Result<Duration> {
    let days: i64 = match std::env::var(name) {
        Ok(raw) => raw.parse().with_context(|| format!("parse {name}"))?,
        Err(_) => default,
    };
    Ok(Duration::days(days))
}

fn parse_id_list(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_ids_skip_blanks() {
        let ids = parse_id_list(" admin-1, ,admin-2,");
        assert_eq!(
            ids.into_iter().collect::<Vec<_>>(),
            vec!["admin-1".to_string(), "admin-2".to_string()]
        );
        assert!(parse_id_list("").is_empty());
    }
}
