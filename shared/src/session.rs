//! Signed cookie sessions.
//!
//! The whole session lives in the cookie as a signed JSON map. Concurrent
//! requests from one browser are last-write-wins, which is fine for the only
//! thing stored here: the family a user is currently looking at.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::signing::Signer;
use crate::types::FamilyId;

pub const SESSION_COOKIE: &str = "hh_session";
const SESSION_SALT: &str = "session";
const SELECTED_FAMILY_KEY: &str = "selected_family_id";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    values: Map<String, Value>,
    modified: bool,
}

impl Session {
    /// Reads the session out of a `Cookie` header. A missing, tampered or
    /// undecodable cookie yields an empty session.
    pub fn from_cookie_header(header: Option<&str>, signer: &Signer, now: DateTime<Utc>) -> Self {
        let Some(token) = header.and_then(|h| cookie_value(h, SESSION_COOKIE)) else {
            return Self::default();
        };

        match signer.unsign::<Map<String, Value>>(SESSION_SALT, token, None, now) {
            Ok(values) => Self {
                values,
                modified: false,
            },
            Err(e) => {
                tracing::warn!("Discarding session cookie: {}", e);
                Self::default()
            }
        }
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn selected_family_id(&self) -> Option<FamilyId> {
        self.values.get(SELECTED_FAMILY_KEY).and_then(Value::as_i64)
    }

    pub fn set_selected_family_id(&mut self, family_id: FamilyId) {
        if self.selected_family_id() != Some(family_id) {
            self.values
                .insert(SELECTED_FAMILY_KEY.to_string(), Value::from(family_id));
            self.modified = true;
        }
    }

    pub fn clear_selected_family_id(&mut self) {
        if self.values.remove(SELECTED_FAMILY_KEY).is_some() {
            self.modified = true;
        }
    }

    /// `Set-Cookie` header value, only when something changed.
    pub fn set_cookie_header(
        &self,
        signer: &Signer,
        secure: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, serde_json::Error> {
        if !self.modified {
            return Ok(None);
        }
        let token = signer.sign(SESSION_SALT, &self.values, now)?;
        let mut cookie = format!("{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax");
        if secure {
            cookie.push_str("; Secure");
        }
        Ok(Some(cookie))
    }
}

fn cookie_value<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then_some(value)
    })
}
