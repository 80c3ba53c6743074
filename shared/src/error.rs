use lambda_http::http::StatusCode;
use thiserror::Error;

use crate::store::StoreError;

/// Why an invitation could not be accepted or resent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteRejection {
    AlreadyAccepted,
    Expired,
    NoLongerValid,
    /// Resend of an invitation past its expiry window.
    ResendExpired,
    NotResendable,
}

impl InviteRejection {
    pub fn message(self) -> &'static str {
        match self {
            InviteRejection::AlreadyAccepted => "This invitation has already been accepted.",
            InviteRejection::Expired => {
                "This invitation has expired. Please ask for a new invitation."
            }
            InviteRejection::NoLongerValid => "This invitation is no longer valid.",
            InviteRejection::ResendExpired => {
                "This invitation has expired. Please send a new one."
            }
            InviteRejection::NotResendable => "This invitation can no longer be resent.",
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    /// Missing records and records the caller may not see look the same.
    #[error("not found")]
    NotFound,
    #[error("{message}")]
    Validation {
        field: Option<&'static str>,
        message: String,
    },
    #[error("{}", .0.message())]
    Invitation(InviteRejection),
    /// Student status link that fails verification, is too old or points at nothing.
    #[error("This link is invalid or has expired.")]
    InvalidLink,
    #[error("authentication required")]
    Unauthenticated,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        AppError::Validation {
            field: Some(field),
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Validation { .. } => StatusCode::BAD_REQUEST,
            AppError::Invitation(InviteRejection::Expired | InviteRejection::ResendExpired) => {
                StatusCode::GONE
            }
            AppError::Invitation(_) => StatusCode::CONFLICT,
            AppError::InvalidLink => StatusCode::GONE,
            AppError::Unauthenticated => StatusCode::UNAUTHORIZED,
            AppError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            AppError::Store(StoreError::Conflict(_)) => StatusCode::CONFLICT,
            AppError::Store(StoreError::Unexpected(_)) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Machine readable error code for the JSON body.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::NotFound => "NotFound",
            AppError::Validation { .. } => "InvalidRequest",
            AppError::Invitation(InviteRejection::AlreadyAccepted) => "InviteAlreadyAccepted",
            AppError::Invitation(InviteRejection::Expired | InviteRejection::ResendExpired) => {
                "InviteExpired"
            }
            AppError::Invitation(_) => "InviteNotValid",
            AppError::InvalidLink => "InvalidLink",
            AppError::Unauthenticated => "Unauthenticated",
            AppError::Store(StoreError::NotFound(_)) => "NotFound",
            AppError::Store(StoreError::Conflict(_)) => "Conflict",
            AppError::Store(StoreError::Unexpected(_)) | AppError::Internal(_) => "InternalError",
        }
    }

    /// Message safe to show to the caller. Store internals are not exposed.
    pub fn public_message(&self) -> String {
        match self {
            AppError::Store(StoreError::Unexpected(_)) | AppError::Internal(_) => {
                "Something went wrong".to_string()
            }
            AppError::Store(StoreError::NotFound(_)) => "Not found".to_string(),
            AppError::NotFound => "Not found".to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_access_reads_as_not_found() {
        assert_eq!(AppError::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(AppError::NotFound.public_message(), "Not found");
    }

    #[test]
    fn invitation_rejections_carry_user_messages() {
        let err = AppError::Invitation(InviteRejection::AlreadyAccepted);
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(err.public_message(), "This invitation has already been accepted.");

        let err = AppError::Invitation(InviteRejection::Expired);
        assert_eq!(err.status(), StatusCode::GONE);
    }

    #[test]
    fn unexpected_store_errors_are_not_leaked() {
        let err = AppError::Store(StoreError::Unexpected(anyhow::anyhow!("table missing")));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.public_message(), "Something went wrong");
    }
}
