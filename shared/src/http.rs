//! JSON response helpers shared by the HTTP handlers.

use lambda_http::http::{HeaderValue, StatusCode};
use lambda_http::{Body, Error, Request, RequestExt, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{AppError, AppResult};
use crate::types::Identity;

#[derive(Debug, Serialize)]
struct ErrorResponse<'a> {
    error: &'a str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<&'a str>,
}

/// Status plus optional JSON body, turned into a [`Response`] at the edge.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: StatusCode,
    pub body: Option<serde_json::Value>,
}

impl Reply {
    pub fn ok<T: Serialize>(body: &T) -> AppResult<Self> {
        Self::json(StatusCode::OK, body)
    }

    pub fn created<T: Serialize>(body: &T) -> AppResult<Self> {
        Self::json(StatusCode::CREATED, body)
    }

    pub fn no_content() -> Self {
        Self {
            status: StatusCode::NO_CONTENT,
            body: None,
        }
    }

    fn json<T: Serialize>(status: StatusCode, body: &T) -> AppResult<Self> {
        let body = serde_json::to_value(body).map_err(anyhow::Error::from)?;
        Ok(Self {
            status,
            body: Some(body),
        })
    }

    pub fn into_response(self) -> Result<Response<Body>, Error> {
        let builder = Response::builder()
            .status(self.status)
            .header("Access-Control-Allow-Origin", "*");
        let response = match self.body {
            Some(body) => builder
                .header("Content-Type", "application/json")
                .body(body.to_string().into()),
            None => builder.body(Body::Empty),
        };
        Ok(response.map_err(Box::new)?)
    }
}

pub fn error_response(err: &AppError) -> Result<Response<Body>, Error> {
    let status = err.status();
    if status.is_server_error() {
        tracing::error!("Request failed: {:?}", err);
    }
    let field = match err {
        AppError::Validation { field, .. } => *field,
        _ => None,
    };
    let body = ErrorResponse {
        error: err.code(),
        message: err.public_message(),
        field,
    };

    Ok(Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(serde_json::to_string(&body)?.into())
        .map_err(Box::new)?)
}

pub fn preflight_response() -> Result<Response<Body>, Error> {
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Access-Control-Allow-Origin", "*")
        .header(
            "Access-Control-Allow-Methods",
            "GET,POST,PATCH,DELETE,OPTIONS",
        )
        .header(
            "Access-Control-Allow-Headers",
            "Content-Type,Authorization,X-User-Id,X-User-Email",
        )
        .body(Body::Empty)
        .map_err(Box::new)?)
}

/// Appends a `Set-Cookie` header.
pub fn with_cookie(mut response: Response<Body>, cookie: &str) -> Result<Response<Body>, Error> {
    response
        .headers_mut()
        .append("Set-Cookie", HeaderValue::from_str(cookie)?);
    Ok(response)
}

pub fn parse_json<T: DeserializeOwned>(body: &Body) -> AppResult<T> {
    let body_str = match body {
        Body::Text(text) => text.as_str(),
        Body::Binary(bytes) => std::str::from_utf8(bytes).unwrap_or(""),
        Body::Empty => "",
    };
    serde_json::from_str(body_str).map_err(|e| AppError::Validation {
        field: None,
        message: format!("Invalid request body: {}", e),
    })
}

/// Caller identity. Claims from the API Gateway JWT authorizer always win.
/// The `X-User-Id`/`X-User-Email` headers are read only when
/// `allow_header_identity` is set, for local runs without an authorizer.
pub fn identity_from_request(event: &Request, allow_header_identity: bool) -> Option<Identity> {
    let claims = event
        .request_context_ref()
        .and_then(|ctx| ctx.authorizer())
        .and_then(|auth| auth.jwt.as_ref())
        .map(|jwt| &jwt.claims);

    if let Some(claims) = claims {
        let claim = |name: &str| {
            claims
                .get(name)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        return Some(Identity {
            user_id: claim("sub")?,
            email: claim("email"),
            display_name: claim("name"),
        });
    }

    if !allow_header_identity {
        return None;
    }
    let header = |name: &str| {
        event
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    Some(Identity {
        user_id: header("X-User-Id")?,
        email: header("X-User-Email"),
        display_name: None,
    })
}

pub fn query_param(event: &Request, name: &str) -> Option<String> {
    event
        .query_string_parameters_ref()
        .and_then(|params| params.first(name))
        .map(str::to_string)
}
