#![allow(non_snake_case)]

use crate::{IntoResponse, Uri};

use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;

use serde::Serialize;

pub async fn handler404(path: Uri) -> (StatusCode, Json<Error>) {
    (
        StatusCode::NOT_FOUND,
        Json(Error::NotFound {
            message: format!("Invalid path: {}", path),
        }),
    )
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Maybe<T> {
    Nothing(Error),
    Fine(Success<T>),
}

pub fn Fine<V>(v: V) -> Maybe<V>
where
    V: Serialize,
{
    Maybe::Fine(Success::of(v))
}

pub fn Nothing<V>(err: Error) -> Maybe<V> {
    Maybe::Nothing(err)
}

#[derive(Debug, Clone, Serialize)]
pub struct Success<V> {
    success: bool,
    #[serde(flatten)]
    value: V,
}

impl<T> IntoResponse for Maybe<T>
where
    T: Serialize,
{
    fn into_response(self) -> Response {
        match self {
            Maybe::Nothing(err) => Json::into_response(Json(err)),
            Maybe::Fine(success) => Json::into_response(Json(success)),
        }
    }
}

impl<V: Serialize> Success<V> {
    pub fn of(value: V) -> Self {
        Self {
            success: true,
            value,
        }
    }
}

/// Every failure a request can surface. Nothing here is fatal: all variants
/// resolve to a JSON body and the client returns to its previous state.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "error")]
pub enum Error {
    // provider/auth
    AuthenticationFailure { message: String },
    MissingCredentials { message: String },
    UserAlreadyExists { message: String },
    UserDoesNotExist { message: String },
    InvalidSession { message: String },
    SessionExpired { message: String },
    PendingApproval { message: String },
    Unauthorized { message: String },
    // validation
    InvalidPayload { message: String },
    // consistency
    AlreadyMarked { message: String },
    InvalidQr { message: String },
    SessionActive { message: String },
    NotEnrolled { message: String },
    // partial failure: the credential exists but the profile write never landed
    ProfilePersistFailed { user_id: uuid::Uuid, message: String },
    // transport
    PayloadTooLarge { message: String },
    NotFound { message: String },
    InternalError { kind: &'static str, message: String },
    Unknown { message: String },
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        Json::into_response(Json(self))
    }
}

impl Error {
    pub fn invalid<S: Into<String>>(msg: S) -> Error {
        Error::InvalidPayload {
            message: msg.into(),
        }
    }

    pub fn unauthorized<S: Into<String>>(msg: S) -> Error {
        Error::Unauthorized {
            message: msg.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(io: std::io::Error) -> Self {
        Self::InternalError {
            kind: "IOError",
            message: io.to_string(),
        }
    }
}

impl From<uuid::Error> for Error {
    fn from(id: uuid::Error) -> Self {
        Self::InternalError {
            kind: "UUIDError",
            message: id.to_string(),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::InternalError {
            kind: "DatabaseError",
            message: err.to_string(),
        }
    }
}

impl From<pbkdf2::password_hash::Error> for Error {
    fn from(err: pbkdf2::password_hash::Error) -> Self {
        Self::InternalError {
            kind: "PasswordHashError",
            message: err.to_string(),
        }
    }
}

impl From<qrcode::types::QrError> for Error {
    fn from(err: qrcode::types::QrError) -> Self {
        Self::InternalError {
            kind: "QrEncodeError",
            message: format!("{:?}", err),
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Unknown {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, to_value};

    #[derive(Serialize)]
    struct Sample {
        id: u32,
    }

    #[test]
    fn success_envelope_flattens_the_value() {
        let body = to_value(Fine(Sample { id: 7 })).unwrap();
        assert_eq!(body, json!({ "success": true, "id": 7 }));
    }

    #[test]
    fn error_envelope_carries_the_variant_tag() {
        let body = to_value(Nothing::<Sample>(Error::invalid("bad input"))).unwrap();
        assert_eq!(
            body,
            json!({ "error": "InvalidPayload", "message": "bad input" })
        );
    }
}
