//! Identity extractors
//!
//! Admin and reader identities arrive as headers set by the upstream
//! identity layer. The gateway trusts them as-is.

use axum::{extract::FromRequestParts, http::request::Parts};
use readerloop_common::{collaborators::Actor, errors::AppError};
use uuid::Uuid;

pub const ADMIN_HEADER: &str = "X-Admin-Id";
pub const READER_HEADER: &str = "X-Reader-Id";

fn header_id(parts: &Parts, name: &str) -> Result<Option<Uuid>, AppError> {
    let Some(value) = parts.headers.get(name) else {
        return Ok(None);
    };

    value
        .to_str()
        .ok()
        .and_then(|s| Uuid::parse_str(s.trim()).ok())
        .map(Some)
        .ok_or_else(|| AppError::Unauthorized {
            message: format!("Invalid {} header", name),
        })
}

/// Authenticated admin
#[derive(Debug, Clone, Copy)]
pub struct AdminContext {
    pub admin_id: Uuid,
}

impl<S: Send + Sync> FromRequestParts<S> for AdminContext {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        header_id(parts, ADMIN_HEADER)?
            .map(|admin_id| AdminContext { admin_id })
            .ok_or_else(|| AppError::Unauthorized {
                message: format!("Missing {} header", ADMIN_HEADER),
            })
    }
}

/// Authenticated reader
#[derive(Debug, Clone, Copy)]
pub struct ReaderContext {
    pub reader_id: Uuid,
}

impl<S: Send + Sync> FromRequestParts<S> for ReaderContext {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        header_id(parts, READER_HEADER)?
            .map(|reader_id| ReaderContext { reader_id })
            .ok_or_else(|| AppError::Unauthorized {
                message: format!("Missing {} header", READER_HEADER),
            })
    }
}

/// Either an admin or a reader; the admin header wins when both are present
#[derive(Debug, Clone, Copy)]
pub struct Identity(pub Actor);

impl Identity {
    /// Admins see everything, readers only their own data
    pub fn ensure_reader(&self, reader_id: Uuid) -> Result<(), AppError> {
        match self.0 {
            Actor::Admin(_) => Ok(()),
            Actor::Reader(id) if id == reader_id => Ok(()),
            _ => Err(AppError::Forbidden {
                message: "Readers may only access their own records".to_string(),
            }),
        }
    }
}

impl<S: Send + Sync> FromRequestParts<S> for Identity {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(admin_id) = header_id(parts, ADMIN_HEADER)? {
            return Ok(Identity(Actor::Admin(admin_id)));
        }
        if let Some(reader_id) = header_id(parts, READER_HEADER)? {
            return Ok(Identity(Actor::Reader(reader_id)));
        }
        Err(AppError::Unauthorized {
            message: "Missing identity header".to_string(),
        })
    }
}
