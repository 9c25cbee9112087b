//! Acting user extraction
//!
//! Authentication happens upstream. The authenticated user's id arrives in
//! the `x-user-id` header and is recorded on audit entries; it is optional.

use axum::http::request::Parts;
use uuid::Uuid;

use crate::error::AppError;

pub const USER_ID_HEADER: &str = "x-user-id";

/// Acting user for the current request, if the upstream layer sent one
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CurrentUser(pub Option<Uuid>);

impl CurrentUser {
    pub fn id(&self) -> Option<Uuid> {
        self.0
    }
}

#[axum::async_trait]
impl<S> axum::extract::FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(value) = parts.headers.get(USER_ID_HEADER) else {
            return Ok(CurrentUser(None));
        };

        value
            .to_str()
            .ok()
            .and_then(|v| Uuid::parse_str(v.trim()).ok())
            .map(|id| CurrentUser(Some(id)))
            .ok_or_else(|| AppError::validation(USER_ID_HEADER, "Header must be a UUID"))
    }
}
