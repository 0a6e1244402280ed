// Requester identity, as established by the upstream authentication layer

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::output::errors::SylvaError;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Basic,
}

impl Role {
    pub fn parse(value: &str) -> Result<Role, SylvaError> {
        match value.trim() {
            "admin" => Ok(Role::Admin),
            "basic" | "" => Ok(Role::Basic),
            _ => Err(SylvaError::Forbidden),
        }
    }
}

/// The authenticated caller of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester {
    pub id: String,
    pub role: Role,
}

impl Requester {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Admins act on every record; everyone else only on their own
    pub fn owns(&self, creator_id: &str) -> bool {
        self.is_admin() || self.id == creator_id
    }

    /// Creator filter for listings
    pub fn scope(&self) -> Option<&str> {
        if self.is_admin() {
            None
        } else {
            Some(&self.id)
        }
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Requester
where
    S: Send + Sync,
{
    type Rejection = SylvaError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
        };

        let id = match header(USER_ID_HEADER) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => return Err(SylvaError::Unauthorized),
        };
        let role = Role::parse(header(USER_ROLE_HEADER).unwrap_or(""))?;

        Ok(Requester { id, role })
    }
}
