use async_trait::async_trait;
use axum::extract::{FromRequest, RequestParts};

use crate::errors::ServiceError;

pub const PRINCIPAL_ID_HEADER: &str = "x-principal-id";
pub const PRINCIPAL_ROLES_HEADER: &str = "x-principal-roles";

/// The caller of a request, resolved upstream and forwarded in headers.
#[derive(Clone, Debug, PartialEq)]
pub struct Principal {
    pub id: String,
    pub role_ids: Vec<String>,
}

#[async_trait]
impl<B> FromRequest<B> for Principal
where
    B: Send,
{
    type Rejection = ServiceError;

    async fn from_request(req: &mut RequestParts<B>) -> Result<Self, Self::Rejection> {
        let headers = req.headers();

        let id = headers
            .get(PRINCIPAL_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                ServiceError::Forbidden(format!("{} header is required", PRINCIPAL_ID_HEADER))
            })?
            .to_owned();

        // comma separated
        let role_ids = headers
            .get(PRINCIPAL_ROLES_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|role_id| !role_id.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Principal { id, role_ids })
    }
}
