// =============================================================================
// Bearer Token Authentication
// =============================================================================
//
// Every endpoint except the health probe requires `Authorization: Bearer
// <token>` matching the `MERIDIAN_ADMIN_TOKEN` environment variable. The
// comparison is constant time; the same primitive guards the kill-switch
// override token.
//
// The token is read per request so rotation does not require a restart.
// =============================================================================

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

/// Compare two byte slices in constant time. Every byte of equal-length
/// inputs is examined even after a mismatch, so timing does not reveal the
/// position of the first differing byte.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn expected_token() -> String {
    std::env::var("MERIDIAN_ADMIN_TOKEN")
        .or_else(|_| std::env::var("ADMIN_TOKEN"))
        .unwrap_or_default()
}

/// Axum extractor yielding the validated bearer token.
pub struct AuthBearer(pub String);

pub struct AuthRejection {
    message: &'static str,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "success": false,
            "error": self.message,
        });
        (StatusCode::FORBIDDEN, axum::Json(body)).into_response()
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthBearer
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let expected = expected_token();
        if expected.is_empty() {
            warn!("MERIDIAN_ADMIN_TOKEN is not set; rejecting authenticated request");
            return Err(AuthRejection {
                message: "server authentication not configured",
            });
        }

        let token = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        match token {
            Some(token) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => {
                Ok(AuthBearer(token.to_string()))
            }
            Some(_) => {
                warn!("invalid admin token presented");
                Err(AuthRejection {
                    message: "invalid authorization token",
                })
            }
            None => Err(AuthRejection {
                message: "missing or malformed authorization header",
            }),
        }
    }
}
