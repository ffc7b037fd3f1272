use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Session descriptor carried by a gateway-verified token.
///
/// Session issuance lives in the auth service; this crate only consumes the
/// validated `{user_id, type}` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    User,
    Service,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    #[serde(rename = "typ")]
    pub session_type: SessionType,
    pub iat: i64,
    pub exp: i64,
    pub jti: Uuid,
}

impl Claims {
    pub fn new(user_id: Uuid, session_type: SessionType, duration_secs: i64) -> Self {
        let now = Utc::now().timestamp();
        Self {
            sub: user_id,
            session_type,
            iat: now,
            exp: now + duration_secs,
            jti: Uuid::now_v7(),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() > self.exp
    }
}

#[derive(Debug, Clone)]
pub struct AuthSession {
    pub user_id: Uuid,
    pub session_type: SessionType,
    pub token_id: Uuid,
}

impl From<Claims> for AuthSession {
    fn from(claims: Claims) -> Self {
        Self {
            user_id: claims.sub,
            session_type: claims.session_type,
            token_id: claims.jti,
        }
    }
}

/// General request parameters every client call carries alongside the
/// session token. All fields are optional at the transport level; operations
/// that require one (`client_id` for streaming) enforce it themselves.
#[derive(Debug, Clone, Default)]
pub struct GeneralParams {
    pub client_id: Option<String>,
    pub lang: Option<String>,
    pub platform: Option<String>,
    pub timezone: Option<String>,
}
