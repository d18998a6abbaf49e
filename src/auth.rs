use crate::errors::{Error, Result};
use crate::params::{Instance, Scope};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

/// How long an instance has to bootstrap and call home before its token
/// stops validating.
const TOKEN_LIFETIME_MINUTES: i64 = 30;

/// Claims carried by the token an instance presents on the status callback.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstanceClaims {
    /// Instance name.
    pub sub: String,
    pub pool_id: String,
    pub scope: String,
    pub exp: i64,
}

/// Issues the signed token baked into an instance's bootstrap payload.
#[cfg_attr(test, mockall::automock)]
pub trait InstanceTokenIssuer: Send + Sync {
    fn issue(&self, instance: &Instance, scope: &Scope) -> Result<String>;
}

/// HS256 token authority shared by the pool managers (issuing) and the
/// callback handler (verifying).
pub struct JwtTokenAuthority {
    secret: String,
}

impl JwtTokenAuthority {
    pub fn new(secret: String) -> Self {
        Self { secret }
    }

    pub fn verify(&self, token: &str) -> Result<InstanceClaims> {
        let data = decode::<InstanceClaims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|e| Error::unauthorized(format!("invalid instance token: {e}")))?;
        Ok(data.claims)
    }
}

impl InstanceTokenIssuer for JwtTokenAuthority {
    fn issue(&self, instance: &Instance, scope: &Scope) -> Result<String> {
        let claims = InstanceClaims {
            sub: instance.name.clone(),
            pool_id: instance.pool_id.clone(),
            scope: scope.path(),
            exp: (chrono::Utc::now() + chrono::Duration::minutes(TOKEN_LIFETIME_MINUTES))
                .timestamp(),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| Error::fatal(format!("signing instance token: {e}")))
    }
}
