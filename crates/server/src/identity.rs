use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Query},
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use parley_core::UserId;
use parley_crypto::{
    encode_key, generate_signing_key, sign_message, signing_key_from_base64, verify_signature,
    verifying_key_from, verifying_key_from_base64, Signature, SigningKey, VerifyingKey,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{config::IdentityConfig, messaging::ErrorBody, AppState};

const TOKEN_HEADER: &str = "token";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("credential missing")]
    Missing,
    #[error("credential malformed")]
    Malformed,
    #[error("credential signature invalid")]
    InvalidSignature,
    #[error("credential expired")]
    Expired,
}

/// Maps a validated credential to a stable user id.
#[async_trait]
pub trait IdentityService: Send + Sync {
    async fn verify(&self, credential: &str) -> Result<UserId, AuthError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenClaims {
    user_id: UserId,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Issues and verifies `<claims>.<signature>` credentials signed with ed25519.
#[derive(Clone)]
pub struct TokenAuthority {
    signing_key: SigningKey,
    verifying_keys: Vec<VerifyingKey>,
    ttl: Duration,
}

impl TokenAuthority {
    pub fn from_config(config: &IdentityConfig) -> Result<Self> {
        let signing_key = match config.signing_key.as_deref() {
            Some(raw) => signing_key_from_base64(raw).context("identity.signing_key")?,
            None => generate_signing_key(),
        };

        let mut verifying_keys = vec![verifying_key_from(&signing_key)];
        for raw in &config.fallback_verifying_keys {
            verifying_keys.push(
                verifying_key_from_base64(raw).context("identity.fallback_verifying_keys")?,
            );
        }

        let ttl = Duration::try_hours(config.token_ttl_hours)
            .filter(|ttl| *ttl > Duration::zero())
            .ok_or_else(|| {
                anyhow!(
                    "identity.token_ttl_hours must be positive and representable, got {}",
                    config.token_ttl_hours
                )
            })?;

        Ok(Self {
            signing_key,
            verifying_keys,
            ttl,
        })
    }

    pub fn verifying_key_base64(&self) -> String {
        encode_key(verifying_key_from(&self.signing_key).as_bytes())
    }

    pub fn issue(&self, user_id: UserId) -> Result<IssuedToken> {
        self.issue_at(user_id, Utc::now())
    }

    fn issue_at(&self, user_id: UserId, issued_at: DateTime<Utc>) -> Result<IssuedToken> {
        let expires_at = issued_at
            .checked_add_signed(self.ttl)
            .context("token expiry out of range")?;
        let claims = TokenClaims {
            user_id,
            issued_at,
            expires_at,
        };
        let payload = serde_json::to_vec(&claims)?;
        let signature = sign_message(&self.signing_key, &payload);

        let token = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        );
        Ok(IssuedToken { token, expires_at })
    }

    fn decode(&self, credential: &str) -> Result<TokenClaims, AuthError> {
        let (payload, signature) = credential
            .trim()
            .split_once('.')
            .ok_or(AuthError::Malformed)?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| AuthError::Malformed)?;
        let signature: [u8; 64] = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| AuthError::Malformed)?
            .try_into()
            .map_err(|_| AuthError::Malformed)?;
        let signature = Signature::from_bytes(&signature);

        let trusted = self
            .verifying_keys
            .iter()
            .any(|key| verify_signature(key, &payload, &signature).is_ok());
        if !trusted {
            return Err(AuthError::InvalidSignature);
        }

        serde_json::from_slice(&payload).map_err(|_| AuthError::Malformed)
    }
}

#[async_trait]
impl IdentityService for TokenAuthority {
    async fn verify(&self, credential: &str) -> Result<UserId, AuthError> {
        let claims = self.decode(credential)?;
        if claims.expires_at <= Utc::now() {
            return Err(AuthError::Expired);
        }
        Ok(claims.user_id)
    }
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// `Authorization: Bearer`, then the `token` header, then a `token` query
/// parameter (browsers cannot set headers on a WebSocket handshake).
fn credential_from_parts(parts: &Parts) -> Option<String> {
    if let Some(value) = parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
    {
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
    }

    if let Some(token) = parts
        .headers
        .get(TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        return Some(token.trim().to_string());
    }

    Query::<TokenQuery>::try_from_uri(&parts.uri)
        .ok()
        .and_then(|Query(query)| query.token)
}

/// The caller's user id, derived from the request credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticatedUser(pub UserId);

impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let verified = match credential_from_parts(parts).filter(|token| !token.is_empty()) {
            Some(token) => state.identity().verify(&token).await,
            None => Err(AuthError::Missing),
        };

        verified.map(AuthenticatedUser).map_err(|err| {
            tracing::debug!(error = %err, "rejected request credential");
            (
                StatusCode::UNAUTHORIZED,
                Json(ErrorBody::new("unauthorized", Some(err.to_string()))),
            )
                .into_response()
        })
    }
}
