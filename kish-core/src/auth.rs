//! Bearer token authentication for tunnel creation.
//!
//! Tokens are HS256 JWTs signed by the client with a secret shared with the
//! server under a key ID. The payload names the key ID, so the server looks
//! it up before the signature can be checked.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

use crate::error::AuthError;
use crate::keystore::KeyStore;

/// Longest accepted gap between `nbf` and `exp`, in seconds.
pub const MAX_TOKEN_LIFETIME: i64 = 600;

/// Clock skew tolerated on both ends of the validity window, in seconds.
pub const CLOCK_LEEWAY: i64 = 60;

/// How far before and after "now" a generated token is valid.
pub const TOKEN_HALF_WINDOW: i64 = 300;

/// Claims that name the key they were signed with.
pub trait KeyId {
    fn key_id(&self) -> &str;
}

/// Claims with a bounded validity window and a unique ID.
pub trait Validity {
    fn not_before(&self) -> Option<i64>;
    fn expires_at(&self) -> Option<i64>;
    fn token_id(&self) -> Option<&str>;
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// What a tunnel asks for: its hostname and who may reach it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(rename = "allowIP", default, deserialize_with = "null_as_default")]
    pub allow_ip: Vec<String>,
    #[serde(rename = "basicAuth", default, deserialize_with = "null_as_default")]
    pub basic_auth: HashMap<String, String>,
    #[serde(rename = "allowMyIP", default)]
    pub allow_my_ip: bool,
}

impl ProxyParameters {
    /// The explicitly requested host, if any.
    pub fn requested_host(&self) -> Option<&str> {
        self.host.as_deref().map(str::trim).filter(|h| !h.is_empty())
    }
}

/// Payload of a tunnel-creation token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyClaims {
    #[serde(rename = "keyID")]
    pub key_id: String,
    #[serde(flatten)]
    pub params: ProxyParameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

impl KeyId for ProxyClaims {
    fn key_id(&self) -> &str {
        &self.key_id
    }
}

impl Validity for ProxyClaims {
    fn not_before(&self) -> Option<i64> {
        self.nbf
    }

    fn expires_at(&self) -> Option<i64> {
        self.exp
    }

    fn token_id(&self) -> Option<&str> {
        self.jti.as_deref()
    }
}

/// Verifies tokens against the secrets of a key store.
pub struct Authenticator<K> {
    keys: K,
}

impl<K: KeyStore> Authenticator<K> {
    pub fn new(keys: K) -> Self {
        Self { keys }
    }

    /// Validate a token against the current wall-clock time.
    pub fn validate<C>(&self, token: &str) -> Result<C, AuthError>
    where
        C: DeserializeOwned + KeyId + Validity,
    {
        self.validate_at(token, now_secs())
    }

    /// Validate a token as of `now` (seconds since the Unix epoch).
    pub fn validate_at<C>(&self, token: &str, now: i64) -> Result<C, AuthError>
    where
        C: DeserializeOwned + KeyId + Validity,
    {
        let unverified: C = decode_unverified(token)?;
        let secret = self
            .keys
            .secret(unverified.key_id())
            .ok_or(AuthError::KeyNotFound)?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let data = jsonwebtoken::decode::<C>(token, &DecodingKey::from_secret(&secret), &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
                    AuthError::InvalidSignature
                }
                _ => AuthError::Malformed,
            })?;

        check_window(&data.claims, now)?;
        Ok(data.claims)
    }
}

fn decode_unverified<C: DeserializeOwned>(token: &str) -> Result<C, AuthError> {
    let mut parts = token.split('.');
    let payload = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(payload), Some(_), None) => payload,
        _ => return Err(AuthError::Malformed),
    };
    let json = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|_| AuthError::Malformed)?;
    serde_json::from_slice(&json).map_err(|_| AuthError::Malformed)
}

fn check_window<C: Validity>(claims: &C, now: i64) -> Result<(), AuthError> {
    let (nbf, exp) = match (claims.not_before(), claims.expires_at(), claims.token_id()) {
        (Some(nbf), Some(exp), Some(id)) if !id.is_empty() => (nbf, exp),
        _ => return Err(AuthError::MissingClaims),
    };
    match exp.checked_sub(nbf) {
        Some(lifetime) if lifetime <= MAX_TOKEN_LIFETIME => {}
        _ => return Err(AuthError::LifetimeTooLong),
    }
    if now > exp.saturating_add(CLOCK_LEEWAY) {
        return Err(AuthError::Expired);
    }
    if now.saturating_add(CLOCK_LEEWAY) < nbf {
        return Err(AuthError::NotYetValid);
    }
    Ok(())
}

/// Sign a tunnel-creation token valid from `now - 300` to `now + 300`.
pub fn generate_token(
    now: i64,
    params: &ProxyParameters,
    key: &[u8],
    key_id: &str,
) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = ProxyClaims {
        key_id: key_id.to_string(),
        params: params.clone(),
        nbf: Some(now - TOKEN_HALF_WINDOW),
        exp: Some(now + TOKEN_HALF_WINDOW),
        jti: Some(uuid::Uuid::new_v4().to_string()),
    };
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(key),
    )
}

/// Pull the token out of an `Authorization: Bearer <token>` header value.
pub fn extract_bearer_token(header: &str) -> Result<&str, AuthError> {
    let token = header
        .strip_prefix("Bearer ")
        .filter(|rest| !rest.contains("Bearer "))
        .map(str::trim)
        .ok_or(AuthError::Malformed)?;
    if token.is_empty() {
        return Err(AuthError::Malformed);
    }
    Ok(token)
}

/// Seconds since the Unix epoch.
pub fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
