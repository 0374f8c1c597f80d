//! Decoding JWT claims and caching the server's signing keys
//!
//! Signature checks themselves are left to a pluggable [`JwtVerifier`]; this
//! module only parses tokens, checks their expiry and keeps the JWKS handy.

use std::{fmt, time::Duration};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use gotrue_clock::UnixTime;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::AuthError;

/// How long a fetched key set is reused before asking the server again
pub const JWKS_TTL: Duration = Duration::from_secs(10 * 60);

/// The JOSE header of a JWT
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwtHeader {
    /// Signing algorithm
    pub alg: String,
    /// Identifier of the signing key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    /// Token type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,
}

impl JwtHeader {
    /// Whether the token is signed with a shared secret, which only the auth
    /// server can check
    pub fn is_symmetric(&self) -> bool {
        self.alg.starts_with("HS")
    }
}

/// Claims carried by an access token
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JwtClaims {
    /// Subject (the user id)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// Expiry time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<UnixTime>,
    /// Issue time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<UnixTime>,
    /// Database role
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Server-side session identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Every other claim
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A JWT split into its parts
#[derive(Clone, Debug)]
pub struct DecodedJwt {
    /// The decoded header
    pub header: JwtHeader,
    /// The decoded claims
    pub claims: JwtClaims,
    /// The signed `<header>.<payload>` text
    pub signing_input: String,
    /// The raw signature bytes
    pub signature: Vec<u8>,
}

fn decode_segment<T: DeserializeOwned>(segment: &str, what: &str) -> Result<T, AuthError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|err| AuthError::JwtInvalid(format!("{} is not base64url: {}", what, err)))?;
    serde_json::from_slice(&bytes)
        .map_err(|err| AuthError::JwtInvalid(format!("{} is not valid JSON: {}", what, err)))
}

/// Splits and decodes a compact JWT without checking its signature
pub fn decode_jwt(token: &str) -> Result<DecodedJwt, AuthError> {
    let mut parts = token.split('.');
    let (Some(header), Some(payload), Some(signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(AuthError::JwtInvalid("expected three segments".into()));
    };

    let signature = URL_SAFE_NO_PAD
        .decode(signature.trim_end_matches('='))
        .map_err(|err| AuthError::JwtInvalid(format!("signature is not base64url: {}", err)))?;

    Ok(DecodedJwt {
        header: decode_segment(header, "header")?,
        claims: decode_segment(payload, "payload")?,
        signing_input: format!("{}.{}", header, payload),
        signature,
    })
}

/// Rejects claims that expired at or before `now`
///
/// Tokens without an `exp` claim are accepted.
pub fn validate_exp(claims: &JwtClaims, now: UnixTime) -> Result<(), AuthError> {
    match claims.exp {
        Some(exp) if exp <= now => Err(AuthError::JwtInvalid(format!(
            "token expired at {}",
            exp.0
        ))),
        _ => Ok(()),
    }
}

/// A JSON web key
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type (`RSA`, `EC`, `oct`, …)
    pub kty: String,
    /// Key identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    /// Algorithm the key is meant for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    /// Key material and any other parameters
    #[serde(flatten)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

/// A JSON web key set
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Jwks {
    /// The keys
    #[serde(default)]
    pub keys: Vec<Jwk>,
}

impl Jwks {
    /// Finds the key with identifier `kid`
    pub fn find(&self, kid: &str) -> Option<&Jwk> {
        self.keys.iter().find(|key| key.kid.as_deref() == Some(kid))
    }
}

/// Checks a JWT signature against a key
pub trait JwtVerifier: Send + Sync + fmt::Debug {
    /// Verifies `jwt` was signed by `key`
    fn verify(&self, jwt: &DecodedJwt, key: &Jwk) -> Result<(), AuthError>;
}

/// The verified contents of a JWT
#[derive(Clone, Debug)]
pub struct ClaimsResponse {
    /// The claims
    pub claims: JwtClaims,
    /// The header
    pub header: JwtHeader,
    /// The signature bytes
    pub signature: Vec<u8>,
}

impl From<DecodedJwt> for ClaimsResponse {
    fn from(jwt: DecodedJwt) -> Self {
        Self {
            claims: jwt.claims,
            header: jwt.header,
            signature: jwt.signature,
        }
    }
}
