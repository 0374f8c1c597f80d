use aliri_braid::braid;
use std::fmt;

macro_rules! limited_reveal {
    ($ty:ty: $hidden:literal, $default:literal) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    f.write_str("\"")?;
                    limited_reveal(self.as_str(), &mut *f, $default)?;
                    f.write_str("\"")
                } else {
                    f.write_str(concat!("***", $hidden, "***"))
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    limited_reveal(self.as_str(), &mut *f, usize::MAX)
                } else {
                    f.write_str(concat!("***", $hidden, "***"))
                }
            }
        }
    };
}

/// Writes at most `f.width()` (or `default_len`) characters of a secret,
/// marking truncation with an ellipsis
fn limited_reveal(unprotected: &str, f: &mut fmt::Formatter, default_len: usize) -> fmt::Result {
    let max_len = f.width().unwrap_or(default_len);
    if unprotected.chars().nth(max_len).is_none() {
        return f.write_str(unprotected);
    }

    if max_len <= 1 {
        return f.write_str("…");
    }

    match unprotected.char_indices().nth(max_len - 1) {
        Some((idx, _)) => {
            f.write_str(&unprotected[..idx])?;
            f.write_str("…")
        }
        None => f.write_str(unprotected),
    }
}

/// A JWT access token issued by the auth server
#[braid(serde, debug = "owned", display = "owned")]
pub struct AccessToken;

limited_reveal!(AccessTokenRef: "ACCESS TOKEN", 15);

/// A refresh token, exchanged for a new session when the access token expires
#[braid(serde, debug = "owned", display = "owned")]
pub struct RefreshToken;

limited_reveal!(RefreshTokenRef: "REFRESH TOKEN", 5);

/// A token issued by an upstream OAuth provider (GitHub, Google, …)
#[braid(serde, debug = "owned", display = "owned")]
pub struct ProviderToken;

limited_reveal!(ProviderTokenRef: "PROVIDER TOKEN", 5);

/// A PKCE code verifier, the locally-held secret bound to an authorization code
#[braid(serde, debug = "owned", display = "owned")]
pub struct CodeVerifier;

limited_reveal!(CodeVerifierRef: "CODE VERIFIER", 5);

/// An authorization code returned to the redirect URL of a PKCE flow
#[braid(serde)]
pub struct AuthCode;
