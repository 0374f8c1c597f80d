//! Proof Key for Code Exchange
//!
//! Starting a flow stores a fresh code verifier under
//! `<storage key>-code-verifier`; exchanging the authorization code later
//! consumes it. The stored value is a JSON string holding the verifier,
//! followed by `/PASSWORD_RECOVERY` when the flow was started for a password
//! reset.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::{CodeVerifier, CodeVerifierRef};

const RECOVERY_TAG: &str = "PASSWORD_RECOVERY";

/// Why a PKCE flow was started
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PkceFlow {
    /// A regular sign-in (OAuth, magic link, …)
    #[default]
    SignIn,
    /// A password recovery link
    PasswordRecovery,
}

/// The challenge to send along with the authorization request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PkceChallenge {
    /// `BASE64URL(SHA256(verifier))`
    pub code_challenge: String,
    /// Always `s256`
    pub code_challenge_method: &'static str,
}

/// Where the client stands in a PKCE flow
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PkceState {
    /// No verifier is stored
    NoFlow,
    /// A verifier is stored and waiting for its authorization code
    CodeIssued {
        /// Why the flow was started
        flow: PkceFlow,
    },
}

/// Generates a random 64-character URL-safe code verifier
pub fn generate_code_verifier() -> CodeVerifier {
    let mut random_bytes = [0u8; 48];
    rand::thread_rng().fill_bytes(&mut random_bytes);
    CodeVerifier::new(URL_SAFE_NO_PAD.encode(random_bytes))
}

/// Computes the S256 challenge for `verifier`
pub fn code_challenge(verifier: &CodeVerifierRef) -> PkceChallenge {
    let hash = Sha256::digest(verifier.as_str().as_bytes());
    PkceChallenge {
        code_challenge: URL_SAFE_NO_PAD.encode(hash),
        code_challenge_method: "s256",
    }
}

/// Renders the value stored for an issued verifier
pub(crate) fn encode_stored(verifier: &CodeVerifierRef, flow: PkceFlow) -> String {
    let raw = match flow {
        PkceFlow::SignIn => verifier.as_str().to_owned(),
        PkceFlow::PasswordRecovery => format!("{}/{}", verifier.as_str(), RECOVERY_TAG),
    };
    serde_json::Value::String(raw).to_string()
}

/// Parses a stored verifier, accepting bare strings written by older clients
pub(crate) fn decode_stored(stored: &str) -> Option<(CodeVerifier, PkceFlow)> {
    let raw = serde_json::from_str::<String>(stored).unwrap_or_else(|_| stored.to_owned());
    let (verifier, flow) = match raw.split_once('/') {
        Some((verifier, RECOVERY_TAG)) => (verifier, PkceFlow::PasswordRecovery),
        Some((verifier, _)) => (verifier, PkceFlow::SignIn),
        None => (raw.as_str(), PkceFlow::SignIn),
    };

    if verifier.is_empty() {
        None
    } else {
        Some((CodeVerifier::from(verifier), flow))
    }
}
