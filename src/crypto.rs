//! Randomness and PKCE helpers shared by login and connection grants.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// Generate cryptographically secure random bytes.
pub fn generate_random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Unguessable hex token, used for OAuth `state` and session ids
pub fn random_token() -> String {
    hex::encode(generate_random_bytes::<24>())
}

/// PKCE verifier/challenge pair (RFC 7636, S256)
pub struct Pkce {
    pub verifier: Zeroizing<String>,
    pub challenge: String,
}

impl Pkce {
    pub fn generate() -> Self {
        let verifier = Zeroizing::new(URL_SAFE_NO_PAD.encode(generate_random_bytes::<32>()));
        let challenge = challenge_for(&verifier);
        Self {
            verifier,
            challenge,
        }
    }
}

/// S256 challenge for a verifier
pub fn challenge_for(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}
