/// Cryptographic helpers
///
/// Password hashing (bcrypt, offloaded to the blocking pool) and the opaque
/// token primitives shared by sessions, refresh tokens and the revocation
/// ledger.

pub mod password;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Bytes of entropy in generated opaque tokens
pub const SECURE_TOKEN_BYTES: usize = 32;

/// Generate a URL-safe random token from the OS CSPRNG
pub fn generate_secure_token() -> String {
    let mut bytes = [0u8; SECURE_TOKEN_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// SHA-256 hex digest of a token. This is the only form in which tokens are
/// persisted or looked up.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Short, log-safe reference to a token
pub fn token_fingerprint(token: &str) -> String {
    hash_token(token)[..12].to_string()
}
