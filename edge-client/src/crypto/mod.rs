//! Node identity: RSA key pair on disk, detached signatures, and RS256 tokens.

pub mod jwt;
pub mod keys;

pub use jwt::{generate_jwt, parse_time_to_seconds, verify_jwt, Claims, TokenIssuer};
pub use keys::{ensure_key_pair, sign_data, verify_signature, KeyPaths, NodeKeys};

#[cfg(test)]
pub(crate) fn test_keys() -> &'static NodeKeys {
    use std::sync::OnceLock;

    static KEYS: OnceLock<NodeKeys> = OnceLock::new();
    KEYS.get_or_init(|| NodeKeys::generate().expect("key generation"))
}
