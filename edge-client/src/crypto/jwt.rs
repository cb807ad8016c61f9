use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{
    decode, encode, get_current_timestamp, Algorithm, DecodingKey, EncodingKey, Header,
    Validation,
};
use serde_json::{json, Map, Value};

use super::NodeKeys;
use crate::error::JwtError;

pub type Claims = Map<String, Value>;

/// Parse `<integer>[smhd]` into seconds.
pub fn parse_time_to_seconds(input: &str) -> Result<u64, JwtError> {
    let invalid = || JwtError::InvalidDuration(input.to_string());

    let (split, unit) = input.char_indices().last().ok_or_else(invalid)?;
    let digits = &input[..split];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let amount: u64 = digits.parse().map_err(|_| invalid())?;

    let multiplier = match unit {
        's' => 1,
        'm' => 60,
        'h' => 60 * 60,
        'd' => 24 * 60 * 60,
        _ => return Err(invalid()),
    };

    amount.checked_mul(multiplier).ok_or_else(invalid)
}

/// Issue an RS256 token carrying `payload` plus `iat` and `exp`.
pub fn generate_jwt(
    payload: &Claims,
    private_key: &EncodingKey,
    expires_in: &str,
) -> Result<String, JwtError> {
    let ttl = parse_time_to_seconds(expires_in)?;
    let now = get_current_timestamp();

    let mut claims = payload.clone();
    claims.insert("iat".to_string(), json!(now));
    claims.insert("exp".to_string(), json!(now + ttl));

    encode(&Header::new(Algorithm::RS256), &claims, private_key)
        .map_err(|e| JwtError::Issue(e.to_string()))
}

/// Verify signature and expiry, returning the decoded claims.
///
/// Format problems are reported before the signature is looked at, and a bad
/// signature is reported before expiry.
pub fn verify_jwt(token: &str, public_key: &DecodingKey) -> Result<Claims, JwtError> {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 || segments.iter().any(|s| s.is_empty()) {
        return Err(JwtError::InvalidFormat);
    }

    for segment in &segments[..2] {
        let bytes = URL_SAFE_NO_PAD
            .decode(segment)
            .map_err(|_| JwtError::InvalidFormat)?;
        let value: Value = serde_json::from_slice(&bytes).map_err(|_| JwtError::InvalidFormat)?;
        if !value.is_object() {
            return Err(JwtError::InvalidFormat);
        }
    }

    let mut validation = Validation::new(Algorithm::RS256);
    validation.leeway = 0;
    validation.validate_aud = false;
    validation.set_required_spec_claims(&["exp"]);

    decode::<Claims>(token, public_key, &validation)
        .map(|data| data.claims)
        .map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => JwtError::Expired,
            // Header and payload were checked above, so a decode failure here
            // can only come from the signature segment.
            ErrorKind::InvalidSignature
            | ErrorKind::InvalidAlgorithm
            | ErrorKind::Base64(_)
            | ErrorKind::Crypto(_) => JwtError::InvalidSignature,
            _ => JwtError::InvalidFormat,
        })
}

/// Issues the short-lived bearer token used for every authenticated call.
/// Tokens are never cached; each call signs a new one.
#[derive(Clone)]
pub struct TokenIssuer {
    keys: Arc<NodeKeys>,
    node_id: String,
    node_name: String,
    ttl: String,
}

impl TokenIssuer {
    pub fn new(keys: Arc<NodeKeys>, node_id: String, node_name: String, ttl: String) -> Self {
        Self {
            keys,
            node_id,
            node_name,
            ttl,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn issue(&self) -> Result<String, JwtError> {
        let mut payload = Claims::new();
        payload.insert("nodeId".to_string(), json!(self.node_id));
        payload.insert("nodeName".to_string(), json!(self.node_name));
        payload.insert("type".to_string(), json!("edge-client"));

        generate_jwt(&payload, self.keys.jwt_encoding_key(), &self.ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_keys;
    use std::time::Duration;

    fn sample_payload() -> Claims {
        let mut payload = Claims::new();
        payload.insert("nodeId".to_string(), json!("node-42"));
        payload.insert("scopes".to_string(), json!(["proxy", "report"]));
        payload
    }

    #[test]
    fn test_parse_time_to_seconds() {
        assert_eq!(parse_time_to_seconds("30s").unwrap(), 30);
        assert_eq!(parse_time_to_seconds("15m").unwrap(), 900);
        assert_eq!(parse_time_to_seconds("1h").unwrap(), 3600);
        assert_eq!(parse_time_to_seconds("2d").unwrap(), 172_800);
    }

    #[test]
    fn test_parse_time_rejects_bad_grammar() {
        for input in ["", "h", "10", "10w", "-5s", "1.5h", "ten s"] {
            assert_eq!(
                parse_time_to_seconds(input),
                Err(JwtError::InvalidDuration(input.to_string())),
                "input {:?}",
                input
            );
        }
    }

    #[test]
    fn test_parse_time_rejects_sign_and_whitespace() {
        for input in ["+5s", " 5s", "5s ", " 5s ", "5 s", "\t1h"] {
            assert!(
                parse_time_to_seconds(input).is_err(),
                "input {:?} should be rejected",
                input
            );
        }
        assert_eq!(parse_time_to_seconds("05s").unwrap(), 5);
    }

    #[test]
    fn test_jwt_round_trip() {
        let keys = test_keys();
        let payload = sample_payload();

        let token = generate_jwt(&payload, keys.jwt_encoding_key(), "1h").unwrap();
        let claims = verify_jwt(&token, keys.jwt_decoding_key()).unwrap();

        let iat = claims["iat"].as_u64().unwrap();
        let exp = claims["exp"].as_u64().unwrap();
        assert_eq!(exp - iat, 3600);

        let mut stripped = claims.clone();
        stripped.remove("iat");
        stripped.remove("exp");
        assert_eq!(stripped, payload);
    }

    #[test]
    fn test_signature_segment_is_unpadded_base64url() {
        let keys = test_keys();
        let token = generate_jwt(&sample_payload(), keys.jwt_encoding_key(), "1h").unwrap();
        let signature = token.rsplit('.').next().unwrap();

        assert!(!signature.contains('='));
        assert!(!signature.contains('+'));
        assert!(!signature.contains('/'));
    }

    #[test]
    fn test_tampered_signature_is_rejected() {
        let keys = test_keys();
        let token = generate_jwt(&sample_payload(), keys.jwt_encoding_key(), "1h").unwrap();

        let (head, signature) = token.rsplit_once('.').unwrap();
        let mut chars: Vec<char> = signature.chars().collect();
        chars[10] = if chars[10] == 'A' { 'B' } else { 'A' };
        let tampered = format!("{}.{}", head, chars.into_iter().collect::<String>());

        assert_eq!(
            verify_jwt(&tampered, keys.jwt_decoding_key()),
            Err(JwtError::InvalidSignature)
        );
    }

    #[test]
    fn test_token_from_other_key_is_rejected() {
        let keys = test_keys();
        let other = NodeKeys::generate().unwrap();
        let token = generate_jwt(&sample_payload(), other.jwt_encoding_key(), "1h").unwrap();

        assert_eq!(
            verify_jwt(&token, keys.jwt_decoding_key()),
            Err(JwtError::InvalidSignature)
        );
    }

    #[test]
    fn test_malformed_tokens() {
        let keys = test_keys();
        for token in ["", "abc", "a.b", "a.b.c.d", "..", "!!!.???.sig"] {
            assert_eq!(
                verify_jwt(token, keys.jwt_decoding_key()),
                Err(JwtError::InvalidFormat),
                "token {:?}",
                token
            );
        }
    }

    #[test]
    fn test_expired_token() {
        let keys = test_keys();
        let token = generate_jwt(&sample_payload(), keys.jwt_encoding_key(), "1s").unwrap();

        std::thread::sleep(Duration::from_secs(2));

        assert_eq!(
            verify_jwt(&token, keys.jwt_decoding_key()),
            Err(JwtError::Expired)
        );
    }

    #[test]
    fn test_issuer_payload() {
        let keys = Arc::new(test_keys().clone());
        let issuer = TokenIssuer::new(
            keys.clone(),
            "node-7".to_string(),
            "edge-tokyo".to_string(),
            "1h".to_string(),
        );

        let claims = verify_jwt(&issuer.issue().unwrap(), keys.jwt_decoding_key()).unwrap();

        assert_eq!(claims["nodeId"], "node-7");
        assert_eq!(claims["nodeName"], "edge-tokyo");
        assert_eq!(claims["type"], "edge-client");
    }
}
