//! Request-token signing and webhook signatures.
//!
//! A request token is the lowercase-hex SHA-256 of the request's scalar
//! parameters: drop non-scalars and empty values, mix in the merchant
//! secret under the `Password` key, sort by key byte-wise ascending and
//! concatenate the value strings with no separator. Nested structures are
//! excluded on purpose so every client library hashes the same bytes no
//! matter how it serializes maps and lists.

use hmac::{Hmac, Mac};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Key under which the merchant secret joins the digest input.
const PASSWORD_KEY: &str = "Password";

/// The token field itself never participates in its own digest.
const TOKEN_KEY: &str = "token";

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(v) if !v.is_empty() => Some(v.clone()),
        Value::Number(v) => Some(s!(v)),
        Value::Bool(true) => Some(s!("true")),
        Value::Bool(false) => Some(s!("false")),
        _ => None,
    }
}

/// Deterministic token over the scalar request parameters plus the secret.
pub fn sign(params: &Map<String, Value>, secret: &str) -> String {
    // String's Ord is a byte-wise comparison, which is exactly the
    // ordering contract of the token.
    let mut entries: BTreeMap<&str, String> = params
        .iter()
        .filter(|(key, _)| key.as_str() != TOKEN_KEY && key.as_str() != PASSWORD_KEY)
        .filter_map(|(key, value)| scalar_string(value).map(|v| (key.as_str(), v)))
        .collect();
    entries.insert(PASSWORD_KEY, s!(secret));

    let mut hasher = Sha256::new();
    for value in entries.values() {
        hasher.update(value.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Constant-time token check.
pub fn verify(params: &Map<String, Value>, expected: &str, secret: &str) -> bool {
    let actual = sign(params, secret);
    actual.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Lowercase-hex HMAC-SHA256, used for webhook signatures and the hosted
/// form CSRF token.
pub fn hmac_sha256_hex(key: &[u8], data: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time comparison of an HMAC hex signature.
pub fn hmac_verify(key: &[u8], data: &[u8], expected: &str) -> bool {
    hmac_sha256_hex(key, data)
        .as_bytes()
        .ct_eq(expected.as_bytes())
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn known_vector() {
        // concatenation is "secret123" + "100000" + "RUB" + "O1" + "demo-team"
        let p = params(json!({
            "teamSlug": "demo-team",
            "amount": 100000,
            "currency": "RUB",
            "orderId": "O1",
        }));
        assert_eq!(
            sign(&p, "secret123"),
            "2d43070565a26fdedb667cdc87851b25002cd0625469e2ef3a8c236dd87cf0cd"
        );
    }

    #[test]
    fn empty_params_hash_only_the_secret() {
        let p = params(json!({}));
        assert_eq!(
            sign(&p, "secret123"),
            "fcf730b6d95236ecd3c9fc2d92d7b6b2bb061514961aec041d6c7a7192f592e4"
        );
    }

    #[test]
    fn non_scalars_and_empties_are_dropped() {
        let base = params(json!({"amount": 100, "orderId": "hello"}));
        let noisy = params(json!({
            "amount": 100,
            "orderId": "hello",
            "data": {"k": "v"},
            "items": [1, 2, 3],
            "description": "",
            "customerKey": null,
        }));
        assert_eq!(sign(&base, "x"), sign(&noisy, "x"));
    }

    #[test]
    fn token_field_is_excluded() {
        let without = params(json!({"amount": 1}));
        let with = params(json!({"amount": 1, "token": "deadbeef"}));
        assert_eq!(sign(&without, "x"), sign(&with, "x"));
    }

    #[test]
    fn booleans_render_lowercase_and_keys_sort_bytewise() {
        // keys sort as "Password" < "a" < "b": "true" + "100" + "hello"
        let p = params(json!({"a": 100, "b": "hello"}));
        assert_eq!(
            sign(&p, "true"),
            "99567a85b9b6b17d8f9d2d681cd17f618446494cee365f3bb613c807d6455343"
        );
        let p2 = params(json!({"a": 100, "b": "hello", "flag": false}));
        assert_ne!(sign(&p2, "true"), sign(&p, "true"));
    }

    #[test]
    fn signing_is_pure() {
        let p = params(json!({"orderId": "O-42", "amount": 555, "recurrent": true}));
        assert_eq!(sign(&p, "k"), sign(&p, "k"));
        assert_ne!(sign(&p, "k"), sign(&p, "other"));
    }

    #[test]
    fn verify_accepts_only_the_exact_token() {
        let p = params(json!({"amount": 1}));
        let token = sign(&p, "k");
        assert!(verify(&p, &token, "k"));
        assert!(!verify(&p, &token, "wrong"));
        assert!(!verify(&p, "deadbeef", "k"));
        assert!(!verify(&p, "", "k"));
    }

    #[test]
    fn hmac_round_trip() {
        let sig = hmac_sha256_hex(b"secret123", b"{\"paymentId\":\"1\"}");
        assert_eq!(sig.len(), 64);
        assert!(hmac_verify(b"secret123", b"{\"paymentId\":\"1\"}", &sig));
        assert!(!hmac_verify(b"secret124", b"{\"paymentId\":\"1\"}", &sig));
        assert!(!hmac_verify(b"secret123", b"{\"paymentId\":\"2\"}", &sig));
    }
}
