//! Webhook request signing.
//!
//! A request is authentic when `x-request-signature` equals
//! `v0=hex(HMAC-SHA256(secret, "v0:{timestamp}:{body}"))` and its timestamp is
//! within [`REPLAY_WINDOW_SECS`] of the local clock.

use crate::error::AuthenticationError;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use subtle::ConstantTimeEq;

pub const TIMESTAMP_HEADER: &str = "x-request-timestamp";
pub const SIGNATURE_HEADER: &str = "x-request-signature";

/// Maximum allowed skew between the request timestamp and now.
pub const REPLAY_WINDOW_SECS: u64 = 300;

const VERSION: &str = "v0";

type HmacSha256 = Hmac<Sha256>;

/// Proof that a request passed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Authenticated {
    pub timestamp: i64,
}

/// Computes the signature header value for a request.
pub fn sign(timestamp: &str, body: &[u8], secret: &[u8]) -> Result<String, AuthenticationError> {
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|_| AuthenticationError::InvalidSecret)?;
    mac.update(VERSION.as_bytes());
    mac.update(b":");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(body);
    Ok(format!("{}={}", VERSION, hex::encode(mac.finalize().into_bytes())))
}

pub fn verify(
    timestamp: &str,
    signature: &str,
    body: &[u8],
    secret: &[u8],
    now: i64,
) -> Result<Authenticated, AuthenticationError> {
    let ts: i64 = timestamp
        .parse()
        .map_err(|_| AuthenticationError::MalformedTimestamp(timestamp.to_string()))?;

    let skew_secs = now.abs_diff(ts);
    if skew_secs > REPLAY_WINDOW_SECS {
        return Err(AuthenticationError::ReplaySuspected { skew_secs });
    }

    let expected = sign(timestamp, body, secret)?;
    if bool::from(expected.as_bytes().ct_eq(signature.as_bytes())) {
        Ok(Authenticated { timestamp: ts })
    } else {
        Err(AuthenticationError::SignatureMismatch)
    }
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"8f742231b10e8888abcd99yyyzzz85a5";
    const BODY: &[u8] = b"token=xyz&text=py+print(1)&response_url=https%3A%2F%2Fhooks.example%2F1";

    #[test]
    fn own_signature_is_accepted() {
        let now = 1_700_000_000;
        let ts = now.to_string();
        let signature = sign(&ts, BODY, SECRET).unwrap();
        assert!(signature.starts_with("v0="));
        assert_eq!(
            verify(&ts, &signature, BODY, SECRET, now),
            Ok(Authenticated { timestamp: now })
        );
    }

    #[test]
    fn known_vector() {
        let signature = sign("0", b"", b"key").unwrap();
        assert_eq!(
            signature,
            "v0=4712301027d41f1f81c0c1c1eeee3c07e179590725f81fc56bb2cc3dcaba83f5"
        );
        assert_eq!(verify("0", &signature, b"", b"key", 0).unwrap().timestamp, 0);
    }

    #[test]
    fn every_single_bit_flip_is_rejected() {
        let now = 1_700_000_000;
        let ts = now.to_string();
        let signature = sign(&ts, BODY, SECRET).unwrap();
        let bytes = signature.as_bytes();
        for i in 0..bytes.len() {
            // Bits 0..7 keep the byte ASCII, so the mutated value stays a str.
            for bit in 0..7 {
                let mut mutated = bytes.to_vec();
                mutated[i] ^= 1 << bit;
                let mutated = String::from_utf8(mutated).unwrap();
                assert_eq!(
                    verify(&ts, &mutated, BODY, SECRET, now),
                    Err(AuthenticationError::SignatureMismatch),
                    "flip of bit {} in byte {} was accepted",
                    bit,
                    i
                );
            }
        }
    }

    #[test]
    fn body_or_secret_change_is_rejected() {
        let now = 1_700_000_000;
        let ts = now.to_string();
        let signature = sign(&ts, BODY, SECRET).unwrap();
        assert_eq!(
            verify(&ts, &signature, b"text=js", SECRET, now),
            Err(AuthenticationError::SignatureMismatch)
        );
        assert_eq!(
            verify(&ts, &signature, BODY, b"other", now),
            Err(AuthenticationError::SignatureMismatch)
        );
        assert_eq!(
            verify(&ts, "", BODY, SECRET, now),
            Err(AuthenticationError::SignatureMismatch)
        );
    }

    #[test]
    fn stale_or_future_timestamps_are_replays() {
        let now = 1_700_000_000;
        for ts in [now - 301, now + 301, now - 86_400, 0] {
            let ts = ts.to_string();
            let signature = sign(&ts, BODY, SECRET).unwrap();
            assert!(matches!(
                verify(&ts, &signature, BODY, SECRET, now),
                Err(AuthenticationError::ReplaySuspected { .. })
            ));
        }
    }

    #[test]
    fn window_edge_is_inclusive() {
        let now = 1_700_000_000;
        for ts in [now - 300, now + 300] {
            let ts = ts.to_string();
            let signature = sign(&ts, BODY, SECRET).unwrap();
            assert!(verify(&ts, &signature, BODY, SECRET, now).is_ok());
        }
    }

    #[test]
    fn secrets_of_any_length_sign() {
        for secret in [&b""[..], &[7u8; 1][..], &[7u8; 64][..], &[7u8; 500][..]] {
            let signature = sign("1", BODY, secret).unwrap();
            assert!(verify("1", &signature, BODY, secret, 1).is_ok());
        }
    }

    #[test]
    fn malformed_timestamp() {
        for ts in ["", "abc", "12.5", " 1700000000"] {
            assert_eq!(
                verify(ts, "v0=00", BODY, SECRET, 1_700_000_000),
                Err(AuthenticationError::MalformedTimestamp(ts.to_string()))
            );
        }
    }
}
