//! Timestamp-scoped HMAC-SHA256 signatures for inbound webhooks.
//!
//! Header format: `t=<unix seconds>,v1=<hex digest>`; more than one `v1`
//! entry is accepted so a sender can sign with both secrets during rotation.
//! Signed payload: `<timestamp>.<raw body>`.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature header missing")]
    Missing,
    #[error("signature header malformed: {0}")]
    Malformed(&'static str),
    #[error("signature timestamp outside tolerance")]
    Expired,
    #[error("signature mismatch")]
    Mismatch,
    #[error("invalid signing key")]
    InvalidKey,
}

/// Hex HMAC-SHA256 over `timestamp.body`.
pub fn generate_signature(secret: &str, timestamp: i64, body: &[u8]) -> Result<String, SignatureError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::InvalidKey)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Build the full header value a sender would attach.
pub fn signature_header(secret: &str, timestamp: i64, body: &[u8]) -> Result<String, SignatureError> {
    let signature = generate_signature(secret, timestamp, body)?;
    Ok(format!("t={},v1={}", timestamp, signature))
}

/// Split a header into its timestamp and candidate signatures.
pub fn parse_signature_header(header: &str) -> Result<(i64, Vec<String>), SignatureError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let (key, value) = part
            .trim()
            .split_once('=')
            .ok_or(SignatureError::Malformed("expected key=value pairs"))?;
        match key {
            "t" => {
                timestamp = Some(
                    value
                        .parse::<i64>()
                        .map_err(|_| SignatureError::Malformed("timestamp is not an integer"))?,
                )
            }
            "v1" => signatures.push(value.to_string()),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::Malformed("timestamp missing"))?;
    if signatures.is_empty() {
        return Err(SignatureError::Malformed("no v1 signature"));
    }
    Ok((timestamp, signatures))
}

/// Verify a signature header against the raw body using constant-time
/// comparison. `now` is unix seconds; `tolerance_secs` bounds replay.
pub fn verify_signature_header(
    secret: &str,
    header: Option<&str>,
    body: &[u8],
    now: i64,
    tolerance_secs: i64,
) -> Result<i64, SignatureError> {
    let header = header.ok_or(SignatureError::Missing)?;
    let (timestamp, candidates) = parse_signature_header(header)?;

    if (now - timestamp).abs() > tolerance_secs {
        return Err(SignatureError::Expired);
    }

    let expected = generate_signature(secret, timestamp, body)?;
    let expected_bytes = expected.as_bytes();

    let matched = candidates.iter().any(|candidate| {
        let candidate_bytes = candidate.as_bytes();
        candidate_bytes.len() == expected_bytes.len()
            && bool::from(expected_bytes.ct_eq(candidate_bytes))
    });

    if matched {
        Ok(timestamp)
    } else {
        Err(SignatureError::Mismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";
    const BODY: &[u8] = br#"{"webhook_type":"TRANSACTIONS","webhook_code":"SYNC_UPDATES_AVAILABLE","item_id":"item-1"}"#;

    #[test]
    fn test_signature_generation_and_verification() {
        let header = signature_header(SECRET, 1_700_000_000, BODY).unwrap();
        let verified =
            verify_signature_header(SECRET, Some(&header), BODY, 1_700_000_010, 300).unwrap();
        assert_eq!(verified, 1_700_000_000);
    }

    #[test]
    fn test_tampered_body() {
        let header = signature_header(SECRET, 1_700_000_000, BODY).unwrap();
        let tampered = br#"{"webhook_type":"TRANSACTIONS","webhook_code":"SYNC_UPDATES_AVAILABLE","item_id":"item-2"}"#;
        assert_eq!(
            verify_signature_header(SECRET, Some(&header), tampered, 1_700_000_000, 300),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_wrong_secret() {
        let header = signature_header("other", 1_700_000_000, BODY).unwrap();
        assert_eq!(
            verify_signature_header(SECRET, Some(&header), BODY, 1_700_000_000, 300),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_expired_timestamp() {
        let header = signature_header(SECRET, 1_700_000_000, BODY).unwrap();
        assert_eq!(
            verify_signature_header(SECRET, Some(&header), BODY, 1_700_001_000, 300),
            Err(SignatureError::Expired)
        );
    }

    #[test]
    fn test_missing_and_malformed_header() {
        assert_eq!(
            verify_signature_header(SECRET, None, BODY, 0, 300),
            Err(SignatureError::Missing)
        );
        assert!(matches!(
            verify_signature_header(SECRET, Some("garbage"), BODY, 0, 300),
            Err(SignatureError::Malformed(_))
        ));
        assert!(matches!(
            verify_signature_header(SECRET, Some("t=12"), BODY, 12, 300),
            Err(SignatureError::Malformed(_))
        ));
    }

    #[test]
    fn test_rotation_accepts_any_matching_candidate() {
        let good = generate_signature(SECRET, 100, BODY).unwrap();
        let header = format!("t=100,v1=deadbeef,v1={}", good);
        assert!(verify_signature_header(SECRET, Some(&header), BODY, 100, 300).is_ok());
    }
}
