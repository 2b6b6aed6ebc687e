//! Webhook payload signatures
//!
//! `X-Hub-Signature-256: sha256=<hex hmac-sha256(secret, raw body)>`

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::RejectReason;

pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";
const PREFIX: &str = "sha256=";

type HmacSha256 = Hmac<Sha256>;

fn mac(secret: &[u8]) -> HmacSha256 {
    // HMAC accepts keys of any length
    HmacSha256::new_from_slice(secret).expect("HMAC key should be valid")
}

/// Header value for the given body
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = mac(secret.as_bytes());
    mac.update(body);
    format!("{}{}", PREFIX, hex::encode(mac.finalize().into_bytes()))
}

/// Checks a signature header against the raw body in constant time
pub fn verify(secret: &str, body: &[u8], header: Option<&str>) -> Result<(), RejectReason> {
    let header = header
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .ok_or(RejectReason::MissingSignature)?;

    let expected = header
        .strip_prefix(PREFIX)
        .and_then(|h| hex::decode(h).ok())
        .ok_or(RejectReason::InvalidSignature)?;

    let mut mac = mac(secret.as_bytes());
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| RejectReason::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = br#"{"ref":"refs/heads/master","event_type":"push"}"#;

    #[test]
    fn test_sign_and_verify() {
        let header = sign("s3cret", BODY);
        assert!(header.starts_with("sha256="));
        assert_eq!(header.len(), PREFIX.len() + 64);
        assert_eq!(verify("s3cret", BODY, Some(&header)), Ok(()));
    }

    #[test]
    fn test_wrong_secret_or_body_rejected() {
        let header = sign("s3cret", BODY);
        assert_eq!(
            verify("other", BODY, Some(&header)),
            Err(RejectReason::InvalidSignature)
        );
        assert_eq!(
            verify("s3cret", b"{}", Some(&header)),
            Err(RejectReason::InvalidSignature)
        );
    }

    #[test]
    fn test_missing_and_malformed_headers() {
        assert_eq!(verify("s", BODY, None), Err(RejectReason::MissingSignature));
        assert_eq!(verify("s", BODY, Some("  ")), Err(RejectReason::MissingSignature));
        assert_eq!(
            verify("s", BODY, Some("sha1=abcd")),
            Err(RejectReason::InvalidSignature)
        );
        assert_eq!(
            verify("s", BODY, Some("sha256=not-hex")),
            Err(RejectReason::InvalidSignature)
        );
    }
}
