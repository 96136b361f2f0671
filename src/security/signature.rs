use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;

use crate::error::CryptoError;

// SHA-1(sorted(secret, timestamp, nonce, payload).concat()) -> lowercase hex

/// Computes the callback signature.
///
/// Plain (unencrypted) callbacks are signed over three values; passing an
/// empty `payload` yields the same digest because it sorts first and adds
/// nothing to the concatenation.
pub fn sign(secret: &str, timestamp: &str, nonce: &str, payload: &str) -> String {
    let mut parts = [secret, timestamp, nonce, payload];
    parts.sort_unstable();

    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Recomputes the signature and compares it in constant time.
pub fn verify(
    secret: &str,
    timestamp: &str,
    nonce: &str,
    payload: &str,
    provided: &str,
) -> Result<(), CryptoError> {
    let expected = sign(secret, timestamp, nonce, payload);
    let provided = provided.trim().to_ascii_lowercase();
    if expected.as_bytes().ct_eq(provided.as_bytes()).unwrap_u8() == 1 {
        Ok(())
    } else {
        Err(CryptoError::SignatureMismatch)
    }
}

/// Signature for a client-side page configuration, keyed by a signing ticket.
///
/// Field order is fixed by the remote platform: ticket, nonce, timestamp, url.
pub fn sign_client_config(ticket: &str, nonce: &str, timestamp: i64, url: &str) -> String {
    let raw = format!("jsapi_ticket={ticket}&noncestr={nonce}&timestamp={timestamp}&url={url}");
    hex::encode(Sha1::digest(raw.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        assert_eq!(
            sign("token1", "1410000000", "abc", "hello"),
            "62139a06d85d64592d5e769f166df86725d3f7ef"
        );
    }

    #[test]
    fn argument_order_does_not_matter() {
        let a = sign("token1", "1410000000", "abc", "hello");
        let b = sign("hello", "abc", "token1", "1410000000");
        assert_eq!(a, b);
    }

    #[test]
    fn empty_payload_matches_three_value_form() {
        assert_eq!(
            sign("token1", "1410000000", "abc", ""),
            "491be588a09a204c4c3dd2d1454898fea45dbf9d"
        );
    }

    #[test]
    fn verify_accepts_uppercase_hex() {
        let sig = sign("secret", "1", "n", "body").to_uppercase();
        assert!(verify("secret", "1", "n", "body", &sig).is_ok());
    }

    #[test]
    fn verify_rejects_tampered_payload() {
        let sig = sign("secret", "1", "n", "body");
        assert_eq!(
            verify("secret", "1", "n", "tampered", &sig),
            Err(CryptoError::SignatureMismatch)
        );
    }

    #[test]
    fn verify_rejects_truncated_signature() {
        let sig = sign("secret", "1", "n", "body");
        assert!(verify("secret", "1", "n", "body", &sig[..20]).is_err());
    }

    #[test]
    fn client_config_vector() {
        let sig = sign_client_config(
            "sM4AOVdWfPE4DxkXGEs8VMCPGGVi4C3VM0P37wVUCFvkVAy_90u5h9nbSlYy3-Sl-HhTdfl2fzFy1AOcHKP7qg",
            "Wm3WZYTPz0wzccnW",
            1414587457,
            "http://mp.weixin.qq.com?params=value",
        );
        assert_eq!(sig, "0f9de62fce790f9a083d5c99e95740ceb90c27ed");
    }
}
