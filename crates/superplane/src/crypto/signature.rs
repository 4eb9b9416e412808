//! HMAC-SHA-256 webhook signatures.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

const PREFIX: &str = "sha256=";

/// Hex-encoded HMAC-SHA-256 of `body` under `key`.
pub fn sign(key: &[u8], body: &[u8]) -> String {
    hex::encode(digest(key, body))
}

/// Check a signature header against the body.
///
/// Accepts an optional `sha256=` prefix. Comparison is constant time.
pub fn verify(key: &[u8], body: &[u8], signature: &str) -> bool {
    let signature = signature.trim();
    let signature = signature.strip_prefix(PREFIX).unwrap_or(signature);

    let provided = match hex::decode(signature) {
        Ok(bytes) if !bytes.is_empty() => bytes,
        _ => return false,
    };

    let expected = digest(key, body);
    expected.ct_eq(provided.as_slice()).into()
}

fn digest(key: &[u8], body: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length.
    let mut mac = match <HmacSha256 as Mac>::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(body);
    mac.finalize().into_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_matching_signature() {
        let sig = sign(b"key", b"{\"a\":1}");
        assert!(verify(b"key", b"{\"a\":1}", &sig));
        assert!(verify(b"key", b"{\"a\":1}", &format!("sha256={sig}")));
    }

    #[test]
    fn rejects_mismatches() {
        let sig = sign(b"key", b"body");
        assert!(!verify(b"other", b"body", &sig));
        assert!(!verify(b"key", b"body!", &sig));
        assert!(!verify(b"key", b"body", "not-hex"));
        assert!(!verify(b"key", b"body", ""));
        assert!(!verify(b"key", b"body", &sig[..10]));
    }

    #[test]
    fn known_vector() {
        // RFC 4231 test case 2
        assert_eq!(
            sign(b"Jefe", b"what do ya want for nothing?"),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }
}
