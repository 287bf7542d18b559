//! HMAC signature helpers shared by the webhook handlers

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Sha1,
    Sha256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Hex,
    Base64,
}

/// Raw HMAC of `message` under `secret`
pub fn hmac_digest(algorithm: Algorithm, secret: &[u8], message: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length, so new_from_slice cannot fail here
    match algorithm {
        Algorithm::Sha1 => match <HmacSha1 as Mac>::new_from_slice(secret) {
            Ok(mut mac) => {
                mac.update(message);
                mac.finalize().into_bytes().to_vec()
            }
            Err(_) => Vec::new(),
        },
        Algorithm::Sha256 => match <HmacSha256 as Mac>::new_from_slice(secret) {
            Ok(mut mac) => {
                mac.update(message);
                mac.finalize().into_bytes().to_vec()
            }
            Err(_) => Vec::new(),
        },
    }
}

pub fn encode(bytes: &[u8], encoding: Encoding) -> String {
    match encoding {
        Encoding::Hex => hex::encode(bytes),
        Encoding::Base64 => STANDARD.encode(bytes),
    }
}

/// HMAC of `message`, encoded for a header or handshake response
pub fn sign(algorithm: Algorithm, encoding: Encoding, secret: &[u8], message: &[u8]) -> String {
    encode(&hmac_digest(algorithm, secret, message), encoding)
}

pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Check a provided signature against the HMAC of `message`.
///
/// The provided value is decoded before comparison, so hex case does not
/// matter. Anything that fails to decode simply does not match.
pub fn verify(
    algorithm: Algorithm,
    encoding: Encoding,
    secret: &[u8],
    message: &[u8],
    provided: &str,
) -> bool {
    let decoded = match encoding {
        Encoding::Hex => hex::decode(provided.trim()).ok(),
        Encoding::Base64 => STANDARD.decode(provided.trim()).ok(),
    };

    let Some(provided_bytes) = decoded else {
        return false;
    };

    let expected = hmac_digest(algorithm, secret, message);
    !expected.is_empty() && constant_time_eq(&expected, &provided_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Widely published HMAC examples for this pangram
    const SECRET: &[u8] = b"key";
    const MESSAGE: &[u8] = b"The quick brown fox jumps over the lazy dog";

    #[test]
    fn test_known_vectors() {
        assert_eq!(
            sign(Algorithm::Sha1, Encoding::Hex, SECRET, MESSAGE),
            "de7c9b85b8b78aa6bc8a7a36f70a90701c9db4d9"
        );
        assert_eq!(
            sign(Algorithm::Sha256, Encoding::Hex, SECRET, MESSAGE),
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn test_verify_hex_and_base64() {
        let hex_sig = sign(Algorithm::Sha256, Encoding::Hex, SECRET, MESSAGE);
        assert!(verify(Algorithm::Sha256, Encoding::Hex, SECRET, MESSAGE, &hex_sig));
        assert!(verify(
            Algorithm::Sha256,
            Encoding::Hex,
            SECRET,
            MESSAGE,
            &hex_sig.to_uppercase()
        ));

        let b64_sig = sign(Algorithm::Sha256, Encoding::Base64, SECRET, MESSAGE);
        assert!(verify(Algorithm::Sha256, Encoding::Base64, SECRET, MESSAGE, &b64_sig));
    }

    #[test]
    fn test_verify_rejects_mismatch() {
        let sig = sign(Algorithm::Sha256, Encoding::Hex, SECRET, MESSAGE);
        assert!(!verify(Algorithm::Sha256, Encoding::Hex, b"other", MESSAGE, &sig));
        assert!(!verify(Algorithm::Sha256, Encoding::Hex, SECRET, b"tampered", &sig));
        assert!(!verify(Algorithm::Sha1, Encoding::Hex, SECRET, MESSAGE, &sig));
        assert!(!verify(Algorithm::Sha256, Encoding::Hex, SECRET, MESSAGE, "not-hex"));
        assert!(!verify(Algorithm::Sha256, Encoding::Base64, SECRET, MESSAGE, "!!!"));
        assert!(!verify(Algorithm::Sha256, Encoding::Hex, SECRET, MESSAGE, ""));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
