use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand_core::{OsRng, TryRngCore as _};
use sha2::{Digest as _, Sha256};
use subtle::ConstantTimeEq as _;

/// The only PKCE transform this gateway accepts, issuing or consuming.
pub const PKCE_METHOD_S256: &str = "S256";

/// Generate `n_bytes` of OS randomness, URL-safe base64 without padding.
pub fn random_token(n_bytes: usize) -> anyhow::Result<String> {
    let mut buf = vec![0u8; n_bytes];
    let mut rng = OsRng;
    rng.try_fill_bytes(&mut buf)
        .map_err(|e| anyhow::anyhow!("read OS randomness: {e:?}"))?;
    Ok(URL_SAFE_NO_PAD.encode(buf))
}

/// Opaque OAuth client id (16 random bytes).
pub fn new_client_id() -> anyhow::Result<String> {
    random_token(16)
}

/// Opaque client secret (32 random bytes, 256 bits).
pub fn new_client_secret() -> anyhow::Result<String> {
    random_token(32)
}

/// Opaque authorization code (32 random bytes).
pub fn new_authorization_code() -> anyhow::Result<String> {
    random_token(32)
}

/// Opaque bearer token, access or refresh (32 random bytes).
pub fn new_opaque_access_token() -> anyhow::Result<String> {
    random_token(32)
}

/// PKCE code verifier: 32 random bytes encode to 43 base64url characters,
/// which satisfies the RFC 7636 charset and length requirements.
pub fn new_pkce_verifier() -> anyhow::Result<String> {
    random_token(32)
}

/// S256 code challenge for a verifier.
pub fn pkce_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Verify a PKCE verifier against a stored challenge.
///
/// Only `S256` is accepted; `plain` (and anything else) always fails.
pub fn verify_pkce(verifier: &str, challenge: &str, method: &str) -> bool {
    if method != PKCE_METHOD_S256 {
        return false;
    }
    let computed = pkce_challenge(verifier);
    constant_time_eq(computed.as_bytes(), challenge.as_bytes())
}

/// Constant-time equality for secret material.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_tokens_are_urlsafe_and_unique() {
        let a = random_token(32).expect("token");
        let b = random_token(32).expect("token");
        assert_ne!(a, b);
        assert!(
            a.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
        // 32 bytes -> ceil(32 * 4 / 3) unpadded chars.
        assert_eq!(a.len(), 43);
    }

    #[test]
    fn client_id_is_shorter_than_secrets() {
        let id = new_client_id().expect("client id");
        assert_eq!(id.len(), 22); // 16 bytes unpadded
    }

    #[test]
    fn pkce_verifier_meets_rfc7636_charset() {
        let v = new_pkce_verifier().expect("verifier");
        assert_eq!(v.len(), 43);
        assert!(
            v.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
    }

    #[test]
    fn pkce_roundtrip_verifies() {
        let v = new_pkce_verifier().expect("verifier");
        let c = pkce_challenge(&v);
        assert!(verify_pkce(&v, &c, "S256"));
    }

    #[test]
    fn pkce_known_vector() {
        // RFC 7636 appendix B.
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            pkce_challenge(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn pkce_rejects_wrong_verifier() {
        let v = new_pkce_verifier().expect("verifier");
        let c = pkce_challenge(&v);
        assert!(!verify_pkce("not-the-verifier", &c, "S256"));
    }

    #[test]
    fn pkce_rejects_plain_method_even_when_matching() {
        let v = "some_plain_verifier";
        assert!(!verify_pkce(v, v, "plain"));
        assert!(!verify_pkce(v, &pkce_challenge(v), "plain"));
        assert!(!verify_pkce(v, &pkce_challenge(v), ""));
    }

    #[test]
    fn constant_time_eq_compares_content() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
