use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Billing-Signature";

/// Base64 (standard alphabet) HMAC-SHA256 of the raw request body.
pub fn sign_payload(secret: &str, payload: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(payload);
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

pub fn verify_signature(secret: &str, payload: &[u8], provided: &str) -> bool {
    let expected = sign_payload(secret, payload);
    let provided = provided.trim();
    if expected.len() != provided.len() {
        return false;
    }
    expected.as_bytes().ct_eq(provided.as_bytes()).unwrap_u8() == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_matching_signature() {
        let body = br#"{"tenantId":"shop-1","status":"ACTIVE"}"#;
        let sig = sign_payload("whsec_test", body);
        assert!(verify_signature("whsec_test", body, &sig));
        assert!(verify_signature("whsec_test", body, &format!(" {sig} ")));
    }

    #[test]
    fn rejects_tampered_body_or_wrong_secret() {
        let body = br#"{"tenantId":"shop-1","status":"ACTIVE"}"#;
        let sig = sign_payload("whsec_test", body);
        assert!(!verify_signature("whsec_other", body, &sig));
        assert!(!verify_signature(
            "whsec_test",
            br#"{"tenantId":"shop-2","status":"ACTIVE"}"#,
            &sig
        ));
        assert!(!verify_signature("whsec_test", body, ""));
    }
}
