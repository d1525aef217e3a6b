use base64::prelude::*;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

pub const KOBO_SIGNATURE_HEADER: &str = "x-kobo-signature";

pub fn sign_hex(secret: &[u8], body: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(body);
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Compares a hex HMAC-SHA256 of `body` against `provided` in constant time.
pub fn verify_hex_signature(secret: &[u8], body: &[u8], provided: &str) -> bool {
    let Some(expected) = sign_hex(secret, body) else {
        return false;
    };
    let provided = provided.trim().to_ascii_lowercase();
    let provided = provided.strip_prefix("sha256=").unwrap_or(&provided);
    ConstantTimeEq::ct_eq(provided.as_bytes(), expected.as_bytes()).into()
}

/// Event Hubs SharedAccessSignature for `resource_uri`, valid until `expiry` (unix seconds).
pub fn shared_access_signature(
    resource_uri: &str,
    key_name: &str,
    key_value: &str,
    expiry: i64,
) -> Option<String> {
    let encoded_uri: String =
        url::form_urlencoded::byte_serialize(resource_uri.to_ascii_lowercase().as_bytes())
            .collect();
    let string_to_sign = format!("{}\n{}", encoded_uri, expiry);

    let mut mac = HmacSha256::new_from_slice(key_value.as_bytes()).ok()?;
    mac.update(string_to_sign.as_bytes());
    let sig = BASE64_STANDARD.encode(mac.finalize().into_bytes());
    let encoded_sig: String = url::form_urlencoded::byte_serialize(sig.as_bytes()).collect();

    Some(format!(
        "SharedAccessSignature sr={}&sig={}&se={}&skn={}",
        encoded_uri, encoded_sig, expiry, key_name
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifies_matching_signature() {
        let body = br#"{"_id":1}"#;
        let sig = sign_hex(b"whsec", body).unwrap();
        assert!(verify_hex_signature(b"whsec", body, &sig));
        assert!(verify_hex_signature(b"whsec", body, &sig.to_uppercase()));
        assert!(verify_hex_signature(
            b"whsec",
            body,
            &format!("sha256={}", sig)
        ));
    }

    #[test]
    fn rejects_wrong_secret_or_body() {
        let body = br#"{"_id":1}"#;
        let sig = sign_hex(b"whsec", body).unwrap();
        assert!(!verify_hex_signature(b"other", body, &sig));
        assert!(!verify_hex_signature(b"whsec", br#"{"_id":2}"#, &sig));
        assert!(!verify_hex_signature(b"whsec", body, ""));
    }

    #[test]
    fn sas_token_carries_all_parts() {
        let token = shared_access_signature(
            "https://ns.servicebus.windows.net/hub",
            "send",
            "key",
            1_700_000_000,
        )
        .unwrap();
        assert!(token.starts_with(
            "SharedAccessSignature sr=https%3A%2F%2Fns.servicebus.windows.net%2Fhub&sig="
        ));
        assert!(token.ends_with("&se=1700000000&skn=send"));
    }
}
