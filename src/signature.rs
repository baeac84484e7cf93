use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
const SIGNATURE_PREFIX: &str = "sha256=";
const DIGEST_LEN: usize = 32;

/// Checks `X-Hub-Signature-256` against an HMAC-SHA256 of the raw body.
///
/// Fails closed: an empty secret, a missing header, a missing `sha256=` prefix
/// or a malformed digest all reject. Malformed input still pays for a full
/// constant-time comparison so rejection timing does not depend on the header.
pub fn verify_signature(app_secret: &str, signature_header: Option<&str>, body: &[u8]) -> bool {
    if app_secret.is_empty() {
        return false;
    }
    let Ok(mut mac) = HmacSha256::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);

    let provided = signature_header
        .map(str::trim)
        .and_then(|value| value.strip_prefix(SIGNATURE_PREFIX))
        .and_then(|digest| hex::decode(digest.trim()).ok());

    match provided {
        Some(bytes) if bytes.len() == DIGEST_LEN => mac.verify_slice(&bytes).is_ok(),
        _ => {
            let _ = mac.verify_slice(&[0u8; DIGEST_LEN]);
            false
        }
    }
}

#[cfg(test)]
pub(crate) fn sign(app_secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(app_secret.as_bytes()).expect("hmac key");
    mac.update(body);
    format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
}
