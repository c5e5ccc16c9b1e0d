//! Signed session cookies.
//!
//! A signed value has the form `<value>.<base64url(HMAC-SHA256(secret, value))>`.

use std::time::Duration;

use axum::http::{HeaderMap, header::COOKIE};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CookieError {
    #[error("cookie value is not signed")]
    Unsigned,
    #[error("cookie signature is not valid base64")]
    Encoding,
    #[error("cookie signature mismatch")]
    BadSignature,
}

#[derive(Clone)]
pub struct CookieSigner {
    mac: HmacSha256,
}

impl std::fmt::Debug for CookieSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieSigner").finish_non_exhaustive()
    }
}

impl CookieSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        let mac = HmacSha256::new_from_slice(secret.as_ref())
            .expect("HMAC can take a key of any size");
        Self { mac }
    }

    fn tag(&self, value: &str) -> Vec<u8> {
        let mut mac = self.mac.clone();
        mac.update(value.as_bytes());
        mac.finalize().into_bytes().to_vec()
    }

    pub fn sign(&self, value: &str) -> String {
        format!("{}.{}", value, URL_SAFE_NO_PAD.encode(self.tag(value)))
    }

    /// Returns the original value when the signature matches.
    pub fn verify<'a>(&self, signed: &'a str) -> Result<&'a str, CookieError> {
        let (value, signature) = signed.rsplit_once('.').ok_or(CookieError::Unsigned)?;
        if value.is_empty() {
            return Err(CookieError::Unsigned);
        }
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| CookieError::Encoding)?;
        let expected = self.tag(value);
        if bool::from(expected.as_slice().ct_eq(signature.as_slice())) {
            Ok(value)
        } else {
            Err(CookieError::BadSignature)
        }
    }
}

/// Finds a cookie by name across every `Cookie` header of a request.
pub fn read_cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim_matches('"'))
}

pub fn set_cookie_header(name: &str, value: &str, max_age: Duration, secure: bool) -> String {
    let mut header = format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        name,
        value,
        max_age.as_secs()
    );
    if secure {
        header.push_str("; Secure");
    }
    header
}

pub fn clear_cookie_header(name: &str) -> String {
    format!("{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0", name)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn signed_value_verifies() {
        let signer = CookieSigner::new("a-secret-that-is-long-enough-for-tests");
        let signed = signer.sign("token123");
        assert_eq!(signer.verify(&signed), Ok("token123"));
    }

    #[test]
    fn tampered_value_is_rejected() {
        let signer = CookieSigner::new("secret");
        let signed = signer.sign("token123");
        let tampered = signed.replacen("token123", "token124", 1);
        assert_eq!(signer.verify(&tampered), Err(CookieError::BadSignature));
    }

    #[test]
    fn other_secret_is_rejected() {
        let signed = CookieSigner::new("one").sign("token");
        assert_eq!(
            CookieSigner::new("two").verify(&signed),
            Err(CookieError::BadSignature)
        );
    }

    #[test]
    fn malformed_values_are_rejected() {
        let signer = CookieSigner::new("secret");
        assert_eq!(signer.verify("no-signature"), Err(CookieError::Unsigned));
        assert_eq!(signer.verify(".abc"), Err(CookieError::Unsigned));
        assert_eq!(signer.verify("token.!!!"), Err(CookieError::Encoding));
    }

    #[test]
    fn reads_cookie_from_any_header() {
        let mut headers = HeaderMap::new();
        headers.append(COOKIE, HeaderValue::from_static("theme=dark; lang=en"));
        headers.append(COOKIE, HeaderValue::from_static("session=abc.def"));
        assert_eq!(read_cookie(&headers, "lang"), Some("en"));
        assert_eq!(read_cookie(&headers, "session"), Some("abc.def"));
        assert_eq!(read_cookie(&headers, "missing"), None);
    }
}
