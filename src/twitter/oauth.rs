// OAuth 1.0a request signing (HMAC-SHA1) for the streaming API.
//
// Signature = base64(HMAC-SHA1(key, base_string)) where
//   key         = enc(consumer_secret) & enc(access_secret)
//   base_string = METHOD & enc(url) & enc(sorted, encoded params)
// and the params include both the oauth_* protocol params and the request's
// own form/query params. Encoding is RFC 3986 (only ALPHA / DIGIT / -._~
// pass through).

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use rand::RngCore;
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

const RFC3986: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// The four secrets needed to sign stream requests.
#[derive(Clone, Default)]
pub struct Credentials {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub access_token: String,
    pub access_secret: String,
}

impl Credentials {
    pub fn is_complete(&self) -> bool {
        !self.consumer_key.is_empty()
            && !self.consumer_secret.is_empty()
            && !self.access_token.is_empty()
            && !self.access_secret.is_empty()
    }
}

// Secrets never reach the logs, even through `{:?}`.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mask = |s: &str| if s.is_empty() { "<unset>" } else { "<redacted>" };
        f.debug_struct("Credentials")
            .field("consumer_key", &mask(&self.consumer_key))
            .field("consumer_secret", &mask(&self.consumer_secret))
            .field("access_token", &mask(&self.access_token))
            .field("access_secret", &mask(&self.access_secret))
            .finish()
    }
}

/// Percent-encode per RFC 3986, as OAuth 1.0a requires.
pub fn encode(s: &str) -> String {
    utf8_percent_encode(s, RFC3986).to_string()
}

/// Build the `Authorization` header for a request, with a fresh nonce and
/// the current timestamp.
pub fn authorization_header(
    credentials: &Credentials,
    method: &str,
    url: &str,
    params: &[(&str, &str)],
) -> Result<String> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        .to_string();

    let mut nonce_bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce: String = nonce_bytes.iter().map(|b| format!("{b:02x}")).collect();

    authorization_header_with(credentials, method, url, params, &nonce, &timestamp)
}

/// Deterministic variant of [`authorization_header`].
pub fn authorization_header_with(
    credentials: &Credentials,
    method: &str,
    url: &str,
    params: &[(&str, &str)],
    nonce: &str,
    timestamp: &str,
) -> Result<String> {
    let oauth_params = protocol_params(credentials, nonce, timestamp);
    let signature = sign(credentials, method, url, params, &oauth_params)?;

    let mut fields: Vec<String> = oauth_params
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", encode(k), encode(v)))
        .collect();
    fields.push(format!("oauth_signature=\"{}\"", encode(&signature)));
    fields.sort();

    Ok(format!("OAuth {}", fields.join(", ")))
}

/// Compute the base64 HMAC-SHA1 signature for a request.
pub fn signature(
    credentials: &Credentials,
    method: &str,
    url: &str,
    params: &[(&str, &str)],
    nonce: &str,
    timestamp: &str,
) -> Result<String> {
    let oauth_params = protocol_params(credentials, nonce, timestamp);
    sign(credentials, method, url, params, &oauth_params)
}

/// The signature base string: METHOD&enc(url)&enc(param_string).
pub fn base_string(method: &str, url: &str, params: &[(&str, &str)]) -> String {
    let mut encoded: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (encode(k), encode(v)))
        .collect();
    encoded.sort();

    let param_string = encoded
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");

    format!(
        "{}&{}&{}",
        method.to_ascii_uppercase(),
        encode(url),
        encode(&param_string)
    )
}

fn protocol_params<'a>(
    credentials: &'a Credentials,
    nonce: &'a str,
    timestamp: &'a str,
) -> Vec<(&'static str, &'a str)> {
    vec![
        ("oauth_consumer_key", credentials.consumer_key.as_str()),
        ("oauth_nonce", nonce),
        ("oauth_signature_method", "HMAC-SHA1"),
        ("oauth_timestamp", timestamp),
        ("oauth_token", credentials.access_token.as_str()),
        ("oauth_version", "1.0"),
    ]
}

fn sign(
    credentials: &Credentials,
    method: &str,
    url: &str,
    params: &[(&str, &str)],
    oauth_params: &[(&str, &str)],
) -> Result<String> {
    let all: Vec<(&str, &str)> = params.iter().chain(oauth_params).copied().collect();
    let base = base_string(method, url, &all);
    let key = format!(
        "{}&{}",
        encode(&credentials.consumer_secret),
        encode(&credentials.access_secret)
    );

    let mut mac = <HmacSha1 as Mac>::new_from_slice(key.as_bytes())
        .map_err(|e| anyhow!("Invalid OAuth signing key: {e}"))?;
    mac.update(base.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Reference request from the provider's "creating a signature" guide.
    fn reference_credentials() -> Credentials {
        Credentials {
            consumer_key: "xvz1evFS4wEEPTGEFPHBog".to_string(),
            consumer_secret: "kAcSOqF21Fu85e7zjz7ZN2U4ZRhfV3WpwPAoE3Z7kBw".to_string(),
            access_token: "370773112-GmHxMAgYyLbNEtIKZeRNFsMKPR9EyMZeS9weJAEb".to_string(),
            access_secret: "LswwdoUaIvS8ltyTt5jkRh4J50vUPVVHtR2YPi5kE".to_string(),
        }
    }

    const REFERENCE_URL: &str = "https://api.twitter.com/1.1/statuses/update.json";
    const REFERENCE_PARAMS: &[(&str, &str)] = &[
        ("status", "Hello Ladies + Gentlemen, a signed OAuth request!"),
        ("include_entities", "true"),
    ];
    const REFERENCE_NONCE: &str = "kYjzVBB8Y0ZFabxSWbWovY3uYSQ2pTgmZeNu2VS4cg";
    const REFERENCE_TIMESTAMP: &str = "1318622958";

    #[test]
    fn test_encode_reserved_characters() {
        assert_eq!(encode("Ladies + Gentlemen"), "Ladies%20%2B%20Gentlemen");
        assert_eq!(encode("An encoded string!"), "An%20encoded%20string%21");
        assert_eq!(encode("Dogs, Cats & Mice"), "Dogs%2C%20Cats%20%26%20Mice");
        assert_eq!(encode("a-b.c_d~e"), "a-b.c_d~e");
        assert_eq!(encode("#upright"), "%23upright");
    }

    #[test]
    fn test_reference_signature() {
        let sig = signature(
            &reference_credentials(),
            "POST",
            REFERENCE_URL,
            REFERENCE_PARAMS,
            REFERENCE_NONCE,
            REFERENCE_TIMESTAMP,
        )
        .unwrap();
        assert_eq!(sig, "hCtSmYh+iHYCEqBWrE7C7hYmtUk=");
    }

    #[test]
    fn test_reference_base_string() {
        let creds = reference_credentials();
        let oauth = protocol_params(&creds, REFERENCE_NONCE, REFERENCE_TIMESTAMP);
        let all: Vec<(&str, &str)> = REFERENCE_PARAMS.iter().chain(&oauth).copied().collect();
        let base = base_string("post", REFERENCE_URL, &all);
        assert!(base.starts_with(
            "POST&https%3A%2F%2Fapi.twitter.com%2F1.1%2Fstatuses%2Fupdate.json&include_entities%3Dtrue%26oauth_consumer_key"
        ));
        assert!(base.ends_with("status%3DHello%2520Ladies%2520%252B%2520Gentlemen%252C%2520a%2520signed%2520OAuth%2520request%2521"));
    }

    #[test]
    fn test_header_contains_encoded_signature() {
        let header = authorization_header_with(
            &reference_credentials(),
            "POST",
            REFERENCE_URL,
            REFERENCE_PARAMS,
            REFERENCE_NONCE,
            REFERENCE_TIMESTAMP,
        )
        .unwrap();
        assert!(header.starts_with("OAuth oauth_consumer_key=\"xvz1evFS4wEEPTGEFPHBog\""));
        assert!(header.contains("oauth_signature=\"hCtSmYh%2BiHYCEqBWrE7C7hYmtUk%3D\""));
        assert!(header.contains("oauth_version=\"1.0\""));
    }

    #[test]
    fn test_fresh_nonces_differ() {
        let creds = reference_credentials();
        let a = authorization_header(&creds, "POST", REFERENCE_URL, &[]).unwrap();
        let b = authorization_header(&creds, "POST", REFERENCE_URL, &[]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let rendered = format!("{:?}", reference_credentials());
        assert!(!rendered.contains("kAcSOqF21Fu85e7zjz7ZN2U4ZRhfV3WpwPAoE3Z7kBw"));
        assert!(rendered.contains("<redacted>"));
        assert!(format!("{:?}", Credentials::default()).contains("<unset>"));
    }
}
