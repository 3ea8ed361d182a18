//! Request signing for the upstream filtered stream.
//!
//! OAuth-style HMAC-SHA1 signatures: the request method, base URL, and form
//! parameters are normalized into a signature base string, signed with a key
//! derived from the consumer secret and access secret, and folded into an
//! `Authorization: OAuth ...` header. Signing happens once per request with
//! a fresh nonce and timestamp; nothing is cached across request bodies.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use url::Url;

use crate::config::StreamCredentials;

use super::StreamError;

type HmacSha1 = Hmac<Sha1>;

const SIGNATURE_METHOD: &str = "HMAC-SHA1";
const OAUTH_VERSION: &str = "1.0";

pub struct RequestSigner {
    credentials: StreamCredentials,
}

impl RequestSigner {
    pub fn new(credentials: StreamCredentials) -> Self {
        Self { credentials }
    }

    /// Build the `Authorization` header value for one request.
    ///
    /// `params` are the form parameters the request body will carry; they
    /// are covered by the signature, so the signed header is only valid for
    /// this exact body.
    pub fn authorization(
        &self,
        method: &str,
        url: &Url,
        params: &[(String, String)],
    ) -> Result<String, StreamError> {
        let nonce = nonce()?;
        let timestamp = unix_timestamp();
        Ok(self.authorization_at(method, url, params, &nonce, timestamp))
    }

    /// Deterministic variant with caller-supplied nonce and timestamp.
    pub fn authorization_at(
        &self,
        method: &str,
        url: &Url,
        params: &[(String, String)],
        nonce: &str,
        timestamp: u64,
    ) -> String {
        let mut oauth: BTreeMap<&str, String> = BTreeMap::new();
        oauth.insert("oauth_consumer_key", self.credentials.consumer_key.clone());
        oauth.insert("oauth_nonce", nonce.to_string());
        oauth.insert("oauth_signature_method", SIGNATURE_METHOD.to_string());
        oauth.insert("oauth_timestamp", timestamp.to_string());
        oauth.insert("oauth_token", self.credentials.access_token.clone());
        oauth.insert("oauth_version", OAUTH_VERSION.to_string());

        let signature = self.signature(method, url, params, &oauth);
        oauth.insert("oauth_signature", signature);

        let fields = oauth
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", percent_encode(k), percent_encode(v)))
            .collect::<Vec<_>>()
            .join(", ");
        format!("OAuth {}", fields)
    }

    fn signature(
        &self,
        method: &str,
        url: &Url,
        params: &[(String, String)],
        oauth: &BTreeMap<&str, String>,
    ) -> String {
        // Normalized parameters: every signed pair percent-encoded, then
        // sorted by encoded key and value.
        let mut pairs: Vec<(String, String)> = oauth
            .iter()
            .map(|(k, v)| (percent_encode(k), percent_encode(v)))
            .chain(
                params
                    .iter()
                    .map(|(k, v)| (percent_encode(k), percent_encode(v))),
            )
            .collect();
        pairs.sort();

        let param_string = pairs
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");

        let base = format!(
            "{}&{}&{}",
            method.to_uppercase(),
            percent_encode(&base_url(url)),
            percent_encode(&param_string)
        );
        let key = format!(
            "{}&{}",
            percent_encode(&self.credentials.consumer_secret),
            percent_encode(&self.credentials.access_secret)
        );

        let mut mac =
            HmacSha1::new_from_slice(key.as_bytes()).expect("hmac accepts keys of any length");
        mac.update(base.as_bytes());
        BASE64.encode(mac.finalize().into_bytes())
    }
}

/// Scheme, host, and path without query or default port.
fn base_url(url: &Url) -> String {
    let scheme = url.scheme().to_lowercase();
    let host = url.host_str().unwrap_or_default().to_lowercase();
    match url.port() {
        Some(port) => format!("{}://{}:{}{}", scheme, host, port, url.path()),
        None => format!("{}://{}{}", scheme, host, url.path()),
    }
}

/// RFC 3986 percent-encoding: everything but ALPHA / DIGIT / `-` `.` `_` `~`
/// is escaped.
fn percent_encode(input: &str) -> String {
    urlencoding::encode(input).into_owned()
}

fn nonce() -> Result<String, StreamError> {
    let mut bytes = [0u8; 16];
    getrandom::getrandom(&mut bytes)
        .map_err(|e| StreamError::Auth(format!("nonce generation failed: {}", e)))?;
    Ok(hex::encode(bytes))
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
