//! AWS Signature Version 4 for outgoing S3 requests.
//!
//! Signs the host, `x-amz-content-sha256`, `x-amz-date` and (for temporary
//! credentials) `x-amz-security-token` headers with the configured region.

use std::fmt;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::header::{AUTHORIZATION, HeaderValue, InvalidHeaderValue};
use reqwest::{Request, Url};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "s3";

/// Hex SHA-256 of an empty body.
pub const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Payload hash for a body sent without a digest.
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// Everything but the RFC 3986 unreserved characters.
const QUERY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
    pub session_token: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("session_token", &self.session_token.is_some())
            .finish_non_exhaustive()
    }
}

impl Credentials {
    /// Reads `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and the optional
    /// `AWS_SESSION_TOKEN` through `var`. Empty values count as unset.
    pub fn from_env<F>(var: F) -> Option<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = |name: &str| var(name).filter(|v| !v.is_empty());
        Some(Self {
            access_key: set("AWS_ACCESS_KEY_ID")?,
            secret_key: set("AWS_SECRET_ACCESS_KEY")?,
            session_token: set("AWS_SESSION_TOKEN"),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Signer {
    credentials: Credentials,
    region: String,
}

impl Signer {
    pub fn new(credentials: Credentials, region: impl Into<String>) -> Self {
        Self {
            credentials,
            region: region.into(),
        }
    }

    /// Adds the `x-amz-*` headers and `Authorization` to `req`.
    ///
    /// `payload_hash` is the hex SHA-256 of the body, or
    /// [`UNSIGNED_PAYLOAD`]. The `Host` header is left to the transport,
    /// which derives it from the URL.
    pub fn sign(
        &self,
        req: &mut Request,
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidHeaderValue> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let host = host_header(req.url());
        let path = req.url().path().to_string();
        let query = canonical_query(req.url());

        let mut amz: Vec<(&'static str, String)> = vec![
            ("x-amz-content-sha256", payload_hash.to_string()),
            ("x-amz-date", amz_date),
        ];
        if let Some(token) = &self.credentials.session_token {
            amz.push(("x-amz-security-token", token.clone()));
        }

        let mut signed = vec![("host", host.as_str())];
        signed.extend(amz.iter().map(|(name, value)| (*name, value.as_str())));
        let authorization =
            self.authorization(req.method().as_str(), &path, &query, &signed, payload_hash, now);

        let map = req.headers_mut();
        for (name, value) in &amz {
            map.insert(*name, HeaderValue::from_str(value)?);
        }
        map.insert(AUTHORIZATION, HeaderValue::from_str(&authorization)?);
        Ok(())
    }

    fn authorization(
        &self,
        method: &str,
        path: &str,
        query: &str,
        headers: &[(&str, &str)],
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> String {
        let date = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let (request, signed_headers) =
            canonical_request(method, path, query, headers, payload_hash);

        let scope = format!("{date}/{}/{SERVICE}/aws4_request", self.region);
        let string_to_sign = format!(
            "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(request.as_bytes()))
        );
        let key = signing_key(&self.credentials.secret_key, &date, &self.region, SERVICE);
        let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes()));

        format!(
            "{ALGORITHM} Credential={}/{scope},SignedHeaders={signed_headers},Signature={signature}",
            self.credentials.access_key
        )
    }
}

/// The canonical request and its `SignedHeaders` list.
fn canonical_request(
    method: &str,
    path: &str,
    query: &str,
    headers: &[(&str, &str)],
    payload_hash: &str,
) -> (String, String) {
    let mut headers: Vec<(String, &str)> = headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.trim()))
        .collect();
    headers.sort();

    let canonical_headers: String = headers
        .iter()
        .map(|(name, value)| format!("{name}:{value}\n"))
        .collect();
    let signed_headers = headers
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let request = format!(
        "{method}\n{path}\n{query}\n{canonical_headers}\n{signed_headers}\n{payload_hash}"
    );
    (request, signed_headers)
}

/// Query parameters re-encoded and sorted; a bare `?uploads` becomes
/// `uploads=`.
fn canonical_query(url: &Url) -> String {
    let encode = |s: &str| utf8_percent_encode(s, QUERY_ENCODE_SET).to_string();
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (encode(&k), encode(&v)))
        .collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// `host[:port]`, the port only when it is not the scheme default.
fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

fn signing_key(secret_key: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let date_key = hmac_sha256(format!("AWS4{secret_key}").as_bytes(), date.as_bytes());
    let region_key = hmac_sha256(&date_key, region.as_bytes());
    let service_key = hmac_sha256(&region_key, service.as_bytes());
    hmac_sha256(&service_key, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}
