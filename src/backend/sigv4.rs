//! AWS Signature Version 4 request signing.
//!
//! Glacier accepts no presigned or SDK-side shortcuts for multipart part
//! uploads with tree-hash payloads, so requests are signed directly: build
//! the canonical request, hash it into the string to sign, derive the
//! signing key from the secret via the HMAC chain, and emit the
//! `Authorization` header.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Static AWS credentials.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

/// The two headers signing produces; the caller adds them to the request
/// alongside the headers it asked to have signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub amz_date: String,
    pub authorization: String,
}

/// SigV4 signer bound to one credential/region/service triple.
#[derive(Debug, Clone)]
pub struct Signer {
    credentials: Credentials,
    region: String,
    service: String,
}

impl Signer {
    pub fn new(credentials: Credentials, region: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            credentials,
            region: region.into(),
            service: service.into(),
        }
    }

    /// Sign a request.
    ///
    /// `headers` are the extra headers that will be sent and must be signed
    /// (`x-amz-*`, `content-range`, ...); `host` is signed as well but left
    /// for the HTTP client to set. `payload_sha256` is the lowercase hex
    /// SHA-256 of the request payload.
    pub fn sign(
        &self,
        method: &str,
        host: &str,
        path: &str,
        query: &[(&str, &str)],
        headers: &[(&str, &str)],
        payload_sha256: &str,
        now: DateTime<Utc>,
    ) -> Signature {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let datestamp = now.format("%Y%m%d").to_string();

        // Lowercased name/value pairs in sorted order, host and x-amz-date
        // included.
        let mut pairs: Vec<(String, String)> = headers
            .iter()
            .map(|(name, value)| {
                let trimmed = value.split_whitespace().collect::<Vec<_>>().join(" ");
                (name.to_ascii_lowercase(), trimmed)
            })
            .collect();
        pairs.push(("host".to_string(), host.to_string()));
        pairs.push(("x-amz-date".to_string(), amz_date.clone()));
        pairs.sort_by(|a, b| a.0.cmp(&b.0));

        let canonical_headers: String = pairs
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();
        let signed_headers = pairs
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method,
            uri_encode_path(path),
            canonical_query_string(query),
            canonical_headers,
            signed_headers,
            payload_sha256
        );

        let credential_scope = format!(
            "{}/{}/{}/aws4_request",
            datestamp, self.region, self.service
        );
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let signing_key = derive_signing_key(
            &self.credentials.secret_key,
            &datestamp,
            &self.region,
            &self.service,
        );
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.credentials.access_key, credential_scope, signed_headers, signature
        );

        Signature {
            amz_date,
            authorization,
        }
    }
}

/// Build the sorted canonical query string from key/value pairs.
fn canonical_query_string(query: &[(&str, &str)]) -> String {
    let mut pairs: Vec<(String, String)> = query
        .iter()
        .map(|(k, v)| (uri_encode(k, true), uri_encode(v, true)))
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// URI-encode a path per SigV4: each segment encoded, '/' preserved.
fn uri_encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| uri_encode(segment, false))
        .collect::<Vec<_>>()
        .join("/")
}

/// URI-encode a string per SigV4 spec (RFC 3986).
/// Unreserved characters: A-Z a-z 0-9 - _ . ~
fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut encoded = String::with_capacity(input.len() * 3);
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char);
            }
            b'/' if !encode_slash => {
                encoded.push('/');
            }
            _ => {
                encoded.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    encoded
}

/// Derive the SigV4 signing key: HMAC chain over date, region, service, and
/// the literal `aws4_request`, seeded with `"AWS4" + secret`.
fn derive_signing_key(secret_key: &str, datestamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_secret = format!("AWS4{}", secret_key);
    let k_date = hmac_sha256(k_secret.as_bytes(), datestamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// Compute HMAC-SHA256.
fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}
