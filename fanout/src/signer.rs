//! SigV4 request signing for Lambda invocations.
//!
//! The signing scope (service and region) is taken from the invocation host, which for Lambda
//! looks like `lambda.<region>.amazonaws.com`. The payload is serialized exactly once and the
//! serialized bytes are returned alongside the headers, so the body that goes on the wire is the
//! body that was hashed into the signature.

use std::{collections::BTreeMap, fmt, sync::Arc};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use http::{header, HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::{credentials::Credentials, error::SigningError};

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SCOPE_TERMINATOR: &str = "aws4_request";

pub const INVOCATION_TYPE_HEADER: &str = "x-amz-invocation-type";
pub const DATE_HEADER: &str = "x-amz-date";
pub const SECURITY_TOKEN_HEADER: &str = "x-amz-security-token";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// How Lambda should run an invocation (`X-Amz-Invocation-Type`).
pub enum InvocationType {
    /// Run synchronously and return the function result.
    #[serde(alias = "sync")]
    RequestResponse,
    /// Queue the event and return immediately.
    #[serde(alias = "async")]
    Event,
    /// Validate parameters and permissions without running the function.
    #[serde(alias = "dry_run")]
    DryRun,
}

impl Default for InvocationType {
    fn default() -> Self {
        Self::RequestResponse
    }
}

impl InvocationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestResponse => "RequestResponse",
            Self::Event => "Event",
            Self::DryRun => "DryRun",
        }
    }
}

impl fmt::Display for InvocationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Service and region a signature is scoped to.
pub struct SigningScope {
    pub service: String,
    pub region: String,
}

impl SigningScope {
    /// Derive the scope from the first two labels of the URL host.
    pub fn from_url(url: &Url) -> Result<Self, SigningError> {
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(SigningError::UnsupportedScheme {
                    scheme: other.to_string(),
                })
            }
        }

        let host = match url.host() {
            Some(url::Host::Domain(host)) => host,
            Some(other) => {
                return Err(SigningError::UnrecognizedHost {
                    host: other.to_string(),
                })
            }
            None => {
                return Err(SigningError::MissingHost {
                    url: url.to_string(),
                })
            }
        };

        let labels: Vec<&str> = host.split('.').collect();
        if labels.len() < 3 || labels[..2].iter().any(|l| l.is_empty()) {
            return Err(SigningError::UnrecognizedHost {
                host: host.to_string(),
            });
        }

        Ok(Self {
            service: labels[0].to_string(),
            region: labels[1].to_string(),
        })
    }
}

#[derive(Debug, Clone)]
/// A fully signed invocation, ready to hand to a transport.
pub struct SignedRequest {
    pub url: Url,
    pub headers: HeaderMap,
    /// Serialized payload. These exact bytes were hashed into the signature.
    pub body: Bytes,
}

#[derive(Clone)]
pub struct Signer {
    credentials: Arc<Credentials>,
}

impl Signer {
    pub fn new(credentials: Arc<Credentials>) -> Self {
        Self { credentials }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Sign a `POST` of `payload` to `url`, timestamped with the current time.
    pub fn sign(
        &self,
        url: &str,
        payload: &serde_json::Value,
        mode: InvocationType,
    ) -> Result<SignedRequest, SigningError> {
        self.sign_at(url, payload, mode, Utc::now())
    }

    pub fn sign_at(
        &self,
        url: &str,
        payload: &serde_json::Value,
        mode: InvocationType,
        now: DateTime<Utc>,
    ) -> Result<SignedRequest, SigningError> {
        let url = Url::parse(url).map_err(|source| SigningError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;
        let scope = SigningScope::from_url(&url)?;
        let body = Bytes::from(serde_json::to_vec(payload)?);

        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();

        let mut headers: BTreeMap<&'static str, String> = BTreeMap::new();
        headers.insert("content-type", "application/json".to_string());
        headers.insert("host", host_header(&url));
        headers.insert(DATE_HEADER, amz_date.clone());
        headers.insert(INVOCATION_TYPE_HEADER, mode.as_str().to_string());
        if let Some(token) = self.credentials.session_token() {
            headers.insert(SECURITY_TOKEN_HEADER, token.to_string());
        }

        let canonical = CanonicalRequest {
            method: "POST",
            path: canonical_uri(url.path()),
            query: canonical_query(&url),
            headers: &headers,
            payload_hash: hex_sha256(&body),
        };
        let credential_scope = format!(
            "{date}/{}/{}/{SCOPE_TERMINATOR}",
            scope.region, scope.service
        );
        let to_sign = string_to_sign(&amz_date, &credential_scope, &canonical.render());
        let key = signing_key(
            self.credentials.secret_access_key(),
            &date,
            &scope.region,
            &scope.service,
        );
        let signature = hex::encode(hmac_sha256(&key, to_sign.as_bytes()));
        let authorization = format!(
            "{ALGORITHM} Credential={}/{credential_scope}, SignedHeaders={}, Signature={signature}",
            self.credentials.access_key_id(),
            canonical.signed_headers(),
        );

        let mut out = HeaderMap::with_capacity(headers.len() + 1);
        for (name, value) in headers {
            out.insert(HeaderName::from_static(name), header_value(name, &value)?);
        }
        out.insert(
            header::AUTHORIZATION,
            header_value("authorization", &authorization)?,
        );

        Ok(SignedRequest { url, headers: out, body })
    }
}

/// The normalized request representation that gets hashed into the string to sign.
struct CanonicalRequest<'a> {
    method: &'a str,
    path: String,
    query: String,
    /// Lowercase header names, sorted.
    headers: &'a BTreeMap<&'a str, String>,
    payload_hash: String,
}

impl CanonicalRequest<'_> {
    fn signed_headers(&self) -> String {
        self.headers.keys().copied().collect::<Vec<_>>().join(";")
    }

    fn render(&self) -> String {
        let mut canonical_headers = String::new();
        for (name, value) in self.headers {
            canonical_headers.push_str(name);
            canonical_headers.push(':');
            canonical_headers.push_str(&normalize_header_value(value));
            canonical_headers.push('\n');
        }
        format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            self.method,
            self.path,
            self.query,
            canonical_headers,
            self.signed_headers(),
            self.payload_hash
        )
    }
}

fn string_to_sign(amz_date: &str, credential_scope: &str, canonical_request: &str) -> String {
    format!(
        "{ALGORITHM}\n{amz_date}\n{credential_scope}\n{}",
        hex_sha256(canonical_request.as_bytes())
    )
}

/// `HMAC("AWS4" + secret, date) -> region -> service -> "aws4_request"`.
fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, SCOPE_TERMINATOR.as_bytes())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

fn header_value(name: &'static str, value: &str) -> Result<HeaderValue, SigningError> {
    HeaderValue::from_str(value).map_err(|_| SigningError::InvalidHeaderValue { name })
}

/// Trim and collapse runs of whitespace to a single space.
fn normalize_header_value(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// URI-encode a path for the canonical request.
///
/// Everything except RFC 3986 unreserved characters and `/` is percent-encoded, including `%`.
/// A path that already carries percent-escapes is therefore encoded a second time, which is what
/// every service other than S3 expects.
fn canonical_uri(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    uri_encode(path.as_bytes(), false)
}

/// Canonical query string, built from the raw query.
///
/// Components are percent-decoded and re-encoded, so `%2F` and `/` canonicalize alike. `+` is a
/// literal plus here, not a space.
fn canonical_query(url: &Url) -> String {
    let Some(query) = url.query() else {
        return String::new();
    };
    let mut pairs: Vec<(String, String)> = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (
                uri_encode(&percent_decode(k), true),
                uri_encode(&percent_decode(v), true),
            )
        })
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn percent_decode(input: &str) -> Vec<u8> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let Some(Ok(decoded)) = bytes.get(i + 1..i + 3).map(hex::decode) {
                out.extend_from_slice(&decoded);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

fn uri_encode(input: &[u8], encode_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for &b in input {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            b'/' if !encode_slash => out.push('/'),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}
