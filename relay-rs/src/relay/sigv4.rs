//! AWS Signature Version 4 request signing

use super::AwsCredentials;
use chrono::{DateTime, Utc};
use hmac::digest::InvalidLength;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// The parts of an HTTP request that go into the signature
pub(crate) struct CanonicalRequest<'a> {
    pub method: &'a str,
    pub path: &'a str,
    /// Already sorted and percent-encoded
    pub query: &'a str,
    /// Lowercase names; `x-amz-date` is added by [`sign`]
    pub headers: Vec<(String, String)>,
    pub payload: &'a [u8],
}

/// Headers to attach to the outgoing request
#[derive(Debug)]
pub(crate) struct Signature {
    pub amz_date: String,
    pub authorization: String,
}

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(key)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

pub(crate) fn signing_key(
    secret: &str,
    date: &str,
    region: &str,
    service: &str,
) -> Result<Vec<u8>, InvalidLength> {
    let k_date = hmac_sha256(format!("AWS4{}", secret).as_bytes(), date.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

pub(crate) fn sign(
    request: CanonicalRequest<'_>,
    credentials: &AwsCredentials,
    region: &str,
    service: &str,
    now: DateTime<Utc>,
) -> Result<Signature, InvalidLength> {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();

    let mut headers = request.headers;
    headers.push(("x-amz-date".to_string(), amz_date.clone()));
    if let Some(ref token) = credentials.session_token {
        headers.push(("x-amz-security-token".to_string(), token.clone()));
    }
    headers.sort_by(|a, b| a.0.cmp(&b.0));

    let canonical_headers: String = headers
        .iter()
        .map(|(name, value)| format!("{}:{}\n", name, value.trim()))
        .collect();
    let signed_headers = headers
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        request.method,
        request.path,
        request.query,
        canonical_headers,
        signed_headers,
        sha256_hex(request.payload)
    );

    let scope = format!("{}/{}/{}/aws4_request", date, region, service);
    let string_to_sign = format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM,
        amz_date,
        scope,
        sha256_hex(canonical_request.as_bytes())
    );

    let key = signing_key(&credentials.secret_access_key, &date, region, service)?;
    let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes())?);

    Ok(Signature {
        amz_date,
        authorization: format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM, credentials.access_key_id, scope, signed_headers, signature
        ),
    })
}
