//! AWS Signature Version 4, just the slice this crate needs: signed
//! headers for direct requests and a signed query string for presigned
//! GET URLs. Grounded on the shape of `backup::s3::S3Adapter::sign_request`,
//! but implements the real HMAC chain that adapter only stubbed out.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

const SERVICE: &str = "s3";
const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

pub struct Credentials<'a> {
    pub access_key: &'a str,
    pub secret_key: &'a str,
    pub region: &'a str,
}

fn hmac(key: &[u8], data: &str) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

fn signing_key(secret_key: &str, date_stamp: &str, region: &str) -> Vec<u8> {
    let k_date = hmac(format!("AWS4{secret_key}").as_bytes(), date_stamp);
    let k_region = hmac(&k_date, region);
    let k_service = hmac(&k_region, SERVICE);
    hmac(&k_service, "aws4_request")
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Percent-encodes a path segment per SigV4 rules (RFC 3986 unreserved set
/// plus `/` left alone in paths).
fn uri_encode(s: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
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

fn canonical_query(pairs: &[(String, String)]) -> String {
    let mut sorted = pairs.to_vec();
    sorted.sort();
    sorted
        .into_iter()
        .map(|(k, v)| format!("{}={}", uri_encode(&k, true), uri_encode(&v, true)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Headers to attach to a directly-signed (non-presigned) request: the
/// `Authorization`, `x-amz-date`, and `x-amz-content-sha256` values.
pub struct SignedHeaders {
    pub authorization: String,
    pub amz_date: String,
    pub content_sha256: String,
}

#[allow(clippy::too_many_arguments)]
pub fn sign_request(
    creds: &Credentials,
    method: &str,
    host: &str,
    canonical_uri: &str,
    payload: &[u8],
    now: DateTime<Utc>,
) -> SignedHeaders {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = now.format("%Y%m%d").to_string();
    let payload_hash = sha256_hex(payload);

    let canonical_headers = format!(
        "host:{host}\nx-amz-content-sha256:{payload_hash}\nx-amz-date:{amz_date}\n"
    );
    let signed_headers = "host;x-amz-content-sha256;x-amz-date";

    let canonical_request = format!(
        "{method}\n{uri}\n\n{headers}\n{signed}\n{hash}",
        method = method,
        uri = uri_encode(canonical_uri, false),
        headers = canonical_headers,
        signed = signed_headers,
        hash = payload_hash,
    );

    let credential_scope = format!("{date_stamp}/{}/{SERVICE}/aws4_request", creds.region);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{amz_date}\n{credential_scope}\n{}",
        sha256_hex(canonical_request.as_bytes())
    );

    let key = signing_key(creds.secret_key, &date_stamp, creds.region);
    let signature = hex::encode(hmac(&key, &string_to_sign));

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={}/{credential_scope}, SignedHeaders={signed_headers}, Signature={signature}",
        creds.access_key
    );

    SignedHeaders {
        authorization,
        amz_date,
        content_sha256: payload_hash,
    }
}

/// Builds the query string for a presigned GET: every `X-Amz-*` parameter
/// plus `X-Amz-Signature`, ready to append to `canonical_uri`.
pub fn presign_query(
    creds: &Credentials,
    host: &str,
    canonical_uri: &str,
    expires_in_secs: u64,
    now: DateTime<Utc>,
) -> String {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = now.format("%Y%m%d").to_string();
    let credential_scope = format!("{date_stamp}/{}/{SERVICE}/aws4_request", creds.region);
    let credential = format!("{}/{credential_scope}", creds.access_key);

    let mut params = vec![
        ("X-Amz-Algorithm".to_string(), "AWS4-HMAC-SHA256".to_string()),
        ("X-Amz-Credential".to_string(), credential),
        ("X-Amz-Date".to_string(), amz_date.clone()),
        ("X-Amz-Expires".to_string(), expires_in_secs.to_string()),
        ("X-Amz-SignedHeaders".to_string(), "host".to_string()),
    ];

    let canonical_query_no_sig = canonical_query(&params);
    let canonical_headers = format!("host:{host}\n");
    let canonical_request = format!(
        "GET\n{uri}\n{query}\n{headers}\nhost\n{payload}",
        uri = uri_encode(canonical_uri, false),
        query = canonical_query_no_sig,
        headers = canonical_headers,
        payload = UNSIGNED_PAYLOAD,
    );

    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{amz_date}\n{credential_scope}\n{}",
        sha256_hex(canonical_request.as_bytes())
    );

    let key = signing_key(creds.secret_key, &date_stamp, creds.region);
    let signature = hex::encode(hmac(&key, &string_to_sign));

    params.push(("X-Amz-Signature".to_string(), signature));
    canonical_query(&params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn uri_encode_preserves_unreserved_characters() {
        assert_eq!(uri_encode("abc-_.~123", false), "abc-_.~123");
        assert_eq!(uri_encode("a b", false), "a%20b");
    }

    #[test]
    fn sign_request_is_deterministic_for_fixed_inputs() {
        let creds = Credentials {
            access_key: "AKIDEXAMPLE",
            secret_key: "wJalrXUtnFEMI/K7MDENG/bPxRfiCYEXAMPLEKEY",
            region: "us-east-1",
        };
        let a = sign_request(&creds, "GET", "example.com", "/bucket/key", b"", fixed_time());
        let b = sign_request(&creds, "GET", "example.com", "/bucket/key", b"", fixed_time());
        assert_eq!(a.authorization, b.authorization);
        assert!(a.authorization.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/"));
    }

    #[test]
    fn presign_query_includes_signature_and_expiry() {
        let creds = Credentials {
            access_key: "AKIDEXAMPLE",
            secret_key: "wJalrXUtnFEMI/K7MDENG/bPxRfiCYEXAMPLEKEY",
            region: "us-east-1",
        };
        let query = presign_query(&creds, "example.com", "/bucket/key", 900, fixed_time());
        assert!(query.contains("X-Amz-Expires=900"));
        assert!(query.contains("X-Amz-Signature="));
    }
}
