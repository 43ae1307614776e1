//! S3-compatible object storage client: per-app data bucket and per-app
//! web bucket (§4.2, §4.7), backed by any MinIO-compatible endpoint.
//! Grounded on `backup::s3::S3Adapter`'s request shape, with real SigV4
//! signing from [`super::sign`] in place of that adapter's stub.

use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::{debug, warn};

use super::sign::{self, Credentials};
use crate::config::BlobConfiguration;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("bucket already exists: {0}")]
    BucketExists(String),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("blob store returned {status}: {body}")]
    Upstream {
        status: StatusCode,
        body: String,
    },
}

pub type BlobResult<T> = Result<T, BlobError>;

pub struct BlobStore {
    client: Client,
    endpoint: String,
    host: String,
    access_key: String,
    secret_key: String,
    region: String,
    use_path_style: bool,
}

impl BlobStore {
    pub fn new(cfg: &BlobConfiguration) -> BlobResult<Self> {
        let client = Client::builder().timeout(Duration::from_secs(120)).build()?;
        let endpoint = cfg.endpoint.trim_end_matches('/').to_string();
        let host = endpoint
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .to_string();
        Ok(Self {
            client,
            endpoint,
            host,
            access_key: cfg.access_key.clone(),
            secret_key: cfg.secret_key.clone(),
            region: cfg.region.clone(),
            use_path_style: cfg.use_path_style,
        })
    }

    fn creds(&self) -> Credentials<'_> {
        Credentials {
            access_key: &self.access_key,
            secret_key: &self.secret_key,
            region: &self.region,
        }
    }

    fn bucket_host(&self, bucket: &str) -> String {
        if self.use_path_style {
            self.host.clone()
        } else {
            format!("{bucket}.{}", self.host)
        }
    }

    fn object_url(&self, bucket: &str, key: &str) -> (String, String) {
        if self.use_path_style {
            (
                format!("{}/{bucket}/{key}", self.endpoint),
                format!("/{bucket}/{key}"),
            )
        } else {
            let proto = if self.endpoint.starts_with("https://") {
                "https"
            } else {
                "http"
            };
            (
                format!("{proto}://{bucket}.{}/{key}", self.host),
                format!("/{key}"),
            )
        }
    }

    fn bucket_url(&self, bucket: &str) -> (String, String) {
        if self.use_path_style {
            (format!("{}/{bucket}", self.endpoint), format!("/{bucket}"))
        } else {
            let proto = if self.endpoint.starts_with("https://") {
                "https"
            } else {
                "http"
            };
            (format!("{proto}://{bucket}.{}/", self.host), "/".to_string())
        }
    }

    /// `PUT /{bucket}` — idempotent: a `BucketAlreadyOwnedByYou` response is
    /// swallowed, since app start/restart must be safe to retry (§4.2).
    pub async fn ensure_bucket(&self, bucket: &str) -> BlobResult<()> {
        let (url, uri) = self.bucket_url(bucket);
        let now = Utc::now();
        let signed = sign::sign_request(&self.creds(), "PUT", &self.bucket_host(bucket), &uri, b"", now);

        let resp = self
            .client
            .put(&url)
            .header("host", self.bucket_host(bucket))
            .header("x-amz-date", signed.amz_date)
            .header("x-amz-content-sha256", signed.content_sha256)
            .header("authorization", signed.authorization)
            .send()
            .await?;

        match resp.status() {
            StatusCode::OK | StatusCode::CREATED => Ok(()),
            StatusCode::CONFLICT => {
                debug!(bucket, "bucket already owned by caller");
                Ok(())
            }
            status => {
                let body = resp.text().await.unwrap_or_default();
                if body.contains("BucketAlreadyOwnedByYou") {
                    Ok(())
                } else {
                    Err(BlobError::Upstream { status, body })
                }
            }
        }
    }

    /// Attaches a public-read bucket policy. Only ever called for the
    /// `web-` bucket (§4.7): the data bucket stays private.
    pub async fn set_public_read_policy(&self, bucket: &str) -> BlobResult<()> {
        let policy = format!(
            r#"{{"Version":"2012-10-17","Statement":[{{"Effect":"Allow","Principal":"*","Action":["s3:GetObject"],"Resource":["arn:aws:s3:::{bucket}/*"]}}]}}"#
        );
        let (base_url, base_uri) = self.bucket_url(bucket);
        let url = format!("{}?policy", base_url.trim_end_matches('/'));
        let uri = format!("{}?policy", base_uri.trim_end_matches('/'));
        let now = Utc::now();
        let signed = sign::sign_request(
            &self.creds(),
            "PUT",
            &self.bucket_host(bucket),
            &uri,
            policy.as_bytes(),
            now,
        );

        let resp = self
            .client
            .put(&url)
            .header("host", self.bucket_host(bucket))
            .header("x-amz-date", signed.amz_date)
            .header("x-amz-content-sha256", signed.content_sha256)
            .header("authorization", signed.authorization)
            .body(policy)
            .send()
            .await?;

        if resp.status().is_success() {
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(BlobError::Upstream { status, body })
        }
    }

    pub async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> BlobResult<()> {
        let (url, uri) = self.object_url(bucket, key);
        let now = Utc::now();
        let signed = sign::sign_request(&self.creds(), "PUT", &self.bucket_host(bucket), &uri, &body, now);

        let resp = self
            .client
            .put(&url)
            .header("host", self.bucket_host(bucket))
            .header("x-amz-date", signed.amz_date)
            .header("x-amz-content-sha256", signed.content_sha256)
            .header("authorization", signed.authorization)
            .body(body)
            .send()
            .await?;

        if resp.status().is_success() {
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(BlobError::Upstream { status, body })
        }
    }

    /// Streaming read. Returns `NotFound` on a 404, which callers (the
    /// runtime's code loader) retry a fixed number of times before
    /// surfacing (§9.1 consistency notes).
    pub async fn get_object(&self, bucket: &str, key: &str) -> BlobResult<Bytes> {
        let (url, uri) = self.object_url(bucket, key);
        let now = Utc::now();
        let signed = sign::sign_request(&self.creds(), "GET", &self.bucket_host(bucket), &uri, b"", now);

        let resp = self
            .client
            .get(&url)
            .header("host", self.bucket_host(bucket))
            .header("x-amz-date", signed.amz_date)
            .header("x-amz-content-sha256", signed.content_sha256)
            .header("authorization", signed.authorization)
            .send()
            .await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(BlobError::NotFound(format!("{bucket}/{key}")));
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(BlobError::Upstream { status, body });
        }
        Ok(resp.bytes().await?)
    }

    pub async fn object_exists(&self, bucket: &str, key: &str) -> BlobResult<bool> {
        let (url, uri) = self.object_url(bucket, key);
        let now = Utc::now();
        let signed = sign::sign_request(&self.creds(), "HEAD", &self.bucket_host(bucket), &uri, b"", now);

        let resp = self
            .client
            .head(&url)
            .header("host", self.bucket_host(bucket))
            .header("x-amz-date", signed.amz_date)
            .header("x-amz-content-sha256", signed.content_sha256)
            .header("authorization", signed.authorization)
            .send()
            .await?;

        Ok(resp.status().is_success())
    }

    pub async fn delete_object(&self, bucket: &str, key: &str) -> BlobResult<()> {
        let (url, uri) = self.object_url(bucket, key);
        let now = Utc::now();
        let signed = sign::sign_request(&self.creds(), "DELETE", &self.bucket_host(bucket), &uri, b"", now);

        let resp = self
            .client
            .delete(&url)
            .header("host", self.bucket_host(bucket))
            .header("x-amz-date", signed.amz_date)
            .header("x-amz-content-sha256", signed.content_sha256)
            .header("authorization", signed.authorization)
            .send()
            .await?;

        if resp.status().is_success() || resp.status() == StatusCode::NO_CONTENT {
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(BlobError::Upstream { status, body })
        }
    }

    /// Deletes every object under `bucket`, then the bucket itself (§4.2
    /// delete_app cleanup). Best-effort: a failed individual delete is
    /// logged and skipped rather than aborting the whole sweep.
    pub async fn delete_bucket_recursive(&self, bucket: &str) -> BlobResult<()> {
        let keys = self.list_objects(bucket, "").await?;
        for key in keys {
            if let Err(err) = self.delete_object(bucket, &key).await {
                warn!(bucket, key, %err, "failed to delete object during bucket cleanup");
            }
        }
        let (url, uri) = self.bucket_url(bucket);
        let now = Utc::now();
        let signed = sign::sign_request(&self.creds(), "DELETE", &self.bucket_host(bucket), &uri, b"", now);
        let resp = self
            .client
            .delete(url.trim_end_matches('/'))
            .header("host", self.bucket_host(bucket))
            .header("x-amz-date", signed.amz_date)
            .header("x-amz-content-sha256", signed.content_sha256)
            .header("authorization", signed.authorization)
            .send()
            .await?;
        if resp.status().is_success() || resp.status() == StatusCode::NO_CONTENT {
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(BlobError::Upstream { status, body })
        }
    }

    /// Lists object keys under `prefix` via the `ListObjectsV2` API,
    /// parsing just the `<Key>` elements out of the XML body.
    pub async fn list_objects(&self, bucket: &str, prefix: &str) -> BlobResult<Vec<String>> {
        let (base_url, base_uri) = self.bucket_url(bucket);
        let query = format!("list-type=2&prefix={}", urlencoding_escape(prefix));
        let url = format!("{}?{query}", base_url.trim_end_matches('/'));
        let uri = format!("{}?{query}", base_uri.trim_end_matches('/'));
        let now = Utc::now();
        let signed = sign::sign_request(&self.creds(), "GET", &self.bucket_host(bucket), &uri, b"", now);

        let resp = self
            .client
            .get(&url)
            .header("host", self.bucket_host(bucket))
            .header("x-amz-date", signed.amz_date)
            .header("x-amz-content-sha256", signed.content_sha256)
            .header("authorization", signed.authorization)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(BlobError::Upstream { status, body });
        }

        let body = resp.text().await?;
        Ok(parse_keys(&body))
    }

    /// `GET /` at the service root — used only by the `/__server_health__`
    /// liveness check (§6) to confirm the blob store itself answers
    /// requests, not to enumerate buckets for any functional purpose.
    pub async fn list_buckets(&self) -> BlobResult<Vec<String>> {
        let now = Utc::now();
        let signed = sign::sign_request(&self.creds(), "GET", &self.host, "/", b"", now);

        let resp = self
            .client
            .get(&self.endpoint)
            .header("host", &self.host)
            .header("x-amz-date", signed.amz_date)
            .header("x-amz-content-sha256", signed.content_sha256)
            .header("authorization", signed.authorization)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(BlobError::Upstream { status, body });
        }

        let body = resp.text().await?;
        Ok(parse_bucket_names(&body))
    }

    /// Builds a time-limited presigned GET URL for direct client download
    /// (§4.7 `web-` bucket asset serving).
    pub fn presigned_get_url(&self, bucket: &str, key: &str, expires_in_secs: u64) -> String {
        let (url, uri) = self.object_url(bucket, key);
        let base = url.split('?').next().unwrap_or(&url).to_string();
        let now = Utc::now();
        let query = sign::presign_query(&self.creds(), &self.bucket_host(bucket), &uri, expires_in_secs, now);
        format!("{base}?{query}")
    }
}

fn urlencoding_escape(s: &str) -> String {
    let mut out = String::new();
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Parses `<Name>` elements out of a `ListAllMyBuckets` response body.
fn parse_bucket_names(xml: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find("<Name>") {
        rest = &rest[start + 6..];
        if let Some(end) = rest.find("</Name>") {
            names.push(rest[..end].to_string());
            rest = &rest[end + 7..];
        } else {
            break;
        }
    }
    names
}

fn parse_keys(xml: &str) -> Vec<String> {
    let mut keys = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find("<Key>") {
        rest = &rest[start + 5..];
        if let Some(end) = rest.find("</Key>") {
            keys.push(rest[..end].to_string());
            rest = &rest[end + 6..];
        } else {
            break;
        }
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_keys_extracts_all_key_elements() {
        let xml = "<ListBucketResult><Contents><Key>a/b.txt</Key></Contents><Contents><Key>c.txt</Key></Contents></ListBucketResult>";
        assert_eq!(parse_keys(xml), vec!["a/b.txt".to_string(), "c.txt".to_string()]);
    }

    #[test]
    fn parse_keys_on_empty_listing() {
        assert!(parse_keys("<ListBucketResult></ListBucketResult>").is_empty());
    }

    #[test]
    fn parse_bucket_names_extracts_all_name_elements() {
        let xml = "<ListAllMyBucketsResult><Buckets><Bucket><Name>a</Name></Bucket><Bucket><Name>web-a</Name></Bucket></Buckets></ListAllMyBucketsResult>";
        assert_eq!(parse_bucket_names(xml), vec!["a".to_string(), "web-a".to_string()]);
    }
}
