//! Object storage for course files and generated thumbnails.
//!
//! [`ObjectStore`] is the seam between the pipeline and wherever the raw
//! files live. Three backends:
//!
//! - [`S3ObjectStore`]: AWS S3 or any S3-compatible service, using
//!   SigV4-signed `GET`/`PUT` requests over `reqwest`. No AWS SDK.
//! - [`LocalObjectStore`]: keys resolved under a root directory.
//! - [`MemoryObjectStore`]: a map, for tests.
//!
//! # Credentials
//!
//! S3 reads `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and optionally
//! `AWS_SESSION_TOKEN` from the environment.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::config::{StorageBackend, StorageConfig};

type HmacSha256 = Hmac<Sha256>;

const REQUEST_TIMEOUT_SECS: u64 = 120;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch the full contents of `key`.
    async fn download(&self, key: &str) -> Result<Vec<u8>>;

    /// Store `bytes` under `key`, replacing any existing object.
    async fn upload(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()>;

    /// Download `key` into `file`, returning the number of bytes written.
    async fn download_to(&self, key: &str, file: &mut std::fs::File) -> Result<u64> {
        let bytes = self.download(key).await?;
        file.write_all(&bytes)
            .with_context(|| format!("Failed to spool '{}' to disk", key))?;
        file.flush()?;
        Ok(bytes.len() as u64)
    }
}

/// Build the object store named by `[storage]`.
pub fn create_object_store(config: &StorageConfig) -> Result<std::sync::Arc<dyn ObjectStore>> {
    match config.backend {
        StorageBackend::S3 => Ok(std::sync::Arc::new(S3ObjectStore::new(config)?)),
        StorageBackend::Local => {
            let root = config
                .root
                .clone()
                .ok_or_else(|| anyhow!("storage.root must be set when backend is 'local'"))?;
            Ok(std::sync::Arc::new(LocalObjectStore::new(root)))
        }
    }
}

// ============ S3 ============

/// AWS credentials loaded from environment variables.
struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

pub struct S3ObjectStore {
    bucket: String,
    region: String,
    endpoint_url: Option<String>,
    creds: AwsCredentials,
    client: reqwest::Client,
}

impl S3ObjectStore {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        if config.bucket.is_empty() {
            bail!("storage.bucket must be set when backend is 's3'");
        }
        Ok(Self {
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            endpoint_url: config.endpoint_url.clone(),
            creds: AwsCredentials::from_env()?,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()?,
        })
    }

    /// Virtual-hosted style on AWS, path style on custom endpoints
    /// (MinIO, LocalStack).
    fn locate(&self, key: &str) -> S3Location {
        let encoded_key = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        match &self.endpoint_url {
            Some(endpoint) => {
                let scheme = if endpoint.starts_with("http://") {
                    "http"
                } else {
                    "https"
                };
                let host = endpoint
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .trim_end_matches('/')
                    .to_string();
                let canonical_uri = format!("/{}/{}", uri_encode(&self.bucket), encoded_key);
                S3Location {
                    url: format!("{}://{}{}", scheme, host, canonical_uri),
                    host,
                    canonical_uri,
                }
            }
            None => {
                let host = format!("{}.s3.{}.amazonaws.com", self.bucket, self.region);
                let canonical_uri = format!("/{}", encoded_key);
                S3Location {
                    url: format!("https://{}{}", host, canonical_uri),
                    host,
                    canonical_uri,
                }
            }
        }
    }

    /// Build a SigV4-signed request for `key`.
    fn signed_request(
        &self,
        method: reqwest::Method,
        key: &str,
        payload: &[u8],
    ) -> reqwest::RequestBuilder {
        let loc = self.locate(key);
        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = hex_sha256(payload);

        let mut headers = vec![
            ("host".to_string(), loc.host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n\n{}\n{}\n{}",
            method.as_str(),
            loc.canonical_uri,
            canonical_headers,
            signed_headers,
            payload_hash
        );
        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );
        let signing_key = derive_signing_key(
            &self.creds.secret_access_key,
            &date_stamp,
            &self.region,
            "s3",
        );
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));
        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.creds.access_key_id, credential_scope, signed_headers, signature
        );

        let mut builder = self
            .client
            .request(method, &loc.url)
            .header("Authorization", authorization)
            .header("x-amz-content-sha256", payload_hash)
            .header("x-amz-date", amz_date);
        if let Some(ref token) = self.creds.session_token {
            builder = builder.header("x-amz-security-token", token);
        }
        builder
    }
}

struct S3Location {
    url: String,
    host: String,
    canonical_uri: String,
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn download(&self, key: &str) -> Result<Vec<u8>> {
        let resp = self
            .signed_request(reqwest::Method::GET, key, b"")
            .send()
            .await
            .with_context(|| format!("Failed to get s3://{}/{}", self.bucket, key))?;
        let status = resp.status();
        if !status.is_success() {
            bail!("S3 GetObject failed (HTTP {}) for key '{}'", status, key);
        }
        Ok(resp.bytes().await?.to_vec())
    }

    async fn upload(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        let resp = self
            .signed_request(reqwest::Method::PUT, key, &bytes)
            .header("Content-Type", content_type)
            .body(bytes)
            .send()
            .await
            .with_context(|| format!("Failed to put s3://{}/{}", self.bucket, key))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!(
                "S3 PutObject failed (HTTP {}) for key '{}': {}",
                status,
                key,
                body
            );
        }
        Ok(())
    }
}

// ============ AWS SigV4 Helpers ============

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 encoding of everything except `A-Z a-z 0-9 - _ . ~`.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => result.push_str(&format!("%{:02X}", byte)),
        }
    }
    result
}

// ============ Local directory ============

/// Keys are relative paths under `root`.
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key.trim_start_matches('/'));
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            bail!("Invalid object key '{}'", key);
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn download(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.resolve(key)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read object {}", path.display()))
    }

    async fn upload(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> Result<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write object {}", path.display()))
    }
}

// ============ In-memory ============

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// Objects held in a map.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, StoredObject>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: &str, bytes: impl Into<Vec<u8>>) {
        if let Ok(mut objects) = self.objects.write() {
            objects.insert(
                key.to_string(),
                StoredObject {
                    bytes: bytes.into(),
                    content_type: "application/octet-stream".to_string(),
                },
            );
        }
    }

    pub fn get(&self, key: &str) -> Option<StoredObject> {
        self.objects.read().ok()?.get(key).cloned()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn download(&self, key: &str) -> Result<Vec<u8>> {
        self.get(key)
            .map(|o| o.bytes)
            .ok_or_else(|| anyhow!("No such object: {}", key))
    }

    async fn upload(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        let mut objects = self
            .objects
            .write()
            .map_err(|_| anyhow!("object map lock poisoned"))?;
        objects.insert(
            key.to_string(),
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_encode() {
        assert_eq!(uri_encode("Lecture 1.pdf"), "Lecture%201.pdf");
        assert_eq!(uri_encode("a-b_c.d~e"), "a-b_c.d~e");
    }

    #[test]
    fn test_signing_key_matches_aws_example() {
        // From the AWS SigV4 documentation.
        let key = derive_signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20120215",
            "us-east-1",
            "iam",
        );
        assert_eq!(
            hex::encode(key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[test]
    fn test_local_rejects_parent_traversal() {
        let store = LocalObjectStore::new("/tmp/objects");
        assert!(store.resolve("../etc/passwd").is_err());
        assert_eq!(
            store.resolve("courses/a.pdf").unwrap(),
            PathBuf::from("/tmp/objects/courses/a.pdf")
        );
    }

    #[tokio::test]
    async fn test_local_roundtrip_creates_parents() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = LocalObjectStore::new(tmp.path());
        store
            .upload("c/x/thumb.png", vec![1, 2, 3], "image/png")
            .await
            .unwrap();
        assert_eq!(store.download("c/x/thumb.png").await.unwrap(), vec![1, 2, 3]);
        assert!(store.download("c/x/missing.png").await.is_err());
    }

    #[tokio::test]
    async fn test_download_to_spools_file() {
        let store = MemoryObjectStore::new();
        store.insert("k.txt", b"hello".to_vec());
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        let n = store.download_to("k.txt", tmp.as_file_mut()).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(std::fs::read(tmp.path()).unwrap(), b"hello");
    }
}
