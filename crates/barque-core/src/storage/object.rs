use std::collections::BTreeMap;
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{BkError, Result};
use crate::storage::retry::{retry_http, RetryConfig};
use crate::storage::throttle::TokenBucket;
use crate::storage::{validate_name, Backend, TransferStats};

/// Largest object the backend will buffer on download (pack hard cap + slack).
const MAX_OBJECT_SIZE: u64 = 192 * 1024 * 1024;

const API_BASE: &str = "https://storage.googleapis.com";

#[derive(Debug, Clone)]
pub struct ObjectStoreOptions {
    pub bucket: String,
    pub project_id: String,
    /// Bearer token for the bucket, if the environment provides one.
    pub access_token: Option<String>,
    pub max_upload_bytes_per_second: u64,
    pub max_download_bytes_per_second: u64,
    pub retry: RetryConfig,
}

/// HTTP object-store backend (Google Cloud Storage JSON API). Blobs live
/// under the `blobs/` object prefix, metadata under `meta/`; both directions
/// are paced by process-wide token buckets.
pub struct ObjectStoreBackend {
    bucket: String,
    project_id: String,
    agent: ureq::Agent,
    token: Option<String>,
    retry: RetryConfig,
    upload_throttle: TokenBucket,
    download_throttle: TokenBucket,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
    write_ops: AtomicU64,
    read_ops: AtomicU64,
}

#[derive(Deserialize)]
struct ListResponse {
    #[serde(default)]
    items: Vec<ListedObject>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct ListedObject {
    name: String,
    /// The JSON API reports sizes as decimal strings.
    size: String,
}

impl ObjectStoreBackend {
    pub fn new(options: ObjectStoreOptions) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(300))
            .timeout_write(Duration::from_secs(300))
            .build();
        ObjectStoreBackend {
            bucket: options.bucket,
            project_id: options.project_id,
            agent,
            token: options.access_token,
            retry: options.retry,
            upload_throttle: TokenBucket::new(options.max_upload_bytes_per_second),
            download_throttle: TokenBucket::new(options.max_download_bytes_per_second),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
            write_ops: AtomicU64::new(0),
            read_ops: AtomicU64::new(0),
        }
    }

    fn apply_auth(&self, req: ureq::Request) -> ureq::Request {
        let req = req.set("x-goog-user-project", &self.project_id);
        match &self.token {
            Some(token) => req.set("Authorization", &format!("Bearer {token}")),
            None => req,
        }
    }

    /// Percent-encode an object name for use in a URL path segment.
    fn encode_object(name: &str) -> String {
        let mut out = String::with_capacity(name.len());
        for byte in name.bytes() {
            match byte {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                    out.push(byte as char)
                }
                other => out.push_str(&format!("%{other:02X}")),
            }
        }
        out
    }

    fn object_url(&self, object: &str) -> String {
        format!(
            "{API_BASE}/storage/v1/b/{}/o/{}",
            self.bucket,
            Self::encode_object(object)
        )
    }

    fn upload_url(&self, object: &str) -> String {
        format!(
            "{API_BASE}/upload/storage/v1/b/{}/o?uploadType=media&name={}",
            self.bucket,
            Self::encode_object(object)
        )
    }

    #[allow(clippy::result_large_err)]
    fn call<T>(
        &self,
        op: &str,
        f: impl Fn() -> std::result::Result<T, ureq::Error>,
    ) -> std::result::Result<T, ureq::Error> {
        retry_http(&self.retry, op, "object-store", f)
    }

    /// Map an exhausted or permanent HTTP error: 404 is `NotFound`,
    /// 401/403 fail fast, everything else aborts the session.
    fn map_err(object: &str, err: ureq::Error) -> BkError {
        match err {
            ureq::Error::Status(404, _) => BkError::NotFound(object.to_string()),
            ureq::Error::Status(code @ (401 | 403), _) => {
                BkError::IoFatal(format!("object store denied access ({code}) for '{object}'"))
            }
            other => BkError::IoFatal(format!("object store failure for '{object}': {other}")),
        }
    }

    fn put_object(&self, object: &str, data: &[u8]) -> Result<()> {
        self.upload_throttle.consume(data.len() as u64);
        let url = self.upload_url(object);
        self.call("put", || {
            let req = self
                .apply_auth(self.agent.post(&url))
                .set("Content-Type", "application/octet-stream");
            req.send_bytes(data).map(|_| ())
        })
        .map_err(|e| Self::map_err(object, e))?;
        self.bytes_up.fetch_add(data.len() as u64, Ordering::Relaxed);
        self.write_ops.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn get_object(&self, object: &str, range: Option<(u64, u64)>) -> Result<Vec<u8>> {
        let url = format!("{}?alt=media", self.object_url(object));
        let expected = range.map(|(_, len)| len);
        let response = self
            .call("get", || {
                let mut req = self.apply_auth(self.agent.get(&url));
                if let Some((offset, len)) = range {
                    req = req.set("Range", &format!("bytes={}-{}", offset, offset + len - 1));
                }
                req.call()
            })
            .map_err(|e| Self::map_err(object, e))?;

        let mut data = Vec::new();
        response
            .into_reader()
            .take(MAX_OBJECT_SIZE + 1)
            .read_to_end(&mut data)
            .map_err(|e| BkError::IoFatal(format!("object store read of '{object}': {e}")))?;
        if data.len() as u64 > MAX_OBJECT_SIZE {
            return Err(BkError::Integrity(format!(
                "object '{object}' exceeds the {MAX_OBJECT_SIZE}-byte limit"
            )));
        }
        if let Some(expected) = expected {
            if data.len() as u64 != expected {
                return Err(BkError::Integrity(format!(
                    "short range read of '{object}': wanted {expected} bytes, got {}",
                    data.len()
                )));
            }
        }
        self.download_throttle.consume(data.len() as u64);
        self.bytes_down
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        self.read_ops.fetch_add(1, Ordering::Relaxed);
        Ok(data)
    }

    fn object_exists(&self, object: &str) -> Result<bool> {
        let url = format!("{}?fields=name", self.object_url(object));
        match self.call("stat", || {
            self.apply_auth(self.agent.get(&url)).call().map(|_| ())
        }) {
            Ok(()) => Ok(true),
            Err(ureq::Error::Status(404, _)) => Ok(false),
            Err(e) => Err(Self::map_err(object, e)),
        }
    }

    /// List objects under a prefix, following pagination.
    fn list_objects(&self, prefix: &str) -> Result<Vec<(String, u64)>> {
        let mut out = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = format!(
                "{API_BASE}/storage/v1/b/{}/o?prefix={}&fields=items(name,size),nextPageToken",
                self.bucket,
                Self::encode_object(prefix)
            );
            if let Some(ref token) = page_token {
                url.push_str("&pageToken=");
                url.push_str(token);
            }
            let response = self
                .call("list", || self.apply_auth(self.agent.get(&url)).call())
                .map_err(|e| Self::map_err(prefix, e))?;
            let page: ListResponse = response
                .into_json()
                .map_err(|e| BkError::IoFatal(format!("object store list decode: {e}")))?;
            for item in page.items {
                let size = item.size.parse::<u64>().map_err(|_| {
                    BkError::Integrity(format!("non-numeric size for object '{}'", item.name))
                })?;
                out.push((item.name, size));
            }
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(out)
    }
}

impl Backend for ObjectStoreBackend {
    fn write_blob(&self, name: &str, data: &[u8]) -> Result<()> {
        validate_name(name)?;
        self.put_object(&format!("blobs/{name}"), data)
    }

    fn read_blob(&self, name: &str) -> Result<Vec<u8>> {
        validate_name(name)?;
        self.get_object(&format!("blobs/{name}"), None)
            .map_err(|e| match e {
                BkError::NotFound(_) => BkError::NotFound(name.to_string()),
                other => other,
            })
    }

    fn read_blob_range(&self, name: &str, offset: u64, len: u64) -> Result<Vec<u8>> {
        validate_name(name)?;
        self.get_object(&format!("blobs/{name}"), Some((offset, len)))
    }

    fn blob_exists(&self, name: &str) -> Result<bool> {
        validate_name(name)?;
        self.object_exists(&format!("blobs/{name}"))
    }

    fn list_blobs(&self, prefix: &str) -> Result<Vec<(String, u64)>> {
        let full_prefix = format!("blobs/{prefix}");
        let mut out = Vec::new();
        for (name, size) in self.list_objects(&full_prefix)? {
            if let Some(stripped) = name.strip_prefix("blobs/") {
                out.push((stripped.to_string(), size));
            }
        }
        out.sort();
        Ok(out)
    }

    fn write_metadata(&self, key: &str, data: &[u8]) -> Result<()> {
        validate_name(key)?;
        self.put_object(&format!("meta/{key}"), data)
    }

    fn read_metadata(&self, key: &str) -> Result<Vec<u8>> {
        validate_name(key)?;
        self.get_object(&format!("meta/{key}"), None)
            .map_err(|e| match e {
                BkError::NotFound(_) => BkError::NotFound(key.to_string()),
                other => other,
            })
    }

    fn metadata_exists(&self, key: &str) -> Result<bool> {
        validate_name(key)?;
        self.object_exists(&format!("meta/{key}"))
    }

    fn list_metadata(&self) -> Result<BTreeMap<String, u64>> {
        let mut out = BTreeMap::new();
        for (name, size) in self.list_objects("meta/")? {
            if let Some(stripped) = name.strip_prefix("meta/") {
                out.insert(stripped.to_string(), size);
            }
        }
        Ok(out)
    }

    fn sync(&self) -> Result<()> {
        // Object writes are durable once acknowledged.
        Ok(())
    }

    fn stats(&self) -> TransferStats {
        TransferStats {
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
            write_ops: self.write_ops.load(Ordering::Relaxed),
            read_ops: self.read_ops.load(Ordering::Relaxed),
        }
    }

    fn describe(&self) -> String {
        format!("gs://{}", self.bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_names_are_percent_encoded() {
        assert_eq!(
            ObjectStoreBackend::encode_object("meta/backup-x-20260101-000000"),
            "meta%2Fbackup-x-20260101-000000"
        );
        assert_eq!(ObjectStoreBackend::encode_object("plain-name"), "plain-name");
    }

    #[test]
    fn error_mapping_distinguishes_not_found_and_auth() {
        let missing = ObjectStoreBackend::map_err(
            "meta/x",
            ureq::Error::Status(404, ureq::Response::new(404, "nope", "").unwrap()),
        );
        assert!(matches!(missing, BkError::NotFound(_)));

        let denied = ObjectStoreBackend::map_err(
            "meta/x",
            ureq::Error::Status(403, ureq::Response::new(403, "denied", "").unwrap()),
        );
        assert!(matches!(denied, BkError::IoFatal(_)));
    }
}
