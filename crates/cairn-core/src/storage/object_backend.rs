use std::io::Read;
use std::time::Duration;

use rusty_s3::actions::{ListObjectsV2, S3Action};
use rusty_s3::{Bucket, Credentials, UrlStyle};

use crate::error::{CairnError, Result};
use crate::storage::StorageBackend;

/// Duration for presigned URL validity.
const PRESIGN_DURATION: Duration = Duration::from_secs(3600);

/// S3-compatible object-store backend: one object per blob in a flat
/// keyspace. The two-byte shard prefix is kept inside the key, so the
/// on-store layout matches the filesystem backend's.
pub struct ObjectBackend {
    bucket: Bucket,
    credentials: Credentials,
    agent: ureq::Agent,
    /// Prefix (root path) prepended to all keys.
    root: String,
}

impl ObjectBackend {
    pub fn new(
        bucket_name: &str,
        root: &str,
        endpoint: &str,
        access_key_id: &str,
        secret_access_key: &str,
    ) -> Result<Self> {
        let base_url = endpoint
            .parse()
            .map_err(|e| CairnError::Config(format!("invalid endpoint URL '{endpoint}': {e}")))?;

        // Endpoint is always explicit in the location; use path-style addressing.
        let bucket = Bucket::new(
            base_url,
            UrlStyle::Path,
            bucket_name.to_string(),
            "us-east-1".to_string(),
        )
        .map_err(|e| CairnError::Config(format!("failed to create bucket handle: {e}")))?;

        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(300))
            .timeout_write(Duration::from_secs(300))
            .build();

        Ok(Self {
            bucket,
            credentials: Credentials::new(access_key_id, secret_access_key),
            agent,
            root: root.trim_matches('/').to_string(),
        })
    }

    fn full_key(&self, key: &str) -> String {
        if self.root.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.root, key)
        }
    }

    fn is_retryable(err: &ureq::Error) -> bool {
        match err {
            ureq::Error::Transport(_) => true,
            ureq::Error::Status(code, _) => *code == 429 || *code >= 500,
        }
    }

    /// One retry on transient errors, per the backend I/O recovery policy.
    #[allow(clippy::result_large_err)]
    fn retry_once<T>(
        &self,
        op_name: &str,
        f: impl Fn() -> std::result::Result<T, ureq::Error>,
    ) -> std::result::Result<T, ureq::Error> {
        match f() {
            Ok(val) => Ok(val),
            Err(e) if Self::is_retryable(&e) => {
                tracing::warn!("object store {op_name}: transient error, retrying once: {e}");
                f()
            }
            Err(e) => Err(e),
        }
    }
}

impl StorageBackend for ObjectBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let full_key = self.full_key(key);
        let url = self
            .bucket
            .get_object(Some(&self.credentials), &full_key)
            .sign(PRESIGN_DURATION);

        match self.retry_once(&format!("GET {key}"), || {
            self.agent.get(url.as_str()).call()
        }) {
            Ok(resp) => {
                let mut buf = Vec::new();
                resp.into_reader()
                    .read_to_end(&mut buf)
                    .map_err(CairnError::Io)?;
                Ok(Some(buf))
            }
            Err(ureq::Error::Status(404, _)) => Ok(None),
            Err(e) => Err(CairnError::Other(format!("object GET {key}: {e}"))),
        }
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let full_key = self.full_key(key);
        let url = self
            .bucket
            .put_object(Some(&self.credentials), &full_key)
            .sign(PRESIGN_DURATION);

        self.retry_once(&format!("PUT {key}"), || {
            self.agent.put(url.as_str()).send_bytes(data)
        })
        .map_err(|e| CairnError::Other(format!("object PUT {key}: {e}")))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let full_key = self.full_key(key);
        let url = self
            .bucket
            .delete_object(Some(&self.credentials), &full_key)
            .sign(PRESIGN_DURATION);

        self.retry_once(&format!("DELETE {key}"), || {
            self.agent.delete(url.as_str()).call()
        })
        .map_err(|e| CairnError::Other(format!("object DELETE {key}: {e}")))?;
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let full_key = self.full_key(key);
        let url = self
            .bucket
            .head_object(Some(&self.credentials), &full_key)
            .sign(PRESIGN_DURATION);

        match self.retry_once(&format!("HEAD {key}"), || {
            self.agent.head(url.as_str()).call()
        }) {
            Ok(_) => Ok(true),
            Err(ureq::Error::Status(404, _)) => Ok(false),
            Err(e) => Err(CairnError::Other(format!("object HEAD {key}: {e}"))),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let full_prefix = self.full_key(prefix);
        let root_prefix_len = if self.root.is_empty() {
            0
        } else {
            self.root.len() + 1 // the '/'
        };

        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut action = self.bucket.list_objects_v2(Some(&self.credentials));
            action.query_mut().insert("prefix", &full_prefix);
            if let Some(ref token) = continuation_token {
                action.query_mut().insert("continuation-token", token);
            }
            let url = action.sign(PRESIGN_DURATION);

            let resp = self
                .retry_once(&format!("LIST {prefix}"), || {
                    self.agent.get(url.as_str()).call()
                })
                .map_err(|e| CairnError::Other(format!("object LIST {prefix}: {e}")))?;

            let mut body = Vec::new();
            resp.into_reader()
                .read_to_end(&mut body)
                .map_err(CairnError::Io)?;

            let body_str = std::str::from_utf8(&body).map_err(|e| {
                CairnError::Other(format!("object LIST {prefix}: response not utf8: {e}"))
            })?;
            let parsed = ListObjectsV2::parse_response(body_str).map_err(|e| {
                CairnError::Other(format!("object LIST {prefix}: failed to parse response: {e}"))
            })?;

            for obj in &parsed.contents {
                let key = &obj.key;
                if key.ends_with('/') {
                    continue;
                }
                if root_prefix_len > 0 && key.len() > root_prefix_len {
                    keys.push(key[root_prefix_len..].to_string());
                } else {
                    keys.push(key.clone());
                }
            }

            match parsed.next_continuation_token {
                Some(token) => continuation_token = Some(token),
                None => break,
            }
        }

        Ok(keys)
    }

    fn get_range(&self, key: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        if length == 0 {
            return Err(CairnError::Other(format!(
                "object GET_RANGE {key}: zero-length read requested"
            )));
        }
        let full_key = self.full_key(key);
        let end = offset
            .checked_add(length)
            .and_then(|n| n.checked_sub(1))
            .ok_or_else(|| {
                CairnError::Other(format!(
                    "object GET_RANGE {key}: offset {offset} + length {length} overflows u64"
                ))
            })?;
        let range_header = format!("bytes={offset}-{end}");

        let mut action = self.bucket.get_object(Some(&self.credentials), &full_key);
        action.headers_mut().insert("Range", &range_header);
        let url = action.sign(PRESIGN_DURATION);

        match self.retry_once(&format!("GET_RANGE {key}"), || {
            self.agent
                .get(url.as_str())
                .set("Range", &range_header)
                .call()
        }) {
            Ok(resp) => {
                if resp.status() != 206 {
                    return Err(CairnError::Other(format!(
                        "object GET_RANGE {key}: unexpected status {} (Range header ignored?)",
                        resp.status()
                    )));
                }
                let mut buf = Vec::with_capacity(length as usize);
                resp.into_reader()
                    .take(length)
                    .read_to_end(&mut buf)
                    .map_err(CairnError::Io)?;
                if buf.len() as u64 != length {
                    return Err(CairnError::corruption(
                        key,
                        format!(
                            "short range read at offset {offset}: expected {length} bytes, got {}",
                            buf.len()
                        ),
                    ));
                }
                Ok(Some(buf))
            }
            Err(ureq::Error::Status(404, _)) => Ok(None),
            Err(e) => Err(CairnError::Other(format!("object GET_RANGE {key}: {e}"))),
        }
    }
}
